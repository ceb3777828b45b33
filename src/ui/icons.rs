//! Shared UI icons.
//!
//! Each icon falls back to a plain-text marker on terminals without emoji.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Document indicators
pub static FILE: Emoji<'_, '_> = Emoji("📄 ", "");
pub static FILE_MOD: Emoji<'_, '_> = Emoji("📝 ", "~");

// Progress indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
