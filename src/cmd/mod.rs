//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `review` | `Review`         |
//! | `check`  | `Check`          |
//! | `config` | `Config`         |

pub mod check;
pub mod config;
pub mod review;

pub use check::cmd_check;
pub use config::cmd_config;
pub use review::cmd_review;
