//! Rule-based fixes applied before any external fixer is called.
//!
//! Each rule pairs an issue-message pattern with a pure fix function. Rules
//! run in priority order over the accumulated text; an issue claimed by a
//! rule is reported as resolved and everything else is forwarded.
//!
//! Every rule is idempotent: running the fixer again on its own output with
//! the same issues changes nothing.
//!
//! | rule                 | matches                                   |
//! |----------------------|-------------------------------------------|
//! | `missing_timestamp`  | `Missing ... created/updated`             |
//! | `timestamp_order`    | `'created' ... after ... 'updated'`       |
//! | `future_timestamp`   | `... in the future`                       |
//! | `type_name_backticks`| `Type name 'X' found without backticks`   |
//! | `trailing_whitespace`| `Trailing whitespace ...`                 |
//! | `final_newline`      | `Missing final newline`                   |
//! | `unquoted_url`       | `Unquoted URL ...`                        |

use chrono::{Local, NaiveDate};
use regex::{Captures, Regex};
use serde::Serialize;
use std::sync::LazyLock;

use crate::document::{ParsedDocument, heading_of, is_fence, set_header_field};
use crate::review::issue::Issue;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

static MISSING_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)missing.*\b(created|updated)\b").expect("static regex is valid")
});
static TIMESTAMP_ORDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)'created'.*after.*'updated'|temporal logic").expect("static regex is valid")
});
static FUTURE_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)in the future").expect("static regex is valid"));
static TYPE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)type name '([^']+)' found without backticks").expect("static regex is valid")
});
static TRAILING_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)trailing whitespace").expect("static regex is valid"));
static FINAL_NEWLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)missing final newline|must end with a newline").expect("static regex is valid")
});
static UNQUOTED_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)unquoted url").expect("static regex is valid"));
static SOURCE_URL_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\s*-\s+)(https?://[^\s"'\\]+)\s*$"#).expect("static regex is valid")
});

enum RuleOutcome {
    /// The rule owns this issue; `note` is set when the text changed.
    Handled { text: String, note: Option<String> },
    NotApplicable,
}

type FixFn = fn(NaiveDate, &str, &Captures<'_>) -> RuleOutcome;

struct Rule {
    name: &'static str,
    pattern: &'static Regex,
    apply: FixFn,
}

fn rules() -> [Rule; 7] {
    [
        Rule {
            name: "missing_timestamp",
            pattern: &MISSING_TIMESTAMP,
            apply: fix_missing_timestamp,
        },
        Rule {
            name: "timestamp_order",
            pattern: &TIMESTAMP_ORDER,
            apply: fix_timestamp_order,
        },
        Rule {
            name: "future_timestamp",
            pattern: &FUTURE_TIMESTAMP,
            apply: fix_future_timestamp,
        },
        Rule {
            name: "type_name_backticks",
            pattern: &TYPE_NAME,
            apply: fix_type_name,
        },
        Rule {
            name: "trailing_whitespace",
            pattern: &TRAILING_WHITESPACE,
            apply: fix_trailing_whitespace,
        },
        Rule {
            name: "final_newline",
            pattern: &FINAL_NEWLINE,
            apply: fix_final_newline,
        },
        Rule {
            name: "unquoted_url",
            pattern: &UNQUOTED_URL,
            apply: fix_unquoted_urls,
        },
    ]
}

/// Issues one rule resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResolution {
    pub rule: &'static str,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeterministicFix {
    pub text: String,
    pub changed: bool,
    pub fixes_applied: Vec<String>,
    pub resolved: Vec<RuleResolution>,
    pub remaining: Vec<Issue>,
}

impl DeterministicFix {
    pub fn resolved_count(&self) -> usize {
        self.resolved.iter().map(|r| r.issues.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeterministicFixer {
    today: Option<NaiveDate>,
}

impl DeterministicFixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the date used for timestamp fixes.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn can_fix(&self, issues: &[Issue]) -> bool {
        let rules = rules();
        issues
            .iter()
            .any(|issue| rules.iter().any(|r| r.pattern.is_match(&issue.message)))
    }

    pub fn fix(&self, text: &str, issues: &[Issue]) -> DeterministicFix {
        let today = self.today();
        let mut current = text.to_string();
        let mut claimed = vec![false; issues.len()];
        let mut fixes_applied = Vec::new();
        let mut resolved = Vec::new();

        for rule in rules() {
            let mut handled = Vec::new();
            for (idx, issue) in issues.iter().enumerate() {
                if claimed[idx] {
                    continue;
                }
                let Some(caps) = rule.pattern.captures(&issue.message) else {
                    continue;
                };
                match (rule.apply)(today, &current, &caps) {
                    RuleOutcome::Handled { text, note } => {
                        claimed[idx] = true;
                        handled.push(issue.clone());
                        if let Some(note) = note {
                            fixes_applied.push(note);
                        }
                        current = text;
                    }
                    RuleOutcome::NotApplicable => {}
                }
            }
            if !handled.is_empty() {
                tracing::debug!(rule = rule.name, resolved = handled.len(), "deterministic rule applied");
                resolved.push(RuleResolution {
                    rule: rule.name,
                    issues: handled,
                });
            }
        }

        let remaining = issues
            .iter()
            .zip(&claimed)
            .filter(|(_, claimed)| !**claimed)
            .map(|(issue, _)| issue.clone())
            .collect();

        DeterministicFix {
            changed: current != text,
            text: current,
            fixes_applied,
            resolved,
            remaining,
        }
    }
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Read `created` and `updated`; `None` when the header cannot be edited.
fn read_dates(text: &str) -> Option<(Option<NaiveDate>, Option<NaiveDate>)> {
    let doc = ParsedDocument::parse(text);
    if doc.header().is_invalid() {
        return None;
    }
    let created = doc.header_str("created").as_deref().and_then(parse_date);
    let updated = doc.header_str("updated").as_deref().and_then(parse_date);
    Some((created, updated))
}

fn handled(before: &str, after: String, note: String) -> RuleOutcome {
    let note = (after != before).then_some(note);
    RuleOutcome::Handled { text: after, note }
}

fn fix_missing_timestamp(today: NaiveDate, text: &str, caps: &Captures<'_>) -> RuleOutcome {
    let Some(field) = caps.get(1).map(|m| m.as_str().to_lowercase()) else {
        return RuleOutcome::NotApplicable;
    };
    let Some((created, updated)) = read_dates(text) else {
        return RuleOutcome::NotApplicable;
    };
    let (existing, value) = if field == "created" {
        (created, updated.map_or(today, |u| u.min(today)))
    } else {
        (updated, today)
    };
    if existing.is_some() {
        return RuleOutcome::Handled {
            text: text.to_string(),
            note: None,
        };
    }
    let fixed = set_header_field(text, &field, &format_date(value));
    handled(
        text,
        fixed,
        format!("Added missing '{}' timestamp ({})", field, format_date(value)),
    )
}

fn fix_timestamp_order(today: NaiveDate, text: &str, _caps: &Captures<'_>) -> RuleOutcome {
    let Some((Some(created), Some(updated))) = read_dates(text) else {
        return RuleOutcome::NotApplicable;
    };
    if created <= updated {
        return RuleOutcome::Handled {
            text: text.to_string(),
            note: None,
        };
    }
    let mut fixed = text.to_string();
    let created = if created > today {
        fixed = set_header_field(&fixed, "created", &format_date(today));
        today
    } else {
        created
    };
    let new_updated = today.max(created);
    fixed = set_header_field(&fixed, "updated", &format_date(new_updated));
    handled(
        text,
        fixed,
        format!(
            "Moved 'updated' to {} so it is not before 'created'",
            format_date(new_updated)
        ),
    )
}

fn fix_future_timestamp(today: NaiveDate, text: &str, _caps: &Captures<'_>) -> RuleOutcome {
    let Some((created, updated)) = read_dates(text) else {
        return RuleOutcome::NotApplicable;
    };
    let mut fixed = text.to_string();
    let mut clamped = Vec::new();
    let created = created.map(|d| {
        if d > today {
            fixed = set_header_field(&fixed, "created", &format_date(today));
            clamped.push("created");
            today
        } else {
            d
        }
    });
    let updated = updated.map(|d| {
        if d > today {
            fixed = set_header_field(&fixed, "updated", &format_date(today));
            clamped.push("updated");
            today
        } else {
            d
        }
    });
    if let (Some(c), Some(u)) = (created, updated) {
        if c > u {
            fixed = set_header_field(&fixed, "updated", &format_date(c));
        }
    }
    handled(
        text,
        fixed,
        format!("Clamped future {} to {}", clamped.join(" and "), format_date(today)),
    )
}

fn fix_type_name(_today: NaiveDate, text: &str, caps: &Captures<'_>) -> RuleOutcome {
    let Some(name) = caps.get(1).map(|m| m.as_str()) else {
        return RuleOutcome::NotApplicable;
    };
    if name.trim().is_empty() {
        return RuleOutcome::NotApplicable;
    }
    let fixed = wrap_type_name(text, name);
    handled(text, fixed, format!("Wrapped type name '{}' in backticks", name))
}

fn fix_trailing_whitespace(_today: NaiveDate, text: &str, _caps: &Captures<'_>) -> RuleOutcome {
    let mut fixed = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (content, ending) = split_line_ending(line);
        fixed.push_str(content.trim_end_matches([' ', '\t']));
        fixed.push_str(ending);
    }
    handled(text, fixed, "Removed trailing whitespace".to_string())
}

fn fix_final_newline(_today: NaiveDate, text: &str, _caps: &Captures<'_>) -> RuleOutcome {
    if text.is_empty() {
        return RuleOutcome::NotApplicable;
    }
    let fixed = format!("{}\n", text.trim_end_matches(['\n', '\r']));
    handled(text, fixed, "Normalized final newline".to_string())
}

fn fix_unquoted_urls(_today: NaiveDate, text: &str, _caps: &Captures<'_>) -> RuleOutcome {
    if ParsedDocument::parse(text).header().is_invalid() {
        return RuleOutcome::NotApplicable;
    }
    let (fixed, quoted) = quote_source_urls(text);
    handled(
        text,
        fixed,
        format!("Quoted {} URL(s) in 'sources'", quoted.len()),
    )
}

/// Quote every bare `http(s)://` item of the block list under the header's
/// `sources:` key. Returns the new text and the URLs that were quoted.
fn quote_source_urls(text: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(text.len() + 16);
    let mut quoted = Vec::new();
    let mut lines = text.split_inclusive('\n');
    match lines.next() {
        Some(first) if split_line_ending(first).0 == "---" => out.push_str(first),
        _ => return (text.to_string(), quoted),
    }

    let mut in_header = true;
    let mut in_sources = false;
    for line in lines {
        if in_header {
            let (content, ending) = split_line_ending(line);
            if content.trim_end() == "---" {
                in_header = false;
                in_sources = false;
            } else if let Some(rest) = content.strip_prefix("sources:") {
                in_sources = rest.trim().is_empty();
            } else if in_sources {
                if let Some(caps) = SOURCE_URL_ITEM.captures(content) {
                    out.push_str(&caps[1]);
                    out.push('"');
                    out.push_str(&caps[2]);
                    out.push('"');
                    out.push_str(ending);
                    quoted.push(caps[2].to_string());
                    continue;
                }
                if !content.starts_with([' ', '\t', '-']) {
                    in_sources = false;
                }
            }
        }
        out.push_str(line);
    }
    (out, quoted)
}

/// Unquoted URLs in the header's `sources` list.
pub fn find_unquoted_source_urls(text: &str) -> Vec<String> {
    quote_source_urls(text).1
}

pub(crate) fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(content) = line.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = line.strip_suffix('\n') {
        (content, "\n")
    } else {
        (line, "")
    }
}

/// True when the line (without its line ending) ends in spaces or tabs.
pub fn has_trailing_whitespace(line: &str) -> bool {
    let (content, _) = split_line_ending(line);
    content.ends_with(' ') || content.ends_with('\t')
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn in_url(line: &str, pos: usize) -> bool {
    let start = line[..pos]
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let end = line[pos..]
        .find(char::is_whitespace)
        .map(|i| pos + i)
        .unwrap_or(line.len());
    let token = &line[start..end];
    token.contains("://") || token.contains("](")
}

/// Byte ranges of bare occurrences of `name` (or its plural) in one line.
///
/// Occurrences touching word characters or backticks, inside inline code or
/// inside URLs are skipped.
pub fn bare_occurrences(line: &str, name: &str) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut last_end = 0;
    for (pos, _) in line.match_indices(name) {
        if pos < last_end {
            continue;
        }
        let after = pos + name.len();
        let rest = &line[after..];
        let end = if rest.starts_with('s') && !rest[1..].chars().next().is_some_and(is_word) {
            after + 1
        } else {
            after
        };
        let prev = line[..pos].chars().next_back();
        let next = line[end..].chars().next();
        if prev.is_some_and(|c| is_word(c) || c == '`')
            || next.is_some_and(|c| is_word(c) || c == '`')
        {
            continue;
        }
        if line[..pos].matches('`').count() % 2 == 1 || in_url(line, pos) {
            continue;
        }
        found.push((pos, end));
        last_end = end;
    }
    found
}

/// Line numbers (1-based) with bare occurrences of `name` in prose.
pub fn find_bare_type_name(text: &str, name: &str) -> Vec<u32> {
    let doc = ParsedDocument::parse(text);
    let base = text[..doc.body_start()].matches('\n').count();
    let mut lines = Vec::new();
    let mut in_fence = false;
    for (idx, line) in doc.body().split_inclusive('\n').enumerate() {
        if is_fence(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || heading_of(line).is_some() {
            continue;
        }
        if !bare_occurrences(line, name).is_empty() {
            lines.push((base + idx + 1) as u32);
        }
    }
    lines
}

/// Wrap bare occurrences of `name` in backticks outside the header, code
/// blocks, headings and URLs. A plural `s` stays outside the backticks.
pub fn wrap_type_name(text: &str, name: &str) -> String {
    let body_start = ParsedDocument::parse(text).body_start();
    let mut out = String::with_capacity(text.len() + 16);
    out.push_str(&text[..body_start]);
    let mut in_fence = false;
    for line in text[body_start..].split_inclusive('\n') {
        if is_fence(line) {
            in_fence = !in_fence;
            out.push_str(line);
            continue;
        }
        if in_fence || heading_of(line).is_some() {
            out.push_str(line);
            continue;
        }
        let mut last = 0;
        for (start, end) in bare_occurrences(line, name) {
            out.push_str(&line[last..start]);
            out.push('`');
            out.push_str(name);
            out.push('`');
            out.push_str(&line[start + name.len()..end]);
            last = end;
        }
        out.push_str(&line[last..]);
    }
    out
}
