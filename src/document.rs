//! Markdown documents with an optional YAML header.
//!
//! A document is split into three logical parts that the rest of the crate
//! reasons about independently:
//!
//! - the **header**: a `---` delimited YAML block at the very top
//! - the **body**: everything after the header
//! - the **structure**: the ordered list of headings in the body
//!
//! Parsing is lossless: [`ParsedDocument`] only stores byte offsets into the
//! original text, so sections can be spliced back verbatim.
//!
//! ```
//! use mender::document::ParsedDocument;
//!
//! let text = "---\ntitle: Example\n---\n# Question\nWhy?\n## Answer\nBecause.\n";
//! let doc = ParsedDocument::parse(text);
//! assert!(doc.header().is_parsed());
//! assert_eq!(doc.header_str("title").as_deref(), Some("Example"));
//! assert_eq!(doc.sections().len(), 2);
//! ```

use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Field name to value view of a document header.
pub type HeaderSnapshot = BTreeMap<String, Value>;

/// Parse state of the YAML header.
#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    Absent,
    Parsed(Mapping),
    Invalid(String),
}

impl Header {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

/// A markdown heading and the byte range of the section it opens.
///
/// `end` is the start of the next heading of the same or a higher level, or
/// the end of the text, so a section includes its subsections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub level: usize,
    pub title: String,
    pub line: usize,
    pub start: usize,
    pub end: usize,
}

impl Section {
    /// Match against a configured section name such as `"## Answer"` or `"Answer"`.
    pub fn matches(&self, name: &str) -> bool {
        self.title == normalize_section_name(name)
    }
}

/// Strip leading `#` markers and whitespace from a configured section name.
pub fn normalize_section_name(name: &str) -> &str {
    name.trim().trim_start_matches('#').trim()
}

#[derive(Debug, Clone, Copy)]
struct HeaderBlock {
    start: usize,
    end: usize,
    body_start: usize,
}

/// Borrowed, parsed view of a document.
#[derive(Debug, Clone)]
pub struct ParsedDocument<'a> {
    text: &'a str,
    block: Option<HeaderBlock>,
    body_start: usize,
    header: Header,
    sections: Vec<Section>,
}

impl<'a> ParsedDocument<'a> {
    pub fn parse(text: &'a str) -> Self {
        let (block, body_start, header) = match locate_header(text) {
            HeaderLocation::Absent => (None, 0, Header::Absent),
            HeaderLocation::Unterminated => (
                None,
                0,
                Header::Invalid("header opened with '---' but never closed".to_string()),
            ),
            HeaderLocation::Block(block) => {
                let raw = &text[block.start..block.end];
                let header = if raw.trim().is_empty() {
                    Header::Parsed(Mapping::new())
                } else {
                    match serde_yaml::from_str::<Value>(raw) {
                        Ok(Value::Mapping(map)) => Header::Parsed(map),
                        Ok(Value::Null) => Header::Parsed(Mapping::new()),
                        Ok(_) => Header::Invalid("header is not a key/value mapping".to_string()),
                        Err(e) => Header::Invalid(e.to_string()),
                    }
                };
                (Some(block), block.body_start, header)
            }
        };
        let sections = scan_sections(text, body_start);
        Self {
            text,
            block,
            body_start,
            header,
            sections,
        }
    }

    pub fn text(&self) -> &'a str {
        self.text
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Raw header text between the delimiters, if a closed header exists.
    pub fn header_raw(&self) -> Option<&'a str> {
        self.block.map(|b| &self.text[b.start..b.end])
    }

    pub fn body(&self) -> &'a str {
        &self.text[self.body_start..]
    }

    pub fn body_start(&self) -> usize {
        self.body_start
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.matches(name))
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.find_section(name).is_some()
    }

    /// Text of a section including its heading line.
    pub fn section_text(&self, section: &Section) -> &'a str {
        &self.text[section.start..section.end]
    }

    /// Heading outline as `(level, title)` pairs.
    pub fn outline(&self) -> Vec<(usize, &str)> {
        self.sections
            .iter()
            .map(|s| (s.level, s.title.as_str()))
            .collect()
    }

    /// All header fields; empty when the header is absent or invalid.
    pub fn snapshot(&self) -> HeaderSnapshot {
        match &self.header {
            Header::Parsed(map) => map
                .iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                .collect(),
            _ => HeaderSnapshot::new(),
        }
    }

    pub fn header_value(&self, key: &str) -> Option<&Value> {
        match &self.header {
            Header::Parsed(map) => map.get(key),
            _ => None,
        }
    }

    /// A scalar header field rendered as a string.
    pub fn header_str(&self, key: &str) -> Option<String> {
        self.header_value(key).and_then(scalar_to_string)
    }
}

/// Render a scalar YAML value; `None` for null, sequences and mappings.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Compact single-line rendering of any YAML value, for messages.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Sequence(items) => {
            let parts: Vec<String> = items.iter().map(display_value).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Mapping(_) | Value::Tagged(_) => serde_yaml::to_string(value)
            .map(|s| s.trim().replace('\n', "; "))
            .unwrap_or_else(|_| "<unrenderable>".to_string()),
        other => scalar_to_string(other).unwrap_or_default(),
    }
}

enum HeaderLocation {
    Absent,
    Unterminated,
    Block(HeaderBlock),
}

fn locate_header(text: &str) -> HeaderLocation {
    let mut lines = text.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return HeaderLocation::Absent;
    };
    if first.trim_end() != "---" {
        return HeaderLocation::Absent;
    }
    let start = first.len();
    let mut offset = start;
    for line in lines {
        if line.trim_end() == "---" {
            return HeaderLocation::Block(HeaderBlock {
                start,
                end: offset,
                body_start: offset + line.len(),
            });
        }
        offset += line.len();
    }
    HeaderLocation::Unterminated
}

/// True when the line opens or closes a fenced code block.
pub fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

/// Heading level and title of an ATX heading line.
pub fn heading_of(line: &str) -> Option<(usize, &str)> {
    let line = line.trim_end_matches(['\n', '\r']);
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    Some((hashes, rest.trim()))
}

fn scan_sections(text: &str, body_start: usize) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut in_fence = false;
    let mut offset = body_start;
    let line_base = text[..body_start].matches('\n').count();

    for (idx, line) in text[body_start..].split_inclusive('\n').enumerate() {
        if is_fence(line) {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some((level, title)) = heading_of(line) {
                sections.push(Section {
                    level,
                    title: title.to_string(),
                    line: line_base + idx + 1,
                    start: offset,
                    end: text.len(),
                });
            }
        }
        offset += line.len();
    }

    for i in 0..sections.len() {
        let level = sections[i].level;
        if let Some(next) = sections[i + 1..].iter().find(|s| s.level <= level) {
            sections[i].end = next.start;
        }
    }
    sections
}

fn is_key_line(line: &str, key: &str) -> bool {
    line.strip_prefix(key)
        .is_some_and(|rest| rest.starts_with(':'))
}

/// Set a top-level header field to a literal YAML value, creating the header
/// if there is none. Other header lines are preserved as written.
pub fn set_header_field(text: &str, key: &str, value: &str) -> String {
    let new_line = format!("{key}: {value}");
    let HeaderLocation::Block(block) = locate_header(text) else {
        return format!("---\n{new_line}\n---\n{text}");
    };

    let mut lines: Vec<&str> = Vec::new();
    let mut replaced = false;
    let mut skipping_value = false;
    for line in text[block.start..block.end].lines() {
        if skipping_value {
            if line.starts_with(' ') || line.starts_with('\t') || line.starts_with("- ") {
                continue;
            }
            skipping_value = false;
        }
        if !replaced && is_key_line(line, key) {
            lines.push(&new_line);
            replaced = true;
            skipping_value = true;
            continue;
        }
        lines.push(line);
    }
    if !replaced {
        lines.push(&new_line);
    }

    let mut out = String::with_capacity(text.len() + new_line.len() + 8);
    out.push_str("---\n");
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("---\n");
    out.push_str(&text[block.body_start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTE: &str = "---\ntitle: Binary search\ncreated: 2024-01-10\ntags:\n- algorithms\n- search\n---\n# Question\nHow?\n\n## Answer\nHalve it.\n\n### Complexity\nO(log n)\n\n## References\n- book\n";

    #[test]
    fn test_parse_header_and_sections() {
        let doc = ParsedDocument::parse(NOTE);
        assert!(doc.header().is_parsed());
        assert_eq!(doc.header_str("created").as_deref(), Some("2024-01-10"));
        let outline = doc.outline();
        assert_eq!(
            outline,
            vec![
                (1, "Question"),
                (2, "Answer"),
                (3, "Complexity"),
                (2, "References")
            ]
        );
        assert!(doc.body().starts_with("# Question"));
    }

    #[test]
    fn test_section_includes_subsections() {
        let doc = ParsedDocument::parse(NOTE);
        let answer = doc.find_section("## Answer").expect("answer section");
        let text = doc.section_text(answer);
        assert!(text.contains("### Complexity"));
        assert!(!text.contains("## References"));
        assert_eq!(answer.line, 11);
    }

    #[test]
    fn test_headings_inside_code_fences_are_ignored() {
        let text = "# Title\n```\n# not a heading\n```\n## Real\n";
        let doc = ParsedDocument::parse(text);
        assert_eq!(doc.outline(), vec![(1, "Title"), (2, "Real")]);
    }

    #[test]
    fn test_missing_and_invalid_headers() {
        assert_eq!(*ParsedDocument::parse("# Just body\n").header(), Header::Absent);
        assert!(ParsedDocument::parse("---\ntitle: x\n# never closed\n")
            .header()
            .is_invalid());
        assert!(ParsedDocument::parse("---\ntitle: [unclosed\n---\nbody\n")
            .header()
            .is_invalid());
        assert!(ParsedDocument::parse("---\n---\nbody\n").header().is_parsed());
    }

    #[test]
    fn test_hash_without_space_is_not_a_heading() {
        assert_eq!(heading_of("#hashtag"), None);
        assert_eq!(heading_of("## Answer\n"), Some((2, "Answer")));
        assert_eq!(heading_of("####### too deep"), None);
    }

    #[test]
    fn test_set_header_field_replaces_existing_line() {
        let out = set_header_field(NOTE, "created", "2024-02-01");
        let doc = ParsedDocument::parse(&out);
        assert_eq!(doc.header_str("created").as_deref(), Some("2024-02-01"));
        assert_eq!(doc.header_str("title").as_deref(), Some("Binary search"));
        assert!(out.ends_with("- book\n"));
    }

    #[test]
    fn test_set_header_field_replaces_list_value() {
        let out = set_header_field(NOTE, "tags", "[algorithms]");
        let doc = ParsedDocument::parse(&out);
        let tags = doc.header_value("tags").expect("tags present");
        assert_eq!(display_value(tags), "[algorithms]");
        assert!(!out.contains("- search"));
    }

    #[test]
    fn test_set_header_field_appends_and_creates() {
        let out = set_header_field(NOTE, "updated", "2024-03-01");
        assert_eq!(
            ParsedDocument::parse(&out).header_str("updated").as_deref(),
            Some("2024-03-01")
        );

        let created = set_header_field("# Body\n", "created", "2024-01-01");
        assert_eq!(created, "---\ncreated: 2024-01-01\n---\n# Body\n");
    }

    #[test]
    fn test_set_header_field_is_stable() {
        let once = set_header_field(NOTE, "created", "2024-01-10");
        let twice = set_header_field(&once, "created", "2024-01-10");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_section_name() {
        assert_eq!(normalize_section_name("## Answer "), "Answer");
        assert_eq!(normalize_section_name("References"), "References");
    }
}
