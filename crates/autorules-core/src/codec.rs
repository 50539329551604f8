//! Codec between rule records and the markdown rules document.
//!
//! One document holds every rule: a title line, then a level-2 section per
//! rule with its description and two fenced code blocks. The mapping is lossy
//! on purpose — ids and timestamps are regenerated on every parse, so the
//! document is the human-editable source of truth for content fields only.

use chrono::Utc;
use uuid::Uuid;

use crate::RuleRecord;

/// Title line of the rules document.
pub const DOC_TITLE: &str = "# Auto Rules";
/// Sub-heading introducing the original snippet.
pub const ORIGINAL_HEADING: &str = "### Original Code";
/// Sub-heading introducing the replacement snippet.
pub const MODIFIED_HEADING: &str = "### Modified Code";
/// Feedback assigned to rules recovered from a document.
pub const EXTRACTED_FEEDBACK: &str = "extracted from document";

/// Result of parsing a rules document: the recovered rules plus the sections
/// that were dropped, with the reason for each.
#[derive(Debug, Default)]
pub struct ParsedDocument {
    pub rules: Vec<RuleRecord>,
    pub skipped: Vec<SkippedSection>,
}

/// A section that could not be recovered as a rule.
#[derive(Debug)]
pub struct SkippedSection {
    pub heading: String,
    pub reason: String,
}

/// Render rules to a single markdown document.
///
/// Fence delimiters inside snippets are not escaped; a snippet containing a
/// line that opens with ``` will corrupt its section on the next parse.
pub fn serialize_rules(rules: &[RuleRecord]) -> String {
    let mut doc = format!("{}\n\n", DOC_TITLE);
    for rule in rules {
        doc.push_str(&format!("## {}\n\n", rule.name));
        doc.push_str(&format!("{}\n\n", rule.description));
        doc.push_str(&format!(
            "{}\n\n```\n{}\n```\n\n",
            ORIGINAL_HEADING, rule.original_code
        ));
        doc.push_str(&format!(
            "{}\n\n```\n{}\n```\n\n",
            MODIFIED_HEADING, rule.modified_code
        ));
    }
    doc
}

/// Parse a rules document back into records.
///
/// The document is split at each `## ` header; content before the first
/// header (the title) is discarded. Within a section, everything between the
/// header and [`ORIGINAL_HEADING`] is the description — when that sub-heading
/// never appears, the description absorbs the whole section and both code
/// fields stay empty. Each code field is the text strictly between the first
/// fence pair after its sub-heading. Sections with an empty name or without
/// any code are reported in [`ParsedDocument::skipped`] instead of failing
/// the parse.
pub fn parse_document(text: &str) -> ParsedDocument {
    let mut out = ParsedDocument::default();
    if text.trim().is_empty() {
        return out;
    }

    for section in split_sections(text) {
        let lines: Vec<&str> = section.lines().collect();
        let heading = lines.first().copied().unwrap_or_default();
        let name = heading.strip_prefix("## ").unwrap_or(heading).trim();
        if name.is_empty() {
            out.skipped.push(SkippedSection {
                heading: heading.to_string(),
                reason: "empty rule name".to_string(),
            });
            continue;
        }

        let mut i = 1;
        let mut description_lines: Vec<&str> = Vec::new();
        while i < lines.len() && !lines[i].starts_with(ORIGINAL_HEADING) {
            description_lines.push(lines[i]);
            i += 1;
        }
        let description = description_lines.join("\n").trim().to_string();

        let original_code = if i < lines.len() {
            i += 1;
            extract_fenced(&lines, &mut i)
        } else {
            String::new()
        };

        while i < lines.len() && !lines[i].starts_with(MODIFIED_HEADING) {
            i += 1;
        }
        let modified_code = if i < lines.len() {
            i += 1;
            extract_fenced(&lines, &mut i)
        } else {
            String::new()
        };

        let record = RuleRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description,
            original_code,
            modified_code,
            feedback: EXTRACTED_FEEDBACK.to_string(),
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: None,
        };
        if record.has_code() {
            out.rules.push(record);
        } else {
            out.skipped.push(SkippedSection {
                heading: record.name,
                reason: "no code snippets".to_string(),
            });
        }
    }

    out
}

/// Split the document into level-2 sections, dropping the preamble.
fn split_sections(text: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        if line.starts_with("## ") {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(line.to_string());
        } else if let Some(section) = current.as_mut() {
            section.push('\n');
            section.push_str(line);
        }
    }
    if let Some(section) = current {
        sections.push(section);
    }
    sections
}

/// Collect the lines strictly between the next fence pair, advancing the
/// cursor past the closing fence. Returns empty when no fence opens before
/// the section ends.
fn extract_fenced(lines: &[&str], i: &mut usize) -> String {
    while *i < lines.len() && !lines[*i].trim_start().starts_with("```") {
        *i += 1;
    }
    if *i >= lines.len() {
        return String::new();
    }
    *i += 1;
    let start = *i;
    while *i < lines.len() && !lines[*i].trim_start().starts_with("```") {
        *i += 1;
    }
    let code = lines[start..*i].join("\n");
    if *i < lines.len() {
        *i += 1;
    }
    code
}
