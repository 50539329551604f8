pub mod apply;
pub mod codec;
pub mod store;

pub use apply::{apply_rules, ApplyOutcome};
pub use codec::{parse_document, serialize_rules, ParsedDocument};
pub use store::{ImportReport, MarkdownBackend, RuleBackend, RuleStore, StoreError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Types ---

/// A persisted code-edit rule: an original snippet, its replacement, and the
/// metadata describing when and why to apply it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    /// Opaque unique identifier, assigned once at creation.
    pub id: String,
    /// Human-readable key, unique across the store.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub original_code: String,
    #[serde(default)]
    pub modified_code: String,
    /// Free-text annotation recording what motivated the rule.
    #[serde(default)]
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Set only when an update mutates the record; absent on first creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RuleRecord {
    /// True when the rule carries at least one code snippet. Records without
    /// any code are never persisted.
    pub fn has_code(&self) -> bool {
        !self.original_code.is_empty() || !self.modified_code.is_empty()
    }
}

/// Input for creating a rule. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, Default)]
pub struct NewRule {
    pub name: String,
    pub description: String,
    pub original_code: String,
    pub modified_code: String,
    pub feedback: String,
    pub tags: Vec<String>,
}

/// Partial update for an existing rule. Lookup is by `id` when present,
/// otherwise by `name`; fields left as `None` keep their stored values.
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub id: Option<String>,
    /// New name when it differs from the stored one; also the lookup key
    /// when no `id` is given.
    pub name: Option<String>,
    pub description: Option<String>,
    pub original_code: Option<String>,
    pub modified_code: Option<String>,
    pub feedback: Option<String>,
    pub tags: Option<Vec<String>>,
}
