//! Ordered textual substitution of rules against a code blob.
//!
//! Substitution is purely textual: no parsing, no semantic understanding.
//! Callers select the candidate rules (typically via
//! [`RuleStore::filter_by_tags`](crate::RuleStore::filter_by_tags)) and pass
//! the snapshot here; the applier never touches the store.

use crate::RuleRecord;

/// Result of applying rules to a code blob: the rewritten code and the names
/// of the rules that fired, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub code: String,
    pub applied: Vec<String>,
}

/// Apply `rules` to `code` in order.
///
/// A rule fires when its `original_code` is a non-empty literal substring of
/// the current result; every occurrence is replaced with `modified_code`.
/// Each rule operates on the cumulative output of the rules before it, so
/// substitutions compose sequentially and a later rule can match text
/// introduced by an earlier replacement. No conflict detection or rollback.
pub fn apply_rules(code: &str, rules: &[RuleRecord]) -> ApplyOutcome {
    let mut result = code.to_string();
    let mut applied = Vec::new();
    for rule in rules {
        if !rule.original_code.is_empty() && result.contains(&rule.original_code) {
            result = result.replace(&rule.original_code, &rule.modified_code);
            applied.push(rule.name.clone());
        }
    }
    ApplyOutcome {
        code: result,
        applied,
    }
}
