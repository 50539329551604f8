//! Durable CRUD over the rule set.
//!
//! Every mutation is a whole-document read-modify-write: load the full record
//! set, mutate in memory, save the full set back. An in-process mutex
//! serializes mutating calls on a store instance; writers in other processes
//! can still race (documented limitation of the single-document design).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::codec;
use crate::{NewRule, RuleRecord, RuleUpdate};

/// Errors produced by [`RuleStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a rule named '{0}' already exists")]
    DuplicateName(String),
    #[error("no rule matching '{0}'")]
    NotFound(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layout for the full record set.
///
/// Implementations load and save the whole set at once — the store never
/// persists incrementally, so a backend only has to represent "all rules"
/// somewhere durable (one shared document, one file per record, ...).
pub trait RuleBackend: Send + Sync {
    fn load(&self) -> Result<Vec<RuleRecord>, StoreError>;
    fn save(&self, rules: &[RuleRecord]) -> Result<(), StoreError>;
}

/// Single markdown document holding every rule.
pub struct MarkdownBackend {
    path: PathBuf,
}

impl MarkdownBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RuleBackend for MarkdownBackend {
    /// A missing document reads as an empty set. Malformed sections are
    /// logged and skipped; whatever parses cleanly is returned.
    fn load(&self) -> Result<Vec<RuleRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)?;
        let parsed = codec::parse_document(&text);
        for skipped in &parsed.skipped {
            tracing::warn!(
                heading = %skipped.heading,
                reason = %skipped.reason,
                path = %self.path.display(),
                "skipping malformed rule section"
            );
        }
        Ok(parsed.rules)
    }

    /// Atomic replace: write a temp file next to the document, then rename,
    /// so a concurrent reader never observes a truncated document.
    fn save(&self, rules: &[RuleRecord]) -> Result<(), StoreError> {
        let doc = codec::serialize_rules(rules);
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rules.md".to_string());
        let tmp = self.path.with_file_name(format!(".{}.tmp", file_name));
        fs::write(&tmp, doc)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Counts reported by [`RuleStore::import_document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportReport {
    pub extracted: usize,
    pub added: usize,
    pub skipped_existing: usize,
}

/// Rule persistence with name uniqueness and typed failure results.
///
/// Mutations take the write lock for their whole load-mutate-save cycle;
/// reads work on an unlocked snapshot.
pub struct RuleStore {
    backend: Box<dyn RuleBackend>,
    write_lock: Mutex<()>,
}

impl RuleStore {
    /// Open a store over the markdown document at `path`. The file does not
    /// need to exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_backend(Box::new(MarkdownBackend::new(path)))
    }

    pub fn with_backend(backend: Box<dyn RuleBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    /// All rules in document order. Missing storage reads as empty.
    pub fn load_all(&self) -> Result<Vec<RuleRecord>, StoreError> {
        self.backend.load()
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<RuleRecord>, StoreError> {
        Ok(self.load_all()?.into_iter().find(|r| r.name == name))
    }

    /// Append a new rule. Fails on an empty name, a rule with no code at
    /// all, or a name that is already taken; the stored set is unchanged on
    /// every failure path.
    pub fn add(&self, new: NewRule) -> Result<RuleRecord, StoreError> {
        if new.name.trim().is_empty() {
            return Err(StoreError::InvalidRule(
                "rule name must not be empty".to_string(),
            ));
        }
        if new.original_code.is_empty() && new.modified_code.is_empty() {
            return Err(StoreError::InvalidRule(format!(
                "rule '{}' has neither original nor modified code",
                new.name
            )));
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rules = self.backend.load()?;
        if rules.iter().any(|r| r.name == new.name) {
            return Err(StoreError::DuplicateName(new.name));
        }

        let record = RuleRecord {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            description: new.description,
            original_code: new.original_code,
            modified_code: new.modified_code,
            feedback: new.feedback,
            tags: new.tags,
            created_at: Utc::now(),
            updated_at: None,
        };
        rules.push(record.clone());
        self.backend.save(&rules)?;
        tracing::info!(name = %record.name, total = rules.len(), "added rule");
        Ok(record)
    }

    /// Merge an update into the matching rule. Lookup is by `id` when the
    /// update carries one, otherwise by `name`. `id` and `created_at` are
    /// carried over from the stored record, `updated_at` is refreshed, and a
    /// rename onto another record's name is rejected.
    pub fn update(&self, update: RuleUpdate) -> Result<RuleRecord, StoreError> {
        let key = match (&update.id, &update.name) {
            (Some(id), _) => id.clone(),
            (None, Some(name)) => name.clone(),
            (None, None) => {
                return Err(StoreError::InvalidRule(
                    "update requires a rule id or name".to_string(),
                ));
            }
        };

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rules = self.backend.load()?;
        let idx = match &update.id {
            Some(id) => rules.iter().position(|r| r.id == *id),
            None => rules.iter().position(|r| Some(&r.name) == update.name.as_ref()),
        };
        let Some(idx) = idx else {
            return Err(StoreError::NotFound(key));
        };

        if let Some(new_name) = &update.name {
            if new_name.trim().is_empty() {
                return Err(StoreError::InvalidRule(
                    "rule name must not be empty".to_string(),
                ));
            }
            if *new_name != rules[idx].name && rules.iter().any(|r| r.name == *new_name) {
                return Err(StoreError::DuplicateName(new_name.clone()));
            }
        }

        let rule = &mut rules[idx];
        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(description) = update.description {
            rule.description = description;
        }
        if let Some(original_code) = update.original_code {
            rule.original_code = original_code;
        }
        if let Some(modified_code) = update.modified_code {
            rule.modified_code = modified_code;
        }
        if let Some(feedback) = update.feedback {
            rule.feedback = feedback;
        }
        if let Some(tags) = update.tags {
            rule.tags = tags;
        }
        if !rule.has_code() {
            return Err(StoreError::InvalidRule(format!(
                "rule '{}' would be left with neither original nor modified code",
                rule.name
            )));
        }
        rule.updated_at = Some(Utc::now());

        let updated = rule.clone();
        self.backend.save(&rules)?;
        tracing::info!(name = %updated.name, "updated rule");
        Ok(updated)
    }

    /// Remove the rule with the given name. Returns the remaining rule count.
    pub fn delete(&self, name: &str) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rules = self.backend.load()?;
        let before = rules.len();
        rules.retain(|r| r.name != name);
        if rules.len() == before {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.backend.save(&rules)?;
        tracing::info!(name, remaining = rules.len(), "deleted rule");
        Ok(rules.len())
    }

    /// Rules whose tag set intersects `tags` (match-any). An empty filter
    /// returns every rule.
    pub fn filter_by_tags(&self, tags: &[String]) -> Result<Vec<RuleRecord>, StoreError> {
        let rules = self.load_all()?;
        if tags.is_empty() {
            return Ok(rules);
        }
        Ok(rules
            .into_iter()
            .filter(|r| r.tags.iter().any(|t| tags.contains(t)))
            .collect())
    }

    /// Case-insensitive substring search over name, description, and
    /// feedback, scoped by [`filter_by_tags`]. An empty query matches
    /// everything in scope.
    pub fn search(&self, query: &str, tags: &[String]) -> Result<Vec<RuleRecord>, StoreError> {
        let rules = self.filter_by_tags(tags)?;
        if query.is_empty() {
            return Ok(rules);
        }
        let needle = query.to_lowercase();
        Ok(rules
            .into_iter()
            .filter(|r| {
                r.name.to_lowercase().contains(&needle)
                    || r.description.to_lowercase().contains(&needle)
                    || r.feedback.to_lowercase().contains(&needle)
            })
            .collect())
    }

    /// Parse `document` and add every extracted rule whose name is unused.
    /// Rules with existing names are left untouched and counted as skipped.
    pub fn import_document(&self, document: &str) -> Result<ImportReport, StoreError> {
        let parsed = codec::parse_document(document);
        for skipped in &parsed.skipped {
            tracing::warn!(
                heading = %skipped.heading,
                reason = %skipped.reason,
                "skipping malformed rule section"
            );
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rules = self.backend.load()?;
        let mut report = ImportReport {
            extracted: parsed.rules.len(),
            added: 0,
            skipped_existing: 0,
        };
        for rule in parsed.rules {
            if rules.iter().any(|r| r.name == rule.name) {
                report.skipped_existing += 1;
            } else {
                rules.push(rule);
                report.added += 1;
            }
        }
        if report.added > 0 {
            self.backend.save(&rules)?;
        }
        tracing::info!(
            extracted = report.extracted,
            added = report.added,
            existing = report.skipped_existing,
            "imported rules from document"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::serialize_rules;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> RuleStore {
        RuleStore::open(dir.path().join("rules.md"))
    }

    fn new_rule(name: &str) -> NewRule {
        NewRule {
            name: name.to_string(),
            description: format!("{} description", name),
            original_code: "foo".to_string(),
            modified_code: "bar".to_string(),
            feedback: "manual".to_string(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn missing_document_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn add_persists_and_assigns_identity() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let record = store.add(new_rule("rename-var")).unwrap();
        assert!(!record.id.is_empty());
        assert!(record.updated_at.is_none());

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "rename-var");
        assert_eq!(all[0].original_code, "foo");
    }

    #[test]
    fn add_duplicate_name_is_rejected_and_set_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.add(new_rule("dup")).unwrap();

        let before = store.load_all().unwrap();
        let err = store.add(new_rule("dup")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(ref n) if n == "dup"));

        let after = store.load_all().unwrap();
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].id, after[0].id);
    }

    #[test]
    fn add_rejects_empty_name_and_codeless_rules() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let nameless = new_rule("  ");
        assert!(matches!(
            store.add(nameless).unwrap_err(),
            StoreError::InvalidRule(_)
        ));

        let mut codeless = new_rule("codeless");
        codeless.original_code.clear();
        codeless.modified_code.clear();
        assert!(matches!(
            store.add(codeless).unwrap_err(),
            StoreError::InvalidRule(_)
        ));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn update_merges_present_fields_and_preserves_identity() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let created = store.add(new_rule("r")).unwrap();

        let updated = store
            .update(RuleUpdate {
                name: Some("r".to_string()),
                description: Some("new description".to_string()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at.is_some());
        assert_eq!(updated.description, "new description");
        // Fields absent from the update keep their stored values.
        assert_eq!(updated.original_code, created.original_code);
        assert_eq!(updated.feedback, created.feedback);
    }

    #[test]
    fn update_by_id_can_rename_but_not_onto_existing_name() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let a = store.add(new_rule("a")).unwrap();
        store.add(new_rule("b")).unwrap();

        let renamed = store
            .update(RuleUpdate {
                id: Some(a.id.clone()),
                name: Some("a2".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(renamed.name, "a2");
        assert_eq!(renamed.id, a.id);

        let err = store
            .update(RuleUpdate {
                id: Some(a.id),
                name: Some("b".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(ref n) if n == "b"));
    }

    #[test]
    fn update_unknown_rule_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let err = store
            .update(RuleUpdate {
                name: Some("ghost".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref n) if n == "ghost"));
    }

    #[test]
    fn delete_removes_by_name_and_reports_remaining() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.add(new_rule("keep")).unwrap();
        store.add(new_rule("drop")).unwrap();

        assert_eq!(store.delete("drop").unwrap(), 1);
        assert!(store.get_by_name("drop").unwrap().is_none());
        assert!(store.get_by_name("keep").unwrap().is_some());
    }

    #[test]
    fn delete_unknown_name_is_not_found_and_set_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.add(new_rule("only")).unwrap();

        let err = store.delete("ghost").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn filter_by_tags_is_match_any() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut tagged = new_rule("tagged");
        tagged.tags = vec!["rust".to_string(), "style".to_string()];
        store.add(tagged).unwrap();
        store.add(new_rule("untagged")).unwrap();

        // Empty filter returns everything.
        assert_eq!(store.filter_by_tags(&[]).unwrap().len(), 2);

        // Any intersection matches; "python" alone does not.
        let hits = store
            .filter_by_tags(&["python".to_string(), "style".to_string()])
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "tagged");
        assert!(store
            .filter_by_tags(&["python".to_string()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn search_is_case_insensitive_over_text_fields() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut r = new_rule("rename-var");
        r.description = "Prefer descriptive VARIABLE names".to_string();
        store.add(r).unwrap();
        store.add(new_rule("other")).unwrap();

        let hits = store.search("variable", &[]).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "rename-var");
        assert_eq!(store.search("", &[]).unwrap().len(), 2);
        assert!(store.search("nothing-matches", &[]).unwrap().is_empty());
    }

    #[test]
    fn import_document_adds_new_and_skips_existing() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let existing = store.add(new_rule("existing")).unwrap();

        let incoming = vec![
            crate::RuleRecord {
                description: "incoming copy".to_string(),
                ..existing.clone()
            },
            crate::RuleRecord {
                name: "fresh".to_string(),
                ..existing.clone()
            },
        ];
        let report = store.import_document(&serialize_rules(&incoming)).unwrap();
        assert_eq!(
            report,
            ImportReport {
                extracted: 2,
                added: 1,
                skipped_existing: 1
            }
        );

        // The existing record is untouched.
        let kept = store.get_by_name("existing").unwrap().unwrap();
        assert_eq!(kept.id, existing.id);
        assert_eq!(kept.description, existing.description);
        assert!(store.get_by_name("fresh").unwrap().is_some());
    }

    #[test]
    fn corrupt_sections_are_skipped_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.md");
        std::fs::write(
            &path,
            "# Auto Rules\n\nstray prose\n\n## no-code\n\nprose only\n\n\
             ## good\n\nworks\n\n### Original Code\n\n```\nx\n```\n\n### Modified Code\n\n```\ny\n```\n",
        )
        .unwrap();

        let store = RuleStore::open(&path);
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "good");
    }

    #[test]
    fn save_replaces_document_atomically() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.add(new_rule("r")).unwrap();

        // No temp file is left behind, and the document parses back.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
