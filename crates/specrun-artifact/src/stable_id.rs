//! Stable ID extraction
//!
//! Stable IDs are prefix-coded, human-readable identifiers such as
//! `REQ-0001` that stay fixed across revisions and link artifacts to each
//! other. An ID is *defined* by an artifact when it is the value of an
//! `id` key; every other occurrence is a *reference*.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

// Literal patterns; compiling them cannot fail.
static STABLE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{2,6}-\d{4}\b").expect("stable ID pattern"));

static STABLE_ID_EXACT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2,6}-\d{4}$").expect("stable ID pattern"));

/// Whether `s` is exactly one stable ID
#[must_use]
pub fn is_stable_id(s: &str) -> bool {
    STABLE_ID_EXACT.is_match(s)
}

/// Prefix of a stable ID (`REQ` for `REQ-0001`)
#[must_use]
pub fn prefix_of(id: &str) -> Option<&str> {
    is_stable_id(id).then(|| id.split('-').next()).flatten()
}

/// All stable IDs found in `text`, in order of appearance
pub fn find_in_text(text: &str) -> impl Iterator<Item = &str> {
    STABLE_ID.find_iter(text).map(|m| m.as_str())
}

/// Stable IDs defined and referenced by one content tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StableIds {
    /// Definitions in walk order; repeats are kept so duplicates can be reported
    definitions: Vec<String>,
    references: BTreeSet<String>,
}

impl StableIds {
    /// Walk every string leaf of `content`
    #[must_use]
    pub fn extract(content: &Value) -> Self {
        let mut ids = Self::default();
        ids.walk(content, false);
        ids
    }

    fn walk(&mut self, value: &Value, under_id_key: bool) {
        match value {
            Value::String(s) => {
                for id in find_in_text(s) {
                    if under_id_key {
                        self.definitions.push(id.to_string());
                    } else {
                        self.references.insert(id.to_string());
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk(item, false);
                }
            }
            Value::Object(map) => {
                for (key, child) in map {
                    self.walk(child, key == "id");
                }
            }
            _ => {}
        }
    }

    /// Distinct defined IDs
    #[must_use]
    pub fn defined(&self) -> BTreeSet<&str> {
        self.definitions.iter().map(String::as_str).collect()
    }

    /// Distinct IDs occurring anywhere other than under an `id` key
    #[inline]
    #[must_use]
    pub fn referenced(&self) -> &BTreeSet<String> {
        &self.references
    }

    /// IDs defined more than once
    #[must_use]
    pub fn duplicates(&self) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let mut dups = BTreeSet::new();
        for id in &self.definitions {
            if !seen.insert(id.as_str()) {
                dups.insert(id.as_str());
            }
        }
        dups
    }

    /// Every ID mentioned at all
    #[must_use]
    pub fn all(&self) -> BTreeSet<&str> {
        let mut all = self.defined();
        all.extend(self.references.iter().map(String::as_str));
        all
    }

    /// Whether `id` is defined or referenced
    #[must_use]
    pub fn mentions(&self, id: &str) -> bool {
        self.references.contains(id) || self.definitions.iter().any(|d| d == id)
    }

    /// Every mentioned ID carrying `prefix`
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> BTreeSet<&str> {
        self.all()
            .into_iter()
            .filter(|id| prefix_of(id) == Some(prefix))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definitions_and_references_split_on_id_key() {
        let content = json!({
            "requirements": [
                {"id": "REQ-0001", "objective": "OBJ-0001", "text": "see ADR-0002"},
                {"id": "REQ-0002", "depends_on": ["REQ-0001"]}
            ]
        });
        let ids = StableIds::extract(&content);
        assert_eq!(ids.defined(), BTreeSet::from(["REQ-0001", "REQ-0002"]));
        assert_eq!(
            ids.referenced().iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["ADR-0002", "OBJ-0001", "REQ-0001"]
        );
    }

    #[test]
    fn duplicates_reported_once() {
        let content = json!({"tasks": [{"id": "TASK-0001"}, {"id": "TASK-0001"}, {"id": "TASK-0002"}]});
        let ids = StableIds::extract(&content);
        assert_eq!(ids.duplicates(), BTreeSet::from(["TASK-0001"]));
    }

    #[test]
    fn ignores_non_matching_tokens() {
        let content = json!({"text": "R-0001 REQ-001 TOOLONG-0001 req-0001 REQ-00011"});
        assert!(StableIds::extract(&content).all().is_empty());
    }

    #[test]
    fn prefix_filter() {
        let content = json!({"a": "OBJ-0001 REQ-0003", "b": {"id": "TEST-0001"}});
        let ids = StableIds::extract(&content);
        assert_eq!(ids.with_prefix("TEST"), BTreeSet::from(["TEST-0001"]));
        assert_eq!(prefix_of("ADR-0009"), Some("ADR"));
        assert_eq!(prefix_of("ADR-9"), None);
    }
}
