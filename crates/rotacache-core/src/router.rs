//! Mutation tag -> key patterns to invalidate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRouter {
    rules: BTreeMap<String, Vec<String>>,
}

impl Default for InvalidationRouter {
    fn default() -> Self {
        Self::new()
            .with_rule("rosterChanged", &["roster", "analytics"])
            .with_rule("staffChanged", &["roster", "schedule", "analytics"])
            .with_rule("scheduleChanged", &["schedule", "analytics"])
            .with_rule("shiftAssigned", &["schedule", "analytics"])
            .with_rule("assignmentsGenerated", &["schedule", "roster", "analytics"])
            .with_rule("settingsChanged", &["settings"])
    }
}

impl InvalidationRouter {
    pub fn new() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Add (or extend) the rule for `tag`. Patterns keep their first-seen
    /// order and are de-duplicated.
    pub fn with_rule(mut self, tag: impl Into<String>, patterns: &[&str]) -> Self {
        let entry = self.rules.entry(tag.into()).or_default();
        for pattern in patterns {
            if !entry.iter().any(|p| p == pattern) {
                entry.push(pattern.to_string());
            }
        }
        self
    }

    /// Patterns to invalidate after a successful mutation tagged `tag`.
    /// Unknown tags invalidate nothing.
    pub fn route(&self, tag: &str) -> &[String] {
        self.rules.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (tag, patterns) in &self.rules {
            let invalid = |reason: &str| ConfigError::InvalidRule {
                tag: tag.clone(),
                reason: reason.to_string(),
            };
            if tag.trim().is_empty() {
                return Err(invalid("tag must not be blank"));
            }
            if patterns.is_empty() {
                return Err(invalid("at least one pattern is required"));
            }
            if patterns.iter().any(|p| p.is_empty()) {
                return Err(invalid("patterns must not be empty"));
            }
            for (i, p) in patterns.iter().enumerate() {
                if patterns[..i].contains(p) {
                    return Err(invalid("duplicate pattern"));
                }
            }
        }
        Ok(())
    }
}
