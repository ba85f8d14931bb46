//! Conflict resolution for replayed mutations.
//!
//! A conflict exists when the server changed the mutation's target after
//! the client last saw it. The strategy picks the winner; no strategy
//! drops a mutation without saying so in the replay report.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FetchError;
use crate::remote::ServerState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// The queued mutation always wins.
    Local,
    /// The server state always wins; the mutation is dropped.
    #[default]
    Server,
    /// Field-level combination through the tag's merge function.
    Merge,
    /// Whichever changed later wins.
    Newest,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::Local => write!(f, "local"),
            ConflictStrategy::Server => write!(f, "server"),
            ConflictStrategy::Merge => write!(f, "merge"),
            ConflictStrategy::Newest => write!(f, "newest"),
        }
    }
}

/// Combine queued variables with the server payload into the variables to
/// send. Arguments are `(local, server)`.
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Send these variables.
    Apply(Value),
    /// Server state wins; do not send anything.
    Drop,
    /// The conflict cannot be resolved with the configured strategy.
    Fail(FetchError),
}

#[derive(Clone, Default)]
pub struct ConflictResolver {
    default: ConflictStrategy,
    mergers: HashMap<String, MergeFn>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("default", &self.default)
            .field("mergers", &self.mergers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(default: ConflictStrategy) -> Self {
        Self {
            default,
            mergers: HashMap::new(),
        }
    }

    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default
    }

    pub fn register_merge(&mut self, tag: impl Into<String>, merge: MergeFn) {
        self.mergers.insert(tag.into(), merge);
    }

    pub fn has_merge(&self, tag: &str) -> bool {
        self.mergers.contains_key(tag)
    }

    /// Decide what to send for a mutation whose target changed on the
    /// server. `local_at` is when the mutation was made.
    pub fn resolve(
        &self,
        tag: &str,
        variables: &Value,
        local_at: DateTime<Utc>,
        server: &ServerState,
        override_strategy: Option<ConflictStrategy>,
    ) -> Resolution {
        match override_strategy.unwrap_or(self.default) {
            ConflictStrategy::Local => Resolution::Apply(variables.clone()),
            ConflictStrategy::Server => Resolution::Drop,
            ConflictStrategy::Newest => {
                if server.updated_at > local_at {
                    Resolution::Drop
                } else {
                    Resolution::Apply(variables.clone())
                }
            }
            ConflictStrategy::Merge => match self.mergers.get(tag) {
                Some(merge) => Resolution::Apply(merge(variables, &server.payload)),
                None => Resolution::Fail(FetchError::Conflict(format!(
                    "no merge function registered for '{}'",
                    tag
                ))),
            },
        }
    }
}

/// Object merge: server fields, overlaid with every local field. Non-object
/// inputs resolve to the local value.
pub fn merge_fields(local: &Value, server: &Value) -> Value {
    match (local, server) {
        (Value::Object(local), Value::Object(server)) => {
            let mut merged = server.clone();
            for (field, value) in local {
                merged.insert(field.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => local.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn server_at(updated_at: DateTime<Utc>) -> ServerState {
        ServerState {
            payload: json!({"name": "Server", "role": "lead"}),
            updated_at,
        }
    }

    #[test]
    fn test_local_always_applies() {
        let resolver = ConflictResolver::new(ConflictStrategy::Local);
        let vars = json!({"name": "Local"});
        let res = resolver.resolve("t", &vars, Utc::now(), &server_at(Utc::now()), None);
        assert_eq!(res, Resolution::Apply(vars));
    }

    #[test]
    fn test_server_always_drops() {
        let resolver = ConflictResolver::new(ConflictStrategy::Server);
        let res = resolver.resolve("t", &json!({}), Utc::now(), &server_at(Utc::now()), None);
        assert_eq!(res, Resolution::Drop);
    }

    #[test]
    fn test_newest_prefers_later_timestamp() {
        let resolver = ConflictResolver::new(ConflictStrategy::Newest);
        let t1 = Utc::now() - Duration::minutes(10);
        let t2 = Utc::now();

        let res = resolver.resolve("t", &json!({"a": 1}), t1, &server_at(t2), None);
        assert_eq!(res, Resolution::Drop);

        let res = resolver.resolve("t", &json!({"a": 1}), t2, &server_at(t1), None);
        assert_eq!(res, Resolution::Apply(json!({"a": 1})));
    }

    #[test]
    fn test_merge_uses_registered_function() {
        let mut resolver = ConflictResolver::new(ConflictStrategy::Merge);
        resolver.register_merge("staffChanged", Arc::new(merge_fields));
        let res = resolver.resolve(
            "staffChanged",
            &json!({"name": "Local"}),
            Utc::now(),
            &server_at(Utc::now()),
            None,
        );
        assert_eq!(res, Resolution::Apply(json!({"name": "Local", "role": "lead"})));
    }

    #[test]
    fn test_merge_without_function_fails_loudly() {
        let resolver = ConflictResolver::new(ConflictStrategy::Merge);
        let res = resolver.resolve("t", &json!({}), Utc::now(), &server_at(Utc::now()), None);
        assert!(matches!(res, Resolution::Fail(FetchError::Conflict(_))));
    }

    #[test]
    fn test_override_beats_default() {
        let resolver = ConflictResolver::new(ConflictStrategy::Server);
        let res = resolver.resolve(
            "t",
            &json!(1),
            Utc::now(),
            &server_at(Utc::now()),
            Some(ConflictStrategy::Local),
        );
        assert_eq!(res, Resolution::Apply(json!(1)));
    }

    #[test]
    fn test_strategy_serde_names() {
        assert_eq!(serde_json::to_string(&ConflictStrategy::Newest).unwrap(), r#""newest""#);
        let s: ConflictStrategy = serde_json::from_str(r#""merge""#).unwrap();
        assert_eq!(s, ConflictStrategy::Merge);
    }
}
