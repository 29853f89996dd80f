//! State predicates gating endpoint calls and scheduler ticks.
//!
//! A condition names a state path, the JSON kind the value must have and
//! optionally the exact value. The worker turns an unmet condition into a
//! 409; the scheduler just skips the tick.

use serde::Deserialize;
use serde_json::Value;

use crate::endpoint::{ValueKind, json_type_name};
use crate::state::tree_get;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub path: String,
    pub kind: ValueKind,
    pub value: Option<Value>,
}

impl From<ConditionConfig> for Condition {
    fn from(config: ConditionConfig) -> Self {
        Condition {
            path: config.path,
            kind: config.kind,
            value: config.value,
        }
    }
}

impl Condition {
    /// Check the condition against a state tree. Returns the reason it is not
    /// met, if any.
    pub fn check(&self, root: &Value) -> Result<(), String> {
        let found = match tree_get(root, &self.path) {
            Some(found) => found,
            None => return Err(format!("{} doesn't exist", self.path)),
        };
        if !self.kind.matches(found) {
            return Err(format!(
                "{} type is {} (expected {})",
                self.path,
                json_type_name(found),
                self.kind.name()
            ));
        }
        if let Some(expected) = &self.value {
            if found != expected {
                return Err(format!("{} != {expected}", self.path));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn condition(value: Option<Value>) -> Condition {
        Condition {
            path: "feeling/good".into(),
            kind: ValueKind::Bool,
            value,
        }
    }

    #[test]
    fn missing_path_fails() {
        assert!(condition(None).check(&json!({})).is_err());
    }

    #[test]
    fn kind_mismatch_fails() {
        let root = json!({"feeling": {"good": "very"}});
        assert!(condition(None).check(&root).is_err());
    }

    #[test]
    fn value_match_is_only_checked_when_configured() {
        let root = json!({"feeling": {"good": false}});
        assert!(condition(None).check(&root).is_ok());
        assert!(condition(Some(json!(true))).check(&root).is_err());

        let root = json!({"feeling": {"good": true}});
        assert!(condition(Some(json!(true))).check(&root).is_ok());
    }
}
