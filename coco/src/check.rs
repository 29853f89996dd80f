//! Validators over fan-out replies.
//!
//! Checks are configured in a call-spec's `reply` block and run after the
//! replies have been gathered. A failing check never raises; it produces
//! failure records that the engine writes into the result's `failed_checks`
//! tree, flipping the invocation's `success` flag.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::endpoint::ValueKind;
use crate::result::Reply;
use crate::state::{State, hash_value};
use crate::util::Host;

/// The `reply` block of a call-spec. Each present key becomes one check.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplyChecksConfig {
    /// Expected field values.
    #[serde(default)]
    pub value: Option<Map<String, Value>>,
    /// Expected field kinds.
    #[serde(default, rename = "type")]
    pub kind: Option<BTreeMap<String, ValueKind>>,
    /// Fields that must be identical across all hosts.
    #[serde(default)]
    pub identical: Option<Vec<String>>,
    /// Replies must equal the referenced state subtree(s).
    #[serde(default)]
    pub state: Option<StateRef>,
    /// Per-field hashes must equal the hash of the referenced state path.
    #[serde(default)]
    pub state_hash: Option<StateRef>,
}

/// Reference into the state: one path for the whole reply, or one per field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StateRef {
    Path(String),
    Fields(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
pub enum ReplyCheck {
    Value { expected: Map<String, Value> },
    Type { expected: BTreeMap<String, ValueKind> },
    Identical { fields: Vec<String> },
    State { target: StateRef },
    StateHash { target: StateRef },
}

/// One recorded check failure.
#[derive(Debug, Clone)]
pub struct CheckFailure {
    pub host: Host,
    pub kind: &'static str,
    pub field: String,
}

/// What a check run produced.
#[derive(Debug, Default)]
pub struct CheckOutcome {
    pub failures: Vec<CheckFailure>,
    pub failed_hosts: BTreeSet<Host>,
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, host: &Host, kind: &'static str, field: impl Into<String>) {
        self.failed_hosts.insert(host.clone());
        self.failures.push(CheckFailure {
            host: host.clone(),
            kind,
            field: field.into(),
        });
    }
}

/// All checks compiled from one call-spec.
#[derive(Debug, Clone, Default)]
pub struct CheckSet {
    checks: Vec<ReplyCheck>,
}

impl CheckSet {
    pub fn from_config(config: &ReplyChecksConfig) -> CheckSet {
        let mut checks = Vec::new();
        if let Some(expected) = &config.value {
            checks.push(ReplyCheck::Value {
                expected: expected.clone(),
            });
        }
        if let Some(expected) = &config.kind {
            checks.push(ReplyCheck::Type {
                expected: expected.clone(),
            });
        }
        if let Some(fields) = &config.identical {
            checks.push(ReplyCheck::Identical {
                fields: fields.clone(),
            });
        }
        if let Some(target) = &config.state {
            checks.push(ReplyCheck::State {
                target: target.clone(),
            });
        }
        if let Some(target) = &config.state_hash {
            checks.push(ReplyCheck::StateHash {
                target: target.clone(),
            });
        }
        CheckSet { checks }
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplyCheck> {
        self.checks.iter()
    }
}

impl ReplyCheck {
    /// Run the check over a forward's replies against the current state.
    pub fn run(&self, replies: &BTreeMap<Host, Reply>, state: &State) -> CheckOutcome {
        let mut outcome = CheckOutcome::default();
        match self {
            ReplyCheck::Value { expected } => {
                for (host, reply) in replies {
                    check_fields(&mut outcome, host, reply, expected.iter(), |found, want| {
                        if found == want { None } else { Some("value") }
                    });
                }
            }
            ReplyCheck::Type { expected } => {
                for (host, reply) in replies {
                    check_fields(&mut outcome, host, reply, expected.iter(), |found, want| {
                        if want.matches(found) { None } else { Some("type") }
                    });
                }
            }
            ReplyCheck::Identical { fields } => {
                for field in fields {
                    let mut unique: Vec<&Value> = Vec::new();
                    for reply in replies.values() {
                        let value = match &reply.body {
                            Value::Object(map) => map.get(field).unwrap_or(&Value::Null),
                            other => other,
                        };
                        if !unique.contains(&value) {
                            unique.push(value);
                        }
                    }
                    if unique.len() > 1 {
                        debug!(
                            "Replies from hosts not identical ({} unique values for {field}).",
                            unique.len()
                        );
                        // every host is implicated when the fleet disagrees
                        for host in replies.keys() {
                            outcome.fail(host, "not_identical", "all");
                        }
                        break;
                    }
                }
            }
            ReplyCheck::State { target } => match target {
                StateRef::Path(path) => {
                    let expected = state.lookup(path);
                    for (host, reply) in replies {
                        if expected != Some(&reply.body) {
                            outcome.fail(host, "mismatch_with_state", path.clone());
                        }
                    }
                }
                StateRef::Fields(targets) => {
                    for (field, path) in targets {
                        let expected = state.lookup(path);
                        for (host, reply) in replies {
                            match reply.body.get(field) {
                                None => outcome.fail(host, "missing", field.clone()),
                                Some(found) if Some(found) != expected => {
                                    outcome.fail(host, "mismatch_with_state", field.clone());
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }
            },
            ReplyCheck::StateHash { target } => match target {
                StateRef::Path(path) => {
                    let expected = state.lookup(path).map(hash_value);
                    for (host, reply) in replies {
                        if reply.body.as_str() != expected.as_deref() {
                            outcome.fail(host, "mismatch_with_state_hash", path.clone());
                        }
                    }
                }
                StateRef::Fields(targets) => {
                    for (field, path) in targets {
                        let expected = state.lookup(path).map(hash_value);
                        for (host, reply) in replies {
                            match reply.body.get(field) {
                                None => outcome.fail(host, "missing", field.clone()),
                                Some(found) if found.as_str() != expected.as_deref() => {
                                    outcome.fail(host, "mismatch_with_state_hash", field.clone());
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }
            },
        }
        outcome
    }
}

/// Shared walk for the value and type checks: every expected field must be
/// present and satisfy `judge`; extra reply fields are ignored.
fn check_fields<'e, E: 'e>(
    outcome: &mut CheckOutcome,
    host: &Host,
    reply: &Reply,
    expected: impl Iterator<Item = (&'e String, &'e E)>,
    judge: impl Fn(&Value, &E) -> Option<&'static str>,
) {
    let body = reply.body.as_object();
    for (field, want) in expected {
        match body.and_then(|map| map.get(field)) {
            None => outcome.fail(host, "missing", field.clone()),
            Some(found) => {
                if let Some(kind) = judge(found, want) {
                    outcome.fail(host, kind, field.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap as Map2;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> State {
        State::new(dir.path(), Map2::new(), Vec::new()).unwrap()
    }

    fn replies(entries: &[(&str, u16, Value)]) -> BTreeMap<Host, Reply> {
        entries
            .iter()
            .enumerate()
            .map(|(i, (name, port, body))| {
                (Host::new(*name, *port + i as u16), Reply::new(body.clone(), 200))
            })
            .collect()
    }

    #[test]
    fn value_check_flags_missing_and_wrong_values() {
        let dir = TempDir::new().unwrap();
        let st = state(&dir);
        let check = ReplyCheck::Value {
            expected: json!({"ok": true}).as_object().unwrap().clone(),
        };

        let good = replies(&[("h1", 10, json!({"ok": true}))]);
        assert!(check.run(&good, &st).passed());

        let wrong = replies(&[("h1", 10, json!({"ok": false}))]);
        let outcome = check.run(&wrong, &st);
        assert_eq!(outcome.failures[0].kind, "value");

        let missing = replies(&[("h1", 10, json!({}))]);
        let outcome = check.run(&missing, &st);
        assert_eq!(outcome.failures[0].kind, "missing");

        // a non-object reply counts as all-missing
        let text = replies(&[("h1", 10, json!("Success"))]);
        assert_eq!(check.run(&text, &st).failures[0].kind, "missing");
    }

    #[test]
    fn type_check_flags_kind_mismatches() {
        let dir = TempDir::new().unwrap();
        let st = state(&dir);
        let mut expected = BTreeMap::new();
        expected.insert("count".to_string(), ValueKind::Int);
        let check = ReplyCheck::Type { expected };

        assert!(check.run(&replies(&[("h1", 10, json!({"count": 3}))]), &st).passed());
        let outcome = check.run(&replies(&[("h1", 10, json!({"count": "3"}))]), &st);
        assert_eq!(outcome.failures[0].kind, "type");
    }

    #[test]
    fn identical_check_implicates_every_host() {
        let dir = TempDir::new().unwrap();
        let st = state(&dir);
        let check = ReplyCheck::Identical {
            fields: vec!["rand".to_string()],
        };

        let agreeing = replies(&[("h1", 10, json!({"rand": 4})), ("h2", 20, json!({"rand": 4}))]);
        assert!(check.run(&agreeing, &st).passed());

        let disagreeing = replies(&[("h1", 10, json!({"rand": 4})), ("h2", 20, json!({"rand": 5}))]);
        let outcome = check.run(&disagreeing, &st);
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures.iter().all(|f| f.kind == "not_identical" && f.field == "all"));
        assert_eq!(outcome.failed_hosts.len(), 2);
    }

    #[test]
    fn state_check_compares_against_the_subtree() {
        let dir = TempDir::new().unwrap();
        let mut st = state(&dir);
        st.write("fpga/gain", json!(7), None).unwrap();

        let check = ReplyCheck::State {
            target: StateRef::Fields(BTreeMap::from([("gain".to_string(), "fpga/gain".to_string())])),
        };
        assert!(check.run(&replies(&[("h1", 10, json!({"gain": 7}))]), &st).passed());

        let outcome = check.run(&replies(&[("h1", 10, json!({"gain": 8}))]), &st);
        assert_eq!(outcome.failures[0].kind, "mismatch_with_state");
    }

    #[test]
    fn state_hash_check_compares_field_hashes() {
        let dir = TempDir::new().unwrap();
        let mut st = state(&dir);
        st.write("fpga", json!({"gain": 7}), None).unwrap();
        let expected = st.hash("fpga").unwrap();

        let check = ReplyCheck::StateHash {
            target: StateRef::Fields(BTreeMap::from([("fpga".to_string(), "fpga".to_string())])),
        };
        assert!(
            check
                .run(&replies(&[("h1", 10, json!({"fpga": expected}))]), &st)
                .passed()
        );

        let outcome = check.run(&replies(&[("h1", 10, json!({"fpga": "0000"}))]), &st);
        assert_eq!(outcome.failures[0].kind, "mismatch_with_state_hash");
    }

    #[test]
    fn reply_block_compiles_one_check_per_key() {
        let config: ReplyChecksConfig = serde_yaml::from_str(
            "value:\n  ok: true\ntype:\n  count: int\nidentical:\n  - rand\n",
        )
        .unwrap();
        let set = CheckSet::from_config(&config);
        assert_eq!(set.iter().count(), 3);
    }
}
