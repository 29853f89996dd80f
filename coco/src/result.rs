//! The structured outcome of an endpoint invocation.
//!
//! An [`EndpointResult`] collects per-forward replies, embedded sub-results
//! (before/after and internal forwards), messages, failed checks and an
//! optional state attachment. It is built up by the engine during one
//! invocation and projected into a report shape on the way out:
//!
//! - `OVERVIEW`: per forward, `{reply value -> count}`
//! - `FULL`: per forward, `{host url -> {reply, status}}`
//! - `CODES`: per forward, `{host url -> status}`
//! - `CODES_OVERVIEW`: per forward, `{status -> count}`
//!
//! A status code of `0` signals a connection error or timeout.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::util::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReportType {
    #[serde(rename = "OVERVIEW")]
    Overview,
    #[serde(rename = "FULL")]
    Full,
    #[serde(rename = "CODES")]
    Codes,
    #[default]
    #[serde(rename = "CODES_OVERVIEW")]
    CodesOverview,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Overview => "OVERVIEW",
            ReportType::Full => "FULL",
            ReportType::Codes => "CODES",
            ReportType::CodesOverview => "CODES_OVERVIEW",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "OVERVIEW" => Ok(ReportType::Overview),
            "FULL" => Ok(ReportType::Full),
            "CODES" => Ok(ReportType::Codes),
            "CODES_OVERVIEW" => Ok(ReportType::CodesOverview),
            other => Err(format!("Unknown report type: {other}")),
        }
    }
}

/// One host's reply to a forwarded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub body: Value,
    pub status: u16,
}

impl Reply {
    pub fn new(body: Value, status: u16) -> Self {
        Reply { body, status }
    }
}

/// Failed checks, as `forward -> host url -> failure kind -> field names`.
pub type FailedChecks = BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<String>>>>;

#[derive(Debug, Clone, Default)]
pub struct EndpointResult {
    name: String,
    replies: BTreeMap<String, BTreeMap<Host, Reply>>,
    embedded: BTreeMap<String, EndpointResult>,
    messages: Vec<String>,
    failed_checks: FailedChecks,
    state: Map<String, Value>,
    success: bool,
    error: Option<String>,
    report_type: ReportType,
}

impl EndpointResult {
    pub fn new(name: impl Into<String>) -> Self {
        EndpointResult {
            name: name.into(),
            success: true,
            ..Default::default()
        }
    }

    /// A result holding a single forward's replies, e.g. from a fan-out or a
    /// built-in endpoint.
    pub fn with_replies(name: impl Into<String>, replies: BTreeMap<Host, Reply>) -> Self {
        let name = name.into();
        let mut result = EndpointResult::new(name.clone());
        result.replies.insert(name, replies);
        result
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn set_success(&mut self, success: bool) {
        self.success = success;
    }

    pub fn report_type(&self) -> ReportType {
        self.report_type
    }

    pub fn set_report_type(&mut self, report_type: ReportType) {
        self.report_type = report_type;
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn add_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Attach the subtree produced by `get_state`.
    pub fn attach_state(&mut self, state: Value) {
        if let Value::Object(map) = state {
            self.state.extend(map);
        }
    }

    /// Record a failed reply check against one host.
    pub fn report_failure(&mut self, forward: &str, host_url: String, kind: &str, field: &str) {
        self.failed_checks
            .entry(forward.to_string())
            .or_default()
            .entry(host_url)
            .or_default()
            .entry(kind.to_string())
            .or_default()
            .push(field.to_string());
    }

    pub fn failed_checks(&self) -> &FailedChecks {
        &self.failed_checks
    }

    /// Replies of a single forward.
    pub fn replies(&self, forward: &str) -> Option<&BTreeMap<Host, Reply>> {
        self.replies.get(forward)
    }

    /// All replies across forwards, merged host-wise.
    pub fn merged_replies(&self) -> BTreeMap<Host, Reply> {
        let mut merged = BTreeMap::new();
        for replies in self.replies.values() {
            merged.extend(replies.iter().map(|(h, r)| (h.clone(), r.clone())));
        }
        merged
    }

    /// Merge another result into this one (same level, e.g. the result of one
    /// external forward).
    pub fn add_result(&mut self, other: EndpointResult) {
        self.success &= other.success;
        self.replies.extend(other.replies);
        self.failed_checks.extend(other.failed_checks);
        self.state.extend(other.state);
        self.embedded.extend(other.embedded);
        self.messages.extend(other.messages);
        match (&mut self.error, other.error) {
            (Some(mine), Some(theirs)) => *mine = format!("{mine} ;{theirs}"),
            (mine @ None, Some(theirs)) => *mine = Some(theirs),
            _ => {}
        }
    }

    /// Keep another result as a named child (before/after and internal
    /// forwards). The child's failure propagates to this result.
    pub fn embed(&mut self, name: impl Into<String>, sub: EndpointResult) {
        self.success &= sub.success;
        self.embedded.insert(name.into(), sub);
    }

    /// Project the result into a report. Embedded sub-results are reported
    /// recursively under their names with the same type.
    pub fn report(&self, override_type: Option<ReportType>) -> Value {
        let report_type = override_type.unwrap_or(self.report_type);
        let mut d = Map::new();

        for (name, sub) in &self.embedded {
            d.insert(name.clone(), sub.report(Some(report_type)));
        }

        match self.messages.len() {
            0 => {}
            1 => {
                d.insert("message".into(), json!(self.messages[0]));
            }
            _ => {
                d.insert("message".into(), json!(self.messages));
            }
        }

        d.insert("success".into(), json!(self.success));

        // an error eclipses everything else
        if let Some(error) = &self.error {
            d.insert("error".into(), json!(error));
            return Value::Object(d);
        }

        if !self.state.is_empty() {
            d.insert("state".into(), Value::Object(self.state.clone()));
        }

        if !self.failed_checks.is_empty() {
            d.insert("failed_checks".into(), self.report_checks(report_type));
        }

        for (name, replies) in &self.replies {
            d.insert(name.clone(), project_replies(replies, report_type));
        }
        Value::Object(d)
    }

    /// The failed-checks tree: verbatim under FULL/CODES, as counts of hosts
    /// sharing the same failure under the overview types.
    fn report_checks(&self, report_type: ReportType) -> Value {
        match report_type {
            ReportType::Full | ReportType::Codes => {
                let mut out = Map::new();
                for (forward, hosts) in &self.failed_checks {
                    let mut per_host = Map::new();
                    for (host_url, kinds) in hosts {
                        per_host.insert(host_url.clone(), json!({ "reply": kinds }));
                    }
                    out.insert(forward.clone(), Value::Object(per_host));
                }
                Value::Object(out)
            }
            ReportType::Overview | ReportType::CodesOverview => {
                let mut out = Map::new();
                for (forward, hosts) in &self.failed_checks {
                    let mut per_kind: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
                    for kinds in hosts.values() {
                        for (kind, fields) in kinds {
                            let fields = format!("[{}]", fields.join(", "));
                            *per_kind.entry(kind.clone()).or_default().entry(fields).or_insert(0) += 1;
                        }
                    }
                    out.insert(forward.clone(), json!({ "reply": per_kind }));
                }
                Value::Object(out)
            }
        }
    }
}

fn project_replies(replies: &BTreeMap<Host, Reply>, report_type: ReportType) -> Value {
    match report_type {
        ReportType::Full => {
            let mut out = Map::new();
            for (host, reply) in replies {
                out.insert(host.url(), json!({ "reply": reply.body, "status": reply.status }));
            }
            Value::Object(out)
        }
        ReportType::Codes => {
            let mut out = Map::new();
            for (host, reply) in replies {
                out.insert(host.url(), json!(reply.status));
            }
            Value::Object(out)
        }
        ReportType::CodesOverview => {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for reply in replies.values() {
                *counts.entry(reply.status.to_string()).or_insert(0) += 1;
            }
            json!(counts)
        }
        ReportType::Overview => {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for reply in replies.values() {
                let shown = match &reply.body {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                *counts.entry(shown).or_insert(0) += 1;
            }
            json!(counts)
        }
    }
}
