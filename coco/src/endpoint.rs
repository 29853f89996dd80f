//! Endpoint definitions.
//!
//! Endpoints are declared in YAML files, one per endpoint: the file stem is
//! the endpoint name, files starting with `_` are ignored and the directory
//! is walked recursively. Definitions are parsed once at startup into
//! [`Endpoint`] values and never mutated afterwards.
//!
//! Two things are deliberately resolved at load time rather than at call
//! time: value types are a fixed enumeration ([`ValueKind`]) validated when
//! the file is read, and the string-or-object polymorphism of call-specs is
//! normalised into [`ExternalForward`] / [`CocoForward`] variants.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::check::{CheckSet, ReplyChecksConfig};
use crate::condition::{Condition, ConditionConfig};
use crate::errors::Error;
use crate::result::ReportType;
use crate::util::{Host, OneOrMany};

/// Request methods an endpoint can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET", alias = "get")]
    Get,
    #[serde(rename = "POST", alias = "post")]
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        }
    }
}

/// The fixed set of kinds a configured value may have. Unknown kind names in
/// a definition fail the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum ValueKind {
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "str")]
    Str,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "dict")]
    Dict,
    #[serde(rename = "list")]
    List,
}

impl ValueKind {
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "str",
            ValueKind::Bool => "bool",
            ValueKind::Dict => "dict",
            ValueKind::List => "list",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueKind::Int => value.is_i64() || value.is_u64(),
            ValueKind::Float => value.is_f64(),
            ValueKind::Str => value.is_string(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Dict => value.is_object(),
            ValueKind::List => value.is_array(),
        }
    }
}

/// Kind name of a JSON value, for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Built-in endpoints served by the worker itself; configured endpoints may
/// not shadow these names.
pub const BUILTIN_ENDPOINTS: &[(&str, HttpMethod)] = &[
    ("blocklist", HttpMethod::Get),
    ("update-blocklist", HttpMethod::Post),
    ("wait", HttpMethod::Post),
    ("reset-state", HttpMethod::Post),
    ("save-state", HttpMethod::Post),
    ("load-state", HttpMethod::Post),
    ("saved-states", HttpMethod::Get),
];

pub fn builtin_method(name: &str) -> Option<HttpMethod> {
    BUILTIN_ENDPOINTS
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .map(|(_, method)| *method)
}

/// A call-spec as written in YAML: a bare endpoint name or a block.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CallSpecConfig {
    Name(String),
    Block {
        name: String,
        /// Request override, internal forwards only.
        #[serde(default)]
        request: Option<Map<String, Value>>,
        #[serde(default)]
        reply: Option<ReplyChecksConfig>,
        #[serde(default)]
        save_reply_to_state: Option<String>,
        #[serde(default)]
        on_failure: Option<OnFailureConfig>,
        #[serde(default, with = "crate::util::flex_duration::option")]
        timeout: Option<Duration>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnFailureConfig {
    #[serde(default)]
    pub call: Option<String>,
    #[serde(default)]
    pub call_single_host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallBlockConfig {
    /// Missing: forward to the endpoint's own name. Explicit `null`: no
    /// external forwards at all.
    #[serde(default, deserialize_with = "crate::util::deserialize_explicit")]
    pub forward: Option<Option<OneOrMany<CallSpecConfig>>>,
    #[serde(default)]
    pub coco: Option<OneOrMany<CallSpecConfig>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    #[serde(with = "crate::util::flex_duration")]
    pub period: Duration,
    #[serde(default)]
    pub require_state: Option<OneOrMany<ConditionConfig>>,
}

/// The raw on-disk schema of one endpoint definition file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub values: Option<BTreeMap<String, ValueKind>>,
    #[serde(default)]
    pub call: Option<CallBlockConfig>,
    #[serde(default)]
    pub before: Option<OneOrMany<CallSpecConfig>>,
    #[serde(default)]
    pub after: Option<OneOrMany<CallSpecConfig>>,
    #[serde(default)]
    pub save_state: Option<OneOrMany<String>>,
    #[serde(default)]
    pub send_state: Option<String>,
    #[serde(default)]
    pub get_state: Option<String>,
    #[serde(default)]
    pub set_state: Option<Map<String, Value>>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, with = "crate::util::flex_duration::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
    #[serde(default)]
    pub require_state: Option<OneOrMany<ConditionConfig>>,
    #[serde(default)]
    pub enforce_group: bool,
    #[serde(default)]
    pub report_type: Option<ReportType>,
    #[serde(default)]
    pub call_on_start: bool,
}

/// One external forward: a call fanned out to a host group.
#[derive(Debug, Clone)]
pub struct ExternalForward {
    pub name: String,
    pub group: String,
    pub checks: CheckSet,
    pub save_reply_to_state: Option<String>,
    pub on_failure: OnFailureConfig,
    pub timeout: Option<Duration>,
}

/// One internal forward: a recursive call into another endpoint.
#[derive(Debug, Clone)]
pub struct CocoForward {
    pub name: String,
    pub request: Option<Map<String, Value>>,
    pub checks: CheckSet,
    pub save_reply_to_state: Option<String>,
    pub on_failure: OnFailureConfig,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub period: Duration,
    pub conditions: Vec<Condition>,
}

/// A fully parsed endpoint definition. Immutable after load.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub description: Option<String>,
    pub method: HttpMethod,
    pub group: Option<String>,
    pub values: BTreeMap<String, ValueKind>,
    pub before: Vec<CocoForward>,
    pub after: Vec<CocoForward>,
    pub external_forwards: Vec<ExternalForward>,
    pub coco_forwards: Vec<CocoForward>,
    pub save_state: Vec<String>,
    pub send_state: Option<String>,
    pub get_state: Option<String>,
    pub set_state: Map<String, Value>,
    pub timestamp_path: Option<String>,
    pub timeout: Option<Duration>,
    pub schedule: Option<Schedule>,
    pub conditions: Vec<Condition>,
    pub enforce_group: bool,
    pub report_type: ReportType,
    pub call_on_start: bool,
}

impl EndpointConfig {
    /// Resolve the raw schema into an [`Endpoint`], validating group
    /// references and the schedule block.
    pub fn compile(self, name: &str, groups: &BTreeMap<String, Vec<Host>>) -> Result<Endpoint, Error> {
        let group = self.group;
        if let Some(group) = &group {
            if !groups.contains_key(group) {
                return Err(Error::config(format!(
                    "Endpoint '{name}' references unknown group '{group}'."
                )));
            }
        }

        let external_specs: Vec<CallSpecConfig> = match self.call.as_ref().and_then(|c| c.forward.clone()) {
            // no call block, or a call block without a forward key
            None => vec![CallSpecConfig::Name(name.to_string())],
            // call: forward: null
            Some(None) => Vec::new(),
            Some(Some(specs)) => specs.into_vec(),
        };

        let mut external_forwards = Vec::new();
        for spec in external_specs {
            let group = group.clone().ok_or_else(|| {
                Error::config(format!(
                    "Endpoint '{name}' is missing config option 'group'. Or it needs to set 'call: forward: null'."
                ))
            })?;
            external_forwards.push(compile_external(spec, group));
        }

        let coco_forwards = compile_coco_list(self.call.and_then(|c| c.coco));
        let before = compile_coco_list(self.before);
        let after = compile_coco_list(self.after);

        let values = self.values.unwrap_or_default();

        let schedule = match self.schedule {
            Some(schedule) => {
                if schedule.period.is_zero() {
                    return Err(Error::config(format!(
                        "Could not parse 'period' parameter for endpoint '{name}': must be non-zero."
                    )));
                }
                if !values.is_empty() {
                    return Err(Error::config(format!(
                        "Endpoint '{name}' cannot be scheduled with a 'values' config block."
                    )));
                }
                Some(Schedule {
                    period: schedule.period,
                    conditions: schedule
                        .require_state
                        .map(OneOrMany::into_vec)
                        .unwrap_or_default()
                        .into_iter()
                        .map(Condition::from)
                        .collect(),
                })
            }
            None => None,
        };

        Ok(Endpoint {
            name: name.to_string(),
            description: self.description,
            method: self.method.unwrap_or(HttpMethod::Get),
            group,
            values,
            before,
            after,
            external_forwards,
            coco_forwards,
            save_state: self.save_state.map(OneOrMany::into_vec).unwrap_or_default(),
            send_state: self.send_state,
            get_state: self.get_state,
            set_state: self.set_state.unwrap_or_default(),
            timestamp_path: self.timestamp,
            timeout: self.timeout,
            schedule,
            conditions: self
                .require_state
                .map(OneOrMany::into_vec)
                .unwrap_or_default()
                .into_iter()
                .map(Condition::from)
                .collect(),
            enforce_group: self.enforce_group,
            report_type: self.report_type.unwrap_or_default(),
            call_on_start: self.call_on_start,
        })
    }
}

fn compile_external(spec: CallSpecConfig, group: String) -> ExternalForward {
    match spec {
        CallSpecConfig::Name(name) => ExternalForward {
            name,
            group,
            checks: CheckSet::default(),
            save_reply_to_state: None,
            on_failure: OnFailureConfig::default(),
            timeout: None,
        },
        CallSpecConfig::Block {
            name,
            reply,
            save_reply_to_state,
            on_failure,
            timeout,
            ..
        } => ExternalForward {
            name,
            group,
            checks: reply.as_ref().map(CheckSet::from_config).unwrap_or_default(),
            save_reply_to_state,
            on_failure: on_failure.unwrap_or_default(),
            timeout,
        },
    }
}

fn compile_coco_list(specs: Option<OneOrMany<CallSpecConfig>>) -> Vec<CocoForward> {
    specs
        .map(OneOrMany::into_vec)
        .unwrap_or_default()
        .into_iter()
        .map(|spec| match spec {
            CallSpecConfig::Name(name) => CocoForward {
                name,
                request: None,
                checks: CheckSet::default(),
                save_reply_to_state: None,
                on_failure: OnFailureConfig::default(),
            },
            CallSpecConfig::Block {
                name,
                request,
                reply,
                save_reply_to_state,
                on_failure,
                ..
            } => CocoForward {
                name,
                request,
                checks: reply.as_ref().map(CheckSet::from_config).unwrap_or_default(),
                save_reply_to_state,
                on_failure: on_failure.unwrap_or_default(),
            },
        })
        .collect()
}

/// Load every endpoint definition under `dir`.
pub fn load_endpoints(
    dir: &Path,
    groups: &BTreeMap<String, Vec<Host>>,
) -> Result<BTreeMap<String, Endpoint>, Error> {
    let mut endpoints = BTreeMap::new();
    visit_dir(dir, groups, &mut endpoints)?;
    validate_references(&endpoints)?;
    Ok(endpoints)
}

fn visit_dir(
    dir: &Path,
    groups: &BTreeMap<String, Vec<Host>>,
    endpoints: &mut BTreeMap<String, Endpoint>,
) -> Result<(), Error> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::config(format!("Could not read endpoint directory {}: {e}", dir.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::config(format!("Could not read endpoint directory: {e}")))?;
        let path = entry.path();
        if path.is_dir() {
            visit_dir(&path, groups, endpoints)?;
            continue;
        }

        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        // files starting with an underscore are disabled
        if name.starts_with('_') {
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml" | "conf") => {}
            _ => continue,
        }

        debug!("Loading endpoint config {}.", path.display());
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::config(format!("Failed reading {}: {e}", path.display())))?;
        let config: EndpointConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::config(format!("Failure parsing {}: {e}", path.display())))?;

        if builtin_method(&name).is_some() {
            return Err(Error::config(format!(
                "Endpoint name '{name}' collides with a built-in endpoint."
            )));
        }
        if endpoints.contains_key(&name) {
            return Err(Error::config(format!("Endpoint '{name}' is defined twice.")));
        }
        endpoints.insert(name.clone(), config.compile(&name, groups)?);
    }
    Ok(())
}

/// Internal forwards and on-failure actions must reference an endpoint that
/// exists (configured or built-in).
fn validate_references(endpoints: &BTreeMap<String, Endpoint>) -> Result<(), Error> {
    let exists = |name: &str| endpoints.contains_key(name) || builtin_method(name).is_some();
    for endpoint in endpoints.values() {
        let coco_targets = endpoint
            .before
            .iter()
            .chain(&endpoint.after)
            .chain(&endpoint.coco_forwards)
            .map(|f| &f.name);
        for target in coco_targets {
            if !exists(target) {
                return Err(Error::config(format!(
                    "Endpoint '{}' forwards to unknown endpoint '{target}'.",
                    endpoint.name
                )));
            }
        }
        let failure_targets = endpoint
            .external_forwards
            .iter()
            .map(|f| &f.on_failure)
            .chain(
                endpoint
                    .before
                    .iter()
                    .chain(&endpoint.after)
                    .chain(&endpoint.coco_forwards)
                    .map(|f| &f.on_failure),
            )
            .flat_map(|f| f.call.iter().chain(f.call_single_host.iter()));
        for target in failure_targets {
            if !exists(target) {
                return Err(Error::config(format!(
                    "Endpoint '{}' has an on_failure action calling unknown endpoint '{target}'.",
                    endpoint.name
                )));
            }
        }
    }
    Ok(())
}
