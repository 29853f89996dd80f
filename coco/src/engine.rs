//! The endpoint engine.
//!
//! Interprets one endpoint definition into the ordered pipeline
//! before -> values filter -> state reads/writes -> external fan-out ->
//! reply checks -> internal recursion -> after -> post-state, producing a
//! structured [`EndpointResult`]. The engine is owned exclusively by the
//! worker task, so invocations are serialised; internal forwards recurse on
//! the same call stack.
//!
//! Failures observed during the pipeline (transport errors, failed checks,
//! rejected values) are folded into the result; only misuse raises a typed
//! [`Error`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::blocklist::Blocklist;
use crate::check::CheckSet;
use crate::endpoint::{
    CocoForward, Endpoint, HttpMethod, OnFailureConfig, builtin_method, json_type_name,
};
use crate::errors::Error;
use crate::forwarder::Forwarder;
use crate::result::{EndpointResult, Reply, ReportType};
use crate::state::{State, tree_write};
use crate::util::{Host, parse_duration};

/// Pseudo-host that built-in endpoint replies are reported under.
fn coco_host() -> Host {
    Host::parse("coco").unwrap_or_else(|_| Host::new("coco", 0))
}

pub struct Engine {
    endpoints: BTreeMap<String, Endpoint>,
    pub forwarder: Forwarder,
    pub state: State,
    pub blocklist: Blocklist,
}

impl Engine {
    pub fn new(
        endpoints: BTreeMap<String, Endpoint>,
        forwarder: Forwarder,
        state: State,
        blocklist: Blocklist,
    ) -> Self {
        Engine {
            endpoints,
            forwarder,
            state,
            blocklist,
        }
    }

    pub fn endpoints(&self) -> &BTreeMap<String, Endpoint> {
        &self.endpoints
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.get(name)
    }

    /// The method an endpoint (configured or built-in) accepts, if it exists.
    pub fn accepted_method(&self, name: &str) -> Option<HttpMethod> {
        builtin_method(name).or_else(|| self.endpoints.get(name).map(|e| e.method))
    }

    /// Invoke an endpoint. `hosts` restricts external fan-out (unless the
    /// endpoint enforces its group); `params` are passed through to the
    /// downstream calls as query parameters.
    pub fn call<'a>(
        &'a mut self,
        name: &'a str,
        request: Map<String, Value>,
        hosts: Option<Vec<Host>>,
        params: Vec<(String, String)>,
    ) -> BoxFuture<'a, Result<EndpointResult, Error>> {
        Box::pin(async move {
            if builtin_method(name).is_some() {
                return self.call_builtin(name, request).await;
            }
            let endpoint = self
                .endpoints
                .get(name)
                .cloned()
                .ok_or_else(|| Error::invalid_path(format!("Endpoint /{name} not found.")))?;
            self.run(endpoint, request, hosts, params).await
        })
    }

    async fn run(
        &mut self,
        endpoint: Endpoint,
        mut request: Map<String, Value>,
        hosts: Option<Vec<Host>>,
        params: Vec<(String, String)>,
    ) -> Result<EndpointResult, Error> {
        debug!("/{} called", endpoint.name);
        let hosts = if endpoint.enforce_group { None } else { hosts };

        let mut result = EndpointResult::new(endpoint.name.clone());
        result.set_report_type(endpoint.report_type);

        for forward in &endpoint.before {
            let sub = self
                .coco_forward(forward, Map::new(), hosts.clone(), Vec::new())
                .await?;
            result.embed(forward.name.clone(), sub);
        }

        // Only forward values we expect; a missing or mis-typed value rejects
        // the call with a single message.
        let mut consumed = Map::new();
        for (key, kind) in &endpoint.values {
            match request.remove(key) {
                None => {
                    let msg = format!("{} requires value '{key}'.", endpoint.name);
                    info!("{msg}");
                    result.add_message(msg);
                    result.set_success(false);
                    return Ok(result);
                }
                Some(value) if !kind.matches(&value) => {
                    let msg = format!(
                        "{} received value '{key}' of type {} (expected {}).",
                        endpoint.name,
                        json_type_name(&value),
                        kind.name()
                    );
                    info!("{msg}");
                    result.add_message(msg);
                    result.set_success(false);
                    return Ok(result);
                }
                Some(value) => {
                    consumed.insert(key.clone(), value);
                }
            }
        }

        if !endpoint.save_state.is_empty() && !consumed.is_empty() {
            let paths = endpoint.save_state.clone();
            let values = consumed.clone();
            self.state.update(|tree| {
                for path in &paths {
                    for (key, value) in &values {
                        tree_write(tree, path, Some(key), value.clone())?;
                    }
                }
                Ok(())
            })?;
        }

        // Values from the state fill in whatever the request didn't carry.
        let filtered = if let Some(path) = &endpoint.send_state {
            let mut from_state = match self.state.read(path)? {
                Value::Object(map) => map,
                other => {
                    return Err(Error::internal(format!(
                        "State path '{path}' configured in 'send_state' holds a {} (expected dict).",
                        json_type_name(&other)
                    )));
                }
            };
            from_state.extend(consumed);
            from_state
        } else {
            consumed
        };

        for forward in &endpoint.external_forwards {
            let group_hosts = self
                .forwarder
                .group(&forward.group)
                .map(<[Host]>::to_vec)
                .unwrap_or_default();
            let targets = hosts.clone().unwrap_or(group_hosts);
            let timeout = forward
                .timeout
                .or(endpoint.timeout)
                .unwrap_or_else(|| self.forwarder.default_timeout());

            let replies = self
                .forwarder
                .external(
                    &forward.name,
                    endpoint.method,
                    &filtered,
                    &targets,
                    &params,
                    timeout,
                    &self.blocklist,
                )
                .await;

            let mut fwd_result = EndpointResult::with_replies(forward.name.clone(), replies.clone());
            let failed_hosts =
                self.run_checks(&forward.checks, &replies, &forward.name, &mut fwd_result);
            if let Some(failed_hosts) = failed_hosts {
                fwd_result.set_success(false);
                if let Some(actions) = self
                    .on_failure_result(&forward.on_failure, &failed_hosts)
                    .await?
                {
                    fwd_result.embed(forward.name.clone(), actions);
                }
            } else if let Some(path) = &forward.save_reply_to_state {
                self.save_reply(path, &replies)?;
            }
            result.add_result(fwd_result);
        }

        for forward in &endpoint.coco_forwards {
            let sub_request = forward.request.clone().unwrap_or_else(|| filtered.clone());
            let sub = self
                .coco_forward(forward, sub_request, hosts.clone(), params.clone())
                .await?;
            result.embed(forward.name.clone(), sub);
        }

        // A report type in the request overrides the configured one.
        if let Some(raw) = request.remove("coco_report_type") {
            match raw.as_str().map(|s| s.parse::<ReportType>()) {
                Some(Ok(report_type)) => result.set_report_type(report_type),
                _ => return Err(Error::invalid_usage(format!("Unknown report type: {raw}"))),
            }
        }

        // Anything left in the request was not expected; report it.
        for key in request.keys() {
            let msg = format!("Found additional value '{key}' in request to /{}.", endpoint.name);
            info!("{msg}");
            result.add_message(msg);
        }

        for forward in &endpoint.after {
            let sub = self
                .coco_forward(forward, Map::new(), hosts.clone(), Vec::new())
                .await?;
            result.embed(forward.name.clone(), sub);
        }

        if let Some(path) = &endpoint.get_state {
            result.attach_state(self.state.extract(path)?);
        }

        if result.success() {
            self.finalise_state(&endpoint)?;
        }

        Ok(result)
    }

    /// Run an internal forward: recurse into the named endpoint, then apply
    /// the forward's checks to the merged replies of the sub-result.
    fn coco_forward<'a>(
        &'a mut self,
        forward: &'a CocoForward,
        request: Map<String, Value>,
        hosts: Option<Vec<Host>>,
        params: Vec<(String, String)>,
    ) -> BoxFuture<'a, Result<EndpointResult, Error>> {
        Box::pin(async move {
            let mut sub = self.call(&forward.name, request, hosts, params).await?;
            if forward.checks.is_empty() {
                return Ok(sub);
            }
            let replies = sub.merged_replies();
            let failed_hosts = self.run_checks(&forward.checks, &replies, &forward.name, &mut sub);
            if let Some(failed_hosts) = failed_hosts {
                sub.set_success(false);
                if let Some(actions) = self
                    .on_failure_result(&forward.on_failure, &failed_hosts)
                    .await?
                {
                    sub.embed(forward.name.clone(), actions);
                }
            } else if let Some(path) = &forward.save_reply_to_state {
                self.save_reply(path, &replies)?;
            }
            Ok(sub)
        })
    }

    /// Run every check of a call-spec, recording failures into the result.
    /// Returns the union of failing hosts if any check failed.
    fn run_checks(
        &self,
        checks: &CheckSet,
        replies: &BTreeMap<Host, Reply>,
        forward_name: &str,
        result: &mut EndpointResult,
    ) -> Option<BTreeSet<Host>> {
        let mut failed_hosts = BTreeSet::new();
        let mut any_failed = false;
        for check in checks.iter() {
            let outcome = check.run(replies, &self.state);
            if !outcome.passed() {
                any_failed = true;
                for failure in &outcome.failures {
                    result.report_failure(forward_name, failure.host.url(), failure.kind, &failure.field);
                }
                failed_hosts.extend(outcome.failed_hosts);
            }
        }
        any_failed.then_some(failed_hosts)
    }

    /// Run the on-failure actions of a call-spec. `call` is invoked with no
    /// host restriction; `call_single_host` is restricted to the failing
    /// hosts and not invoked at all when that set is empty.
    fn on_failure_result<'a>(
        &'a mut self,
        on_failure: &'a OnFailureConfig,
        failed_hosts: &'a BTreeSet<Host>,
    ) -> BoxFuture<'a, Result<Option<EndpointResult>, Error>> {
        Box::pin(async move {
            let mut result = EndpointResult::new("on_failure");
            let mut any = false;
            if let Some(callee) = &on_failure.call {
                debug!("Calling /{callee} because a check failed.");
                let sub = self.call(callee, Map::new(), None, Vec::new()).await?;
                result.embed(callee.clone(), sub);
                any = true;
            }
            if let Some(callee) = &on_failure.call_single_host {
                if failed_hosts.is_empty() {
                    debug!("Not calling /{callee}: the failing host set is empty.");
                } else {
                    debug!("Calling /{callee} on {} failing host(s).", failed_hosts.len());
                    let restricted: Vec<Host> = failed_hosts.iter().cloned().collect();
                    let sub = self.call(callee, Map::new(), Some(restricted), Vec::new()).await?;
                    result.embed(callee.clone(), sub);
                    any = true;
                }
            }
            Ok(any.then_some(result))
        })
    }

    /// Merge per-host object replies into the configured state path;
    /// last writer wins across hosts.
    fn save_reply(&mut self, path: &str, replies: &BTreeMap<Host, Reply>) -> Result<(), Error> {
        let mut merged = Map::new();
        for reply in replies.values() {
            if let Value::Object(map) = &reply.body {
                merged.extend(map.clone());
            }
        }
        self.state.write(path, Value::Object(merged), None)
    }

    /// Apply `set_state` and the timestamp write after a successful call.
    fn finalise_state(&mut self, endpoint: &Endpoint) -> Result<(), Error> {
        if endpoint.set_state.is_empty() && endpoint.timestamp_path.is_none() {
            return Ok(());
        }
        let set_state = endpoint.set_state.clone();
        let timestamp_path = endpoint.timestamp_path.clone();
        let name = endpoint.name.clone();
        self.state.update(|tree| {
            for (path, value) in &set_state {
                tree_write(tree, path, None, value.clone())?;
            }
            if let Some(path) = &timestamp_path {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_err(|e| Error::internal(format!("System clock error: {e}")))?
                    .as_secs_f64();
                tree_write(tree, path, None, json!(now))?;
                debug!("/{name} saved timestamp to state: {path}");
            }
            Ok(())
        })
    }

    // ----- built-in endpoints --------------------------------------------

    async fn call_builtin(
        &mut self,
        name: &str,
        request: Map<String, Value>,
    ) -> Result<EndpointResult, Error> {
        match name {
            "blocklist" => {
                let listed: Vec<String> = self.blocklist.hosts().iter().map(|h| h.to_string()).collect();
                Ok(full_reply("blocklist", json!(listed)))
            }
            "update-blocklist" => {
                self.update_blocklist(&request)?;
                Ok(EndpointResult::new("update-blocklist"))
            }
            "wait" => {
                let duration = match request.get("duration") {
                    Some(Value::String(raw)) => parse_duration(raw)?,
                    Some(Value::Number(n)) if n.as_u64().is_some() => {
                        std::time::Duration::from_secs(n.as_u64().unwrap_or(0))
                    }
                    Some(other) => {
                        return Err(Error::invalid_usage(format!(
                            "Value for duration is of type {} (expected str).",
                            json_type_name(other)
                        )));
                    }
                    None => return Err(Error::invalid_usage("No duration sent.")),
                };
                debug!("Suspending the worker for {duration:?}.");
                tokio::time::sleep(duration).await;
                Ok(EndpointResult::new("wait"))
            }
            "reset-state" => {
                self.state.reset()?;
                Ok(EndpointResult::new("reset-state"))
            }
            "save-state" => {
                let name = require_string(&request, "name")?;
                let overwrite = request
                    .get("overwrite")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.state.save_snapshot(name, overwrite)?;
                Ok(EndpointResult::new("save-state"))
            }
            "load-state" => {
                let name = require_string(&request, "name")?;
                self.state.load_snapshot(name)?;
                Ok(EndpointResult::new("load-state"))
            }
            "saved-states" => {
                let names = self.state.saved_names()?;
                Ok(full_reply("saved-states", json!(names)))
            }
            other => Err(Error::invalid_path(format!("Endpoint /{other} not found."))),
        }
    }

    fn update_blocklist(&mut self, request: &Map<String, Value>) -> Result<(), Error> {
        let command = request
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_usage("No blocklist command sent."))?;
        let hosts: Vec<String> = request
            .get("hosts")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        match command {
            "add" => self.blocklist.add_hosts(&hosts),
            "remove" => self.blocklist.remove_hosts(&hosts),
            "clear" => self.blocklist.clear_hosts(),
            other => Err(Error::invalid_usage(format!(
                "Unknown command {other}. Supported commands are add, remove, clear."
            ))),
        }
    }
}

/// A built-in reply, reported like a FULL projection under the controller's
/// own pseudo-host.
fn full_reply(name: &str, body: Value) -> EndpointResult {
    let mut replies = BTreeMap::new();
    replies.insert(coco_host(), Reply::new(body, 200));
    let mut result = EndpointResult::with_replies(name, replies);
    result.set_report_type(ReportType::Full);
    result
}

fn require_string<'r>(request: &'r Map<String, Value>, key: &str) -> Result<&'r str, Error> {
    request
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_usage(format!("No {key} sent.")))
}
