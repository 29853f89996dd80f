//! The worker: the single consumer of the request queue.
//!
//! The worker owns the endpoint engine (and through it the state store, the
//! blocklist and the forwarder), so every endpoint invocation is serialised.
//! For each entry it validates the request at the HTTP boundary (endpoint
//! exists, method matches, body is JSON, declared values are present and
//! well-typed, preconditions hold), invokes the engine and delivers exactly
//! one `(report, status)` pair through the entry's response channel. Typed
//! errors map to their HTTP codes; anything unexpected becomes a 500 with
//! the details kept in the logs.

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::engine::Engine;
use crate::errors::Error;
use crate::metrics;
use crate::queue::{QueueEntry, QueueMessage, QueueReceiver};
use crate::result::ReportType;

/// How long a blocking pop waits before logging an idle tick.
const IDLE_POP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Worker {
    engine: Engine,
    queue: QueueReceiver,
}

impl Worker {
    pub fn new(engine: Engine, queue: QueueReceiver) -> Self {
        Worker { engine, queue }
    }

    /// Consume the queue until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Worker started.");
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = tokio::time::timeout(IDLE_POP_TIMEOUT, self.queue.recv()) => message,
            };
            match message {
                Err(_) => {
                    trace!("Queue idle.");
                    continue;
                }
                Ok(None) | Ok(Some(QueueMessage::Shutdown)) => break,
                Ok(Some(QueueMessage::Request(entry))) => self.serve(*entry).await,
            }
        }
        info!("Worker stopped.");
    }

    async fn serve(&mut self, entry: QueueEntry) {
        let QueueEntry {
            id,
            method,
            endpoint,
            body,
            query,
            respond_to,
        } = entry;
        debug!("[{id}] Calling /{endpoint}");
        metrics::record_request(&endpoint);

        let response = match self.handle(method, &endpoint, &body, query).await {
            Ok(response) => response,
            Err(e) => {
                if e.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
                    error!("[{id}] /{endpoint} failed: {e}");
                } else {
                    debug!("[{id}] /{endpoint} rejected: {e}");
                }
                (e.to_body(), e.status_code())
            }
        };
        // the client may have gone away; nothing to do about it
        let _ = respond_to.send(response);
    }

    async fn handle(
        &mut self,
        method: crate::endpoint::HttpMethod,
        endpoint: &str,
        body: &[u8],
        query: Vec<(String, String)>,
    ) -> Result<(Value, StatusCode), Error> {
        let accepted = self
            .engine
            .accepted_method(endpoint)
            .ok_or_else(|| Error::invalid_path(format!("Endpoint /{endpoint} not found.")))?;
        if method != accepted {
            return Err(Error::invalid_method(format!(
                "Endpoint /{endpoint} accepts {} requests (received {}).",
                accepted.as_str(),
                method.as_str()
            )));
        }

        let request = parse_body(body)?;
        let (report_override, params) = split_query(query)?;

        if let Some(definition) = self.engine.endpoint(endpoint) {
            // boundary validation of declared values
            for (key, kind) in &definition.values {
                match request.get(key) {
                    None => {
                        return Err(Error::invalid_usage(format!(
                            "{endpoint} requires value '{key}'."
                        )));
                    }
                    Some(value) if !kind.matches(value) => {
                        return Err(Error::invalid_usage(format!(
                            "{endpoint} received value '{key}' of type {} (expected {}).",
                            crate::endpoint::json_type_name(value),
                            kind.name()
                        )));
                    }
                    Some(_) => {}
                }
            }

            if let Some(tree) = self.engine.state.lookup("") {
                for condition in &definition.conditions {
                    if let Err(reason) = condition.check(tree) {
                        return Err(Error::precondition_failed(format!(
                            "Condition for /{endpoint} not met: {reason}."
                        )));
                    }
                }
            }
        }

        let result = self.engine.call(endpoint, request, None, params).await?;
        Ok((result.report(report_override), StatusCode::OK))
    }
}

fn parse_body(body: &[u8]) -> Result<Map<String, Value>, Error> {
    if body.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(Error::invalid_usage(format!(
            "Request body must be a JSON object (got {}).",
            crate::endpoint::json_type_name(&other)
        ))),
        Err(e) => Err(Error::invalid_usage(format!("Invalid JSON payload: {e}"))),
    }
}

/// Pull `coco_report_type` out of the query string; everything else is
/// passed through to the downstream calls.
fn split_query(
    query: Vec<(String, String)>,
) -> Result<(Option<ReportType>, Vec<(String, String)>), Error> {
    let mut report = None;
    let mut params = Vec::with_capacity(query.len());
    for (key, value) in query {
        if key == "coco_report_type" {
            report = Some(
                value
                    .parse()
                    .map_err(|e: String| Error::invalid_usage(e))?,
            );
        } else {
            params.push((key, value));
        }
    }
    Ok((report, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_parsing_accepts_empty_and_objects_only() {
        assert!(parse_body(b"").unwrap().is_empty());
        assert!(parse_body(b"null").unwrap().is_empty());
        assert_eq!(parse_body(br#"{"a": 1}"#).unwrap()["a"], 1);
        assert!(parse_body(b"[1, 2]").is_err());
        assert!(parse_body(b"{not json").is_err());
    }

    #[test]
    fn report_type_is_extracted_from_the_query() {
        let query = vec![
            ("coco_report_type".to_string(), "FULL".to_string()),
            ("verbose".to_string(), "1".to_string()),
        ];
        let (report, params) = split_query(query).unwrap();
        assert_eq!(report, Some(ReportType::Full));
        assert_eq!(params, vec![("verbose".to_string(), "1".to_string())]);

        let bad = vec![("coco_report_type".to_string(), "LOUD".to_string())];
        assert!(split_query(bad).is_err());
    }
}
