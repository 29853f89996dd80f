//! The HTTP frontend.
//!
//! The main router exposes every endpoint (configured and built-in) at
//! `GET|POST /<name>`. Handlers own nothing but a handle to the queue and the
//! endpoint registry: they enqueue the raw request and block on the entry's
//! response channel. When the bounded queue is full the request is answered
//! with 503 immediately and counted; it never reaches the worker.
//!
//! A second router serves the Prometheus text exposition on the metrics
//! port.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::endpoint::{BUILTIN_ENDPOINTS, Endpoint, HttpMethod};
use crate::errors::Error;
use crate::metrics;
use crate::queue::{PushError, QueueEntry, RequestQueue, entry_id};

/// Shared state of the frontend handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: RequestQueue,
    /// Endpoint name -> accepted method, for the pre-enqueue 404 check.
    pub registry: Arc<BTreeMap<String, HttpMethod>>,
}

/// The registry covers configured endpoints and the built-ins.
pub fn build_registry(endpoints: &BTreeMap<String, Endpoint>) -> BTreeMap<String, HttpMethod> {
    let mut registry: BTreeMap<String, HttpMethod> = BUILTIN_ENDPOINTS
        .iter()
        .map(|(name, method)| (name.to_string(), *method))
        .collect();
    for (name, endpoint) in endpoints {
        registry.insert(name.clone(), endpoint.method);
    }
    registry
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/{endpoint}", get(handle_endpoint).post(handle_endpoint))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}

async fn handle_endpoint(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    method: Method,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Response {
    let method = if method == Method::GET {
        HttpMethod::Get
    } else if method == Method::POST {
        HttpMethod::Post
    } else {
        return Error::invalid_method(format!("Method {method} is not supported.")).into_response();
    };

    // unknown endpoints are rejected before they ever touch the queue
    if !state.registry.contains_key(&endpoint) {
        return Error::invalid_path(format!("Endpoint /{endpoint} not found.")).into_response();
    }

    let query: Vec<(String, String)> = raw_query
        .as_deref()
        .map(|raw| url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let (respond_to, response) = oneshot::channel();
    let entry = QueueEntry {
        id: entry_id(),
        method,
        endpoint: endpoint.clone(),
        body: body.to_vec(),
        query,
        respond_to,
    };

    match state.queue.push(entry) {
        Ok(()) => {}
        Err(PushError::Full) => {
            debug!("Dropping request to /{endpoint}: the queue is full.");
            metrics::record_dropped_request(&endpoint);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "reply": "Coco queue is full.", "status": 503 })),
            )
                .into_response();
        }
        Err(PushError::Closed) => {
            return Error::internal("The worker is not running.").into_response();
        }
    }

    match response.await {
        Ok((report, status)) => (status, Json(report)).into_response(),
        Err(_) => Error::internal("The worker dropped the request.").into_response(),
    }
}
