//! # coco: a configuration controller
//!
//! `coco` sits in front of a fleet of long-running worker daemons (nodes) and
//! turns operator-authored, declarative endpoint definitions into coordinated
//! fan-out HTTP actions against that fleet: state management, reply
//! validation, scheduled re-application and overload protection included.
//!
//! ## Architecture
//!
//! The controller is a single tokio process with two halves joined by a
//! bounded queue:
//!
//! - The **frontend** ([`api`]) is an [Axum](https://github.com/tokio-rs/axum)
//!   server exposing every endpoint at `GET|POST /<name>`. Handlers own
//!   nothing but a queue handle: they enqueue the raw request and wait for
//!   the correlated response. Admission against the configured queue length
//!   happens atomically with the enqueue; a full queue answers 503
//!   immediately and bumps the drop counter.
//! - The single **worker** ([`worker`]) consumes the queue in FIFO order and
//!   owns the endpoint engine ([`engine`]) together with the state store
//!   ([`state`]), the blocklist ([`blocklist`]) and the fan-out forwarder
//!   ([`forwarder`]). All endpoint execution is therefore serialised; an
//!   endpoint's internal forwards recurse on the same call stack.
//!
//! The [`scheduler`] runs timer tasks that re-invoke endpoints through the
//! frontend, so scheduled calls observe the same backpressure and metrics as
//! external clients. A second listener serves the Prometheus exposition.
//!
//! ## Quick start
//!
//! ```no_run
//! use clap::Parser;
//! use coco::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = coco::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     coco::telemetry::init_telemetry(&config.log_level, None)?;
//!
//!     Application::new(config)?
//!         .serve(async {
//!             tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!         })
//!         .await
//! }
//! ```

pub mod api;
pub mod blocklist;
pub mod check;
pub mod condition;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod errors;
pub mod forwarder;
pub mod metrics;
pub mod queue;
pub mod result;
pub mod scheduler;
pub mod slack;
pub mod state;
pub mod telemetry;
pub mod util;
pub mod worker;

#[cfg(test)]
mod test;

use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::blocklist::Blocklist;
use crate::endpoint::Endpoint;
use crate::engine::Engine;
use crate::forwarder::Forwarder;
use crate::queue::{QueueEntry, RequestQueue, entry_id};
use crate::scheduler::Scheduler;
use crate::state::{State, StateReader};
use crate::worker::Worker;

pub use config::Config;
pub use errors::Error;

/// The assembled controller: frontend routers, queue, worker and scheduler,
/// ready to serve.
pub struct Application {
    config: Config,
    endpoints: BTreeMap<String, Endpoint>,
    router: Router,
    metrics_router: Router,
    queue: RequestQueue,
    worker: Option<Worker>,
    state_reader: StateReader,
    shutdown_token: CancellationToken,
}

impl Application {
    /// Wire everything up from the configuration: load endpoint definitions,
    /// open the state store and blocklist, build the engine and the queue.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let metrics_handle = metrics::get_or_install_recorder();

        let groups = config.parsed_groups()?;
        let endpoints = endpoint::load_endpoints(&config.endpoint_dir, &groups)?;
        info!("Loaded {} endpoint definition(s).", endpoints.len());

        let state = State::new(
            &config.storage_path,
            config.load_state.clone(),
            config.exclude_from_reset.clone(),
        )?;
        let state_reader = state.reader();
        let known_hosts: Vec<_> = groups.values().flatten().cloned().collect();
        let blocklist = Blocklist::new(config.blocklist_path.clone(), known_hosts)?;
        let forwarder = Forwarder::new(groups, config.session_limit, config.timeout)?;
        let engine = Engine::new(endpoints.clone(), forwarder, state, blocklist);

        let (queue, receiver) = RequestQueue::new(config.queue_length);
        let worker = Worker::new(engine, receiver);

        let app_state = AppState {
            queue: queue.clone(),
            registry: Arc::new(api::build_registry(&endpoints)),
        };

        Ok(Application {
            router: api::router(app_state),
            metrics_router: api::metrics_router(metrics_handle),
            config,
            endpoints,
            queue,
            worker: Some(worker),
            state_reader,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Run the controller until `shutdown` resolves, then wind everything
    /// down: cancel the scheduler, drain the worker, stop both listeners.
    pub async fn serve<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown_token.clone();

        let worker = self
            .worker
            .take()
            .ok_or_else(|| anyhow::anyhow!("Application already served"))?;
        let worker_handle = tokio::spawn(worker.run(token.clone()));

        let scheduler = Scheduler::start(
            self.endpoints.values(),
            &self.config.base_url(),
            self.config.frontend_timeout,
            self.state_reader.clone(),
            token.clone(),
        );

        self.issue_startup_calls();

        let listener = TcpListener::bind(&self.config.bind_address()).await?;
        info!("Coco listening on http://{}", self.config.bind_address());
        let metrics_listener = TcpListener::bind(&self.config.metrics_bind_address()).await?;
        info!("Metrics exposed on http://{}/metrics", self.config.metrics_bind_address());

        let server = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .into_future();
        let metrics_server = axum::serve(metrics_listener, self.metrics_router.clone())
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .into_future();

        let server_error: Option<anyhow::Error> = tokio::select! {
            result = server => result.err().map(Into::into),
            result = metrics_server => result.err().map(Into::into),
            _ = shutdown => None,
        };

        info!("Shutting down...");
        token.cancel();
        self.queue.send_shutdown();
        scheduler.drain().await;
        let _ = worker_handle.await;

        if let Some(e) = server_error {
            return Err(e);
        }
        Ok(())
    }

    /// Enqueue every `call_on_start` endpoint once, like a client would.
    fn issue_startup_calls(&self) {
        for endpoint in self.endpoints.values().filter(|e| e.call_on_start) {
            let (respond_to, response) = oneshot::channel();
            let entry = QueueEntry {
                id: entry_id(),
                method: endpoint.method,
                endpoint: endpoint.name.clone(),
                body: Vec::new(),
                query: Vec::new(),
                respond_to,
            };
            let name = endpoint.name.clone();
            if self.queue.push(entry).is_err() {
                warn!("Could not enqueue startup call to /{name}.");
                continue;
            }
            tokio::spawn(async move {
                match response.await {
                    Ok((_, code)) if code.is_success() => {
                        debug!("Startup call to /{name} succeeded.");
                    }
                    Ok((body, code)) => {
                        warn!("Startup call to /{name} failed ({code}): {body}");
                    }
                    Err(_) => {}
                }
            });
        }
    }
}
