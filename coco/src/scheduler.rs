//! Timer-driven re-invocation of endpoints.
//!
//! Every endpoint with a `schedule` block gets its own timer task. A tick
//! first evaluates the endpoint's state predicates against the last committed
//! state snapshot; if any is unmet the tick is skipped silently. Firing means
//! issuing a real HTTP request to the controller's own frontend, exactly like
//! an external client, so scheduled calls observe queue backpressure and show
//! up in the metrics like everything else.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::endpoint::{Endpoint, HttpMethod};
use crate::state::StateReader;

struct EndpointTimer {
    name: String,
    method: HttpMethod,
    url: String,
    period: Duration,
    conditions: Vec<crate::condition::Condition>,
}

pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start one timer per scheduled endpoint. `base_url` is the
    /// controller's own frontend (`http://host:port`).
    pub fn start<'e>(
        endpoints: impl IntoIterator<Item = &'e Endpoint>,
        base_url: &str,
        frontend_timeout: Duration,
        state: StateReader,
        shutdown: CancellationToken,
    ) -> Scheduler {
        let client = reqwest::Client::new();
        let mut tasks = Vec::new();

        for endpoint in endpoints {
            let Some(schedule) = &endpoint.schedule else {
                continue;
            };
            // the endpoint's own preconditions gate the timer as well
            let mut conditions = schedule.conditions.clone();
            conditions.extend(endpoint.conditions.iter().cloned());

            let timer = EndpointTimer {
                name: endpoint.name.clone(),
                method: endpoint.method,
                url: format!("{}/{}", base_url.trim_end_matches('/'), endpoint.name),
                period: schedule.period,
                conditions,
            };
            debug!("Setting timer '{}' every {:?}.", timer.name, timer.period);
            tasks.push(tokio::spawn(run_timer(
                timer,
                client.clone(),
                frontend_timeout,
                state.clone(),
                shutdown.clone(),
            )));
        }
        if !tasks.is_empty() {
            info!("Scheduler started with {} timer(s).", tasks.len());
        }
        Scheduler { tasks }
    }

    /// Cancellation happens through the shared token; this waits for the
    /// timer tasks to wind down.
    pub async fn drain(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn run_timer(
    timer: EndpointTimer,
    client: reqwest::Client,
    frontend_timeout: Duration,
    state: StateReader,
    shutdown: CancellationToken,
) {
    let mut last_fire = Instant::now();
    loop {
        let wait = timer.period.saturating_sub(last_fire.elapsed());
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Cancelled timer '{}'.", timer.name);
                break;
            }
            _ = tokio::time::sleep(wait) => {}
        }
        last_fire = Instant::now();

        let snapshot = state.snapshot();
        let unmet = timer
            .conditions
            .iter()
            .find_map(|c| c.check(&snapshot).err());
        if let Some(reason) = unmet {
            debug!("Skipping scheduled call to /{}: {reason}.", timer.name);
            continue;
        }

        let outcome = client
            .request(timer.method.into(), &timer.url)
            .timeout(frontend_timeout)
            .send()
            .await;
        match outcome {
            Ok(response) if response.status().as_u16() == 200 => {}
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                error!("Scheduled endpoint call (/{}) failed ({status}): {text}", timer.name);
            }
            Err(e) if e.is_timeout() => {
                error!("Coco timed out at scheduled endpoint /{}.", timer.name);
            }
            Err(e) => {
                error!("Scheduled endpoint call (/{}) failed: {e}", timer.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointConfig, Schedule};
    use crate::state::State;
    use axum::{Router, routing::get};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn scheduled_endpoint(name: &str, period: Duration) -> Endpoint {
        let config: EndpointConfig = serde_yaml::from_str("call:\n  forward: null\n").unwrap();
        let mut endpoint = config.compile(name, &BTreeMap::new()).unwrap();
        endpoint.schedule = Some(Schedule {
            period,
            conditions: Vec::new(),
        });
        endpoint
    }

    async fn counting_frontend() -> (String, Arc<AtomicUsize>, JoinHandle<()>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/{endpoint}",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { "{}" }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), hits, server)
    }

    #[tokio::test]
    async fn timers_fire_through_the_frontend() {
        let (base_url, hits, server) = counting_frontend().await;
        let dir = TempDir::new().unwrap();
        let state = State::new(dir.path(), BTreeMap::new(), Vec::new()).unwrap();

        let endpoint = scheduled_endpoint("tick", Duration::from_millis(30));
        let token = CancellationToken::new();
        let scheduler = Scheduler::start(
            [&endpoint],
            &base_url,
            Duration::from_secs(1),
            state.reader(),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        scheduler.drain().await;
        server.abort();

        assert!(hits.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn unmet_conditions_skip_the_tick() {
        let (base_url, hits, server) = counting_frontend().await;
        let dir = TempDir::new().unwrap();
        let state = State::new(dir.path(), BTreeMap::new(), Vec::new()).unwrap();

        let mut endpoint = scheduled_endpoint("tick", Duration::from_millis(20));
        endpoint.schedule = Some(Schedule {
            period: Duration::from_millis(20),
            conditions: vec![crate::condition::Condition {
                path: "run/enabled".into(),
                kind: crate::endpoint::ValueKind::Bool,
                value: Some(json!(true)),
            }],
        });

        let token = CancellationToken::new();
        let scheduler = Scheduler::start(
            [&endpoint],
            &base_url,
            Duration::from_secs(1),
            state.reader(),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        token.cancel();
        scheduler.drain().await;
        server.abort();

        // the gate was never satisfied, so the frontend was never called
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn satisfied_conditions_let_the_timer_fire() {
        let (base_url, hits, server) = counting_frontend().await;
        let dir = TempDir::new().unwrap();
        let mut state = State::new(dir.path(), BTreeMap::new(), Vec::new()).unwrap();
        state.write("run/enabled", json!(true), None).unwrap();

        let mut endpoint = scheduled_endpoint("tick", Duration::from_millis(20));
        endpoint.schedule = Some(Schedule {
            period: Duration::from_millis(20),
            conditions: vec![crate::condition::Condition {
                path: "run/enabled".into(),
                kind: crate::endpoint::ValueKind::Bool,
                value: Some(json!(true)),
            }],
        });

        let token = CancellationToken::new();
        let scheduler = Scheduler::start(
            [&endpoint],
            &base_url,
            Duration::from_secs(1),
            state.reader(),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        token.cancel();
        scheduler.drain().await;
        server.abort();

        assert!(hits.load(Ordering::SeqCst) >= 1);
    }
}
