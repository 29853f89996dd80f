//! Fan-out of endpoint calls to host groups.
//!
//! The forwarder owns the shared HTTP client and the static group table. A
//! fan-out dispatches to every non-blocklisted target concurrently, bounded
//! by `session_limit` in-flight requests, and never raises: connection
//! failures and timeouts are folded into the per-host reply with the
//! synthetic status `0`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream;
use serde_json::{Map, Value};
use tracing::debug;

use crate::blocklist::Blocklist;
use crate::endpoint::HttpMethod;
use crate::errors::Error;
use crate::metrics;
use crate::result::Reply;
use crate::util::Host;

pub struct Forwarder {
    client: reqwest::Client,
    groups: BTreeMap<String, Vec<Host>>,
    session_limit: usize,
    default_timeout: Duration,
}

impl Forwarder {
    pub fn new(
        groups: BTreeMap<String, Vec<Host>>,
        session_limit: usize,
        default_timeout: Duration,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Forwarder {
            client,
            groups,
            session_limit: session_limit.max(1),
            default_timeout,
        })
    }

    pub fn group(&self, name: &str) -> Option<&[Host]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    /// Union of all group members.
    pub fn known_hosts(&self) -> BTreeSet<Host> {
        self.groups.values().flatten().cloned().collect()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Fan an endpoint call out to `hosts`, skipping blocklisted ones.
    /// Returns one reply per dispatched host.
    pub async fn external(
        &self,
        endpoint: &str,
        method: HttpMethod,
        request: &Map<String, Value>,
        hosts: &[Host],
        params: &[(String, String)],
        timeout: Duration,
        blocklist: &Blocklist,
    ) -> BTreeMap<Host, Reply> {
        let targets: Vec<&Host> = hosts.iter().filter(|host| !blocklist.contains(host)).collect();
        if targets.len() < hosts.len() {
            debug!(
                "Skipping {} blocklisted host(s) for /{endpoint}.",
                hosts.len() - targets.len()
            );
        }
        let mut dispatches = Vec::with_capacity(targets.len());
        for host in targets {
            dispatches.push(self.dispatch(endpoint, method, request, host, params, timeout));
        }
        stream::iter(dispatches)
            .buffer_unordered(self.session_limit)
        .collect::<Vec<(Host, Reply)>>()
        .await
        .into_iter()
        .collect()
    }

    async fn dispatch(
        &self,
        endpoint: &str,
        method: HttpMethod,
        request: &Map<String, Value>,
        host: &Host,
        params: &[(String, String)],
        timeout: Duration,
    ) -> (Host, Reply) {
        let url = host.endpoint_url(endpoint);
        let mut builder = self
            .client
            .request(method.into(), &url)
            .timeout(timeout)
            .json(request);
        if !params.is_empty() {
            builder = builder.query(params);
        }

        let start = Instant::now();
        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                metrics::record_call(endpoint, host, status);
                metrics::record_response_time(endpoint, host, start.elapsed().as_secs_f64());
                let text = response.text().await.unwrap_or_default();
                let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
                (host.clone(), Reply::new(body, status))
            }
            Err(e) => {
                metrics::record_call(endpoint, host, 0);
                let message = if e.is_timeout() {
                    "Timeout".to_string()
                } else {
                    e.to_string()
                };
                debug!("Forward to {url} failed: {message}");
                (host.clone(), Reply::new(Value::String(message), 0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn host_of(server: &MockServer) -> Host {
        let addr = server.address();
        Host::new(addr.ip().to_string(), addr.port())
    }

    fn empty_blocklist(dir: &TempDir, known: Vec<Host>) -> Blocklist {
        Blocklist::new(dir.path().join("blocklist.json"), known).unwrap()
    }

    fn forwarder(hosts: Vec<Host>) -> Forwarder {
        let groups = BTreeMap::from([("cluster".to_string(), hosts)]);
        Forwarder::new(groups, 1000, Duration::from_secs(10)).unwrap()
    }

    #[tokio::test]
    async fn fans_out_to_every_host_with_body_and_params() {
        let s1 = MockServer::start().await;
        let s2 = MockServer::start().await;
        for server in [&s1, &s2] {
            Mock::given(method("POST"))
                .and(path("/test"))
                .and(query_param("flag", "on"))
                .respond_with(|req: &Request| {
                    let body: Value = req.body_json().unwrap();
                    ResponseTemplate::new(200).set_body_json(body)
                })
                .mount(server)
                .await;
        }

        let hosts = vec![host_of(&s1), host_of(&s2)];
        let fwd = forwarder(hosts.clone());
        let dir = TempDir::new().unwrap();
        let blocklist = empty_blocklist(&dir, hosts.clone());

        let request = json!({"foo": 0, "bar": "1337"});
        let replies = fwd
            .external(
                "test",
                HttpMethod::Post,
                request.as_object().unwrap(),
                &hosts,
                &[("flag".to_string(), "on".to_string())],
                Duration::from_secs(5),
                &blocklist,
            )
            .await;

        assert_eq!(replies.len(), 2);
        for host in &hosts {
            let reply = &replies[host];
            assert_eq!(reply.status, 200);
            assert_eq!(reply.body, request);
        }
    }

    #[tokio::test]
    async fn timeouts_surface_as_status_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let hosts = vec![host_of(&server)];
        let fwd = forwarder(hosts.clone());
        let dir = TempDir::new().unwrap();
        let blocklist = empty_blocklist(&dir, hosts.clone());

        let replies = fwd
            .external(
                "slow",
                HttpMethod::Get,
                &Map::new(),
                &hosts,
                &[],
                Duration::from_millis(50),
                &blocklist,
            )
            .await;

        let reply = &replies[&hosts[0]];
        assert_eq!(reply.status, 0);
        assert_eq!(reply.body, json!("Timeout"));
    }

    #[tokio::test]
    async fn connection_failures_surface_as_status_zero() {
        // nothing is listening on this host
        let hosts = vec![Host::new("127.0.0.1", 1)];
        let fwd = forwarder(hosts.clone());
        let dir = TempDir::new().unwrap();
        let blocklist = empty_blocklist(&dir, hosts.clone());

        let replies = fwd
            .external(
                "test",
                HttpMethod::Get,
                &Map::new(),
                &hosts,
                &[],
                Duration::from_secs(1),
                &blocklist,
            )
            .await;
        assert_eq!(replies[&hosts[0]].status, 0);
    }

    #[tokio::test]
    async fn non_json_bodies_fall_back_to_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain text reply"))
            .mount(&server)
            .await;

        let hosts = vec![host_of(&server)];
        let fwd = forwarder(hosts.clone());
        let dir = TempDir::new().unwrap();
        let blocklist = empty_blocklist(&dir, hosts.clone());

        let replies = fwd
            .external(
                "test",
                HttpMethod::Get,
                &Map::new(),
                &hosts,
                &[],
                Duration::from_secs(5),
                &blocklist,
            )
            .await;
        assert_eq!(replies[&hosts[0]].body, json!("plain text reply"));
    }

    #[tokio::test]
    async fn blocklisted_hosts_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let reachable = host_of(&server);
        let blocked = Host::new("127.0.0.1", 1);
        let hosts = vec![reachable.clone(), blocked.clone()];
        let fwd = forwarder(hosts.clone());

        let dir = TempDir::new().unwrap();
        let mut blocklist = empty_blocklist(&dir, hosts.clone());
        blocklist.add_hosts(&[blocked.to_string()]).unwrap();

        let replies = fwd
            .external(
                "test",
                HttpMethod::Get,
                &Map::new(),
                &hosts,
                &[],
                Duration::from_secs(5),
                &blocklist,
            )
            .await;

        assert_eq!(replies.len(), 1);
        assert!(replies.contains_key(&reachable));
    }
}
