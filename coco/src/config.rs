//! Application configuration.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides: variables prefixed `COCO_` override file values (use double
//! underscores for nested keys). The file path defaults to `coco.yaml` and
//! can be set with `-f` or the `COCO_CONFIG_FILE` environment variable.
//!
//! ```yaml
//! host: localhost
//! port: 12055
//! metrics_port: 9090
//! log_level: INFO
//! endpoint_dir: /etc/coco/endpoints
//! blocklist_path: /var/lib/coco/blocklist.json
//! storage_path: /var/lib/coco/state
//! groups:
//!   cluster:
//!     - localhost:12050
//!     - localhost:12000
//!   receiver_nodes:
//!     - recv1:12048
//!     - recv2:12048
//! load_state:
//!   cluster: /etc/coco/gpu.yaml
//! queue_length: 0
//! timeout: 10s
//! frontend_timeout: 10m
//! exclude_from_reset:
//!   - this/should/be/preserved
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::Deserialize;

use crate::errors::Error;
use crate::slack::SlackRule;
use crate::util::Host;

/// Simple CLI args - just for specifying the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "COCO_CONFIG_FILE", default_value = "coco.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the controller.
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Hostname the frontend binds and the scheduler calls back on.
    pub host: String,
    /// Frontend port.
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Port for the Prometheus exposition.
    #[serde(default = "defaults::metrics_port")]
    pub metrics_port: u16,
    /// Default log level, overridable with `RUST_LOG`.
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Directory of endpoint definition files.
    pub endpoint_dir: PathBuf,
    /// Frontend HTTP worker parallelism. Kept for config compatibility; the
    /// async frontend sizes itself.
    #[serde(default = "defaults::n_workers")]
    pub n_workers: usize,
    /// Maximum concurrent in-flight requests per fan-out.
    #[serde(default = "defaults::session_limit")]
    pub session_limit: usize,
    /// Where the blocklist document lives (absolute path).
    pub blocklist_path: PathBuf,
    /// Directory for the active state and named snapshots.
    pub storage_path: PathBuf,
    /// Host groups that endpoints fan out to, as `host:port` strings.
    pub groups: BTreeMap<String, Vec<String>>,
    /// Initial state: state path -> YAML file.
    #[serde(default)]
    pub load_state: BTreeMap<String, PathBuf>,
    /// Slack bot token; log forwarding is disabled without it.
    #[serde(default)]
    pub slack_token: Option<String>,
    /// Rules for dispatching log messages to Slack channels.
    #[serde(default)]
    pub slack_rules: Vec<SlackRule>,
    /// Request queue length; 0 means unbounded.
    #[serde(default)]
    pub queue_length: usize,
    /// Timeout for requests sent to nodes.
    #[serde(default = "defaults::timeout", with = "crate::util::flex_duration")]
    pub timeout: Duration,
    /// Timeout for scheduler-initiated requests to coco itself. Should exceed
    /// the longest chain of layered forward calls.
    #[serde(default = "defaults::frontend_timeout", with = "crate::util::flex_duration")]
    pub frontend_timeout: Duration,
    /// State paths preserved across reset and snapshot loads.
    #[serde(default)]
    pub exclude_from_reset: Vec<String>,
}

mod defaults {
    use std::time::Duration;

    pub fn port() -> u16 {
        12055
    }
    pub fn metrics_port() -> u16 {
        9090
    }
    pub fn log_level() -> String {
        "INFO".to_string()
    }
    pub fn n_workers() -> usize {
        1
    }
    pub fn session_limit() -> usize {
        1000
    }
    pub fn timeout() -> Duration {
        Duration::from_secs(10)
    }
    pub fn frontend_timeout() -> Duration {
        Duration::from_secs(600)
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, Error> {
        let config: Config = Self::figment(args)
            .extract()
            .map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("COCO_").split("__"))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.groups.is_empty() {
            return Err(Error::config("Config key 'groups' must not be empty."));
        }
        if !self.blocklist_path.is_absolute() {
            return Err(Error::config(format!(
                "Config key 'blocklist_path' must be an absolute path (got {}).",
                self.blocklist_path.display()
            )));
        }
        if self.n_workers == 0 {
            return Err(Error::config("Config key 'n_workers' must be at least 1."));
        }
        self.parsed_groups().map(|_| ())
    }

    /// The group table with every member parsed; each needs an explicit port.
    pub fn parsed_groups(&self) -> Result<BTreeMap<String, Vec<Host>>, Error> {
        let mut parsed = BTreeMap::new();
        for (name, members) in &self.groups {
            let mut hosts = Vec::with_capacity(members.len());
            for member in members {
                let host = Host::parse(member)
                    .map_err(|e| Error::config(format!("In group '{name}': {e}")))?;
                if host.port().is_none() {
                    return Err(Error::config(format!(
                        "Host '{member}' in group '{name}' is missing a port."
                    )));
                }
                hosts.push(host);
            }
            parsed.insert(name.clone(), hosts);
        }
        Ok(parsed)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_bind_address(&self) -> String {
        format!("{}:{}", self.host, self.metrics_port)
    }

    /// The controller's own frontend URL, used by the scheduler.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}
