//! The host blocklist.
//!
//! Hosts on the blocklist are excluded from every external fan-out. The set
//! is persisted in its own document (separate from the state store, so state
//! resets and snapshot loads never touch operational host management) and is
//! only ever changed through all-or-nothing updates: if any argument of an
//! `add` or `remove` cannot be resolved to a unique known host, the whole
//! batch is rejected and the set stays as it was.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::errors::Error;
use crate::state::PersistentState;
use crate::util::Host;

/// Key under which the host list is persisted on disk.
const BLOCKLIST_KEY: &str = "blacklist_hosts";

pub struct Blocklist {
    storage: PersistentState,
    hosts: BTreeSet<Host>,
    known_hosts: BTreeSet<Host>,
    by_hostname: BTreeMap<String, BTreeSet<Host>>,
}

impl Blocklist {
    /// Open (or create) the blocklist at `path`. `known_hosts` is the union
    /// of all configured groups; arguments to add/remove must resolve against
    /// it.
    pub fn new(path: PathBuf, known_hosts: impl IntoIterator<Item = Host>) -> Result<Self, Error> {
        let mut storage = PersistentState::open(path)?;
        if !storage.is_initialised() {
            storage.replace(json!({ BLOCKLIST_KEY: [] }))?;
        }

        let mut blocklist = Blocklist {
            storage,
            hosts: BTreeSet::new(),
            known_hosts: BTreeSet::new(),
            by_hostname: BTreeMap::new(),
        };
        for host in known_hosts {
            blocklist
                .by_hostname
                .entry(host.hostname().to_string())
                .or_default()
                .insert(host.clone());
            blocklist.known_hosts.insert(host);
        }
        blocklist.rebuild_hosts()?;
        Ok(blocklist)
    }

    /// The currently blocklisted hosts.
    pub fn hosts(&self) -> &BTreeSet<Host> {
        &self.hosts
    }

    pub fn contains(&self, host: &Host) -> bool {
        self.hosts.contains(host)
    }

    /// Add hosts to the blocklist. Rejects the whole batch if any argument is
    /// unknown.
    pub fn add_hosts(&mut self, raw: &[String]) -> Result<(), Error> {
        let resolved = self.resolve_all(raw, "add to")?;
        let fresh: BTreeSet<Host> = resolved.difference(&self.hosts).cloned().collect();
        if fresh.is_empty() {
            debug!("Nothing to add to the blocklist.");
            return Ok(());
        }
        info!("Adding {} host(s) to the blocklist.", fresh.len());
        let updated: BTreeSet<Host> = self.hosts.union(&fresh).cloned().collect();
        self.persist(&updated)?;
        self.hosts = updated;
        Ok(())
    }

    /// Remove hosts from the blocklist. Rejects the whole batch if any
    /// argument is unknown.
    pub fn remove_hosts(&mut self, raw: &[String]) -> Result<(), Error> {
        let resolved = self.resolve_all(raw, "remove from")?;
        let present: BTreeSet<Host> = resolved.intersection(&self.hosts).cloned().collect();
        if present.is_empty() {
            debug!("Nothing to remove from the blocklist.");
            return Ok(());
        }
        info!("Removing {} host(s) from the blocklist.", present.len());
        let updated: BTreeSet<Host> = self.hosts.difference(&present).cloned().collect();
        self.persist(&updated)?;
        self.hosts = updated;
        Ok(())
    }

    /// Empty the blocklist unconditionally.
    pub fn clear_hosts(&mut self) -> Result<(), Error> {
        self.persist(&BTreeSet::new())?;
        self.hosts.clear();
        Ok(())
    }

    /// Resolve every argument against the known hosts, or fail with the bad
    /// ones in the error context.
    fn resolve_all(&self, raw: &[String], action: &str) -> Result<BTreeSet<Host>, Error> {
        let mut resolved = BTreeSet::new();
        let mut bad = Vec::new();
        for arg in raw {
            match self.resolve(arg) {
                Some(host) => {
                    resolved.insert(host);
                }
                None => bad.push(arg.clone()),
            }
        }
        if !bad.is_empty() {
            return Err(Error::invalid_usage_with(
                format!("Could not {action} blocklist as some hosts are unknown."),
                json!(bad),
            ));
        }
        Ok(resolved)
    }

    /// Resolve a `host:port` or bare-hostname argument to a known host.
    /// Bare hostnames resolve only if exactly one known host matches.
    fn resolve(&self, raw: &str) -> Option<Host> {
        let host = Host::parse(raw).ok()?;
        let candidates = self.by_hostname.get(host.hostname())?;
        match host.port() {
            Some(_) => candidates.get(&host).cloned(),
            None => {
                if candidates.len() == 1 {
                    candidates.iter().next().cloned()
                } else {
                    debug!(
                        "Cannot match hostname={} to a unique host:port combination ({} possibilities).",
                        host.hostname(),
                        candidates.len()
                    );
                    None
                }
            }
        }
    }

    fn persist(&mut self, hosts: &BTreeSet<Host>) -> Result<(), Error> {
        let listed: Vec<String> = hosts.iter().map(Host::to_string).collect();
        self.storage
            .update(|tree| {
                *tree = json!({ BLOCKLIST_KEY: listed });
                Ok(())
            })
            .map(|_| ())
    }

    fn rebuild_hosts(&mut self) -> Result<(), Error> {
        let listed = self
            .storage
            .state()
            .get(BLOCKLIST_KEY)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        self.hosts.clear();
        for entry in listed {
            if let Some(raw) = entry.as_str() {
                self.hosts.insert(Host::parse(raw)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn known() -> Vec<Host> {
        vec![
            Host::new("recv1", 12048),
            Host::new("recv2", 12048),
            Host::new("cn0", 12050),
            Host::new("cn0", 12000),
        ]
    }

    fn blocklist(dir: &TempDir) -> Blocklist {
        Blocklist::new(dir.path().join("blocklist.json"), known()).unwrap()
    }

    #[test]
    fn add_and_remove_known_hosts() {
        let dir = TempDir::new().unwrap();
        let mut bl = blocklist(&dir);

        bl.add_hosts(&["recv1:12048".into()]).unwrap();
        assert!(bl.contains(&Host::new("recv1", 12048)));

        bl.remove_hosts(&["recv1:12048".into()]).unwrap();
        assert!(bl.hosts().is_empty());
    }

    #[test]
    fn batches_are_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let mut bl = blocklist(&dir);

        let err = bl
            .add_hosts(&["recv1:12048".into(), "unknown:9".into()])
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 400);
        assert!(bl.hosts().is_empty());

        bl.add_hosts(&["recv1:12048".into()]).unwrap();
        let err = bl
            .remove_hosts(&["recv1:12048".into(), "unknown:9".into()])
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 400);
        assert!(bl.contains(&Host::new("recv1", 12048)));
    }

    #[test]
    fn bare_hostnames_resolve_only_when_unique() {
        let dir = TempDir::new().unwrap();
        let mut bl = blocklist(&dir);

        // recv1 has exactly one known port
        bl.add_hosts(&["recv1".into()]).unwrap();
        assert!(bl.contains(&Host::new("recv1", 12048)));

        // cn0 is ambiguous across two ports
        assert!(bl.add_hosts(&["cn0".into()]).is_err());
    }

    #[test]
    fn wrong_port_on_a_known_hostname_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut bl = blocklist(&dir);
        assert!(bl.add_hosts(&["recv1:1".into()]).is_err());
    }

    #[test]
    fn clear_empties_unconditionally() {
        let dir = TempDir::new().unwrap();
        let mut bl = blocklist(&dir);
        bl.add_hosts(&["recv1:12048".into(), "recv2:12048".into()]).unwrap();
        bl.clear_hosts().unwrap();
        assert!(bl.hosts().is_empty());
    }

    #[test]
    fn blocklist_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut bl = blocklist(&dir);
            bl.add_hosts(&["recv2:12048".into()]).unwrap();
        }
        let bl = blocklist(&dir);
        assert!(bl.contains(&Host::new("recv2", 12048)));

        // on-disk shape is shared with the nodes
        let raw = std::fs::read_to_string(dir.path().join("blocklist.json")).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["blacklist_hosts"], json!(["recv2:12048"]));
    }
}
