//! Desired-state file source.
//!
//! Polls a file listing every proxy resource and drives [`Manager::apply`]
//! so the running listeners follow it. Owners are diffed against what was
//! last applied successfully; an owner whose apply failed is retried on
//! every poll until it succeeds or the file changes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::proxy::{Manager, Mapping, OwnerKey};

/// Passes per poll. A port handed from one owner to another resolves on the
/// second pass when the receiving owner sorts first.
const MAX_PASSES: usize = 2;

/// Whole desired-state document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub proxies: Vec<ProxySpec>,
}

/// One proxy resource: an owner and the services it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpec {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub services: Vec<Mapping>,
}

impl ProxySpec {
    pub fn owner(&self) -> OwnerKey {
        OwnerKey::new(self.namespace.clone(), self.name.clone())
    }
}

impl DesiredState {
    /// Parse a document; TOML if `toml` is set, JSON otherwise.
    pub fn parse(raw: &str, toml: bool) -> Result<Self> {
        if toml {
            toml::from_str(raw).context("Invalid TOML desired state")
        } else {
            serde_json::from_str(raw).context("Invalid JSON desired state")
        }
    }

    /// Read and parse `path`, choosing the format by extension.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read desired state {}", path.display()))?;
        let toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        Self::parse(&raw, toml).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Mappings per owner. Rejects documents that list an owner twice.
    pub fn by_owner(&self) -> Result<BTreeMap<OwnerKey, Vec<Mapping>>> {
        let mut owners = BTreeMap::new();
        for proxy in &self.proxies {
            if proxy.namespace.is_empty() || proxy.name.is_empty() {
                bail!("Proxy entry with empty namespace or name");
            }
            let owner = proxy.owner();
            if owners.insert(owner.clone(), proxy.services.clone()).is_some() {
                bail!("Proxy {owner} is listed more than once");
            }
        }
        Ok(owners)
    }
}

/// Counters for one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Owners created or updated.
    pub applied: usize,
    /// Owners removed.
    pub removed: usize,
    /// Owners whose apply failed or was only partially bound.
    pub failed: usize,
}

/// Keeps the manager in line with a desired-state file.
pub struct FileSource {
    path: PathBuf,
    interval: Duration,
    manager: Arc<Manager>,
    applied: BTreeMap<OwnerKey, Vec<Mapping>>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, interval: Duration, manager: Arc<Manager>) -> Self {
        Self {
            path: path.into(),
            interval,
            manager,
            applied: BTreeMap::new(),
        }
    }

    /// Read the file once and apply what changed.
    pub async fn sync_once(&mut self) -> Result<SyncReport> {
        let desired = DesiredState::load(&self.path).await?.by_owner()?;
        let mut report = SyncReport::default();

        let vanished: Vec<OwnerKey> = self
            .applied
            .keys()
            .filter(|owner| !desired.contains_key(*owner))
            .cloned()
            .collect();
        for owner in vanished {
            match self.manager.apply(&owner, &[]).await {
                Ok(outcome) => {
                    info!(owner = %owner, stopped = outcome.stopped.len(), "Proxy removed");
                    self.applied.remove(&owner);
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(owner = %owner, reason_code = e.reason_code(), error = %e, "Failed to remove proxy");
                }
            }
        }

        let mut failed = BTreeSet::new();
        for pass in 0..MAX_PASSES {
            let pending: Vec<(&OwnerKey, &Vec<Mapping>)> = desired
                .iter()
                .filter(|(owner, mappings)| self.applied.get(*owner) != Some(*mappings))
                .collect();
            if pending.is_empty() {
                break;
            }

            let mut progressed = false;
            for (owner, mappings) in pending {
                match self.manager.apply(owner, mappings).await {
                    Ok(outcome) if outcome.failed.is_empty() => {
                        debug!(
                            owner = %owner,
                            started = outcome.started.len(),
                            stopped = outcome.stopped.len(),
                            "Proxy applied"
                        );
                        self.applied.insert(owner.clone(), mappings.clone());
                        failed.remove(owner);
                        report.applied += 1;
                        progressed = true;
                    }
                    Ok(outcome) => {
                        warn!(
                            owner = %owner,
                            failed = outcome.failed.len(),
                            pass,
                            "Proxy partially applied"
                        );
                        // Remember the owner so a later removal still closes what did bind.
                        self.applied.entry(owner.clone()).or_default();
                        failed.insert(owner.clone());
                        progressed |= !outcome.is_noop();
                    }
                    Err(e) => {
                        warn!(
                            owner = %owner,
                            reason_code = e.reason_code(),
                            error = %e,
                            pass,
                            "Failed to apply proxy"
                        );
                        failed.insert(owner.clone());
                    }
                }
            }

            if !progressed {
                break;
            }
        }

        report.failed = failed.len();
        Ok(report)
    }

    /// Poll until `shutdown` flips to true.
    #[instrument(skip(self, shutdown), fields(path = %self.path.display()))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "Starting desired-state source"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sync_once().await {
                        Ok(report) if report != SyncReport::default() => {
                            info!(
                                applied = report.applied,
                                removed = report.removed,
                                failed = report.failed,
                                "Desired state synced"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %format!("{e:#}"), "Failed to load desired state; keeping current state");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Desired-state source shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = r#"{
        "proxies": [
            { "namespace": "ns", "name": "a",
              "services": [ { "name": "backend1", "port": 8080, "exposeAs": 9001 } ] },
            { "namespace": "ns", "name": "b" }
        ]
    }"#;

    const TOML: &str = r#"
        [[proxies]]
        namespace = "ns"
        name = "a"

        [[proxies.services]]
        name = "backend1"
        port = 8080
        exposeAs = 9001
    "#;

    #[test]
    fn test_parse_json() {
        let state = DesiredState::parse(JSON, false).unwrap();
        let owners = state.by_owner().unwrap();

        assert_eq!(owners.len(), 2);
        assert_eq!(
            owners[&OwnerKey::new("ns", "a")],
            vec![Mapping::new("backend1", 8080, 9001)]
        );
        assert!(owners[&OwnerKey::new("ns", "b")].is_empty());
    }

    #[test]
    fn test_parse_toml_matches_json() {
        let toml = DesiredState::parse(TOML, true).unwrap();
        let json = DesiredState::parse(JSON, false).unwrap();
        assert_eq!(toml.proxies[0], json.proxies[0]);
    }

    #[test]
    fn test_duplicate_owner_rejected() {
        let state = DesiredState {
            proxies: vec![
                ProxySpec {
                    namespace: "ns".into(),
                    name: "a".into(),
                    services: vec![],
                },
                ProxySpec {
                    namespace: "ns".into(),
                    name: "a".into(),
                    services: vec![Mapping::new("x", 80, 9001)],
                },
            ],
        };
        assert!(state.by_owner().is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(DesiredState::parse("{ not json", false).is_err());
    }
}
