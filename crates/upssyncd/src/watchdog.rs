//! Availability watchdog
//!
//! Ticks on its own cadence, independent of the polling interval. A target
//! is unavailable once its `info.ipAddress` state, rewritten by every
//! successful publish, is older than the staleness window. The alive flag
//! is flipped on the falling edge only; the global `info.connection` flag
//! aggregates all targets.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Detects UPS units that stopped reporting
//! - AU-12: Audit Record Generation - Availability transitions are logged

use crate::error::Result;
use crate::fields::ValueType;
use crate::state_sync::{ALIVE_SUFFIX, IP_ADDRESS_SUFFIX, NamespaceEvent};
use crate::store::{ObjectMeta, StateStore};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Global connectivity flag
pub const CONNECTION_ID: &str = "info.connection";
const INFO_CHANNEL_ID: &str = "info";

/// A change of one target's availability
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliveTransition {
    pub namespace: String,
    pub alive: bool,
}

/// Result of one watchdog tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    /// Namespaces currently considered unavailable
    pub unavailable: Vec<String>,
    /// Aggregate connectivity
    pub connected: bool,
    pub transitions: Vec<AliveTransition>,
}

/// Tracks per-target staleness
pub struct AvailabilityWatchdog {
    store: Arc<dyn StateStore>,
    staleness: Duration,
    /// Namespace -> last alive value the watchdog knows of
    targets: BTreeMap<String, Option<bool>>,
    discovered: bool,
    connected: Option<bool>,
    announcements: Option<mpsc::UnboundedReceiver<NamespaceEvent>>,
}

impl AvailabilityWatchdog {
    pub fn new(store: Arc<dyn StateStore>, staleness: Duration) -> Self {
        Self {
            store,
            staleness,
            targets: BTreeMap::new(),
            discovered: false,
            connected: None,
            announcements: None,
        }
    }

    /// Receive namespaces initialized or retired after discovery
    pub fn with_announcements(
        mut self,
        announcements: mpsc::UnboundedReceiver<NamespaceEvent>,
    ) -> Self {
        self.announcements = Some(announcements);
        self
    }

    pub fn tracked(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    /// Run until cancelled
    pub async fn run(mut self, interval: Duration, token: CancellationToken) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_at(Utc::now()).await {
                        warn!(error = %e, "Watchdog tick failed");
                    }
                }
            }
        }
        debug!("Watchdog stopped");
    }

    /// Evaluate every tracked target against `now`
    #[instrument(skip(self))]
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<WatchdogReport> {
        if !self.discovered {
            self.discover().await?;
        }
        self.drain_announcements();

        let mut report = WatchdogReport::default();
        let namespaces: Vec<String> = self.targets.keys().cloned().collect();

        for namespace in namespaces {
            let stale = self.is_stale(&namespace, now).await?;
            let previous = self.targets.get(&namespace).copied().flatten();

            if stale {
                report.unavailable.push(namespace.clone());
                if previous != Some(false) {
                    self.store
                        .write_state(&format!("{}.{}", namespace, ALIVE_SUFFIX), Value::Bool(false))
                        .await?;
                    warn!(
                        namespace,
                        staleness_secs = self.staleness.as_secs_f64(),
                        "UPS stopped reporting, marking unavailable"
                    );
                    report.transitions.push(AliveTransition {
                        namespace: namespace.clone(),
                        alive: false,
                    });
                }
                self.targets.insert(namespace, Some(false));
            } else {
                if previous == Some(false) {
                    warn!(namespace, "UPS reporting again");
                    report.transitions.push(AliveTransition {
                        namespace: namespace.clone(),
                        alive: true,
                    });
                }
                self.targets.insert(namespace, Some(true));
            }
        }

        report.connected = report.unavailable.is_empty();
        self.update_connection(report.connected).await?;
        Ok(report)
    }

    async fn discover(&mut self) -> Result<()> {
        let suffix = format!(".{}", ALIVE_SUFFIX);
        let objects = self.store.list_objects().await?;

        for id in objects.keys() {
            let Some(namespace) = id.strip_suffix(&suffix) else {
                continue;
            };
            let alive = self
                .store
                .read_state(id)
                .await?
                .and_then(|state| state.value.as_bool());
            self.targets.insert(namespace.to_string(), alive);
        }

        self.discovered = true;
        debug!(count = self.targets.len(), "Discovered published UPS namespaces");
        Ok(())
    }

    fn drain_announcements(&mut self) {
        let Some(rx) = self.announcements.as_mut() else {
            return;
        };
        while let Ok(event) = rx.try_recv() {
            match event {
                NamespaceEvent::Initialized(namespace) => {
                    debug!(namespace, "Tracking new UPS namespace");
                    // The synchronizer has just written alive=true
                    self.targets.entry(namespace).or_insert(Some(true));
                }
                NamespaceEvent::Retired(namespace) => {
                    debug!(namespace, "No longer tracking retired UPS namespace");
                    self.targets.remove(&namespace);
                }
            }
        }
    }

    async fn is_stale(&self, namespace: &str, now: DateTime<Utc>) -> Result<bool> {
        let marker = format!("{}.{}", namespace, IP_ADDRESS_SUFFIX);
        let Some(state) = self.store.read_state(&marker).await? else {
            return Ok(true);
        };
        // A marker in the future is fresh
        Ok(match (now - state.ts).to_std() {
            Ok(elapsed) => elapsed > self.staleness,
            Err(_) => false,
        })
    }

    async fn update_connection(&mut self, connected: bool) -> Result<()> {
        if self.connected == Some(connected) {
            return Ok(());
        }

        if self.connected.is_none() {
            self.store
                .create_object_if_absent(INFO_CHANNEL_ID, ObjectMeta::channel("Information"))
                .await?;
            self.store
                .create_object_if_absent(
                    CONNECTION_ID,
                    ObjectMeta::state(
                        "All UPS units reachable",
                        ValueType::Boolean,
                        "indicator.connected",
                    ),
                )
                .await?;
        }

        self.store
            .write_state(CONNECTION_ID, Value::Bool(connected))
            .await?;
        if connected {
            info!("All UPS units reporting");
        } else {
            info!("At least one UPS unit unavailable");
        }
        self.connected = Some(connected);
        Ok(())
    }
}
