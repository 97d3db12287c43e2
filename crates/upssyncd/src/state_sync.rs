//! Publication of normalized UPS records
//!
//! Creates the per-UPS object tree on first sight and writes field values
//! only when they differ from the last known value. The `info.alive`,
//! `info.ipAddress` and `info.ipPort` triad is rewritten on every
//! successful cycle because the watchdog reads its timestamps.
//!
//! Namespaces are announced to the watchdog when first initialized and
//! when retired after the endpoint starts reporting another serial number.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - One namespace per UPS serial number
//! - AU-12: Audit Record Generation - Value changes are logged

use crate::error::Result;
use crate::fields::{self, ValueType};
use crate::normalize::UpsRecord;
use crate::store::{ObjectMeta, StateStore};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

/// Suffix of the per-UPS alive flag
pub const ALIVE_SUFFIX: &str = "info.alive";
/// Suffix of the per-UPS address state; its timestamp is the staleness marker
pub const IP_ADDRESS_SUFFIX: &str = "info.ipAddress";
/// Suffix of the per-UPS port state
pub const IP_PORT_SUFFIX: &str = "info.ipPort";

/// Namespace id for a device serial number
pub fn namespace_for_serial(serial: &str) -> Option<String> {
    let ns: String = serial
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if ns.is_empty() { None } else { Some(ns) }
}

fn object_id(namespace: &str, suffix: &str) -> String {
    format!("{}.{}", namespace, suffix)
}

/// Namespace lifecycle notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceEvent {
    Initialized(String),
    /// No endpoint reports this serial number any more
    Retired(String),
}

/// Outcome of one publish call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Field writes issued (the info triad excluded)
    pub written: usize,
    /// Fields skipped because their value did not change
    pub unchanged: usize,
}

/// Diffs normalized records against published state
pub struct StateSynchronizer {
    store: Arc<dyn StateStore>,
    initialized: HashSet<String>,
    known_objects: HashSet<String>,
    last_values: HashMap<String, Value>,
    announce: Option<mpsc::UnboundedSender<NamespaceEvent>>,
}

impl StateSynchronizer {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            initialized: HashSet::new(),
            known_objects: HashSet::new(),
            last_values: HashMap::new(),
            announce: None,
        }
    }

    /// Send namespace initialization and retirement to `announce`
    pub fn with_announcements(mut self, announce: mpsc::UnboundedSender<NamespaceEvent>) -> Self {
        self.announce = Some(announce);
        self
    }

    pub fn is_initialized(&self, namespace: &str) -> bool {
        self.initialized.contains(namespace)
    }

    /// Create the device, info channel and info triad once per namespace.
    /// Existing objects are left untouched.
    #[instrument(skip(self))]
    pub async fn ensure_target(&mut self, namespace: &str, model: Option<&str>) -> Result<()> {
        if self.initialized.contains(namespace) {
            return Ok(());
        }

        let device_name = model.unwrap_or(namespace).to_string();
        let objects = [
            (namespace.to_string(), ObjectMeta::device(device_name)),
            (
                object_id(namespace, "info"),
                ObjectMeta::channel("Information"),
            ),
            (
                object_id(namespace, ALIVE_SUFFIX),
                ObjectMeta::state("UPS reachable", ValueType::Boolean, "indicator.reachable"),
            ),
            (
                object_id(namespace, IP_ADDRESS_SUFFIX),
                ObjectMeta::state("apcupsd address", ValueType::String, "info.ip"),
            ),
            (
                object_id(namespace, IP_PORT_SUFFIX),
                ObjectMeta::state("apcupsd port", ValueType::Number, "info.port"),
            ),
        ];

        for (id, meta) in objects {
            if self.store.create_object_if_absent(&id, meta).await? {
                debug!(id, "Created object");
            }
            self.known_objects.insert(id);
        }

        self.initialized.insert(namespace.to_string());
        info!(namespace, "Initialized UPS namespace");
        self.notify(NamespaceEvent::Initialized(namespace.to_string()));
        Ok(())
    }

    /// Stop publishing under `namespace` and mark it unavailable.
    /// Its objects and last values stay in the store.
    #[instrument(skip(self))]
    pub async fn retire(&mut self, namespace: &str) -> Result<()> {
        self.initialized.remove(namespace);
        self.store
            .write_state(&object_id(namespace, ALIVE_SUFFIX), Value::Bool(false))
            .await?;
        info!(namespace, "Retired UPS namespace");
        self.notify(NamespaceEvent::Retired(namespace.to_string()));
        Ok(())
    }

    fn notify(&self, event: NamespaceEvent) {
        if let Some(announce) = &self.announce {
            if announce.send(event).is_err() {
                debug!("Namespace listener dropped");
            }
        }
    }

    /// Publish one record under `namespace`
    #[instrument(skip(self, record), fields(fields = record.len()))]
    pub async fn publish(
        &mut self,
        namespace: &str,
        address: &str,
        port: u16,
        record: &UpsRecord,
    ) -> Result<SyncReport> {
        let model = record.get("MODEL").and_then(|v| v.as_text());
        self.ensure_target(namespace, model).await?;

        let mut report = SyncReport::default();
        for (field, value) in record {
            let definition = fields::resolve(field);
            let id = object_id(namespace, &definition.published_id);

            if !self.known_objects.contains(&id) {
                let meta = ObjectMeta::state(
                    definition.display_name.clone(),
                    definition.value_type,
                    definition.role.clone(),
                )
                .with_unit(definition.unit.clone());
                self.store.create_object_if_absent(&id, meta).await?;
                self.known_objects.insert(id.clone());
            }

            let value = value.to_json();
            if self.last_value(&id).await?.as_ref() == Some(&value) {
                report.unchanged += 1;
                continue;
            }

            debug!(id, %value, "Value changed");
            self.store.write_state(&id, value.clone()).await?;
            self.last_values.insert(id, value);
            report.written += 1;
        }

        self.write_info(namespace, address, port).await?;
        Ok(report)
    }

    async fn last_value(&mut self, id: &str) -> Result<Option<Value>> {
        if let Some(value) = self.last_values.get(id) {
            return Ok(Some(value.clone()));
        }
        let stored = self.store.read_state(id).await?.map(|s| s.value);
        if let Some(value) = &stored {
            self.last_values.insert(id.to_string(), value.clone());
        }
        Ok(stored)
    }

    async fn write_info(&mut self, namespace: &str, address: &str, port: u16) -> Result<()> {
        self.store
            .write_state(&object_id(namespace, ALIVE_SUFFIX), Value::Bool(true))
            .await?;
        self.store
            .write_state(
                &object_id(namespace, IP_ADDRESS_SUFFIX),
                Value::String(address.to_string()),
            )
            .await?;
        self.store
            .write_state(&object_id(namespace, IP_PORT_SUFFIX), Value::from(port))
            .await?;
        Ok(())
    }
}
