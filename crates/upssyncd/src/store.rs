//! State store abstraction
//!
//! upssyncd owns no storage; it publishes through [`StateStore`]. The
//! in-memory store backs tests and the `memory` backend, the Redis store
//! lives in [`crate::redis_adapter`].
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-12: Audit Record Generation - Every write is timestamped
//! - CM-8: System Component Inventory - Objects describe monitored UPS units

use crate::error::Result;
use crate::fields::ValueType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of published object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Device,
    Channel,
    State,
}

/// Object metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub kind: ObjectKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
}

impl ObjectMeta {
    pub fn device(name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Device,
            name: name.into(),
            value_type: None,
            role: None,
            unit: None,
            read: false,
            write: false,
        }
    }

    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Channel,
            ..Self::device(name)
        }
    }

    /// Read-only state object
    pub fn state(name: impl Into<String>, value_type: ValueType, role: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::State,
            name: name.into(),
            value_type: Some(value_type),
            role: Some(role.into()),
            unit: None,
            read: true,
            write: false,
        }
    }

    pub fn with_unit(mut self, unit: Option<String>) -> Self {
        self.unit = unit;
        self
    }
}

/// Stored value with its last write time
#[derive(Clone, Debug, PartialEq)]
pub struct StoredState {
    pub value: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Persistence collaborator
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn object_exists(&self, id: &str) -> Result<bool>;

    /// Create the object unless it exists; returns whether it was created.
    /// Existing objects are never overwritten.
    async fn create_object_if_absent(&self, id: &str, meta: ObjectMeta) -> Result<bool>;

    async fn read_state(&self, id: &str) -> Result<Option<StoredState>>;

    async fn write_state(&self, id: &str, value: serde_json::Value) -> Result<()>;

    async fn list_objects(&self) -> Result<HashMap<String, ObjectMeta>>;

    async fn delete_object(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    objects: HashMap<String, ObjectMeta>,
    states: HashMap<String, StoredState>,
    writes: Vec<(String, serde_json::Value)>,
}

/// In-process state store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<MemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `write_state` call in order
    pub fn writes(&self) -> Vec<(String, serde_json::Value)> {
        self.inner.lock().writes.clone()
    }

    /// Number of writes issued for `id`
    pub fn write_count(&self, id: &str) -> usize {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|(written, _)| written == id)
            .count()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().writes.clear();
    }

    /// Overwrite a state timestamp (used to age markers)
    pub fn set_state_ts(&self, id: &str, ts: DateTime<Utc>) {
        if let Some(state) = self.inner.lock().states.get_mut(id) {
            state.ts = ts;
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn object_exists(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().objects.contains_key(id))
    }

    async fn create_object_if_absent(&self, id: &str, meta: ObjectMeta) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(id) {
            return Ok(false);
        }
        inner.objects.insert(id.to_string(), meta);
        Ok(true)
    }

    async fn read_state(&self, id: &str) -> Result<Option<StoredState>> {
        Ok(self.inner.lock().states.get(id).cloned())
    }

    async fn write_state(&self, id: &str, value: serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writes.push((id.to_string(), value.clone()));
        inner.states.insert(
            id.to_string(),
            StoredState {
                value,
                ts: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_objects(&self) -> Result<HashMap<String, ObjectMeta>> {
        Ok(self.inner.lock().objects.clone())
    }

    async fn delete_object(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.objects.remove(id);
        inner.states.remove(id);
        Ok(())
    }
}
