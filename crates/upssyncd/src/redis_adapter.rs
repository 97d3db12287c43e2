//! Redis-backed state store
//!
//! Objects live in `UPS_OBJECT|<id>` (field `meta`, JSON) and values in
//! `UPS_STATE|<id>` (fields `val`, JSON, and `ts`, RFC 3339), in the
//! configured STATE_DB index.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-8: Transmission Confidentiality - Database communication
//! - AU-3: Content of Audit Records - Database operations logged

use crate::error::{Result, UpssyncError};
use crate::store::{ObjectMeta, StateStore, StoredState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tracing::{debug, instrument};

const OBJECT_TABLE: &str = "UPS_OBJECT";
const STATE_TABLE: &str = "UPS_STATE";
const SEPARATOR: char = '|';

const META_FIELD: &str = "meta";
const VALUE_FIELD: &str = "val";
const TS_FIELD: &str = "ts";

fn object_key(id: &str) -> String {
    format!("{}{}{}", OBJECT_TABLE, SEPARATOR, id)
}

fn state_key(id: &str) -> String {
    format!("{}{}{}", STATE_TABLE, SEPARATOR, id)
}

/// Redis state store
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `redis://host:port/db`
    #[instrument]
    pub async fn connect(host: &str, port: u16, db: u32) -> Result<Self> {
        let url = format!("redis://{}:{}/{}", host, port, db);
        debug!(url, "Connecting to Redis state store");
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn parse_state(mut fields: HashMap<String, String>) -> Result<Option<StoredState>> {
        let (Some(raw_value), Some(raw_ts)) = (fields.remove(VALUE_FIELD), fields.remove(TS_FIELD))
        else {
            return Ok(None);
        };

        let value = serde_json::from_str(&raw_value)?;
        let ts = DateTime::parse_from_rfc3339(&raw_ts)
            .map_err(|e| UpssyncError::Store(format!("invalid timestamp {:?}: {}", raw_ts, e)))?
            .with_timezone(&Utc);
        Ok(Some(StoredState { value, ts }))
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn object_exists(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(object_key(id)).await?;
        Ok(exists)
    }

    #[instrument(skip(self, meta))]
    async fn create_object_if_absent(&self, id: &str, meta: ObjectMeta) -> Result<bool> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&meta)?;
        let created: bool = conn.hset_nx(object_key(id), META_FIELD, payload).await?;
        if created {
            debug!(id, "Created object");
        }
        Ok(created)
    }

    async fn read_state(&self, id: &str) -> Result<Option<StoredState>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(state_key(id)).await?;
        Self::parse_state(fields)
    }

    async fn write_state(&self, id: &str, value: serde_json::Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let fields = [
            (VALUE_FIELD, serde_json::to_string(&value)?),
            (TS_FIELD, Utc::now().to_rfc3339()),
        ];
        let _: () = conn.hset_multiple(state_key(id), &fields).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_objects(&self) -> Result<HashMap<String, ObjectMeta>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}{}*", OBJECT_TABLE, SEPARATOR);
        let keys: Vec<String> = conn.keys(&pattern).await?;

        let mut objects = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(id) = key.split_once(SEPARATOR).map(|(_, id)| id.to_string()) else {
                continue;
            };
            let raw: Option<String> = conn.hget(&key, META_FIELD).await?;
            match raw.map(|raw| serde_json::from_str::<ObjectMeta>(&raw)) {
                Some(Ok(meta)) => {
                    objects.insert(id, meta);
                }
                Some(Err(e)) => debug!(key, error = %e, "Skipping object with unreadable metadata"),
                None => debug!(key, "Skipping object without metadata"),
            }
        }

        debug!(count = objects.len(), "Listed objects");
        Ok(objects)
    }

    async fn delete_object(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(vec![object_key(id), state_key(id)]).await?;
        Ok(())
    }
}
