//! UPS Synchronization Daemon
//!
//! Polls apcupsd Network Information Servers for UPS status, normalizes the
//! loosely typed fields and publishes them as change-tracked state.
//! A watchdog marks units unavailable when they stop reporting.
//!
//! NIST 800-53 Rev5 [SI-4]: System Monitoring - UPS power state monitoring
//! NIST 800-53 Rev5 [CP-8]: Telecommunications Services - Power availability signalling

pub mod config_file;
pub mod daemon;
pub mod error;
pub mod fields;
pub mod nis_client;
pub mod nis_codec;
pub mod normalize;
pub mod redis_adapter;
pub mod scheduler;
pub mod state_sync;
pub mod store;
pub mod watchdog;

pub use config_file::{
    ConnectionMode, DatabaseConfig, NisConfig, StoreBackend, TargetConfig, UpssyncConfig,
    WatchdogConfig,
};
pub use daemon::{Lifecycle, UpsSyncDaemon};
pub use error::*;
pub use fields::{FieldDefinition, ValueType};
pub use nis_client::{ClientEvent, ConnectionState, NisClient};
pub use normalize::{RawRecord, UpsRecord, UpsValue, normalize_record, normalize_ups_result};
pub use redis_adapter::RedisStore;
pub use scheduler::{PollOutcome, PollScheduler, SchedulerSettings, TargetRuntime};
pub use state_sync::{NamespaceEvent, StateSynchronizer, SyncReport};
pub use store::{InMemoryStore, ObjectKind, ObjectMeta, StateStore, StoredState};
pub use watchdog::{AliveTransition, AvailabilityWatchdog, WatchdogReport};
