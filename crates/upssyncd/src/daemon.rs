//! Daemon wiring and host lifecycle adapter
//!
//! [`UpsSyncDaemon`] owns the poll task and the watchdog task and a shared
//! [`CancellationToken`] that stops both. [`Lifecycle`] maps host
//! `on_ready` / `on_shutdown` hooks onto it.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CP-10: System Recovery - Bounded, always-completing shutdown
//! - SI-4: System Monitoring - Poller and watchdog run independently

use crate::config_file::UpssyncConfig;
use crate::error::{Result, UpssyncError};
use crate::scheduler::PollScheduler;
use crate::state_sync::StateSynchronizer;
use crate::store::StateStore;
use crate::watchdog::AvailabilityWatchdog;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for each task during shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Running upssyncd instance
pub struct UpsSyncDaemon {
    config: UpssyncConfig,
    store: Arc<dyn StateStore>,
    token: CancellationToken,
    poller: Option<JoinHandle<Result<()>>>,
    watchdog: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
    fatal: Option<UpssyncError>,
}

impl UpsSyncDaemon {
    /// Build a daemon from a validated configuration
    pub fn new(config: UpssyncConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            token: CancellationToken::new(),
            poller: None,
            watchdog: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            fatal: None,
        })
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_some()
    }

    /// Spawn the poll and watchdog tasks. Calling it twice is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            debug!("Daemon already started");
            return Ok(());
        }
        if self.token.is_cancelled() {
            return Err(UpssyncError::Configuration(
                "daemon cannot be restarted after shutdown".to_string(),
            ));
        }

        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let sync = StateSynchronizer::new(self.store.clone()).with_announcements(announce_tx);
        let scheduler = PollScheduler::from_config(&self.config, sync);
        let watchdog = AvailabilityWatchdog::new(self.store.clone(), self.config.staleness_window())
            .with_announcements(announce_rx);

        let token = self.token.clone();
        self.poller = Some(tokio::spawn(async move {
            let result = scheduler.run(token.clone()).await;
            if result.is_err() {
                // Fatal for the whole daemon, stop the watchdog too
                token.cancel();
            }
            result
        }));

        let interval = self.config.watchdog_interval();
        self.watchdog = Some(tokio::spawn(watchdog.run(interval, self.token.clone())));

        info!(
            targets = self.config.targets.len(),
            mode = ?self.config.connection_mode,
            "upssyncd started"
        );
        Ok(())
    }

    /// Resolves once the daemon stops, by shutdown or a fatal poll error
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// Error that stopped the poller, if any
    pub fn fatal_error(&self) -> Option<&UpssyncError> {
        self.fatal.as_ref()
    }

    /// Cancel both tasks and wait for them with a bound. A task still
    /// running when the bound expires is aborted. Never fails.
    pub async fn shutdown(&mut self) {
        self.token.cancel();

        if let Some(mut handle) = self.poller.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => debug!("Poll task finished"),
                Ok(Ok(Err(e))) => {
                    error!(error = %e, "Poll task stopped with a fatal error");
                    self.fatal = Some(e);
                }
                Ok(Err(e)) => error!(error = %e, "Poll task panicked"),
                Err(_) => {
                    warn!(
                        timeout_secs = self.shutdown_timeout.as_secs_f64(),
                        "Poll task did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        if let Some(mut handle) = self.watchdog.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => debug!("Watchdog task finished"),
                Ok(Err(e)) => error!(error = %e, "Watchdog task panicked"),
                Err(_) => {
                    warn!("Watchdog task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        info!("upssyncd stopped");
    }
}

/// Host lifecycle adapter
pub struct Lifecycle {
    daemon: UpsSyncDaemon,
}

impl Lifecycle {
    pub fn new(daemon: UpsSyncDaemon) -> Self {
        Self { daemon }
    }

    pub fn daemon(&self) -> &UpsSyncDaemon {
        &self.daemon
    }

    /// Host is ready; start polling
    pub fn on_ready(&mut self) -> Result<()> {
        self.daemon.start()
    }

    /// Stop the daemon, then invoke `callback` whatever happened
    pub async fn on_shutdown<F: FnOnce()>(&mut self, callback: F) {
        self.daemon.shutdown().await;
        callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_file::TargetConfig;
    use crate::store::{InMemoryStore, ObjectMeta, StoredState};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A store whose every call blocks forever
    struct StalledStore;

    #[async_trait]
    impl StateStore for StalledStore {
        async fn object_exists(&self, _id: &str) -> Result<bool> {
            std::future::pending().await
        }

        async fn create_object_if_absent(&self, _id: &str, _meta: ObjectMeta) -> Result<bool> {
            std::future::pending().await
        }

        async fn read_state(&self, _id: &str) -> Result<Option<StoredState>> {
            std::future::pending().await
        }

        async fn write_state(&self, _id: &str, _value: serde_json::Value) -> Result<()> {
            std::future::pending().await
        }

        async fn list_objects(&self) -> Result<HashMap<String, ObjectMeta>> {
            std::future::pending().await
        }

        async fn delete_object(&self, _id: &str) -> Result<()> {
            std::future::pending().await
        }
    }

    fn config_for(port: u16) -> UpssyncConfig {
        let mut config = UpssyncConfig::default();
        config.targets = vec![TargetConfig::new("127.0.0.1", port)];
        config.polling_interval_ms = 1000;
        config.nis.connect_timeout_secs = 1;
        config.nis.socket_timeout_secs = 1;
        config
    }

    async fn refused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = UpssyncConfig::default();
        config.polling_interval_ms = 10;
        let result = UpsSyncDaemon::new(config, Arc::new(InMemoryStore::new()));
        assert!(matches!(result, Err(UpssyncError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_shutdown_invokes_callback() {
        let port = refused_port().await;
        let daemon = UpsSyncDaemon::new(config_for(port), Arc::new(InMemoryStore::new())).unwrap();
        let mut lifecycle = Lifecycle::new(daemon);

        lifecycle.on_ready().unwrap();
        assert!(lifecycle.daemon().is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let called = AtomicBool::new(false);
        lifecycle
            .on_shutdown(|| called.store(true, Ordering::SeqCst))
            .await;

        assert!(called.load(Ordering::SeqCst));
        assert!(!lifecycle.daemon().is_running());
        assert!(lifecycle.daemon().fatal_error().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_without_start_invokes_callback() {
        let daemon = UpsSyncDaemon::new(UpssyncConfig::default(), Arc::new(InMemoryStore::new()))
            .unwrap();
        let mut lifecycle = Lifecycle::new(daemon);

        let called = AtomicBool::new(false);
        lifecycle
            .on_shutdown(|| called.store(true, Ordering::SeqCst))
            .await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_task_stuck_past_timeout() {
        let port = refused_port().await;
        let mut daemon = UpsSyncDaemon::new(config_for(port), Arc::new(StalledStore))
            .unwrap()
            .with_shutdown_timeout(Duration::from_millis(100));
        daemon.start().unwrap();
        // Let the watchdog block inside its first store call
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), daemon.shutdown())
            .await
            .expect("shutdown should be bounded by its timeout");
        assert!(!daemon.is_running());
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_stops_daemon() {
        let port = refused_port().await;
        let mut config = config_for(port);
        config.connection_mode = crate::config_file::ConnectionMode::Persistent;
        config.nis.reconnect_delay_secs = 1;
        config.nis.max_reconnect_attempts = 1;

        let mut daemon = UpsSyncDaemon::new(config, Arc::new(InMemoryStore::new())).unwrap();
        daemon.start().unwrap();

        tokio::time::timeout(Duration::from_secs(5), daemon.stopped())
            .await
            .expect("daemon should stop after exhausting reconnects");
        daemon.shutdown().await;

        assert!(matches!(
            daemon.fatal_error(),
            Some(UpssyncError::ReconnectExhausted { attempts: 1, .. })
        ));
        assert!(daemon.start().is_err());
    }
}
