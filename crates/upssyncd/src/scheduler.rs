//! Poll scheduler
//!
//! Visits every configured target once per polling interval, strictly in
//! configuration order. A failing target only bumps its own error counter;
//! the rest of the cycle continues.
//!
//! Two connection policies exist and a run uses exactly one:
//! - [`ConnectionMode::PerPoll`]: `connect -> status -> disconnect` on every
//!   visit, no reconnect logic.
//! - [`ConnectionMode::Persistent`]: one long-lived connection per target.
//!   A client `Error` event schedules a reconnect after a fixed delay;
//!   too many consecutive failed reconnects stop the daemon. A ping
//!   sub-cycle probes idle connections between polls.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Periodic collection of UPS telemetry
//! - CP-10: System Recovery - Bounded reconnect with escalation
//! - AU-12: Audit Record Generation - Every failure logged with endpoint and phase

use crate::config_file::{ConnectionMode, TargetConfig, UpssyncConfig};
use crate::error::{Result, UpssyncError};
use crate::nis_client::{ClientEvent, ConnectionState, NisClient};
use crate::normalize::{RawRecord, normalize_ups_result};
use crate::state_sync::{StateSynchronizer, SyncReport, namespace_for_serial};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Status value meaning apcupsd lost its link to the UPS
pub const COMMLOST_STATUS: &str = "commlost";

/// Whether a raw status record signals lost UPS communication
pub fn is_comm_lost(raw: &RawRecord) -> bool {
    raw.get("STATUS")
        .map(|status| status.trim().eq_ignore_ascii_case(COMMLOST_STATUS))
        .unwrap_or(false)
}

/// Result of visiting one target
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Published(SyncReport),
    /// apcupsd answered but has no link to the UPS; nothing written
    CommunicationLost,
    /// No serial number in the reply; nothing written
    MissingSerial,
    Failed(String),
}

/// Scheduler timing and retry parameters
#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub mode: ConnectionMode,
    pub polling_interval: Duration,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_enabled: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl From<&UpssyncConfig> for SchedulerSettings {
    fn from(config: &UpssyncConfig) -> Self {
        Self {
            mode: config.connection_mode,
            polling_interval: config.polling_interval(),
            connect_timeout: config.connect_timeout(),
            socket_timeout: config.socket_timeout(),
            ping_interval: config.ping_interval(),
            ping_enabled: config.ping_enabled(),
            reconnect_delay: config.reconnect_delay(),
            max_reconnect_attempts: config.nis.max_reconnect_attempts,
        }
    }
}

/// Runtime state of one configured target
#[derive(Debug)]
pub struct TargetRuntime {
    pub address: String,
    pub port: u16,
    /// Namespace learned from the device serial number
    pub id: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub reconnect_attempts: u32,
    comm_lost: bool,
    reconnect_at: Option<Instant>,
    client: NisClient,
}

impl TargetRuntime {
    fn new(
        target: &TargetConfig,
        settings: &SchedulerSettings,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let client = NisClient::new(target.address.clone(), target.port)
            .with_timeouts(settings.connect_timeout, settings.socket_timeout)
            .with_events(events);
        Self {
            address: target.address.clone(),
            port: target.port,
            id: None,
            last_success: None,
            consecutive_errors: 0,
            reconnect_attempts: 0,
            comm_lost: false,
            reconnect_at: None,
            client,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }
}

/// Drives polling across all targets
pub struct PollScheduler {
    settings: SchedulerSettings,
    targets: Vec<TargetRuntime>,
    sync: StateSynchronizer,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl PollScheduler {
    pub fn new(
        settings: SchedulerSettings,
        targets: &[TargetConfig],
        sync: StateSynchronizer,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let targets = targets
            .iter()
            .map(|target| TargetRuntime::new(target, &settings, tx.clone()))
            .collect();
        Self {
            settings,
            targets,
            sync,
            events,
        }
    }

    pub fn from_config(config: &UpssyncConfig, sync: StateSynchronizer) -> Self {
        Self::new(SchedulerSettings::from(config), &config.targets, sync)
    }

    pub fn mode(&self) -> ConnectionMode {
        self.settings.mode
    }

    pub fn targets(&self) -> &[TargetRuntime] {
        &self.targets
    }

    /// Poll until cancelled. Returns an error only when reconnects are exhausted.
    ///
    /// Cancellation also interrupts a cycle in flight, so a hung endpoint
    /// cannot hold shutdown for its socket timeout.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let mut poll = time::interval(self.settings.polling_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ping_enabled =
            self.settings.mode == ConnectionMode::Persistent && self.settings.ping_enabled;
        let mut ping = time::interval_at(
            Instant::now() + self.settings.ping_interval,
            self.settings.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            mode = ?self.settings.mode,
            targets = self.targets.len(),
            interval_ms = self.settings.polling_interval.as_millis() as u64,
            ping_enabled,
            "Poll scheduler started"
        );

        let result = loop {
            let next_reconnect = self.next_reconnect();
            let reconnect_sleep = time::sleep_until(
                next_reconnect.unwrap_or_else(|| Instant::now() + self.settings.polling_interval),
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                _ = reconnect_sleep, if next_reconnect.is_some() => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break Ok(()),
                        result = self.reconnect_due() => {
                            if let Err(e) = result {
                                error!(error = %e, "Giving up on apcupsd connection");
                                break Err(e);
                            }
                        }
                    }
                }
                _ = poll.tick() => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break Ok(()),
                        _ = self.run_cycle() => {}
                    }
                }
                _ = ping.tick(), if ping_enabled => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break Ok(()),
                        _ = self.ping_cycle() => {}
                    }
                }
            }
        };

        self.shutdown().await;
        result
    }

    /// Visit every target once, in configuration order
    #[instrument(skip(self), fields(mode = ?self.settings.mode))]
    pub async fn run_cycle(&mut self) -> Vec<PollOutcome> {
        let mut outcomes = Vec::with_capacity(self.targets.len());
        for index in 0..self.targets.len() {
            let outcome = self.poll_target(index).await;
            self.drain_events();
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Probe connected targets without publishing
    pub async fn ping_cycle(&mut self) {
        for target in &mut self.targets {
            if !target.client.is_connected() {
                continue;
            }
            match target.client.ping().await {
                Ok(()) => debug!(endpoint = target.client.endpoint(), "Ping ok"),
                Err(e) => warn!(
                    endpoint = target.client.endpoint(),
                    phase = "ping",
                    error = %e,
                    "Ping failed"
                ),
            }
        }
        self.drain_events();
    }

    /// Attempt every reconnect whose delay has elapsed
    pub async fn reconnect_due(&mut self) -> Result<()> {
        let now = Instant::now();
        for index in 0..self.targets.len() {
            let due = self.targets[index]
                .reconnect_at
                .map(|at| at <= now)
                .unwrap_or(false);
            if due {
                self.reconnect(index).await?;
            }
        }
        self.drain_events();
        Ok(())
    }

    /// Close every connection. Never fails.
    pub async fn shutdown(&mut self) {
        for target in &mut self.targets {
            target.reconnect_at = None;
            target.client.disconnect().await;
        }
        self.drain_events();
        debug!("Poll scheduler stopped");
    }

    async fn poll_target(&mut self, index: usize) -> PollOutcome {
        let mode = self.settings.mode;
        let target = &mut self.targets[index];

        if mode == ConnectionMode::Persistent && target.reconnect_at.is_some() {
            target.consecutive_errors += 1;
            debug!(endpoint = target.client.endpoint(), "Waiting for reconnect, skipping poll");
            return PollOutcome::Failed(format!("{} awaiting reconnect", target.client.endpoint()));
        }

        let result = match mode {
            ConnectionMode::PerPoll => {
                let result = Self::query(&mut target.client).await;
                target.client.disconnect().await;
                result
            }
            ConnectionMode::Persistent => Self::query(&mut target.client).await,
        };

        let raw = match result {
            Ok(raw) => raw,
            Err((phase, e)) => {
                target.consecutive_errors += 1;
                warn!(
                    endpoint = target.client.endpoint(),
                    phase,
                    error = %e,
                    consecutive_errors = target.consecutive_errors,
                    "Poll failed"
                );
                return PollOutcome::Failed(e.to_string());
            }
        };

        self.publish(index, raw).await
    }

    async fn query(
        client: &mut NisClient,
    ) -> std::result::Result<RawRecord, (&'static str, UpssyncError)> {
        client.connect().await.map_err(|e| ("connect", e))?;
        client.status().await.map_err(|e| ("status", e))
    }

    async fn publish(&mut self, index: usize, raw: RawRecord) -> PollOutcome {
        let target = &mut self.targets[index];

        if is_comm_lost(&raw) {
            if !target.comm_lost {
                warn!(
                    endpoint = target.client.endpoint(),
                    "apcupsd lost communication with the UPS, not publishing"
                );
            } else {
                debug!(endpoint = target.client.endpoint(), "Communication still lost");
            }
            target.comm_lost = true;
            return PollOutcome::CommunicationLost;
        }
        if target.comm_lost {
            info!(
                endpoint = target.client.endpoint(),
                "apcupsd communication with the UPS restored"
            );
            target.comm_lost = false;
        }

        let Some(namespace) = raw.get("SERIALNO").and_then(|s| namespace_for_serial(s)) else {
            warn!(
                endpoint = target.client.endpoint(),
                "Status reply has no serial number, not publishing"
            );
            return PollOutcome::MissingSerial;
        };

        if let Some(previous) = target.id.take_if(|id| *id != namespace) {
            warn!(
                endpoint = target.client.endpoint(),
                previous,
                namespace,
                "Serial number changed, retiring previous namespace"
            );
            if let Err(e) = self.sync.retire(&previous).await {
                warn!(
                    endpoint = target.client.endpoint(),
                    namespace = previous,
                    error = %e,
                    "Retiring namespace failed"
                );
            }
        }

        let record = normalize_ups_result(&raw);
        match self
            .sync
            .publish(&namespace, &target.address, target.port, &record)
            .await
        {
            Ok(report) => {
                debug!(
                    endpoint = target.client.endpoint(),
                    namespace,
                    written = report.written,
                    unchanged = report.unchanged,
                    "Published status"
                );
                target.id = Some(namespace);
                target.last_success = Some(Utc::now());
                target.consecutive_errors = 0;
                PollOutcome::Published(report)
            }
            Err(e) => {
                target.consecutive_errors += 1;
                warn!(
                    endpoint = target.client.endpoint(),
                    phase = "publish",
                    error = %e,
                    consecutive_errors = target.consecutive_errors,
                    "Publishing status failed"
                );
                PollOutcome::Failed(e.to_string())
            }
        }
    }

    async fn reconnect(&mut self, index: usize) -> Result<()> {
        let max_attempts = self.settings.max_reconnect_attempts;
        let delay = self.settings.reconnect_delay;
        let target = &mut self.targets[index];
        target.reconnect_at = None;

        match target.client.connect().await {
            Ok(()) => {
                info!(
                    endpoint = target.client.endpoint(),
                    attempts = target.reconnect_attempts + 1,
                    "Reconnected to apcupsd"
                );
                target.reconnect_attempts = 0;
                Ok(())
            }
            Err(e) => {
                target.reconnect_attempts += 1;
                warn!(
                    endpoint = target.client.endpoint(),
                    phase = "reconnect",
                    error = %e,
                    attempt = target.reconnect_attempts,
                    max_attempts,
                    "Reconnect failed"
                );
                if target.reconnect_attempts >= max_attempts {
                    return Err(UpssyncError::ReconnectExhausted {
                        endpoint: target.client.endpoint().to_string(),
                        attempts: target.reconnect_attempts,
                    });
                }
                target.reconnect_at = Some(Instant::now() + delay);
                Ok(())
            }
        }
    }

    fn next_reconnect(&self) -> Option<Instant> {
        self.targets.iter().filter_map(|t| t.reconnect_at).min()
    }

    /// Apply queued client events
    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ClientEvent::Connected { endpoint } => debug!(endpoint, "Client connected"),
                ClientEvent::Disconnected { endpoint } => debug!(endpoint, "Client disconnected"),
                ClientEvent::Error { endpoint, message } => {
                    debug!(endpoint, message, "Client error");
                    if self.settings.mode == ConnectionMode::Persistent {
                        self.schedule_reconnect(&endpoint);
                    }
                }
            }
        }
    }

    fn schedule_reconnect(&mut self, endpoint: &str) {
        let delay = self.settings.reconnect_delay;
        let Some(target) = self.targets.iter_mut().find(|t| t.client.endpoint() == endpoint) else {
            debug!(endpoint, "Event for unknown endpoint");
            return;
        };
        if target.reconnect_at.is_none() {
            info!(endpoint, delay_secs = delay.as_secs_f64(), "Scheduling reconnect");
            target.reconnect_at = Some(Instant::now() + delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StateStore};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn frame(payload: &str) -> Vec<u8> {
        let mut out = (payload.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(payload.as_bytes());
        out
    }

    fn status_reply(lines: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for line in lines {
            out.extend(frame(line));
        }
        out.extend([0, 0]);
        out
    }

    /// Answer every request on every connection with `reply`
    async fn serve(reply: Vec<u8>) -> u16 {
        serve_counted(reply).await.0
    }

    /// Like [`serve`], also counting the requests answered
    async fn serve_counted(reply: Vec<u8>) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let reply = reply.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 || socket.write_all(&reply).await.is_err() {
                            return;
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        (port, requests)
    }

    /// Answer the first request on one connection, then hang up
    async fn serve_once_then_close(reply: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(&reply).await;
        });
        port
    }

    async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn settings(mode: ConnectionMode) -> SchedulerSettings {
        SchedulerSettings {
            mode,
            polling_interval: Duration::from_millis(1000),
            connect_timeout: Duration::from_millis(500),
            socket_timeout: Duration::from_millis(500),
            ping_interval: Duration::from_secs(10),
            ping_enabled: false,
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: 3,
        }
    }

    fn scheduler(mode: ConnectionMode, ports: &[u16], store: Arc<InMemoryStore>) -> PollScheduler {
        let targets: Vec<_> = ports
            .iter()
            .map(|port| TargetConfig::new("127.0.0.1", *port))
            .collect();
        PollScheduler::new(settings(mode), &targets, StateSynchronizer::new(store))
    }

    #[test]
    fn test_is_comm_lost() {
        let mut raw = RawRecord::new();
        assert!(!is_comm_lost(&raw));
        raw.insert("STATUS".into(), " COMMLOST ".into());
        assert!(is_comm_lost(&raw));
        raw.insert("STATUS".into(), "ONLINE".into());
        assert!(!is_comm_lost(&raw));
    }

    #[tokio::test]
    async fn test_per_poll_cycle_publishes_and_disconnects() {
        let port = serve(status_reply(&[
            "STATUS   : ONLINE",
            "SERIALNO : 3B1234X56789",
            "LINEV    : 230.0 Volts",
        ]))
        .await;
        let store = Arc::new(InMemoryStore::new());
        let mut scheduler = scheduler(ConnectionMode::PerPoll, &[port], store.clone());

        let outcomes = scheduler.run_cycle().await;

        assert!(matches!(outcomes[0], PollOutcome::Published(_)));
        let target = &scheduler.targets()[0];
        assert_eq!(target.id.as_deref(), Some("3B1234X56789"));
        assert!(target.last_success.is_some());
        assert_eq!(target.connection_state(), ConnectionState::Idle);
        let voltage = store.read_state("3B1234X56789.input.voltage").await.unwrap().unwrap();
        assert_eq!(voltage.value, serde_json::json!(230.0));
    }

    #[tokio::test]
    async fn test_comm_lost_publishes_nothing() {
        let port = serve(status_reply(&["STATUS   : COMMLOST", "SERIALNO : 3B1234X56789"])).await;
        let store = Arc::new(InMemoryStore::new());
        let mut scheduler = scheduler(ConnectionMode::PerPoll, &[port], store.clone());

        let outcomes = scheduler.run_cycle().await;

        assert_eq!(outcomes, vec![PollOutcome::CommunicationLost]);
        assert!(store.writes().is_empty());
        assert!(store.list_objects().await.unwrap().is_empty());
        assert_eq!(scheduler.targets()[0].consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_missing_serial_publishes_nothing() {
        let port = serve(status_reply(&["STATUS   : ONLINE"])).await;
        let store = Arc::new(InMemoryStore::new());
        let mut scheduler = scheduler(ConnectionMode::PerPoll, &[port], store.clone());

        assert_eq!(scheduler.run_cycle().await, vec![PollOutcome::MissingSerial]);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_target_does_not_block_others() {
        let dead = refused_port().await;
        let live = serve(status_reply(&["STATUS : ONLINE", "SERIALNO : UPSB"])).await;
        let store = Arc::new(InMemoryStore::new());
        let mut scheduler = scheduler(ConnectionMode::PerPoll, &[dead, live], store.clone());

        let outcomes = scheduler.run_cycle().await;

        assert!(matches!(outcomes[0], PollOutcome::Failed(_)));
        assert!(matches!(outcomes[1], PollOutcome::Published(_)));
        assert_eq!(scheduler.targets()[0].consecutive_errors, 1);
        assert!(store.read_state("UPSB.info.alive").await.unwrap().is_some());
        // Per-poll mode never schedules reconnects
        assert!(!scheduler.targets()[0].reconnect_pending());
    }

    #[tokio::test]
    async fn test_persistent_mode_keeps_connection() {
        let port = serve(status_reply(&["STATUS : ONLINE", "SERIALNO : UPSA"])).await;
        let store = Arc::new(InMemoryStore::new());
        let mut scheduler = scheduler(ConnectionMode::Persistent, &[port], store);

        scheduler.run_cycle().await;
        assert_eq!(scheduler.targets()[0].connection_state(), ConnectionState::Connected);
        let second = scheduler.run_cycle().await;
        assert!(matches!(second[0], PollOutcome::Published(_)));

        scheduler.ping_cycle().await;
        assert_eq!(scheduler.targets()[0].connection_state(), ConnectionState::Connected);

        scheduler.shutdown().await;
        assert_eq!(scheduler.targets()[0].connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_failed_ping_schedules_reconnect() {
        let reply = status_reply(&["STATUS : ONLINE", "SERIALNO : UPSA"]);
        let port = serve_once_then_close(reply).await;
        let store = Arc::new(InMemoryStore::new());
        let mut scheduler = scheduler(ConnectionMode::Persistent, &[port], store);

        let outcomes = scheduler.run_cycle().await;
        assert!(matches!(outcomes[0], PollOutcome::Published(_)));
        assert_eq!(scheduler.targets()[0].connection_state(), ConnectionState::Connected);
        // Let the server hang up
        tokio::time::sleep(Duration::from_millis(50)).await;

        scheduler.ping_cycle().await;

        let target = &scheduler.targets()[0];
        assert_eq!(target.connection_state(), ConnectionState::Faulted);
        assert!(target.reconnect_pending());
    }

    #[tokio::test]
    async fn test_run_pings_between_polls() {
        let (port, requests) =
            serve_counted(status_reply(&["STATUS : ONLINE", "SERIALNO : UPSA"])).await;
        let store = Arc::new(InMemoryStore::new());
        let mut settings = settings(ConnectionMode::Persistent);
        settings.ping_enabled = true;
        settings.ping_interval = Duration::from_millis(50);
        let targets = [TargetConfig::new("127.0.0.1", port)];
        let scheduler = PollScheduler::new(settings, &targets, StateSynchronizer::new(store));
        let token = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
        assert!(handle.await.unwrap().is_ok());

        // One status at startup, the rest pings; the next poll is 1 s away
        assert!(requests.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_persistent_error_schedules_reconnect_and_escalates() {
        let dead = refused_port().await;
        let store = Arc::new(InMemoryStore::new());
        let mut scheduler = scheduler(ConnectionMode::Persistent, &[dead], store);

        scheduler.run_cycle().await;
        assert!(scheduler.targets()[0].reconnect_pending());

        // Polls are skipped while the reconnect is pending
        let skipped = scheduler.run_cycle().await;
        assert!(matches!(skipped[0], PollOutcome::Failed(_)));

        let mut result = Ok(());
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            result = scheduler.reconnect_due().await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(
            result,
            Err(UpssyncError::ReconnectExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let port = serve(status_reply(&["STATUS : ONLINE", "SERIALNO : UPSA"])).await;
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(ConnectionMode::PerPoll, &[port], store.clone());
        let token = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();

        assert!(handle.await.unwrap().is_ok());
        // First cycle runs immediately
        assert!(store.read_state("UPSA.info.alive").await.unwrap().is_some());
    }
}
