//! apcupsd NIS client
//!
//! Owns one TCP connection to an apcupsd Network Information Server and
//! issues `status` / `ping` requests over it. The client never retries;
//! retry policy belongs to the scheduler.
//!
//! State machine: `Idle -> Connecting -> Connected -> (Idle | Faulted)`.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Plaintext protocol, trusted segment only
//! - SC-5: Denial of Service Protection - Bounded connect and read deadlines
//! - SI-4: System Monitoring - Connection lifecycle events

use crate::error::{Result, UpssyncError};
use crate::nis_codec::{self, LENGTH_PREFIX_LEN, PING_COMMAND, STATUS_COMMAND};
use crate::normalize::RawRecord;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

/// Default TCP connect deadline
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default deadline for a full request/response exchange
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on one framed response, prefixes included
pub const MAX_RESPONSE_LEN: usize = 64 * 1024;

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Last exchange failed; the socket has been dropped
    Faulted,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Faulted => "faulted",
        }
    }
}

/// Lifecycle notification emitted by the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { endpoint: String },
    Disconnected { endpoint: String },
    Error { endpoint: String, message: String },
}

/// Client for one apcupsd endpoint
#[derive(Debug)]
pub struct NisClient {
    address: String,
    port: u16,
    endpoint: String,
    stream: Option<TcpStream>,
    state: ConnectionState,
    connect_timeout: Duration,
    socket_timeout: Duration,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl NisClient {
    /// Create an idle client for `address:port`
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        let endpoint = format!("{}:{}", address, port);
        Self {
            address,
            port,
            endpoint,
            stream: None,
            state: ConnectionState::Idle,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            events: None,
        }
    }

    /// Override connect and socket deadlines
    pub fn with_timeouts(mut self, connect_timeout: Duration, socket_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.socket_timeout = socket_timeout;
        self
    }

    /// Attach a listener for lifecycle events
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Open the TCP connection. A refused or timed out connect is a
    /// [`UpssyncError::Connection`].
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let addr = (self.address.as_str(), self.port);
        let result = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await;

        match result {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                debug!("Connected to apcupsd");
                self.emit(ClientEvent::Connected {
                    endpoint: self.endpoint.clone(),
                });
                Ok(())
            }
            Ok(Err(source)) => {
                let err = UpssyncError::Connection {
                    endpoint: self.endpoint.clone(),
                    source,
                };
                self.fault(&err);
                Err(err)
            }
            Err(_) => {
                let err = UpssyncError::Connection {
                    endpoint: self.endpoint.clone(),
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", self.connect_timeout),
                    ),
                };
                self.fault(&err);
                Err(err)
            }
        }
    }

    /// Request the full status record set
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn status(&mut self) -> Result<RawRecord> {
        let response = self.exchange(STATUS_COMMAND, "status").await?;
        match nis_codec::decode_records(&response) {
            Ok(records) => {
                debug!(fields = records.len(), "Received status records");
                Ok(records.into_iter().collect())
            }
            Err(e) => {
                self.fault(&e);
                Err(e)
            }
        }
    }

    /// Liveness probe; any well-framed reply counts
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn ping(&mut self) -> Result<()> {
        let response = self.exchange(PING_COMMAND, "ping").await?;
        match nis_codec::decode_frames(&response) {
            Ok(frames) => {
                debug!(frames = frames.len(), "Ping answered");
                Ok(())
            }
            Err(e) => {
                self.fault(&e);
                Err(e)
            }
        }
    }

    /// Close the socket. Safe in every state.
    pub async fn disconnect(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            self.state = ConnectionState::Idle;
            return;
        };

        if let Err(e) = stream.shutdown().await {
            debug!(endpoint = %self.endpoint, error = %e, "Socket shutdown failed");
        }
        self.state = ConnectionState::Idle;
        self.emit(ClientEvent::Disconnected {
            endpoint: self.endpoint.clone(),
        });
    }

    /// Send one command and collect the framed response up to the terminator
    async fn exchange(&mut self, command: &str, phase: &'static str) -> Result<Vec<u8>> {
        let request = nis_codec::encode_request(command)?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(UpssyncError::NotConnected(self.endpoint.clone()));
        };

        let endpoint = self.endpoint.as_str();
        let result = tokio::time::timeout(self.socket_timeout, async {
            stream
                .write_all(&request)
                .await
                .map_err(|source| UpssyncError::Connection {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
            read_response(stream, endpoint).await
        })
        .await;

        match result {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => {
                self.fault(&err);
                Err(err)
            }
            Err(_) => {
                let err = UpssyncError::Timeout {
                    endpoint: self.endpoint.clone(),
                    phase,
                };
                self.fault(&err);
                Err(err)
            }
        }
    }

    fn fault(&mut self, err: &UpssyncError) {
        debug!(endpoint = %self.endpoint, error = %err, "apcupsd client faulted");
        self.stream = None;
        self.state = ConnectionState::Faulted;
        self.emit(ClientEvent::Error {
            endpoint: self.endpoint.clone(),
            message: err.to_string(),
        });
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!(endpoint = %self.endpoint, "Client event listener dropped");
            }
        }
    }
}

/// Read records until the zero-length terminator, returning the raw bytes
async fn read_response(stream: &mut TcpStream, endpoint: &str) -> Result<Vec<u8>> {
    let io_err = |source| UpssyncError::Connection {
        endpoint: endpoint.to_string(),
        source,
    };

    let mut response = Vec::new();
    loop {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        stream.read_exact(&mut prefix).await.map_err(io_err)?;
        response.extend_from_slice(&prefix);

        let len = u16::from_be_bytes(prefix) as usize;
        if len == 0 {
            return Ok(response);
        }

        let start = response.len();
        if start + len > MAX_RESPONSE_LEN {
            return Err(UpssyncError::MalformedFrame(format!(
                "response from {} exceeds {} bytes",
                endpoint, MAX_RESPONSE_LEN
            )));
        }
        response.resize(start + len, 0);
        stream
            .read_exact(&mut response[start..])
            .await
            .map_err(io_err)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn serve_once(reply: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut prefix = [0u8; 2];
            socket.read_exact(&mut prefix).await.unwrap();
            let mut command = vec![0u8; u16::from_be_bytes(prefix) as usize];
            socket.read_exact(&mut command).await.unwrap();
            socket.write_all(&reply).await.unwrap();
            // Hold the socket open until the client hangs up
            let mut sink = [0u8; 16];
            let _ = socket.read(&mut sink).await;
        });
        port
    }

    fn reply(lines: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for line in lines {
            buf.extend(nis_codec::encode_request(line).unwrap());
        }
        buf.extend_from_slice(&nis_codec::encode_terminator());
        buf
    }

    #[test]
    fn test_new_client_is_idle() {
        let client = NisClient::new("10.0.0.5", 3551);
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(client.endpoint(), "10.0.0.5:3551");
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_status_requires_connection() {
        let mut client = NisClient::new("127.0.0.1", 3551);
        assert!(matches!(
            client.status().await,
            Err(UpssyncError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut client = NisClient::new("127.0.0.1", 3551);
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_status_exchange() {
        let port = serve_once(reply(&["STATUS   : ONLINE\n", "LINEV    : 230.0 Volts\n"])).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = NisClient::new("127.0.0.1", port).with_events(tx);

        client.connect().await.unwrap();
        assert!(client.is_connected());

        let record = client.status().await.unwrap();
        assert_eq!(record.get("STATUS").map(String::as_str), Some("ONLINE"));
        assert_eq!(record.get("LINEV").map(String::as_str), Some("230.0 Volts"));

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Idle);

        assert!(matches!(rx.recv().await, Some(ClientEvent::Connected { .. })));
        assert!(matches!(rx.recv().await, Some(ClientEvent::Disconnected { .. })));
    }

    #[tokio::test]
    async fn test_ping_accepts_text_reply() {
        let port = serve_once(reply(&["Invalid command\n"])).await;
        let mut client = NisClient::new("127.0.0.1", port);
        client.connect().await.unwrap();
        assert!(client.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_status_faults_client() {
        let port = serve_once(reply(&["no colon here"])).await;
        let mut client = NisClient::new("127.0.0.1", port);
        client.connect().await.unwrap();

        assert!(matches!(
            client.status().await,
            Err(UpssyncError::MalformedFrame(_))
        ));
        assert_eq!(client.state(), ConnectionState::Faulted);
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_read_timeout_faults_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = NisClient::new("127.0.0.1", port)
            .with_timeouts(Duration::from_secs(1), Duration::from_millis(100))
            .with_events(tx);
        client.connect().await.unwrap();

        let err = client.status().await.unwrap_err();
        assert!(matches!(err, UpssyncError::Timeout { phase: "status", .. }));
        assert_eq!(client.state(), ConnectionState::Faulted);

        assert!(matches!(rx.recv().await, Some(ClientEvent::Connected { .. })));
        assert!(matches!(rx.recv().await, Some(ClientEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_non_ascii_status_is_accepted() {
        let port = serve_once(reply(&[
            "UPSNAME  : B\u{fc}ro\n",
            "SERIALNO : 3B1234X56789\n",
            "STATUS   : ONLINE\n",
        ]))
        .await;
        let mut client = NisClient::new("127.0.0.1", port);
        client.connect().await.unwrap();

        let record = client.status().await.unwrap();
        assert_eq!(record.get("UPSNAME").map(String::as_str), Some("B\u{fc}ro"));
        assert_eq!(record.get("SERIALNO").map(String::as_str), Some("3B1234X56789"));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_oversized_response_faults_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 8];
            socket.read_exact(&mut request).await.unwrap();
            // Records forever, never the terminator
            let record = nis_codec::encode_request(&"X".repeat(1000)).unwrap();
            while socket.write_all(&record).await.is_ok() {}
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = NisClient::new("127.0.0.1", port)
            .with_timeouts(Duration::from_secs(1), Duration::from_secs(5))
            .with_events(tx);
        client.connect().await.unwrap();

        let err = client.status().await.unwrap_err();
        assert!(matches!(err, UpssyncError::MalformedFrame(_)));
        assert_eq!(client.state(), ConnectionState::Faulted);

        assert!(matches!(rx.recv().await, Some(ClientEvent::Connected { .. })));
        assert!(matches!(rx.recv().await, Some(ClientEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_connect_timeout_is_connection_error() {
        // Non-routable address; depending on the host this times out or fails fast
        let mut client = NisClient::new("10.255.255.1", 3551)
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(100));

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, UpssyncError::Connection { .. }), "{:?}", err);
        assert!(err.is_transient());
        assert_eq!(client.state(), ConnectionState::Faulted);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = NisClient::new("127.0.0.1", port);
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, UpssyncError::Connection { .. }));
        assert_eq!(client.state(), ConnectionState::Faulted);
    }
}
