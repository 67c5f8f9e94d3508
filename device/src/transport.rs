//! TCP transport for one Seestar channel
//!
//! Owns the socket exclusively. Every transport fault is logged and degraded
//! to `false`/`None`; callers never see an I/O error from this layer.
//!
//! The stream is split into owned halves. The read half is taken out of its
//! slot for the duration of a read so a blocked read never holds a lock that
//! `disconnect()` or a sender needs. A generation counter, bumped on every
//! connect and disconnect, keeps a stale read half from being put back after
//! the connection it belonged to was replaced.

use crate::config::{ReconnectConfig, SessionTimeoutConfig};
use crate::framing::{ImageFrameHeader, FRAME_HEADER_LEN};
use crate::protocol::LINE_TERMINATOR;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Read buffer size for the control channel
pub const RECV_BUFFER_SIZE: usize = 1024 * 60;

/// Largest imaging payload accepted from the device
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { device: String },
    Disconnected { device: String },
    Heartbeat { device: String },
}

/// One image frame read from the imaging channel
#[derive(Debug, Clone)]
pub struct ImageFrame {
    pub header: ImageFrameHeader,
    pub payload: Vec<u8>,
}

/// Socket owner for a single device channel
pub struct Transport {
    name: String,
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    backoff: Duration,
    connected: Arc<AtomicBool>,
    /// When set, broken sockets are reconnected and the failed call retried once
    watch_mode: AtomicBool,
    generation: AtomicU64,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Serialises connect/disconnect transitions
    transition: Mutex<()>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl Transport {
    pub fn new(
        name: &str,
        host: &str,
        port: u16,
        timeouts: &SessionTimeoutConfig,
        reconnect: &ReconnectConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            connect_timeout: timeouts.connect_timeout(),
            read_timeout: timeouts.read_timeout(),
            backoff: reconnect.reconnect_backoff(),
            connected: Arc::new(AtomicBool::new(false)),
            watch_mode: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            transition: Mutex::new(()),
            event_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_watch_mode(&self, enabled: bool) {
        self.watch_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn is_watch_mode(&self) -> bool {
        self.watch_mode.load(Ordering::SeqCst)
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Tell listeners a heartbeat went out
    pub fn notify_heartbeat(&self) {
        let _ = self.event_tx.send(ConnectionEvent::Heartbeat {
            device: self.name.clone(),
        });
    }

    /// Open the connection. Returns false on failure.
    pub async fn connect(&self) -> bool {
        let _guard = self.transition.lock().await;
        self.connect_locked().await
    }

    /// Close the connection. Safe to call when already closed.
    pub async fn disconnect(&self) {
        let _guard = self.transition.lock().await;
        self.disconnect_locked().await;
    }

    /// Ensure a connection, re-opening it if needed
    pub async fn reconnect(&self) -> bool {
        if self.is_connected() {
            return true;
        }

        let _guard = self.transition.lock().await;
        if self.is_connected() {
            return true;
        }

        self.disconnect_locked().await;
        if self.connect_locked().await {
            return true;
        }

        sleep(self.backoff).await;
        false
    }

    async fn connect_locked(&self) -> bool {
        if self.is_connected() {
            self.disconnect_locked().await;
        }

        let addr = self.address();
        debug!("[{}] Connecting to {}", self.name, addr);

        match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("[{}] Failed to set TCP_NODELAY: {}", self.name, e);
                }
                let (read_half, write_half) = stream.into_split();
                self.generation.fetch_add(1, Ordering::SeqCst);
                *self.reader.lock().await = Some(read_half);
                *self.writer.lock().await = Some(write_half);
                self.connected.store(true, Ordering::SeqCst);

                info!("[{}] Connected to {}", self.name, addr);
                let _ = self.event_tx.send(ConnectionEvent::Connected {
                    device: self.name.clone(),
                });
                true
            }
            Ok(Err(e)) => {
                warn!("[{}] Failed to connect to {}: {}", self.name, addr, e);
                self.connected.store(false, Ordering::SeqCst);
                false
            }
            Err(_) => {
                warn!(
                    "[{}] Connection to {} timed out after {:?}",
                    self.name, addr, self.connect_timeout
                );
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    async fn disconnect_locked(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("[{}] Error closing socket: {}", self.name, e);
            }
        }
        self.reader.lock().await.take();

        if was_connected {
            info!("[{}] Disconnected from {}", self.name, self.address());
            let _ = self.event_tx.send(ConnectionEvent::Disconnected {
                device: self.name.clone(),
            });
        }
    }

    /// Disconnect only if the connection is still the one identified by `generation`
    async fn disconnect_generation(&self, generation: u64) {
        let _guard = self.transition.lock().await;
        if self.generation.load(Ordering::SeqCst) == generation {
            self.disconnect_locked().await;
        }
    }

    /// Write one line, appending the terminator
    pub async fn send(&self, line: &str) -> bool {
        let mut payload = String::with_capacity(line.len() + LINE_TERMINATOR.len());
        payload.push_str(line);
        payload.push_str(LINE_TERMINATOR);

        for attempt in 0..2 {
            let result = {
                let mut writer = self.writer.lock().await;
                match writer.as_mut() {
                    Some(w) => Some(w.write_all(payload.as_bytes()).await),
                    None => None,
                }
            };

            match result {
                Some(Ok(())) => return true,
                None => {
                    debug!("[{}] Not connected; dropping send", self.name);
                    return false;
                }
                Some(Err(e)) if is_broken_connection(&e) => {
                    warn!("[{}] Connection broken during send: {}", self.name, e);
                    self.disconnect().await;
                    if attempt == 0 && self.is_watch_mode() && self.reconnect().await {
                        continue;
                    }
                    return false;
                }
                Some(Err(e)) => {
                    error!("[{}] Send failed: {}", self.name, e);
                    return false;
                }
            }
        }
        false
    }

    /// Read whatever bytes are available, up to [`RECV_BUFFER_SIZE`]
    ///
    /// Returns `None` on timeout, on error, on peer close, or when not connected.
    pub async fn receive(&self) -> Option<Vec<u8>> {
        for attempt in 0..2 {
            let generation = self.generation.load(Ordering::SeqCst);
            let mut half = self.reader.lock().await.take()?;

            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            match timeout(self.read_timeout, half.read(&mut buf)).await {
                Err(_) => {
                    self.restore_reader(half, generation).await;
                    return None;
                }
                Ok(Ok(0)) => {
                    info!("[{}] Peer closed the connection", self.name);
                    drop(half);
                    self.disconnect_generation(generation).await;
                    return None;
                }
                Ok(Ok(n)) => {
                    self.restore_reader(half, generation).await;
                    buf.truncate(n);
                    return Some(buf);
                }
                Ok(Err(e)) => {
                    warn!("[{}] Receive failed: {}", self.name, e);
                    drop(half);
                    self.disconnect_generation(generation).await;
                    if attempt == 0 && self.is_watch_mode() && self.reconnect().await {
                        continue;
                    }
                    return None;
                }
            }
        }
        None
    }

    /// Read one header-prefixed frame from the imaging channel
    pub async fn read_frame(&self) -> Option<ImageFrame> {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut half = self.reader.lock().await.take()?;

        let mut raw_header = [0u8; FRAME_HEADER_LEN];
        match timeout(self.read_timeout, half.read_exact(&mut raw_header)).await {
            Err(_) => {
                self.restore_reader(half, generation).await;
                return None;
            }
            Ok(Err(e)) => {
                warn!("[{}] Frame header read failed: {}", self.name, e);
                drop(half);
                self.disconnect_generation(generation).await;
                return None;
            }
            Ok(Ok(_)) => {}
        }

        let header = match ImageFrameHeader::parse(&raw_header) {
            Ok(header) => header,
            Err(e) => {
                warn!("[{}] {}", self.name, e);
                self.restore_reader(half, generation).await;
                return None;
            }
        };

        if header.size as usize > MAX_FRAME_LEN {
            // The payload cannot be skipped safely, so the stream is unusable.
            warn!(
                "[{}] Frame of {} bytes exceeds the {} byte limit",
                self.name, header.size, MAX_FRAME_LEN
            );
            drop(half);
            self.disconnect_generation(generation).await;
            return None;
        }

        let mut payload = vec![0u8; header.size as usize];
        // Large frames trickle in; give the payload its own deadline.
        match timeout(self.read_timeout * 3, half.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {
                self.restore_reader(half, generation).await;
                Some(ImageFrame { header, payload })
            }
            Ok(Err(e)) => {
                warn!("[{}] Frame payload read failed: {}", self.name, e);
                drop(half);
                self.disconnect_generation(generation).await;
                None
            }
            Err(_) => {
                // Mid-frame timeout leaves the stream desynchronised.
                warn!(
                    "[{}] Frame payload of {} bytes timed out",
                    self.name, header.size
                );
                drop(half);
                self.disconnect_generation(generation).await;
                None
            }
        }
    }

    async fn restore_reader(&self, half: OwnedReadHalf, generation: u64) {
        let mut slot = self.reader.lock().await;
        if slot.is_none() && self.generation.load(Ordering::SeqCst) == generation {
            *slot = Some(half);
        }
    }
}

fn is_broken_connection(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}
