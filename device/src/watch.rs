//! Receiver and heartbeat tasks
//!
//! The receiver is the only reader of the control socket; it splits the byte
//! stream into lines and feeds them to the session. The heartbeat keeps the
//! link alive and is the only thing that notices a silently dropped socket.

use crate::discovery::send_udp_intro;
use crate::framing::LineBuffer;
use crate::protocol::methods;
use crate::session::SeestarSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pause before re-checking a closed socket in the receiver
const RECEIVER_IDLE_WAIT: Duration = Duration::from_millis(500);

/// Handles of a running watch
pub(crate) struct WatchTasks {
    shutdown: CancellationToken,
    receiver: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl SeestarSession {
    /// Connect and start the receiver and heartbeat tasks
    ///
    /// Returns whether the initial connect succeeded; the heartbeat keeps
    /// retrying either way. Calling it twice is a no-op.
    pub async fn start_watch_thread(self: &Arc<Self>) -> bool {
        let mut tasks = self.watch_tasks.lock().await;
        if tasks.is_some() {
            return self.is_connected();
        }

        info!("[{}] Starting watch on {}", self.name, self.transport.address());
        self.transport.set_watch_mode(true);

        if self.device.send_udp_intro {
            send_udp_intro(&self.device.ip_address, self.reconnect.discovery_timeout()).await;
        }
        let connected = self.transport.connect().await;

        let shutdown = CancellationToken::new();
        let receiver = tokio::spawn(receiver_loop(Arc::clone(self), shutdown.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(self), shutdown.clone()));
        *tasks = Some(WatchTasks {
            shutdown,
            receiver,
            heartbeat,
        });
        drop(tasks);

        if connected {
            self.initialize_after_connect().await;
        }
        connected
    }

    /// Stop both tasks and close the connection
    pub async fn end_watch_thread(&self) {
        let tasks = self.watch_tasks.lock().await.take();
        self.transport.set_watch_mode(false);

        if let Some(tasks) = tasks {
            tasks.shutdown.cancel();
            let _ = tasks.receiver.await;
            let _ = tasks.heartbeat.await;
            info!("[{}] Watch stopped", self.name);
        }
        self.transport.disconnect().await;
    }

    pub async fn is_watching(&self) -> bool {
        self.watch_tasks.lock().await.is_some()
    }
}

async fn receiver_loop(session: Arc<SeestarSession>, shutdown: CancellationToken) {
    let mut buffer = LineBuffer::new();

    loop {
        let data = tokio::select! {
            _ = shutdown.cancelled() => break,
            data = session.transport.receive() => data,
        };

        match data {
            Some(bytes) => {
                for line in buffer.push(&bytes) {
                    session.handle_inbound_line(&line);
                }
            }
            None => {
                if !session.transport.is_connected() {
                    // A partial line from the old connection can never complete.
                    buffer.clear();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVER_IDLE_WAIT) => {}
                    }
                }
            }
        }
    }
    debug!("[{}] Receiver exited", session.name);
}

async fn heartbeat_loop(session: Arc<SeestarSession>, shutdown: CancellationToken) {
    loop {
        let wait = if session.transport.is_connected() {
            session
                .send_command(methods::SCOPE_GET_EQU_COORD, None)
                .await;
            session.transport.notify_heartbeat();
            session.reconnect.heartbeat_interval()
        } else if session.transport.reconnect().await {
            info!("[{}] Reconnected", session.name);
            session.reconnect.heartbeat_interval()
        } else {
            session.reconnect.reconnect_wait()
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!("[{}] Heartbeat exited", session.name);
}
