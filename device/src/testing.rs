//! In-process mock telescope for tests
//!
//! Accepts TCP connections on a loopback port, records every command, answers
//! with canned responses and can push event lines on demand.

use crate::config::{DeviceConfig, SeestarConfig};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Session settings tuned for fast tests
pub fn test_config() -> SeestarConfig {
    let mut config = SeestarConfig::default();
    config.timeouts.connect_timeout_secs = 2;
    config.timeouts.read_timeout_secs = 1;
    config.timeouts.sync_command_timeout_secs = 5;
    config.timeouts.sync_poll_interval_ms = 50;
    config.timeouts.slow_warning_secs = 2;
    config.timeouts.event_poll_interval_ms = 50;
    config.timeouts.goto_timeout_secs = 5;
    config.timeouts.auto_focus_timeout_secs = 5;
    config.timeouts.polar_align_timeout_secs = 5;
    config.timeouts.dark_frame_timeout_secs = 5;
    config.timeouts.plate_solve_timeout_secs = 5;
    config.timeouts.park_timeout_secs = 5;
    config.imaging.guest_mode_init = false;
    config
}

enum Reply {
    Result(Value),
    Error(String),
}

struct MockState {
    received: Mutex<Vec<Value>>,
    replies: Mutex<HashMap<String, Reply>>,
    ignored: Mutex<HashSet<String>>,
    followups: Mutex<HashMap<String, Vec<Value>>>,
    outbound: broadcast::Sender<String>,
    drop_all: broadcast::Sender<()>,
    connections: AtomicUsize,
}

/// A fake Seestar listening on 127.0.0.1
pub struct MockSeestar {
    addr: SocketAddr,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockSeestar {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock listener");
        let addr = listener.local_addr().expect("mock address");

        let (outbound, _) = broadcast::channel(256);
        let (drop_all, _) = broadcast::channel(4);
        let state = Arc::new(MockState {
            received: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            ignored: Mutex::new(HashSet::new()),
            followups: Mutex::new(HashMap::new()),
            outbound,
            drop_all,
            connections: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        let mock = Self {
            addr,
            state,
            accept_task,
        };
        mock.respond_with(
            "get_device_state",
            json!({
                "device": {"firmware_ver_int": 2400, "name": "Mock Seestar"},
                "pi_status": {"battery_capacity": 90, "charger_status": "Full", "charge_online": true, "temp": 30.0}
            }),
        );
        mock.respond_with("scope_get_equ_coord", json!({"ra": 10.0, "dec": 20.0}));
        mock
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            name: "Mock Seestar".to_string(),
            ip_address: "127.0.0.1".to_string(),
            port: self.port(),
            send_udp_intro: false,
            ..Default::default()
        }
    }

    /// Answer `method` with `{"result": result, "code": 0}`
    pub fn respond_with(&self, method: &str, result: Value) {
        self.state
            .replies
            .lock()
            .unwrap()
            .insert(method.to_string(), Reply::Result(result));
    }

    /// Answer `method` with a top-level `error`
    pub fn respond_error(&self, method: &str, error: &str) {
        self.state
            .replies
            .lock()
            .unwrap()
            .insert(method.to_string(), Reply::Error(error.to_string()));
    }

    /// Never answer `method`
    pub fn ignore_method(&self, method: &str) {
        self.state
            .ignored
            .lock()
            .unwrap()
            .insert(method.to_string());
    }

    /// Emit `events` every time `method` is answered
    pub fn emit_after(&self, method: &str, events: Vec<Value>) {
        self.state
            .followups
            .lock()
            .unwrap()
            .insert(method.to_string(), events);
    }

    pub fn push_event(&self, event: Value) {
        self.push_line(&event.to_string());
    }

    pub fn push_line(&self, line: &str) {
        let _ = self.state.outbound.send(line.to_string());
    }

    /// Close every open connection; the listener keeps accepting
    pub fn drop_connections(&self) {
        let _ = self.state.drop_all.send(());
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|c| c["method"].as_str().map(str::to_string))
            .collect()
    }

    pub fn count_method(&self, method: &str) -> usize {
        self.received_methods()
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }

    /// Commands named `method`, oldest first
    pub fn commands(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|c| c["method"] == method)
            .collect()
    }

    /// Wait until `method` has been received at least once
    pub async fn wait_for_method(&self, method: &str, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.count_method(method) > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl Drop for MockSeestar {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = self.state.drop_all.send(());
    }
}

async fn serve(stream: TcpStream, state: Arc<MockState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut outbound = state.outbound.subscribe();
    let mut drop_all = state.drop_all.subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(command) = serde_json::from_str::<Value>(line.trim()) else { continue };
                state.received.lock().unwrap().push(command.clone());

                let method = command["method"].as_str().unwrap_or_default().to_string();
                if state.ignored.lock().unwrap().contains(&method) {
                    continue;
                }

                let mut out = reply_for(&state, &command, &method).to_string();
                out.push_str("\r\n");
                if let Some(events) = state.followups.lock().unwrap().get(&method) {
                    for event in events {
                        out.push_str(&event.to_string());
                        out.push_str("\r\n");
                    }
                }
                if write_half.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
            pushed = outbound.recv() => {
                let Ok(line) = pushed else { continue };
                let out = format!("{}\r\n", line);
                if write_half.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
            _ = drop_all.recv() => break,
        }
    }
}

fn reply_for(state: &MockState, command: &Value, method: &str) -> Value {
    let replies = state.replies.lock().unwrap();
    let mut reply = json!({
        "jsonrpc": "2.0",
        "Timestamp": "9507.244805160",
        "method": method,
        "id": command["id"],
    });
    match replies.get(method) {
        Some(Reply::Error(message)) => {
            reply["error"] = json!(message);
            reply["code"] = json!(207);
        }
        Some(Reply::Result(result)) => {
            reply["result"] = result.clone();
            reply["code"] = json!(0);
        }
        None => {
            reply["result"] = json!(0);
            reply["code"] = json!(0);
        }
    }
    reply
}
