//! UDP `scan_iscope` handshake
//!
//! The device expects this intro before it grants a TCP client guest-mode
//! control. Replies are optional; the TCP connect proceeds either way.

use crate::protocol::methods;
use crate::DEFAULT_DISCOVERY_PORT;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// A device that answered a discovery scan
#[derive(Debug, Clone)]
pub struct DiscoveredSeestar {
    pub address: IpAddr,
    /// The `result` object of the reply, when one was present
    pub info: Value,
}

fn intro_message() -> Vec<u8> {
    json!({"id": 1, "method": methods::SCAN_ISCOPE, "params": ""})
        .to_string()
        .into_bytes()
}

/// Send the intro to one host and collect replies until `wait` passes quietly
///
/// Returns the decoded replies; an empty list is not an error.
pub async fn send_udp_intro(host: &str, wait: Duration) -> Vec<Value> {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to bind UDP socket for intro: {}", e);
            return Vec::new();
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        debug!("Failed to enable broadcast on intro socket: {}", e);
    }

    let target = format!("{}:{}", host, DEFAULT_DISCOVERY_PORT);
    if let Err(e) = socket.send_to(&intro_message(), &target).await {
        warn!("Failed to send UDP intro to {}: {}", target, e);
        return Vec::new();
    }
    debug!("Sent UDP intro to {}", target);

    let mut replies = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => match serde_json::from_slice::<Value>(&buf[..len]) {
                Ok(value) => {
                    debug!("UDP intro reply from {}: {}", from, value);
                    replies.push(value);
                }
                Err(e) => debug!("Ignoring malformed UDP reply from {}: {}", from, e),
            },
            Ok(Err(e)) => {
                debug!("UDP intro receive error: {}", e);
                break;
            }
            Err(_) => break,
        }
    }
    replies
}

/// Broadcast the intro on the local network and list every device that answers
pub async fn discover_devices(total_wait: Duration) -> Vec<DiscoveredSeestar> {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to bind UDP socket for discovery: {}", e);
            return Vec::new();
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!("Failed to enable broadcast on discovery socket: {}", e);
        return Vec::new();
    }

    let broadcast_addr = SocketAddr::from(([255, 255, 255, 255], DEFAULT_DISCOVERY_PORT));
    if let Err(e) = socket.send_to(&intro_message(), broadcast_addr).await {
        warn!("Failed to send discovery broadcast: {}", e);
        return Vec::new();
    }

    let mut found: HashMap<IpAddr, Value> = HashMap::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + total_wait;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                let info = serde_json::from_slice::<Value>(&buf[..len])
                    .ok()
                    .and_then(|v| v.get("result").cloned())
                    .unwrap_or(Value::Null);
                found.entry(from.ip()).or_insert(info);
            }
            Ok(Err(e)) => {
                debug!("Discovery receive error: {}", e);
                break;
            }
            Err(_) => break,
        }
    }

    info!("Discovery found {} Seestar(s)", found.len());
    found
        .into_iter()
        .map(|(address, info)| DiscoveredSeestar { address, info })
        .collect()
}
