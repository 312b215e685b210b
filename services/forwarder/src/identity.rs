//! Device identity registered with the remote store.

use crate::config::RelayConfig;
use crate::remote::DeviceInfo;
use std::net::UdpSocket;

/// Probe target used when no remote host is configured.
const FALLBACK_PROBE: &str = "8.8.8.8";

/// Build the identity from config, detecting the local ip when not set.
pub fn device_identity(cfg: &RelayConfig) -> DeviceInfo {
    let ip = cfg.device.ip.clone().or_else(|| {
        let target = if cfg.remote.host.trim().is_empty() {
            FALLBACK_PROBE
        } else {
            cfg.remote.host.as_str()
        };
        detect_local_ip(target)
    });
    DeviceInfo {
        device_key: cfg.device.key.clone(),
        location: cfg.device.location.clone(),
        ip,
    }
}

/// Detect the local IP used to reach `target`.
///
/// Connecting a UDP socket sends no traffic; the OS only picks the outgoing
/// interface, whose address is then read back.
pub fn detect_local_ip(target: &str) -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect((target, 9)).ok()?;
    let local = socket.local_addr().ok()?;
    if local.ip().is_unspecified() {
        return None;
    }
    Some(local.ip().to_string())
}
