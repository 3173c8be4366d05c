//! session.rs — per-connection state.
//!
//! One `Session` per accepted socket, owned entirely by that connection's
//! task: the read buffer, the device identity once a frame reveals it, and
//! the publish-gate caches. Nothing in here is shared across sessions.

use std::net::SocketAddr;
use std::time::Instant;

use jt808_proto::{DeviceId, FrameScanner};
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::gate::DeviceGate;

pub struct Session {
    pub peer_addr: SocketAddr,
    pub created_at: Instant,
    pub scanner: FrameScanner,
    pub gate: DeviceGate,
    device_id: Option<DeviceId>,
    serial_no: u16,
}

impl Session {
    pub fn new(peer_addr: SocketAddr, cfg: &GatewayConfig) -> Self {
        Self {
            peer_addr,
            created_at: Instant::now(),
            scanner: FrameScanner::new(),
            gate: DeviceGate::new(cfg),
            device_id: None,
            serial_no: 0,
        }
    }

    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    /// Identity for log lines; `unknown` until the first frame arrives.
    pub fn device_label(&self) -> &str {
        self.device_id.as_ref().map_or("unknown", DeviceId::as_str)
    }

    /// First identity wins: a later frame claiming a different id is logged
    /// and ignored, never fatal.
    pub fn identify(&mut self, id: &DeviceId) {
        match &self.device_id {
            None => {
                info!(peer = %self.peer_addr, device = %id, "session identified");
                self.device_id = Some(id.clone());
            }
            Some(current) if current == id => {}
            Some(current) => {
                warn!(
                    peer = %self.peer_addr,
                    device = %current,
                    claimed = %id,
                    "identity conflict: keeping first device id"
                );
            }
        }
    }

    /// Serial counter for platform-originated frames, wrapping at 0xFFFF.
    pub fn next_serial(&mut self) -> u16 {
        self.serial_no = self.serial_no.wrapping_add(1);
        self.serial_no
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("127.0.0.1:9999".parse().unwrap(), &GatewayConfig::default())
    }

    #[test]
    fn first_identity_wins() {
        let mut s = session();
        assert_eq!(s.device_label(), "unknown");

        let first = DeviceId::from_digits("123456789012");
        let second = DeviceId::from_digits("999999999999");
        s.identify(&first);
        s.identify(&second);
        assert_eq!(s.device_id(), Some(&first));
    }

    #[test]
    fn reidentifying_with_same_id_is_fine() {
        let mut s = session();
        let id = DeviceId::from_digits("123456789012");
        s.identify(&id);
        s.identify(&id);
        assert_eq!(s.device_id(), Some(&id));
    }

    #[test]
    fn serials_increment_and_wrap() {
        let mut s = session();
        assert_eq!(s.next_serial(), 1);
        assert_eq!(s.next_serial(), 2);
        s.serial_no = u16::MAX;
        assert_eq!(s.next_serial(), 0);
    }
}
