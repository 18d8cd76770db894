//! Flow identity — a stable id derived from the 5-tuple plus the epoch at
//! which the flow was first observed, so a port pair that gets reused
//! later doesn't collide with an older, already-closed flow.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;

/// The 5-tuple that identifies a single TCP or UDP flow, already
/// direction-normalized: `a` is always the lower (ip, port) pair so the
/// same flow hashes identically regardless of which side a packet came
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub protocol: u8,
    pub a_ip: Ipv4Addr,
    pub a_port: u16,
    pub b_ip: Ipv4Addr,
    pub b_port: u16,
}

impl FlowTuple {
    pub fn new(protocol: u8, ip1: Ipv4Addr, port1: u16, ip2: Ipv4Addr, port2: u16) -> Self {
        if (ip1, port1) <= (ip2, port2) {
            Self {
                protocol,
                a_ip: ip1,
                a_port: port1,
                b_ip: ip2,
                b_port: port2,
            }
        } else {
            Self {
                protocol,
                a_ip: ip2,
                a_port: port2,
                b_ip: ip1,
                b_port: port1,
            }
        }
    }
}

/// A stable identifier for one flow's lifetime: the normalized tuple
/// hashed together with the epoch second at which the flow was created.
/// Displayed as a fixed-width hex string for the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(u64);

impl FlowId {
    pub fn new(tuple: FlowTuple, started_at_epoch_secs: i64) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        tuple.hash(&mut hasher);
        started_at_epoch_secs.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_normalizes_direction() {
        let ip_a = Ipv4Addr::new(10, 0, 0, 1);
        let ip_b = Ipv4Addr::new(10, 0, 0, 2);

        let forward = FlowTuple::new(6, ip_a, 5000, ip_b, 443);
        let reverse = FlowTuple::new(6, ip_b, 443, ip_a, 5000);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_same_tuple_same_epoch_same_id() {
        let tuple = FlowTuple::new(6, Ipv4Addr::new(10, 0, 0, 1), 5000, Ipv4Addr::new(10, 0, 0, 2), 443);
        assert_eq!(FlowId::new(tuple, 1000), FlowId::new(tuple, 1000));
    }

    #[test]
    fn test_reused_port_pair_different_epoch_differs() {
        let tuple = FlowTuple::new(6, Ipv4Addr::new(10, 0, 0, 1), 5000, Ipv4Addr::new(10, 0, 0, 2), 443);
        assert_ne!(FlowId::new(tuple, 1000), FlowId::new(tuple, 2000));
    }
}
