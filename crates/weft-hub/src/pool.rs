//! IP address pool for overlay peers.
//!
//! First-fit allocation over the configured CIDR, serialized by a single
//! mutex so repeated allocate/release cycles stay deterministic. Network and
//! broadcast addresses are never handed out; caller-reserved addresses are
//! validated against the CIDR at construction.

use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("peer {peer_id} already has {ip} allocated")]
    AlreadyAllocated { peer_id: String, ip: Ipv4Addr },
    #[error("IP pool {network} exhausted ({allocated} allocated)")]
    Exhausted { network: Ipv4Net, allocated: usize },
    #[error("peer {0} has no IP allocated")]
    NotAllocated(String),
    #[error("reserved IP {ip} is not in network {network}")]
    ReservedOutsideNetwork { ip: Ipv4Addr, network: Ipv4Net },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub reserved: usize,
    pub allocated: usize,
    pub available: usize,
    pub util_pct: u32,
}

#[derive(Debug, Default)]
struct PoolInner {
    allocations: HashMap<String, Ipv4Addr>,
}

/// Thread-safe allocator over one IPv4 CIDR.
#[derive(Debug)]
pub struct IpPool {
    network: Ipv4Net,
    reserved: HashSet<Ipv4Addr>,
    total_hosts: usize,
    inner: Mutex<PoolInner>,
}

impl IpPool {
    pub fn new(network: Ipv4Net, reserved: &[Ipv4Addr]) -> Result<Self, PoolError> {
        let mut reserved_set = HashSet::new();
        for &ip in reserved {
            if !network.contains(&ip) {
                return Err(PoolError::ReservedOutsideNetwork { ip, network });
            }
            // Network/broadcast are implicitly excluded from hosts().
            if ip == network.network() || ip == network.broadcast() {
                continue;
            }
            reserved_set.insert(ip);
        }

        let total_hosts = network.hosts().count();

        tracing::info!(
            event = "weft.pool.initialized",
            network = %network,
            reserved = reserved_set.len(),
            total = total_hosts,
            "IP pool initialized"
        );

        Ok(Self {
            network,
            reserved: reserved_set,
            total_hosts,
            inner: Mutex::new(PoolInner::default()),
        })
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Allocate the first free host address to `peer_id`.
    pub fn allocate(&self, peer_id: &str) -> Result<Ipv4Addr, PoolError> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");

        if let Some(&ip) = inner.allocations.get(peer_id) {
            return Err(PoolError::AlreadyAllocated {
                peer_id: peer_id.to_string(),
                ip,
            });
        }

        let in_use: HashSet<Ipv4Addr> = inner.allocations.values().copied().collect();
        for ip in self.network.hosts() {
            if self.reserved.contains(&ip) || in_use.contains(&ip) {
                continue;
            }
            inner.allocations.insert(peer_id.to_string(), ip);
            tracing::info!(
                event = "weft.pool.allocated",
                peer_id,
                ip = %ip,
                "allocated IP"
            );
            return Ok(ip);
        }

        Err(PoolError::Exhausted {
            network: self.network,
            allocated: inner.allocations.len(),
        })
    }

    pub fn release(&self, peer_id: &str) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        match inner.allocations.remove(peer_id) {
            Some(ip) => {
                tracing::info!(
                    event = "weft.pool.released",
                    peer_id,
                    ip = %ip,
                    "released IP"
                );
                Ok(())
            }
            None => Err(PoolError::NotAllocated(peer_id.to_string())),
        }
    }

    pub fn lookup(&self, peer_id: &str) -> Option<Ipv4Addr> {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner.allocations.get(peer_id).copied()
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner.allocations.values().any(|&a| a == ip)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("pool lock poisoned");
        let allocated = inner.allocations.len();
        let reserved = self.reserved.len();
        let allocatable = self.total_hosts.saturating_sub(reserved);
        let available = allocatable.saturating_sub(allocated);
        let util_pct = if allocatable > 0 {
            (allocated * 100 / allocatable) as u32
        } else {
            0
        };

        PoolStats {
            total: self.total_hosts,
            reserved,
            allocated,
            available,
            util_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str, reserved: &[&str]) -> IpPool {
        let network: Ipv4Net = cidr.parse().unwrap();
        let reserved: Vec<Ipv4Addr> = reserved.iter().map(|s| s.parse().unwrap()).collect();
        IpPool::new(network, &reserved).unwrap()
    }

    #[test]
    fn allocates_first_fit_skipping_reserved() {
        let pool = pool("10.0.0.0/24", &["10.0.0.1"]);
        assert_eq!(pool.allocate("a").unwrap(), "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(pool.allocate("b").unwrap(), "10.0.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn released_address_is_reused_deterministically() {
        let pool = pool("10.0.0.0/24", &["10.0.0.1"]);
        pool.allocate("a").unwrap();
        pool.allocate("b").unwrap();
        pool.release("a").unwrap();
        // First-fit scan hands the lowest free host back out.
        assert_eq!(pool.allocate("c").unwrap(), "10.0.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn double_allocate_same_peer_fails() {
        let pool = pool("10.0.0.0/24", &[]);
        pool.allocate("a").unwrap();
        assert!(matches!(
            pool.allocate("a"),
            Err(PoolError::AlreadyAllocated { .. })
        ));
    }

    #[test]
    fn exhaustion_after_five_hosts_on_slash_29() {
        let pool = pool("10.0.0.0/29", &["10.0.0.1"]);
        for (peer, expected) in [
            ("n1", "10.0.0.2"),
            ("n2", "10.0.0.3"),
            ("n3", "10.0.0.4"),
            ("n4", "10.0.0.5"),
            ("n5", "10.0.0.6"),
        ] {
            assert_eq!(
                pool.allocate(peer).unwrap(),
                expected.parse::<Ipv4Addr>().unwrap()
            );
        }
        assert!(matches!(
            pool.allocate("n6"),
            Err(PoolError::Exhausted { .. })
        ));
    }

    #[test]
    fn release_unknown_peer_fails() {
        let pool = pool("10.0.0.0/24", &[]);
        assert!(matches!(pool.release("ghost"), Err(PoolError::NotAllocated(_))));
    }

    #[test]
    fn reserved_outside_network_rejected_at_construction() {
        let network: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let err = IpPool::new(network, &["192.168.1.1".parse().unwrap()]).unwrap_err();
        assert!(matches!(err, PoolError::ReservedOutsideNetwork { .. }));
    }

    #[test]
    fn allocations_never_collide() {
        let pool = pool("10.0.0.0/28", &[]);
        let mut seen = HashSet::new();
        for i in 0..14 {
            let ip = pool.allocate(&format!("peer-{i}")).unwrap();
            assert!(pool.network().contains(&ip));
            assert_ne!(ip, pool.network().network());
            assert_ne!(ip, pool.network().broadcast());
            assert!(seen.insert(ip), "duplicate allocation {ip}");
        }
    }

    #[test]
    fn stats_reflect_utilization() {
        let pool = pool("10.0.0.0/29", &["10.0.0.1"]);
        pool.allocate("a").unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.available, 4);
        assert_eq!(stats.util_pct, 20);
    }
}
