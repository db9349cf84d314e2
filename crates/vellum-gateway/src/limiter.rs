//! Per-IP connection accounting, enforced before upgrade.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

/// Counts live connections per source IP against a cap.
#[derive(Debug)]
pub struct ConnectionLimiter {
    per_ip: DashMap<IpAddr, usize>,
    max_per_ip: usize,
}

impl ConnectionLimiter {
    /// Create a limiter allowing `max_per_ip` concurrent connections.
    #[must_use]
    pub fn new(max_per_ip: usize) -> Arc<Self> {
        Arc::new(Self {
            per_ip: DashMap::new(),
            max_per_ip,
        })
    }

    /// Try to admit a connection from `ip`.
    ///
    /// Returns a permit that releases the slot on drop, or `None` when
    /// the IP is at its cap.
    #[must_use]
    pub fn acquire(self: &Arc<Self>, ip: IpAddr) -> Option<ConnectionPermit> {
        let mut entry = self.per_ip.entry(ip).or_insert(0);
        if *entry >= self.max_per_ip {
            debug!(%ip, cap = self.max_per_ip, "connection refused by per-IP cap");
            return None;
        }
        *entry += 1;
        drop(entry);
        Some(ConnectionPermit {
            limiter: Arc::clone(self),
            ip,
        })
    }

    /// Live connection count for `ip` (diagnostics).
    #[must_use]
    pub fn count(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).map_or(0, |n| *n)
    }

    fn release(&self, ip: IpAddr) {
        if let Some(mut entry) = self.per_ip.get_mut(&ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                drop(entry);
                self.per_ip.remove_if(&ip, |_, n| *n == 0);
            }
        }
    }
}

/// RAII admission slot; dropping it frees the IP's slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    limiter: Arc<ConnectionLimiter>,
    ip: IpAddr,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limiter.release(self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn cap_is_enforced_per_ip() {
        let limiter = ConnectionLimiter::new(2);

        let a1 = limiter.acquire(ip(1)).unwrap();
        let _a2 = limiter.acquire(ip(1)).unwrap();
        assert!(limiter.acquire(ip(1)).is_none());

        // A different IP is unaffected.
        let _b1 = limiter.acquire(ip(2)).unwrap();

        // Releasing a slot readmits.
        drop(a1);
        assert!(limiter.acquire(ip(1)).is_some());
    }

    #[test]
    fn counts_drop_to_zero_and_entries_are_cleaned() {
        let limiter = ConnectionLimiter::new(4);
        let permit = limiter.acquire(ip(7)).unwrap();
        assert_eq!(limiter.count(ip(7)), 1);

        drop(permit);
        assert_eq!(limiter.count(ip(7)), 0);
        assert!(limiter.per_ip.get(&ip(7)).is_none());
    }
}
