use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::Ipv4Net;
use rustc_hash::FxHashMap;

use crate::error::Error;

/// One live binding. Timestamps are seconds since the epoch, supplied by
/// the caller so the whole table can be driven from a cached clock.
#[derive(Debug, Clone, Copy)]
struct Lease {
    v4: u32,
    last_use: u64,
    used_since_scan: bool,
}

/// A bidirectional IPv6-to-IPv4 binding table that leases addresses out of
/// an IPv4 CIDR.
///
/// Addresses are assigned lowest-free-first, skipping the pool's network
/// and broadcast addresses and any explicitly excluded addresses. A binding
/// idle for longer than `idle_timeout` is removed by [`Ipv4Pool::scan`],
/// and its address is quarantined until the following scan so an in-flight
/// packet cannot observe the address under a new owner.
#[derive(Debug)]
pub struct Ipv4Pool {
    range: Ipv4Net,
    idle_timeout: u64,
    excluded: Vec<u32>,
    leases: FxHashMap<u128, Lease>,
    by_v4: FxHashMap<u32, u128>,
    quarantine: Vec<u32>,
    dirty: bool,
}

impl Ipv4Pool {
    #[must_use]
    pub fn new(range: Ipv4Net, idle_timeout: u64) -> Self {
        Self {
            range,
            idle_timeout,
            excluded: Vec::new(),
            leases: FxHashMap::default(),
            by_v4: FxHashMap::default(),
            quarantine: Vec::new(),
            dirty: false,
        }
    }

    /// Withhold an address from assignment (e.g. the translator's own).
    pub fn exclude(&mut self, addr: Ipv4Addr) {
        let addr = u32::from(addr);
        if !self.excluded.contains(&addr) {
            self.excluded.push(addr);
        }
    }

    #[must_use]
    pub fn range(&self) -> Ipv4Net {
        self.range
    }

    /// Check whether an address falls inside the pool CIDR.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.range.contains(&addr)
    }

    /// Number of addresses this pool can lease out.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.range
            .hosts()
            .filter(|a| !self.excluded.contains(&u32::from(*a)))
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Look up the IPv4 address bound to `v6`, assigning a fresh one if the
    /// binding does not exist yet. Refreshes the binding's last-use stamp.
    pub fn get_or_assign(&mut self, v6: Ipv6Addr, now: u64) -> Result<Ipv4Addr, Error> {
        let key = u128::from(v6);
        if let Some(lease) = self.leases.get_mut(&key) {
            lease.last_use = now;
            lease.used_since_scan = true;
            return Ok(Ipv4Addr::from(lease.v4));
        }

        let v4 = self.next_free()?;
        self.leases.insert(
            key,
            Lease {
                v4,
                last_use: now,
                used_since_scan: true,
            },
        );
        self.by_v4.insert(v4, key);
        self.dirty = true;
        log::info!(
            "Assigned dynamic address {} to {}",
            Ipv4Addr::from(v4),
            v6
        );
        Ok(Ipv4Addr::from(v4))
    }

    /// Look up the IPv4 address bound to `v6` without assigning one.
    pub fn v4_for(&mut self, v6: Ipv6Addr, now: u64) -> Option<Ipv4Addr> {
        let lease = self.leases.get_mut(&u128::from(v6))?;
        lease.last_use = now;
        lease.used_since_scan = true;
        Some(Ipv4Addr::from(lease.v4))
    }

    /// Reverse lookup; inbound traffic also keeps a binding alive.
    pub fn v6_for(&mut self, v4: Ipv4Addr, now: u64) -> Option<Ipv6Addr> {
        let key = *self.by_v4.get(&u32::from(v4))?;
        let lease = self.leases.get_mut(&key)?;
        lease.last_use = now;
        lease.used_since_scan = true;
        Some(Ipv6Addr::from(key))
    }

    /// Install a specific binding, used when reloading a saved table.
    pub fn insert(&mut self, v6: Ipv6Addr, v4: Ipv4Addr, last_use: u64) -> Result<(), Error> {
        if !self.range.contains(&v4) {
            return Err(Error::AddressOutsidePool(v4));
        }
        let (key, v4) = (u128::from(v6), u32::from(v4));
        if self.by_v4.contains_key(&v4) {
            return Err(Error::AddressInUse(Ipv4Addr::from(v4)));
        }
        if let Some(old) = self.leases.remove(&key) {
            self.by_v4.remove(&old.v4);
        }
        self.leases.insert(
            key,
            Lease {
                v4,
                last_use,
                used_since_scan: false,
            },
        );
        self.by_v4.insert(v4, key);
        self.dirty = true;
        Ok(())
    }

    /// Remove bindings idle longer than the timeout. Returns the number of
    /// bindings reaped. Addresses freed here are not reissued until the
    /// next scan.
    pub fn scan(&mut self, now: u64) -> usize {
        self.quarantine.clear();
        let timeout = self.idle_timeout;
        let quarantine = &mut self.quarantine;
        let by_v4 = &mut self.by_v4;
        self.leases.retain(|v6, lease| {
            let keep = lease.used_since_scan || lease.last_use + timeout >= now;
            lease.used_since_scan = false;
            if !keep {
                log::debug!(
                    "Expiring dynamic address {} held by {}",
                    Ipv4Addr::from(lease.v4),
                    Ipv6Addr::from(*v6)
                );
                by_v4.remove(&lease.v4);
                quarantine.push(lease.v4);
            }
            keep
        });
        if !self.quarantine.is_empty() {
            self.dirty = true;
        }
        self.quarantine.len()
    }

    /// Read and clear the modified-since-last-save flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Iterate over live bindings as `(v6, v4, last_use)`.
    pub fn bindings(&self) -> impl Iterator<Item = (Ipv6Addr, Ipv4Addr, u64)> + '_ {
        self.leases
            .iter()
            .map(|(v6, lease)| (Ipv6Addr::from(*v6), Ipv4Addr::from(lease.v4), lease.last_use))
    }

    fn next_free(&self) -> Result<u32, Error> {
        let capacity = self.capacity();
        if self.leases.len() >= capacity {
            return Err(Error::PoolExhausted(capacity));
        }
        self.range
            .hosts()
            .map(u32::from)
            .find(|a| {
                !self.excluded.contains(a)
                    && !self.quarantine.contains(a)
                    && !self.by_v4.contains_key(a)
            })
            .ok_or(Error::PoolExhausted(capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Ipv4Pool {
        let mut pool = Ipv4Pool::new("198.51.100.0/29".parse().unwrap(), 7200);
        pool.exclude("198.51.100.1".parse().unwrap());
        pool
    }

    #[test]
    fn test_assign_lowest_free_and_idempotent() {
        let mut pool = pool();
        let a = pool.get_or_assign("2001:db8::1".parse().unwrap(), 100).unwrap();
        let b = pool.get_or_assign("2001:db8::2".parse().unwrap(), 100).unwrap();
        assert_eq!(a, "198.51.100.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b, "198.51.100.3".parse::<Ipv4Addr>().unwrap());
        // Same source keeps its lease
        let again = pool.get_or_assign("2001:db8::1".parse().unwrap(), 200).unwrap();
        assert_eq!(a, again);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = pool();
        // /29 has 6 hosts, one excluded
        for i in 0..5u32 {
            pool.get_or_assign(Ipv6Addr::from(0x2001_0db8_0000_0000_0000_0000_0000_0000u128 + u128::from(i)), 0)
                .unwrap();
        }
        assert_eq!(
            pool.get_or_assign("2001:db8::ffff".parse().unwrap(), 0),
            Err(Error::PoolExhausted(5))
        );
    }

    #[test]
    fn test_no_duplicate_v4_across_live_bindings() {
        let mut pool = pool();
        let mut seen = std::collections::HashSet::new();
        for i in 0..5u32 {
            let v4 = pool
                .get_or_assign(Ipv6Addr::from(u128::from(i) + 1), 0)
                .unwrap();
            assert!(seen.insert(v4), "duplicate lease {v4}");
        }
    }

    #[test]
    fn test_scan_reaps_idle_but_spares_used() {
        let mut pool = pool();
        let idle: Ipv6Addr = "2001:db8::a".parse().unwrap();
        let busy: Ipv6Addr = "2001:db8::b".parse().unwrap();
        pool.get_or_assign(idle, 0).unwrap();
        pool.get_or_assign(busy, 0).unwrap();
        // First scan clears the used flags
        assert_eq!(pool.scan(1), 0);
        // Traffic on `busy` only
        pool.v4_for(busy, 2).unwrap();
        let reaped = pool.scan(10_000);
        assert_eq!(reaped, 1);
        assert!(pool.v4_for(idle, 10_001).is_none());
        assert!(pool.v4_for(busy, 10_001).is_some());
    }

    #[test]
    fn test_used_flag_protects_within_timeout_window() {
        let mut pool = pool();
        let v6: Ipv6Addr = "2001:db8::c".parse().unwrap();
        pool.get_or_assign(v6, 0).unwrap();
        // Even though last_use + timeout < now, the used flag from the
        // assignment protects the binding for one scan.
        assert_eq!(pool.scan(50_000), 0);
        // No traffic since: the next scan takes it.
        assert_eq!(pool.scan(50_001), 1);
    }

    #[test]
    fn test_quarantined_address_not_reissued_until_next_scan() {
        let mut pool = pool();
        let v6: Ipv6Addr = "2001:db8::d".parse().unwrap();
        let freed = pool.get_or_assign(v6, 0).unwrap();
        pool.scan(1);
        pool.scan(10_000); // reaps
        let next = pool.get_or_assign("2001:db8::e".parse().unwrap(), 10_001).unwrap();
        assert_ne!(next, freed);
        pool.scan(20_000); // quarantine lifts
        let reuse = pool.get_or_assign("2001:db8::f".parse().unwrap(), 20_001).unwrap();
        assert_eq!(reuse, freed);
    }

    #[test]
    fn test_insert_rejects_foreign_and_duplicate() {
        let mut pool = pool();
        assert_eq!(
            pool.insert("2001:db8::1".parse().unwrap(), "192.0.2.1".parse().unwrap(), 0),
            Err(Error::AddressOutsidePool("192.0.2.1".parse().unwrap()))
        );
        pool.insert("2001:db8::1".parse().unwrap(), "198.51.100.4".parse().unwrap(), 0)
            .unwrap();
        assert_eq!(
            pool.insert("2001:db8::2".parse().unwrap(), "198.51.100.4".parse().unwrap(), 0),
            Err(Error::AddressInUse("198.51.100.4".parse().unwrap()))
        );
    }
}
