//! The address-mapping subsystem.
//!
//! Two ordered rule sequences (one per family) define how addresses cross
//! the translator: static 1:1 pairs, the RFC6052 translation prefix, and
//! the dynamic pool. Lookups are longest-prefix-first; on equal length a
//! static rule shadows a derived one, and dynamic-pool membership is
//! consulted last. Bindings allocated from the pool are kept in the pool's
//! own table and behave as host rules without ever mutating the sequences.

mod cache;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use ipnet::{Ipv4Net, Ipv6Net};
use lease_map::Ipv4Pool;

use crate::config::Config;
use cache::MapCache;

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum MapError {
    #[error("address has no mapping")]
    NoMatch,
    #[error("{0} is private address space and the well-known prefix is strict")]
    PrivateUnderWkpf(Ipv4Addr),
    #[error("address {0} is reserved and cannot be translated")]
    Reserved(IpAddr),
    #[error("translation of {0} would hairpin back through the translator")]
    Hairpin(IpAddr),
    #[error(transparent)]
    Pool(#[from] lease_map::Error),
}

#[derive(Debug, Clone, Copy)]
enum Rule4Kind {
    Static(Ipv6Addr),
    DynamicPool,
}

#[derive(Debug, Clone, Copy)]
enum Rule6Kind {
    Static(Ipv4Addr),
    Rfc6052,
}

#[derive(Debug, Clone, Copy)]
struct Rule4 {
    net: Ipv4Net,
    kind: Rule4Kind,
}

#[derive(Debug, Clone, Copy)]
struct Rule6 {
    net: Ipv6Net,
    kind: Rule6Kind,
}

/// The configured address maps plus the live dynamic pool and the lookup
/// cache. Owned by the event loop; never shared.
#[derive(Debug)]
pub struct AddrMap {
    rules4: Vec<Rule4>,
    rules6: Vec<Rule6>,
    prefix: Option<Ipv6Net>,
    pool: Option<Ipv4Pool>,
    cache: Option<MapCache>,
    wkpf_strict: bool,
    local4: Ipv4Addr,
}

impl AddrMap {
    /// Build the rule sequences from a validated configuration.
    pub fn new(config: &Config) -> Self {
        let mut rules4 = Vec::new();
        let mut rules6 = Vec::new();

        for (v4, v6) in &config.static_maps {
            rules4.push(Rule4 {
                net: Ipv4Net::new(*v4, 32).unwrap(),
                kind: Rule4Kind::Static(*v6),
            });
            rules6.push(Rule6 {
                net: Ipv6Net::new(*v6, 128).unwrap(),
                kind: Rule6Kind::Static(*v4),
            });
        }
        if let Some(prefix) = config.prefix {
            rules6.push(Rule6 {
                net: prefix,
                kind: Rule6Kind::Rfc6052,
            });
        }
        let pool = config.dynamic_pool.map(|net| {
            rules4.push(Rule4 {
                net,
                kind: Rule4Kind::DynamicPool,
            });
            let mut pool = Ipv4Pool::new(net, config.pool_timeout);
            if net.contains(&config.local4) {
                pool.exclude(config.local4);
            }
            pool
        });

        // Longest prefix first; a static rule wins a length tie.
        rules4.sort_by_key(|r| (std::cmp::Reverse(r.net.prefix_len()), rank4(r.kind)));
        rules6.sort_by_key(|r| (std::cmp::Reverse(r.net.prefix_len()), rank6(r.kind)));

        Self {
            rules4,
            rules6,
            prefix: config.prefix,
            pool,
            cache: (config.cache_size > 0)
                .then(|| MapCache::new(config.cache_size, rand::random())),
            wkpf_strict: config.wkpf_strict,
            local4: config.local4,
        }
    }

    /// Translate an IPv4 Internet address to its IPv6 representation:
    /// a static pairing or binding if one exists, otherwise RFC6052
    /// embedding under the translation prefix.
    pub fn embed_4to6(&mut self, addr: Ipv4Addr, now: u64) -> Result<Ipv6Addr, MapError> {
        if let Some((v6, _)) = self.cache_get4(addr, now) {
            return Ok(v6);
        }
        if is_reserved4(addr) {
            return Err(MapError::Reserved(addr.into()));
        }
        if addr == self.local4 {
            return Err(MapError::Hairpin(addr.into()));
        }
        match self.lookup4(addr) {
            Some(Rule4Kind::Static(v6)) => {
                self.cache_put4(addr, v6, false, now);
                Ok(v6)
            }
            Some(Rule4Kind::DynamicPool) => self.pool_v6_for(addr, now),
            None => {
                let prefix = self.prefix.ok_or(MapError::NoMatch)?;
                self.screen_wkpf(addr)?;
                let v6 = prefix64::embed(addr, prefix)
                    .map_err(|_| MapError::Reserved(addr.into()))?;
                self.cache_put4(addr, v6, false, now);
                Ok(v6)
            }
        }
    }

    /// Resolve the IPv4-side identity of an IPv6 host: static pairing or
    /// live dynamic binding.
    pub fn host_4to6(&mut self, addr: Ipv4Addr, now: u64) -> Result<Ipv6Addr, MapError> {
        if let Some((v6, _)) = self.cache_get4(addr, now) {
            return Ok(v6);
        }
        if is_reserved4(addr) {
            return Err(MapError::Reserved(addr.into()));
        }
        match self.lookup4(addr) {
            Some(Rule4Kind::Static(v6)) => {
                self.cache_put4(addr, v6, false, now);
                Ok(v6)
            }
            Some(Rule4Kind::DynamicPool) => self.pool_v6_for(addr, now),
            None => Err(MapError::NoMatch),
        }
    }

    /// Translate an IPv6 host address to IPv4: static pairing, existing
    /// binding, or (when `allocate` is set) a fresh lease from the pool.
    pub fn host_6to4(
        &mut self,
        addr: Ipv6Addr,
        allocate: bool,
        now: u64,
    ) -> Result<Ipv4Addr, MapError> {
        if let Some((v4, _)) = self.cache_get6(addr, now) {
            return Ok(v4);
        }
        match self.lookup6(addr) {
            Some(Rule6Kind::Static(v4)) => {
                self.cache_put6(addr, v4, false, now);
                Ok(v4)
            }
            // A source inside the translation prefix would loop traffic
            // straight back into the translator.
            Some(Rule6Kind::Rfc6052) => Err(MapError::Hairpin(addr.into())),
            None => {
                let pool = self.pool.as_mut().ok_or(MapError::NoMatch)?;
                let v4 = if allocate {
                    pool.get_or_assign(addr, now)?
                } else {
                    pool.v4_for(addr, now).ok_or(MapError::NoMatch)?
                };
                self.cache_put6(addr, v4, true, now);
                Ok(v4)
            }
        }
    }

    /// Extract the IPv4 destination from a prefix-embedded IPv6 address.
    pub fn extract_6to4(&mut self, addr: Ipv6Addr, now: u64) -> Result<Ipv4Addr, MapError> {
        if let Some((v4, _)) = self.cache_get6(addr, now) {
            return Ok(v4);
        }
        match self.lookup6(addr) {
            Some(Rule6Kind::Static(v4)) => {
                self.cache_put6(addr, v4, false, now);
                Ok(v4)
            }
            Some(Rule6Kind::Rfc6052) => {
                let prefix_len = self.prefix.map(|p| p.prefix_len()).unwrap_or(96);
                let v4 = prefix64::extract(addr, prefix_len)
                    .map_err(|_| MapError::Reserved(addr.into()))?;
                if is_reserved4(v4) {
                    return Err(MapError::Reserved(v4.into()));
                }
                self.screen_wkpf(v4)?;
                // The extracted address must live on the IPv4 side; one of
                // ours means the packet would come straight back.
                if v4 == self.local4 || self.lookup4(v4).is_some() {
                    return Err(MapError::Hairpin(v4.into()));
                }
                self.cache_put6(addr, v4, false, now);
                Ok(v4)
            }
            None => Err(MapError::NoMatch),
        }
    }

    /// Periodic cache maintenance.
    pub fn maintain_cache(&mut self, now: u64) {
        if let Some(cache) = self.cache.as_mut() {
            cache.sweep(now);
        }
    }

    /// Periodic pool maintenance. Returns the number of bindings reaped.
    pub fn scan_pool(&mut self, now: u64) -> usize {
        let Some(pool) = self.pool.as_mut() else {
            return 0;
        };
        let reaped = pool.scan(now);
        if reaped > 0 {
            // A cached mapping must not outlive its binding
            if let Some(cache) = self.cache.as_mut() {
                cache.flush();
            }
        }
        reaped
    }

    /// Write the binding table to `<data_dir>/dynamic.map` if it changed.
    /// Returns true when a save was attempted and succeeded.
    pub fn save_pool(&mut self, path: &Path, forced: bool) -> std::io::Result<bool> {
        let Some(pool) = self.pool.as_mut() else {
            return Ok(false);
        };
        if !pool.take_dirty() && !forced {
            return Ok(false);
        }
        match lease_map::save(pool, path) {
            Ok(()) => Ok(true),
            Err(err) => {
                // Keep the dirty flag so the next tick retries
                pool.mark_dirty();
                Err(err)
            }
        }
    }

    pub fn load_pool(&mut self, path: &Path) -> std::io::Result<usize> {
        match self.pool.as_mut() {
            Some(pool) => lease_map::load(pool, path),
            None => Ok(0),
        }
    }

    pub fn prefix(&self) -> Option<Ipv6Net> {
        self.prefix
    }

    pub fn pool(&self) -> Option<&Ipv4Pool> {
        self.pool.as_ref()
    }

    fn lookup4(&self, addr: Ipv4Addr) -> Option<Rule4Kind> {
        self.rules4
            .iter()
            .find(|rule| rule.net.contains(&addr))
            .map(|rule| rule.kind)
    }

    fn lookup6(&self, addr: Ipv6Addr) -> Option<Rule6Kind> {
        self.rules6
            .iter()
            .find(|rule| rule.net.contains(&addr))
            .map(|rule| rule.kind)
    }

    fn pool_v6_for(&mut self, addr: Ipv4Addr, now: u64) -> Result<Ipv6Addr, MapError> {
        let pool = self.pool.as_mut().ok_or(MapError::NoMatch)?;
        let v6 = pool.v6_for(addr, now).ok_or(MapError::NoMatch)?;
        self.cache_put4(addr, v6, true, now);
        Ok(v6)
    }

    fn screen_wkpf(&self, addr: Ipv4Addr) -> Result<(), MapError> {
        if self.wkpf_strict
            && self.prefix.is_some_and(is_wkpf)
            && is_private4(addr)
        {
            return Err(MapError::PrivateUnderWkpf(addr));
        }
        Ok(())
    }

    fn cache_get4(&mut self, addr: Ipv4Addr, now: u64) -> Option<(Ipv6Addr, bool)> {
        let hit = self.cache.as_mut()?.get4(addr, now)?;
        if hit.1 {
            // Refresh the binding so the cache cannot mask live traffic
            if let Some(pool) = self.pool.as_mut() {
                pool.v6_for(addr, now);
            }
        }
        Some(hit)
    }

    fn cache_get6(&mut self, addr: Ipv6Addr, now: u64) -> Option<(Ipv4Addr, bool)> {
        let hit = self.cache.as_mut()?.get6(addr, now)?;
        if hit.1 {
            if let Some(pool) = self.pool.as_mut() {
                pool.v4_for(addr, now);
            }
        }
        Some(hit)
    }

    fn cache_put4(&mut self, addr: Ipv4Addr, value: Ipv6Addr, dynamic: bool, now: u64) {
        if let Some(cache) = self.cache.as_mut() {
            cache.put4(addr, value, dynamic, now);
        }
    }

    fn cache_put6(&mut self, addr: Ipv6Addr, value: Ipv4Addr, dynamic: bool, now: u64) {
        if let Some(cache) = self.cache.as_mut() {
            cache.put6(addr, value, dynamic, now);
        }
    }
}

fn rank4(kind: Rule4Kind) -> u8 {
    match kind {
        Rule4Kind::Static(_) => 0,
        Rule4Kind::DynamicPool => 2,
    }
}

fn rank6(kind: Rule6Kind) -> u8 {
    match kind {
        Rule6Kind::Static(_) => 0,
        Rule6Kind::Rfc6052 => 1,
    }
}

/// The well-known prefix 64:ff9b::/96.
fn is_wkpf(net: Ipv6Net) -> bool {
    net.prefix_len() == 96
        && net.network().octets()[..12]
            == [0x00, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0]
}

/// Ranges that must never cross the translator in either direction.
fn is_reserved4(addr: Ipv4Addr) -> bool {
    let addr = u32::from(addr);
    addr >> 24 == 0 || addr >> 24 == 127 || addr >= 0xe000_0000
}

/// Private and special-purpose IPv4 space barred from the well-known
/// prefix by RFC6052 section 3.1.
fn is_private4(addr: Ipv4Addr) -> bool {
    const RANGES: [(u32, u32); 15] = [
        (0x0000_0000, 8),  // 0.0.0.0/8
        (0x0a00_0000, 8),  // 10.0.0.0/8
        (0x6440_0000, 10), // 100.64.0.0/10
        (0x7f00_0000, 8),  // 127.0.0.0/8
        (0xa9fe_0000, 16), // 169.254.0.0/16
        (0xac10_0000, 12), // 172.16.0.0/12
        (0xc000_0000, 24), // 192.0.0.0/24
        (0xc000_0200, 24), // 192.0.2.0/24
        (0xc058_6300, 24), // 192.88.99.0/24
        (0xc0a8_0000, 16), // 192.168.0.0/16
        (0xc612_0000, 15), // 198.18.0.0/15
        (0xc633_6400, 24), // 198.51.100.0/24
        (0xcb00_7100, 24), // 203.0.113.0/24
        (0xe000_0000, 4),  // 224.0.0.0/4
        (0xf000_0000, 4),  // 240.0.0.0/4
    ];
    let addr = u32::from(addr);
    RANGES
        .iter()
        .any(|(net, len)| (addr ^ net) >> (32 - len) == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            tun_device: "nat64".to_string(),
            local4: "198.51.100.1".parse().unwrap(),
            local6: "2001:db8::2".parse().unwrap(),
            static_maps: vec![("203.0.113.5".parse().unwrap(), "2001:db8:1::5".parse().unwrap())],
            prefix: Some("64:ff9b::/96".parse().unwrap()),
            dynamic_pool: Some("198.51.100.0/24".parse().unwrap()),
            ..Config::default()
        }
    }

    fn map() -> AddrMap {
        AddrMap::new(&config())
    }

    #[test]
    fn test_embed_and_extract_via_prefix() {
        let mut map = map();
        let v6 = map.embed_4to6("192.0.2.1".parse().unwrap(), 0).unwrap();
        assert_eq!(v6, "64:ff9b::c000:201".parse::<Ipv6Addr>().unwrap());
        assert_eq!(
            map.extract_6to4(v6, 0),
            Ok("192.0.2.1".parse::<Ipv4Addr>().unwrap())
        );
    }

    #[test]
    fn test_static_shadows_prefix() {
        let mut config = config();
        // Pair the static host with a v6 address inside the prefix
        config.static_maps = vec![(
            "203.0.113.5".parse().unwrap(),
            "64:ff9b::cb00:7105".parse().unwrap(),
        )];
        let mut map = AddrMap::new(&config);
        // The /128 static rule must win over the /96 prefix rule (plain
        // extraction of this address would be refused as a hairpin)
        assert_eq!(
            map.extract_6to4("64:ff9b::cb00:7105".parse().unwrap(), 0),
            Ok("203.0.113.5".parse().unwrap())
        );
    }

    #[test]
    fn test_dynamic_assignment_first_address() {
        let mut map = map();
        // .0 is the network address and .1 is the translator itself
        assert_eq!(
            map.host_6to4("2001:db8::1".parse().unwrap(), true, 0),
            Ok("198.51.100.2".parse().unwrap())
        );
        // Inbound lookup sees the same binding
        assert_eq!(
            map.host_4to6("198.51.100.2".parse().unwrap(), 1),
            Ok("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn test_no_allocation_without_flag() {
        let mut map = map();
        assert_eq!(
            map.host_6to4("2001:db8::7".parse().unwrap(), false, 0),
            Err(MapError::NoMatch)
        );
    }

    #[test]
    fn test_wkpf_strict_blocks_private() {
        let mut config = config();
        config.wkpf_strict = true;
        let mut map = AddrMap::new(&config);
        assert_eq!(
            map.extract_6to4("64:ff9b::a00:1".parse().unwrap(), 0),
            Err(MapError::PrivateUnderWkpf("10.0.0.1".parse().unwrap()))
        );
        // Non-private extraction still passes
        assert!(map.extract_6to4("64:ff9b::805f:13".parse().unwrap(), 0).is_ok());
    }

    #[test]
    fn test_wkpf_relaxed_when_not_strict() {
        let mut map = map();
        assert!(map.extract_6to4("64:ff9b::a00:1".parse().unwrap(), 0).is_ok());
    }

    #[test]
    fn test_nonzero_u_byte_is_reserved() {
        let mut config = config();
        config.prefix = Some("64:ff9b::/64".parse().unwrap());
        let mut map = AddrMap::new(&config);
        let addr: Ipv6Addr = "64:ff9b::ff00:c000:201:0".parse().unwrap();
        assert!(matches!(
            map.extract_6to4(addr, 0),
            Err(MapError::Reserved(_))
        ));
    }

    #[test]
    fn test_extraction_hairpin_dropped() {
        let mut map = map();
        // 64:ff9b::198.51.100.9 points back into our own pool
        assert_eq!(
            map.extract_6to4("64:ff9b::c633:6409".parse().unwrap(), 0),
            Err(MapError::Hairpin("198.51.100.9".parse::<Ipv4Addr>().unwrap().into()))
        );
    }

    #[test]
    fn test_source_inside_prefix_dropped() {
        let mut map = map();
        assert!(matches!(
            map.host_6to4("64:ff9b::1.2.3.4".parse().unwrap(), true, 0),
            Err(MapError::Hairpin(_))
        ));
    }

    #[test]
    fn test_reserved_never_translates() {
        let mut map = map();
        assert!(matches!(
            map.embed_4to6("127.0.0.1".parse().unwrap(), 0),
            Err(MapError::Reserved(_))
        ));
        assert!(matches!(
            map.extract_6to4("64:ff9b::7f00:1".parse().unwrap(), 0),
            Err(MapError::Reserved(_))
        ));
    }

    #[test]
    fn test_cached_dynamic_lookup_stays_coherent() {
        let mut config = config();
        config.cache_size = 64;
        let mut map = AddrMap::new(&config);
        let v6: Ipv6Addr = "2001:db8::9".parse().unwrap();
        let v4 = map.host_6to4(v6, true, 0).unwrap();
        map.scan_pool(1); // clears the allocation's used flag
        // Cache hit at t=5000 must refresh the binding under the cache
        assert_eq!(map.host_6to4(v6, false, 5000), Ok(v4));
        map.scan_pool(5001);
        // Without the refresh, last_use would still be 0 and this scan
        // (past the 7200s default timeout) would reap the binding
        assert_eq!(map.scan_pool(10_000), 0);
        assert_eq!(map.host_6to4(v6, false, 10_001), Ok(v4));
    }

    #[test]
    fn test_pool_reap_flushes_cache() {
        let mut config = config();
        config.cache_size = 64;
        config.pool_timeout = 10;
        let mut map = AddrMap::new(&config);
        let v6: Ipv6Addr = "2001:db8::9".parse().unwrap();
        map.host_6to4(v6, true, 0).unwrap();
        map.scan_pool(1); // clears the used flag
        assert_eq!(map.scan_pool(1000), 1);
        assert_eq!(map.host_6to4(v6, false, 1001), Err(MapError::NoMatch));
    }
}
