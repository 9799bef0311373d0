//! Per-VPN port pools with atomic reserve/release (spec §4.1, C1).
//!
//! `VPN_MODE=none` uses a single pool keyed under [`GLOBAL_POOL`]. Exactly
//! one port is counted against the active-replicas cap per engine — HTTP
//! and HTTPS never count separately, since both ride the single reserved
//! host port via the engine's own internal routing.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::error::{NetError, Result};

pub const GLOBAL_POOL: &str = "__global__";

#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn len(&self) -> usize {
        (self.hi - self.lo) as usize + 1
    }
}

/// A single VPN's (or the global) port bitmap, O(1) amortized via a
/// next-free cursor, O(range size) worst case when the cursor wraps past a
/// fully-occupied range.
struct PortPool {
    range: PortRange,
    reserved: Vec<bool>,
    next_free: usize,
}

impl PortPool {
    fn new(range: PortRange) -> Self {
        let len = range.len();
        Self {
            range,
            reserved: vec![false; len],
            next_free: 0,
        }
    }

    fn reserve(&mut self) -> Option<u16> {
        let len = self.reserved.len();
        for offset in 0..len {
            let idx = (self.next_free + offset) % len;
            if !self.reserved[idx] {
                self.reserved[idx] = true;
                self.next_free = (idx + 1) % len;
                return Some(self.range.lo + idx as u16);
            }
        }
        None
    }

    fn release(&mut self, port: u16) {
        if let Some(idx) = self.index_of(port) {
            self.reserved[idx] = false;
        }
    }

    fn reserve_specific(&mut self, port: u16) -> bool {
        match self.index_of(port) {
            Some(idx) => {
                self.reserved[idx] = true;
                true
            }
            None => false,
        }
    }

    fn index_of(&self, port: u16) -> Option<usize> {
        if port < self.range.lo || port > self.range.hi {
            return None;
        }
        Some((port - self.range.lo) as usize)
    }

    fn active_count(&self) -> usize {
        self.reserved.iter().filter(|b| **b).count()
    }
}

/// Concurrent-safe port allocator spanning every configured VPN (or the
/// single global range in `VPN_MODE=none`). All mutations serialize under
/// one lock (`port_lock` in spec §5).
pub struct PortAllocator {
    pools: Mutex<HashMap<String, PortPool>>,
    max_active_replicas: usize,
}

impl PortAllocator {
    pub fn new(ranges: HashMap<String, PortRange>, max_active_replicas: usize) -> Self {
        let pools = ranges
            .into_iter()
            .map(|(vpn, range)| (vpn, PortPool::new(range)))
            .collect();
        Self {
            pools: Mutex::new(pools),
            max_active_replicas,
        }
    }

    pub fn single(range: PortRange, max_active_replicas: usize) -> Self {
        let mut ranges = HashMap::new();
        ranges.insert(GLOBAL_POOL.to_string(), range);
        Self::new(ranges, max_active_replicas)
    }

    pub async fn reserve(&self, vpn: &str) -> Result<u16> {
        let mut pools = self.pools.lock().await;
        let total_active: usize = pools.values().map(PortPool::active_count).sum();
        if total_active >= self.max_active_replicas {
            return Err(NetError::AtCapacity);
        }
        let pool = pools
            .get_mut(vpn)
            .ok_or_else(|| NetError::UnknownVpn(vpn.to_string()))?;
        pool.reserve()
            .ok_or_else(|| NetError::PortExhausted(vpn.to_string()))
    }

    pub async fn release(&self, vpn: &str, port: u16) {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get_mut(vpn) {
            pool.release(port);
        }
    }

    /// Idempotent reservation used at reindex time to rebuild state from
    /// live containers without double-counting an already-reserved port.
    pub async fn reserve_specific(&self, vpn: &str, port: u16) -> Result<()> {
        let mut pools = self.pools.lock().await;
        let pool = pools
            .get_mut(vpn)
            .ok_or_else(|| NetError::UnknownVpn(vpn.to_string()))?;
        if pool.reserve_specific(port) {
            Ok(())
        } else {
            Err(NetError::InvalidPort(port))
        }
    }

    pub async fn total_reserved(&self) -> usize {
        let pools = self.pools.lock().await;
        pools.values().map(PortPool::active_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(cap: usize) -> PortAllocator {
        PortAllocator::single(PortRange { lo: 40000, hi: 40002 }, cap)
    }

    #[tokio::test]
    async fn reserves_lowest_free_port_first() {
        let alloc = allocator(10);
        let p1 = alloc.reserve(GLOBAL_POOL).await.unwrap();
        assert_eq!(p1, 40000);
        let p2 = alloc.reserve(GLOBAL_POOL).await.unwrap();
        assert_eq!(p2, 40001);
    }

    #[tokio::test]
    async fn release_then_reserve_reuses_port() {
        let alloc = allocator(10);
        let p1 = alloc.reserve(GLOBAL_POOL).await.unwrap();
        alloc.release(GLOBAL_POOL, p1).await;
        let p2 = alloc.reserve(GLOBAL_POOL).await.unwrap();
        assert_eq!(p1, p2);
    }

    #[tokio::test]
    async fn exhausted_range_errors() {
        let alloc = allocator(10);
        for _ in 0..3 {
            alloc.reserve(GLOBAL_POOL).await.unwrap();
        }
        let err = alloc.reserve(GLOBAL_POOL).await.unwrap_err();
        assert!(matches!(err, NetError::PortExhausted(_)));
    }

    #[tokio::test]
    async fn global_cap_overrides_pool_availability() {
        let alloc = allocator(1);
        alloc.reserve(GLOBAL_POOL).await.unwrap();
        let err = alloc.reserve(GLOBAL_POOL).await.unwrap_err();
        assert!(matches!(err, NetError::AtCapacity));
    }

    #[tokio::test]
    async fn reserve_specific_is_idempotent() {
        let alloc = allocator(10);
        alloc.reserve_specific(GLOBAL_POOL, 40001).await.unwrap();
        alloc.reserve_specific(GLOBAL_POOL, 40001).await.unwrap();
        assert_eq!(alloc.total_reserved().await, 1);
    }

    #[tokio::test]
    async fn no_port_leak_after_release() {
        let alloc = allocator(10);
        let p = alloc.reserve(GLOBAL_POOL).await.unwrap();
        alloc.release(GLOBAL_POOL, p).await;
        assert_eq!(alloc.total_reserved().await, 0);
    }
}
