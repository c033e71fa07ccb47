//! Bounded in-memory match cache for the destination sweep.
//!
//! Two sides share one TTL/size-bounded structure: bridge rows published by
//! the source sweep (so a destination transfer can find its obligation
//! without a content query), and destination transfers that arrived before
//! their bridge row existed (so the next sweep knows they are waiting).
//!
//! Prevents unbounded memory growth under long runtimes or adversarial
//! transfer volume; when full, the oldest entry is evicted on insert.

#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::normalize_address;

const DEFAULT_MAX_ENTRIES: usize = 50_000;
const DEFAULT_TTL_SECS: u64 = 6 * 3600;

/// A destination transfer may close a bridge row only when the source
/// deposit happened at most this long before it...
const SOURCE_LOOKBACK_MINUTES: i64 = 120;
/// ...or at most this long after it (clock skew allowance).
const SOURCE_LOOKAHEAD_MINUTES: i64 = 5;

/// Content key both sides are indexed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub target_chain: String,
    pub target_symbol: String,
    /// Normalized recipient address
    pub target_address: String,
    /// Raw-unit amount string
    pub target_amount: String,
}

impl MatchKey {
    pub fn new(chain: &str, symbol: &str, address: &str, amount: &str) -> Self {
        Self {
            target_chain: chain.to_string(),
            target_symbol: symbol.to_string(),
            target_address: normalize_address(address),
            target_amount: amount.to_string(),
        }
    }
}

/// A pending bridge row, as the destination sweep needs to see it.
#[derive(Debug, Clone)]
pub struct CachedBridge {
    pub source_chain: String,
    pub source_id: String,
    pub source_time: DateTime<Utc>,
    /// Lowercased maker addresses permitted to fulfill
    pub response_makers: Vec<String>,
}

/// An unmatched destination transfer awaiting its bridge row.
#[derive(Debug, Clone)]
pub struct CachedDest {
    pub chain_id: String,
    pub hash: String,
    pub seen_at: DateTime<Utc>,
}

struct CacheState {
    bridges: HashMap<MatchKey, Vec<(CachedBridge, Instant)>>,
    dests: HashMap<MatchKey, Vec<(CachedDest, Instant)>>,
    bridge_count: usize,
    dest_count: usize,
}

/// The shared match cache. Interior mutability so matcher tasks for all
/// versions can share one instance.
pub struct MemoryMatchCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    ttl: Duration,
}

impl Default for MemoryMatchCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECS)
    }
}

impl MemoryMatchCache {
    pub fn new(max_entries: usize, ttl_secs: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                bridges: HashMap::new(),
                dests: HashMap::new(),
                bridge_count: 0,
                dest_count: 0,
            }),
            max_entries,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Publish a freshly built bridge row for fast destination lookup.
    pub fn publish_bridge(&self, key: MatchKey, entry: CachedBridge) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        Self::evict(&mut state.bridges, &mut state.bridge_count, self.max_entries, self.ttl);
        state
            .bridges
            .entry(key)
            .or_default()
            .push((entry, Instant::now()));
        state.bridge_count += 1;
    }

    /// Path-A lookup: an uncompleted bridge row matching the destination
    /// transfer's content, fulfillable by this sender, inside the time
    /// window around the destination timestamp.
    pub fn find_bridge(
        &self,
        key: &MatchKey,
        sender: &str,
        dest_time: DateTime<Utc>,
    ) -> Option<CachedBridge> {
        let sender = normalize_address(sender);
        let earliest = dest_time - ChronoDuration::minutes(SOURCE_LOOKBACK_MINUTES);
        let latest = dest_time + ChronoDuration::minutes(SOURCE_LOOKAHEAD_MINUTES);

        let state = self.state.lock().unwrap();
        state.bridges.get(key).and_then(|entries| {
            entries
                .iter()
                .filter(|(_, at)| at.elapsed() < self.ttl)
                .map(|(b, _)| b)
                .find(|b| {
                    b.response_makers.contains(&sender)
                        && b.source_time >= earliest
                        && b.source_time <= latest
                })
                .cloned()
        })
    }

    /// Drop a bridge entry once its row is closed (or rebuilt).
    pub fn remove_bridge(&self, source_chain: &str, source_id: &str) {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;
        for entries in state.bridges.values_mut() {
            let before = entries.len();
            entries.retain(|(b, _)| !(b.source_chain == source_chain && b.source_id == source_id));
            removed += before - entries.len();
        }
        state.bridges.retain(|_, v| !v.is_empty());
        state.bridge_count = state.bridge_count.saturating_sub(removed);
    }

    /// Remember a destination transfer that found no bridge row yet.
    pub fn insert_dest(&self, key: MatchKey, entry: CachedDest) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        Self::evict(&mut state.dests, &mut state.dest_count, self.max_entries, self.ttl);
        let entries = state.dests.entry(key).or_default();
        if entries.iter().any(|(d, _)| d.chain_id == entry.chain_id && d.hash == entry.hash) {
            return;
        }
        entries.push((entry, Instant::now()));
        state.dest_count += 1;
    }

    /// Destination transfers waiting on a content key.
    pub fn waiting_dests(&self, key: &MatchKey) -> Vec<CachedDest> {
        let state = self.state.lock().unwrap();
        state
            .dests
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, at)| at.elapsed() < self.ttl)
                    .map(|(d, _)| d.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove_dest(&self, key: &MatchKey, chain_id: &str, hash: &str) {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;
        if let Some(entries) = state.dests.get_mut(key) {
            let before = entries.len();
            entries.retain(|(d, _)| !(d.chain_id == chain_id && d.hash == hash));
            removed = before - entries.len();
        }
        state.dests.retain(|_, v| !v.is_empty());
        state.dest_count = state.dest_count.saturating_sub(removed);
    }

    pub fn bridge_len(&self) -> usize {
        self.state.lock().unwrap().bridge_count
    }

    pub fn dest_len(&self) -> usize {
        self.state.lock().unwrap().dest_count
    }

    /// Drop expired entries; when still at capacity, drop the oldest.
    fn evict<T>(
        map: &mut HashMap<MatchKey, Vec<(T, Instant)>>,
        count: &mut usize,
        max_entries: usize,
        ttl: Duration,
    ) {
        let now = Instant::now();
        let mut live = 0;
        for entries in map.values_mut() {
            entries.retain(|(_, at)| now.duration_since(*at) < ttl);
            live += entries.len();
        }
        map.retain(|_, v| !v.is_empty());

        while live >= max_entries && live > 0 {
            let oldest_key = map
                .iter()
                .filter_map(|(k, v)| v.iter().map(|(_, at)| *at).min().map(|at| (k.clone(), at)))
                .min_by_key(|(_, at)| *at)
                .map(|(k, _)| k);
            let Some(key) = oldest_key else { break };
            if let Some(entries) = map.get_mut(&key) {
                let oldest_at = entries.iter().map(|(_, at)| *at).min();
                if let Some(at) = oldest_at {
                    if let Some(pos) = entries.iter().position(|(_, t)| *t == at) {
                        entries.remove(pos);
                        live -= 1;
                    }
                }
                if entries.is_empty() {
                    map.remove(&key);
                }
            }
        }
        *count = live;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> MatchKey {
        MatchKey::new("10", "ETH", "0xUser", "996995015000000012")
    }

    fn bridge(at: DateTime<Utc>) -> CachedBridge {
        CachedBridge {
            source_chain: "1".to_string(),
            source_id: "0xA".to_string(),
            source_time: at,
            response_makers: vec!["0xmaker".to_string()],
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_publish_and_find() {
        let cache = MemoryMatchCache::default();
        cache.publish_bridge(key(), bridge(t(0)));

        let hit = cache.find_bridge(&key(), "0xMAKER", t(60)).unwrap();
        assert_eq!(hit.source_id, "0xA");
    }

    #[test]
    fn test_find_requires_permitted_sender() {
        let cache = MemoryMatchCache::default();
        cache.publish_bridge(key(), bridge(t(0)));
        assert!(cache.find_bridge(&key(), "0xother", t(60)).is_none());
    }

    #[test]
    fn test_find_honors_time_window() {
        let cache = MemoryMatchCache::default();
        cache.publish_bridge(key(), bridge(t(0)));

        // source 121 minutes before dest: too old
        assert!(cache.find_bridge(&key(), "0xmaker", t(121 * 60)).is_none());
        // source 120 minutes before dest: boundary, allowed
        assert!(cache.find_bridge(&key(), "0xmaker", t(120 * 60)).is_some());
        // source 4 minutes after dest: clock skew, allowed
        assert!(cache.find_bridge(&key(), "0xmaker", t(-4 * 60)).is_some());
        // source 6 minutes after dest: rejected
        assert!(cache.find_bridge(&key(), "0xmaker", t(-6 * 60)).is_none());
    }

    #[test]
    fn test_address_key_is_normalized() {
        let cache = MemoryMatchCache::default();
        cache.publish_bridge(
            MatchKey::new("10", "ETH", "0xUSER", "1"),
            bridge(t(0)),
        );
        assert!(cache
            .find_bridge(&MatchKey::new("10", "ETH", "0xuser", "1"), "0xmaker", t(0))
            .is_some());
    }

    #[test]
    fn test_remove_bridge() {
        let cache = MemoryMatchCache::default();
        cache.publish_bridge(key(), bridge(t(0)));
        cache.remove_bridge("1", "0xA");
        assert!(cache.find_bridge(&key(), "0xmaker", t(0)).is_none());
        assert_eq!(cache.bridge_len(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = MemoryMatchCache::new(2, 3600);
        for i in 0..3 {
            let mut b = bridge(t(0));
            b.source_id = format!("0x{}", i);
            cache.publish_bridge(MatchKey::new("10", "ETH", "0xUser", &i.to_string()), b);
        }
        assert_eq!(cache.bridge_len(), 2);
        // the first entry is gone
        assert!(cache
            .find_bridge(&MatchKey::new("10", "ETH", "0xUser", "0"), "0xmaker", t(0))
            .is_none());
    }

    #[test]
    fn test_dest_side_dedup_and_remove() {
        let cache = MemoryMatchCache::default();
        let d = CachedDest {
            chain_id: "10".to_string(),
            hash: "0xD".to_string(),
            seen_at: t(0),
        };
        cache.insert_dest(key(), d.clone());
        cache.insert_dest(key(), d);
        assert_eq!(cache.waiting_dests(&key()).len(), 1);

        cache.remove_dest(&key(), "10", "0xD");
        assert!(cache.waiting_dests(&key()).is_empty());
        assert_eq!(cache.dest_len(), 0);
    }
}
