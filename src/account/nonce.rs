//! Per-sender nonce issuance with commit/rollback semantics.
//!
//! Each sender address gets one manager. Issuance is serialized; a handle
//! either commits (the nonce is spent on a broadcast) or rolls back (the
//! nonce returns to a free list and the smallest free nonce is re-issued
//! before the sequential cursor advances). A handle dropped without an
//! explicit decision rolls back, the pre-broadcast failure default.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::types::normalize_address;

#[derive(Debug, Default)]
struct NonceState {
    /// Next never-issued nonce
    next: u64,
    /// Rolled-back nonces awaiting re-issue, smallest first
    free: BTreeSet<u64>,
    /// Last nonce synced from the chain; nothing below it may be re-issued
    floor: u64,
    initialized: bool,
}

/// Nonce issuer for one sender address.
#[derive(Debug, Default)]
pub struct NonceManager {
    state: Arc<Mutex<NonceState>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    /// Seed from the chain's pending-tag nonce on first use.
    pub fn initialize(&self, chain_nonce: u64) {
        let mut state = self.state.lock().unwrap();
        if !state.initialized {
            state.next = chain_nonce;
            state.floor = chain_nonce;
            state.initialized = true;
        }
    }

    /// Re-sync from the chain's pending-tag nonce, discarding local state.
    /// Called after a NONCE_EXPIRED broadcast rejection.
    pub fn force_refresh(&self, chain_nonce: u64) {
        let mut state = self.state.lock().unwrap();
        debug!(
            old_next = state.next,
            chain_nonce, "Nonce manager refreshed from chain"
        );
        state.next = chain_nonce;
        state.floor = chain_nonce;
        state.free.clear();
        state.initialized = true;
    }

    /// Vend the next nonce: the smallest rolled-back one if any, else the
    /// sequential cursor.
    pub fn next_nonce(&self) -> NonceHandle {
        let mut state = self.state.lock().unwrap();
        let nonce = if let Some(&smallest) = state.free.iter().next() {
            state.free.remove(&smallest);
            smallest
        } else {
            let n = state.next;
            state.next += 1;
            n
        };
        NonceHandle {
            nonce,
            state: Arc::clone(&self.state),
            decided: false,
        }
    }
}

/// One vended nonce. `submit` when the broadcast call has returned (the
/// nonce is spent whether or not the tx later succeeds); `rollback` when the
/// failure definitely happened before broadcast.
#[derive(Debug)]
pub struct NonceHandle {
    nonce: u64,
    state: Arc<Mutex<NonceState>>,
    decided: bool,
}

impl NonceHandle {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn submit(mut self) {
        self.decided = true;
    }

    pub fn rollback(mut self) {
        self.release();
        self.decided = true;
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        // A refresh may have moved the chain floor past this nonce;
        // re-issuing it then would double-spend on chain.
        if self.nonce < state.floor {
            return;
        }
        state.free.insert(self.nonce);
    }
}

impl Drop for NonceHandle {
    fn drop(&mut self) {
        if !self.decided {
            self.release();
        }
    }
}

/// Registry of nonce managers keyed by lowercased sender address.
#[derive(Default)]
pub struct NonceManagers {
    managers: Mutex<HashMap<String, Arc<NonceManager>>>,
}

impl NonceManagers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_sender(&self, sender: &str) -> Arc<NonceManager> {
        let mut managers = self.managers.lock().unwrap();
        Arc::clone(
            managers
                .entry(normalize_address(sender))
                .or_insert_with(|| Arc::new(NonceManager::new())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_issue_and_submit() {
        let mgr = NonceManager::new();
        mgr.initialize(10);

        let a = mgr.next_nonce();
        let b = mgr.next_nonce();
        assert_eq!(a.nonce(), 10);
        assert_eq!(b.nonce(), 11);
        a.submit();
        b.submit();

        assert_eq!(mgr.next_nonce().nonce(), 12);
    }

    #[test]
    fn test_rollback_reissues_smallest_first() {
        let mgr = NonceManager::new();
        mgr.initialize(0);

        let a = mgr.next_nonce(); // 0
        let b = mgr.next_nonce(); // 1
        let c = mgr.next_nonce(); // 2
        c.rollback();
        a.rollback();
        b.submit();

        // Smallest free (0) comes back before 2, before the cursor at 3.
        assert_eq!(mgr.next_nonce().nonce(), 0);
        assert_eq!(mgr.next_nonce().nonce(), 2);
        assert_eq!(mgr.next_nonce().nonce(), 3);
    }

    #[test]
    fn test_drop_without_decision_rolls_back() {
        let mgr = NonceManager::new();
        mgr.initialize(5);
        {
            let h = mgr.next_nonce();
            assert_eq!(h.nonce(), 5);
            // dropped undecided
        }
        assert_eq!(mgr.next_nonce().nonce(), 5);
    }

    #[test]
    fn test_no_gaps_across_submitted_sequence() {
        let mgr = NonceManager::new();
        mgr.initialize(0);

        let mut submitted = Vec::new();
        for i in 0..20 {
            let h = mgr.next_nonce();
            if i % 3 == 0 {
                h.rollback();
            } else {
                submitted.push(h.nonce());
                h.submit();
            }
        }
        // Drain: rolled-back nonces must all be re-issuable.
        loop {
            let h = mgr.next_nonce();
            let n = h.nonce();
            if submitted.contains(&n) {
                panic!("nonce {} issued twice", n);
            }
            submitted.push(n);
            h.submit();
            let mut sorted = submitted.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() == submitted.len() && sorted == (0..sorted.len() as u64).collect::<Vec<_>>() {
                break;
            }
        }
    }

    #[test]
    fn test_force_refresh_discards_free_list() {
        let mgr = NonceManager::new();
        mgr.initialize(0);
        let a = mgr.next_nonce(); // 0
        let _ = mgr.next_nonce().nonce(); // 1, dropped -> free
        a.rollback(); // 0 free

        mgr.force_refresh(7);
        assert_eq!(mgr.next_nonce().nonce(), 7);
    }

    #[test]
    fn test_rollback_after_refresh_does_not_resurrect_stale_nonce() {
        let mgr = NonceManager::new();
        mgr.initialize(0);
        let a = mgr.next_nonce(); // 0
        mgr.force_refresh(5);
        a.rollback();
        // 0 is below the refreshed cursor and must not be re-issued.
        assert_eq!(mgr.next_nonce().nonce(), 5);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let mgr = NonceManager::new();
        mgr.initialize(3);
        mgr.initialize(100);
        assert_eq!(mgr.next_nonce().nonce(), 3);
    }

    #[test]
    fn test_registry_is_per_address_case_insensitive() {
        let registry = NonceManagers::new();
        let a = registry.for_sender("0xAbC0000000000000000000000000000000000001");
        let b = registry.for_sender("0xabc0000000000000000000000000000000000001");
        a.initialize(4);
        assert!(b.is_initialized());
        assert_eq!(b.next_nonce().nonce(), 4);
    }
}
