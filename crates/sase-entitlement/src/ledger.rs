//! Pool Capacity Ledger
//!
//! Sole owner of every pool's `consumed` counter. Reservations are a
//! compare-and-swap on a per-pool atomic, so binds against unrelated pools
//! never contend and `0 <= consumed <= quantity` holds under any
//! interleaving of callers.

use crate::model::{PoolId, ReservationToken};
use dashmap::DashMap;
use sase_common::{EntitlementError, EntitlementResult, ResourceKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Default bound on compare-and-swap attempts per reservation
pub const DEFAULT_MAX_RESERVE_ATTEMPTS: u32 = 64;

/// Per-pool capacity counter
#[derive(Debug)]
struct PoolCounter {
    quantity: u64,
    consumed: AtomicU64,
}

impl PoolCounter {
    fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }
}

/// Pool capacity ledger
pub struct PoolLedger {
    counters: DashMap<PoolId, Arc<PoolCounter>>,
    /// Outstanding reservation tokens and the pool they hold a unit of
    outstanding: DashMap<Uuid, PoolId>,
    max_attempts: u32,
    /// Runs between reading and swapping `consumed`
    #[cfg(test)]
    interleave: Option<fn(&AtomicU64)>,
}

impl PoolLedger {
    /// Empty ledger with the default retry bound
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_RESERVE_ATTEMPTS)
    }

    /// Ledger with a custom retry bound (minimum 1)
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            counters: DashMap::new(),
            outstanding: DashMap::new(),
            max_attempts: max_attempts.max(1),
            #[cfg(test)]
            interleave: None,
        }
    }

    /// Start tracking a pool with nothing consumed
    pub fn open(&self, pool_id: &str, quantity: u64) -> EntitlementResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.counters.entry(pool_id.to_string()) {
            Entry::Occupied(_) => Err(EntitlementError::Conflict(format!(
                "pool {pool_id} is already tracked"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(PoolCounter {
                    quantity,
                    consumed: AtomicU64::new(0),
                }));
                Ok(())
            }
        }
    }

    /// Stop tracking a pool. Refused while any unit is reserved.
    pub fn close(&self, pool_id: &str) -> EntitlementResult<()> {
        let removed = self
            .counters
            .remove_if(pool_id, |_, counter| counter.consumed() == 0);

        match removed {
            Some(_) => Ok(()),
            None if self.counters.contains_key(pool_id) => Err(EntitlementError::Conflict(format!(
                "pool {pool_id} still has consumed units"
            ))),
            None => Err(EntitlementError::not_found(ResourceKind::Pool, pool_id)),
        }
    }

    fn counter(&self, pool_id: &str) -> EntitlementResult<Arc<PoolCounter>> {
        self.counters
            .get(pool_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Pool, pool_id))
    }

    /// Reserve one unit of `pool_id`.
    ///
    /// Returns [`EntitlementError::CapacityExhausted`] immediately when the
    /// pool is full, and [`EntitlementError::Conflict`] if the counter kept
    /// changing underneath for the whole retry budget.
    pub fn reserve(&self, pool_id: &str) -> EntitlementResult<ReservationToken> {
        // The shard guard is held until the token is recorded so `close`
        // cannot detach the counter mid-reservation.
        let counter = self
            .counters
            .get(pool_id)
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Pool, pool_id))?;

        for attempt in 0..self.max_attempts {
            let current = counter.consumed();
            if current >= counter.quantity {
                return Err(EntitlementError::CapacityExhausted {
                    pool_id: pool_id.to_string(),
                });
            }

            #[cfg(test)]
            {
                if let Some(hook) = self.interleave {
                    hook(&counter.consumed);
                }
            }

            if counter
                .consumed
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let token = ReservationToken {
                    id: Uuid::new_v4(),
                    pool_id: pool_id.to_string(),
                };
                self.outstanding.insert(token.id, token.pool_id.clone());
                return Ok(token);
            }

            debug!(pool = pool_id, attempt, "Reservation contention, retrying");
        }

        Err(EntitlementError::Conflict(format!(
            "reservation on pool {pool_id} lost {} races",
            self.max_attempts
        )))
    }

    /// Return a reserved unit.
    ///
    /// Idempotent per token: returns `Ok(true)` when the unit was freed now
    /// and `Ok(false)` when the token had already been released.
    pub fn release(&self, token: &ReservationToken) -> EntitlementResult<bool> {
        // `reserve` locks counters before outstanding; never hold an
        // outstanding guard while looking up a counter.
        let Some(pool_id) = self.holder(token) else {
            return Ok(false);
        };
        let counter = self.counter(&pool_id)?;

        // Only the caller that removes the token decrements.
        if self.outstanding.remove(&token.id).is_none() {
            return Ok(false);
        }
        counter.consumed.fetch_sub(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Check that releasing `token` would succeed, without releasing it
    pub fn check_release(&self, token: &ReservationToken) -> EntitlementResult<()> {
        match self.holder(token) {
            Some(pool_id) => self.counter(&pool_id).map(|_| ()),
            None => Ok(()),
        }
    }

    fn holder(&self, token: &ReservationToken) -> Option<PoolId> {
        self.outstanding.get(&token.id).map(|e| e.value().clone())
    }

    /// Whether the token still holds a unit
    pub fn is_outstanding(&self, token: &ReservationToken) -> bool {
        self.outstanding.contains_key(&token.id)
    }

    /// Units consumed in `pool_id`
    pub fn consumed(&self, pool_id: &str) -> EntitlementResult<u64> {
        Ok(self.counter(pool_id)?.consumed())
    }

    /// Total units in `pool_id`
    pub fn quantity(&self, pool_id: &str) -> EntitlementResult<u64> {
        Ok(self.counter(pool_id)?.quantity)
    }

    /// Units still available in `pool_id`
    pub fn remaining(&self, pool_id: &str) -> EntitlementResult<u64> {
        let counter = self.counter(pool_id)?;
        Ok(counter.quantity.saturating_sub(counter.consumed()))
    }

    /// Number of tracked pools
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no pool is tracked
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Number of reservations not yet released
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Stop tracking `pool_id` regardless of outstanding reservations
    #[cfg(test)]
    pub(crate) fn forget_pool(&self, pool_id: &str) {
        self.counters.remove(pool_id);
    }
}

impl Default for PoolLedger {
    fn default() -> Self { Self::new() }
}
