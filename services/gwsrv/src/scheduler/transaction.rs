//! Transaction table for one connection
//!
//! Transaction ids are handed out sequentially and wrap at `u16::MAX`. An id
//! is never handed out again while a request holding it is in flight; it
//! becomes free once the request completes, times out or is cancelled.

use std::collections::HashMap;

use tokio::time::Instant;

struct Slot<T> {
    deadline: Instant,
    value: T,
}

/// In-flight requests keyed by transaction id
pub struct TransactionTable<T> {
    next_id: u16,
    pending: HashMap<u16, Slot<T>>,
}

impl<T> Default for TransactionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TransactionTable<T> {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Table whose first allocated id is `first_id`
    pub fn starting_at(first_id: u16) -> Self {
        Self {
            next_id: first_id,
            pending: HashMap::new(),
        }
    }

    /// Allocate a free id and register `value` under it
    ///
    /// Returns `None` only when all 65536 ids are in flight.
    pub fn begin(&mut self, deadline: Instant, value: T) -> Option<u16> {
        if self.pending.len() > u16::MAX as usize {
            return None;
        }

        let mut id = self.next_id;
        while self.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);
        self.pending.insert(id, Slot { deadline, value });
        Some(id)
    }

    pub fn get(&self, id: u16) -> Option<&T> {
        self.pending.get(&id).map(|slot| &slot.value)
    }

    /// Remove a request that got its answer
    pub fn complete(&mut self, id: u16) -> Option<T> {
        self.pending.remove(&id).map(|slot| slot.value)
    }

    /// Remove every request whose deadline is at or before `now`
    pub fn expire(&mut self, now: Instant) -> Vec<(u16, T)> {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        let mut out: Vec<(u16, T)> = expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|slot| (id, slot.value)))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Remove everything, e.g. when the connection drops
    pub fn drain(&mut self) -> Vec<(u16, T)> {
        let mut out: Vec<(u16, T)> = self
            .pending
            .drain()
            .map(|(id, slot)| (id, slot.value))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Earliest deadline among in-flight requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|slot| slot.deadline).min()
    }

    pub fn is_in_flight(&self, id: u16) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
