//! Request/response correlation.
//!
//! Ids come from a monotonic counter starting at 1 (0 is reserved for
//! unsolicited notifications) and are never handed out twice. Each live id
//! owns at most one waiter, and `complete` hands that waiter back exactly
//! once.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("request id space exhausted")]
    Exhausted,

    #[error("request id {0} already has a waiter")]
    Duplicate(i32),

    #[error("request id {0} was never issued")]
    NotIssued(i32),
}

#[derive(Debug)]
pub struct Correlator<W> {
    next_id: i32,
    pending: HashMap<i32, W>,
}

impl<W> Default for Correlator<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> Correlator<W> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Reserve a fresh id.
    pub fn issue(&mut self) -> Result<i32, CorrelatorError> {
        if self.next_id == i32::MAX {
            return Err(CorrelatorError::Exhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    /// Register the waiter for an issued id.
    pub fn attach(&mut self, id: i32, waiter: W) -> Result<(), CorrelatorError> {
        if id <= 0 || id >= self.next_id {
            return Err(CorrelatorError::NotIssued(id));
        }
        if self.pending.contains_key(&id) {
            return Err(CorrelatorError::Duplicate(id));
        }
        self.pending.insert(id, waiter);
        Ok(())
    }

    /// `issue` followed by `attach`.
    pub fn register(&mut self, waiter: W) -> Result<i32, CorrelatorError> {
        let id = self.issue()?;
        self.attach(id, waiter)?;
        Ok(id)
    }

    /// Remove and return the waiter for `id`, if one is still registered.
    pub fn complete(&mut self, id: i32) -> Option<W> {
        self.pending.remove(&id)
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut W> {
        self.pending.get_mut(&id)
    }

    pub fn is_pending(&self, id: i32) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop every waiter, e.g. when the channel dies.
    pub fn drain(&mut self) -> impl Iterator<Item = (i32, W)> + '_ {
        self.pending.drain()
    }

    #[cfg(test)]
    fn with_next_id(next_id: i32) -> Self {
        Self {
            next_id,
            pending: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_and_nonzero() {
        let mut c: Correlator<()> = Correlator::new();
        let ids: HashSet<i32> = (0..1000).map(|_| c.issue().unwrap()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(!ids.contains(&0));
    }

    #[test]
    fn test_complete_exactly_once() {
        let mut c = Correlator::new();
        let id = c.register("waiter").unwrap();
        assert!(c.is_pending(id));
        assert_eq!(c.complete(id), Some("waiter"));
        assert_eq!(c.complete(id), None);
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn test_attach_rules() {
        let mut c = Correlator::new();
        let id = c.issue().unwrap();
        c.attach(id, 1).unwrap();
        assert_eq!(c.attach(id, 2), Err(CorrelatorError::Duplicate(id)));
        assert_eq!(c.attach(99, 3), Err(CorrelatorError::NotIssued(99)));
        assert_eq!(c.attach(0, 3), Err(CorrelatorError::NotIssued(0)));
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut c: Correlator<()> = Correlator::with_next_id(i32::MAX - 1);
        assert_eq!(c.issue(), Ok(i32::MAX - 1));
        assert_eq!(c.issue(), Err(CorrelatorError::Exhausted));
    }
}
