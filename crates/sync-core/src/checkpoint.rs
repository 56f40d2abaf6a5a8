//! Synchronization progress
//!
//! A [`Checkpoint`] is owned by exactly one engine. It is advanced after each
//! committed batch and mirrored into the configuration store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::message::Sequence;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Everything up to here is durably reflected in the index
    pub commit_timestamp: Option<Sequence>,

    /// Last sequence applied per namespace
    #[serde(default)]
    pub namespace_progress: BTreeMap<String, Sequence>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an applied sequence. Returns false if it would move the
    /// namespace backwards, in which case nothing changes.
    pub fn record(&mut self, namespace: &str, sequence: Sequence) -> bool {
        match self.namespace_progress.get_mut(namespace) {
            Some(current) if *current > sequence => false,
            Some(current) => {
                *current = sequence;
                true
            }
            None => {
                self.namespace_progress
                    .insert(namespace.to_string(), sequence);
                true
            }
        }
    }

    /// Advance the commit timestamp, never backwards
    pub fn commit(&mut self, sequence: Sequence) -> bool {
        match self.commit_timestamp {
            Some(current) if current > sequence => false,
            _ => {
                self.commit_timestamp = Some(sequence);
                true
            }
        }
    }

    pub fn progress(&self, namespace: &str) -> Option<Sequence> {
        self.namespace_progress.get(namespace).copied()
    }

    /// True if the entry was already applied for its namespace
    pub fn already_applied(&self, namespace: &str, sequence: Sequence) -> bool {
        self.progress(namespace).is_some_and(|seen| sequence < seen)
    }

    /// Drop progress for a namespace that is no longer monitored
    pub fn forget(&mut self, namespace: &str) {
        self.namespace_progress.remove(namespace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_monotonic() {
        let mut cp = Checkpoint::new();
        assert!(cp.record("a.b", Sequence::new(5, 0)));
        assert!(cp.record("a.b", Sequence::new(5, 0)));
        assert!(!cp.record("a.b", Sequence::new(4, 9)));
        assert_eq!(cp.progress("a.b"), Some(Sequence::new(5, 0)));
        assert!(cp.record("a.b", Sequence::new(6, 0)));
        assert_eq!(cp.progress("a.c"), None);
    }

    #[test]
    fn test_commit_timestamp() {
        let mut cp = Checkpoint::new();
        assert!(cp.commit(Sequence::new(2, 0)));
        assert!(!cp.commit(Sequence::new(1, 0)));
        assert_eq!(cp.commit_timestamp, Some(Sequence::new(2, 0)));
    }

    #[test]
    fn test_already_applied_allows_replay_of_last() {
        let mut cp = Checkpoint::new();
        cp.record("a.b", Sequence::new(5, 3));
        assert!(cp.already_applied("a.b", Sequence::new(5, 2)));
        assert!(!cp.already_applied("a.b", Sequence::new(5, 3)));
        assert!(!cp.already_applied("x.y", Sequence::new(1, 0)));
        cp.forget("a.b");
        assert!(!cp.already_applied("a.b", Sequence::new(5, 2)));
    }
}
