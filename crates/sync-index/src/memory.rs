//! In-memory index
//!
//! Keeps documents in a map and records every call, with switches to make
//! calls fail. Used by tests and local dry runs.

use async_trait::async_trait;
use search_sync_core::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Call observed by a [`MemoryIndex`]
#[derive(Debug, Clone, PartialEq)]
pub enum IndexCall {
    Add(Vec<IndexedDocument>),
    DeleteById(String),
    Commit,
}

#[derive(Debug, Default)]
struct State {
    documents: BTreeMap<String, IndexedDocument>,
    calls: Vec<IndexCall>,
    commits: usize,
    unavailable: bool,
    fail_next: usize,
    failed_calls: usize,
}

/// In-memory index
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: Mutex<State>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every call fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Make the next `n` calls fail
    pub fn fail_next(&self, n: usize) {
        self.state().fail_next = n;
    }

    pub fn document(&self, id: &str) -> Option<IndexedDocument> {
        self.state().documents.get(id).cloned()
    }

    pub fn documents(&self) -> BTreeMap<String, IndexedDocument> {
        self.state().documents.clone()
    }

    pub fn calls(&self) -> Vec<IndexCall> {
        self.state().calls.clone()
    }

    /// Documents passed to `add`, in call order
    pub fn added(&self) -> Vec<IndexedDocument> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                IndexCall::Add(docs) => Some(docs.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn commits(&self) -> usize {
        self.state().commits
    }

    pub fn failed_calls(&self) -> usize {
        self.state().failed_calls
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn check(state: &mut State, operation: &str) -> Result<()> {
        if state.unavailable {
            state.failed_calls += 1;
            return Err(SyncError::index(format!("{operation}: index unavailable")));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            state.failed_calls += 1;
            return Err(SyncError::index(format!("{operation}: injected failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl IndexClient for MemoryIndex {
    async fn add(&self, documents: &[IndexedDocument]) -> Result<()> {
        let mut state = self.state();
        Self::check(&mut state, "add")?;
        for doc in documents {
            state.documents.insert(doc.id.clone(), doc.clone());
        }
        state.calls.push(IndexCall::Add(documents.to_vec()));
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        Self::check(&mut state, "delete_by_id")?;
        state.documents.remove(id);
        state.calls.push(IndexCall::DeleteById(id.to_string()));
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state();
        Self::check(&mut state, "commit")?;
        state.commits += 1;
        state.calls.push(IndexCall::Commit);
        Ok(())
    }

    async fn tombstones_before(&self, cutoff: Sequence, limit: usize) -> Result<Vec<String>> {
        let mut state = self.state();
        Self::check(&mut state, "tombstones_before")?;
        Ok(state
            .documents
            .values()
            .filter(|doc| doc.deleted && doc.deleted_at.is_some_and(|at| at < cutoff))
            .take(limit)
            .map(|doc| doc.id.clone())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        let mut state = self.state();
        Self::check(&mut state, "ping")
    }
}

/// Hands out one shared [`MemoryIndex`] per endpoint
#[derive(Debug, Default)]
pub struct MemoryIndexConnector {
    indexes: Mutex<HashMap<String, Arc<MemoryIndex>>>,
}

impl MemoryIndexConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self, endpoint: &str) -> Arc<MemoryIndex> {
        self.indexes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }
}

impl IndexConnector for MemoryIndexConnector {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn IndexClient>> {
        Ok(self.index(endpoint))
    }
}
