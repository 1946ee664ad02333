//! Bounded history of execution results.

use crate::pipeline::ExecutionResult;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

/// A ring buffer of the most recent execution results.
///
/// When full, the oldest result is evicted first. Results are stored behind
/// `Arc` and handed out as clones, so callers never observe mutation.
#[derive(Debug)]
pub struct ExecutionHistory {
    capacity: usize,
    results: RwLock<VecDeque<Arc<ExecutionResult>>>,
}

impl ExecutionHistory {
    /// Creates a history holding at most `capacity` results.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            results: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Appends a result, evicting the oldest one when full.
    pub fn push(&self, result: ExecutionResult) {
        if self.capacity == 0 {
            return;
        }
        let mut results = self.results.write();
        while results.len() >= self.capacity {
            results.pop_front();
        }
        results.push_back(Arc::new(result));
    }

    /// Returns up to `limit` results, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<ExecutionResult> {
        self.results
            .read()
            .iter()
            .rev()
            .take(limit)
            .map(|r| ExecutionResult::clone(r))
            .collect()
    }

    /// Looks up a stored result by execution id.
    #[must_use]
    pub fn find(&self, execution_id: Uuid) -> Option<ExecutionResult> {
        self.results
            .read()
            .iter()
            .rev()
            .find(|r| r.execution_id == execution_id)
            .map(|r| ExecutionResult::clone(r))
    }

    /// Number of stored results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.read().is_empty()
    }

    /// Maximum number of stored results.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
