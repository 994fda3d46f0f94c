//! Batch types, the batch store, and its priority queue.
//!
//! A batch is an owned, ordered collection of child chat requests tracked as
//! a unit. The store keeps every batch plus a single process-wide queue
//! ordered by priority (high before normal before low) and FIFO within a
//! priority. Progress counters only ever grow until the batch reaches a
//! terminal state.

pub mod processor;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::{ModelRequest, ModelResponse};
use crate::errors::{Error, Result};
use crate::types::{BatchId, OwnerId};

pub use processor::{BatchProcessor, Dispatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Queue rank; lower goes first.
    fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Options accepted at batch creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchOptions {
    #[serde(default)]
    pub priority: Priority,
    /// When set, a `batch.completed` event fires on completion
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Per-child outcome, stored at the same index as its request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchItemResult {
    Response(ModelResponse),
    Error { error: String },
}

/// A child rejected at intake, reported alongside the accepted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidChild {
    /// Index in the submitted child list
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub owner: OwnerId,
    pub requests: Vec<ModelRequest>,
    pub state: BatchState,
    pub priority: Priority,
    pub request_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    /// Indexed 1:1 with `requests`; `None` until the child terminates
    pub results: Vec<Option<BatchItemResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, BatchState::Completed | BatchState::Failed)
    }

    /// Summary payload for the `batch.completed` callback event (counters,
    /// not raw results).
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "batch_id": self.id,
            "state": self.state,
            "priority": self.priority,
            "request_count": self.request_count,
            "completed_count": self.completed_count,
            "failed_count": self.failed_count,
            "created_at": self.created_at,
            "completed_at": self.completed_at,
            "metadata": self.metadata,
        })
    }
}

struct QueueEntry {
    id: BatchId,
    rank: u8,
}

#[derive(Default)]
struct Inner {
    batches: HashMap<BatchId, Batch>,
    queue: VecDeque<QueueEntry>,
}

/// In-memory batch store with the process-wide scheduling queue.
#[derive(Default)]
pub struct BatchStore {
    inner: RwLock<Inner>,
}

impl BatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending batch from already-validated children and enqueue it
    /// before the first queued batch of lower priority.
    pub fn create(&self, owner: OwnerId, requests: Vec<ModelRequest>, options: BatchOptions) -> Batch {
        let request_count = requests.len();
        let batch = Batch {
            id: Uuid::new_v4(),
            owner,
            results: vec![None; request_count],
            requests,
            state: BatchState::Pending,
            priority: options.priority,
            request_count,
            completed_count: 0,
            failed_count: 0,
            error: None,
            callback_url: options.callback_url,
            metadata: options.metadata,
            created_at: Utc::now(),
            completed_at: None,
        };

        let mut inner = self.inner.write();
        let rank = batch.priority.rank();
        let position = inner
            .queue
            .iter()
            .position(|entry| entry.rank > rank)
            .unwrap_or(inner.queue.len());
        inner.queue.insert(position, QueueEntry { id: batch.id, rank });
        inner.batches.insert(batch.id, batch.clone());
        batch
    }

    pub fn get(&self, id: BatchId, owner: OwnerId) -> Result<Batch> {
        self.inner
            .read()
            .batches
            .get(&id)
            .filter(|b| b.owner == owner)
            .cloned()
            .ok_or_else(|| Error::not_found("batch", id))
    }

    /// Batches of `owner`, newest first.
    pub fn list(&self, owner: OwnerId) -> Vec<Batch> {
        let mut owned: Vec<Batch> = self
            .inner
            .read()
            .batches
            .values()
            .filter(|b| b.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned
    }

    /// Cancel a batch that has not started processing. The batch transitions
    /// to `failed` with error "cancelled" and leaves the queue.
    pub fn cancel(&self, id: BatchId, owner: OwnerId) -> Result<Batch> {
        let mut inner = self.inner.write();
        let batch = inner
            .batches
            .get_mut(&id)
            .filter(|b| b.owner == owner)
            .ok_or_else(|| Error::not_found("batch", id))?;

        if batch.state != BatchState::Pending {
            return Err(Error::invalid(format!(
                "batch {id} is {:?} and can no longer be cancelled",
                batch.state
            )));
        }

        batch.state = BatchState::Failed;
        batch.error = Some("cancelled".to_string());
        batch.completed_at = Some(Utc::now());
        let cancelled = batch.clone();
        inner.queue.retain(|entry| entry.id != id);
        Ok(cancelled)
    }

    /// Dequeue the next batch for processing.
    pub(crate) fn pop_next(&self) -> Option<BatchId> {
        self.inner.write().queue.pop_front().map(|entry| entry.id)
    }

    /// Transition `pending -> processing`. Returns `None` when the batch was
    /// cancelled (or vanished) between dequeue and pickup.
    pub(crate) fn begin_processing(&self, id: BatchId) -> Option<Batch> {
        let mut inner = self.inner.write();
        let batch = inner.batches.get_mut(&id)?;
        if batch.state != BatchState::Pending {
            return None;
        }
        batch.state = BatchState::Processing;
        Some(batch.clone())
    }

    /// Record one child outcome at its request index. Counters never
    /// decrease; a slot is only written once.
    pub(crate) fn record_child(
        &self,
        id: BatchId,
        index: usize,
        result: std::result::Result<ModelResponse, String>,
    ) {
        let mut inner = self.inner.write();
        let Some(batch) = inner.batches.get_mut(&id) else {
            return;
        };
        if index >= batch.results.len() || batch.results[index].is_some() {
            return;
        }
        match result {
            Ok(response) => {
                batch.results[index] = Some(BatchItemResult::Response(response));
                batch.completed_count += 1;
            }
            Err(error) => {
                batch.results[index] = Some(BatchItemResult::Error { error });
                batch.failed_count += 1;
            }
        }
    }

    /// Transition `processing -> completed` once every child terminated.
    pub(crate) fn finalize(&self, id: BatchId) -> Option<Batch> {
        let mut inner = self.inner.write();
        let batch = inner.batches.get_mut(&id)?;
        if batch.state != BatchState::Processing {
            return None;
        }
        batch.state = BatchState::Completed;
        batch.completed_at = Some(Utc::now());
        Some(batch.clone())
    }

    /// Mark a batch failed from a scheduler fault.
    pub(crate) fn fail(&self, id: BatchId, error: impl Into<String>) -> Option<Batch> {
        let mut inner = self.inner.write();
        let batch = inner.batches.get_mut(&id)?;
        if batch.is_terminal() {
            return None;
        }
        batch.state = BatchState::Failed;
        batch.error = Some(error.into());
        batch.completed_at = Some(Utc::now());
        Some(batch.clone())
    }

    #[cfg(test)]
    pub(crate) fn queued_ids(&self) -> Vec<BatchId> {
        self.inner.read().queue.iter().map(|e| e.id).collect()
    }
}
