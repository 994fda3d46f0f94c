//! Batch scheduler: dequeues batches and fans their children through the
//! request pipeline under bounded concurrency.
//!
//! One logical scheduler serves the whole process. Children are dispatched
//! in chunks of `max_concurrent_requests`; progress counters are persisted
//! per child as it terminates, so readers observe monotonically
//! non-decreasing counts. Children of one chunk are unordered with respect
//! to one another.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::chat::{ModelRequest, ModelResponse};
use crate::config::BatchSettings;
use crate::errors::Result;
use crate::types::{abbrev_uuid, BatchId, OwnerId};
use crate::webhooks::{WebhookDispatcher, WebhookEventType};

use super::BatchStore;

/// Capability for running one child request through the full pipeline.
///
/// The gateway implements this; keeping the processor generic over it breaks
/// the batch -> gateway -> batch cycle and lets tests stub the pipeline.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, owner: OwnerId, req: ModelRequest) -> Result<ModelResponse>;
}

pub struct BatchProcessor<D> {
    store: Arc<BatchStore>,
    dispatcher: Arc<D>,
    webhooks: Arc<WebhookDispatcher>,
    settings: BatchSettings,
}

impl<D: Dispatch + 'static> BatchProcessor<D> {
    pub fn new(
        store: Arc<BatchStore>,
        dispatcher: Arc<D>,
        webhooks: Arc<WebhookDispatcher>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            webhooks,
            settings,
        }
    }

    /// Spawn the scheduler loop. It drains the queue one batch at a time
    /// until the shutdown token fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Batch scheduler starting");
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                match self.store.pop_next() {
                    Some(batch_id) => self.process_batch(batch_id).await,
                    None => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.settings.poll_interval) => {}
                        }
                    }
                }
            }
            debug!("Batch scheduler exited");
        })
    }

    #[instrument(skip(self), fields(batch_id = %abbrev_uuid(&batch_id)))]
    async fn process_batch(&self, batch_id: BatchId) {
        let Some(batch) = self.store.begin_processing(batch_id) else {
            // Cancelled between dequeue and pickup
            debug!("Batch no longer pending, skipping");
            return;
        };

        info!(children = batch.request_count, "Processing batch");
        let owner = batch.owner;
        let chunk_size = self.settings.max_concurrent_requests.max(1);

        let mut start = 0;
        while start < batch.requests.len() {
            let end = (start + chunk_size).min(batch.requests.len());
            let mut children: JoinSet<(usize, Result<ModelResponse>)> = JoinSet::new();
            let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();

            for index in start..end {
                let dispatcher = self.dispatcher.clone();
                let req = batch.requests[index].clone();
                let handle = children.spawn(async move { (index, dispatcher.dispatch(owner, req).await) });
                task_index.insert(handle.id(), index);
            }

            while let Some(joined) = children.join_next_with_id().await {
                match joined {
                    Ok((_, (index, Ok(response)))) => {
                        self.store.record_child(batch_id, index, Ok(response));
                    }
                    Ok((_, (index, Err(e)))) => {
                        debug!(index, error = %e, "Batch child failed");
                        self.store.record_child(batch_id, index, Err(e.to_string()));
                    }
                    Err(join_error) => {
                        error!(error = %join_error, "Batch child panicked");
                        if let Some(index) = task_index.get(&join_error.id()).copied() {
                            self.store
                                .record_child(batch_id, index, Err("child task panicked".to_string()));
                        }
                    }
                }
            }
            start = end;
        }

        match self.store.finalize(batch_id) {
            Some(completed) => {
                info!(
                    completed = completed.completed_count,
                    failed = completed.failed_count,
                    "Batch completed"
                );
                if completed.callback_url.is_some() {
                    self.webhooks
                        .trigger_event(owner, WebhookEventType::BatchCompleted, completed.summary())
                        .await;
                }
            }
            None => {
                error!("Batch vanished while processing");
                self.store.fail(batch_id, "batch state lost during processing");
            }
        }
    }
}
