use super::{SelectionReport, WorkItem};
use crate::audit::{record_transition, StateRecorder};
use crate::{
    AdmissionQueue, AdmissionRequest, ConnectionRegistry, Metrics, Notification, RequestStatus, Result,
    StateTransition,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Upstream supplier of work for the pool.
///
/// State transitions of dispatched work are recorded by the coordinator,
/// not by the source.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// The next request for `worker`. Waits until one exists. Dropping the
    /// call before it returns must not take a request.
    async fn next(&self, worker: usize) -> Result<WorkItem>;

    /// A worker finished the item it was given.
    async fn done(&self, report: &SelectionReport) -> Result<()>;

    /// Take back an item that never reached a worker.
    async fn give_back(&self, item: WorkItem) -> Result<()>;
}

/// Serves the admission queue oldest-first across all groups.
pub struct QueueWorkSource {
    queue: Arc<AdmissionQueue>,
    registry: Arc<ConnectionRegistry>,
    recorder: Arc<dyn StateRecorder>,
    metrics: Metrics,
    /// Handed out and not reported yet, by request id.
    dispatched: DashMap<String, AdmissionRequest>,
}

impl QueueWorkSource {
    pub fn new(
        queue: Arc<AdmissionQueue>,
        registry: Arc<ConnectionRegistry>,
        recorder: Arc<dyn StateRecorder>,
        metrics: Metrics,
    ) -> Self {
        Self {
            queue,
            registry,
            recorder,
            metrics,
            dispatched: DashMap::new(),
        }
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.len()
    }
}

#[async_trait]
impl WorkSource for QueueWorkSource {
    async fn next(&self, worker: usize) -> Result<WorkItem> {
        let request = self.queue.next_oldest().await;
        info!(worker, group = %request.group_key, request_id = %request.request_id, "Dispatching to worker");
        self.metrics.promotions.inc();

        self.registry.send(
            &request.request_id,
            Notification::YourTurn {
                group: request.group_key.clone(),
            },
        );
        let item = WorkItem::from_request(&request, worker);
        self.dispatched.insert(request.request_id.clone(), request);
        Ok(item)
    }

    async fn done(&self, report: &SelectionReport) -> Result<()> {
        self.dispatched.remove(&report.request_id);
        if !report.success {
            self.registry.send(
                &report.request_id,
                Notification::SelectionTimeout {
                    group: report.group_key(),
                },
            );
        }
        Ok(())
    }

    async fn give_back(&self, item: WorkItem) -> Result<()> {
        let Some((_, request)) = self.dispatched.remove(&item.request_id) else {
            warn!(request_id = %item.request_id, "Returned item was not dispatched here");
            return Ok(());
        };

        match self.queue.requeue(request) {
            Ok(position) => {
                info!(group = %item.group_key(), request_id = %item.request_id, position, "Undelivered item requeued");
            }
            Err(request) => {
                warn!(group = %request.group_key, request_id = %request.request_id, "Group refilled, dropping undelivered item");
                record_transition(
                    self.recorder.as_ref(),
                    StateTransition::new(&request.request_id, RequestStatus::Cancelled),
                )
                .await;
                self.registry.send(
                    &request.request_id,
                    Notification::Error {
                        message: format!("request {} lost its turn and was cancelled", request.request_id),
                    },
                );
            }
        }
        Ok(())
    }
}
