use crate::audit::{record_transition, StateRecorder};
use crate::{
    AdmissionQueue, AdmissionRequest, ConnectionRegistry, GroupKey, Metrics, Notification,
    RequestStatus, SelectionOutcome, StateTransition,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct ActiveSelection {
    request: AdmissionRequest,
    generation: u64,
    started: Instant,
}

/// Result of one promotion step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Promotion {
    /// The request that left the selecting state, if any.
    pub finished: Option<AdmissionRequest>,
    /// The request that entered the selecting state, if any.
    pub promoted: Option<AdmissionRequest>,
}

/// Moves requests `in_queue -> selecting -> {reserved | cancelled | timed_out}`.
///
/// At most one request per group is selecting. Resume of a paused group is
/// signalled by the queue itself when a promotion drains it below capacity.
pub struct Promoter {
    queue: Arc<AdmissionQueue>,
    registry: Arc<ConnectionRegistry>,
    recorder: Arc<dyn StateRecorder>,
    metrics: Metrics,
    selection_timeout: Option<Duration>,
    active: DashMap<GroupKey, ActiveSelection>,
    generation: AtomicU64,
}

impl Promoter {
    pub fn new(
        queue: Arc<AdmissionQueue>,
        registry: Arc<ConnectionRegistry>,
        recorder: Arc<dyn StateRecorder>,
        metrics: Metrics,
        selection_timeout: Option<Duration>,
    ) -> Self {
        Self {
            queue,
            registry,
            recorder,
            metrics,
            selection_timeout,
            active: DashMap::new(),
            generation: AtomicU64::new(1),
        }
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    /// The request currently selecting in `group`.
    pub fn active_selection(&self, group: &GroupKey) -> Option<AdmissionRequest> {
        self.active.get(group).map(|entry| entry.request.clone())
    }

    fn new_selection(&self, request: AdmissionRequest) -> ActiveSelection {
        ActiveSelection {
            request,
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            started: Instant::now(),
        }
    }

    /// The selecting user of `group` is done (or gave up): close their
    /// selection with `outcome` and promote the next queued request.
    /// A no-op when nothing is selecting and nothing is queued.
    pub async fn finish(self: &Arc<Self>, group: &GroupKey, outcome: SelectionOutcome) -> Promotion {
        let (finished, promoted) = match self.active.entry(group.clone()) {
            Entry::Occupied(mut entry) => match self.queue.promote(group) {
                Some(next) => {
                    let selection = self.new_selection(next);
                    let promoted = (selection.request.clone(), selection.generation);
                    let previous = entry.insert(selection);
                    (Some(previous), Some(promoted))
                }
                None => (Some(entry.remove()), None),
            },
            Entry::Vacant(entry) => match self.queue.promote(group) {
                Some(next) => {
                    let selection = self.new_selection(next);
                    let promoted = (selection.request.clone(), selection.generation);
                    entry.insert(selection);
                    (None, Some(promoted))
                }
                None => (None, None),
            },
        };

        self.complete(finished, promoted, outcome).await
    }

    /// Promote the head of `group` only if nobody is selecting there.
    pub async fn kick(self: &Arc<Self>, group: &GroupKey) -> Option<AdmissionRequest> {
        let promoted = match self.active.entry(group.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => self.queue.promote(group).map(|next| {
                let selection = self.new_selection(next);
                let promoted = (selection.request.clone(), selection.generation);
                entry.insert(selection);
                promoted
            }),
        };

        self.complete(None, promoted, SelectionOutcome::Reserved)
            .await
            .promoted
    }

    /// Cancel a request, whether it is still queued or already selecting.
    /// Returns false when the request is unknown to the group.
    pub async fn cancel(self: &Arc<Self>, group: &GroupKey, request_id: &str) -> bool {
        if let Some(request) = self.queue.cancel(group, request_id) {
            info!(group = %group, request_id = %request.request_id, "Cancelled queued request");
            record_transition(
                self.recorder.as_ref(),
                StateTransition::new(&request.request_id, RequestStatus::Cancelled),
            )
            .await;
            return true;
        }

        let selecting = self
            .active
            .get(group)
            .map(|entry| entry.request.request_id == request_id)
            .unwrap_or(false);
        if selecting {
            self.finish(group, SelectionOutcome::Cancelled).await;
        }
        selecting
    }

    /// Deadline handler: only acts if the same selection is still active.
    /// Boxed because it re-enters `complete` from a spawned timer.
    fn expire(self: Arc<Self>, group: GroupKey, generation: u64) -> BoxFuture<'static, ()> {
        async move {
            let (finished, promoted) = match self.active.entry(group.clone()) {
                Entry::Occupied(mut entry) if entry.get().generation == generation => {
                    match self.queue.promote(&group) {
                        Some(next) => {
                            let selection = self.new_selection(next);
                            let promoted = (selection.request.clone(), selection.generation);
                            let previous = entry.insert(selection);
                            (Some(previous), Some(promoted))
                        }
                        None => (Some(entry.remove()), None),
                    }
                }
                _ => return,
            };

            if let Some(expired) = &finished {
                info!(group = %group, request_id = %expired.request.request_id, "Selection timed out");
                self.registry.send(
                    &expired.request.request_id,
                    Notification::SelectionTimeout { group: group.clone() },
                );
            }
            self.complete(finished, promoted, SelectionOutcome::TimedOut).await;
        }
        .boxed()
    }

    async fn complete(
        self: &Arc<Self>,
        finished: Option<ActiveSelection>,
        promoted: Option<(AdmissionRequest, u64)>,
        outcome: SelectionOutcome,
    ) -> Promotion {
        let finished = match finished {
            Some(selection) => {
                let status = RequestStatus::from(outcome);
                self.metrics.record_selection_finished(
                    selection.started.elapsed(),
                    outcome == SelectionOutcome::TimedOut,
                );
                debug!(request_id = %selection.request.request_id, ?status, "Selection finished");
                record_transition(
                    self.recorder.as_ref(),
                    StateTransition::new(&selection.request.request_id, status),
                )
                .await;
                Some(selection.request)
            }
            None => None,
        };

        let promoted = match promoted {
            Some((request, generation)) => {
                self.start_selection(&request, generation).await;
                Some(request)
            }
            None => None,
        };

        Promotion { finished, promoted }
    }

    async fn start_selection(self: &Arc<Self>, request: &AdmissionRequest, generation: u64) {
        let group = request.group_key.clone();
        info!(group = %group, request_id = %request.request_id, "Promoted to selecting");
        self.metrics.promotions.inc();

        self.registry.send(
            &request.request_id,
            Notification::YourTurn { group: group.clone() },
        );
        record_transition(
            self.recorder.as_ref(),
            StateTransition::new(&request.request_id, RequestStatus::Selecting),
        )
        .await;

        if let Some(timeout) = self.selection_timeout {
            let promoter = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                promoter.expire(group, generation).await;
            });
        }
    }
}
