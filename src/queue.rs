use crate::{AdmissionRequest, GroupKey, Metrics};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

/// Receiving end of the resume signals raised when a paused group drains
/// below capacity. Owned by the ingress adapter.
pub type ResumeSignals = mpsc::UnboundedReceiver<GroupKey>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull {
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended; `position` is the queue depth after insertion.
    Admitted { position: usize },
    /// The request id was already admitted (pending or promoted); nothing changed.
    AlreadyAdmitted { position: Option<usize> },
    Rejected(QueueFull),
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// How many admitted request ids each group remembers by default.
pub const DEFAULT_DEDUP_WINDOW: usize = 10_000;

/// The most recently admitted request ids of a group, oldest evicted first.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    limit: usize,
}

impl RecentIds {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            limit,
        }
    }

    fn contains(&self, request_id: &str) -> bool {
        self.ids.contains(request_id)
    }

    fn insert(&mut self, request_id: &str) {
        if self.ids.insert(request_id.to_string()) {
            self.order.push_back(request_id.to_string());
        }
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Per-group FIFO state. Only reachable through [`AdmissionQueue`].
#[derive(Debug)]
struct QueueState {
    pending: VecDeque<AdmissionRequest>,
    capacity: usize,
    paused: bool,
    /// Recently admitted ids, pending or promoted, for redelivery checks.
    admitted: RecentIds,
}

impl QueueState {
    fn new(capacity: usize, dedup_window: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity),
            capacity,
            paused: false,
            admitted: RecentIds::new(dedup_window.max(capacity)),
        }
    }

    fn knows(&self, request_id: &str) -> bool {
        self.admitted.contains(request_id) || self.position_of(request_id).is_some()
    }

    fn position_of(&self, request_id: &str) -> Option<usize> {
        self.pending
            .iter()
            .position(|r| r.request_id == request_id)
            .map(|index| index + 1)
    }

    /// Clears the pause flag if the group dropped below capacity.
    /// Returns true exactly once per pause episode.
    fn take_resume(&mut self) -> bool {
        if self.paused && self.pending.len() < self.capacity {
            self.paused = false;
            true
        } else {
            false
        }
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded FCFS queues, one per [`GroupKey`], each behind its own lock.
///
/// Groups are created on first use and live for the rest of the process.
pub struct AdmissionQueue {
    groups: DashMap<GroupKey, Arc<Mutex<QueueState>>>,
    capacity: usize,
    dedup_window: usize,
    sequence: AtomicU64,
    resume_tx: mpsc::UnboundedSender<GroupKey>,
    arrivals: Notify,
    metrics: Metrics,
}

impl AdmissionQueue {
    pub fn new(capacity: usize, metrics: Metrics) -> (Self, ResumeSignals) {
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        let queue = Self {
            groups: DashMap::new(),
            capacity: capacity.max(1),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            sequence: AtomicU64::new(1),
            resume_tx,
            arrivals: Notify::new(),
            metrics,
        };
        (queue, resume_rx)
    }

    /// Remember only the last `window` admitted ids per group (never fewer
    /// than the capacity). Applies to groups created afterwards.
    pub fn with_dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn state(&self, group: &GroupKey) -> Arc<Mutex<QueueState>> {
        if let Some(state) = self.groups.get(group) {
            return Arc::clone(state.value());
        }
        let (capacity, window) = (self.capacity, self.dedup_window);
        Arc::clone(
            self.groups
                .entry(group.clone())
                .or_insert_with(|| Arc::new(Mutex::new(QueueState::new(capacity, window))))
                .value(),
        )
    }

    fn existing_state(&self, group: &GroupKey) -> Option<Arc<Mutex<QueueState>>> {
        self.groups.get(group).map(|state| Arc::clone(state.value()))
    }

    /// Make sure a group exists, e.g. when discovery learns about it.
    pub fn ensure_group(&self, group: &GroupKey) {
        let _ = self.state(group);
    }

    /// Try to admit a request into its group's FIFO.
    pub fn enqueue(&self, mut request: AdmissionRequest) -> EnqueueOutcome {
        let group = request.group_key.clone();
        let state = self.state(&group);
        let mut state = lock(&state);

        if state.knows(&request.request_id) {
            self.metrics.duplicates.inc();
            debug!(group = %group, request_id = %request.request_id, "Request already admitted");
            return EnqueueOutcome::AlreadyAdmitted {
                position: state.position_of(&request.request_id),
            };
        }

        if state.paused || state.pending.len() >= state.capacity {
            if !state.paused {
                state.paused = true;
                self.metrics.paused_groups.inc();
                info!(group = %group, capacity = state.capacity, "Queue full, pausing group");
            }
            self.metrics.rejections.inc();
            return EnqueueOutcome::Rejected(QueueFull {
                capacity: state.capacity,
            });
        }

        request.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        state.admitted.insert(&request.request_id);
        state.pending.push_back(request);
        let position = state.pending.len();
        self.metrics.admissions.inc();
        self.metrics.set_queue_depth(&group, position);
        drop(state);

        self.arrivals.notify_waiters();
        EnqueueOutcome::Admitted { position }
    }

    /// Pop the oldest pending request of a group. Raises a resume signal if
    /// this ends a pause episode.
    pub fn promote(&self, group: &GroupKey) -> Option<AdmissionRequest> {
        let state = self.existing_state(group)?;
        let mut state = lock(&state);
        let request = state.pending.pop_front()?;
        self.after_removal(group, &mut state);
        Some(request)
    }

    /// Pop the oldest pending request across all groups (lowest arrival
    /// sequence; group order breaks ties).
    pub fn promote_oldest(&self) -> Option<AdmissionRequest> {
        loop {
            let (group, sequence) = self.oldest_head()?;
            let state = self.existing_state(&group)?;
            let mut state = lock(&state);
            // Another consumer may have taken the head since the scan.
            if state.pending.front().map(|r| r.sequence) != Some(sequence) {
                continue;
            }
            let request = state.pending.pop_front();
            self.after_removal(&group, &mut state);
            return request;
        }
    }

    fn oldest_head(&self) -> Option<(GroupKey, u64)> {
        let mut oldest: Option<(GroupKey, u64)> = None;
        for group in self.groups() {
            let Some(state) = self.existing_state(&group) else {
                continue;
            };
            let head = lock(&state).pending.front().map(|r| r.sequence);
            if let Some(sequence) = head {
                if oldest.as_ref().map_or(true, |(_, best)| sequence < *best) {
                    oldest = Some((group, sequence));
                }
            }
        }
        oldest
    }

    /// Wait until some group has a pending request and pop the oldest one.
    pub async fn next_oldest(&self) -> AdmissionRequest {
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.promote_oldest() {
                return request;
            }
            notified.await;
        }
    }

    /// Put a popped request back in its group, in arrival order, e.g. when
    /// no worker ever received it. Hands the request back if the group has
    /// filled up in the meantime.
    pub fn requeue(&self, request: AdmissionRequest) -> std::result::Result<usize, AdmissionRequest> {
        let group = request.group_key.clone();
        let state = self.state(&group);
        let mut state = lock(&state);
        if state.pending.len() >= state.capacity {
            return Err(request);
        }

        let index = state
            .pending
            .iter()
            .position(|r| r.sequence > request.sequence)
            .unwrap_or(state.pending.len());
        state.pending.insert(index, request);
        self.metrics.set_queue_depth(&group, state.pending.len());
        drop(state);

        self.arrivals.notify_waiters();
        Ok(index + 1)
    }

    /// Remove a still-pending request. The id stays known while it is inside
    /// the dedup window, so a redelivered join event is not admitted again.
    pub fn cancel(&self, group: &GroupKey, request_id: &str) -> Option<AdmissionRequest> {
        let state = self.existing_state(group)?;
        let mut state = lock(&state);
        let index = state.pending.iter().position(|r| r.request_id == request_id)?;
        let request = state.pending.remove(index);
        self.after_removal(group, &mut state);
        request
    }

    fn after_removal(&self, group: &GroupKey, state: &mut QueueState) {
        self.metrics.set_queue_depth(group, state.pending.len());
        if state.take_resume() {
            self.metrics.paused_groups.dec();
            info!(group = %group, depth = state.pending.len(), "Queue below capacity, signalling resume");
            if self.resume_tx.send(group.clone()).is_err() {
                debug!(group = %group, "No ingress listening for resume signals");
            }
        }
    }

    pub fn depth(&self, group: &GroupKey) -> usize {
        self.existing_state(group)
            .map(|state| lock(&state).pending.len())
            .unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.groups
            .iter()
            .map(|entry| lock(entry.value()).pending.len())
            .sum()
    }

    pub fn is_paused(&self, group: &GroupKey) -> bool {
        self.existing_state(group)
            .map(|state| lock(&state).paused)
            .unwrap_or(false)
    }

    pub fn position(&self, group: &GroupKey, request_id: &str) -> Option<usize> {
        self.existing_state(group)
            .and_then(|state| lock(&state).position_of(request_id))
    }

    pub fn pending(&self, group: &GroupKey) -> Vec<AdmissionRequest> {
        self.existing_state(group)
            .map(|state| lock(&state).pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Known groups in key order.
    pub fn groups(&self) -> Vec<GroupKey> {
        let mut groups: Vec<GroupKey> = self.groups.iter().map(|entry| entry.key().clone()).collect();
        groups.sort();
        groups
    }
}
