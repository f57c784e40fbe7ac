//! Bounded worker pool for the selecting phase: at most N users pick seats at
//! once, each served by one worker, fed oldest-first from a request source.

pub mod protocol;
pub mod selection;
pub mod source;
pub mod tcp;
pub mod worker;

pub use protocol::*;
pub use selection::*;
pub use source::*;
pub use tcp::*;
pub use worker::*;

use crate::audit::{record_transition, StateRecorder};
use crate::retry::{Backoff, RetryConfig};
use crate::{Metrics, RequestStatus, SelectionSession, StateTransition, WorkerSettings};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

type Feed = mpsc::UnboundedSender<WorkItem>;

/// Pull-based coordinator. Seeds every worker once at startup, then asks the
/// source for exactly one new item per worker report, so each worker has at
/// most one unit of work in flight.
pub struct Coordinator {
    source: Arc<dyn WorkSource>,
    board: Arc<SelectionBoard>,
    recorder: Arc<dyn StateRecorder>,
    metrics: Metrics,
    workers: usize,
    selection_timeout: Duration,
    sessions: DashMap<usize, SelectionSession>,
    peak_sessions: AtomicUsize,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn WorkSource>,
        board: Arc<SelectionBoard>,
        recorder: Arc<dyn StateRecorder>,
        metrics: Metrics,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            source,
            board,
            recorder,
            metrics,
            workers: settings.count.max(1),
            selection_timeout: settings.selection_timeout(),
            sessions: DashMap::new(),
            peak_sessions: AtomicUsize::new(0),
        }
    }

    pub fn board(&self) -> &Arc<SelectionBoard> {
        &self.board
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Highest number of concurrent sessions seen so far.
    pub fn peak_sessions(&self) -> usize {
        self.peak_sessions.load(Ordering::SeqCst)
    }

    /// Current sessions ordered by worker id.
    pub fn sessions(&self) -> Vec<(usize, SelectionSession)> {
        let mut sessions: Vec<(usize, SelectionSession)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        sessions.sort_by_key(|(worker, _)| *worker);
        sessions
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> crate::Result<()> {
        info!(workers = self.workers, timeout = ?self.selection_timeout, "Coordinator is running...");
        let (report_tx, mut reports) = mpsc::unbounded_channel();

        let mut feeds: Vec<Feed> = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let (feed, items) = mpsc::unbounded_channel();
            let worker = Worker::new(id, Arc::clone(&self.board), self.selection_timeout);
            tokio::spawn(worker.run(items, report_tx.clone()));
            feeds.push(feed);
        }
        drop(report_tx);

        for (id, feed) in feeds.iter().enumerate() {
            self.dispatch(id, feed.clone(), shutdown.resubscribe());
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Coordinator received shutdown signal");
                    break;
                }
                report = reports.recv() => {
                    let Some(report) = report else { break };
                    let worker = report.worker;
                    self.handle_report(report).await;
                    match feeds.get(worker) {
                        Some(feed) => self.dispatch(worker, feed.clone(), shutdown.resubscribe()),
                        None => error!(worker, "Report from unknown worker"),
                    }
                }
            }
        }

        info!("Coordinator shutting down...");
        Ok(())
    }

    /// Record the terminal transition and pass the completion upstream. The
    /// coordinator is the only place that records `selecting` and the
    /// terminal state of pooled work.
    async fn handle_report(&self, report: SelectionReport) {
        let started = self.sessions.remove(&report.worker).map(|(_, session)| session.started_at);
        self.metrics.active_sessions.set(self.sessions.len() as i64);
        if let Some(started) = started {
            let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
            self.metrics.record_selection_finished(elapsed, !report.success);
        }

        let status = if report.success {
            RequestStatus::Reserved
        } else {
            RequestStatus::TimedOut
        };
        info!(worker = report.worker, request_id = %report.request_id, ?status, "Selection finished");
        record_transition(
            self.recorder.as_ref(),
            StateTransition::new(&report.request_id, status),
        )
        .await;

        if let Err(e) = self.source.done(&report).await {
            warn!(worker = report.worker, "Failed to report completion upstream: {}", e);
        }
    }

    /// Fetch one item for `worker` in the background and hand it over.
    fn dispatch(self: &Arc<Self>, worker: usize, feed: Feed, mut shutdown: broadcast::Receiver<()>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = Backoff::new(RetryConfig::broker_reconnect());
            loop {
                let next = tokio::select! {
                    _ = shutdown.recv() => return,
                    next = coordinator.source.next(worker) => next,
                };
                match next {
                    Ok(item) => {
                        if !feed.is_closed() {
                            coordinator.open_session(worker, &item).await;
                        }
                        if let Err(returned) = feed.send(item) {
                            coordinator.sessions.remove(&worker);
                            warn!(worker, "Worker stopped, handing its item back");
                            if let Err(e) = coordinator.source.give_back(returned.0).await {
                                warn!(worker, "Failed to hand item back: {}", e);
                            }
                        }
                        return;
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(worker, ?delay, "Could not fetch work: {}", e);
                        tokio::select! {
                            _ = shutdown.recv() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });
    }

    async fn open_session(&self, worker: usize, item: &WorkItem) {
        let started_at = Utc::now();
        let deadline = started_at
            + chrono::Duration::from_std(self.selection_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        self.sessions.insert(
            worker,
            SelectionSession {
                request_id: item.request_id.clone(),
                group_key: item.group_key(),
                user_identity: item.user_identity.clone(),
                started_at,
                deadline,
            },
        );
        let active = self.sessions.len();
        self.peak_sessions.fetch_max(active, Ordering::SeqCst);
        self.metrics.active_sessions.set(active as i64);

        record_transition(
            self.recorder.as_ref(),
            StateTransition::new(&item.request_id, RequestStatus::Selecting),
        )
        .await;
    }
}
