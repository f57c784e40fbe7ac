use super::{SelectionBoard, SelectionReport, WorkItem};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Holds at most one selection session at a time.
pub struct Worker {
    id: usize,
    board: Arc<SelectionBoard>,
    timeout: Duration,
}

impl Worker {
    pub fn new(id: usize, board: Arc<SelectionBoard>, timeout: Duration) -> Self {
        Self { id, board, timeout }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Wait for the user's seat within the timeout and report either way.
    pub async fn serve(&self, mut item: WorkItem) -> SelectionReport {
        item.worker = self.id;
        let seat = self
            .board
            .wait(&item.group_key(), &item.user_identity, self.timeout)
            .await;

        match &seat {
            Some(seat_id) => info!(worker = self.id, request_id = %item.request_id, seat_id = %seat_id, "Seat selected"),
            None => info!(worker = self.id, request_id = %item.request_id, "Selection timed out"),
        }
        SelectionReport::new(&item, seat)
    }

    /// Serve items until the feed closes.
    pub async fn run(
        self,
        mut items: mpsc::UnboundedReceiver<WorkItem>,
        reports: mpsc::UnboundedSender<SelectionReport>,
    ) {
        debug!(worker = self.id, "Worker started");
        while let Some(item) = items.recv().await {
            let report = self.serve(item).await;
            if reports.send(report).is_err() {
                break;
            }
        }
        debug!(worker = self.id, "Worker stopped");
    }
}
