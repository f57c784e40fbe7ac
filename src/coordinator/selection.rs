use crate::GroupKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

type PickKey = (GroupKey, String);

enum Slot {
    Waiting { id: u64, seat: oneshot::Sender<String> },
    Picked { seat: String, expires: Instant },
}

/// Side channel carrying seat picks from users to the worker serving them,
/// keyed by `(group, user identity)`.
///
/// A pick that arrives before any worker waits is kept for `pick_ttl` and
/// handed to the next wait for the same key. Older picks are dropped.
pub struct SelectionBoard {
    slots: Mutex<HashMap<PickKey, Slot>>,
    next_id: AtomicU64,
    pick_ttl: Duration,
}

impl SelectionBoard {
    pub fn new(pick_ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            pick_ttl,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PickKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `timeout` for the user's seat. `None` means timed out.
    pub async fn wait(&self, group: &GroupKey, user_identity: &str, timeout: Duration) -> Option<String> {
        let key = (group.clone(), user_identity.to_string());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();

        {
            let mut slots = self.slots();
            if let Some(Slot::Picked { seat, expires }) = slots.remove(&key) {
                if expires > Instant::now() {
                    return Some(seat);
                }
                debug!(group = %group, user = user_identity, "Discarding expired pick");
            }
            slots.insert(key.clone(), Slot::Waiting { id, seat: tx });
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(seat)) => Some(seat),
            _ => {
                let mut slots = self.slots();
                if matches!(slots.get(&key), Some(Slot::Waiting { id: current, .. }) if *current == id) {
                    slots.remove(&key);
                }
                drop(slots);
                // A pick may have landed just before the deadline.
                rx.try_recv().ok()
            }
        }
    }

    /// Deliver a pick. Returns true when a waiting worker received it,
    /// false when it was kept for a later wait.
    pub fn submit(&self, group: &GroupKey, user_identity: &str, seat_id: impl Into<String>) -> bool {
        let key = (group.clone(), user_identity.to_string());
        let seat_id = seat_id.into();
        let mut slots = self.slots();

        let seat_id = match slots.remove(&key) {
            Some(Slot::Waiting { seat, .. }) => match seat.send(seat_id) {
                Ok(()) => return true,
                Err(seat_id) => seat_id,
            },
            _ => seat_id,
        };

        let now = Instant::now();
        slots.retain(|_, slot| !matches!(slot, Slot::Picked { expires, .. } if *expires <= now));
        debug!(group = %group, user = user_identity, "No worker waiting, keeping pick");
        slots.insert(
            key,
            Slot::Picked {
                seat: seat_id,
                expires: now + self.pick_ttl,
            },
        );
        false
    }

    pub fn is_waiting(&self, group: &GroupKey, user_identity: &str) -> bool {
        matches!(
            self.slots().get(&(group.clone(), user_identity.to_string())),
            Some(Slot::Waiting { .. })
        )
    }

    /// Picks currently kept for a later wait.
    pub fn kept_picks(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Picked { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn pick_reaches_waiting_worker() {
        let board = Arc::new(SelectionBoard::new(Duration::from_secs(10)));
        let group = GroupKey::new("1", "vip");

        let waiter = {
            let board = Arc::clone(&board);
            let group = group.clone();
            tokio::spawn(async move { board.wait(&group, "alice", Duration::from_secs(10)).await })
        };
        while !board.is_waiting(&group, "alice") {
            tokio::task::yield_now().await;
        }

        assert!(board.submit(&group, "alice", "A12"));
        assert_eq!(waiter.await.unwrap(), Some("A12".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn early_pick_is_kept_for_the_wait() {
        let board = SelectionBoard::new(Duration::from_secs(10));
        let group = GroupKey::new("1", "vip");

        assert!(!board.submit(&group, "bob", "B1"));
        assert_eq!(
            board.wait(&group, "bob", Duration::from_secs(10)).await,
            Some("B1".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_cleans_up() {
        let board = SelectionBoard::new(Duration::from_secs(10));
        let group = GroupKey::new("1", "vip");

        assert_eq!(board.wait(&group, "carol", Duration::from_secs(10)).await, None);
        assert!(!board.is_waiting(&group, "carol"));
    }

    #[tokio::test(start_paused = true)]
    async fn pick_after_timeout_does_not_serve_a_later_wait() {
        let board = SelectionBoard::new(Duration::from_secs(10));
        let group = GroupKey::new("1", "vip");

        assert_eq!(board.wait(&group, "alice", Duration::from_secs(10)).await, None);
        assert!(!board.submit(&group, "alice", "STALE"));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(board.wait(&group, "alice", Duration::from_secs(10)).await, None);
        assert_eq!(board.kept_picks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_picks_are_swept_on_submit() {
        let board = SelectionBoard::new(Duration::from_secs(10));
        let group = GroupKey::new("1", "vip");
        for user in ["u1", "u2", "u3"] {
            board.submit(&group, user, "seat");
        }
        assert_eq!(board.kept_picks(), 3);

        tokio::time::sleep(Duration::from_secs(11)).await;
        board.submit(&group, "u4", "seat");
        assert_eq!(board.kept_picks(), 1);
    }
}
