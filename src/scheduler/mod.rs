//! Scheduler (C5)
//!
//! One single-shot timer per auction — at most one item is ever LIVE at
//! a time, so one timer suffices. Reset-on-extend is modeled as a
//! `tokio::sync::watch` carrying the current deadline rather than by
//! cancelling and respawning the underlying task, mirroring the
//! resettable-timer pattern used for item-expiry in the worker loop
//! this crate's Coordinator is modeled on.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

/// Invoked when an armed timer elapses. The Coordinator is the only
/// implementor; kept as a trait so the scheduler has no compile-time
/// dependency on the coordinator module.
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn on_item_expiry(&self, auction_id: Uuid);
}

struct AuctionTimer {
    deadline_tx: watch::Sender<DateTime<Utc>>,
}

/// Per-auction single-shot expiry timers.
pub struct Scheduler {
    handler: std::sync::Arc<dyn ExpiryHandler>,
    timers: Mutex<HashMap<Uuid, AuctionTimer>>,
}

impl Scheduler {
    pub fn new(handler: std::sync::Arc<dyn ExpiryHandler>) -> Self {
        Self {
            handler,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Arms (or re-arms, for a fresh item) the timer for `duration_sec`
    /// from now. Returns the absolute deadline.
    pub fn schedule(&self, auction_id: Uuid, duration_sec: i32) -> DateTime<Utc> {
        let deadline = Utc::now() + ChronoDuration::seconds(duration_sec.max(0) as i64);
        self.arm(auction_id, deadline);
        deadline
    }

    /// Extends the current deadline by `extra_sec`, computed from the
    /// *remaining* time, never from the full duration. Returns `None`
    /// if no timer is currently armed for this auction.
    pub fn extend(&self, auction_id: Uuid, extra_sec: i32) -> Option<DateTime<Utc>> {
        let timers = self.timers.lock();
        let timer = timers.get(&auction_id)?;
        let now = Utc::now();
        let current_deadline = *timer.deadline_tx.borrow();
        let remaining = (current_deadline - now).max(ChronoDuration::zero());
        let new_deadline = now + remaining + ChronoDuration::seconds(extra_sec.max(0) as i64);
        let _ = timer.deadline_tx.send(new_deadline);
        Some(new_deadline)
    }

    /// Cancels the timer for this auction, if any. The background task
    /// observes the sender being dropped and exits without firing.
    pub fn cancel(&self, auction_id: Uuid) {
        self.timers.lock().remove(&auction_id);
    }

    fn arm(&self, auction_id: Uuid, deadline: DateTime<Utc>) {
        let mut timers = self.timers.lock();
        if let Some(existing) = timers.get(&auction_id) {
            if existing.deadline_tx.send(deadline).is_ok() {
                return;
            }
            // The previous task already fired and returned; its
            // receiver is gone, so `send` failed. Fall through and
            // spawn a fresh one below.
        }
        let (tx, rx) = watch::channel(deadline);
        let handler = self.handler.clone();
        tokio::spawn(run_timer(auction_id, rx, handler));
        timers.insert(auction_id, AuctionTimer { deadline_tx: tx });
    }
}

async fn run_timer(
    auction_id: Uuid,
    mut deadline_rx: watch::Receiver<DateTime<Utc>>,
    handler: std::sync::Arc<dyn ExpiryHandler>,
) {
    loop {
        let deadline = *deadline_rx.borrow_and_update();
        let sleep = tokio::time::sleep(duration_until(deadline));
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {
                handler.on_item_expiry(auction_id).await;
                // `on_item_expiry` may itself call back into `schedule`
                // for the auction's next item before returning (the
                // same auction slot is reused rather than given a new
                // timer task). If that reentrant call republished a
                // deadline on this channel while we were awaiting, loop
                // back and wait on it instead of exiting — otherwise the
                // new deadline would sit on a channel nothing is
                // listening to.
                match deadline_rx.has_changed() {
                    Ok(true) => continue,
                    _ => return,
                }
            }
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

fn duration_until(deadline: DateTime<Utc>) -> std::time::Duration {
    let remaining = deadline - Utc::now();
    remaining.to_std().unwrap_or(std::time::Duration::ZERO)
}

/// Converts an absolute deadline into the epoch-millisecond form the
/// realtime protocol reports as `itemEndTime`.
pub fn epoch_millis(deadline: DateTime<Utc>) -> i64 {
    deadline.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        fired: std::sync::Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExpiryHandler for CountingHandler {
        async fn on_item_expiry(&self, _auction_id: Uuid) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fires_once_after_duration() {
        let fired = std::sync::Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(std::sync::Arc::new(CountingHandler { fired: fired.clone() }));
        let auction_id = Uuid::new_v4();

        scheduler.schedule(auction_id, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let fired = std::sync::Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(std::sync::Arc::new(CountingHandler { fired: fired.clone() }));
        let auction_id = Uuid::new_v4();

        scheduler.schedule(auction_id, 60);
        scheduler.cancel(auction_id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn extend_adds_to_remaining_not_full_duration() {
        let fired = std::sync::Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(std::sync::Arc::new(CountingHandler { fired: fired.clone() }));
        let auction_id = Uuid::new_v4();

        let initial = scheduler.schedule(auction_id, 60);
        let extended = scheduler.extend(auction_id, 15).unwrap();

        let delta = extended - initial;
        assert!(delta <= ChronoDuration::seconds(15));
        assert!(delta > ChronoDuration::zero());
    }
}
