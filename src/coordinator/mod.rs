//! Coordinator (C4)
//!
//! Binds the Engine, the Arbiter, the Durable Log, the Scheduler, and
//! the Broadcast Hub together into one per-auction actor and serializes
//! every mutation through its mailbox. "Acquire the per-auction lock"
//! becomes "send a command and await the reply" — one `tokio::task`
//! per live auction, fed by a bounded `mpsc` channel with `oneshot`
//! reply channels, rather than a `Mutex` held across `.await`.

mod actor;

use crate::arbiter::SharedArbiter;
use crate::broadcast::BroadcastHub;
use crate::engine::{EngineItem, EngineState};
use crate::error::AppError;
use crate::models::{
    Auction, AuctionItem, AuctionStateView, AuctionStatus, AuctionSummary, Bid, BidResult,
    CreateItemRequest, ItemStatus,
};
use crate::scheduler::Scheduler;
use crate::storage::{AuctionRecord, SharedLog};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use validator::Validate;

use actor::{AuctionActor, Command};

/// Applied to an item when the request does not name a `durationSec`.
/// Not one of the enumerated environment keys — a fixed default rather
/// than a config knob, matching the 60s window used throughout this
/// crate's seeded test scenarios.
const DEFAULT_ITEM_DURATION_SEC: i32 = 60;

/// Fixed per-item extension grant — 15s, matching the scenario that
/// exercises "extension adds to remaining time, not the full window".
const DEFAULT_EXTRA_DURATION_SEC: i32 = 15;

/// Mailbox capacity for a single auction's actor. Bids for one item are
/// strictly serialized behind this channel; a depth of 64 gives ample
/// headroom over concurrent-bid bursts without masking a genuinely
/// stuck worker.
const MAILBOX_CAPACITY: usize = 64;

type Registry = Arc<Mutex<HashMap<Uuid, mpsc::Sender<Command>>>>;

pub struct Coordinator {
    log: SharedLog,
    arbiter: SharedArbiter,
    hub: Arc<BroadcastHub>,
    scheduler: Arc<Scheduler>,
    registry: Registry,
}

struct ExpiryRelay {
    coordinator: Weak<Coordinator>,
}

#[async_trait::async_trait]
impl crate::scheduler::ExpiryHandler for ExpiryRelay {
    async fn on_item_expiry(&self, auction_id: Uuid) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.dispatch_expiry(auction_id).await;
        }
    }
}

impl Coordinator {
    pub fn new(log: SharedLog, arbiter: SharedArbiter) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let scheduler = Arc::new(Scheduler::new(Arc::new(ExpiryRelay {
                coordinator: weak.clone(),
            })));
            Coordinator {
                log,
                arbiter,
                hub: Arc::new(BroadcastHub::new()),
                scheduler,
                registry: Arc::new(Mutex::new(HashMap::new())),
            }
        })
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.hub.clone()
    }

    // --- Admission -------------------------------------------------------

    #[tracing::instrument(skip(self, items), fields(seller_id = %seller_id, item_count = items.len()))]
    pub async fn create_auction(
        &self,
        seller_id: Uuid,
        items: Vec<CreateItemRequest>,
    ) -> Result<AuctionStateView, AppError> {
        if items.is_empty() {
            return Err(AppError::IllegalTransition(
                "auction must have at least one item",
            ));
        }
        for item in &items {
            if item.validate().is_err() {
                return Err(AppError::IllegalTransition("invalid item in auction request"));
            }
            if item.starting_price < Decimal::ZERO {
                return Err(AppError::IllegalTransition("starting price must be non-negative"));
            }
        }
        if self.log.get_user(seller_id).await?.is_none() {
            return Err(AppError::IllegalTransition("unknown seller"));
        }

        let auction_id = Uuid::new_v4();
        let now = Utc::now();

        let engine_items: Vec<EngineItem> = items
            .into_iter()
            .enumerate()
            .map(|(order, item)| {
                let duration_sec = item.duration_sec.unwrap_or(DEFAULT_ITEM_DURATION_SEC);
                EngineItem {
                    item_id: Uuid::new_v4(),
                    item_order: order as i32,
                    name: item.name,
                    starting_price: item.starting_price,
                    duration_sec,
                    extra_duration_sec: DEFAULT_EXTRA_DURATION_SEC,
                    status: ItemStatus::Pending,
                    highest_bid: item.starting_price,
                    extended: false,
                    highest_bidder_id: None,
                }
            })
            .collect();

        let max_duration_sec = engine_items
            .iter()
            .map(|i| i.duration_sec + i.extra_duration_sec)
            .max()
            .unwrap_or(0);

        let auction = Auction {
            auction_id,
            seller_id,
            status: AuctionStatus::Created,
            current_item_index: 0,
            max_duration_sec,
            created_at: now,
            started_at: None,
            ended_at: None,
        };
        let db_items: Vec<AuctionItem> = engine_items
            .iter()
            .map(|item| AuctionItem {
                item_id: item.item_id,
                auction_id,
                item_order: item.item_order,
                name: item.name.clone(),
                starting_price: item.starting_price,
                duration_sec: item.duration_sec,
                extra_duration_sec: item.extra_duration_sec,
                status: item.status,
                highest_bid: item.highest_bid,
                extended: item.extended,
                highest_bidder_id: item.highest_bidder_id,
                live_at: None,
                sold_at: None,
            })
            .collect();

        self.log.append_auction(&auction, &db_items).await?;

        let item_count = engine_items.len();
        let engine = EngineState {
            auction_id,
            seller_id,
            status: AuctionStatus::Created,
            current_item_index: 0,
            items: engine_items,
        };

        let sender = self.spawn_actor(
            engine,
            seller_id,
            now,
            None,
            None,
            vec![None; item_count],
            vec![None; item_count],
            None,
        );
        let (tx, rx) = oneshot::channel();
        sender
            .send(Command::GetState { reply: tx })
            .await
            .map_err(|_| AppError::unknown_auction(auction_id))?;
        rx.await
            .map_err(|_| AppError::Unavailable("auction worker terminated".into()))?
    }

    // --- Start / Bid / Extend --------------------------------------------

    pub async fn start_auction(&self, auction_id: Uuid) -> Result<AuctionStateView, AppError> {
        self.dispatch(auction_id, |reply| Command::Start { reply })
            .await?
    }

    pub async fn place_bid(
        &self,
        auction_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        idempotency_key: Option<String>,
    ) -> BidResult {
        let idempotency_key = idempotency_key.map(|k| truncate_idempotency_key(&k));
        match self
            .dispatch(auction_id, |reply| Command::PlaceBid {
                user_id,
                amount,
                idempotency_key,
                reply,
            })
            .await
        {
            Ok(result) => result,
            Err(e) => BidResult::rejected(e.code()),
        }
    }

    pub async fn extend_item(
        &self,
        auction_id: Uuid,
        seller_id: Uuid,
    ) -> Result<AuctionStateView, AppError> {
        self.dispatch(auction_id, |reply| Command::Extend { seller_id, reply })
            .await?
    }

    // --- Reads -------------------------------------------------------------

    pub async fn get_state(&self, auction_id: Uuid) -> Result<AuctionStateView, AppError> {
        match self
            .dispatch(auction_id, |reply| Command::GetState { reply })
            .await
        {
            Ok(inner) => inner,
            Err(AppError::NotFound(_)) => {
                let record = self
                    .log
                    .load_one(auction_id)
                    .await?
                    .ok_or_else(|| AppError::unknown_auction(auction_id))?;
                Ok(record_to_view(record))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_summaries(
        &self,
        seller_id: Option<Uuid>,
    ) -> Result<Vec<AuctionSummary>, AppError> {
        self.log.list_summaries(seller_id).await
    }

    pub async fn bids_for_item(&self, auction_id: Uuid, item_id: Uuid) -> Result<Vec<Bid>, AppError> {
        let state = self.get_state(auction_id).await?;
        if !state.items.iter().any(|i| i.item_id == item_id) {
            return Err(AppError::NotFound(format!("item {item_id}")));
        }
        self.log.bids_for_item(item_id).await
    }

    // --- Recovery ------------------------------------------------------

    /// Rebuilds one `AuctionActor` per non-ENDED auction, re-seeds the
    /// Arbiter for a LIVE item's current highest bid, and re-arms the
    /// Scheduler from *remaining* time derived from `live_at` rather
    /// than the item's full duration.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<(), AppError> {
        let records = self.log.load_active().await?;
        tracing::info!(count = records.len(), "recovering active auctions");
        for record in records {
            self.rehydrate(record).await?;
        }
        Ok(())
    }

    async fn rehydrate(&self, record: AuctionRecord) -> Result<(), AppError> {
        let auction_id = record.auction.auction_id;
        let seller_id = record.auction.seller_id;
        let created_at = record.auction.created_at;
        let started_at = record.auction.started_at;
        let ended_at = record.auction.ended_at;

        let sold_at: Vec<Option<DateTime<Utc>>> = record.items.iter().map(|i| i.sold_at).collect();
        let live_at: Vec<Option<DateTime<Utc>>> = record.items.iter().map(|i| i.live_at).collect();

        let current_item_index = record.auction.current_item_index.max(0) as usize;
        let engine = EngineState {
            auction_id,
            seller_id,
            status: record.auction.status,
            current_item_index,
            items: record
                .items
                .iter()
                .map(|item| EngineItem {
                    item_id: item.item_id,
                    item_order: item.item_order,
                    name: item.name.clone(),
                    starting_price: item.starting_price,
                    duration_sec: item.duration_sec,
                    extra_duration_sec: item.extra_duration_sec,
                    status: item.status,
                    highest_bid: item.highest_bid,
                    extended: item.extended,
                    highest_bidder_id: item.highest_bidder_id,
                })
                .collect(),
        };

        let mut current_deadline = None;
        if engine.status == AuctionStatus::Live {
            if let Some(current_item) = engine.items.get(current_item_index) {
                self.arbiter
                    .seed_item_with_bidder(
                        auction_id,
                        current_item.item_id,
                        current_item.highest_bid,
                        current_item.highest_bidder_id,
                    )
                    .await?;

                let remaining = remaining_window(
                    live_at.get(current_item_index).copied().flatten(),
                    current_item.duration_sec,
                    current_item.extra_duration_sec,
                    current_item.extended,
                );
                let deadline = self.scheduler.schedule(auction_id, remaining);
                current_deadline = Some(deadline);
                tracing::info!(
                    %auction_id,
                    item_id = %current_item.item_id,
                    remaining_sec = remaining,
                    "re-armed expiry timer from remaining time on recovery"
                );
            }
        }

        let sender = self.spawn_actor(
            engine, seller_id, created_at, started_at, ended_at, sold_at, live_at, current_deadline,
        );
        self.registry.lock().insert(auction_id, sender);
        Ok(())
    }

    // --- Actor plumbing --------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn spawn_actor(
        &self,
        engine: EngineState,
        seller_id: Uuid,
        created_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
        sold_at: Vec<Option<DateTime<Utc>>>,
        live_at: Vec<Option<DateTime<Utc>>>,
        current_deadline: Option<DateTime<Utc>>,
    ) -> mpsc::Sender<Command> {
        let auction_id = engine.auction_id;
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = AuctionActor::new(
            engine,
            seller_id,
            created_at,
            started_at,
            ended_at,
            sold_at,
            live_at,
            current_deadline,
            self.arbiter.clone(),
            self.log.clone(),
            self.scheduler.clone(),
            self.hub.clone(),
        );
        self.registry.lock().insert(auction_id, tx.clone());
        tokio::spawn(actor.run(rx, self.registry.clone()));
        tx
    }

    async fn dispatch_expiry(&self, auction_id: Uuid) {
        let sender = self.registry.lock().get(&auction_id).cloned();
        let Some(sender) = sender else {
            return;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if sender.send(Command::Expire { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    async fn dispatch<T>(
        &self,
        auction_id: Uuid,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, AppError>
    where
        T: Send + 'static,
    {
        let sender = self.registry.lock().get(&auction_id).cloned();
        let Some(sender) = sender else {
            return Err(AppError::unknown_auction(auction_id));
        };
        let (tx, rx) = oneshot::channel();
        sender
            .send(make(tx))
            .await
            .map_err(|_| AppError::unknown_auction(auction_id))?;
        rx.await
            .map_err(|_| AppError::Unavailable("auction worker terminated".into()))
    }
}

fn remaining_window(
    live_at: Option<DateTime<Utc>>,
    duration_sec: i32,
    extra_duration_sec: i32,
    extended: bool,
) -> i32 {
    let Some(live_at) = live_at else {
        return duration_sec + if extended { extra_duration_sec } else { 0 };
    };
    let budget = ChronoDuration::seconds(duration_sec as i64)
        + if extended {
            ChronoDuration::seconds(extra_duration_sec as i64)
        } else {
            ChronoDuration::zero()
        };
    let elapsed = (Utc::now() - live_at).max(ChronoDuration::zero());
    (budget - elapsed).max(ChronoDuration::zero()).num_seconds() as i32
}

fn record_to_view(record: AuctionRecord) -> AuctionStateView {
    AuctionStateView {
        auction_id: record.auction.auction_id,
        seller_id: record.auction.seller_id,
        status: record.auction.status,
        current_item_index: record.auction.current_item_index,
        created_at: record.auction.created_at,
        started_at: record.auction.started_at,
        ended_at: record.auction.ended_at,
        items: record.items,
        item_end_time: None,
    }
}

/// Client-supplied idempotency keys are bounded to keep the Arbiter's
/// dedup keyspace finite; a pathological client can only waste its own
/// bid slot, never another bidder's.
fn truncate_idempotency_key(key: &str) -> String {
    key.chars().take(128).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::InMemoryArbiter;
    use crate::models::{CreateItemRequest, User};
    use crate::storage::InMemoryLog;
    use rust_decimal_macros::dec;

    async fn new_coordinator_with_seller() -> (Arc<Coordinator>, Uuid) {
        let log = InMemoryLog::new();
        let seller_id = Uuid::new_v4();
        log.seed_user(User {
            user_id: seller_id,
            display_name: "Seller".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        let log: SharedLog = Arc::new(log);
        let arbiter = InMemoryArbiter::new_shared();
        (Coordinator::new(log, arbiter), seller_id)
    }

    /// The Coordinator treats the Arbiter's CAS as the single authority
    /// on a bid race: for one accepted bid with no idempotency key it
    /// must call `bid_cas` exactly once, never re-checking or retrying
    /// behind the engine's own (advisory) bookkeeping.
    #[tokio::test]
    async fn arbiter_bid_cas_is_called_exactly_once_per_accepted_bid() {
        use crate::arbiter::{CasOutcome, MockArbiterClient};

        let log = InMemoryLog::new();
        let seller_id = Uuid::new_v4();
        log.seed_user(User {
            user_id: seller_id,
            display_name: "Seller".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        let log: SharedLog = Arc::new(log);

        let mut mock = MockArbiterClient::new();
        mock.expect_seed_item().returning(|_, _, _| Ok(()));
        mock.expect_bid_cas()
            .times(1)
            .returning(|_, _, _, _| Ok(CasOutcome::Accepted));

        let arbiter: SharedArbiter = Arc::new(mock);
        let coordinator = Coordinator::new(log, arbiter);

        let created = coordinator
            .create_auction(
                seller_id,
                vec![CreateItemRequest {
                    name: "Lamp".into(),
                    starting_price: dec!(10),
                    duration_sec: Some(60),
                }],
            )
            .await
            .unwrap();
        coordinator.start_auction(created.auction_id).await.unwrap();

        let bidder = Uuid::new_v4();
        let result = coordinator
            .place_bid(created.auction_id, bidder, dec!(25), None)
            .await;
        assert!(result.accepted);

        // `mock` asserts its `.times(1)` expectation on drop; an
        // auction-actor bug that calls `bid_cas` zero or more-than-once
        // times would fail this test at that point.
    }

    #[tokio::test]
    async fn create_start_and_bid_happy_path() {
        let (coordinator, seller_id) = new_coordinator_with_seller().await;

        let created = coordinator
            .create_auction(
                seller_id,
                vec![CreateItemRequest {
                    name: "Lamp".into(),
                    starting_price: dec!(10),
                    duration_sec: Some(60),
                }],
            )
            .await
            .unwrap();
        assert_eq!(created.status, AuctionStatus::Created);

        let started = coordinator.start_auction(created.auction_id).await.unwrap();
        assert_eq!(started.status, AuctionStatus::Live);
        assert_eq!(started.items[0].status, ItemStatus::Live);

        let bidder = Uuid::new_v4();
        let result = coordinator
            .place_bid(created.auction_id, bidder, dec!(25), None)
            .await;
        assert!(result.accepted);

        let state = coordinator.get_state(created.auction_id).await.unwrap();
        assert_eq!(state.items[0].highest_bid, dec!(25));
        assert_eq!(state.items[0].highest_bidder_id, Some(bidder));
    }

    #[tokio::test]
    async fn concurrent_bids_never_let_a_lower_amount_win() {
        let (coordinator, seller_id) = new_coordinator_with_seller().await;

        let created = coordinator
            .create_auction(
                seller_id,
                vec![CreateItemRequest {
                    name: "Lamp".into(),
                    starting_price: dec!(10),
                    duration_sec: Some(60),
                }],
            )
            .await
            .unwrap();
        coordinator.start_auction(created.auction_id).await.unwrap();

        let mut handles = Vec::new();
        for amount in 11..=40 {
            let coordinator = coordinator.clone();
            let auction_id = created.auction_id;
            handles.push(tokio::spawn(async move {
                coordinator
                    .place_bid(auction_id, Uuid::new_v4(), Decimal::from(amount), None)
                    .await
            }));
        }
        for h in handles {
            let _ = h.await.unwrap();
        }

        let state = coordinator.get_state(created.auction_id).await.unwrap();
        assert_eq!(state.items[0].highest_bid, dec!(40));
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_the_original_outcome() {
        let (coordinator, seller_id) = new_coordinator_with_seller().await;

        let created = coordinator
            .create_auction(
                seller_id,
                vec![CreateItemRequest {
                    name: "Lamp".into(),
                    starting_price: dec!(10),
                    duration_sec: Some(60),
                }],
            )
            .await
            .unwrap();
        coordinator.start_auction(created.auction_id).await.unwrap();

        let bidder = Uuid::new_v4();
        let first = coordinator
            .place_bid(created.auction_id, bidder, dec!(20), Some("k1".into()))
            .await;
        assert!(first.accepted);

        let replay = coordinator
            .place_bid(created.auction_id, bidder, dec!(20), Some("k1".into()))
            .await;
        assert_eq!(replay, first);
    }

    #[tokio::test]
    async fn extend_adds_time_without_restarting_the_window() {
        let (coordinator, seller_id) = new_coordinator_with_seller().await;

        let created = coordinator
            .create_auction(
                seller_id,
                vec![CreateItemRequest {
                    name: "Lamp".into(),
                    starting_price: dec!(10),
                    duration_sec: Some(60),
                }],
            )
            .await
            .unwrap();
        coordinator.start_auction(created.auction_id).await.unwrap();

        let before = coordinator.get_state(created.auction_id).await.unwrap();
        let extended = coordinator
            .extend_item(created.auction_id, seller_id)
            .await
            .unwrap();
        assert!(extended.items[0].extended);
        assert!(extended.item_end_time.unwrap() >= before.item_end_time.unwrap_or(0));

        assert_eq!(
            coordinator.extend_item(created.auction_id, seller_id).await,
            Err(AppError::IllegalTransition("item already extended"))
        );
    }

    #[tokio::test]
    async fn non_seller_cannot_extend() {
        let (coordinator, seller_id) = new_coordinator_with_seller().await;

        let created = coordinator
            .create_auction(
                seller_id,
                vec![CreateItemRequest {
                    name: "Lamp".into(),
                    starting_price: dec!(10),
                    duration_sec: Some(60),
                }],
            )
            .await
            .unwrap();
        coordinator.start_auction(created.auction_id).await.unwrap();

        let stranger = Uuid::new_v4();
        assert_eq!(
            coordinator.extend_item(created.auction_id, stranger).await,
            Err(AppError::PermissionDenied)
        );
    }
}
