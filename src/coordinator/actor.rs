//! The per-auction worker task. One instance owns exactly one
//! `EngineState` and drains its mailbox until the auction ends, at
//! which point it deregisters itself and returns.

use super::Registry;
use crate::arbiter::{CasOutcome, ClaimOutcome, SharedArbiter};
use crate::broadcast::BroadcastHub;
use crate::engine::{AdvanceOutcome, EngineState};
use crate::error::AppError;
use crate::models::{
    AuctionEndedEvent, AuctionItem, AuctionItemResultEntry, AuctionStateView, AuctionStatus,
    BidResult, ItemSoldEvent, ItemStatus,
};
use crate::scheduler::{epoch_millis, Scheduler};
use crate::storage::{AuctionStatusPatch, ItemStatusPatch, SharedLog};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// How long a caller is willing to wait for an in-flight duplicate
/// bid to resolve before giving up: 40 polls at 25ms apart, ~1s total.
const DUPLICATE_POLL_ATTEMPTS: u32 = 40;
const DUPLICATE_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub enum Command {
    Start {
        reply: oneshot::Sender<Result<AuctionStateView, AppError>>,
    },
    PlaceBid {
        user_id: Uuid,
        amount: Decimal,
        idempotency_key: Option<String>,
        reply: oneshot::Sender<BidResult>,
    },
    Extend {
        seller_id: Uuid,
        reply: oneshot::Sender<Result<AuctionStateView, AppError>>,
    },
    Expire {
        reply: oneshot::Sender<()>,
    },
    GetState {
        reply: oneshot::Sender<Result<AuctionStateView, AppError>>,
    },
}

pub struct AuctionActor {
    engine: EngineState,
    seller_id: Uuid,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    sold_at: Vec<Option<DateTime<Utc>>>,
    live_at: Vec<Option<DateTime<Utc>>>,
    current_deadline: Option<DateTime<Utc>>,
    arbiter: SharedArbiter,
    log: SharedLog,
    scheduler: Arc<Scheduler>,
    hub: Arc<BroadcastHub>,
}

impl AuctionActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: EngineState,
        seller_id: Uuid,
        created_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
        sold_at: Vec<Option<DateTime<Utc>>>,
        live_at: Vec<Option<DateTime<Utc>>>,
        current_deadline: Option<DateTime<Utc>>,
        arbiter: SharedArbiter,
        log: SharedLog,
        scheduler: Arc<Scheduler>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            engine,
            seller_id,
            created_at,
            started_at,
            ended_at,
            sold_at,
            live_at,
            current_deadline,
            arbiter,
            log,
            scheduler,
            hub,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>, registry: Registry) {
        let auction_id = self.engine.auction_id;
        while let Some(command) = rx.recv().await {
            match command {
                Command::Start { reply } => {
                    let result = self.handle_start().await;
                    let _ = reply.send(result);
                }
                Command::PlaceBid {
                    user_id,
                    amount,
                    idempotency_key,
                    reply,
                } => {
                    let result = self.handle_place_bid(user_id, amount, idempotency_key).await;
                    let _ = reply.send(result);
                }
                Command::Extend { seller_id, reply } => {
                    let result = self.handle_extend(seller_id).await;
                    let _ = reply.send(result);
                }
                Command::Expire { reply } => {
                    self.handle_expire().await;
                    let _ = reply.send(());
                    if self.engine.status == AuctionStatus::Ended {
                        registry.lock().remove(&auction_id);
                    }
                }
                Command::GetState { reply } => {
                    let _ = reply.send(Ok(self.state_view()));
                }
            }
        }
    }

    async fn handle_start(&mut self) -> Result<AuctionStateView, AppError> {
        self.engine.start()?;
        let now = Utc::now();
        self.started_at = Some(now);
        let item = &self.engine.items[0];
        let item_id = item.item_id;
        let starting_price = item.starting_price;
        let duration_sec = item.duration_sec;
        self.live_at[0] = Some(now);

        self.log
            .set_auction_status(
                self.engine.auction_id,
                AuctionStatus::Live,
                AuctionStatusPatch {
                    started_at: Some(now),
                    current_item_index: Some(0),
                    ended_at: None,
                },
            )
            .await?;
        self.log
            .set_item_status(
                item_id,
                ItemStatus::Live,
                ItemStatusPatch {
                    live_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        self.arbiter
            .seed_item(self.engine.auction_id, item_id, starting_price)
            .await?;

        let deadline = self.scheduler.schedule(self.engine.auction_id, duration_sec);
        self.current_deadline = Some(deadline);

        let view = self.state_view();
        self.hub.publish_state(self.engine.auction_id, view.clone());
        Ok(view)
    }

    async fn handle_place_bid(
        &mut self,
        user_id: Uuid,
        amount: Decimal,
        idempotency_key: Option<String>,
    ) -> BidResult {
        let auction_id = self.engine.auction_id;
        let item_id = self
            .engine
            .items
            .get(self.engine.current_item_index)
            .map(|i| i.item_id);
        let Some(item_id) = item_id else {
            return BidResult::rejected(AppError::IllegalTransition("no current item").code());
        };

        let Some(key) = idempotency_key else {
            return self.run_bid_path(user_id, amount).await;
        };

        match self
            .arbiter
            .get_idempotency_result(auction_id, item_id, user_id, &key)
            .await
        {
            Ok(Some(result)) => return result,
            Ok(None) => {}
            Err(e) => return BidResult::rejected(e.code()),
        }

        match self
            .arbiter
            .claim_idempotency(auction_id, item_id, user_id, &key)
            .await
        {
            Ok(ClaimOutcome::Owned) => {}
            Ok(ClaimOutcome::AlreadyClaimed) => {
                return self.await_duplicate(auction_id, item_id, user_id, &key).await;
            }
            Err(e) => return BidResult::rejected(e.code()),
        }

        let outcome = self.run_bid_path(user_id, amount).await;
        if let Err(e) = self
            .arbiter
            .store_idempotency_result(auction_id, item_id, user_id, &key, outcome.clone())
            .await
        {
            tracing::warn!(%auction_id, %item_id, error = %e, "failed to store idempotency result");
        }
        outcome
    }

    async fn await_duplicate(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        user_id: Uuid,
        key: &str,
    ) -> BidResult {
        for _ in 0..DUPLICATE_POLL_ATTEMPTS {
            match self
                .arbiter
                .get_idempotency_result(auction_id, item_id, user_id, key)
                .await
            {
                Ok(Some(result)) => return result,
                Ok(None) => tokio::time::sleep(DUPLICATE_POLL_INTERVAL).await,
                Err(e) => return BidResult::rejected(e.code()),
            }
        }
        BidResult::rejected(AppError::DuplicateInFlight.code())
    }

    /// Engine mutates first (advisory), the Arbiter's CAS is
    /// authoritative. A CAS rejection or error rolls the engine back to
    /// its pre-bid snapshot so the two views cannot diverge.
    async fn run_bid_path(&mut self, user_id: Uuid, amount: Decimal) -> BidResult {
        let auction_id = self.engine.auction_id;
        let before = self.engine.clone();

        if let Err(e) = self.engine.place_bid(user_id, amount) {
            return BidResult::rejected(e.code());
        }
        let item_id = self.engine.items[self.engine.current_item_index].item_id;

        match self.arbiter.bid_cas(auction_id, item_id, amount, user_id).await {
            Ok(CasOutcome::Accepted) => {
                if let Err(e) = self.log.append_bid(auction_id, item_id, user_id, amount).await {
                    tracing::error!(%auction_id, %item_id, error = %e, "bid accepted but failed to persist; continuing");
                }
                let view = self.state_view();
                self.hub.publish_state(auction_id, view);
                BidResult::accepted()
            }
            Ok(CasOutcome::Rejected) => {
                self.engine = before;
                BidResult::rejected(AppError::OutpacedByAnother.code())
            }
            Err(e) => {
                self.engine = before;
                BidResult::rejected(e.code())
            }
        }
    }

    async fn handle_extend(&mut self, seller_id: Uuid) -> Result<AuctionStateView, AppError> {
        if seller_id != self.seller_id {
            return Err(AppError::PermissionDenied);
        }
        self.engine.extend_current_item()?;
        let auction_id = self.engine.auction_id;
        let item = &self.engine.items[self.engine.current_item_index];
        let item_id = item.item_id;
        let extra_duration_sec = item.extra_duration_sec;

        self.log
            .set_item_status(
                item_id,
                ItemStatus::Live,
                ItemStatusPatch {
                    extended: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(new_deadline) = self.scheduler.extend(auction_id, extra_duration_sec) {
            self.current_deadline = Some(new_deadline);
        }

        let view = self.state_view();
        self.hub.publish_state(auction_id, view.clone());
        Ok(view)
    }

    async fn handle_expire(&mut self) {
        if self.engine.status != AuctionStatus::Live {
            return;
        }
        let auction_id = self.engine.auction_id;
        let closing_index = self.engine.current_item_index;

        let outcome = match self.engine.end_current_item() {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(%auction_id, error = %e, "failed to end current item on expiry");
                return;
            }
        };
        let now = Utc::now();
        if let Some(slot) = self.sold_at.get_mut(closing_index) {
            *slot = Some(now);
        }

        if let Err(e) = self
            .log
            .finalize_item(outcome.item_id, outcome.winner_id, outcome.final_price)
            .await
        {
            tracing::error!(%auction_id, item_id = %outcome.item_id, error = %e, "failed to persist item finalization");
        }
        if let Err(e) = self.arbiter.clear_item(auction_id, outcome.item_id).await {
            tracing::warn!(%auction_id, item_id = %outcome.item_id, error = %e, "failed to clear arbiter state for closed item");
        }
        self.hub.publish_item_sold(
            auction_id,
            ItemSoldEvent {
                item_id: outcome.item_id,
                winner_id: outcome.winner_id,
                final_price: outcome.final_price,
            },
        );

        match self.engine.advance_to_next_item() {
            Ok(AdvanceOutcome::NextItemLive { item_id: next_item_id }) => {
                let next_index = self.engine.current_item_index;
                let next_now = Utc::now();
                if let Some(slot) = self.live_at.get_mut(next_index) {
                    *slot = Some(next_now);
                }
                let next_item = &self.engine.items[next_index];
                let starting_price = next_item.starting_price;
                let duration_sec = next_item.duration_sec;

                if let Err(e) = self
                    .log
                    .set_auction_status(
                        auction_id,
                        AuctionStatus::Live,
                        AuctionStatusPatch {
                            current_item_index: Some(next_index as i32),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    tracing::error!(%auction_id, error = %e, "failed to persist current_item_index advance");
                }
                if let Err(e) = self
                    .log
                    .set_item_status(
                        next_item_id,
                        ItemStatus::Live,
                        ItemStatusPatch {
                            live_at: Some(next_now),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    tracing::error!(%auction_id, item_id = %next_item_id, error = %e, "failed to persist next item going live");
                }
                if let Err(e) = self.arbiter.seed_item(auction_id, next_item_id, starting_price).await {
                    tracing::error!(%auction_id, item_id = %next_item_id, error = %e, "failed to seed arbiter for next item");
                }

                let deadline = self.scheduler.schedule(auction_id, duration_sec);
                self.current_deadline = Some(deadline);

                let view = self.state_view();
                self.hub.publish_state(auction_id, view);
            }
            Ok(AdvanceOutcome::AuctionEnded) => {
                let results = self.engine.end_auction();
                self.ended_at = Some(now);

                if let Err(e) = self.log.finalize_auction(auction_id, &results).await {
                    tracing::error!(%auction_id, error = %e, "failed to persist auction finalization");
                }
                let item_ids: Vec<Uuid> = self.engine.items.iter().map(|i| i.item_id).collect();
                if let Err(e) = self.arbiter.clear_auction(auction_id, &item_ids).await {
                    tracing::warn!(%auction_id, error = %e, "failed to clear arbiter state for ended auction");
                }
                self.scheduler.cancel(auction_id);
                self.current_deadline = None;

                self.hub.publish_auction_ended(
                    auction_id,
                    AuctionEndedEvent {
                        auction_id,
                        results: results
                            .into_iter()
                            .map(|r| AuctionItemResultEntry {
                                item_id: r.item_id,
                                winner_id: r.winner_id,
                                final_price: r.final_price,
                            })
                            .collect(),
                    },
                );
            }
            Err(e) => {
                tracing::error!(%auction_id, error = %e, "failed to advance to next item after expiry");
            }
        }
    }

    fn state_view(&self) -> AuctionStateView {
        let auction_id = self.engine.auction_id;
        let items = self
            .engine
            .items
            .iter()
            .enumerate()
            .map(|(idx, item)| AuctionItem {
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
                live_at: self.live_at.get(idx).copied().flatten(),
                sold_at: self.sold_at.get(idx).copied().flatten(),
            })
            .collect();

        AuctionStateView {
            auction_id,
            seller_id: self.seller_id,
            status: self.engine.status,
            current_item_index: self.engine.current_item_index as i32,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            items,
            item_end_time: self.current_deadline.map(epoch_millis),
        }
    }
}
