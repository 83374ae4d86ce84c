//! Durable Log (C3)
//!
//! Write-through relational store: the Coordinator writes here after
//! the Arbiter accepts. Multi-row mutations (`append_bid`,
//! `finalize_item`, `finalize_auction`, `append_auction`) are each one
//! atomic database transaction.

pub mod postgres_log;

use crate::engine::AuctionResultRow;
use crate::error::AppError;
use crate::models::{Auction, AuctionItem, AuctionStatus, AuctionSummary, Bid, ItemResult, ItemStatus, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use parking_lot::Mutex;
use uuid::Uuid;

pub use postgres_log::PostgresLog;

/// An auction with its items, as returned by `load_active`/`load_one`.
#[derive(Debug, Clone)]
pub struct AuctionRecord {
    pub auction: Auction,
    pub items: Vec<AuctionItem>,
}

#[derive(Debug, Clone, Default)]
pub struct AuctionStatusPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_item_index: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct ItemStatusPatch {
    pub highest_bid: Option<Decimal>,
    pub highest_bidder_id: Option<Option<Uuid>>,
    pub extended: Option<bool>,
    pub live_at: Option<DateTime<Utc>>,
    pub sold_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Atomically creates the auction and all its items in their
    /// initial CREATED/PENDING form.
    async fn append_auction(&self, auction: &Auction, items: &[AuctionItem]) -> Result<(), AppError>;

    async fn set_auction_status(
        &self,
        auction_id: Uuid,
        status: AuctionStatus,
        patch: AuctionStatusPatch,
    ) -> Result<(), AppError>;

    async fn set_item_status(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        patch: ItemStatusPatch,
    ) -> Result<(), AppError>;

    /// Appends a bid row AND updates the item's `(highestBid,
    /// highestBidderId)` as a single atomic unit.
    async fn append_bid(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        bidder_id: Uuid,
        amount: Decimal,
    ) -> Result<Bid, AppError>;

    /// Updates the item to SOLD/UNSOLD and creates an `ItemResult` iff
    /// there is a winner, atomically.
    async fn finalize_item(
        &self,
        item_id: Uuid,
        winner_id: Option<Uuid>,
        final_price: Decimal,
    ) -> Result<(), AppError>;

    /// Status→ENDED + `endedAt`, upserts `ItemResult` for each winning
    /// row, atomically.
    async fn finalize_auction(
        &self,
        auction_id: Uuid,
        results: &[AuctionResultRow],
    ) -> Result<(), AppError>;

    /// All auctions whose status is not ENDED, items ordered by
    /// `itemOrder`.
    async fn load_active(&self) -> Result<Vec<AuctionRecord>, AppError>;

    /// The full auction view for historical reads.
    async fn load_one(&self, auction_id: Uuid) -> Result<Option<AuctionRecord>, AppError>;

    async fn list_summaries(&self, seller_id: Option<Uuid>) -> Result<Vec<AuctionSummary>, AppError>;

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError>;

    /// Upsert a `User` row on first sight of an external identity.
    async fn upsert_user(&self, user_id: Uuid, display_name: &str) -> Result<User, AppError>;

    async fn bids_for_item(&self, item_id: Uuid) -> Result<Vec<Bid>, AppError>;

    async fn item_result(&self, item_id: Uuid) -> Result<Option<ItemResult>, AppError>;
}

pub type SharedLog = std::sync::Arc<dyn DurableLog>;

#[derive(Default)]
struct InMemoryLogState {
    users: HashMap<Uuid, User>,
    auctions: HashMap<Uuid, Auction>,
    items: HashMap<Uuid, AuctionItem>,
    items_by_auction: HashMap<Uuid, Vec<Uuid>>,
    bids: HashMap<Uuid, Vec<Bid>>,
    results: HashMap<Uuid, ItemResult>,
}

/// An in-memory `DurableLog`, used by tests and by deployments that
/// accept losing history across a restart in exchange for not running
/// Postgres (the Coordinator's recovery path still exercises the same
/// `load_active` contract against it).
#[derive(Default)]
pub struct InMemoryLog {
    state: Mutex<InMemoryLogState>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> SharedLog {
        std::sync::Arc::new(Self::new())
    }

    /// Test/bootstrap convenience: seed a user directly.
    pub fn seed_user(&self, user: User) {
        self.state.lock().users.insert(user.user_id, user);
    }
}

#[async_trait]
impl DurableLog for InMemoryLog {
    async fn append_auction(&self, auction: &Auction, items: &[AuctionItem]) -> Result<(), AppError> {
        let mut state = self.state.lock();
        state.auctions.insert(auction.auction_id, auction.clone());
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(item.item_id);
            state.items.insert(item.item_id, item.clone());
        }
        state.items_by_auction.insert(auction.auction_id, ids);
        Ok(())
    }

    async fn set_auction_status(
        &self,
        auction_id: Uuid,
        status: AuctionStatus,
        patch: AuctionStatusPatch,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock();
        let auction = state
            .auctions
            .get_mut(&auction_id)
            .ok_or_else(|| AppError::unknown_auction(auction_id))?;
        auction.status = status;
        if let Some(started_at) = patch.started_at {
            auction.started_at = Some(started_at);
        }
        if let Some(ended_at) = patch.ended_at {
            auction.ended_at = Some(ended_at);
        }
        if let Some(idx) = patch.current_item_index {
            auction.current_item_index = idx;
        }
        Ok(())
    }

    async fn set_item_status(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        patch: ItemStatusPatch,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock();
        let item = state
            .items
            .get_mut(&item_id)
            .ok_or_else(|| AppError::NotFound(format!("item {item_id}")))?;
        item.status = status;
        if let Some(highest_bid) = patch.highest_bid {
            item.highest_bid = highest_bid;
        }
        if let Some(highest_bidder_id) = patch.highest_bidder_id {
            item.highest_bidder_id = highest_bidder_id;
        }
        if let Some(extended) = patch.extended {
            item.extended = extended;
        }
        if let Some(live_at) = patch.live_at {
            item.live_at = Some(live_at);
        }
        if let Some(sold_at) = patch.sold_at {
            item.sold_at = Some(sold_at);
        }
        Ok(())
    }

    async fn append_bid(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        bidder_id: Uuid,
        amount: Decimal,
    ) -> Result<Bid, AppError> {
        let mut state = self.state.lock();
        let item = state
            .items
            .get_mut(&item_id)
            .ok_or_else(|| AppError::NotFound(format!("item {item_id}")))?;
        item.highest_bid = amount;
        item.highest_bidder_id = Some(bidder_id);
        let bid = Bid {
            bid_id: Uuid::new_v4(),
            auction_id,
            item_id,
            bidder_id,
            amount,
            created_at: Utc::now(),
        };
        state.bids.entry(item_id).or_default().push(bid.clone());
        Ok(bid)
    }

    async fn finalize_item(
        &self,
        item_id: Uuid,
        winner_id: Option<Uuid>,
        final_price: Decimal,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock();
        let now = Utc::now();
        {
            let item = state
                .items
                .get_mut(&item_id)
                .ok_or_else(|| AppError::NotFound(format!("item {item_id}")))?;
            item.status = if winner_id.is_some() {
                ItemStatus::Sold
            } else {
                ItemStatus::Unsold
            };
            item.sold_at = Some(now);
        }
        if let Some(winner_id) = winner_id {
            state.results.insert(
                item_id,
                ItemResult {
                    item_id,
                    winner_id,
                    final_price,
                    sold_at: now,
                },
            );
        }
        Ok(())
    }

    async fn finalize_auction(
        &self,
        auction_id: Uuid,
        results: &[AuctionResultRow],
    ) -> Result<(), AppError> {
        let mut state = self.state.lock();
        let now = Utc::now();
        {
            let auction = state
                .auctions
                .get_mut(&auction_id)
                .ok_or_else(|| AppError::unknown_auction(auction_id))?;
            auction.status = AuctionStatus::Ended;
            auction.ended_at = Some(now);
        }
        for row in results {
            if let Some(winner_id) = row.winner_id {
                state.results.insert(
                    row.item_id,
                    ItemResult {
                        item_id: row.item_id,
                        winner_id,
                        final_price: row.final_price,
                        sold_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn load_active(&self) -> Result<Vec<AuctionRecord>, AppError> {
        let state = self.state.lock();
        let mut records = Vec::new();
        for auction in state.auctions.values() {
            if auction.status == AuctionStatus::Ended {
                continue;
            }
            let mut items: Vec<AuctionItem> = state
                .items_by_auction
                .get(&auction.auction_id)
                .into_iter()
                .flatten()
                .filter_map(|id| state.items.get(id).cloned())
                .collect();
            items.sort_by_key(|i| i.item_order);
            records.push(AuctionRecord {
                auction: auction.clone(),
                items,
            });
        }
        Ok(records)
    }

    async fn load_one(&self, auction_id: Uuid) -> Result<Option<AuctionRecord>, AppError> {
        let state = self.state.lock();
        let Some(auction) = state.auctions.get(&auction_id) else {
            return Ok(None);
        };
        let mut items: Vec<AuctionItem> = state
            .items_by_auction
            .get(&auction_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.items.get(id).cloned())
            .collect();
        items.sort_by_key(|i| i.item_order);
        Ok(Some(AuctionRecord {
            auction: auction.clone(),
            items,
        }))
    }

    async fn list_summaries(&self, seller_id: Option<Uuid>) -> Result<Vec<AuctionSummary>, AppError> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for auction in state.auctions.values() {
            if let Some(filter) = seller_id {
                if auction.seller_id != filter {
                    continue;
                }
            }
            let mut items: Vec<&AuctionItem> = state
                .items_by_auction
                .get(&auction.auction_id)
                .into_iter()
                .flatten()
                .filter_map(|id| state.items.get(id))
                .collect();
            items.sort_by_key(|i| i.item_order);
            let first_item_name = items.first().map(|i| i.name.clone()).unwrap_or_default();
            let seller_name = state
                .users
                .get(&auction.seller_id)
                .map(|u| u.display_name.clone())
                .unwrap_or_default();
            out.push(AuctionSummary {
                auction_id: auction.auction_id,
                seller_id: auction.seller_id,
                status: auction.status,
                seller_name,
                first_item_name,
                item_count: items.len() as i64,
                created_at: auction.created_at,
            });
        }
        out.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(out)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        Ok(self.state.lock().users.get(&user_id).cloned())
    }

    async fn upsert_user(&self, user_id: Uuid, display_name: &str) -> Result<User, AppError> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let user = state
            .users
            .entry(user_id)
            .and_modify(|u| {
                u.display_name = display_name.to_owned();
                u.updated_at = now;
            })
            .or_insert_with(|| User {
                user_id,
                display_name: display_name.to_owned(),
                created_at: now,
                updated_at: now,
            });
        Ok(user.clone())
    }

    async fn bids_for_item(&self, item_id: Uuid) -> Result<Vec<Bid>, AppError> {
        let state = self.state.lock();
        let mut bids = state.bids.get(&item_id).cloned().unwrap_or_default();
        bids.sort_by_key(|b| std::cmp::Reverse(b.created_at));
        Ok(bids)
    }

    async fn item_result(&self, item_id: Uuid) -> Result<Option<ItemResult>, AppError> {
        Ok(self.state.lock().results.get(&item_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_auction(seller_id: Uuid) -> (Auction, Vec<AuctionItem>) {
        let auction_id = Uuid::new_v4();
        let now = Utc::now();
        let auction = Auction {
            auction_id,
            seller_id,
            status: AuctionStatus::Created,
            current_item_index: 0,
            max_duration_sec: 60,
            created_at: now,
            started_at: None,
            ended_at: None,
        };
        let item = AuctionItem {
            item_id: Uuid::new_v4(),
            auction_id,
            item_order: 0,
            name: "Lamp".into(),
            starting_price: dec!(10),
            duration_sec: 60,
            extra_duration_sec: 0,
            status: ItemStatus::Pending,
            highest_bid: dec!(10),
            extended: false,
            highest_bidder_id: None,
            live_at: None,
            sold_at: None,
        };
        (auction, vec![item])
    }

    #[tokio::test]
    async fn append_bid_is_amount_monotone_and_visible_in_history() {
        let log = InMemoryLog::new();
        let seller = Uuid::new_v4();
        let (auction, items) = sample_auction(seller);
        log.append_auction(&auction, &items).await.unwrap();
        let item_id = items[0].item_id;

        let bidder = Uuid::new_v4();
        log.append_bid(auction.auction_id, item_id, bidder, dec!(15))
            .await
            .unwrap();
        log.append_bid(auction.auction_id, item_id, bidder, dec!(20))
            .await
            .unwrap();

        let bids = log.bids_for_item(item_id).await.unwrap();
        assert_eq!(bids.len(), 2);
        assert!(bids[0].amount > bids[1].amount, "newest-first ordering");
    }

    #[tokio::test]
    async fn finalize_item_creates_result_only_for_winners() {
        let log = InMemoryLog::new();
        let seller = Uuid::new_v4();
        let (auction, items) = sample_auction(seller);
        log.append_auction(&auction, &items).await.unwrap();
        let item_id = items[0].item_id;

        log.finalize_item(item_id, None, dec!(10)).await.unwrap();
        assert!(log.item_result(item_id).await.unwrap().is_none());

        let winner = Uuid::new_v4();
        log.finalize_item(item_id, Some(winner), dec!(25))
            .await
            .unwrap();
        let result = log.item_result(item_id).await.unwrap().unwrap();
        assert_eq!(result.winner_id, winner);
    }

    #[tokio::test]
    async fn load_active_excludes_ended_auctions() {
        let log = InMemoryLog::new();
        let seller = Uuid::new_v4();
        let (auction, items) = sample_auction(seller);
        log.append_auction(&auction, &items).await.unwrap();

        assert_eq!(log.load_active().await.unwrap().len(), 1);

        log.finalize_auction(auction.auction_id, &[]).await.unwrap();
        assert_eq!(log.load_active().await.unwrap().len(), 0);
        assert!(log.load_one(auction.auction_id).await.unwrap().is_some());
    }
}
