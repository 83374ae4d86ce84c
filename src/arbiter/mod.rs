//! Arbiter (C2)
//!
//! The single source of truth for "which concurrent bid won the race."
//! Exposed as a trait so a Redis-backed implementation (production)
//! and an in-memory implementation (tests, single-process default) are
//! interchangeable from the Coordinator's point of view.

pub mod redis_arbiter;

use crate::error::AppError;
use crate::models::BidResult;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub use redis_arbiter::RedisArbiter;

/// Outcome of the atomic bid check-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Accepted,
    Rejected,
}

/// Whether a caller owns the idempotency claim it just attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Owned,
    AlreadyClaimed,
}

const IDEMPOTENCY_CLAIM_TTL: Duration = Duration::from_secs(30);
const IDEMPOTENCY_RESULT_TTL: Duration = Duration::from_secs(600);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArbiterClient: Send + Sync {
    /// Seed `highest_bid := starting_price` and clear `highest_bidder`
    /// when an item goes LIVE.
    async fn seed_item(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        starting_price: Decimal,
    ) -> Result<(), AppError>;

    /// Re-seed `highest_bid`/`highest_bidder` to an arbitrary known-good
    /// pair rather than the starting price. Used on crash recovery,
    /// where the item has already taken bids and the CAS in `bid_cas`
    /// can never succeed against a value it would just be re-asserting.
    async fn seed_item_with_bidder(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        highest_bid: Decimal,
        highest_bidder_id: Option<Uuid>,
    ) -> Result<(), AppError>;

    /// Atomic compare-and-set: accept `new_amount` iff it strictly
    /// exceeds the current highest bid for this item. Ties lose —
    /// first arrival at the arbiter wins.
    async fn bid_cas(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        new_amount: Decimal,
        bidder_id: Uuid,
    ) -> Result<CasOutcome, AppError>;

    /// Delete the keys for one item (on item close).
    async fn clear_item(&self, auction_id: Uuid, item_id: Uuid) -> Result<(), AppError>;

    /// Bulk-delete every key for an auction's items (on auction end).
    async fn clear_auction(&self, auction_id: Uuid, item_ids: &[Uuid]) -> Result<(), AppError>;

    /// Attempt to claim the idempotency marker for this key. Returns
    /// `Owned` iff this caller set the PENDING marker.
    async fn claim_idempotency(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        bidder_id: Uuid,
        key: &str,
    ) -> Result<ClaimOutcome, AppError>;

    /// Read a previously stored outcome, if any.
    async fn get_idempotency_result(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        bidder_id: Uuid,
        key: &str,
    ) -> Result<Option<BidResult>, AppError>;

    /// Atomically record the outcome and clear the PENDING marker.
    async fn store_idempotency_result(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        bidder_id: Uuid,
        key: &str,
        outcome: BidResult,
    ) -> Result<(), AppError>;
}

/// Shared pointer type used throughout the Coordinator.
pub type SharedArbiter = std::sync::Arc<dyn ArbiterClient>;

#[derive(Debug, Clone)]
struct ItemState {
    highest_bid: Decimal,
    highest_bidder: Option<Uuid>,
}

#[derive(Debug, Clone)]
enum IdemEntry {
    Pending { expires_at: Instant },
    Result { outcome: BidResult, expires_at: Instant },
}

/// An in-memory `ArbiterClient`: a `Mutex`-guarded map, used by tests
/// and as the default single-process arbiter when no `arbiter_url` is
/// configured.
#[derive(Default)]
pub struct InMemoryArbiter {
    items: Mutex<HashMap<(Uuid, Uuid), ItemState>>,
    idempotency: Mutex<HashMap<(Uuid, Uuid, Uuid, String), IdemEntry>>,
}

impl InMemoryArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> SharedArbiter {
        std::sync::Arc::new(Self::new())
    }
}

#[async_trait]
impl ArbiterClient for InMemoryArbiter {
    async fn seed_item(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        starting_price: Decimal,
    ) -> Result<(), AppError> {
        self.items.lock().insert(
            (auction_id, item_id),
            ItemState {
                highest_bid: starting_price,
                highest_bidder: None,
            },
        );
        Ok(())
    }

    async fn seed_item_with_bidder(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        highest_bid: Decimal,
        highest_bidder_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        self.items.lock().insert(
            (auction_id, item_id),
            ItemState {
                highest_bid,
                highest_bidder: highest_bidder_id,
            },
        );
        Ok(())
    }

    async fn bid_cas(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        new_amount: Decimal,
        bidder_id: Uuid,
    ) -> Result<CasOutcome, AppError> {
        let mut items = self.items.lock();
        let entry = items.entry((auction_id, item_id)).or_insert(ItemState {
            highest_bid: Decimal::ZERO,
            highest_bidder: None,
        });
        if new_amount > entry.highest_bid {
            entry.highest_bid = new_amount;
            entry.highest_bidder = Some(bidder_id);
            Ok(CasOutcome::Accepted)
        } else {
            Ok(CasOutcome::Rejected)
        }
    }

    async fn clear_item(&self, auction_id: Uuid, item_id: Uuid) -> Result<(), AppError> {
        self.items.lock().remove(&(auction_id, item_id));
        Ok(())
    }

    async fn clear_auction(&self, auction_id: Uuid, item_ids: &[Uuid]) -> Result<(), AppError> {
        let mut items = self.items.lock();
        for item_id in item_ids {
            items.remove(&(auction_id, *item_id));
        }
        Ok(())
    }

    async fn claim_idempotency(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        bidder_id: Uuid,
        key: &str,
    ) -> Result<ClaimOutcome, AppError> {
        let mut table = self.idempotency.lock();
        let map_key = (auction_id, item_id, bidder_id, key.to_owned());
        let now = Instant::now();
        let expired = matches!(table.get(&map_key), Some(entry) if entry_expired(entry, now));
        if expired {
            table.remove(&map_key);
        }
        if table.contains_key(&map_key) {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        table.insert(
            map_key,
            IdemEntry::Pending {
                expires_at: now + IDEMPOTENCY_CLAIM_TTL,
            },
        );
        Ok(ClaimOutcome::Owned)
    }

    async fn get_idempotency_result(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        bidder_id: Uuid,
        key: &str,
    ) -> Result<Option<BidResult>, AppError> {
        let table = self.idempotency.lock();
        let map_key = (auction_id, item_id, bidder_id, key.to_owned());
        Ok(match table.get(&map_key) {
            Some(IdemEntry::Result { outcome, expires_at }) if *expires_at > Instant::now() => {
                Some(outcome.clone())
            }
            _ => None,
        })
    }

    async fn store_idempotency_result(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        bidder_id: Uuid,
        key: &str,
        outcome: BidResult,
    ) -> Result<(), AppError> {
        let mut table = self.idempotency.lock();
        let map_key = (auction_id, item_id, bidder_id, key.to_owned());
        table.insert(
            map_key,
            IdemEntry::Result {
                outcome,
                expires_at: Instant::now() + IDEMPOTENCY_RESULT_TTL,
            },
        );
        Ok(())
    }
}

fn entry_expired(entry: &IdemEntry, now: Instant) -> bool {
    match entry {
        IdemEntry::Pending { expires_at } | IdemEntry::Result { expires_at, .. } => {
            *expires_at <= now
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn cas_rejects_equal_and_lower_amounts() {
        let arbiter = InMemoryArbiter::new();
        let auction_id = Uuid::new_v4();
        let item_id = Uuid::new_v4();
        arbiter
            .seed_item(auction_id, item_id, dec!(100))
            .await
            .unwrap();

        let bidder_a = Uuid::new_v4();
        let bidder_b = Uuid::new_v4();

        assert_eq!(
            arbiter
                .bid_cas(auction_id, item_id, dec!(100), bidder_a)
                .await
                .unwrap(),
            CasOutcome::Rejected
        );
        assert_eq!(
            arbiter
                .bid_cas(auction_id, item_id, dec!(130), bidder_a)
                .await
                .unwrap(),
            CasOutcome::Accepted
        );
        assert_eq!(
            arbiter
                .bid_cas(auction_id, item_id, dec!(130), bidder_b)
                .await
                .unwrap(),
            CasOutcome::Rejected
        );
        assert_eq!(
            arbiter
                .bid_cas(auction_id, item_id, dec!(131), bidder_b)
                .await
                .unwrap(),
            CasOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn idempotency_claim_is_single_owner() {
        let arbiter = InMemoryArbiter::new();
        let auction_id = Uuid::new_v4();
        let item_id = Uuid::new_v4();
        let bidder = Uuid::new_v4();

        assert_eq!(
            arbiter
                .claim_idempotency(auction_id, item_id, bidder, "k1")
                .await
                .unwrap(),
            ClaimOutcome::Owned
        );
        assert_eq!(
            arbiter
                .claim_idempotency(auction_id, item_id, bidder, "k1")
                .await
                .unwrap(),
            ClaimOutcome::AlreadyClaimed
        );

        arbiter
            .store_idempotency_result(auction_id, item_id, bidder, "k1", BidResult::accepted())
            .await
            .unwrap();

        let stored = arbiter
            .get_idempotency_result(auction_id, item_id, bidder, "k1")
            .await
            .unwrap();
        assert_eq!(stored, Some(BidResult::accepted()));
    }
}
