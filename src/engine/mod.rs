//! Engine (C1)
//!
//! The pure, deterministic per-auction state machine. No I/O, no
//! clocks, no logging: given the same initial state and the same
//! sequence of calls it produces identical state. Errors returned here
//! are advisory — the Coordinator may see the same error surface from
//! the Arbiter with authoritative semantics (see `crate::coordinator`).

use crate::error::AppError;
use crate::models::{AuctionStatus, ItemStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One lot as tracked by the engine. A strict subset of
/// `crate::models::AuctionItem` — no timestamps, those are a
/// Coordinator/Log concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineItem {
    pub item_id: Uuid,
    pub item_order: i32,
    pub name: String,
    pub starting_price: Decimal,
    pub duration_sec: i32,
    pub extra_duration_sec: i32,
    pub status: ItemStatus,
    pub highest_bid: Decimal,
    pub extended: bool,
    pub highest_bidder_id: Option<Uuid>,
}

/// Input to `EngineState::create` for one item.
#[derive(Debug, Clone)]
pub struct NewItemSpec {
    pub item_id: Uuid,
    pub item_order: i32,
    pub name: String,
    pub starting_price: Decimal,
    pub duration_sec: i32,
    pub extra_duration_sec: i32,
}

/// The full in-memory state of one auction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub auction_id: Uuid,
    pub seller_id: Uuid,
    pub status: AuctionStatus,
    pub current_item_index: usize,
    pub items: Vec<EngineItem>,
}

/// Outcome of `end_current_item`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndItemOutcome {
    pub item_id: Uuid,
    pub winner_id: Option<Uuid>,
    pub final_price: Decimal,
    pub had_bids: bool,
}

/// Outcome of `advance_to_next_item`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    NextItemLive { item_id: Uuid },
    AuctionEnded,
}

/// One row of `end_auction`'s summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuctionResultRow {
    pub item_id: Uuid,
    pub winner_id: Option<Uuid>,
    pub final_price: Decimal,
}

impl EngineState {
    /// `create(auctionId, sellerId, items[])` — initial state with
    /// status=CREATED, each item PENDING, `highestBid = startingPrice`,
    /// `currentItemIndex = 0`.
    pub fn create(auction_id: Uuid, seller_id: Uuid, items: Vec<NewItemSpec>) -> Self {
        let items = items
            .into_iter()
            .map(|spec| EngineItem {
                item_id: spec.item_id,
                item_order: spec.item_order,
                name: spec.name,
                starting_price: spec.starting_price,
                duration_sec: spec.duration_sec,
                extra_duration_sec: spec.extra_duration_sec,
                status: ItemStatus::Pending,
                highest_bid: spec.starting_price,
                extended: false,
                highest_bidder_id: None,
            })
            .collect();

        Self {
            auction_id,
            seller_id,
            status: AuctionStatus::Created,
            current_item_index: 0,
            items,
        }
    }

    fn current_item(&self) -> Option<&EngineItem> {
        self.items.get(self.current_item_index)
    }

    fn current_item_mut(&mut self) -> Option<&mut EngineItem> {
        self.items.get_mut(self.current_item_index)
    }

    /// `start()` — fails with `IllegalTransition` unless
    /// status=CREATED and `items` non-empty; transitions status→LIVE,
    /// first item→LIVE.
    pub fn start(&mut self) -> Result<(), AppError> {
        if self.status != AuctionStatus::Created {
            return Err(AppError::IllegalTransition("auction is not CREATED"));
        }
        if self.items.is_empty() {
            return Err(AppError::IllegalTransition("auction has no items"));
        }
        self.status = AuctionStatus::Live;
        self.items[0].status = ItemStatus::Live;
        Ok(())
    }

    /// `placeBid(userId, amount)` — admissibility check only. Fails
    /// with `NotLive`/`NoLiveItem`/`BidTooLow`; otherwise updates
    /// `(highestBid, highestBidderId)` of the current item.
    pub fn place_bid(&mut self, user_id: Uuid, amount: Decimal) -> Result<(), AppError> {
        if self.status != AuctionStatus::Live {
            return Err(AppError::IllegalTransition("auction is not LIVE"));
        }
        let current_bid = {
            let item = self
                .current_item()
                .ok_or(AppError::IllegalTransition("no current item"))?;
            if item.status != ItemStatus::Live {
                return Err(AppError::IllegalTransition("current item is not LIVE"));
            }
            item.highest_bid
        };
        if amount <= current_bid {
            return Err(AppError::BidTooLow);
        }
        let item = self.current_item_mut().expect("checked above");
        item.highest_bid = amount;
        item.highest_bidder_id = Some(user_id);
        Ok(())
    }

    /// Mirror an arbiter-accepted amount into engine state without
    /// re-running the admissibility check (the arbiter's view already
    /// won the race; see `crate::coordinator`).
    pub fn commit_bid(&mut self, user_id: Uuid, amount: Decimal) -> Result<(), AppError> {
        let item = self
            .current_item_mut()
            .ok_or(AppError::IllegalTransition("no current item"))?;
        item.highest_bid = amount;
        item.highest_bidder_id = Some(user_id);
        Ok(())
    }

    /// `endCurrentItem()` — transitions the item to SOLD when it has a
    /// bid above `startingPrice`, else UNSOLD.
    pub fn end_current_item(&mut self) -> Result<EndItemOutcome, AppError> {
        if self.status != AuctionStatus::Live {
            return Err(AppError::IllegalTransition("auction is not LIVE"));
        }
        let idx = self.current_item_index;
        let item = self
            .items
            .get_mut(idx)
            .ok_or(AppError::IllegalTransition("no current item"))?;
        if item.status != ItemStatus::Live {
            return Err(AppError::IllegalTransition("current item is not LIVE"));
        }

        let had_bids = item.highest_bidder_id.is_some() && item.highest_bid > item.starting_price;
        if had_bids {
            item.status = ItemStatus::Sold;
        } else {
            item.status = ItemStatus::Unsold;
        }

        Ok(EndItemOutcome {
            item_id: item.item_id,
            winner_id: if had_bids { item.highest_bidder_id } else { None },
            final_price: item.highest_bid,
            had_bids,
        })
    }

    /// `advanceToNextItem()` — arms the next item or ends the auction.
    pub fn advance_to_next_item(&mut self) -> Result<AdvanceOutcome, AppError> {
        let next_index = self.current_item_index + 1;
        if let Some(next_item) = self.items.get_mut(next_index) {
            next_item.status = ItemStatus::Live;
            next_item.highest_bid = next_item.starting_price;
            self.current_item_index = next_index;
            Ok(AdvanceOutcome::NextItemLive {
                item_id: next_item.item_id,
            })
        } else {
            self.status = AuctionStatus::Ended;
            Ok(AdvanceOutcome::AuctionEnded)
        }
    }

    /// `extendCurrentItem()` — fails unless the auction and current
    /// item are LIVE and the item has not already been extended.
    pub fn extend_current_item(&mut self) -> Result<(), AppError> {
        if self.status != AuctionStatus::Live {
            return Err(AppError::IllegalTransition("auction is not LIVE"));
        }
        let item = self
            .current_item_mut()
            .ok_or(AppError::IllegalTransition("no current item"))?;
        if item.status != ItemStatus::Live {
            return Err(AppError::IllegalTransition("current item is not LIVE"));
        }
        if item.extended {
            return Err(AppError::IllegalTransition("item already extended"));
        }
        item.extended = true;
        Ok(())
    }

    /// `endAuction()` — idempotent: forces status→ENDED and returns a
    /// summary with a winner per SOLD item.
    pub fn end_auction(&mut self) -> Vec<AuctionResultRow> {
        self.status = AuctionStatus::Ended;
        self.items
            .iter()
            .map(|item| AuctionResultRow {
                item_id: item.item_id,
                winner_id: if item.status == ItemStatus::Sold {
                    item.highest_bidder_id
                } else {
                    None
                },
                final_price: item.highest_bid,
            })
            .collect()
    }

    /// Deep-copy out for persistence.
    pub fn snapshot(&self) -> EngineState {
        self.clone()
    }

    /// Deep-copy in from persistence.
    pub fn restore(state: EngineState) -> Self {
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn two_item_auction() -> EngineState {
        let seller = Uuid::new_v4();
        EngineState::create(
            Uuid::new_v4(),
            seller,
            vec![
                NewItemSpec {
                    item_id: Uuid::new_v4(),
                    item_order: 0,
                    name: "A".into(),
                    starting_price: dec!(100),
                    duration_sec: 60,
                    extra_duration_sec: 15,
                },
                NewItemSpec {
                    item_id: Uuid::new_v4(),
                    item_order: 1,
                    name: "B".into(),
                    starting_price: dec!(50),
                    duration_sec: 60,
                    extra_duration_sec: 0,
                },
            ],
        )
    }

    #[test]
    fn start_requires_created_and_nonempty() {
        let mut empty = EngineState::create(Uuid::new_v4(), Uuid::new_v4(), vec![]);
        assert_eq!(
            empty.start(),
            Err(AppError::IllegalTransition("auction has no items"))
        );

        let mut a = two_item_auction();
        a.start().unwrap();
        assert_eq!(a.status, AuctionStatus::Live);
        assert_eq!(a.items[0].status, ItemStatus::Live);
        assert_eq!(
            a.start(),
            Err(AppError::IllegalTransition("auction is not CREATED"))
        );
    }

    #[test]
    fn place_bid_rejects_too_low_and_not_live() {
        let mut a = two_item_auction();
        let bidder = Uuid::new_v4();
        assert_eq!(
            a.place_bid(bidder, dec!(150)),
            Err(AppError::IllegalTransition("auction is not LIVE"))
        );

        a.start().unwrap();
        assert_eq!(a.place_bid(bidder, dec!(100)), Err(AppError::BidTooLow));
        assert_eq!(a.place_bid(bidder, dec!(100)), Err(AppError::BidTooLow));

        a.place_bid(bidder, dec!(150)).unwrap();
        assert_eq!(a.items[0].highest_bid, dec!(150));
        assert_eq!(a.items[0].highest_bidder_id, Some(bidder));
    }

    #[test]
    fn sells_first_item_then_leaves_second_unsold() {
        let mut a = two_item_auction();
        a.start().unwrap();
        let x = Uuid::new_v4();
        a.place_bid(x, dec!(150)).unwrap();

        let outcome = a.end_current_item().unwrap();
        assert!(outcome.had_bids);
        assert_eq!(outcome.winner_id, Some(x));
        assert_eq!(outcome.final_price, dec!(150));

        match a.advance_to_next_item().unwrap() {
            AdvanceOutcome::NextItemLive { .. } => {}
            AdvanceOutcome::AuctionEnded => panic!("expected item B to go live"),
        }
        assert_eq!(a.items[1].status, ItemStatus::Live);
        assert_eq!(a.items[1].highest_bid, dec!(50));

        let outcome_b = a.end_current_item().unwrap();
        assert!(!outcome_b.had_bids);
        assert_eq!(outcome_b.winner_id, None);
        assert_eq!(outcome_b.final_price, dec!(50));

        match a.advance_to_next_item().unwrap() {
            AdvanceOutcome::AuctionEnded => {}
            AdvanceOutcome::NextItemLive { .. } => panic!("expected auction to end"),
        }
        assert_eq!(a.status, AuctionStatus::Ended);

        let results = a.end_auction();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].winner_id, Some(x));
        assert_eq!(results[1].winner_id, None);
    }

    #[test]
    fn extend_at_most_once_per_item() {
        let mut a = two_item_auction();
        a.start().unwrap();
        a.extend_current_item().unwrap();
        assert!(a.items[0].extended);
        assert_eq!(
            a.extend_current_item(),
            Err(AppError::IllegalTransition("item already extended"))
        );
    }

    #[test]
    fn end_auction_is_idempotent_and_freezes_state() {
        let mut a = two_item_auction();
        a.start().unwrap();
        let first = a.end_auction();
        let second = a.end_auction();
        assert_eq!(first, second);
        assert_eq!(a.status, AuctionStatus::Ended);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut a = two_item_auction();
        a.start().unwrap();
        a.place_bid(Uuid::new_v4(), dec!(120)).unwrap();

        let snap = a.snapshot();
        let restored = EngineState::restore(snap.clone());
        assert_eq!(restored, a);
        assert_eq!(restored.snapshot(), snap);
    }
}
