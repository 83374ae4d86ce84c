//! Auction Domain Models
//!
//! Users, auctions, auction items, bids, and item results — the
//! persistence-normative shapes described in the data model. Field
//! names serialize as camelCase on the wire; Postgres columns stay
//! snake_case, matched by `sqlx::FromRow` on the Rust field name.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// A registered identity. Created once on first sight; `display_name`
/// may change subject to uniqueness.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: Uuid,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionStatus {
    Created,
    Live,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Live,
    Sold,
    Unsold,
}

/// A seller's auction: a sequence of items sold one at a time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Auction {
    pub auction_id: Uuid,
    pub seller_id: Uuid,
    pub status: AuctionStatus,
    pub current_item_index: i32,
    pub max_duration_sec: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One lot within an auction.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuctionItem {
    pub item_id: Uuid,
    pub auction_id: Uuid,
    pub item_order: i32,
    pub name: String,
    pub starting_price: Decimal,
    pub duration_sec: i32,
    pub extra_duration_sec: i32,
    pub status: ItemStatus,
    pub highest_bid: Decimal,
    pub extended: bool,
    pub highest_bidder_id: Option<Uuid>,
    /// When this item became LIVE. Absent for PENDING items. Lets
    /// recovery derive *remaining* time for an item beyond the first
    /// from a real clock reading rather than re-arming its full
    /// duration — see `crate::coordinator`'s recovery path.
    pub live_at: Option<DateTime<Utc>>,
    pub sold_at: Option<DateTime<Utc>>,
}

/// A persisted, accepted bid. The sequence of bids for one item is
/// strictly amount-monotone.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Bid {
    pub bid_id: Uuid,
    pub auction_id: Uuid,
    pub item_id: Uuid,
    pub bidder_id: Uuid,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// The outcome of one SOLD item. No row exists for an UNSOLD item.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub item_id: Uuid,
    pub winner_id: Uuid,
    pub final_price: Decimal,
    pub sold_at: DateTime<Utc>,
}

// --- Control-plane request/response DTOs -----------------------------

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateItemRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub starting_price: Decimal,
    #[validate(range(min = 1))]
    pub duration_sec: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateAuctionRequest {
    pub seller_id: Uuid,
    #[validate]
    pub items: Vec<CreateItemRequest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendItemRequest {
    pub seller_id: Uuid,
}

/// Summary row returned by `GET /auctions`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSummary {
    pub auction_id: Uuid,
    pub seller_id: Uuid,
    pub status: AuctionStatus,
    pub seller_name: String,
    pub first_item_name: String,
    pub item_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Full auction state as broadcast to subscribers and returned by
/// `GET /auctions/:id`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionStateView {
    pub auction_id: Uuid,
    pub seller_id: Uuid,
    pub status: AuctionStatus,
    pub current_item_index: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub items: Vec<AuctionItem>,
    /// Absolute epoch-millisecond deadline of the current item's timer,
    /// present only while an item timer is armed.
    pub item_end_time: Option<i64>,
}

/// The outcome of one item closing, broadcast as `item_sold`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSoldEvent {
    pub item_id: Uuid,
    pub winner_id: Option<Uuid>,
    pub final_price: Decimal,
}

/// The outcome of an auction closing, broadcast as `auction_ended`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionEndedEvent {
    pub auction_id: Uuid,
    pub results: Vec<AuctionItemResultEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionItemResultEntry {
    pub item_id: Uuid,
    pub winner_id: Option<Uuid>,
    pub final_price: Decimal,
}

/// The always-present outcome of a bid attempt, returned over both the
/// HTTP and realtime boundaries — never an exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidResult {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BidResult {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}
