//! Postgres-backed `DurableLog`.
//!
//! Every multi-row mutation runs inside one `sqlx::Transaction` so a
//! crash mid-write can never leave a bid recorded without its item's
//! `highest_bid` moving, or an item SOLD without its `ItemResult` row.

use super::{AuctionRecord, AuctionStatusPatch, DurableLog, ItemStatusPatch};
use crate::engine::AuctionResultRow;
use crate::error::AppError;
use crate::models::{Auction, AuctionItem, AuctionStatus, AuctionSummary, Bid, ItemResult, ItemStatus, User};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

pub struct PostgresLog {
    pool: PgPool,
}

impl PostgresLog {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| AppError::Unavailable(format!("database connect failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Runs pending migrations from the crate's `migrations/` directory.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Unavailable(format!("migration failed: {e}")))
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(|e| AppError::Unavailable(format!("transaction begin failed: {e}")))
    }

    async fn load_items(&self, auction_id: Uuid) -> Result<Vec<AuctionItem>, AppError> {
        sqlx::query_as::<_, AuctionItem>(
            r#"SELECT item_id, auction_id, item_order, name, starting_price, duration_sec,
                      extra_duration_sec, status, highest_bid, extended, highest_bidder_id,
                      live_at, sold_at
               FROM auction_items WHERE auction_id = $1 ORDER BY item_order ASC"#,
        )
        .bind(auction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }
}

fn map_sqlx_err(e: sqlx::Error) -> AppError {
    AppError::PersistFailed(e.to_string())
}

#[async_trait]
impl DurableLog for PostgresLog {
    async fn append_auction(&self, auction: &Auction, items: &[AuctionItem]) -> Result<(), AppError> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"INSERT INTO auctions
                 (auction_id, seller_id, status, current_item_index, max_duration_sec, created_at, started_at, ended_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(auction.auction_id)
        .bind(auction.seller_id)
        .bind(auction.status)
        .bind(auction.current_item_index)
        .bind(auction.max_duration_sec)
        .bind(auction.created_at)
        .bind(auction.started_at)
        .bind(auction.ended_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        for item in items {
            sqlx::query(
                r#"INSERT INTO auction_items
                     (item_id, auction_id, item_order, name, starting_price, duration_sec,
                      extra_duration_sec, status, highest_bid, extended, highest_bidder_id,
                      live_at, sold_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
            )
            .bind(item.item_id)
            .bind(item.auction_id)
            .bind(item.item_order)
            .bind(&item.name)
            .bind(item.starting_price)
            .bind(item.duration_sec)
            .bind(item.extra_duration_sec)
            .bind(item.status)
            .bind(item.highest_bid)
            .bind(item.extended)
            .bind(item.highest_bidder_id)
            .bind(item.live_at)
            .bind(item.sold_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn set_auction_status(
        &self,
        auction_id: Uuid,
        status: AuctionStatus,
        patch: AuctionStatusPatch,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"UPDATE auctions SET
                 status = $2,
                 started_at = COALESCE($3, started_at),
                 ended_at = COALESCE($4, ended_at),
                 current_item_index = COALESCE($5, current_item_index)
               WHERE auction_id = $1"#,
        )
        .bind(auction_id)
        .bind(status)
        .bind(patch.started_at)
        .bind(patch.ended_at)
        .bind(patch.current_item_index)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::unknown_auction(auction_id));
        }
        Ok(())
    }

    async fn set_item_status(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        patch: ItemStatusPatch,
    ) -> Result<(), AppError> {
        let highest_bidder_id = patch.highest_bidder_id.unwrap_or(None);
        let touches_bidder = patch.highest_bidder_id.is_some();

        let result = sqlx::query(
            r#"UPDATE auction_items SET
                 status = $2,
                 highest_bid = COALESCE($3, highest_bid),
                 highest_bidder_id = CASE WHEN $4 THEN $5 ELSE highest_bidder_id END,
                 extended = COALESCE($6, extended),
                 live_at = COALESCE($7, live_at),
                 sold_at = COALESCE($8, sold_at)
               WHERE item_id = $1"#,
        )
        .bind(item_id)
        .bind(status)
        .bind(patch.highest_bid)
        .bind(touches_bidder)
        .bind(highest_bidder_id)
        .bind(patch.extended)
        .bind(patch.live_at)
        .bind(patch.sold_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("item {item_id}")));
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
        let mut tx = self.begin().await?;
        let bid_id = Uuid::new_v4();
        let created_at = Utc::now();

        sqlx::query(
            r#"INSERT INTO bids (bid_id, auction_id, item_id, bidder_id, amount, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(bid_id)
        .bind(auction_id)
        .bind(item_id)
        .bind(bidder_id)
        .bind(amount)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let result = sqlx::query(
            r#"UPDATE auction_items SET highest_bid = $2, highest_bidder_id = $3 WHERE item_id = $1"#,
        )
        .bind(item_id)
        .bind(amount)
        .bind(bidder_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("item {item_id}")));
        }

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(Bid {
            bid_id,
            auction_id,
            item_id,
            bidder_id,
            amount,
            created_at,
        })
    }

    async fn finalize_item(
        &self,
        item_id: Uuid,
        winner_id: Option<Uuid>,
        final_price: Decimal,
    ) -> Result<(), AppError> {
        let mut tx = self.begin().await?;
        let now = Utc::now();
        let status = if winner_id.is_some() {
            ItemStatus::Sold
        } else {
            ItemStatus::Unsold
        };

        let result = sqlx::query(
            r#"UPDATE auction_items SET status = $2, sold_at = $3 WHERE item_id = $1"#,
        )
        .bind(item_id)
        .bind(status)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("item {item_id}")));
        }

        if let Some(winner_id) = winner_id {
            sqlx::query(
                r#"INSERT INTO item_results (item_id, winner_id, final_price, sold_at)
                   VALUES ($1, $2, $3, $4)
                   ON CONFLICT (item_id) DO UPDATE SET
                     winner_id = EXCLUDED.winner_id,
                     final_price = EXCLUDED.final_price,
                     sold_at = EXCLUDED.sold_at"#,
            )
            .bind(item_id)
            .bind(winner_id)
            .bind(final_price)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn finalize_auction(
        &self,
        auction_id: Uuid,
        results: &[AuctionResultRow],
    ) -> Result<(), AppError> {
        let mut tx = self.begin().await?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"UPDATE auctions SET status = $2, ended_at = $3 WHERE auction_id = $1"#,
        )
        .bind(auction_id)
        .bind(AuctionStatus::Ended)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::unknown_auction(auction_id));
        }

        for row in results {
            let Some(winner_id) = row.winner_id else {
                continue;
            };
            sqlx::query(
                r#"INSERT INTO item_results (item_id, winner_id, final_price, sold_at)
                   VALUES ($1, $2, $3, $4)
                   ON CONFLICT (item_id) DO UPDATE SET
                     winner_id = EXCLUDED.winner_id,
                     final_price = EXCLUDED.final_price,
                     sold_at = EXCLUDED.sold_at"#,
            )
            .bind(row.item_id)
            .bind(winner_id)
            .bind(row.final_price)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn load_active(&self) -> Result<Vec<AuctionRecord>, AppError> {
        let auctions = sqlx::query_as::<_, Auction>(
            r#"SELECT auction_id, seller_id, status, current_item_index, max_duration_sec,
                      created_at, started_at, ended_at
               FROM auctions WHERE status <> $1 ORDER BY created_at ASC"#,
        )
        .bind(AuctionStatus::Ended)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut records = Vec::with_capacity(auctions.len());
        for auction in auctions {
            let items = self.load_items(auction.auction_id).await?;
            records.push(AuctionRecord { auction, items });
        }
        Ok(records)
    }

    async fn load_one(&self, auction_id: Uuid) -> Result<Option<AuctionRecord>, AppError> {
        let auction = sqlx::query_as::<_, Auction>(
            r#"SELECT auction_id, seller_id, status, current_item_index, max_duration_sec,
                      created_at, started_at, ended_at
               FROM auctions WHERE auction_id = $1"#,
        )
        .bind(auction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let Some(auction) = auction else {
            return Ok(None);
        };
        let items = self.load_items(auction_id).await?;
        Ok(Some(AuctionRecord { auction, items }))
    }

    async fn list_summaries(&self, seller_id: Option<Uuid>) -> Result<Vec<AuctionSummary>, AppError> {
        sqlx::query_as::<_, AuctionSummary>(
            r#"SELECT a.auction_id, a.seller_id, a.status, u.display_name AS seller_name,
                      COALESCE(first_item.name, '') AS first_item_name,
                      COALESCE(item_counts.item_count, 0) AS item_count,
                      a.created_at
               FROM auctions a
               JOIN users u ON u.user_id = a.seller_id
               LEFT JOIN LATERAL (
                   SELECT name FROM auction_items WHERE auction_id = a.auction_id
                   ORDER BY item_order ASC LIMIT 1
               ) first_item ON true
               LEFT JOIN LATERAL (
                   SELECT COUNT(*) AS item_count FROM auction_items WHERE auction_id = a.auction_id
               ) item_counts ON true
               WHERE $1::uuid IS NULL OR a.seller_id = $1
               ORDER BY a.created_at DESC"#,
        )
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        sqlx::query_as::<_, User>(
            r#"SELECT user_id, display_name, created_at, updated_at FROM users WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn upsert_user(&self, user_id: Uuid, display_name: &str) -> Result<User, AppError> {
        sqlx::query_as::<_, User>(
            r#"INSERT INTO users (user_id, display_name, created_at, updated_at)
               VALUES ($1, $2, now(), now())
               ON CONFLICT (user_id) DO UPDATE SET
                 display_name = EXCLUDED.display_name,
                 updated_at = now()
               RETURNING user_id, display_name, created_at, updated_at"#,
        )
        .bind(user_id)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn bids_for_item(&self, item_id: Uuid) -> Result<Vec<Bid>, AppError> {
        sqlx::query_as::<_, Bid>(
            r#"SELECT bid_id, auction_id, item_id, bidder_id, amount, created_at
               FROM bids WHERE item_id = $1 ORDER BY created_at DESC"#,
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn item_result(&self, item_id: Uuid) -> Result<Option<ItemResult>, AppError> {
        sqlx::query_as::<_, ItemResult>(
            r#"SELECT item_id, winner_id, final_price, sold_at FROM item_results WHERE item_id = $1"#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }
}
