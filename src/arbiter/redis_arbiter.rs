//! Redis-backed Arbiter
//!
//! Realizes the check-and-set and idempotency primitives as scripted
//! atomic operations (`EVAL`) rather than separate read-then-write
//! round trips. Keys follow a fixed layout:
//! `auction:<aid>:item:<iid>:{highest_bid,highest_bidder,idem:<key>:{pending,result}}`.

use super::{ArbiterClient, CasOutcome, ClaimOutcome, IDEMPOTENCY_CLAIM_TTL, IDEMPOTENCY_RESULT_TTL};
use crate::error::AppError;
use crate::models::BidResult;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

/// `highest_bid > current OR current absent` check-and-set. Amounts
/// compare numerically (`tonumber`); this is adequate for the bid
/// magnitudes this system deals with and keeps the script a single
/// round trip.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if (not current) or (tonumber(ARGV[1]) > tonumber(current)) then
    redis.call('SET', KEYS[1], ARGV[1])
    redis.call('SET', KEYS[2], ARGV[2])
    return 1
else
    return 0
end
"#;

const CLAIM_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
else
    redis.call('SET', KEYS[1], '1', 'EX', ARGV[1])
    return 1
end
"#;

const STORE_RESULT_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[2])
return 1
"#;

pub struct RedisArbiter {
    conn: Mutex<ConnectionManager>,
    cas_script: Script,
    claim_script: Script,
    store_result_script: Script,
}

impl RedisArbiter {
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(url)
            .map_err(|e| AppError::Unavailable(format!("invalid arbiter url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Unavailable(format!("arbiter connect failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            cas_script: Script::new(CAS_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            store_result_script: Script::new(STORE_RESULT_SCRIPT),
        })
    }

    fn highest_bid_key(auction_id: Uuid, item_id: Uuid) -> String {
        format!("auction:{auction_id}:item:{item_id}:highest_bid")
    }

    fn highest_bidder_key(auction_id: Uuid, item_id: Uuid) -> String {
        format!("auction:{auction_id}:item:{item_id}:highest_bidder")
    }

    fn idem_pending_key(auction_id: Uuid, item_id: Uuid, bidder_id: Uuid, key: &str) -> String {
        format!("auction:{auction_id}:item:{item_id}:idem:{bidder_id}:{key}:pending")
    }

    fn idem_result_key(auction_id: Uuid, item_id: Uuid, bidder_id: Uuid, key: &str) -> String {
        format!("auction:{auction_id}:item:{item_id}:idem:{bidder_id}:{key}:result")
    }

    fn map_redis_err(e: redis::RedisError) -> AppError {
        AppError::Unavailable(format!("arbiter error: {e}"))
    }
}

#[async_trait]
impl ArbiterClient for RedisArbiter {
    async fn seed_item(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        starting_price: Decimal,
    ) -> Result<(), AppError> {
        let mut conn = self.conn.lock().await;
        let bid_key = Self::highest_bid_key(auction_id, item_id);
        let bidder_key = Self::highest_bidder_key(auction_id, item_id);
        redis::pipe()
            .set(&bid_key, starting_price.to_string())
            .del(&bidder_key)
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(Self::map_redis_err)
    }

    async fn seed_item_with_bidder(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        highest_bid: Decimal,
        highest_bidder_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let mut conn = self.conn.lock().await;
        let bid_key = Self::highest_bid_key(auction_id, item_id);
        let bidder_key = Self::highest_bidder_key(auction_id, item_id);
        let mut pipe = redis::pipe();
        pipe.set(&bid_key, highest_bid.to_string());
        match highest_bidder_id {
            Some(bidder_id) => {
                pipe.set(&bidder_key, bidder_id.to_string());
            }
            None => {
                pipe.del(&bidder_key);
            }
        }
        pipe.query_async::<_, ()>(&mut *conn)
            .await
            .map_err(Self::map_redis_err)
    }

    async fn bid_cas(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        new_amount: Decimal,
        bidder_id: Uuid,
    ) -> Result<CasOutcome, AppError> {
        let mut conn = self.conn.lock().await;
        let bid_key = Self::highest_bid_key(auction_id, item_id);
        let bidder_key = Self::highest_bidder_key(auction_id, item_id);
        let result: i64 = self
            .cas_script
            .key(&bid_key)
            .key(&bidder_key)
            .arg(new_amount.to_string())
            .arg(bidder_id.to_string())
            .invoke_async(&mut *conn)
            .await
            .map_err(Self::map_redis_err)?;
        Ok(if result == 1 {
            CasOutcome::Accepted
        } else {
            CasOutcome::Rejected
        })
    }

    async fn clear_item(&self, auction_id: Uuid, item_id: Uuid) -> Result<(), AppError> {
        let mut conn = self.conn.lock().await;
        let keys = [
            Self::highest_bid_key(auction_id, item_id),
            Self::highest_bidder_key(auction_id, item_id),
        ];
        conn.del::<_, ()>(&keys[..])
            .await
            .map_err(Self::map_redis_err)
    }

    async fn clear_auction(&self, auction_id: Uuid, item_ids: &[Uuid]) -> Result<(), AppError> {
        if item_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let mut keys = Vec::with_capacity(item_ids.len() * 2);
        for item_id in item_ids {
            keys.push(Self::highest_bid_key(auction_id, *item_id));
            keys.push(Self::highest_bidder_key(auction_id, *item_id));
        }
        conn.del::<_, ()>(keys).await.map_err(Self::map_redis_err)
    }

    async fn claim_idempotency(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        bidder_id: Uuid,
        key: &str,
    ) -> Result<ClaimOutcome, AppError> {
        let mut conn = self.conn.lock().await;
        let pending_key = Self::idem_pending_key(auction_id, item_id, bidder_id, key);
        let result: i64 = self
            .claim_script
            .key(&pending_key)
            .arg(IDEMPOTENCY_CLAIM_TTL.as_secs())
            .invoke_async(&mut *conn)
            .await
            .map_err(Self::map_redis_err)?;
        Ok(if result == 1 {
            ClaimOutcome::Owned
        } else {
            ClaimOutcome::AlreadyClaimed
        })
    }

    async fn get_idempotency_result(
        &self,
        auction_id: Uuid,
        item_id: Uuid,
        bidder_id: Uuid,
        key: &str,
    ) -> Result<Option<BidResult>, AppError> {
        let mut conn = self.conn.lock().await;
        let result_key = Self::idem_result_key(auction_id, item_id, bidder_id, key);
        let raw: Option<String> = conn.get(&result_key).await.map_err(Self::map_redis_err)?;
        Ok(match raw {
            Some(s) => Some(
                serde_json::from_str(&s)
                    .map_err(|e| AppError::Unavailable(format!("corrupt idempotency record: {e}")))?,
            ),
            None => None,
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
        let mut conn = self.conn.lock().await;
        let pending_key = Self::idem_pending_key(auction_id, item_id, bidder_id, key);
        let result_key = Self::idem_result_key(auction_id, item_id, bidder_id, key);
        let payload = serde_json::to_string(&outcome)
            .map_err(|e| AppError::Unavailable(format!("failed to encode outcome: {e}")))?;
        self.store_result_script
            .key(&pending_key)
            .key(&result_key)
            .arg(payload)
            .arg(IDEMPOTENCY_RESULT_TTL.as_secs())
            .invoke_async::<_, ()>(&mut *conn)
            .await
            .map_err(Self::map_redis_err)
    }
}
