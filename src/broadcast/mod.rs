//! Broadcast Hub (C6)
//!
//! Fans Coordinator events out to realtime subscribers grouped by
//! room — `"auction:" + auctionId`. Rooms are created lazily on first
//! subscribe and dropped once their last subscriber disconnects.

use crate::models::{AuctionEndedEvent, AuctionStateView, ItemSoldEvent};
use serde::Serialize;
use std::collections::HashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

const ROOM_CAPACITY: usize = 256;

/// Every message the hub ever publishes. Tagged so clients can
/// dispatch on `type` without inspecting `data`'s shape first.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AuctionEvent {
    AuctionState(AuctionStateView),
    ItemSold(ItemSoldEvent),
    AuctionEnded(AuctionEndedEvent),
}

pub struct BroadcastHub {
    rooms: Mutex<HashMap<Uuid, broadcast::Sender<AuctionEvent>>>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Joins the room for `auction_id`, creating it if this is the
    /// first subscriber.
    pub fn subscribe(&self, auction_id: Uuid) -> broadcast::Receiver<AuctionEvent> {
        let mut rooms = self.rooms.lock();
        rooms
            .entry(auction_id)
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    /// Publishes to a room. A no-op if nobody is currently subscribed
    /// (the room may not even exist yet) — the Coordinator does not
    /// need to know whether anyone is listening.
    pub fn publish(&self, auction_id: Uuid, event: AuctionEvent) {
        let mut rooms = self.rooms.lock();
        let Some(sender) = rooms.get(&auction_id) else {
            return;
        };
        let _ = sender.send(event);
        if sender.receiver_count() == 0 {
            rooms.remove(&auction_id);
        }
    }

    pub fn publish_state(&self, auction_id: Uuid, state: AuctionStateView) {
        self.publish(auction_id, AuctionEvent::AuctionState(state));
    }

    pub fn publish_item_sold(&self, auction_id: Uuid, event: ItemSoldEvent) {
        self.publish(auction_id, AuctionEvent::ItemSold(event));
    }

    pub fn publish_auction_ended(&self, auction_id: Uuid, event: AuctionEndedEvent) {
        self.publish(auction_id, AuctionEvent::AuctionEnded(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample_state(auction_id: Uuid) -> AuctionStateView {
        AuctionStateView {
            auction_id,
            seller_id: Uuid::new_v4(),
            status: crate::models::AuctionStatus::Live,
            current_item_index: 0,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: None,
            items: vec![],
            item_end_time: None,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let hub = BroadcastHub::new();
        let auction_id = Uuid::new_v4();
        let mut rx = hub.subscribe(auction_id);

        hub.publish_state(auction_id, sample_state(auction_id));
        hub.publish_item_sold(
            auction_id,
            ItemSoldEvent {
                item_id: Uuid::new_v4(),
                winner_id: None,
                final_price: dec!(50),
            },
        );

        match rx.recv().await.unwrap() {
            AuctionEvent::AuctionState(_) => {}
            other => panic!("expected auction_state first, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            AuctionEvent::ItemSold(_) => {}
            other => panic!("expected item_sold second, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let hub = BroadcastHub::new();
        let auction_id = Uuid::new_v4();
        hub.publish_state(auction_id, sample_state(auction_id));
        assert!(hub.rooms.lock().is_empty());
    }
}
