//! Realtime Channel (WebSocket)
//!
//! One connection authenticates once at handshake — the same
//! `Authorization: Bearer` header scheme as the control plane — and
//! its resulting `userId` is bound for the lifetime of the socket.
//! Client frames: `join_auction`/`leave_auction`/`place_bid`. Server
//! frames: the Broadcast Hub's `auction_state`/`item_sold`/
//! `auction_ended` for every room this connection has joined, plus a
//! `bid_result`/`error` reply to each inbound frame. Subscription is
//! per-auction room; nothing here is transport-agnostic — that lives
//! in `crate::broadcast`.

use super::{authenticate, AppState};
use crate::broadcast::BroadcastHub;
use crate::models::BidResult;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const OUTBOUND_CAPACITY: usize = 256;

pub async fn upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    match authenticate(&headers, &state).await {
        Ok(identity) => ws.on_upgrade(move |socket| run(socket, state, identity.user_id)),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinAuction { auction_id: Uuid },
    #[serde(rename_all = "camelCase")]
    LeaveAuction { auction_id: Uuid },
    #[serde(rename_all = "camelCase")]
    PlaceBid {
        auction_id: Uuid,
        amount: Decimal,
        idempotency_key: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ServerMessage {
    BidResult(BidResult),
    Error { message: String },
}

#[tracing::instrument(skip(socket, state), fields(%user_id))]
async fn run(socket: WebSocket, state: AppState, user_id: Uuid) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut rooms: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::JoinAuction { auction_id }) => {
                rooms.entry(auction_id).or_insert_with(|| {
                    spawn_room_forwarder(state.coordinator.hub(), auction_id, out_tx.clone())
                });
            }
            Ok(ClientMessage::LeaveAuction { auction_id }) => {
                if let Some(handle) = rooms.remove(&auction_id) {
                    handle.abort();
                }
            }
            Ok(ClientMessage::PlaceBid {
                auction_id,
                amount,
                idempotency_key,
            }) => {
                let result = state
                    .coordinator
                    .place_bid(auction_id, user_id, amount, idempotency_key)
                    .await;
                if send_json(&out_tx, &ServerMessage::BidResult(result)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(%user_id, error = %e, "malformed realtime frame");
                let _ = send_json(
                    &out_tx,
                    &ServerMessage::Error {
                        message: e.to_string(),
                    },
                )
                .await;
            }
        }
    }

    for (_, handle) in rooms {
        handle.abort();
    }
    writer.abort();
}

async fn send_json(out_tx: &mpsc::Sender<Message>, msg: &ServerMessage) -> Result<(), ()> {
    let payload = serde_json::to_string(msg).map_err(|_| ())?;
    out_tx.send(Message::Text(payload)).await.map_err(|_| ())
}

/// One task per joined room, forwarding the hub's broadcast to this
/// connection's outbound mailbox until the client leaves or the
/// socket closes. A lagged receiver skips ahead rather than closing —
/// a slow client misses intermediate `auction_state` frames but the
/// next one it receives is still current.
fn spawn_room_forwarder(
    hub: Arc<BroadcastHub>,
    auction_id: Uuid,
    out_tx: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    let mut rx = hub.subscribe(auction_id);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(payload) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if out_tx.send(Message::Text(payload)).await.is_err() {
                        return;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            }
        }
    })
}
