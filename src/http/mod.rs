//! Control Plane (HTTP)
//!
//! REST endpoints for auction admission, lifecycle, and history, plus
//! `GET /healthz` for liveness probes. The realtime channel itself
//! lives in `crate::http::ws`.

pub mod ws;

use crate::coordinator::Coordinator;
use crate::error::AppError;
use crate::identity::{SharedIdentityVerifier, VerifiedIdentity};
use crate::models::{
    AuctionStateView, AuctionSummary, Bid, CreateAuctionRequest, ExtendItemRequest,
};
use crate::storage::SharedLog;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use validator::Validate;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub identity: SharedIdentityVerifier,
    pub log: SharedLog,
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auctions", post(create_auction).get(list_auctions))
        .route("/auctions/:auction_id", get(get_auction))
        .route("/auctions/:auction_id/start", post(start_auction))
        .route("/auctions/:auction_id/extend", post(extend_item))
        .route(
            "/auctions/:auction_id/items/:item_id/bids",
            get(bids_for_item),
        )
        .route("/ws", get(ws::upgrade))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        AllowOrigin::list(parsed)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
        .max_age(Duration::from_secs(3600))
}

async fn healthz() -> &'static str {
    "ok"
}

/// Reads `Authorization: Bearer <token>`, verifies it, and upserts the
/// resulting identity so seller/bidder names resolve for history reads.
pub(crate) async fn authenticate(
    headers: &HeaderMap,
    state: &AppState,
) -> Result<VerifiedIdentity, AppError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::PermissionDenied)?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(AppError::PermissionDenied)?;
    let identity = state.identity.verify(token).await?;
    state
        .log
        .upsert_user(identity.user_id, &identity.display_name)
        .await?;
    Ok(identity)
}

async fn create_auction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateAuctionRequest>,
) -> Result<Json<AuctionStateView>, AppError> {
    authenticate(&headers, &state).await?;
    if req.validate().is_err() {
        return Err(AppError::IllegalTransition("invalid auction request"));
    }
    let view = state
        .coordinator
        .create_auction(req.seller_id, req.items)
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct ListAuctionsQuery {
    seller_id: Option<Uuid>,
}

async fn list_auctions(
    State(state): State<AppState>,
    Query(query): Query<ListAuctionsQuery>,
) -> Result<Json<Vec<AuctionSummary>>, AppError> {
    let summaries = state.coordinator.list_summaries(query.seller_id).await?;
    Ok(Json(summaries))
}

async fn get_auction(
    State(state): State<AppState>,
    Path(auction_id): Path<Uuid>,
) -> Result<Json<AuctionStateView>, AppError> {
    let view = state.coordinator.get_state(auction_id).await?;
    Ok(Json(view))
}

async fn start_auction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(auction_id): Path<Uuid>,
) -> Result<Json<AuctionStateView>, AppError> {
    let identity = authenticate(&headers, &state).await?;
    let view = state.coordinator.get_state(auction_id).await?;
    if view.seller_id != identity.user_id {
        return Err(AppError::PermissionDenied);
    }
    let started = state.coordinator.start_auction(auction_id).await?;
    Ok(Json(started))
}

async fn extend_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(auction_id): Path<Uuid>,
    body: Option<Json<ExtendItemRequest>>,
) -> Result<Json<AuctionStateView>, AppError> {
    let identity = authenticate(&headers, &state).await?;
    let seller_id = body.map(|Json(b)| b.seller_id).unwrap_or(identity.user_id);
    if seller_id != identity.user_id {
        return Err(AppError::PermissionDenied);
    }
    let view = state.coordinator.extend_item(auction_id, seller_id).await?;
    Ok(Json(view))
}

async fn bids_for_item(
    State(state): State<AppState>,
    Path((auction_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Vec<Bid>>, AppError> {
    let bids = state.coordinator.bids_for_item(auction_id, item_id).await?;
    Ok(Json(bids))
}
