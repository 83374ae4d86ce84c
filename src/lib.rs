//! AuctionHouse — backend-authoritative realtime auction server.
//!
//! A seller registers an auction holding an ordered list of items;
//! each item runs as a timed English ascending-price auction; many
//! buyers bid concurrently over a realtime channel. This crate is the
//! auction-engine subsystem: the per-auction state machine
//! ([`engine`]), the concurrency arbiter that serializes concurrent
//! bids ([`arbiter`]), the durable log ([`storage`]), the per-auction
//! actor binding all of it together ([`coordinator`]), the item-expiry
//! scheduler ([`scheduler`]), and the subscriber fan-out
//! ([`broadcast`]). [`http`] mounts the control plane and realtime
//! channel described in the external interfaces; identity
//! verification ([`identity`]) is an external collaborator expressed
//! as a trait.

pub mod arbiter;
pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod http;
pub mod identity;
pub mod models;
pub mod scheduler;
pub mod storage;

pub use config::Config;
pub use coordinator::Coordinator;
pub use error::AppError;
