//! Domain Models
//!
//! The data model normative for persistence and wire payloads: users,
//! auctions, auction items, bids, and item results.

pub mod auction;

pub use auction::*;
