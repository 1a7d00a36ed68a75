//! Message types and utilities for the gossip layer.
//!
//! This module contains:
//! - [`MessageId`] / [`IdGenerator`] - Snowflake-style message identifiers
//! - [`Envelope`] - Wire framing (`encode` / `decode`)
//! - [`SeenCache`] - Duplicate suppression with TTL eviction

mod cache;
pub mod envelope;
mod id;

pub use cache::{SeenCache, SeenCacheStats};
pub use envelope::{DecodeError, Envelope};
pub use id::{IdGenerator, MessageId, DEFAULT_EPOCH_MS, MAX_BORROW_MS, MAX_NODE_ID};
