//! # memberlist-mgossip
//!
//! Gossip dissemination layer for a SWIM-style membership protocol.
//!
//! Application events are flooded through the cluster by piggybacking them
//! on the membership protocol's own traffic. Every node forwards each new
//! message a bounded number of times, suppresses duplicates by message id,
//! and periodically reconciles full state with a peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Application                               │
//! │                     (GossipDelegate)                             │
//! └──────────────┬───────────────────────────────▲──────────────────┘
//!     broadcast()│                    on_deliver()│ local_state()
//!                │                               │ merge_remote_state()
//! ┌──────────────▼───────────────────────────────┴──────────────────┐
//! │                          Gossip                                  │
//! │   get_broadcasts() / notify_message() / produce/merge_snapshot  │
//! ├──────────────┬──────────────┬──────────────┬────────────────────┤
//! │ IdGenerator  │  SeenCache   │BroadcastQueue│    AntiEntropy     │
//! │ (snowflake)  │ (TTL dedup)  │(log10 limit) │  (push/pull loop)  │
//! └──────────────┴──────────────┴──────────────┴────────────────────┘
//!                │  piggyback / user messages   │ full-state exchange
//! ┌──────────────▼───────────────────────────────▼──────────────────┐
//! │              Membership transport (Membership,                   │
//! │                    PushPullTransport)                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//!
//! ```text
//! ┌─────────────┬──────────────────────┬─────────────────┐
//! │ "mgossip"   │ message id (u64 BE)  │ payload         │
//! │ 7 bytes     │ 8 bytes              │ remaining bytes │
//! └─────────────┴──────────────────────┴─────────────────┘
//! ```
//!
//! Frames without the magic prefix are not gossip traffic and are ignored,
//! so the layer can share a user-message channel with other protocols.
//!
//! ## Guarantees
//!
//! - **Uniqueness**: ids are unique across the cluster as long as node ids
//!   are distinct and below 1024
//! - **Idempotent delivery**: a message is delivered at most once per node
//!   while its id is remembered
//! - **Bounded retransmission**: each node piggybacks a message at most
//!   `retransmit_mult * ceil(log10(n + 1))` times
//! - **No ordering**: messages may be delivered in any order
//!
//! ## Example
//!
//! ```ignore
//! use memberlist_mgossip::{Gossip, GossipConfig, GossipDelegate, MessageId, StaticMembership};
//! use bytes::Bytes;
//!
//! struct Printer;
//! impl GossipDelegate for Printer {
//!     fn on_deliver(&self, id: MessageId, payload: Bytes) {
//!         println!("{id}: {payload:?}");
//!     }
//! }
//!
//! let membership = StaticMembership::new(1);
//! let gossip = Gossip::new(GossipConfig::lan().with_node_id(7), Printer, membership.clone())?;
//!
//! // Transport side
//! let piggyback = gossip.get_broadcasts(2, 1400);
//! gossip.notify_message(&inbound_frame);
//!
//! // Application side
//! gossip.broadcast(Bytes::from("hello"))?;
//!
//! // Background sweep of the duplicate cache
//! tokio::spawn({ let g = gossip.clone(); async move { g.run_cleanup().await } });
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]

mod broadcast;
mod config;
mod error;
mod gossip;
mod message;
mod sync;
mod transport;

pub mod kv;
pub mod testing;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

// Re-export broadcast queue
pub use broadcast::{retransmit_limit, Broadcast, BroadcastQueue, GossipBroadcast, QueueStats};

// Re-export configuration
pub use config::{max_payload_for, GossipConfig, FRAME_OVERHEAD_RESERVE};

// Re-export errors
pub use error::{Error, Result};

// Re-export core types
pub use gossip::{Gossip, GossipDelegate, GossipStats, NoopDelegate, Receipt};

// Re-export message types
pub use message::{
    envelope, DecodeError, Envelope, IdGenerator, MessageId, SeenCache, SeenCacheStats,
    DEFAULT_EPOCH_MS, MAX_BORROW_MS, MAX_NODE_ID,
};

// Re-export anti-entropy
pub use sync::AntiEntropy;

// Re-export transport boundary
pub use transport::{Membership, MembershipFn, NoopPushPull, PushPullTransport, StaticMembership};
