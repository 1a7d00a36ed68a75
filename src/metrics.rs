//! Metrics for the gossip layer.
//!
//! ## Available Metrics
//!
//! ### Counters
//! - `mgossip_messages_broadcast_total` - Broadcasts originated locally
//! - `mgossip_messages_delivered_total` - Messages delivered to the application
//! - `mgossip_messages_duplicate_total` - Duplicate messages suppressed
//! - `mgossip_messages_dropped_total` - Inbound frames that failed to decode
//! - `mgossip_messages_relayed_total` - Received messages re-queued for relay
//! - `mgossip_broadcasts_retired_total` - Broadcasts removed from the queue
//! - `mgossip_piggyback_sent_total` - Messages handed to the transport
//! - `mgossip_push_pull_total` - Completed push/pull exchanges
//! - `mgossip_push_pull_failed_total` - Failed push/pull exchanges
//! - `mgossip_seen_map_evictions_total` - Ids evicted from the seen map
//!
//! ### Histograms
//! - `mgossip_message_size_bytes` - Originated payload size distribution
//! - `mgossip_snapshot_size_bytes` - Snapshot size distribution
//!
//! ### Gauges
//! - `mgossip_queue_depth` - Pending broadcasts in the queue
//! - `mgossip_seen_map_size` - Entries in the deduplication map

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Initialize metric descriptions.
///
/// Call this once at application startup to register all metric descriptions.
pub fn init_metrics() {
    describe_counter!(
        "mgossip_messages_broadcast_total",
        "Total number of messages broadcast by this node"
    );
    describe_counter!(
        "mgossip_messages_delivered_total",
        "Total number of messages delivered to application"
    );
    describe_counter!(
        "mgossip_messages_duplicate_total",
        "Total number of duplicate messages suppressed"
    );
    describe_counter!(
        "mgossip_messages_dropped_total",
        "Total number of inbound frames that were not valid gossip envelopes"
    );
    describe_counter!(
        "mgossip_messages_relayed_total",
        "Total number of received messages queued for relay"
    );
    describe_counter!(
        "mgossip_broadcasts_retired_total",
        "Total number of broadcasts removed from the queue"
    );
    describe_counter!(
        "mgossip_piggyback_sent_total",
        "Total number of messages handed to the transport for piggyback"
    );
    describe_counter!(
        "mgossip_push_pull_total",
        "Total number of completed push/pull exchanges"
    );
    describe_counter!(
        "mgossip_push_pull_failed_total",
        "Total number of failed push/pull exchanges"
    );
    describe_counter!(
        "mgossip_seen_map_evictions_total",
        "Total number of ids evicted from the seen map"
    );

    describe_histogram!(
        "mgossip_message_size_bytes",
        "Originated message payload size in bytes"
    );
    describe_histogram!(
        "mgossip_snapshot_size_bytes",
        "Size of full-state snapshots produced or merged"
    );

    describe_gauge!("mgossip_queue_depth", "Current number of pending broadcasts");
    describe_gauge!(
        "mgossip_seen_map_size",
        "Current number of entries in the deduplication (seen) map"
    );
}

/// Record a message broadcast.
pub fn record_broadcast(size: usize) {
    counter!("mgossip_messages_broadcast_total").increment(1);
    histogram!("mgossip_message_size_bytes").record(size as f64);
}

/// Record a message delivery.
pub fn record_delivery() {
    counter!("mgossip_messages_delivered_total").increment(1);
}

/// Record a duplicate message.
pub fn record_duplicate() {
    counter!("mgossip_messages_duplicate_total").increment(1);
}

/// Record an inbound frame that failed to decode.
pub fn record_dropped() {
    counter!("mgossip_messages_dropped_total").increment(1);
}

/// Record a message queued for relay.
pub fn record_relayed() {
    counter!("mgossip_messages_relayed_total").increment(1);
}

/// Record broadcasts leaving the queue.
pub fn record_retired(count: usize) {
    counter!("mgossip_broadcasts_retired_total").increment(count as u64);
}

/// Record messages handed out for piggyback.
pub fn record_piggyback_sent(count: usize) {
    counter!("mgossip_piggyback_sent_total").increment(count as u64);
}

/// Record the outcome of a push/pull exchange.
pub fn record_push_pull(success: bool) {
    if success {
        counter!("mgossip_push_pull_total").increment(1);
    } else {
        counter!("mgossip_push_pull_failed_total").increment(1);
    }
}

/// Record snapshot size in bytes.
pub fn record_snapshot_size(size: usize) {
    histogram!("mgossip_snapshot_size_bytes").record(size as f64);
}

/// Update queue depth gauge.
pub fn set_queue_depth(count: usize) {
    gauge!("mgossip_queue_depth").set(count as f64);
}

/// Update seen map size gauge.
pub fn set_seen_map_size(count: usize) {
    gauge!("mgossip_seen_map_size").set(count as f64);
}

/// Record evictions from the seen map.
pub fn record_seen_map_evictions(count: usize) {
    counter!("mgossip_seen_map_evictions_total").increment(count as u64);
}
