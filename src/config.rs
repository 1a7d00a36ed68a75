//! Configuration for the gossip layer.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::message::{envelope::HEADER_SIZE, DEFAULT_EPOCH_MS, MAX_NODE_ID};

/// Bytes of each piggyback budget left for the transport's own framing
/// (compound headers, per-message length prefixes, message type tags).
///
/// A payload of `max_message_size` must still fit a drain after this
/// much overhead, otherwise it is never transmitted.
pub const FRAME_OVERHEAD_RESERVE: usize = 16;

/// Largest payload that fits `budget` once the envelope header and
/// [`FRAME_OVERHEAD_RESERVE`] are taken out.
pub const fn max_payload_for(budget: usize) -> usize {
    budget.saturating_sub(HEADER_SIZE + FRAME_OVERHEAD_RESERVE)
}

/// Configuration options for the gossip layer.
///
/// These parameters control the balance between dissemination speed,
/// network overhead (retransmissions) and memory (duplicate tracking).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Node component of generated message ids (0..=1023).
    ///
    /// Must be distinct for every node in the cluster, otherwise two nodes
    /// can originate the same id in the same millisecond.
    ///
    /// Default: 1
    pub node_id: u16,

    /// Epoch for message ids, in milliseconds since the UNIX epoch.
    ///
    /// Every node must use the same epoch. The local clock must not read
    /// earlier than this value.
    ///
    /// Default: 2021-12-03T00:00:00Z
    pub epoch_ms: u64,

    /// Multiplier for the retransmission limit.
    ///
    /// Each broadcast is piggybacked `retransmit_mult * ceil(log10(n + 1))`
    /// times, where `n` is the current cluster size.
    ///
    /// Default: 3
    pub retransmit_mult: usize,

    /// Number of random peers the transport gossips to per interval.
    ///
    /// Not used by the queue itself; exposed so the transport and the
    /// in-process test cluster share one setting.
    ///
    /// Default: 2
    pub gossip_nodes: usize,

    /// Byte budget the transport offers for piggybacked messages.
    ///
    /// Default: 1400
    pub udp_buffer_size: usize,

    /// Maximum application payload size accepted by `broadcast`.
    ///
    /// A payload that cannot fit in a single piggyback budget would never
    /// be selected by the queue, so this defaults to the budget minus the
    /// envelope header and [`FRAME_OVERHEAD_RESERVE`]. [`validate`](Self::validate)
    /// rejects larger values.
    ///
    /// Default: 1369
    pub max_message_size: usize,

    /// How long a message id is remembered for duplicate suppression.
    ///
    /// Must be longer than the time a broadcast keeps circulating;
    /// afterwards a late duplicate would be delivered again.
    ///
    /// Default: 300s
    #[serde(with = "millis_serde")]
    pub seen_ttl: Duration,

    /// Expected number of remembered message ids.
    ///
    /// Advisory: ids are only forgotten once `seen_ttl` has passed, so a
    /// burst can exceed this. Going over it is logged and counted in
    /// [`SeenCacheStats::over_capacity`](crate::SeenCacheStats::over_capacity).
    ///
    /// Default: 100000
    pub seen_max_size: usize,

    /// Interval of the background sweep that evicts expired ids.
    ///
    /// Default: 10s
    #[serde(with = "millis_serde")]
    pub cleanup_interval: Duration,

    /// How often the transport asks for piggyback messages.
    ///
    /// Informational for the transport and the test cluster.
    ///
    /// Default: 200ms
    #[serde(with = "millis_serde")]
    pub gossip_interval: Duration,

    /// Interval for periodic full-state push/pull.
    ///
    /// Push/pull always runs when a node joins. Set a non-zero interval to
    /// also repair divergence caused by lost or expired gossip.
    ///
    /// Default: `Duration::ZERO` (join-time only)
    #[serde(with = "millis_serde")]
    pub push_pull_interval: Duration,

    /// Maximum random jitter added to each push/pull interval.
    ///
    /// Default: 1s
    #[serde(with = "millis_serde")]
    pub push_pull_jitter: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            epoch_ms: DEFAULT_EPOCH_MS,
            retransmit_mult: 3,
            gossip_nodes: 2,
            udp_buffer_size: 1400,
            max_message_size: max_payload_for(1400),
            seen_ttl: Duration::from_secs(300),
            seen_max_size: 100_000,
            cleanup_interval: Duration::from_secs(10),
            gossip_interval: Duration::from_millis(200),
            push_pull_interval: Duration::ZERO,
            push_pull_jitter: Duration::from_secs(1),
        }
    }
}

impl GossipConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for LAN clusters.
    ///
    /// - Three gossip targets per interval
    /// - Higher retransmission multiplier
    /// - Periodic push/pull every 30s
    pub fn lan() -> Self {
        Self {
            retransmit_mult: 4,
            gossip_nodes: 3,
            gossip_interval: Duration::from_millis(200),
            push_pull_interval: Duration::from_secs(30),
            push_pull_jitter: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Configuration for WAN clusters.
    ///
    /// - Slower gossip interval, higher retransmission multiplier
    /// - Longer duplicate retention
    /// - Periodic push/pull every 60s
    pub fn wan() -> Self {
        Self {
            retransmit_mult: 4,
            gossip_nodes: 4,
            gossip_interval: Duration::from_millis(500),
            seen_ttl: Duration::from_secs(600),
            push_pull_interval: Duration::from_secs(60),
            push_pull_jitter: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Configuration for single-host clusters and tests.
    pub fn local() -> Self {
        Self {
            retransmit_mult: 2,
            gossip_nodes: 3,
            gossip_interval: Duration::from_millis(100),
            seen_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Set the node id (builder pattern).
    pub const fn with_node_id(mut self, node_id: u16) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the id epoch in milliseconds (builder pattern).
    pub const fn with_epoch_ms(mut self, epoch_ms: u64) -> Self {
        self.epoch_ms = epoch_ms;
        self
    }

    /// Set the retransmission multiplier (builder pattern).
    pub const fn with_retransmit_mult(mut self, mult: usize) -> Self {
        self.retransmit_mult = mult;
        self
    }

    /// Set the gossip fanout (builder pattern).
    pub const fn with_gossip_nodes(mut self, nodes: usize) -> Self {
        self.gossip_nodes = nodes;
        self
    }

    /// Set the piggyback byte budget (builder pattern).
    ///
    /// Lowers `max_message_size` if it no longer fits the new budget.
    pub const fn with_udp_buffer_size(mut self, size: usize) -> Self {
        self.udp_buffer_size = size;
        if self.max_message_size > max_payload_for(size) {
            self.max_message_size = max_payload_for(size);
        }
        self
    }

    /// Set the maximum payload size (builder pattern).
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the duplicate retention window (builder pattern).
    pub const fn with_seen_ttl(mut self, ttl: Duration) -> Self {
        self.seen_ttl = ttl;
        self
    }

    /// Set the maximum number of remembered ids (builder pattern).
    pub const fn with_seen_max_size(mut self, size: usize) -> Self {
        self.seen_max_size = size;
        self
    }

    /// Set the cleanup sweep interval (builder pattern).
    pub const fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the gossip interval (builder pattern).
    pub const fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Set the periodic push/pull interval (builder pattern).
    ///
    /// `Duration::ZERO` disables periodic push/pull.
    pub const fn with_push_pull_interval(mut self, interval: Duration) -> Self {
        self.push_pull_interval = interval;
        self
    }

    /// Set the push/pull jitter (builder pattern).
    pub const fn with_push_pull_jitter(mut self, jitter: Duration) -> Self {
        self.push_pull_jitter = jitter;
        self
    }

    /// Whether periodic push/pull is enabled.
    pub fn periodic_push_pull(&self) -> bool {
        !self.push_pull_interval.is_zero()
    }

    /// Check the configuration for values that would break the protocol.
    pub fn validate(&self) -> Result<()> {
        if self.node_id > MAX_NODE_ID {
            return Err(Error::Config(format!(
                "node_id {} exceeds maximum {}",
                self.node_id, MAX_NODE_ID
            )));
        }
        if self.retransmit_mult == 0 {
            return Err(Error::Config("retransmit_mult must be at least 1".into()));
        }
        if self.seen_max_size == 0 {
            return Err(Error::Config("seen_max_size must be at least 1".into()));
        }
        if self.seen_ttl.is_zero() {
            return Err(Error::Config("seen_ttl must be non-zero".into()));
        }
        if self.max_message_size > max_payload_for(self.udp_buffer_size) {
            return Err(Error::Config(format!(
                "max_message_size {} does not fit udp_buffer_size {} \
                 ({} header + {} framing bytes)",
                self.max_message_size,
                self.udp_buffer_size,
                HEADER_SIZE,
                FRAME_OVERHEAD_RESERVE
            )));
        }
        Ok(())
    }
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_u64(duration.as_millis() as u64)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            // Simple parsing: expect "Nms" format
            let ms: u64 = s
                .trim_end_matches("ms")
                .parse()
                .map_err(serde::de::Error::custom)?;
            Ok(Duration::from_millis(ms))
        } else {
            let ms = u64::deserialize(deserializer)?;
            Ok(Duration::from_millis(ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GossipConfig::default();
        assert_eq!(config.retransmit_mult, 3);
        assert_eq!(config.udp_buffer_size, 1400);
        assert_eq!(config.max_message_size, 1369);
        assert_eq!(
            config.max_message_size + HEADER_SIZE + FRAME_OVERHEAD_RESERVE,
            config.udp_buffer_size
        );
        assert!(!config.periodic_push_pull());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = GossipConfig::new()
            .with_node_id(9)
            .with_retransmit_mult(5)
            .with_push_pull_interval(Duration::from_secs(15));

        assert_eq!(config.node_id, 9);
        assert_eq!(config.retransmit_mult, 5);
        assert!(config.periodic_push_pull());
    }

    #[test]
    fn test_presets_validate() {
        for config in [GossipConfig::lan(), GossipConfig::wan(), GossipConfig::local()] {
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(GossipConfig::new().with_node_id(2000).validate().is_err());
        assert!(GossipConfig::new().with_retransmit_mult(0).validate().is_err());
        assert!(GossipConfig::new().with_seen_max_size(0).validate().is_err());
        assert!(GossipConfig::new()
            .with_seen_ttl(Duration::ZERO)
            .validate()
            .is_err());
        assert!(GossipConfig::new()
            .with_max_message_size(1390)
            .validate()
            .is_err());
    }

    #[test]
    fn test_smaller_budget_shrinks_max_message_size() {
        let config = GossipConfig::new().with_udp_buffer_size(512);
        assert_eq!(config.max_message_size, 512 - HEADER_SIZE - FRAME_OVERHEAD_RESERVE);
        assert!(config.validate().is_ok());

        // An explicit smaller limit is kept
        let config = GossipConfig::new()
            .with_max_message_size(100)
            .with_udp_buffer_size(512);
        assert_eq!(config.max_message_size, 100);

        // A budget smaller than the framing leaves no room at all
        assert_eq!(GossipConfig::new().with_udp_buffer_size(8).max_message_size, 0);
    }

    #[test]
    fn test_json_round_trip_uses_millis() {
        let config = GossipConfig::new().with_seen_ttl(Duration::from_secs(2));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"seen_ttl\":\"2000ms\""));

        let parsed: GossipConfig = serde_json::from_str(r#"{"node_id": 12, "seen_ttl": "500ms"}"#).unwrap();
        assert_eq!(parsed.node_id, 12);
        assert_eq!(parsed.seen_ttl, Duration::from_millis(500));
        assert_eq!(parsed.retransmit_mult, 3);
    }
}
