//! In-process cluster for testing dissemination.
//!
//! [`LocalCluster`] wires N [`Gossip`] instances together without a
//! network. Each call to [`LocalCluster::gossip_round`] plays the part of
//! the membership transport's gossip timer: every node drains its queue
//! once per randomly chosen peer and the drained messages are handed to
//! that peer's receive path.
//!
//! ## Features
//!
//! - **Message Loss**: Randomly drop messages with configurable probability
//! - **Network Partitions**: Block delivery between pairs of nodes
//! - **Push/Pull**: Full-state exchange between any two nodes, directly or
//!   through [`LocalPushPull`] for use with [`AntiEntropy`](crate::AntiEntropy)
//!
//! ## Example
//!
//! ```ignore
//! use memberlist_mgossip::{testing::{ChaosConfig, LocalCluster}, GossipConfig, NoopDelegate};
//!
//! let cluster = LocalCluster::new(8, GossipConfig::local(), |_| NoopDelegate)?
//!     .with_chaos(ChaosConfig::new().with_message_loss_rate(0.1));
//!
//! cluster.node(0).broadcast("hello")?;
//! cluster.run_until_quiet(50);
//! ```

use std::{
    collections::HashSet,
    convert::Infallible,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use parking_lot::RwLock;
use rand::{seq::SliceRandom, Rng};

use crate::{
    config::GossipConfig,
    error::{Error, Result},
    gossip::{Gossip, GossipDelegate},
    message::MAX_NODE_ID,
    transport::{PushPullTransport, StaticMembership},
};

/// Configuration for chaos testing.
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    /// Probability of dropping a message (0.0 to 1.0).
    pub message_loss_rate: f64,
}

impl ChaosConfig {
    /// Create a new chaos configuration with defaults (no chaos).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message loss rate (0.0 to 1.0).
    pub fn with_message_loss_rate(mut self, rate: f64) -> Self {
        self.message_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Check if a message should be dropped based on loss rate.
    pub fn should_drop(&self) -> bool {
        if self.message_loss_rate == 0.0 {
            return false;
        }
        rand::rng().random::<f64>() < self.message_loss_rate
    }
}

/// Network partition simulator.
///
/// Partitions are symmetric: blocking `a -> b` also blocks `b -> a`.
#[derive(Debug, Default)]
pub struct NetworkPartition {
    partitioned: RwLock<HashSet<(usize, usize)>>,
}

impl NetworkPartition {
    /// Create a partition controller with every link up.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block traffic between two nodes.
    pub fn partition(&self, node_a: usize, node_b: usize) {
        let mut partitioned = self.partitioned.write();
        partitioned.insert((node_a, node_b));
        partitioned.insert((node_b, node_a));
    }

    /// Cut `node` off from every node in `others`.
    pub fn isolate(&self, node: usize, others: impl IntoIterator<Item = usize>) {
        for other in others {
            if other != node {
                self.partition(node, other);
            }
        }
    }

    /// Restore every link.
    pub fn heal_all(&self) {
        self.partitioned.write().clear();
    }

    /// Check if traffic from `from` to `to` is blocked.
    pub fn is_partitioned(&self, from: usize, to: usize) -> bool {
        self.partitioned.read().contains(&(from, to))
    }
}

/// Outcome of one [`LocalCluster::gossip_round`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    /// Messages drained from queues.
    pub sent: usize,
    /// Messages that reached the peer and were novel there.
    pub delivered: usize,
    /// Messages that reached the peer as duplicates.
    pub duplicates: usize,
    /// Messages lost to chaos or partitions.
    pub dropped: usize,
}

/// N gossip nodes connected in memory.
pub struct LocalCluster<D> {
    nodes: Vec<Gossip<D>>,
    membership: StaticMembership,
    chaos: ChaosConfig,
    partition: NetworkPartition,
    rounds: AtomicU64,
}

impl<D: GossipDelegate> LocalCluster<D> {
    /// Create `size` nodes sharing `config`.
    ///
    /// Node `i` gets node id `i + 1` and the delegate returned by
    /// `make_delegate(i)`. Fails with [`Error::Config`] if `size` exceeds
    /// [`MAX_NODE_ID`], since node ids would then collide.
    pub fn new(
        size: usize,
        config: GossipConfig,
        mut make_delegate: impl FnMut(usize) -> D,
    ) -> Result<Self> {
        if size > MAX_NODE_ID as usize {
            return Err(Error::Config(format!(
                "cluster of {} nodes exceeds {} distinct node ids",
                size, MAX_NODE_ID
            )));
        }

        let membership = StaticMembership::new(size);
        let nodes = (0..size)
            .map(|i| {
                let node_id = u16::try_from(i + 1)
                    .map_err(|_| Error::Config(format!("node index {} out of range", i)))?;
                Gossip::new(
                    config.clone().with_node_id(node_id),
                    make_delegate(i),
                    membership.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            nodes,
            membership,
            chaos: ChaosConfig::default(),
            partition: NetworkPartition::new(),
            rounds: AtomicU64::new(0),
        })
    }

    /// Apply a chaos configuration (builder pattern).
    pub fn with_chaos(mut self, chaos: ChaosConfig) -> Self {
        self.chaos = chaos;
        self
    }

    /// Get node `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn node(&self, index: usize) -> &Gossip<D> {
        &self.nodes[index]
    }

    /// All nodes.
    pub fn nodes(&self) -> &[Gossip<D>] {
        &self.nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Shared membership view; change it to simulate a stale cluster size.
    pub fn membership(&self) -> &StaticMembership {
        &self.membership
    }

    /// Partition controller.
    pub fn partition(&self) -> &NetworkPartition {
        &self.partition
    }

    /// Number of rounds run so far.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Run one gossip interval across the cluster.
    pub fn gossip_round(&self) -> RoundStats {
        let mut stats = RoundStats::default();
        let mut rng = rand::rng();

        for (from, node) in self.nodes.iter().enumerate() {
            let config = node.config();
            let mut peers: Vec<usize> = (0..self.nodes.len()).filter(|&i| i != from).collect();
            peers.shuffle(&mut rng);
            peers.truncate(config.gossip_nodes);

            for to in peers {
                let msgs = node.get_broadcasts(0, config.udp_buffer_size);
                for msg in msgs {
                    stats.sent += 1;
                    if self.partition.is_partitioned(from, to) || self.chaos.should_drop() {
                        stats.dropped += 1;
                        continue;
                    }
                    if self.nodes[to].handle_message(msg).is_delivered() {
                        stats.delivered += 1;
                    } else {
                        stats.duplicates += 1;
                    }
                }
            }
        }

        self.rounds.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(?stats, "gossip round complete");
        stats
    }

    /// Run rounds until every queue is empty or `max_rounds` have run.
    ///
    /// Returns the number of rounds run.
    pub fn run_until_quiet(&self, max_rounds: usize) -> usize {
        for round in 0..max_rounds {
            if self.is_quiet() {
                return round;
            }
            self.gossip_round();
        }
        max_rounds
    }

    /// Check if no node has pending broadcasts.
    pub fn is_quiet(&self) -> bool {
        self.nodes.iter().all(|n| n.pending_broadcasts() == 0)
    }

    /// Exchange full state between two nodes.
    pub fn push_pull(&self, a: usize, b: usize) {
        let (a, b) = (&self.nodes[a], &self.nodes[b]);
        let state_a = a.produce_snapshot(false);
        let state_b = b.produce_snapshot(false);
        b.merge_snapshot(&state_a, false);
        a.merge_snapshot(&state_b, false);
    }

    /// A push/pull transport whose peer is node `index`.
    pub fn push_pull_transport(&self, index: usize) -> LocalPushPull<D> {
        LocalPushPull {
            peer: self.nodes[index].clone(),
        }
    }

    /// Shutdown every node.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

/// In-memory [`PushPullTransport`] that exchanges state with one node.
pub struct LocalPushPull<D> {
    peer: Gossip<D>,
}

impl<D: GossipDelegate> PushPullTransport for LocalPushPull<D> {
    type Error = Infallible;

    async fn push_pull(&self, local_state: Bytes, join: bool) -> std::result::Result<Bytes, Self::Error> {
        let reply = self.peer.produce_snapshot(join);
        self.peer.merge_snapshot(&local_state, join);
        Ok(reply)
    }
}
