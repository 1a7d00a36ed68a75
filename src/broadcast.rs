//! Transmit-limited queue of pending broadcasts.
//!
//! Every queued broadcast is piggybacked on outgoing protocol traffic a
//! bounded number of times, least-transmitted first, then retired. The
//! bound scales with `log10` of the cluster size, since epidemic spread
//! reaches every node in a logarithmic number of rounds.
//!
//! ```text
//!   enqueue ──► [ transmits=0 | transmits=0 | transmits=1 | transmits=2 ]
//!                  newest ...................................... oldest
//!   drain(overhead, limit): take from the left while the budget allows,
//!   bump each taken entry, retire entries that reached the limit
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::{cmp::Reverse, collections::BTreeMap, fmt, sync::Arc};

use crate::transport::Membership;

#[cfg(feature = "metrics")]
use crate::metrics;

/// A message waiting in the [`BroadcastQueue`].
pub trait Broadcast: Send + Sync + 'static {
    /// Encoded bytes handed to the transport.
    fn message(&self) -> &Bytes;

    /// Whether this broadcast supersedes `other`.
    ///
    /// When a newly queued broadcast invalidates a queued one, the older
    /// one is retired without further transmission.
    fn invalidates(&self, _other: &Self) -> bool {
        false
    }

    /// Called exactly once when the broadcast leaves the queue, whether by
    /// reaching its retransmission limit, invalidation, pruning or reset.
    fn finished(self)
    where
        Self: Sized,
    {
    }
}

/// The broadcast type used for gossip envelopes.
///
/// Gossip messages are independent events, so they never invalidate each
/// other. An optional completion channel is closed once the message has
/// been transmitted its full number of times.
pub struct GossipBroadcast {
    msg: Bytes,
    notify: Option<async_channel::Sender<()>>,
}

impl GossipBroadcast {
    /// Create a broadcast without completion notification.
    pub fn new(msg: Bytes) -> Self {
        Self { msg, notify: None }
    }

    /// Create a broadcast that closes `notify` when it is retired.
    pub fn with_notify(msg: Bytes, notify: async_channel::Sender<()>) -> Self {
        Self {
            msg,
            notify: Some(notify),
        }
    }
}

impl fmt::Debug for GossipBroadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossipBroadcast")
            .field("len", &self.msg.len())
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

impl Broadcast for GossipBroadcast {
    fn message(&self) -> &Bytes {
        &self.msg
    }

    fn finished(self) {
        if let Some(notify) = self.notify {
            notify.close();
        }
    }
}

/// Number of times a broadcast is transmitted before it is retired.
///
/// `retransmit_mult * ceil(log10(num_members + 1))`, never below 1.
pub fn retransmit_limit(retransmit_mult: usize, num_members: usize) -> usize {
    let node_scale = ((num_members + 1) as f64).log10().ceil() as usize;
    (retransmit_mult * node_scale).max(1)
}

/// Ordering key: fewest transmissions first, newest first among equals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    transmits: usize,
    seq: Reverse<u64>,
}

struct QueueInner<B> {
    items: BTreeMap<QueueKey, B>,
    next_seq: u64,
}

/// Thread-safe queue of broadcasts awaiting piggyback.
///
/// All operations take one short-lived lock; `finished` callbacks run
/// after it is released.
pub struct BroadcastQueue<B = GossipBroadcast> {
    inner: Mutex<QueueInner<B>>,
    retransmit_mult: usize,
    membership: Arc<dyn Membership>,
}

impl<B: Broadcast> BroadcastQueue<B> {
    /// Create a queue whose retransmission limit follows `membership`.
    pub fn new(retransmit_mult: usize, membership: Arc<dyn Membership>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: BTreeMap::new(),
                next_seq: 0,
            }),
            retransmit_mult,
            membership,
        }
    }

    /// Current retransmission limit for the observed cluster size.
    pub fn transmit_limit(&self) -> usize {
        retransmit_limit(self.retransmit_mult, self.membership.num_members())
    }

    /// Add a broadcast with a transmit count of zero.
    ///
    /// Queued broadcasts invalidated by the new one are retired first.
    pub fn enqueue(&self, broadcast: B) {
        let retired = {
            let mut inner = self.inner.lock();

            let stale: Vec<QueueKey> = inner
                .items
                .iter()
                .filter(|(_, queued)| broadcast.invalidates(queued))
                .map(|(key, _)| *key)
                .collect();
            let retired: Vec<B> = stale
                .iter()
                .filter_map(|key| inner.items.remove(key))
                .collect();

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.items.insert(
                QueueKey {
                    transmits: 0,
                    seq: Reverse(seq),
                },
                broadcast,
            );

            #[cfg(feature = "metrics")]
            metrics::set_queue_depth(inner.items.len());

            retired
        };

        self.finish_all(retired, "invalidated");
    }

    /// Select broadcasts for one outgoing protocol message.
    ///
    /// Each selected message costs its length plus `overhead`, and the
    /// total stays within `limit`. Messages that do not fit are left for a
    /// later call. Selected messages have their transmit count bumped, and
    /// those reaching the retransmission limit are retired.
    pub fn drain(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        let transmit_limit = self.transmit_limit();

        let (selected, retired) = {
            let mut inner = self.inner.lock();
            if inner.items.is_empty() {
                return Vec::new();
            }

            let mut used = 0;
            let mut selected = Vec::new();
            let mut keys = Vec::new();

            for (key, broadcast) in inner.items.iter() {
                let remaining = limit.saturating_sub(used);
                if remaining <= overhead {
                    break;
                }
                let cost = overhead + broadcast.message().len();
                if cost > remaining {
                    continue;
                }
                used += cost;
                selected.push(broadcast.message().clone());
                keys.push(*key);
            }

            let mut retired = Vec::new();
            for key in keys {
                let Some(broadcast) = inner.items.remove(&key) else {
                    continue;
                };
                let transmits = key.transmits + 1;
                if transmits >= transmit_limit {
                    retired.push(broadcast);
                } else {
                    inner.items.insert(
                        QueueKey {
                            transmits,
                            seq: key.seq,
                        },
                        broadcast,
                    );
                }
            }

            #[cfg(feature = "metrics")]
            metrics::set_queue_depth(inner.items.len());

            (selected, retired)
        };

        self.finish_all(retired, "transmit limit reached");
        selected
    }

    /// Retire every queued broadcast matching `predicate`.
    ///
    /// Returns the number of broadcasts retired.
    pub fn invalidate<F>(&self, predicate: F) -> usize
    where
        F: Fn(&B) -> bool,
    {
        let retired = {
            let mut inner = self.inner.lock();
            let stale: Vec<QueueKey> = inner
                .items
                .iter()
                .filter(|(_, queued)| predicate(queued))
                .map(|(key, _)| *key)
                .collect();
            stale
                .iter()
                .filter_map(|key| inner.items.remove(key))
                .collect::<Vec<_>>()
        };

        let count = retired.len();
        self.finish_all(retired, "invalidated");
        count
    }

    /// Keep at most `max_retain` broadcasts, retiring the most-transmitted.
    pub fn prune(&self, max_retain: usize) -> usize {
        let retired = {
            let mut inner = self.inner.lock();
            let mut retired = Vec::new();
            while inner.items.len() > max_retain {
                match inner.items.pop_last() {
                    Some((_, broadcast)) => retired.push(broadcast),
                    None => break,
                }
            }
            retired
        };

        let count = retired.len();
        self.finish_all(retired, "pruned");
        count
    }

    /// Retire everything.
    pub fn reset(&self) {
        let retired: Vec<B> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.items).into_values().collect()
        };
        self.finish_all(retired, "reset");
    }

    /// Number of pending broadcasts.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Get queue statistics.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            pending: inner.items.len(),
            pending_bytes: inner.items.values().map(|b| b.message().len()).sum(),
            max_transmits: inner
                .items
                .keys()
                .next_back()
                .map(|key| key.transmits)
                .unwrap_or(0),
            transmit_limit: retransmit_limit(self.retransmit_mult, self.membership.num_members()),
        }
    }

    fn finish_all(&self, retired: Vec<B>, reason: &str) {
        if retired.is_empty() {
            return;
        }
        tracing::debug!(count = retired.len(), reason, "retiring broadcasts");

        #[cfg(feature = "metrics")]
        metrics::record_retired(retired.len());

        for broadcast in retired {
            broadcast.finished();
        }
    }
}

impl<B> fmt::Debug for BroadcastQueue<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastQueue")
            .field("pending", &self.inner.lock().items.len())
            .field("retransmit_mult", &self.retransmit_mult)
            .finish()
    }
}

/// Statistics about the broadcast queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Broadcasts still waiting for transmission.
    pub pending: usize,
    /// Total encoded size of pending broadcasts.
    pub pending_bytes: usize,
    /// Highest transmit count among pending broadcasts.
    pub max_transmits: usize,
    /// Retransmission limit for the current cluster size.
    pub transmit_limit: usize,
}
