//! Core gossip dissemination.
//!
//! [`Gossip`] is the object the membership transport calls into:
//!
//! - [`Gossip::get_broadcasts`] when it has room to piggyback user data
//! - [`Gossip::notify_message`] when a user message arrives
//! - [`Gossip::produce_snapshot`] / [`Gossip::merge_snapshot`] during
//!   push/pull (see [`crate::sync`])
//!
//! and the object the application calls to originate events with
//! [`Gossip::broadcast`].

use bytes::Bytes;
use futures_timer::Delay;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    broadcast::{BroadcastQueue, GossipBroadcast, QueueStats},
    config::GossipConfig,
    error::{Error, Result},
    message::{envelope, DecodeError, IdGenerator, MessageId, SeenCache, SeenCacheStats},
    transport::Membership,
};

#[cfg(feature = "metrics")]
use crate::metrics;

/// Application callbacks invoked by the gossip layer.
///
/// # Important
///
/// Callbacks run synchronously on the transport's receive or push/pull
/// path. **They must return quickly.** Errors (malformed payloads,
/// undecodable snapshots) are the application's to handle; the gossip
/// layer never retries a callback.
#[auto_impl::auto_impl(Box, Arc)]
pub trait GossipDelegate: Send + Sync + 'static {
    /// Called once per novel message, local broadcasts excluded.
    fn on_deliver(&self, message_id: MessageId, payload: Bytes);

    /// Serialize the full replicated state for a push/pull exchange.
    ///
    /// `join` is true when the exchange is part of joining the cluster.
    fn local_state(&self, _join: bool) -> Bytes {
        Bytes::new()
    }

    /// Merge a peer's full state produced by its [`local_state`](Self::local_state).
    fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
}

/// No-op delegate for when no handler is needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl GossipDelegate for NoopDelegate {
    fn on_deliver(&self, _message_id: MessageId, _payload: Bytes) {}
}

/// What happened to an inbound user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// First sighting: delivered to the application and queued for relay.
    Delivered(MessageId),
    /// Already seen; nothing was done.
    Duplicate(MessageId),
    /// Not a gossip envelope (foreign traffic or truncated); dropped.
    Ignored(DecodeError),
}

impl Receipt {
    /// Returns `true` if the message was delivered.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Receipt::Delivered(_))
    }
}

/// Gossip dissemination layer for one node.
///
/// Cheap to clone; clones share all state.
///
/// # Type Parameters
///
/// - `D`: Delegate type receiving delivered messages and providing state
pub struct Gossip<D = NoopDelegate> {
    pub(crate) inner: Arc<GossipInner<D>>,
}

pub(crate) struct GossipInner<D> {
    /// Message id generator for local broadcasts.
    ids: IdGenerator,

    /// Ids already delivered or originated.
    seen: SeenCache,

    /// Broadcasts awaiting piggyback.
    queue: BroadcastQueue<GossipBroadcast>,

    /// Application callbacks.
    pub(crate) delegate: D,

    /// Configuration.
    pub(crate) config: GossipConfig,

    /// Cluster size source.
    membership: Arc<dyn Membership>,

    /// Event counters.
    pub(crate) counters: Counters,

    /// Shutdown flag.
    shutdown: AtomicBool,

    /// Closing this sender wakes every background loop.
    shutdown_tx: async_channel::Sender<()>,

    pub(crate) shutdown_rx: async_channel::Receiver<()>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) broadcasts: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) relayed: AtomicU64,
    pub(crate) piggybacked: AtomicU64,
    pub(crate) push_pulls: AtomicU64,
    pub(crate) push_pull_failures: AtomicU64,
}

impl<D> Gossip<D>
where
    D: GossipDelegate,
{
    /// Create a new gossip instance.
    ///
    /// Fails with [`Error::Config`] if the configuration is invalid or the
    /// id generator cannot be built (node id out of range, clock before
    /// epoch). Such a node must not join the cluster.
    pub fn new(
        config: GossipConfig,
        delegate: D,
        membership: impl Membership,
    ) -> Result<Self> {
        Self::with_shared_membership(config, delegate, Arc::new(membership))
    }

    /// Create a new gossip instance sharing an existing membership handle.
    pub fn with_shared_membership(
        config: GossipConfig,
        delegate: D,
        membership: Arc<dyn Membership>,
    ) -> Result<Self> {
        config.validate()?;
        let ids = IdGenerator::with_epoch(config.node_id, config.epoch_ms)?;
        let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);

        let inner = GossipInner {
            ids,
            seen: SeenCache::new(config.seen_ttl, config.seen_max_size),
            queue: BroadcastQueue::new(config.retransmit_mult, membership.clone()),
            delegate,
            config,
            membership,
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &GossipConfig {
        &self.inner.config
    }

    /// Get the application delegate.
    pub fn delegate(&self) -> &D {
        &self.inner.delegate
    }

    /// Cluster size as currently reported by the membership layer.
    pub fn num_members(&self) -> usize {
        self.inner.membership.num_members()
    }

    /// Broadcast a payload to the cluster.
    ///
    /// The message is queued for piggyback and marked as seen locally, so
    /// copies echoed back by peers are dropped. It is not delivered to the
    /// local delegate.
    ///
    /// Returns the id assigned to the message.
    pub fn broadcast(&self, payload: impl Into<Bytes>) -> Result<MessageId> {
        let (id, msg) = self.prepare(payload.into())?;
        self.inner.queue.enqueue(GossipBroadcast::new(msg));
        Ok(id)
    }

    /// Broadcast a payload and get notified when it leaves the queue.
    ///
    /// The returned receiver is closed once the message has been handed to
    /// the transport its full number of times (or the queue was reset).
    pub fn broadcast_with_notify(
        &self,
        payload: impl Into<Bytes>,
    ) -> Result<(MessageId, async_channel::Receiver<()>)> {
        let (id, msg) = self.prepare(payload.into())?;
        let (tx, rx) = async_channel::bounded(1);
        self.inner
            .queue
            .enqueue(GossipBroadcast::with_notify(msg, tx));
        Ok((id, rx))
    }

    fn prepare(&self, payload: Bytes) -> Result<(MessageId, Bytes)> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }

        if payload.len() > self.inner.config.max_message_size {
            tracing::warn!(
                size = payload.len(),
                max = self.inner.config.max_message_size,
                "rejecting oversized broadcast"
            );
            return Err(Error::MessageTooLarge {
                size: payload.len(),
                max_size: self.inner.config.max_message_size,
            });
        }

        let id = self.inner.ids.next_id();
        let msg = envelope::encode(id, &payload);

        // Own messages count as seen so echoes are suppressed
        self.inner.seen.observe(id);
        self.inner.counters.broadcasts.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::record_broadcast(payload.len());

        tracing::trace!(%id, len = payload.len(), "queued local broadcast");
        Ok((id, msg))
    }

    /// Collect queued messages to piggyback on an outgoing protocol message.
    ///
    /// Each returned message costs its length plus `overhead` against the
    /// `limit` byte budget.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        let msgs = self.inner.queue.drain(overhead, limit);
        if !msgs.is_empty() {
            self.inner
                .counters
                .piggybacked
                .fetch_add(msgs.len() as u64, Ordering::Relaxed);

            #[cfg(feature = "metrics")]
            metrics::record_piggyback_sent(msgs.len());
        }
        msgs
    }

    /// Handle a user message received from the transport.
    ///
    /// Copies `msg`; prefer [`handle_message`](Self::handle_message) when
    /// the bytes are already owned.
    pub fn notify_message(&self, msg: &[u8]) -> Receipt {
        self.handle_message(Bytes::copy_from_slice(msg))
    }

    /// Handle a user message received from the transport.
    ///
    /// Novel messages are delivered to the delegate and re-queued, byte for
    /// byte, for relay to further peers. Duplicates and foreign or
    /// malformed frames are dropped silently.
    pub fn handle_message(&self, msg: Bytes) -> Receipt {
        let env = match envelope::decode(&msg) {
            Ok(env) => env,
            Err(err) => {
                tracing::trace!(len = msg.len(), %err, "dropping non-gossip message");
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "metrics")]
                metrics::record_dropped();

                return Receipt::Ignored(err);
            }
        };

        if !self.inner.seen.observe(env.id) {
            tracing::trace!(id = %env.id, "duplicate message");
            self.inner.counters.duplicates.fetch_add(1, Ordering::Relaxed);

            #[cfg(feature = "metrics")]
            metrics::record_duplicate();

            return Receipt::Duplicate(env.id);
        }

        self.inner.delegate.on_deliver(env.id, env.payload);
        self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        {
            metrics::record_delivery();
            metrics::record_relayed();
        }

        // Relay the original frame with a fresh transmit count
        self.inner.queue.enqueue(GossipBroadcast::new(msg));
        self.inner.counters.relayed.fetch_add(1, Ordering::Relaxed);

        Receipt::Delivered(env.id)
    }

    /// Whether `id` is currently remembered as seen.
    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.inner.seen.contains(id)
    }

    /// Number of broadcasts awaiting piggyback.
    pub fn pending_broadcasts(&self) -> usize {
        self.inner.queue.len()
    }

    /// Current retransmission limit.
    pub fn transmit_limit(&self) -> usize {
        self.inner.queue.transmit_limit()
    }

    /// Drop every pending broadcast.
    pub fn reset_broadcasts(&self) {
        self.inner.queue.reset();
    }

    /// Evict expired ids from the duplicate cache.
    ///
    /// Returns the number of ids removed. Called periodically by
    /// [`run_cleanup`](Self::run_cleanup).
    pub fn cleanup_seen(&self) -> usize {
        let removed = self.inner.seen.evict_expired();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.inner.seen.len(), "evicted expired message ids");
        }

        #[cfg(feature = "metrics")]
        {
            metrics::record_seen_map_evictions(removed);
            metrics::set_seen_map_size(self.inner.seen.len());
        }

        removed
    }

    /// Run the duplicate-cache cleanup loop until shutdown.
    ///
    /// This should be spawned as a background task.
    pub async fn run_cleanup(&self) {
        use futures::future::FutureExt;

        let interval = self.inner.config.cleanup_interval;
        let mut delay = Delay::new(interval);
        tracing::info!(?interval, "seen cache cleanup started");

        loop {
            let shutdown_recv = self.inner.shutdown_rx.recv().fuse();
            futures::pin_mut!(shutdown_recv);

            futures::select! {
                _ = (&mut delay).fuse() => {
                    delay.reset(interval);
                }
                _ = shutdown_recv => {
                    break;
                }
            }

            if self.is_shutdown() {
                break;
            }

            self.cleanup_seen();
        }

        tracing::info!("seen cache cleanup stopped");
    }

    /// Shutdown the gossip instance.
    ///
    /// Stops background loops and rejects further broadcasts. Pending
    /// broadcasts stay available to `get_broadcasts` so the transport can
    /// flush them.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.shutdown_tx.close();
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Snapshot of counters and structure sizes.
    pub fn stats(&self) -> GossipStats {
        let counters = &self.inner.counters;
        GossipStats {
            broadcasts: counters.broadcasts.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            duplicates: counters.duplicates.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            relayed: counters.relayed.load(Ordering::Relaxed),
            piggybacked: counters.piggybacked.load(Ordering::Relaxed),
            push_pulls: counters.push_pulls.load(Ordering::Relaxed),
            push_pull_failures: counters.push_pull_failures.load(Ordering::Relaxed),
            queue: self.inner.queue.stats(),
            seen: self.inner.seen.stats(),
        }
    }
}

impl<D> Clone for Gossip<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D> fmt::Debug for Gossip<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gossip")
            .field("node_id", &self.inner.config.node_id)
            .field("queue", &self.inner.queue)
            .field("shutdown", &self.inner.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

/// Counters and sizes for one gossip instance.
#[derive(Debug, Clone, Copy)]
pub struct GossipStats {
    /// Broadcasts originated locally.
    pub broadcasts: u64,
    /// Messages delivered to the delegate.
    pub delivered: u64,
    /// Duplicate messages suppressed.
    pub duplicates: u64,
    /// Inbound frames that were not gossip envelopes.
    pub dropped: u64,
    /// Received messages queued for relay.
    pub relayed: u64,
    /// Messages handed to the transport for piggyback.
    pub piggybacked: u64,
    /// Completed push/pull exchanges.
    pub push_pulls: u64,
    /// Failed push/pull exchanges.
    pub push_pull_failures: u64,
    /// Broadcast queue statistics.
    pub queue: QueueStats,
    /// Duplicate cache statistics.
    pub seen: SeenCacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StaticMembership;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct TestDelegate {
        delivered: Mutex<Vec<(MessageId, Bytes)>>,
    }

    impl TestDelegate {
        fn delivered_count(&self) -> usize {
            self.delivered.lock().len()
        }
    }

    impl GossipDelegate for TestDelegate {
        fn on_deliver(&self, message_id: MessageId, payload: Bytes) {
            self.delivered.lock().push((message_id, payload));
        }
    }

    fn node(node_id: u16, members: usize) -> (Gossip<Arc<TestDelegate>>, Arc<TestDelegate>) {
        let delegate = Arc::new(TestDelegate::default());
        let gossip = Gossip::new(
            GossipConfig::default().with_node_id(node_id),
            delegate.clone(),
            StaticMembership::new(members),
        )
        .unwrap();
        (gossip, delegate)
    }

    #[test]
    fn test_broadcast() {
        let (gossip, delegate) = node(1, 2);

        let id = gossip.broadcast(Bytes::from_static(b"hello")).unwrap();

        assert!(gossip.has_seen(&id));
        assert_eq!(gossip.pending_broadcasts(), 1);
        // Local broadcasts are not delivered to self
        assert_eq!(delegate.delivered_count(), 0);
    }

    #[test]
    fn test_handle_message() {
        let (a, _) = node(1, 2);
        let (b, delegate) = node(2, 2);

        let id = a.broadcast("test message").unwrap();
        let msgs = a.get_broadcasts(10, 1400);
        assert_eq!(msgs.len(), 1);

        assert_eq!(b.handle_message(msgs[0].clone()), Receipt::Delivered(id));
        assert_eq!(delegate.delivered_count(), 1);
        assert_eq!(delegate.delivered.lock()[0].1.as_ref(), b"test message");

        // Relayed with the same bytes
        assert_eq!(b.get_broadcasts(10, 1400), msgs);
    }

    #[test]
    fn test_duplicate_detection() {
        let (a, _) = node(1, 2);
        let (b, delegate) = node(2, 2);

        a.broadcast("dup").unwrap();
        let msg = a.get_broadcasts(0, 1400).remove(0);

        for _ in 0..5 {
            b.notify_message(&msg);
        }

        assert_eq!(delegate.delivered_count(), 1);
        assert_eq!(b.stats().duplicates, 4);
        assert_eq!(b.stats().relayed, 1);
        assert_eq!(b.pending_broadcasts(), 1);
    }

    #[test]
    fn test_echo_suppressed() {
        let (a, delegate) = node(1, 2);

        a.broadcast("echo").unwrap();
        let msg = a.get_broadcasts(0, 1400).remove(0);

        assert!(matches!(a.handle_message(msg), Receipt::Duplicate(_)));
        assert_eq!(delegate.delivered_count(), 0);
    }

    #[test]
    fn test_foreign_traffic_ignored() {
        let (gossip, delegate) = node(1, 2);

        let receipt = gossip.notify_message(b"some other protocol frame");
        assert_eq!(receipt, Receipt::Ignored(DecodeError::NotGossip));

        let receipt = gossip.notify_message(b"mgossip");
        assert!(matches!(receipt, Receipt::Ignored(DecodeError::Truncated { .. })));

        assert_eq!(delegate.delivered_count(), 0);
        assert_eq!(gossip.pending_broadcasts(), 0);
        assert_eq!(gossip.stats().dropped, 2);
    }

    #[test]
    fn test_message_too_large() {
        let (gossip, _) = node(1, 2);
        let size = gossip.config().max_message_size + 1;

        let err = gossip.broadcast(vec![0u8; size]).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));
        assert_eq!(gossip.pending_broadcasts(), 0);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let result = Gossip::new(
            GossipConfig::default().with_node_id(4096),
            NoopDelegate,
            StaticMembership::new(1),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_broadcast_after_shutdown() {
        let (gossip, _) = node(1, 2);
        gossip.shutdown();
        assert!(matches!(gossip.broadcast("late"), Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_broadcast_with_notify() {
        let (gossip, _) = node(1, 1);
        let (_, done) = gossip.broadcast_with_notify("tracked").unwrap();

        let limit = gossip.transmit_limit();
        for _ in 0..limit {
            assert!(!done.is_closed());
            assert_eq!(gossip.get_broadcasts(0, 1400).len(), 1);
        }

        assert!(done.recv().await.is_err());
        assert!(gossip.get_broadcasts(0, 1400).is_empty());
    }

    #[tokio::test]
    async fn test_max_size_broadcast_drains_with_framing_overhead() {
        let (gossip, _) = node(1, 4);
        let config = gossip.config().clone();
        let payload = vec![0xabu8; config.max_message_size];
        let (_, done) = gossip.broadcast_with_notify(payload).unwrap();

        let overhead = crate::config::FRAME_OVERHEAD_RESERVE;
        for _ in 0..gossip.transmit_limit() {
            let msgs = gossip.get_broadcasts(overhead, config.udp_buffer_size);
            assert_eq!(msgs.len(), 1);
            assert!(msgs[0].len() + overhead <= config.udp_buffer_size);
        }

        assert_eq!(gossip.pending_broadcasts(), 0);
        tokio::time::timeout(Duration::from_secs(1), done.recv())
            .await
            .expect("completion never signalled")
            .unwrap_err();
    }

    #[test]
    fn test_replay_after_seen_size_limit_is_duplicate() {
        let (a, _) = node(1, 2);
        let delegate = Arc::new(TestDelegate::default());
        let b = Gossip::new(
            GossipConfig::default().with_node_id(2).with_seen_max_size(2),
            delegate.clone(),
            StaticMembership::new(2),
        )
        .unwrap();

        for i in 0..3 {
            a.broadcast(format!("event-{i}")).unwrap();
        }
        let frames = a.get_broadcasts(0, 1400);
        assert_eq!(frames.len(), 3);

        for frame in &frames {
            assert!(b.handle_message(frame.clone()).is_delivered());
        }
        // Two of them arrive again while still inside seen_ttl
        for frame in &frames[..2] {
            assert!(matches!(b.handle_message(frame.clone()), Receipt::Duplicate(_)));
        }

        assert_eq!(delegate.delivered_count(), 3);
        assert_eq!(b.stats().seen.entries, 3);
        assert_eq!(b.stats().seen.over_capacity, 1);
    }

    #[test]
    fn test_concurrent_receive_and_drain() {
        let (a, _) = node(1, 10);
        let (b, delegate) = node(2, 10);

        let ids: Vec<_> = (0..64)
            .map(|i| a.broadcast(format!("concurrent-{i}")).unwrap())
            .collect();
        let frames = a.get_broadcasts(0, usize::MAX);
        assert_eq!(frames.len(), ids.len());

        let receiving = AtomicBool::new(true);
        let drained = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            let receivers: Vec<_> = (0..4)
                .map(|t| {
                    let (b, frames) = (&b, &frames);
                    scope.spawn(move || {
                        // Each receiver walks the frames from a different offset
                        for i in 0..frames.len() {
                            b.handle_message(frames[(i + t * 16) % frames.len()].clone());
                        }
                    })
                })
                .collect();

            for _ in 0..2 {
                let (b, receiving, drained) = (&b, &receiving, &drained);
                scope.spawn(move || {
                    while receiving.load(Ordering::Acquire) {
                        let msgs = b.get_broadcasts(2, 300);
                        drained.lock().extend(msgs);
                        std::thread::yield_now();
                    }
                });
            }

            for receiver in receivers {
                receiver.join().unwrap();
            }
            receiving.store(false, Ordering::Release);
        });

        let mut drained = drained.into_inner();
        while b.pending_broadcasts() > 0 {
            drained.extend(b.get_broadcasts(2, 1400));
        }

        // Each id delivered once and relayed exactly transmit_limit times
        assert_eq!(delegate.delivered_count(), ids.len());
        let delivered: std::collections::HashSet<_> =
            delegate.delivered.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(delivered.len(), ids.len());

        let limit = b.transmit_limit();
        let mut per_id = std::collections::HashMap::new();
        for msg in &drained {
            *per_id.entry(envelope::decode(msg).unwrap().id).or_insert(0) += 1;
        }
        assert_eq!(per_id.len(), ids.len());
        assert!(per_id.values().all(|&n| n == limit));
        assert_eq!(b.stats().relayed, ids.len() as u64);
        assert_eq!(b.stats().duplicates, 3 * ids.len() as u64);
    }

    #[tokio::test]
    async fn test_cleanup_loop_stops_on_shutdown() {
        let delegate = Arc::new(TestDelegate::default());
        let gossip = Gossip::new(
            GossipConfig::default()
                .with_seen_ttl(Duration::from_millis(20))
                .with_cleanup_interval(Duration::from_millis(10)),
            delegate,
            StaticMembership::new(1),
        )
        .unwrap();

        let id = gossip.broadcast("short lived").unwrap();
        let task = tokio::spawn({
            let gossip = gossip.clone();
            async move { gossip.run_cleanup().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!gossip.has_seen(&id));
        assert_eq!(gossip.stats().seen.entries, 0);

        gossip.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cleanup loop did not stop")
            .unwrap();
    }
}
