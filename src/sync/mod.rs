//! Anti-entropy: full-state push/pull.
//!
//! Gossip is best-effort. A node that joins late, or that missed messages
//! whose ids have since expired everywhere, is repaired by exchanging full
//! application state with a peer:
//!
//! ```text
//! Node A                                   Node B
//! ──────                                   ──────
//! produce_snapshot(join) ───── A state ───▶ merge_snapshot(A state)
//! merge_snapshot(B state) ◀─── B state ──── produce_snapshot(join)
//! ```
//!
//! The snapshot is opaque to this layer. Merge policy belongs to the
//! application's [`GossipDelegate`]; the reference policy (see
//! [`KvDelegate`](crate::kv::KvDelegate)) lets peer entries overwrite local
//! ones, so concurrent writes to one key converge on whichever snapshot was
//! merged last.
//!
//! Exchanges always run on join. Periodic exchanges are opt-in through
//! [`GossipConfig::push_pull_interval`](crate::GossipConfig::push_pull_interval).

use bytes::Bytes;
use futures_timer::Delay;
use rand::Rng;
use std::{sync::atomic::Ordering, time::Duration};

use crate::{
    error::{Error, Result},
    gossip::{Gossip, GossipDelegate},
    transport::PushPullTransport,
};

#[cfg(feature = "metrics")]
use crate::metrics;

impl<D> Gossip<D>
where
    D: GossipDelegate,
{
    /// Serialize local state for a push/pull exchange.
    pub fn produce_snapshot(&self, join: bool) -> Bytes {
        let snapshot = self.inner.delegate.local_state(join);
        tracing::trace!(len = snapshot.len(), join, "produced snapshot");

        #[cfg(feature = "metrics")]
        metrics::record_snapshot_size(snapshot.len());

        snapshot
    }

    /// Merge a peer's snapshot into local state.
    ///
    /// Empty snapshots are skipped.
    pub fn merge_snapshot(&self, buf: &[u8], join: bool) {
        if buf.is_empty() {
            return;
        }
        tracing::trace!(len = buf.len(), join, "merging remote snapshot");

        #[cfg(feature = "metrics")]
        metrics::record_snapshot_size(buf.len());

        self.inner.delegate.merge_remote_state(buf, join);
    }
}

/// Drives push/pull exchanges for one [`Gossip`] instance.
pub struct AntiEntropy<D, T> {
    gossip: Gossip<D>,
    transport: T,
}

impl<D, T> AntiEntropy<D, T>
where
    D: GossipDelegate,
    T: PushPullTransport,
{
    /// Create a new anti-entropy driver.
    pub fn new(gossip: Gossip<D>, transport: T) -> Self {
        Self { gossip, transport }
    }

    /// Get the gossip instance.
    pub fn gossip(&self) -> &Gossip<D> {
        &self.gossip
    }

    /// Run one exchange: send our snapshot, merge the peer's reply.
    pub async fn exchange(&self, join: bool) -> Result<()> {
        if self.gossip.is_shutdown() {
            return Err(Error::Shutdown);
        }

        let local = self.gossip.produce_snapshot(join);
        let counters = &self.gossip.inner.counters;

        match self.transport.push_pull(local, join).await {
            Ok(remote) => {
                self.gossip.merge_snapshot(&remote, join);
                counters.push_pulls.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "metrics")]
                metrics::record_push_pull(true);

                Ok(())
            }
            Err(e) => {
                counters.push_pull_failures.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "metrics")]
                metrics::record_push_pull(false);

                Err(Error::Transport(e.to_string()))
            }
        }
    }

    /// Join-time exchange.
    pub async fn join(&self) -> Result<()> {
        self.exchange(true).await
    }

    /// Run periodic exchanges until shutdown.
    ///
    /// Returns immediately if periodic push/pull is disabled. Failed
    /// exchanges are logged and retried on the next interval.
    ///
    /// This should be spawned as a background task.
    pub async fn run(&self) {
        use futures::future::FutureExt;

        let config = self.gossip.config();
        if !config.periodic_push_pull() {
            tracing::info!("periodic push/pull disabled");
            return;
        }

        let interval = config.push_pull_interval;
        let jitter = config.push_pull_jitter;
        let mut delay = Delay::new(next_delay(interval, jitter));
        tracing::info!(?interval, ?jitter, "anti-entropy started");

        loop {
            let shutdown_recv = self.gossip.inner.shutdown_rx.recv().fuse();
            futures::pin_mut!(shutdown_recv);

            futures::select! {
                _ = (&mut delay).fuse() => {
                    delay.reset(next_delay(interval, jitter));
                }
                _ = shutdown_recv => {
                    break;
                }
            }

            if self.gossip.is_shutdown() {
                break;
            }

            if let Err(e) = self.exchange(false).await {
                tracing::warn!(error = %e, "push/pull failed");
            }
        }

        tracing::info!("anti-entropy stopped");
    }
}

fn next_delay(interval: Duration, jitter: Duration) -> Duration {
    let max = jitter.as_millis() as u64;
    if max == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::rng().random_range(0..=max))
}
