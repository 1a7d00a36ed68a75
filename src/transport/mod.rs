//! Boundary with the external membership and transport layer.
//!
//! The gossip layer never opens sockets. The membership protocol that
//! hosts it supplies two things:
//!
//! - a (possibly stale) view of the cluster size, used to scale the
//!   retransmission limit: [`Membership`]
//! - a request/response channel to some live peer for full-state
//!   push/pull exchanges: [`PushPullTransport`]
//!
//! Piggyback requests and inbound user messages are plain method calls on
//! [`Gossip`](crate::Gossip) made by the transport itself.

use bytes::Bytes;
use std::future::Future;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Source of the current cluster size.
///
/// The value is read on every piggyback request and may lag the real
/// membership; it is never treated as authoritative.
#[auto_impl::auto_impl(Box, Arc)]
pub trait Membership: Send + Sync + 'static {
    /// Number of live members, including the local node.
    fn num_members(&self) -> usize;
}

/// Cluster size held in an atomic, updated by whoever tracks membership.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    members: Arc<AtomicUsize>,
}

impl StaticMembership {
    /// Create a membership view with a fixed initial size.
    pub fn new(members: usize) -> Self {
        Self {
            members: Arc::new(AtomicUsize::new(members)),
        }
    }

    /// Update the cluster size.
    pub fn set(&self, members: usize) {
        self.members.store(members, Ordering::Release);
    }
}

impl Membership for StaticMembership {
    fn num_members(&self) -> usize {
        self.members.load(Ordering::Acquire)
    }
}

/// Adapts a closure (typically `|| memberlist.num_members()`) into a
/// [`Membership`].
#[derive(Clone)]
pub struct MembershipFn<F>(pub F);

impl<F> Membership for MembershipFn<F>
where
    F: Fn() -> usize + Send + Sync + 'static,
{
    fn num_members(&self) -> usize {
        (self.0)()
    }
}

impl<F> std::fmt::Debug for MembershipFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipFn").finish_non_exhaustive()
    }
}

/// Full-state exchange with one peer chosen by the transport.
///
/// # Example
///
/// ```ignore
/// use memberlist_mgossip::PushPullTransport;
///
/// struct TcpPushPull {
///     memberlist: Memberlist,
/// }
///
/// impl PushPullTransport for TcpPushPull {
///     type Error = std::io::Error;
///
///     async fn push_pull(&self, local_state: Bytes, join: bool) -> Result<Bytes, Self::Error> {
///         // Open a stream to a random member, send our state, read theirs
///         self.memberlist.push_pull_random(local_state, join).await
///     }
/// }
/// ```
#[auto_impl::auto_impl(Box, Arc)]
pub trait PushPullTransport: Send + Sync + 'static {
    /// Error type for exchange failures.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send our full state to a peer and return the peer's full state.
    fn push_pull(
        &self,
        local_state: Bytes,
        join: bool,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;
}

/// A push/pull transport with no peers; every exchange returns empty state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPushPull;

impl PushPullTransport for NoopPushPull {
    type Error = std::convert::Infallible;

    async fn push_pull(&self, _local_state: Bytes, _join: bool) -> Result<Bytes, Self::Error> {
        Ok(Bytes::new())
    }
}
