//! Integration tests for gossip dissemination.
//!
//! These tests drive nodes through the public API the way a membership
//! transport would: draining piggyback messages, handing them to peers,
//! and exchanging full state.

use bytes::Bytes;
use memberlist_mgossip::{
    envelope, retransmit_limit,
    testing::{ChaosConfig, LocalCluster},
    Gossip, GossipConfig, GossipDelegate, MessageId, Receipt, StaticMembership,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Wrapper type to allow implementing GossipDelegate for Arc-wrapped TestDelegateInner.
#[derive(Debug, Default, Clone)]
struct TestDelegate(Arc<TestDelegateInner>);

#[derive(Debug, Default)]
struct TestDelegateInner {
    delivered: Mutex<Vec<(MessageId, Bytes)>>,
    delivered_ids: Mutex<HashSet<MessageId>>,
}

impl TestDelegate {
    fn new() -> Self {
        Self::default()
    }

    fn delivered_count(&self) -> usize {
        self.0.delivered.lock().len()
    }

    fn has_message(&self, id: &MessageId) -> bool {
        self.0.delivered_ids.lock().contains(id)
    }

    fn get_messages(&self) -> Vec<(MessageId, Bytes)> {
        self.0.delivered.lock().clone()
    }
}

impl GossipDelegate for TestDelegate {
    fn on_deliver(&self, message_id: MessageId, payload: Bytes) {
        self.0.delivered.lock().push((message_id, payload));
        self.0.delivered_ids.lock().insert(message_id);
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt::Subscriber, EnvFilter};
    let _ = Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pair() -> (Gossip<TestDelegate>, Gossip<TestDelegate>, TestDelegate) {
    let membership = StaticMembership::new(2);
    let a = Gossip::new(
        GossipConfig::default().with_node_id(1),
        TestDelegate::new(),
        membership.clone(),
    )
    .unwrap();
    let b_delegate = TestDelegate::new();
    let b = Gossip::new(
        GossipConfig::default().with_node_id(2),
        b_delegate.clone(),
        membership,
    )
    .unwrap();
    (a, b, b_delegate)
}

#[test]
fn test_two_node_scenario() {
    init_tracing();
    let (a, b, b_delegate) = pair();

    let id = a.broadcast(Bytes::from_static(b"x")).unwrap();
    assert_eq!(a.stats().queue.max_transmits, 0);

    let msgs = a.get_broadcasts(2, 1400);
    assert_eq!(msgs.len(), 1);
    assert_eq!(a.stats().queue.max_transmits, 1);

    let env = envelope::decode(&msgs[0]).unwrap();
    assert_eq!(env.id, id);
    assert_eq!(env.payload.as_ref(), b"x");

    assert_eq!(b.notify_message(&msgs[0]), Receipt::Delivered(id));
    assert_eq!(b_delegate.get_messages(), vec![(id, Bytes::from_static(b"x"))]);

    // Second receipt of the same frame
    assert_eq!(b.notify_message(&msgs[0]), Receipt::Duplicate(id));
    assert_eq!(b_delegate.delivered_count(), 1);
}

#[test]
fn test_idempotent_delivery_under_replay() {
    let (a, b, b_delegate) = pair();

    let ids: Vec<_> = (0..20)
        .map(|i| a.broadcast(format!("event-{i}")).unwrap())
        .collect();

    let mut frames = Vec::new();
    while a.pending_broadcasts() > 0 {
        frames.extend(a.get_broadcasts(2, 1400));
    }

    // Every frame arrives several times, in reverse order
    for frame in frames.iter().rev() {
        b.handle_message(frame.clone());
    }
    for frame in &frames {
        b.handle_message(frame.clone());
    }

    assert_eq!(b_delegate.delivered_count(), ids.len());
    assert!(ids.iter().all(|id| b_delegate.has_message(id)));
}

#[test]
fn test_bounded_retransmission() {
    let members = StaticMembership::new(25);
    let gossip = Gossip::new(
        GossipConfig::default().with_retransmit_mult(4),
        TestDelegate::new(),
        members,
    )
    .unwrap();
    let limit = retransmit_limit(4, 25);
    assert_eq!(limit, 8);
    assert_eq!(gossip.transmit_limit(), limit);

    gossip.broadcast("bounded").unwrap();

    let mut transmissions = 0;
    for _ in 0..100 {
        transmissions += gossip.get_broadcasts(2, 1400).len();
    }
    assert_eq!(transmissions, limit);
    assert_eq!(gossip.pending_broadcasts(), 0);
}

#[test]
fn test_byte_budget_defers_messages() {
    let (a, _, _) = pair();
    for _ in 0..10 {
        a.broadcast(vec![7u8; 100]).unwrap();
    }

    // 115-byte frames plus 2 bytes overhead; 400 bytes fit three
    let first = a.get_broadcasts(2, 400);
    assert_eq!(first.len(), 3);
    assert!(first.iter().map(|m| m.len() + 2).sum::<usize>() <= 400);

    // Nothing is lost, the rest goes out later
    assert_eq!(a.pending_broadcasts(), 10);
}

#[test]
fn test_foreign_frames_are_ignored() {
    let (_, b, b_delegate) = pair();

    assert!(matches!(b.notify_message(b"\x01ping"), Receipt::Ignored(_)));
    assert!(matches!(b.notify_message(b""), Receipt::Ignored(_)));
    assert_eq!(b_delegate.delivered_count(), 0);
    assert_eq!(b.stats().dropped, 2);
}

#[test]
fn test_eventual_relay_across_cluster() {
    init_tracing();
    let delegates: Vec<TestDelegate> = (0..16).map(|_| TestDelegate::new()).collect();
    let cluster = LocalCluster::new(16, GossipConfig::local().with_retransmit_mult(6), |i| {
        delegates[i].clone()
    })
    .unwrap();

    let id = cluster.node(0).broadcast("everyone").unwrap();
    let rounds = cluster.run_until_quiet(100);
    assert!(rounds < 100, "queues never drained");

    for delegate in &delegates[1..] {
        assert!(delegate.has_message(&id));
        assert_eq!(delegate.delivered_count(), 1);
    }
    // Origin does not deliver its own broadcast
    assert_eq!(delegates[0].delivered_count(), 0);
}

#[test]
fn test_relay_survives_message_loss() {
    let delegates: Vec<TestDelegate> = (0..10).map(|_| TestDelegate::new()).collect();
    let cluster = LocalCluster::new(10, GossipConfig::local().with_retransmit_mult(6), |i| {
        delegates[i].clone()
    })
    .unwrap()
    .with_chaos(ChaosConfig::new().with_message_loss_rate(0.1));

    let ids: Vec<_> = (0..5)
        .map(|i| cluster.node(i).broadcast(format!("lossy-{i}")).unwrap())
        .collect();
    cluster.run_until_quiet(200);

    // Delivery is best-effort; duplicates never are
    for delegate in &delegates {
        let delivered = delegate.get_messages();
        let unique: HashSet<_> = delivered.iter().map(|(id, _)| *id).collect();
        assert_eq!(unique.len(), delivered.len());
        assert!(unique.iter().all(|id| ids.contains(id)));
    }
}

#[test]
fn test_partitioned_node_misses_gossip() {
    let delegates: Vec<TestDelegate> = (0..4).map(|_| TestDelegate::new()).collect();
    let cluster = LocalCluster::new(4, GossipConfig::local().with_retransmit_mult(6), |i| {
        delegates[i].clone()
    })
    .unwrap();
    cluster.partition().isolate(3, 0..4);

    let id = cluster.node(0).broadcast("not for 3").unwrap();
    cluster.run_until_quiet(50);

    assert!(delegates[1].has_message(&id));
    assert!(delegates[2].has_message(&id));
    assert!(!delegates[3].has_message(&id));
}

#[test]
fn test_ids_unique_across_nodes() {
    let cluster = LocalCluster::new(
        8,
        GossipConfig::default(),
        |_| memberlist_mgossip::NoopDelegate,
    )
    .unwrap();

    let mut ids = HashSet::new();
    for node in cluster.nodes() {
        for _ in 0..500 {
            assert!(ids.insert(node.broadcast("").unwrap()));
        }
    }
    assert_eq!(ids.len(), 8 * 500);
}
