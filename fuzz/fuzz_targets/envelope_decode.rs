//! Fuzz target for gossip envelope decoding.
//!
//! Arbitrary frames reach the receive path from any peer, so decoding and
//! the full `handle_message` path must never panic.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use memberlist_mgossip::{envelope, Gossip, GossipConfig, NoopDelegate, Receipt, StaticMembership};

fuzz_target!(|data: &[u8]| {
    let frame = Bytes::copy_from_slice(data);

    match envelope::decode(&frame) {
        Ok(env) => {
            assert_eq!(env.encoded_len(), data.len());
            assert_eq!(env.encode(), frame);
        }
        Err(_) => {
            assert!(data.len() < envelope::HEADER_SIZE || !envelope::is_gossip_message(data));
        }
    }

    let Ok(gossip) = Gossip::new(GossipConfig::default(), NoopDelegate, StaticMembership::new(3)) else {
        return;
    };
    if let Receipt::Delivered(id) = gossip.handle_message(frame.clone()) {
        assert!(gossip.has_seen(&id));
        assert!(matches!(gossip.handle_message(frame), Receipt::Duplicate(_)));
    }
});
