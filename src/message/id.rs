//! Message identifiers and the per-node identifier generator.

use parking_lot::Mutex;
use std::{
    fmt::{self, Debug, Display},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use crate::error::{Error, Result};

/// Number of bits reserved for the node component.
pub const NODE_BITS: u8 = 10;

/// Number of bits reserved for the per-millisecond sequence.
pub const SEQUENCE_BITS: u8 = 12;

/// Largest node id that fits in [`NODE_BITS`].
pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;

const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

/// How far ahead of the clock the generator may run after exhausting a
/// millisecond's sequence values.
///
/// Bounds how much a restarted node, whose generator starts again from the
/// clock, can overlap ids it issued before the restart.
pub const MAX_BORROW_MS: u64 = 16;
const TIME_SHIFT: u8 = NODE_BITS + SEQUENCE_BITS;
const NODE_SHIFT: u8 = SEQUENCE_BITS;

/// 2021-12-03T00:00:00Z in milliseconds since the UNIX epoch.
pub const DEFAULT_EPOCH_MS: u64 = 1_638_489_600_000;

/// Unique identifier for a gossip message.
///
/// Laid out as a snowflake id:
/// - 41 bits: milliseconds since the generator's epoch
/// - 10 bits: node id
/// - 12 bits: sequence within the millisecond
///
/// Ids from one generator are strictly increasing, so ordering by id is
/// ordering by origination time on that node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    /// Size of the message ID in bytes when encoded.
    pub const ENCODED_SIZE: usize = 8;

    /// Wrap a raw 64-bit identifier.
    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Build an id from its components (for testing/diagnostics).
    pub const fn from_parts(elapsed_ms: u64, node: u16, sequence: u16) -> Self {
        Self(
            (elapsed_ms << TIME_SHIFT)
                | (((node & MAX_NODE_ID) as u64) << NODE_SHIFT)
                | (sequence & MAX_SEQUENCE) as u64,
        )
    }

    /// The raw 64-bit value.
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Milliseconds since the generator epoch.
    #[inline]
    pub const fn elapsed_ms(&self) -> u64 {
        self.0 >> TIME_SHIFT
    }

    /// Node component.
    #[inline]
    pub const fn node(&self) -> u16 {
        ((self.0 >> NODE_SHIFT) as u16) & MAX_NODE_ID
    }

    /// Sequence component.
    #[inline]
    pub const fn sequence(&self) -> u16 {
        (self.0 as u16) & MAX_SEQUENCE
    }

    /// Big-endian wire representation.
    #[inline]
    pub const fn to_be_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        self.0.to_be_bytes()
    }

    /// Decode a message ID from the first eight bytes of a slice.
    ///
    /// Returns `None` if the slice is too small.
    pub fn decode_from_slice(data: &[u8]) -> Option<Self> {
        let raw: [u8; Self::ENCODED_SIZE] = data.get(..Self::ENCODED_SIZE)?.try_into().ok()?;
        Some(Self(u64::from_be_bytes(raw)))
    }
}

impl From<u64> for MessageId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MessageId({}:{}:{})",
            self.elapsed_ms(),
            self.node(),
            self.sequence()
        )
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Generates cluster-unique, time-ordered [`MessageId`]s for one node.
///
/// Time is read from a monotonic clock anchored to the wall clock at
/// construction, so a wall-clock step backwards cannot produce a smaller
/// id. When a millisecond's 4096 sequence values run out the generator
/// borrows the next millisecond rather than waiting for it, up to
/// [`MAX_BORROW_MS`] ahead of the clock. Past that, callers yield until the
/// clock catches up; the lock is never held while waiting.
#[derive(Debug)]
pub struct IdGenerator {
    node: u16,
    epoch_ms: u64,
    /// Milliseconds since `epoch_ms` at the moment `anchor` was taken.
    anchor_ms: u64,
    anchor: Instant,
    state: Mutex<GeneratorState>,
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_ms: u64,
    sequence: u16,
}

impl IdGenerator {
    /// Create a generator using the default epoch.
    pub fn new(node: u16) -> Result<Self> {
        Self::with_epoch(node, DEFAULT_EPOCH_MS)
    }

    /// Create a generator with a custom epoch (milliseconds since UNIX epoch).
    ///
    /// Fails if `node` exceeds [`MAX_NODE_ID`] or the local clock reads
    /// earlier than the epoch.
    pub fn with_epoch(node: u16, epoch_ms: u64) -> Result<Self> {
        if node > MAX_NODE_ID {
            return Err(Error::Config(format!(
                "node id {} exceeds maximum {}",
                node, MAX_NODE_ID
            )));
        }

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Config(format!("system clock before UNIX epoch: {}", e)))?
            .as_millis() as u64;

        if now_ms < epoch_ms {
            return Err(Error::Config(format!(
                "system clock ({} ms) is before the id epoch ({} ms)",
                now_ms, epoch_ms
            )));
        }

        Ok(Self {
            node,
            epoch_ms,
            anchor_ms: now_ms - epoch_ms,
            anchor: Instant::now(),
            state: Mutex::new(GeneratorState::default()),
        })
    }

    /// Node component stamped into every id.
    pub fn node(&self) -> u16 {
        self.node
    }

    /// Epoch in milliseconds since the UNIX epoch.
    pub fn epoch_ms(&self) -> u64 {
        self.epoch_ms
    }

    /// Wall-clock time at which `id` was generated, assuming it came from a
    /// generator with the same epoch.
    pub fn timestamp_of(&self, id: MessageId) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.epoch_ms + id.elapsed_ms())
    }

    fn elapsed_ms(&self) -> u64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as u64
    }

    /// Produce the next identifier.
    pub fn next_id(&self) -> MessageId {
        loop {
            let now = self.elapsed_ms();
            let mut state = self.state.lock();

            if now > state.last_ms {
                state.last_ms = now;
                state.sequence = 0;
            } else if state.sequence < MAX_SEQUENCE {
                state.sequence += 1;
            } else if state.last_ms < now + MAX_BORROW_MS {
                state.last_ms += 1;
                state.sequence = 0;
            } else {
                drop(state);
                std::thread::yield_now();
                continue;
            }

            return MessageId::from_parts(state.last_ms, self.node, state.sequence);
        }
    }
}
