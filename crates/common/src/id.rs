//! Time-ordered unique ids for log entries.
//!
//! Layout of the 64-bit value: 41 bits of milliseconds since
//! 2024-01-01T00:00:00Z, 10 bits of per-generator node id, 12 bits of
//! sequence. Ids render as 16 zero-padded hex digits, so string order on the
//! store equals numeric order equals time order.

use chrono::Utc;
use parking_lot::Mutex;

/// Milliseconds of 2024-01-01T00:00:00Z since the Unix epoch
const EPOCH_MS: i64 = 1_704_067_200_000;
const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;

pub type TxId = String;

#[derive(Debug)]
struct State {
    last_ms: u64,
    sequence: u64,
}

/// Snowflake id generator. One per open safe.
#[derive(Debug)]
pub struct IdGenerator {
    node: u64,
    state: Mutex<State>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(rand::random::<u64>() & NODE_MASK)
    }
}

impl IdGenerator {
    pub fn new(node: u64) -> Self {
        Self {
            node: node & NODE_MASK,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn next_raw(&self) -> u64 {
        let now = (Utc::now().timestamp_millis() - EPOCH_MS).max(0) as u64;
        let mut state = self.state.lock();
        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        } else if state.sequence < MAX_SEQUENCE {
            // Same millisecond, or the clock stepped back
            state.sequence += 1;
        } else {
            state.last_ms += 1;
            state.sequence = 0;
        }
        (state.last_ms << (NODE_BITS + SEQUENCE_BITS)) | (self.node << SEQUENCE_BITS) | state.sequence
    }

    pub fn next_id(&self) -> TxId {
        format!("{:016x}", self.next_raw())
    }
}
