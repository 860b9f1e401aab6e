//! Process-wide snowflake identifiers.
//!
//! Layout: `(millis since epoch) << 22 | node_id << 12 | sequence`, 63 bits
//! total so the value fits a signed SQLite INTEGER. The generator is a
//! process singleton; initialize it with [`init`] before anything persists
//! rows, otherwise the first caller pins node 0.

use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01T00:00:00Z.
const EPOCH_MS: u64 = 1_704_067_200_000;

const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;

/// Highest permitted node ID (1023).
pub const MAX_NODE_ID: u64 = (1 << NODE_BITS) - 1;

const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const NODE_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = NODE_BITS + SEQUENCE_BITS;

static GENERATOR: OnceLock<SnowflakeGenerator> = OnceLock::new();

/// Install the process-wide generator with the given node ID.
///
/// Returns `false` if a generator already exists (either from an earlier
/// `init` or because [`next_id`] ran first and pinned node 0).
pub fn init(node_id: u64) -> bool {
    let node_id = node_id & MAX_NODE_ID;
    GENERATOR.set(SnowflakeGenerator::new(node_id)).is_ok()
}

/// Next process-wide identifier. Strictly increasing, never 0.
pub fn next_id() -> i64 {
    GENERATOR
        .get_or_init(|| SnowflakeGenerator::new(0))
        .next()
}

/// Monotone 63-bit ID generator.
pub struct SnowflakeGenerator {
    node_id: u64,
    state: Mutex<State>,
}

struct State {
    last_ms: u64,
    sequence: u64,
}

impl SnowflakeGenerator {
    #[must_use]
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id: node_id & MAX_NODE_ID,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// Generate the next identifier.
    ///
    /// Holding the lock across the timestamp read keeps `(timestamp,
    /// sequence)` pairs strictly increasing even when the sequence wraps and
    /// the generator has to busy-wait for the next millisecond tick.
    pub fn next(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut now = Self::millis();
        // A clock step backwards must not emit a smaller ID.
        if now < state.last_ms {
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                now = Self::wait_next_millis(state.last_ms);
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let id = (now.saturating_sub(EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.node_id << NODE_SHIFT)
            | state.sequence;
        // 63-bit contract: the top bit stays clear for ~69 years of epochs,
        // and 0 is never handed out.
        ((id & (i64::MAX as u64)) as i64).max(1)
    }

    fn millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(EPOCH_MS)
    }

    fn wait_next_millis(last_ms: u64) -> u64 {
        let mut now = Self::millis();
        while now <= last_ms {
            std::hint::spin_loop();
            now = Self::millis();
        }
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = SnowflakeGenerator::new(1);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.next();
            assert!(id > last, "id {id} not greater than {last}");
            last = id;
        }
    }

    #[test]
    fn ids_are_never_zero() {
        let generator = SnowflakeGenerator::new(0);
        for _ in 0..1_000 {
            assert_ne!(generator.next(), 0);
        }
    }

    #[test]
    fn concurrent_ids_are_distinct() {
        let generator = Arc::new(SnowflakeGenerator::new(7));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let generator = Arc::clone(&generator);
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(|_| generator.next()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("worker panicked") {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 16_000);
    }

    #[test]
    fn node_id_is_masked_into_place() {
        let generator = SnowflakeGenerator::new(42);
        let id = generator.next() as u64;
        assert_eq!((id >> NODE_SHIFT) & MAX_NODE_ID, 42);
    }
}
