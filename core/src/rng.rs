//! Deterministic random number generation.
//!
//! RULE: Nothing in the engine may call any platform RNG.
//! Every probabilistic decision draws from a RecordRng derived from
//! (simulation id, record index, stream slot). This means:
//!   - Re-running a job makes the same decisions it made the first time.
//!   - Each decision stream is reproducible in isolation.
//!   - Adding a new stream slot never changes existing streams.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;
use sha2::{Digest, Sha256};

use crate::types::RecordIndex;

/// Stable 64-bit seed for a simulation id.
pub fn simulation_seed(simulation_id: &str) -> u64 {
    let digest = Sha256::digest(simulation_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// A deterministic RNG for one (simulation, record, slot) stream.
pub struct RecordRng {
    pub slot: RngSlot,
    inner:    Pcg64Mcg,
}

impl RecordRng {
    pub fn new(simulation_id: &str, record: RecordIndex, slot: RngSlot) -> Self {
        Self::from_seed(simulation_seed(simulation_id), record, slot)
    }

    pub fn from_seed(master_seed: u64, record: RecordIndex, slot: RngSlot) -> Self {
        let derived = master_seed
            ^ record.wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15)
            ^ (slot as u64).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        Self {
            slot,
            inner: Pcg64Mcg::seed_from_u64(derived),
        }
    }

    /// Separate stream for a lifecycle phase of the same record.
    pub fn for_phase(simulation_id: &str, record: RecordIndex, slot: RngSlot, phase_salt: u64) -> Self {
        let seed = simulation_seed(simulation_id) ^ phase_salt.wrapping_mul(0x94d0_49bb_1331_11eb);
        Self::from_seed(seed, record, slot)
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    /// Roll a u64 in [0, n).
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        assert!(n > 0, "n must be > 0");
        self.inner.next_u64() % n
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// In-place Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.next_u64_below(i as u64 + 1) as usize;
            items.swap(i, j);
        }
    }
}

/// Stable stream slot assignments.
/// NEVER reorder or remove entries. Append only.
/// Reordering changes every stream's seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum RngSlot {
    ActivityDecision = 0,
    Thinning = 1,
    ActivityDelay = 2,
    Lifecycle = 3,
    ReplayShuffle = 4,
    Content = 5,
}

impl RngSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ActivityDecision => "activity_decision",
            Self::Thinning => "thinning",
            Self::ActivityDelay => "activity_delay",
            Self::Lifecycle => "lifecycle",
            Self::ReplayShuffle => "replay_shuffle",
            Self::Content => "content",
        }
    }
}
