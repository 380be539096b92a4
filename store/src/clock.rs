//! The clock is an external collaborator (§6): a source of wall time used to
//! seed the process-global version sequence and to timestamp class metadata.
//! Kept as a trait so tests can swap in a fixed clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A monotonically increasing, timestamp-seeded sequence shared by every
/// entity in the process. Seeding from wall time means versions minted by
/// a fresh process start above anything written by a previous run, even
/// without reading prior state; the counter portion guarantees uniqueness
/// within a millisecond.
pub struct VersionSequence {
    counter: AtomicU64,
}

impl VersionSequence {
    fn new(seed: u64) -> Self {
        // Leave 20 low bits for the intra-millisecond counter.
        Self { counter: AtomicU64::new(seed << 20) }
    }

    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Bumps the sequence so that subsequent `next()` calls exceed `at_least`,
    /// used when resuming from a persisted watermark higher than wall time
    /// would otherwise produce (e.g. a clock that moved backwards).
    pub fn observe(&self, at_least: u64) {
        let mut current = self.counter.load(Ordering::SeqCst);
        while current < at_least {
            match self.counter.compare_exchange_weak(
                current,
                at_least,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

static GLOBAL_SEQUENCE: OnceLock<VersionSequence> = OnceLock::new();

/// The process-wide version sequence, seeded from `SystemClock` on first use.
pub fn global_version_sequence() -> &'static VersionSequence {
    GLOBAL_SEQUENCE.get_or_init(|| VersionSequence::new(SystemClock.now_millis()))
}

pub fn next_global_version() -> u64 {
    global_version_sequence().next()
}
