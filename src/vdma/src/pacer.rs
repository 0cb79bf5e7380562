//! Consumer-side frame pacing
//!
//! Decides which completed buffer the consumer presents next. When the
//! consumer falls behind, it skips forward by a fixed odd step and counts
//! the skipped buffers as lost.

use crate::RING_SIZE;

/// (backlog above, step, lost) from the largest threshold down
const SKIP_TABLE: [(usize, usize, usize); 5] = [(13, 13, 12), (11, 11, 10), (9, 9, 8), (7, 7, 6), (5, 5, 4)];

/// Result of one pacing step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaceOutcome {
    /// Next buffer index to serve
    pub next: usize,
    /// Buffers advanced over
    pub served: usize,
    /// Buffers skipped without being presented
    pub lost: usize,
}

/// One pacing step from the last served index `next` towards the
/// hardware index `cur`
pub fn pace(next: usize, cur: usize) -> PaceOutcome {
    let next = next % RING_SIZE;
    let backlog = (RING_SIZE + cur % RING_SIZE - next) % RING_SIZE;
    let (served, lost) = SKIP_TABLE
        .iter()
        .find(|&&(above, _, _)| backlog > above)
        .map_or((1, 0), |&(_, step, lost)| (step, lost));
    PaceOutcome {
        next: (next + served) % RING_SIZE,
        served,
        lost,
    }
}

/// Pacing state of one consumer
#[derive(Debug, Clone, Default)]
pub struct FramePacer {
    next: usize,
    total: i32,
    lost: i32,
    buffer_lock: bool,
}

impl FramePacer {
    pub fn new(buffer_lock: bool) -> Self {
        Self {
            buffer_lock,
            ..Self::default()
        }
    }

    /// Advances towards `cur` and updates the counters
    pub fn pace(&mut self, cur: usize) -> PaceOutcome {
        let outcome = if self.buffer_lock {
            self.pace_locked()
        } else {
            pace(self.next, cur)
        };
        self.next = outcome.next;
        self.total = add_or_reset(self.total, outcome.served);
        self.lost = add_or_reset(self.lost, outcome.lost);
        outcome
    }

    /// Hardware holds unserved buffers back, so every call serves exactly one
    fn pace_locked(&self) -> PaceOutcome {
        PaceOutcome {
            next: (self.next + 1) % RING_SIZE,
            served: 1,
            lost: 0,
        }
    }

    pub fn next(&self) -> usize {
        self.next
    }

    pub fn total(&self) -> i32 {
        self.total
    }

    pub fn lost(&self) -> i32 {
        self.lost
    }

    pub fn reset(&mut self) {
        self.next = 0;
        self.total = 0;
        self.lost = 0;
    }
}

// Counters restart from zero instead of going negative
fn add_or_reset(counter: i32, amount: usize) -> i32 {
    i32::try_from(amount)
        .ok()
        .and_then(|a| counter.checked_add(a))
        .unwrap_or(0)
}
