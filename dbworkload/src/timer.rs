use std::num::NonZeroU64;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in Unix seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Wall-clock cadence shared by every worker of a run. Boundaries fall on
/// `offset + k * frequency`, where `offset` is the run start modulo the frequency, so all
/// workers flush the same slice of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    frequency: u64,
    offset: u64,
}

impl Cadence {
    pub fn new(frequency: NonZeroU64, start: u64) -> Self {
        let frequency = frequency.get();
        Self {
            frequency,
            offset: start % frequency,
        }
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// The first boundary strictly after `ts`.
    pub fn next_boundary(&self, ts: u64) -> u64 {
        let candidate = ts - ts % self.frequency + self.offset;
        if candidate > ts {
            candidate
        } else {
            candidate + self.frequency
        }
    }
}

/// Tells a worker when its buffer is due for a flush.
#[derive(Debug, Clone)]
pub(crate) struct FlushTimer {
    cadence: Cadence,
    next: u64,
}

impl FlushTimer {
    pub fn new(cadence: Cadence, now: u64) -> Self {
        Self {
            cadence,
            next: cadence.next_boundary(now),
        }
    }

    /// True once per boundary crossed. Boundaries missed during a long cycle collapse into one.
    pub fn due(&mut self, now: u64) -> bool {
        if now >= self.next {
            self.next = self.cadence.next_boundary(now);
            true
        } else {
            false
        }
    }
}
