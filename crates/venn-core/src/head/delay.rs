use std::time::Duration;

/// Running mean of block propagation delays over a fixed-size ring.
///
/// Samples are clamped to `[0, max]` so one very late block cannot dominate the mean.
#[derive(Debug)]
pub struct DelayTracker {
    samples: Vec<Duration>,
    capacity: usize,
    pos: usize,
    sum: Duration,
    max: Duration,
}

impl DelayTracker {
    pub const DEFAULT_CAPACITY: usize = 128;

    #[must_use]
    pub fn new(capacity: usize, max: Duration) -> Self {
        let capacity = capacity.max(1);
        Self { samples: Vec::with_capacity(capacity), capacity, pos: 0, sum: Duration::ZERO, max }
    }

    pub fn add(&mut self, delay: Duration) {
        let delay = delay.min(self.max);
        if self.samples.len() < self.capacity {
            self.samples.push(delay);
        } else {
            self.sum -= self.samples[self.pos];
            self.samples[self.pos] = delay;
            self.pos = (self.pos + 1) % self.capacity;
        }
        self.sum += delay;
    }

    #[must_use]
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.samples.len()) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.sum / n,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
