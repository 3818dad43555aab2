//! A token-bucket rate limiter bounding compactor write throughput
//! (`Compaction.Throughput`/`Compaction.ThroughputBurst`, spec.md §6).

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// `rate == 0` disables limiting entirely: [`Throughput::take`] never blocks.
pub struct Throughput {
    rate: u64,
    state: Mutex<State>,
}

struct State {
    tokens: f64,
    capacity: f64,
    last: Instant,
}

impl Throughput {
    #[must_use]
    pub fn new(rate: u64, burst: u64) -> Self {
        let capacity = burst.max(1) as f64;
        Self { rate, state: Mutex::new(State { tokens: capacity, capacity, last: Instant::now() }) }
    }

    /// Blocks until `bytes` worth of budget has accumulated, refilling at `rate` bytes/sec. A
    /// request larger than the bucket's own capacity drains whatever is available rather than
    /// blocking forever waiting for a capacity the bucket can never hold.
    pub fn take(&self, bytes: u64) {
        if self.rate == 0 || bytes == 0 {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate as f64).min(state.capacity);
                state.last = now;

                let need = (bytes as f64).min(state.capacity);
                if state.tokens >= need {
                    state.tokens -= need;
                    None
                } else {
                    Some(Duration::from_secs_f64((need - state.tokens) / self.rate as f64))
                }
            };
            match wait {
                None => return,
                Some(duration) => std::thread::sleep(duration),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_never_blocks() {
        let throughput = Throughput::new(0, 0);
        let start = Instant::now();
        throughput.take(1 << 30);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn request_within_burst_does_not_block() {
        let throughput = Throughput::new(1_000_000, 1_000_000);
        let start = Instant::now();
        throughput.take(1_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn request_exceeding_budget_blocks_until_refilled() {
        let throughput = Throughput::new(1_000, 100);
        throughput.take(100); // drain the initial burst
        let start = Instant::now();
        throughput.take(100);
        assert!(start.elapsed() >= Duration::from_millis(80), "should wait roughly 100ms for refill");
    }
}
