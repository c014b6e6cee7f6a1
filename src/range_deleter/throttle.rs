//! Deletion throttle (token bucket shared by all tasks of a shard)

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Token bucket limiting documents deleted per second
#[derive(Debug)]
pub struct DeletionThrottle {
    /// Maximum tokens (bucket capacity); 0 disables throttling
    capacity: u64,
    /// Current tokens available
    tokens: AtomicU64,
    /// Tokens added per second
    refill_rate: u64,
    /// Last refill time
    last_refill: RwLock<Instant>,
}

impl DeletionThrottle {
    pub fn new(docs_per_second: u64) -> Self {
        Self {
            capacity: docs_per_second,
            tokens: AtomicU64::new(docs_per_second),
            refill_rate: docs_per_second,
            last_refill: RwLock::new(Instant::now()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.capacity == 0
    }

    /// Try to take `tokens`, returns true if successful
    pub fn try_acquire(&self, tokens: u64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            if current < tokens {
                return false;
            }
            if self
                .tokens
                .compare_exchange(current, current - tokens, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Wait until `tokens` are available. Requests larger than the bucket
    /// are clamped to its capacity so a large batch cannot wait forever.
    pub async fn acquire(&self, tokens: u64) {
        if self.is_unlimited() {
            return;
        }
        let wanted = tokens.clamp(1, self.capacity);
        while !self.try_acquire(wanted) {
            let missing = wanted.saturating_sub(self.available());
            let wait = Duration::from_secs_f64(missing.max(1) as f64 / self.refill_rate as f64);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&self) {
        let mut last_refill = self.last_refill.write();
        let elapsed = last_refill.elapsed();
        let new_tokens = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;

        if new_tokens > 0 {
            let current = self.tokens.load(Ordering::Relaxed);
            let new_value = (current + new_tokens).min(self.capacity);
            self.tokens.store(new_value, Ordering::Relaxed);
            *last_refill = Instant::now();
        }
    }

    /// Current token count
    pub fn available(&self) -> u64 {
        if self.is_unlimited() {
            return u64::MAX;
        }
        self.refill();
        self.tokens.load(Ordering::Relaxed)
    }
}
