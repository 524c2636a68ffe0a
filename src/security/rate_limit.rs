//! Rate limiting for RPC bridge callers
//!
//! A looping program could hammer host capabilities for its whole deadline.
//! Each live sandbox gets its own token bucket:
//!
//! ```text
//!   capacity=50, rate=10/sec
//!
//!   ┌─────────────┐
//!   │  ● ● ● ●    │  ← refills at `rate` tokens per second, up to `capacity`
//!   │  ● ● ●      │
//!   └─────────────┘
//!         │
//!   call arrives:  token available → consume, allow
//!                  bucket empty    → reject with 429
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Tokens are stored scaled so fractional refills accumulate
const SCALE: u64 = 1000;

/// Thread-safe token bucket
pub struct RateLimiter {
    /// Burst size
    capacity: u64,
    /// Tokens added per second
    refill_rate: f64,
    tokens_scaled: AtomicU64,
    last_refill: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens_scaled: AtomicU64::new(capacity * SCALE),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// 50 burst, 10 calls/sec
    pub fn with_defaults() -> Self {
        Self::new(50, 10.0)
    }

    /// Consume one token if available
    pub fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens_scaled.load(Ordering::Relaxed);
            if current < SCALE {
                return false;
            }
            if self
                .tokens_scaled
                .compare_exchange(current, current - SCALE, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn refill(&self) {
        let now = Instant::now();
        let mut last = self.last_refill.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.duration_since(*last);
        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate * SCALE as f64) as u64;

        if tokens_to_add > 0 {
            *last = now;
            let max_scaled = self.capacity * SCALE;
            loop {
                let current = self.tokens_scaled.load(Ordering::Relaxed);
                let new = std::cmp::min(current + tokens_to_add, max_scaled);
                if self
                    .tokens_scaled
                    .compare_exchange(current, new, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    pub fn available_tokens(&self) -> u64 {
        self.tokens_scaled.load(Ordering::Relaxed) / SCALE
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

/// Returned when a caller has exhausted its bucket
#[derive(Debug, thiserror::Error)]
#[error("rate limited, retry after {retry_after:?}")]
pub struct RateLimitError {
    pub retry_after: Duration,
}

impl RateLimitError {
    /// Time until one token is back
    pub fn new(refill_rate: f64) -> Self {
        let retry_secs = if refill_rate > 0.0 { 1.0 / refill_rate } else { 1.0 };
        Self {
            retry_after: Duration::from_secs_f64(retry_secs),
        }
    }
}

/// One bucket per key, created on first use
pub struct KeyedRateLimiter {
    capacity: u64,
    refill_rate: f64,
    buckets: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl KeyedRateLimiter {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        let bucket = {
            let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
            buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(RateLimiter::new(self.capacity, self.refill_rate)))
                .clone()
        };
        if bucket.try_acquire() {
            Ok(())
        } else {
            Err(RateLimitError::new(self.refill_rate))
        }
    }

    /// Forget a key's bucket, e.g. when its sandbox is torn down
    pub fn remove(&self, key: &str) {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    /// Keep only the buckets whose key passes `keep`
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| keep(key));
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
