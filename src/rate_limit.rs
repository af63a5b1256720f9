//! Token-bucket rate limiter shared by outbound API calls.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{CallContext, Error};

/// Requests-per-second throttle with a burst equal to the rate.
///
/// A rate of zero (or less) disables limiting. The rate can be changed at
/// runtime with [`RateLimiter::set_qps`]; waiters re-evaluate against the new
/// rate immediately and tokens already handed out are unaffected.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    changed: Notify,
}

#[derive(Debug)]
struct Bucket {
    /// Tokens per second; 0 means unlimited.
    qps: u32,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn new(qps: u32) -> Self {
        let burst = f64::from(qps.max(1));
        Self {
            qps,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.qps > 0 {
            let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * f64::from(self.qps)).min(self.burst);
        }
        self.last = now;
    }

    /// Take `n` tokens, or report how long until they would be available.
    fn try_take(&mut self, n: u32, now: Instant) -> Result<(), Duration> {
        if self.qps == 0 {
            return Ok(());
        }
        self.refill(now);
        let wanted = f64::from(n);
        if self.tokens >= wanted {
            self.tokens -= wanted;
            Ok(())
        } else {
            let missing = wanted - self.tokens;
            Err(Duration::from_secs_f64(missing / f64::from(self.qps)))
        }
    }
}

impl RateLimiter {
    /// Create a limiter admitting `qps` requests per second; `qps <= 0`
    /// means unlimited.
    pub fn new(qps: i64) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(clamp_qps(qps))),
            changed: Notify::new(),
        }
    }

    /// A limiter that never blocks.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    fn bucket(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for one token.
    pub async fn wait(&self, ctx: &CallContext) -> Result<(), Error> {
        self.wait_n(ctx, 1).await
    }

    /// Wait for `n` tokens, or until `ctx` is cancelled or expires.
    pub async fn wait_n(&self, ctx: &CallContext, n: u32) -> Result<(), Error> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            // Register for rate changes before inspecting the bucket so a
            // concurrent set_qps cannot slip between the check and the sleep.
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let delay = {
                let mut bucket = self.bucket();
                if bucket.qps > 0 && f64::from(n) > bucket.burst {
                    return Err(Error::config(format!(
                        "requested {n} tokens exceeds limiter burst {}",
                        bucket.burst
                    )));
                }
                match bucket.try_take(n, Instant::now()) {
                    Ok(()) => return Ok(()),
                    Err(delay) => delay,
                }
            };

            tokio::select! {
                err = ctx.done() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
                _ = &mut changed => {}
            }
        }
    }

    /// Take one token if available right now.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Take `n` tokens if available right now.
    pub fn allow_n(&self, n: u32) -> bool {
        self.bucket().try_take(n, Instant::now()).is_ok()
    }

    /// Change the rate (and burst) for all subsequent waits.
    pub fn set_qps(&self, qps: i64) {
        let qps = clamp_qps(qps);
        {
            let mut bucket = self.bucket();
            bucket.refill(Instant::now());
            bucket.qps = qps;
            bucket.burst = f64::from(qps.max(1));
            bucket.tokens = bucket.tokens.min(bucket.burst);
        }
        tracing::debug!(qps, "rate limiter reconfigured");
        self.changed.notify_waiters();
    }

    /// Current limit; 0 means unlimited.
    pub fn qps(&self) -> u32 {
        self.bucket().qps
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

fn clamp_qps(qps: i64) -> u32 {
    u32::try_from(qps.max(0)).unwrap_or(u32::MAX)
}
