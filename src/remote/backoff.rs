// ABOUTME: Retry policy and the shared rate-limit gate
// ABOUTME: One gate per run; a rate-limit signal from any worker pauses every worker

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Bounded exponential backoff for a single logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry (doubles each subsequent retry)
    pub initial_delay: Duration,
    /// Upper bound for a computed delay. Server wait hints are honoured even above it.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Computed delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Delay with up to 25% random jitter so concurrent workers spread out.
    pub fn jittered_delay_for(&self, retry: u32) -> Duration {
        let base = self.delay_for(retry);
        let spread = base.as_millis() as u64 / 4;
        if spread == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(extra)
    }
}

/// Shared pause state for every worker of a run.
///
/// Workers call [`RateLimitGate::wait_ready`] before each request; a worker that
/// receives a rate-limit signal calls [`RateLimitGate::observe`], which pushes the
/// shared resume instant forward but never pulls it back.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    paused_until: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rate-limit signal: nobody sends before `now + wait`.
    pub fn observe(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut guard = self.paused_until.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(current) if current >= until => {}
            _ => *guard = Some(until),
        }
    }

    /// Remaining pause, if the gate is currently closed.
    pub fn paused_for(&self) -> Option<Duration> {
        let guard = self.paused_until.lock().unwrap_or_else(|e| e.into_inner());
        guard.and_then(|until| {
            let now = Instant::now();
            (until > now).then(|| until - now)
        })
    }

    /// Sleep until the gate is open. Re-checks after waking since another worker
    /// may have extended the pause meanwhile.
    pub async fn wait_ready(&self) {
        loop {
            let until = {
                let guard = self.paused_until.lock().unwrap_or_else(|e| e.into_inner());
                *guard
            };
            match until {
                Some(until) if until > Instant::now() => {
                    tracing::debug!(
                        "Rate-limit gate closed, waiting {:?}",
                        until - Instant::now()
                    );
                    tokio::time::sleep_until(until).await;
                }
                _ => return,
            }
        }
    }
}
