use std::time::Duration;

use rand::Rng;

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Reconnect delay schedule: exponential with jitter, so a fleet of clients
/// does not stampede the server after a restart. Each delay is drawn uniformly
/// from [cap/2, cap] where cap doubles per attempt up to `MAX_DELAY`.
///
/// The channel owner drives the loop: sleep `next_delay()` before each
/// reconnect attempt and call `reset()` once a connection authenticates. This
/// crate ships no socket client of its own, so the schedule is the contract
/// those loops build on.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Backoff {
        Backoff { attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let cap = BASE_DELAY
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(MAX_DELAY);
        self.attempt = self.attempt.saturating_add(1);
        let cap_ms = cap.as_millis() as u64;
        let jittered = rand::rng().random_range(cap_ms / 2..=cap_ms);
        Duration::from_millis(jittered)
    }

    /// Call once a connection is established and authenticated.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::new()
    }
}
