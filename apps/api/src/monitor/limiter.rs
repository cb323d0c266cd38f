use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Global per-provider pacing: calls to one provider are spread at least
/// `1/qps` apart across every monitor loop in the process.
pub struct ProviderLimiter {
    spacing: Duration,
    next_free: DashMap<String, Instant>,
}

impl ProviderLimiter {
    pub fn new(qps: u32) -> Self {
        Self {
            spacing: Duration::from_secs(1) / qps.max(1),
            next_free: DashMap::new(),
        }
    }

    /// Reserves the provider's next free slot and sleeps until it arrives.
    pub async fn acquire(&self, provider: &str) {
        let now = Instant::now();
        let slot = {
            let mut next = self.next_free.entry(provider.to_string()).or_insert(now);
            let slot = (*next).max(now);
            *next = slot + self.spacing;
            slot
        };
        if slot > now {
            tokio::time::sleep_until(slot).await;
        }
    }
}
