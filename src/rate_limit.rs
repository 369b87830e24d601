//! Per-(tenant, user) sliding-window rate limiting.
//!
//! Two windows are enforced over the same request log: `requests_per_minute`
//! over the last 60 seconds and `burst` over the last 10 seconds. A rejected
//! request is not recorded, so hammering a full window does not extend it.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::models::Identity;

const MINUTE: Duration = Duration::from_secs(60);
const BURST_WINDOW: Duration = Duration::from_secs(10);

pub struct RateLimiter {
    per_minute: usize,
    burst: usize,
    log: DashMap<(String, String), VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        Self {
            per_minute: requests_per_minute.max(1) as usize,
            burst: burst.max(1) as usize,
            log: DashMap::new(),
        }
    }

    /// `None` when limiting is disabled.
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.requests_per_minute, config.burst))
    }

    /// Record a request, or return how long the caller should wait.
    pub fn check(&self, identity: &Identity) -> Result<(), Duration> {
        let now = Instant::now();
        let key = (identity.tenant_id.clone(), identity.user_id.clone());
        let mut entry = self.log.entry(key).or_default();
        let requests = entry.value_mut();

        while requests
            .front()
            .is_some_and(|t| now.duration_since(*t) >= MINUTE)
        {
            requests.pop_front();
        }

        if requests.len() >= self.per_minute {
            let oldest = requests[requests.len() - self.per_minute];
            return Err(MINUTE.saturating_sub(now.duration_since(oldest)));
        }

        let recent = requests
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) < BURST_WINDOW)
            .count();
        if recent >= self.burst {
            let oldest_recent = requests[requests.len() - self.burst];
            return Err(BURST_WINDOW.saturating_sub(now.duration_since(oldest_recent)));
        }

        requests.push_back(now);
        Ok(())
    }

    /// Drop callers with no requests in the last minute.
    pub fn prune(&self) {
        let now = Instant::now();
        self.log.retain(|_, requests| {
            requests
                .back()
                .is_some_and(|t| now.duration_since(*t) < MINUTE)
        });
    }
}
