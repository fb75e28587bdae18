//! Sliding-window request limiter.
//!
//! Each identifier (`execute:<host>`, `test:<host>`) keeps the instants of
//! its accepted requests within the trailing minute. A request is admitted
//! while fewer than the configured ceiling remain in the window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

/// Length of the trailing window.
pub(crate) const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    max_requests: usize,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(max_requests: usize, enabled: bool) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            enabled,
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Admit or reject one request for `identifier` at the current instant.
    pub fn check(&self, identifier: &str) -> bool {
        self.check_at(identifier, Instant::now())
    }

    /// Admit or reject one request for `identifier` at `now`.
    ///
    /// Entries at least one window old are pruned first, and identifiers
    /// with nothing left in their window are dropped. Rejected requests are
    /// not recorded.
    pub fn check_at(&self, identifier: &str, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        self.windows.retain(|_, window| {
            window
                .back()
                .is_some_and(|&last| now.saturating_duration_since(last) < RATE_LIMIT_WINDOW)
        });

        let mut window = self.windows.entry(identifier.to_string()).or_default();
        while let Some(&oldest) = window.front() {
            if now.saturating_duration_since(oldest) >= RATE_LIMIT_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_requests {
            warn!(
                "Rate limit exceeded for {} ({} requests in the last {:?})",
                identifier,
                window.len(),
                RATE_LIMIT_WINDOW
            );
            return false;
        }

        window.push_back(now);
        true
    }

    /// Number of identifiers with a live window.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_ceiling() {
        let limiter = RateLimiter::new(60, true);
        let now = Instant::now();
        for _ in 0..60 {
            assert!(limiter.check_at("execute:host", now));
        }
        assert!(!limiter.check_at("execute:host", now));
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(60, true);
        let start = Instant::now();
        for _ in 0..60 {
            assert!(limiter.check_at("execute:host", start));
        }
        assert!(!limiter.check_at("execute:host", start + Duration::from_secs(59)));
        assert!(limiter.check_at("execute:host", start + Duration::from_secs(60)));
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let limiter = RateLimiter::new(2, true);
        let start = Instant::now();
        assert!(limiter.check_at("id", start));
        assert!(limiter.check_at("id", start + Duration::from_secs(30)));
        assert!(!limiter.check_at("id", start + Duration::from_secs(40)));
        // Only the first entry has aged out
        assert!(limiter.check_at("id", start + Duration::from_secs(60)));
        assert!(!limiter.check_at("id", start + Duration::from_secs(61)));
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = RateLimiter::new(1, true);
        let now = Instant::now();
        assert!(limiter.check_at("execute:a", now));
        assert!(limiter.check_at("execute:b", now));
        assert!(limiter.check_at("test:a", now));
        assert!(!limiter.check_at("execute:a", now));
    }

    #[test]
    fn test_idle_identifiers_are_dropped() {
        let limiter = RateLimiter::new(5, true);
        let start = Instant::now();
        assert!(limiter.check_at("execute:a", start));
        assert!(limiter.check_at("execute:b", start + Duration::from_secs(30)));
        assert_eq!(limiter.tracked(), 2);

        assert!(limiter.check_at("execute:c", start + Duration::from_secs(60)));
        assert_eq!(limiter.tracked(), 2);

        assert!(limiter.check_at("execute:c", start + Duration::from_secs(200)));
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn test_disabled_admits_everything() {
        let limiter = RateLimiter::new(1, false);
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.check_at("id", now));
        }
    }

    #[test]
    fn test_check_uses_current_time() {
        let limiter = RateLimiter::new(3, true);
        assert!(limiter.check("id"));
        assert!(limiter.check("id"));
        assert!(limiter.check("id"));
        assert!(!limiter.check("id"));
        assert_eq!(limiter.max_requests(), 3);
    }
}
