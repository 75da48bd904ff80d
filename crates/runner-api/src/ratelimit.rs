//! Ambient per-tenant rate limiting and token budgets. Neither is named
//! by the core design — every request here runs as tenant `"default"` —
//! but a service that accepts external traffic carries this regardless,
//! the same way the rest of this stack carries logging and metrics.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

const RATE_WINDOW: Duration = Duration::from_secs(60);

fn rate_limit_per_min() -> u64 {
    env::var("RUNNER_RATE_LIMIT_PER_MIN").ok().and_then(|v| v.parse().ok()).unwrap_or(600)
}

fn token_budget() -> u64 {
    env::var("RUNNER_TOKEN_BUDGET").ok().and_then(|v| v.parse().ok()).unwrap_or(u64::MAX)
}

/// Fixed-window counter per tenant, reset once `RATE_WINDOW` elapses
/// since the window's first request.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<AsyncMutex<HashMap<String, (u64, Instant)>>>,
    limit: u64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { windows: Arc::new(AsyncMutex::new(HashMap::new())), limit: rate_limit_per_min() }
    }

    /// Returns `false` once `key` has made `limit` requests within the
    /// current 60-second window.
    pub async fn check_allow(&self, key: &str) -> bool {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entry = windows.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) >= RATE_WINDOW {
            *entry = (0, now);
        }
        if entry.0 >= self.limit {
            return false;
        }
        entry.0 += 1;
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks cumulative output tokens per tenant against a process-wide
/// budget. Unlike `RateLimiter` this never resets: it is a lifetime cap,
/// not a rolling one.
#[derive(Clone)]
pub struct TokenBudgets {
    spent: Arc<AsyncMutex<HashMap<String, u64>>>,
    budget: u64,
}

impl TokenBudgets {
    pub fn new() -> Self {
        Self { spent: Arc::new(AsyncMutex::new(HashMap::new())), budget: token_budget() }
    }

    pub async fn record(&self, key: &str, tokens: u64) {
        let mut spent = self.spent.lock().await;
        *spent.entry(key.to_string()).or_insert(0) += tokens;
    }

    /// Whether `key` may still spend `new_tokens` without exceeding its
    /// lifetime budget.
    pub async fn allowed(&self, key: &str, new_tokens: u64) -> bool {
        let spent = self.spent.lock().await;
        let so_far = spent.get(key).copied().unwrap_or(0);
        so_far.saturating_add(new_tokens) <= self.budget
    }
}

impl Default for TokenBudgets {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_up_to_its_configured_limit() {
        let limiter = RateLimiter { windows: Arc::new(AsyncMutex::new(HashMap::new())), limit: 3 };
        assert!(limiter.check_allow("t").await);
        assert!(limiter.check_allow("t").await);
        assert!(limiter.check_allow("t").await);
        assert!(!limiter.check_allow("t").await);
    }

    #[tokio::test]
    async fn rate_limiter_tracks_tenants_independently() {
        let limiter = RateLimiter { windows: Arc::new(AsyncMutex::new(HashMap::new())), limit: 1 };
        assert!(limiter.check_allow("a").await);
        assert!(limiter.check_allow("b").await);
        assert!(!limiter.check_allow("a").await);
    }

    #[tokio::test]
    async fn token_budget_rejects_once_exhausted() {
        let budgets = TokenBudgets { spent: Arc::new(AsyncMutex::new(HashMap::new())), budget: 100 };
        assert!(budgets.allowed("t", 80).await);
        budgets.record("t", 80).await;
        assert!(!budgets.allowed("t", 30).await);
        assert!(budgets.allowed("t", 20).await);
    }
}
