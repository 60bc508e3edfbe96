use crate::{config::AgentConfig, kv::KvStore};
use chrono::{DateTime, Local, Utc};
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// The authenticated caller, as seen by the admission gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUser {
    pub id: String,
}

/// Outcome of an admission check, consumed by the HTTP layer for the
/// `X-Rate-Limit-*` response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Per-user daily quota composed with a global sliding window, both backed by
/// the key-value store. Store failures fail open: availability wins over
/// strict enforcement.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    daily_limit: u64,
    admin_user_ids: Vec<String>,
    global_max: u64,
    global_window: Duration,
    global_max_retries: usize,
}

impl RateLimiter {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, config: &AgentConfig) -> Self {
        Self {
            kv,
            daily_limit: config.daily_request_limit,
            admin_user_ids: config.admin_user_ids.clone(),
            global_max: config.global_rate_max,
            global_window: config.global_rate_window,
            global_max_retries: config.global_rate_max_retries,
        }
    }

    /// Run both limiters in series. The per-user quota is consulted first;
    /// a deny from either limiter leaves all counters unchanged.
    pub async fn check_request(&self, user: &RequestUser) -> RateLimitDecision {
        let daily = self.check_daily(user).await;
        if !daily.allowed {
            return daily;
        }

        let mut retries = 0;
        loop {
            let global = self.check_global().await;
            if global.allowed {
                return daily;
            }
            if retries >= self.global_max_retries {
                return global;
            }
            retries += 1;
            let wait = (global.reset_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
        }
    }

    async fn check_daily(&self, user: &RequestUser) -> RateLimitDecision {
        let reset_at = end_of_local_day();

        if self.admin_user_ids.iter().any(|id| id == &user.id) {
            return RateLimitDecision {
                allowed: true,
                limit: self.daily_limit,
                remaining: self.daily_limit,
                reset_at,
            };
        }

        let key = format!("user:{}:{}", user.id, Local::now().format("%Y-%m-%d"));
        let ttl = (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        // Read before increment so a deny leaves the counter unchanged.
        let used = match self.kv.get(&key).await {
            Ok(value) => value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0),
            Err(error) => {
                warn!(%error, "rate limit store unreachable, failing open");
                return RateLimitDecision {
                    allowed: true,
                    limit: self.daily_limit,
                    remaining: self.daily_limit,
                    reset_at,
                };
            }
        };

        if used >= self.daily_limit {
            return RateLimitDecision {
                allowed: false,
                limit: self.daily_limit,
                remaining: 0,
                reset_at,
            };
        }

        let used = match self.kv.incr_ex(&key, ttl).await {
            Ok(count) => count,
            Err(error) => {
                warn!(%error, "rate limit increment failed, failing open");
                used + 1
            }
        };

        RateLimitDecision {
            allowed: true,
            limit: self.daily_limit,
            remaining: self.daily_limit.saturating_sub(used),
            reset_at,
        }
    }

    async fn check_global(&self) -> RateLimitDecision {
        let window_ms = self.global_window.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();
        let window_index = now_ms / window_ms;
        let key = format!("global:{window_index}");
        let reset_at = DateTime::from_timestamp_millis((window_index + 1) * window_ms)
            .unwrap_or_else(Utc::now);

        let used = match self.kv.get(&key).await {
            Ok(value) => value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0),
            Err(error) => {
                warn!(%error, "global rate limit store unreachable, failing open");
                return RateLimitDecision {
                    allowed: true,
                    limit: self.global_max,
                    remaining: self.global_max,
                    reset_at,
                };
            }
        };

        if used >= self.global_max {
            return RateLimitDecision {
                allowed: false,
                limit: self.global_max,
                remaining: 0,
                reset_at,
            };
        }

        let used = match self.kv.incr_ex(&key, self.global_window).await {
            Ok(count) => count,
            Err(error) => {
                warn!(%error, "global rate limit increment failed, failing open");
                used + 1
            }
        };

        RateLimitDecision {
            allowed: true,
            limit: self.global_max,
            remaining: self.global_max.saturating_sub(used),
            reset_at,
        }
    }
}

fn end_of_local_day() -> DateTime<Utc> {
    let now = Local::now();
    let tomorrow = now
        .date_naive()
        .succ_opt()
        .unwrap_or_else(|| now.date_naive());
    tomorrow
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).single())
        .map_or_else(Utc::now, |local| local.with_timezone(&Utc))
}
