use std::time::Duration;

/// Runtime knobs for the agent loop, read once from the environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Top-N search results scraped per query.
    pub search_results_count: usize,
    /// Hard cap on loop iterations.
    pub max_steps: usize,
    /// Per-user accepted requests per day.
    pub daily_request_limit: u64,
    /// Global sliding-window limiter: max requests per window.
    pub global_rate_max: u64,
    pub global_rate_window: Duration,
    /// Bounded wait-and-recheck attempts when the global window is full.
    pub global_rate_max_retries: usize,
    pub cache_ttl: Duration,
    pub scrape_max_retries: usize,
    /// Wall-clock maximum for one request.
    pub request_timeout: Duration,
    /// User ids that bypass the daily quota.
    pub admin_user_ids: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            search_results_count: 3,
            max_steps: 3,
            daily_request_limit: 5,
            global_rate_max: 60,
            global_rate_window: Duration::from_millis(60_000),
            global_rate_max_retries: 2,
            cache_ttl: Duration::from_secs(21_600),
            scrape_max_retries: 3,
            request_timeout: Duration::from_secs(60),
            admin_user_ids: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Read configuration from the environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            search_results_count: env_parse("SEARCH_RESULTS_COUNT", defaults.search_results_count),
            max_steps: env_parse("AGENT_MAX_STEPS", defaults.max_steps),
            daily_request_limit: env_parse("DAILY_REQUEST_LIMIT", defaults.daily_request_limit),
            global_rate_max: env_parse("GLOBAL_RATE_MAX", defaults.global_rate_max),
            global_rate_window: Duration::from_millis(env_parse(
                "GLOBAL_RATE_WINDOW_MS",
                defaults.global_rate_window.as_millis() as u64,
            )),
            global_rate_max_retries: env_parse(
                "GLOBAL_RATE_MAX_RETRIES",
                defaults.global_rate_max_retries,
            ),
            cache_ttl: Duration::from_secs(env_parse(
                "CACHE_TTL_SECONDS",
                defaults.cache_ttl.as_secs(),
            )),
            scrape_max_retries: env_parse("SCRAPE_MAX_RETRIES", defaults.scrape_max_retries),
            request_timeout: Duration::from_secs(env_parse(
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )),
            admin_user_ids: env_list("ADMIN_USER_IDS"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
