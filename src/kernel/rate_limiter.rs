//! Rate limiting and throttling (C4).
//!
//! Sliding window per (user_id, endpoint, window_type), each window split
//! into 10 sub-buckets (§4.3). Each window has its own mutex; the limiter
//! has one map-level mutex for key lookup (§5).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

const SUB_BUCKETS: i64 = 10;
const MINUTE_SECONDS: i64 = 60;
const HOUR_SECONDS: i64 = 3_600;
const DAY_SECONDS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowType {
    Minute,
    Hour,
    Day,
}

impl WindowType {
    fn window_seconds(self) -> i64 {
        match self {
            WindowType::Minute => MINUTE_SECONDS,
            WindowType::Hour => HOUR_SECONDS,
            WindowType::Day => DAY_SECONDS,
        }
    }

    fn label(self) -> &'static str {
        match self {
            WindowType::Minute => "minute",
            WindowType::Hour => "hour",
            WindowType::Day => "day",
        }
    }
}

/// Per-(user, endpoint) override limits. A `0` disables that window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub rpm: u32,
    pub rph: u32,
    pub rpd: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rpm: 60,
            rph: 1_000,
            rpd: 10_000,
        }
    }
}

impl RateLimitConfig {
    fn limit_for(self, window: WindowType) -> u32 {
        match window {
            WindowType::Minute => self.rpm,
            WindowType::Hour => self.rph,
            WindowType::Day => self.rpd,
        }
    }
}

/// Sliding window over 10 sub-buckets.
#[derive(Debug, Default)]
struct SlidingWindow {
    buckets: HashMap<i64, u32>,
}

impl SlidingWindow {
    fn bucket_width(window_seconds: i64) -> i64 {
        (window_seconds / SUB_BUCKETS).max(1)
    }

    fn bucket_index(t: i64, window_seconds: i64) -> i64 {
        t / Self::bucket_width(window_seconds)
    }

    /// Sum of buckets not older than `window_seconds`, garbage-collecting
    /// stale ones along the way.
    fn count(&mut self, now: i64, window_seconds: i64) -> u32 {
        let width = Self::bucket_width(window_seconds);
        let cutoff = now - window_seconds;
        let cutoff_bucket = cutoff / width;
        self.buckets.retain(|&bucket, _| bucket >= cutoff_bucket);
        self.buckets.values().sum()
    }

    fn record(&mut self, now: i64, window_seconds: i64) {
        let idx = Self::bucket_index(now, window_seconds);
        *self.buckets.entry(idx).or_insert(0) += 1;
    }

    fn is_empty_within(&self, now: i64, window_seconds: i64) -> bool {
        let width = Self::bucket_width(window_seconds);
        let cutoff_bucket = (now - window_seconds) / width;
        self.buckets.keys().all(|&b| b < cutoff_bucket)
    }

    /// Seconds until the oldest buckets age out enough to admit one more
    /// request. Never negative.
    fn retry_after(&self, now: i64, window_seconds: i64, current: u32, limit: u32) -> i64 {
        let width = Self::bucket_width(window_seconds);
        let need = current.saturating_sub(limit).saturating_add(1);
        let mut acc: u32 = 0;
        let mut buckets: Vec<_> = self.buckets.iter().collect();
        buckets.sort_by_key(|(bucket, _)| **bucket);
        for (bucket, count) in buckets {
            acc += count;
            if acc >= need {
                let bucket_end = (*bucket + 1) * width;
                return ((bucket_end + window_seconds) - now).max(0);
            }
        }
        0
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub exceeded: bool,
    pub limit_type: String,
    pub current: u32,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_seconds: i64,
}

#[derive(Default)]
struct Windows {
    minute: Mutex<SlidingWindow>,
    hour: Mutex<SlidingWindow>,
    day: Mutex<SlidingWindow>,
}

impl std::fmt::Debug for Windows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Windows").finish()
    }
}

/// Rate limiter - owned by Kernel, called via &self (interior mutability per
/// window + one map-level mutex for key lookup, per §5).
#[derive(Debug)]
pub struct RateLimiter {
    default_config: RateLimitConfig,
    user_configs: Mutex<HashMap<String, RateLimitConfig>>,
    endpoint_configs: Mutex<HashMap<String, RateLimitConfig>>,
    windows: Mutex<HashMap<(String, String), Windows>>,
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            user_configs: Mutex::new(HashMap::new()),
            endpoint_configs: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn effective_config(&self, user_id: &str, endpoint: &str) -> RateLimitConfig {
        if let Some(cfg) = self.endpoint_configs.lock().expect("poisoned").get(endpoint) {
            return *cfg;
        }
        if let Some(cfg) = self.user_configs.lock().expect("poisoned").get(user_id) {
            return *cfg;
        }
        self.default_config
    }

    /// `CheckRateLimit` — order of checks minute, hour, day (§4.3). When
    /// `record=true` and all windows admit, the request is counted in every
    /// configured (non-zero-limit) window.
    pub fn check_rate_limit(&self, user_id: &str, endpoint: &str, record: bool) -> RateLimitResult {
        let config = self.effective_config(user_id, endpoint);
        let now = Utc::now().timestamp();

        let mut windows_guard = self.windows.lock().expect("poisoned");
        let entry = windows_guard
            .entry((user_id.to_string(), endpoint.to_string()))
            .or_default();

        for window_type in [WindowType::Minute, WindowType::Hour, WindowType::Day] {
            let limit = config.limit_for(window_type);
            if limit == 0 {
                continue; // zero limit disables the window
            }
            let window_mutex = match window_type {
                WindowType::Minute => &entry.minute,
                WindowType::Hour => &entry.hour,
                WindowType::Day => &entry.day,
            };
            let mut window = window_mutex.lock().expect("poisoned");
            let current = window.count(now, window_type.window_seconds());
            if current >= limit {
                let retry_after = window.retry_after(now, window_type.window_seconds(), current, limit);
                return RateLimitResult {
                    allowed: false,
                    exceeded: true,
                    limit_type: window_type.label().to_string(),
                    current,
                    limit,
                    remaining: 0,
                    retry_after_seconds: retry_after,
                };
            }
        }

        // All windows admit. Record if requested, then report the tightest window.
        let mut tightest: Option<RateLimitResult> = None;
        for window_type in [WindowType::Minute, WindowType::Hour, WindowType::Day] {
            let limit = config.limit_for(window_type);
            if limit == 0 {
                continue;
            }
            let window_mutex = match window_type {
                WindowType::Minute => &entry.minute,
                WindowType::Hour => &entry.hour,
                WindowType::Day => &entry.day,
            };
            let mut window = window_mutex.lock().expect("poisoned");
            if record {
                window.record(now, window_type.window_seconds());
            }
            let current = window.count(now, window_type.window_seconds());
            let remaining = limit.saturating_sub(current);
            if tightest.is_none() {
                tightest = Some(RateLimitResult {
                    allowed: true,
                    exceeded: false,
                    limit_type: window_type.label().to_string(),
                    current,
                    limit,
                    remaining,
                    retry_after_seconds: 0,
                });
            }
        }

        tightest.unwrap_or(RateLimitResult {
            allowed: true,
            exceeded: false,
            limit_type: String::new(),
            current: 0,
            limit: 0,
            remaining: 0,
            retry_after_seconds: 0,
        })
    }

    pub fn set_user_limits(&self, user_id: &str, config: RateLimitConfig) {
        self.user_configs
            .lock()
            .expect("poisoned")
            .insert(user_id.to_string(), config);
    }

    pub fn set_endpoint_limits(&self, endpoint: &str, config: RateLimitConfig) {
        self.endpoint_configs
            .lock()
            .expect("poisoned")
            .insert(endpoint.to_string(), config);
    }

    pub fn reset_user(&self, user_id: &str) {
        let mut windows = self.windows.lock().expect("poisoned");
        windows.retain(|(u, _), _| u != user_id);
    }

    /// Drop windows with no activity within their own window duration.
    pub fn cleanup_expired(&self) {
        let now = Utc::now().timestamp();
        let mut windows = self.windows.lock().expect("poisoned");
        windows.retain(|_, entry| {
            let minute_empty = entry
                .minute
                .lock()
                .expect("poisoned")
                .is_empty_within(now, MINUTE_SECONDS);
            let hour_empty = entry
                .hour
                .lock()
                .expect("poisoned")
                .is_empty_within(now, HOUR_SECONDS);
            let day_empty = entry
                .day
                .lock()
                .expect("poisoned")
                .is_empty_within(now, DAY_SECONDS);
            !(minute_empty && hour_empty && day_empty)
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
