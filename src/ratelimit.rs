//! Per-(target, IP) fixed-window request limiting.
//!
//! Each named target carries its own rule; buckets reset when their window
//! lapses. Denials surface as HTTP 429 with a `Retry-After` header.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::error::ApiError;

pub const TARGETS: [&str; 7] = [
    "upload", "download", "disk", "list", "status", "auth", "fileops",
];

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateRule {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_ms: u64,
}

#[derive(Debug)]
struct RateBucket {
    count: u32,
    window_start: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rules: HashMap<String, RateRule>,
    buckets: Mutex<HashMap<(String, String), RateBucket>>,
}

impl RateLimiter {
    /// Build from the `rateLimiter` settings module; targets without a
    /// parseable rule are left unlimited.
    pub fn from_settings(module: &Value) -> Self {
        let mut rules = HashMap::new();
        for target in TARGETS {
            if let Some(rule) = module
                .get(target)
                .and_then(|value| serde_json::from_value::<RateRule>(value.clone()).ok())
            {
                rules.insert(target.to_string(), rule);
            }
        }
        Self {
            rules,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn with_rule(target: &str, rule: RateRule) -> Self {
        let mut rules = HashMap::new();
        rules.insert(target.to_string(), rule);
        Self {
            rules,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Allow or deny one request for `target` from `ip`.
    pub async fn check(&self, target: &str, ip: &str) -> Result<(), ApiError> {
        let Some(rule) = self.rules.get(target) else {
            return Ok(());
        };
        if !rule.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let key = (target.to_string(), ip.to_string());
        let bucket = buckets.entry(key).or_insert(RateBucket {
            count: 0,
            window_start: now,
        });

        let elapsed_ms = now.duration_since(bucket.window_start).as_millis() as u64;
        if bucket.count == 0 || elapsed_ms >= rule.window_ms {
            bucket.count = 1;
            bucket.window_start = now;
            return Ok(());
        }
        if bucket.count >= rule.max_requests {
            let retry_after = rule.window_ms.saturating_sub(elapsed_ms).div_ceil(1000);
            return Err(ApiError::RateLimited(retry_after.max(1)));
        }
        bucket.count += 1;
        Ok(())
    }

    /// Drop buckets whose window lapsed; run periodically from background.
    pub async fn prune(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|(target, _), bucket| {
            let Some(rule) = self.rules.get(target) else {
                return false;
            };
            now.duration_since(bucket.window_start).as_millis() < u128::from(rule.window_ms)
        });
    }
}
