//! Request throttling
//!
//! Fixed-window counters keyed by caller and tier. The limiter is an
//! injectable service owned by whoever fronts the pipeline, not a
//! global; state lives for the process lifetime only.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Cache probes are cheap, generations are not, so the two tiers carry
/// very different budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplainTier {
    Cached,
    Generate,
}

impl ExplainTier {
    pub fn limit(&self) -> u32 {
        match self {
            ExplainTier::Cached => 10,
            ExplainTier::Generate => 8,
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            ExplainTier::Cached => Duration::seconds(60),
            ExplainTier::Generate => Duration::hours(24),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExplainTier::Cached => "cached",
            ExplainTier::Generate => "generate",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

struct WindowEntry {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Fixed-window in-memory rate limiter.
#[derive(Default)]
pub struct RateLimiter {
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against `key`. A fresh or expired window starts
    /// over; within a live window the counter climbs until the limit.
    pub fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        let now = Utc::now();
        let mut entries = self.entries.lock().expect("limiter lock");

        let entry = entries.get_mut(key);
        match entry {
            Some(entry) if entry.reset_at > now => {
                if entry.count >= limit {
                    return RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_at: entry.reset_at,
                    };
                }
                entry.count += 1;
                RateLimitDecision {
                    allowed: true,
                    remaining: limit - entry.count,
                    reset_at: entry.reset_at,
                }
            }
            _ => {
                let reset_at = now + window;
                entries.insert(
                    key.to_string(),
                    WindowEntry {
                        count: 1,
                        reset_at,
                    },
                );
                RateLimitDecision {
                    allowed: true,
                    remaining: limit.saturating_sub(1),
                    reset_at,
                }
            }
        }
    }

    /// Apply the explain budget for one caller at the given tier.
    pub fn check_explain(&self, caller: &str, tier: ExplainTier) -> RateLimitDecision {
        let key = format!("explain:{}:{}", caller, tier.as_str());
        self.check(&key, tier.limit(), tier.window())
    }
}
