//! Run options and retry tuning.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

/// Bound and pacing of the conflict retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, backoff: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Defaults overridden by `KFOLD_MAX_PATCH_ATTEMPTS` and `KFOLD_PATCH_BACKOFF_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_parse::<u32>("KFOLD_MAX_PATCH_ATTEMPTS").filter(|n| *n > 0).unwrap_or(d.max_attempts),
            backoff: env_parse::<u64>("KFOLD_PATCH_BACKOFF_MS").map(Duration::from_millis).unwrap_or(d.backoff),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Environment the objects are rendered for.
    pub env: String,
    /// Restrict the run to these components; empty means all.
    pub components: Vec<String>,
    /// Create objects that do not exist yet.
    pub create: bool,
    pub dry_run: bool,
    /// Tag written to every applied object; empty disables garbage collection.
    pub gc_tag: String,
    pub skip_gc: bool,
    pub retry: RetryPolicy,
}

impl ApplyConfig {
    pub fn new(env: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            components: Vec::new(),
            create: true,
            dry_run: false,
            gc_tag: String::new(),
            skip_gc: false,
            retry: RetryPolicy::from_env(),
        }
    }

    pub fn gc_enabled(&self) -> bool {
        !self.gc_tag.is_empty() && !self.skip_gc
    }
}

#[derive(Debug, Clone)]
pub struct DeleteConfig {
    pub env: String,
    pub components: Vec<String>,
    pub grace_period: Option<i64>,
    pub dry_run: bool,
}

impl DeleteConfig {
    pub fn new(env: impl Into<String>) -> Self {
        Self { env: env.into(), components: Vec::new(), grace_period: None, dry_run: false }
    }
}
