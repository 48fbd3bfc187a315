use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::error::WorkflowError;
use crate::store::{DocumentMerge, DocumentStore};

const FIELD_WINDOW_START: &str = "windowStart";
const FIELD_COUNT: &str = "count";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRule {
    pub max_calls: i64,
    pub window_secs: i64,
}

/// Fixed-window per-caller-per-operation limiter. Every public engine
/// operation passes through here before doing any work; operations without
/// a registered rule are unmetered.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: DocumentStore,
    rules: IndexMap<String, WindowRule>,
}

impl RateLimiter {
    pub fn new(store: DocumentStore, rules: IndexMap<String, WindowRule>) -> Self {
        Self { store, rules }
    }

    pub fn with_default_rules(store: DocumentStore) -> Self {
        let mut rules = IndexMap::new();
        let hour = 3600;
        rules.insert("interpret_dream".to_string(), rule(20, hour));
        rules.insert("generate_dream_image".to_string(), rule(5, hour));
        rules.insert("daily_tip".to_string(), rule(10, hour));
        rules.insert("analyze_dreams".to_string(), rule(10, hour));
        rules.insert("moon_sync".to_string(), rule(10, hour));
        Self::new(store, rules)
    }

    pub fn rules(&self) -> &IndexMap<String, WindowRule> {
        &self.rules
    }

    pub fn check(&self, operation: &str, caller: &str) -> Result<(), WorkflowError> {
        self.check_at(operation, caller, Utc::now())
    }

    pub fn check_at(
        &self,
        operation: &str,
        caller: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let Some(window) = self.rules.get(operation) else {
            return Ok(());
        };
        let key = format!("rate/{operation}/{caller}");
        let document = self.store.get(&key).unwrap_or_default();
        let window_start = document
            .get(FIELD_WINDOW_START)
            .and_then(Value::as_i64)
            .unwrap_or(i64::MIN);
        let count = document.get(FIELD_COUNT).and_then(Value::as_i64).unwrap_or(0);

        if now.timestamp().saturating_sub(window_start) >= window.window_secs {
            self.store.merge(
                &key,
                &DocumentMerge::new()
                    .set(FIELD_WINDOW_START, json!(now.timestamp()))
                    .set(FIELD_COUNT, json!(1)),
            )?;
            return Ok(());
        }
        if count >= window.max_calls {
            return Err(WorkflowError::RateLimited(operation.to_string()));
        }
        self.store
            .merge(&key, &DocumentMerge::new().increment(FIELD_COUNT, 1))?;
        Ok(())
    }
}

fn rule(max_calls: i64, window_secs: i64) -> WindowRule {
    WindowRule {
        max_calls,
        window_secs,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use indexmap::IndexMap;

    use super::{rule, RateLimiter};
    use crate::error::WorkflowError;
    use crate::store::DocumentStore;

    fn limiter(temp: &tempfile::TempDir, max_calls: i64, window_secs: i64) -> RateLimiter {
        let mut rules = IndexMap::new();
        rules.insert("op".to_string(), rule(max_calls, window_secs));
        RateLimiter::new(DocumentStore::new(temp.path().join("rate.json")), rules)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn allows_up_to_max_calls_within_window() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let limiter = limiter(&temp, 3, 3600);

        for step in 0..3 {
            assert!(limiter.check_at("op", "u1", at(1000 + step)).is_ok());
        }
        let rejected = limiter.check_at("op", "u1", at(1003));
        assert!(matches!(rejected, Err(WorkflowError::RateLimited(_))));
        Ok(())
    }

    #[test]
    fn window_expiry_resets_the_count() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let limiter = limiter(&temp, 1, 60);

        assert!(limiter.check_at("op", "u1", at(1000)).is_ok());
        assert!(limiter.check_at("op", "u1", at(1030)).is_err());
        assert!(limiter.check_at("op", "u1", at(1060)).is_ok());
        Ok(())
    }

    #[test]
    fn callers_are_limited_independently() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let limiter = limiter(&temp, 1, 3600);

        assert!(limiter.check_at("op", "u1", at(1000)).is_ok());
        assert!(limiter.check_at("op", "u2", at(1001)).is_ok());
        assert!(limiter.check_at("op", "u1", at(1002)).is_err());
        Ok(())
    }

    #[test]
    fn unknown_operations_are_unmetered() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let limiter = limiter(&temp, 1, 3600);

        for step in 0..10 {
            assert!(limiter.check_at("other", "u1", at(1000 + step)).is_ok());
        }
        Ok(())
    }

    #[test]
    fn default_rules_cover_every_engine_operation() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let limiter =
            RateLimiter::with_default_rules(DocumentStore::new(temp.path().join("rate.json")));
        for operation in [
            "interpret_dream",
            "generate_dream_image",
            "daily_tip",
            "analyze_dreams",
            "moon_sync",
        ] {
            assert!(limiter.rules().contains_key(operation), "{operation}");
        }
        Ok(())
    }
}
