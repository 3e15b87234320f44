//! MemoryCache - プロセス内の Cache 実装
//!
//! TTL の判定には注入された Clock を使うので、テストでは FixedClock で期限切れを再現できる。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::CacheError;
use crate::ports::{Cache, Clock};

/// Cached value plus its optional expiry. Shared with `FileCache`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub value: serde_json::Value,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(value: serde_json::Value, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        Self { value, expires_at }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        // a poisoned map is still a valid map
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry::new(value, ttl, self.clock.now());
        self.entries().insert(key.to_string(), entry);
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use crate::ports::cache::{increment_counter, read_counter, reset_counter};
    use chrono::TimeZone;

    fn setup() -> (Arc<FixedClock>, MemoryCache) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let cache = MemoryCache::new(clock.clone());
        (clock, cache)
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (clock, cache) = setup();
        cache
            .set("k", serde_json::json!(3), Some(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(cache.get("k").unwrap(), Some(serde_json::json!(3)));

        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn invalidate_removes_entry() {
        let (_clock, cache) = setup();
        cache.set("k", serde_json::json!("v"), None).unwrap();
        cache.invalidate("k").unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn counters_increment_and_reset() {
        let (_clock, cache) = setup();
        assert_eq!(read_counter(&cache, "c").unwrap(), 0);
        assert_eq!(increment_counter(&cache, "c").unwrap(), 1);
        assert_eq!(increment_counter(&cache, "c").unwrap(), 2);
        reset_counter(&cache, "c").unwrap();
        assert_eq!(read_counter(&cache, "c").unwrap(), 0);
    }
}
