//! FileCache - JSON ファイルに永続化する Cache 実装
//!
//! CLI は invocation ごとに新しいプロセスなので、連続失敗カウンタのように
//! invocation をまたぐ値はここに置く。書き込みは tmp ファイル経由の rename。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::CacheError;
use crate::impls::memory_cache::CacheEntry;
use crate::ports::{Cache, Clock};

pub struct FileCache {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    // serialises read-modify-write within this process
    lock: Mutex<()>,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, CacheEntry>, CacheError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(HashMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, entries: &HashMap<String, CacheEntry>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, CacheEntry>) -> R,
    ) -> Result<R, CacheError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.load()?;
        let out = f(&mut entries);
        self.store(&entries)?;
        Ok(out)
    }
}

impl Cache for FileCache {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        Ok(self
            .load()?
            .remove(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let now = self.clock.now();
        self.modify(|entries| {
            entries.retain(|_, entry| entry.is_live(now));
            entries.insert(key.to_string(), CacheEntry::new(value, ttl, now));
        })
    }

    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.modify(|entries| {
            entries.remove(key);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::cache::{increment_counter, read_counter};
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn counter_survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("cache.json");

        let first = FileCache::new(&path, Arc::new(SystemClock));
        increment_counter(&first, "recovery.failures").unwrap();
        increment_counter(&first, "recovery.failures").unwrap();

        let second = FileCache::new(&path, Arc::new(SystemClock));
        assert_eq!(read_counter(&second, "recovery.failures").unwrap(), 2);
    }

    #[test]
    fn expired_entries_read_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let cache = FileCache::new(dir.path().join("cache.json"), clock.clone());

        cache
            .set("runs", serde_json::json!(2), Some(Duration::from_secs(30)))
            .unwrap();
        assert_eq!(cache.get("runs").unwrap(), Some(serde_json::json!(2)));

        clock.advance(Duration::from_secs(31));
        assert_eq!(cache.get("runs").unwrap(), None);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("absent.json"), Arc::new(SystemClock));
        assert_eq!(cache.get("anything").unwrap(), None);
        cache.invalidate("anything").unwrap();
    }
}
