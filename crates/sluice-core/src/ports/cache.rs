//! Cache port - key / TTL / get / set / invalidate
//!
//! プロセス全体のグローバル変数（API レスポンスのキャッシュ、連続失敗カウンタ）を
//! 明示的な抽象に置き換えたもの。各コンポーネントに注入して使う。
//!
//! # 実装
//! - `MemoryCache`: プロセス内（テスト・単発実行用）
//! - `FileCache`: JSON ファイル。invocation をまたいでカウンタを保持する

use std::time::Duration;

use crate::domain::CacheError;

/// Cache key for the aggregate statistics snapshot, invalidated after every
/// destination write.
pub const STATS_KEY: &str = "stats.aggregate";

pub trait Cache: Send + Sync {
    /// Value for `key`, or `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError>;

    /// Store `value`; `ttl = None` never expires.
    fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>)
    -> Result<(), CacheError>;

    fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

/// Read a non-negative counter (missing or malformed reads as 0).
pub fn read_counter(cache: &dyn Cache, key: &str) -> Result<u32, CacheError> {
    Ok(cache
        .get(key)?
        .and_then(|v| v.as_u64())
        .map(|n| n.min(u32::MAX as u64) as u32)
        .unwrap_or(0))
}

/// Increment a counter and return the new value.
pub fn increment_counter(cache: &dyn Cache, key: &str) -> Result<u32, CacheError> {
    let next = read_counter(cache, key)?.saturating_add(1);
    cache.set(key, serde_json::json!(next), None)?;
    Ok(next)
}

pub fn reset_counter(cache: &dyn Cache, key: &str) -> Result<(), CacheError> {
    cache.set(key, serde_json::json!(0), None)
}
