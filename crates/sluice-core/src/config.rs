//! Configuration - 調整値と接続先
//!
//! - [`SluiceConfig`]: cycle の調整値（batch size, budget, timeout, 閾値）。すべて default あり
//! - [`Endpoints`]: REST adapter の接続先と credential。binary だけが使う
//!
//! どちらも環境変数（`SLUICE_*`）から読める。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::gate::DegradationMode;
use crate::domain::SluiceError;

const ENV_PREFIX: &str = "SLUICE_";
const BATCH_SIZE_OVERRIDE_PREFIX: &str = "SLUICE_BATCH_SIZE_";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(String),

    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: String, value: String },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl From<ConfigError> for SluiceError {
    fn from(err: ConfigError) -> Self {
        SluiceError::Configuration(err.to_string())
    }
}

/// Tuning knobs for every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SluiceConfig {
    #[serde(default = "default_task_type")]
    pub task_type: String,

    /// Target claim size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per task type claim size, keyed by task type.
    #[serde(default)]
    pub batch_size_overrides: HashMap<String, usize>,

    /// Smallest size the claimer may shrink to on statement timeout.
    #[serde(default = "default_claim_floor")]
    pub claim_floor: usize,

    /// Absolute upper bound on one claim regardless of batch size.
    #[serde(default)]
    pub hard_limit: Option<usize>,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default)]
    pub gate_degradation: DegradationMode,

    /// Consecutive listing failures before the gate degrades.
    #[serde(default = "default_gate_failure_ceiling")]
    pub gate_failure_ceiling: u32,

    #[serde(default = "default_gate_cache_ttl")]
    pub gate_cache_ttl: Duration,

    /// Downstream workflow name used to recognise our own runs.
    #[serde(default = "default_workflow_name")]
    pub workflow_name: String,

    /// Substring of the workflow file path used to recognise our own runs.
    #[serde(default = "default_workflow_path")]
    pub workflow_path: String,

    /// Trigger event of our own runs.
    #[serde(default = "default_run_event")]
    pub run_event: String,

    #[serde(default = "default_run_branch")]
    pub run_branch: String,

    /// `event_type` sent on dispatch.
    #[serde(default = "default_dispatch_event")]
    pub dispatch_event: String,

    #[serde(default = "default_dispatch_attempts")]
    pub dispatch_attempts: u32,

    #[serde(default = "default_dispatch_base_delay")]
    pub dispatch_base_delay: Duration,

    #[serde(default = "default_stuck_lease_timeout")]
    pub stuck_lease_timeout: Duration,

    #[serde(default = "default_recovery_page_size")]
    pub recovery_page_size: usize,

    /// Upper bound on rows released by one recovery run.
    #[serde(default = "default_recovery_cap")]
    pub recovery_cap: usize,

    #[serde(default = "default_recovery_alert_threshold")]
    pub recovery_alert_threshold: u32,

    #[serde(default = "default_wall_clock_budget")]
    pub wall_clock_budget: Duration,

    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: Duration,

    #[serde(default = "default_per_call_timeout")]
    pub per_call_timeout: Duration,

    /// Ledger rows examined per poll cycle.
    #[serde(default = "default_poll_cap")]
    pub poll_cap: usize,

    /// Field that must be present and non-empty for a result to be `success`.
    #[serde(default = "default_required_field")]
    pub required_field: String,

    /// Rows per destination write.
    #[serde(default = "default_write_chunk_size")]
    pub write_chunk_size: usize,

    /// Attempts for the completed-flag write after a destination write.
    #[serde(default = "default_flag_write_attempts")]
    pub flag_write_attempts: u32,

    /// Retry delay base for store writes.
    #[serde(default = "default_store_retry_delay")]
    pub store_retry_delay: Duration,

    /// Attempts for one artifact download.
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,

    #[serde(default = "default_download_retry_delay")]
    pub download_retry_delay: Duration,

    /// JSON file backing the cache when no cache is injected.
    ///
    /// Counters such as recovery failures must outlive one process.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
}

impl Default for SluiceConfig {
    fn default() -> Self {
        Self {
            task_type: default_task_type(),
            batch_size: default_batch_size(),
            batch_size_overrides: HashMap::new(),
            claim_floor: default_claim_floor(),
            hard_limit: None,
            max_concurrent_jobs: default_max_concurrent_jobs(),
            gate_degradation: DegradationMode::default(),
            gate_failure_ceiling: default_gate_failure_ceiling(),
            gate_cache_ttl: default_gate_cache_ttl(),
            workflow_name: default_workflow_name(),
            workflow_path: default_workflow_path(),
            run_event: default_run_event(),
            run_branch: default_run_branch(),
            dispatch_event: default_dispatch_event(),
            dispatch_attempts: default_dispatch_attempts(),
            dispatch_base_delay: default_dispatch_base_delay(),
            stuck_lease_timeout: default_stuck_lease_timeout(),
            recovery_page_size: default_recovery_page_size(),
            recovery_cap: default_recovery_cap(),
            recovery_alert_threshold: default_recovery_alert_threshold(),
            wall_clock_budget: default_wall_clock_budget(),
            safety_buffer: default_safety_buffer(),
            per_call_timeout: default_per_call_timeout(),
            poll_cap: default_poll_cap(),
            required_field: default_required_field(),
            write_chunk_size: default_write_chunk_size(),
            flag_write_attempts: default_flag_write_attempts(),
            store_retry_delay: default_store_retry_delay(),
            download_attempts: default_download_attempts(),
            download_retry_delay: default_download_retry_delay(),
            cache_path: default_cache_path(),
        }
    }
}

impl SluiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `SLUICE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Same as [`from_env`](Self::from_env) over an explicit variable set.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        let env = EnvReader { vars: &vars };
        let mut config = Self::default();

        if let Some(task_type) = env.string("SLUICE_TASK_TYPE") {
            config.task_type = task_type;
        }
        if let Some(n) = env.parse("SLUICE_BATCH_SIZE")? {
            config.batch_size = n;
        }
        for (key, value) in &vars {
            if let Some(task) = key.strip_prefix(BATCH_SIZE_OVERRIDE_PREFIX) {
                let size = parse_value(key, value)?;
                config
                    .batch_size_overrides
                    .insert(task.to_ascii_lowercase(), size);
            }
        }
        if let Some(n) = env.parse("SLUICE_CLAIM_FLOOR")? {
            config.claim_floor = n;
        }
        config.hard_limit = env.parse("SLUICE_HARD_LIMIT")?;
        if let Some(n) = env.parse("SLUICE_MAX_CONCURRENT")? {
            config.max_concurrent_jobs = n;
        }
        if let Some(fail_open) = env.flag("SLUICE_GATE_FAIL_OPEN")? {
            config.gate_degradation = if fail_open {
                DegradationMode::FailOpen
            } else {
                DegradationMode::FailClosed
            };
        }
        if let Some(name) = env.string("SLUICE_WORKFLOW_NAME") {
            config.workflow_name = name;
        }
        if let Some(path) = env.string("SLUICE_WORKFLOW_PATH") {
            config.workflow_path = path;
        }
        if let Some(event) = env.string("SLUICE_DISPATCH_EVENT") {
            config.dispatch_event = event;
        }
        if let Some(d) = env.secs("SLUICE_STUCK_TIMEOUT_SECS")? {
            config.stuck_lease_timeout = d;
        }
        if let Some(d) = env.secs("SLUICE_BUDGET_SECS")? {
            config.wall_clock_budget = d;
        }
        if let Some(d) = env.secs("SLUICE_SAFETY_BUFFER_SECS")? {
            config.safety_buffer = d;
        }
        if let Some(d) = env.secs("SLUICE_CALL_TIMEOUT_SECS")? {
            config.per_call_timeout = d;
        }
        if let Some(n) = env.parse("SLUICE_POLL_CAP")? {
            config.poll_cap = n;
        }
        if let Some(field) = env.string("SLUICE_REQUIRED_FIELD") {
            config.required_field = field;
        }
        if let Some(path) = env.string("SLUICE_CACHE_PATH") {
            config.cache_path = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_size_for(mut self, task_type: impl Into<String>, size: usize) -> Self {
        self.batch_size_overrides.insert(task_type.into(), size);
        self
    }

    pub fn with_claim_floor(mut self, floor: usize) -> Self {
        self.claim_floor = floor;
        self
    }

    pub fn with_hard_limit(mut self, limit: usize) -> Self {
        self.hard_limit = Some(limit);
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_gate_degradation(mut self, mode: DegradationMode) -> Self {
        self.gate_degradation = mode;
        self
    }

    pub fn with_stuck_lease_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_lease_timeout = timeout;
        self
    }

    pub fn with_budget(mut self, limit: Duration, safety_buffer: Duration) -> Self {
        self.wall_clock_budget = limit;
        self.safety_buffer = safety_buffer;
        self
    }

    pub fn with_per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = timeout;
        self
    }

    pub fn with_poll_cap(mut self, cap: usize) -> Self {
        self.poll_cap = cap;
        self
    }

    pub fn with_required_field(mut self, field: impl Into<String>) -> Self {
        self.required_field = field.into();
        self
    }

    pub fn with_recovery_paging(mut self, page_size: usize, cap: usize) -> Self {
        self.recovery_page_size = page_size;
        self.recovery_cap = cap;
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = path.into();
        self
    }

    /// Zero out every retry delay (tests).
    pub fn without_retry_delays(mut self) -> Self {
        self.dispatch_base_delay = Duration::ZERO;
        self.store_retry_delay = Duration::ZERO;
        self.download_retry_delay = Duration::ZERO;
        self
    }

    /// Claim size for `task_type`, honouring per-task overrides.
    pub fn batch_size_for(&self, task_type: &str) -> usize {
        self.batch_size_overrides
            .get(task_type)
            .copied()
            .unwrap_or(self.batch_size)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("batch_size", self.batch_size),
            ("claim_floor", self.claim_floor),
            ("max_concurrent_jobs", self.max_concurrent_jobs),
            ("recovery_page_size", self.recovery_page_size),
            ("recovery_cap", self.recovery_cap),
            ("poll_cap", self.poll_cap),
            ("write_chunk_size", self.write_chunk_size),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Validation(format!("{name} must be positive")));
        }
        if let Some((task, _)) = self.batch_size_overrides.iter().find(|(_, v)| **v == 0) {
            return Err(ConfigError::Validation(format!(
                "batch size override for {task} must be positive"
            )));
        }
        if self.claim_floor > self.batch_size {
            return Err(ConfigError::Validation(format!(
                "claim_floor ({}) exceeds batch_size ({})",
                self.claim_floor, self.batch_size
            )));
        }
        if self.hard_limit == Some(0) {
            return Err(ConfigError::Validation("hard_limit must be positive".into()));
        }
        if self.safety_buffer >= self.wall_clock_budget {
            return Err(ConfigError::Validation(format!(
                "safety_buffer ({:?}) must be smaller than wall_clock_budget ({:?})",
                self.safety_buffer, self.wall_clock_budget
            )));
        }
        if self.task_type.trim().is_empty() {
            return Err(ConfigError::Validation("task_type is empty".into()));
        }
        if self.required_field.trim().is_empty() {
            return Err(ConfigError::Validation("required_field is empty".into()));
        }
        if self.cache_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("cache_path is empty".into()));
        }
        Ok(())
    }
}

/// Connection settings for the REST adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    pub store_url: String,
    pub store_key: String,
    #[serde(default = "default_inference_url")]
    pub inference_url: String,
    pub inference_key: String,
    /// Repository API root of the downstream runner.
    pub dispatch_url: String,
    pub dispatch_token: String,
}

impl Endpoints {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        let env = EnvReader { vars: &vars };
        Ok(Self {
            store_url: env.required("SLUICE_STORE_URL")?,
            store_key: env.required("SLUICE_STORE_KEY")?,
            inference_url: env
                .string("SLUICE_INFERENCE_URL")
                .unwrap_or_else(default_inference_url),
            inference_key: env.required("SLUICE_INFERENCE_KEY")?,
            dispatch_url: env.required("SLUICE_DISPATCH_URL")?,
            dispatch_token: env.required("SLUICE_DISPATCH_TOKEN")?,
        })
    }
}

struct EnvReader<'a> {
    vars: &'a HashMap<String, String>,
}

impl EnvReader<'_> {
    fn string(&self, var: &str) -> Option<String> {
        self.vars
            .get(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &str) -> Result<String, ConfigError> {
        self.string(var)
            .ok_or_else(|| ConfigError::Missing(var.to_string()))
    }

    fn parse<T: std::str::FromStr>(&self, var: &str) -> Result<Option<T>, ConfigError> {
        self.string(var).map(|v| parse_value(var, &v)).transpose()
    }

    fn secs(&self, var: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_secs))
    }

    fn flag(&self, var: &str) -> Result<Option<bool>, ConfigError> {
        match self.string(var) {
            None => Ok(None),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::Invalid {
                    var: var.to_string(),
                    value: v,
                }),
            },
        }
    }
}

fn parse_value<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn default_task_type() -> String {
    "translate".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_claim_floor() -> usize {
    50
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_gate_failure_ceiling() -> u32 {
    3
}

fn default_gate_cache_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_workflow_name() -> String {
    "sluice-batch".to_string()
}

fn default_workflow_path() -> String {
    ".github/workflows/sluice-batch.yml".to_string()
}

fn default_run_event() -> String {
    "repository_dispatch".to_string()
}

fn default_run_branch() -> String {
    "main".to_string()
}

fn default_dispatch_event() -> String {
    "sluice-batch".to_string()
}

fn default_dispatch_attempts() -> u32 {
    3
}

fn default_dispatch_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_stuck_lease_timeout() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_recovery_page_size() -> usize {
    500
}

fn default_recovery_cap() -> usize {
    5000
}

fn default_recovery_alert_threshold() -> u32 {
    3
}

fn default_wall_clock_budget() -> Duration {
    Duration::from_secs(300)
}

fn default_safety_buffer() -> Duration {
    Duration::from_secs(30)
}

fn default_per_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_cap() -> usize {
    50
}

fn default_required_field() -> String {
    "output".to_string()
}

fn default_write_chunk_size() -> usize {
    500
}

fn default_flag_write_attempts() -> u32 {
    3
}

fn default_store_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_download_attempts() -> u32 {
    3
}

fn default_download_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".sluice/cache.json")
}

fn default_inference_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = SluiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.gate_degradation, DegradationMode::FailClosed);
        assert_eq!(config.cache_path, PathBuf::from(".sluice/cache.json"));
    }

    #[test]
    fn env_overrides_defaults() {
        let config = SluiceConfig::from_vars(vars(&[
            ("SLUICE_TASK_TYPE", "summarize"),
            ("SLUICE_BATCH_SIZE", "200"),
            ("SLUICE_BATCH_SIZE_TRANSLATE", "800"),
            ("SLUICE_GATE_FAIL_OPEN", "true"),
            ("SLUICE_STUCK_TIMEOUT_SECS", "600"),
            ("SLUICE_CACHE_PATH", "/var/lib/sluice/cache.json"),
            ("HOME", "/root"),
        ]))
        .unwrap();

        assert_eq!(config.cache_path, PathBuf::from("/var/lib/sluice/cache.json"));
        assert_eq!(config.task_type, "summarize");
        assert_eq!(config.batch_size_for("summarize"), 200);
        assert_eq!(config.batch_size_for("translate"), 800);
        assert_eq!(config.gate_degradation, DegradationMode::FailOpen);
        assert_eq!(config.stuck_lease_timeout, Duration::from_secs(600));
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let err = SluiceConfig::from_vars(vars(&[("SLUICE_POLL_CAP", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "SLUICE_POLL_CAP".into(),
                value: "lots".into()
            }
        );
    }

    #[rstest]
    #[case::zero_batch(SluiceConfig::default().with_batch_size(0))]
    #[case::floor_above_batch(SluiceConfig::default().with_batch_size(100).with_claim_floor(200))]
    #[case::buffer_eats_budget(
        SluiceConfig::default().with_budget(Duration::from_secs(30), Duration::from_secs(30))
    )]
    #[case::empty_required_field(SluiceConfig::default().with_required_field(" "))]
    #[case::empty_cache_path(SluiceConfig::default().with_cache_path(""))]
    fn invalid_configs_are_rejected(#[case] config: SluiceConfig) {
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn endpoints_require_credentials() {
        let err = Endpoints::from_vars(vars(&[("SLUICE_STORE_URL", "http://db")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SLUICE_STORE_KEY".into()));

        let endpoints = Endpoints::from_vars(vars(&[
            ("SLUICE_STORE_URL", "http://db/rest/v1"),
            ("SLUICE_STORE_KEY", "k"),
            ("SLUICE_INFERENCE_KEY", "sk"),
            ("SLUICE_DISPATCH_URL", "https://api.github.com/repos/o/r"),
            ("SLUICE_DISPATCH_TOKEN", "t"),
        ]))
        .unwrap();
        assert_eq!(endpoints.inference_url, "https://api.openai.com/v1");
    }
}
