//! Runtime configuration and source descriptors.
//!
//! Loaded from TOML; every field has a default so a config file only has to
//! list its `[[sources]]`. Validation happens once, right after load, and is
//! the only place a run can fail before it starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::ResultFilter;
use crate::error::ConfigError;
use crate::output::OutputFormat;
use crate::state::StatePolicy;

/// Directory under the user's home holding the default config file.
const CONFIG_DIR: &str = ".proxy-harvest";
const CONFIG_FILE: &str = "config.toml";
const HISTORY_FILE: &str = "proxy_history.json";

/// One remote source of configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub url: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    /// Relative importance in `[0, 1]`.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Declared protocol families. Metadata only; use `include_protocols`
    /// / `exclude_protocols` to filter output.
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Lower runs first; `>= 1`.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Starting reliability in `[0, 1]`, updated from fetch outcomes.
    #[serde(default = "default_reliability")]
    pub reliability_score: f64,
}

fn default_tier() -> String {
    "default".into()
}

fn default_weight() -> f64 {
    1.0
}

fn default_priority() -> u32 {
    1
}

fn default_reliability() -> f64 {
    1.0
}

impl SourceDescriptor {
    /// Descriptor with defaults for everything but the URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tier: default_tier(),
            weight: default_weight(),
            protocols: Vec::new(),
            priority: default_priority(),
            reliability_score: default_reliability(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSource {
            url: self.url.clone(),
            reason,
        };
        let parsed = reqwest::Url::parse(&self.url).map_err(|e| invalid(format!("bad URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
        }
        if !(0.0..=1.0).contains(&self.weight) {
            return Err(invalid(format!("weight {} outside [0, 1]", self.weight)));
        }
        if !(0.0..=1.0).contains(&self.reliability_score) {
            return Err(invalid(format!(
                "reliability_score {} outside [0, 1]",
                self.reliability_score
            )));
        }
        if self.priority == 0 {
            return Err(invalid("priority must be >= 1".into()));
        }
        Ok(())
    }
}

/// Everything a run needs besides the sources' contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    // ── Network ─────────────────────────────────────────────────────
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_jitter_ms: u64,
    pub retry_cap_ms: u64,
    pub fail_fast_client_errors: bool,
    pub user_agent: String,
    /// Sources fetched at the same time.
    pub concurrent_limit: usize,

    // ── Testing ─────────────────────────────────────────────────────
    pub enable_url_test: bool,
    /// Add a TLS handshake on top of TCP connect for TLS-riding protocols.
    pub full_test: bool,
    /// Verify server certificates during the handshake. Off by default:
    /// proxy endpoints commonly present self-signed or mismatched certs.
    pub verify_tls: bool,
    pub test_timeout_ms: u64,
    pub test_concurrency: usize,

    // ── Filters ─────────────────────────────────────────────────────
    pub include_protocols: Vec<String>,
    pub exclude_protocols: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub tls_fragment: Option<String>,

    // ── Batching ────────────────────────────────────────────────────
    /// Flush cadence in unique records; `0` disables incremental batches.
    pub save_every: usize,
    pub strict_batch: bool,
    pub cumulative_batches: bool,
    pub sort_by_ping: bool,
    pub top_n: usize,
    pub stop_after_found: usize,
    pub deadline_secs: Option<u64>,

    // ── Output ──────────────────────────────────────────────────────
    pub output_dir: PathBuf,
    pub formats: Vec<OutputFormat>,
    pub history_path: Option<PathBuf>,

    // ── Source state ────────────────────────────────────────────────
    pub failing_max_duration_secs: u64,
    pub failure_window_mins: u64,
    pub max_failures: usize,
    pub inactive_max_duration_secs: u64,
    pub history_cap: usize,

    pub sources: Vec<SourceDescriptor>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            max_retries: 3,
            retry_base_ms: 500,
            retry_jitter_ms: 250,
            retry_cap_ms: 8_000,
            fail_fast_client_errors: false,
            user_agent: format!("proxy-harvest/{}", env!("CARGO_PKG_VERSION")),
            concurrent_limit: 16,
            enable_url_test: true,
            full_test: false,
            verify_tls: false,
            test_timeout_ms: 3_000,
            test_concurrency: 128,
            include_protocols: Vec::new(),
            exclude_protocols: Vec::new(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            tls_fragment: None,
            save_every: 0,
            strict_batch: true,
            cumulative_batches: false,
            sort_by_ping: true,
            top_n: 0,
            stop_after_found: 0,
            deadline_secs: None,
            output_dir: PathBuf::from("./output"),
            formats: OutputFormat::ALL.to_vec(),
            history_path: None,
            failing_max_duration_secs: 300,
            failure_window_mins: 10,
            max_failures: 5,
            inactive_max_duration_secs: 1_800,
            history_cap: crate::state::machine::DEFAULT_HISTORY_CAP,
            sources: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// `~/.proxy-harvest/config.toml`, if a home directory can be resolved.
    pub fn default_path() -> Option<PathBuf> {
        directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Read, parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from [`Self::default_path`] when none is given.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = Self::default_path().ok_or_else(|| {
                    ConfigError::InvalidValue("cannot resolve home directory for default config".into())
                })?;
                Self::load(&default)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        for source in &self.sources {
            source.validate()?;
        }
        if self.concurrent_limit == 0 {
            return Err(ConfigError::InvalidValue("concurrent_limit must be > 0".into()));
        }
        if self.test_concurrency == 0 {
            return Err(ConfigError::InvalidValue("test_concurrency must be > 0".into()));
        }
        if self.test_timeout_ms == 0 || self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("timeouts must be > 0".into()));
        }
        if self.formats.is_empty() {
            return Err(ConfigError::InvalidValue("at least one output format is required".into()));
        }
        // Compiles every pattern; surfaces the first bad one.
        ResultFilter::from_config(self)?;
        Ok(())
    }

    pub fn history_path(&self) -> PathBuf {
        self.history_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join(HISTORY_FILE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    pub fn state_policy(&self) -> StatePolicy {
        StatePolicy {
            failing_max_duration: chrono::Duration::seconds(clamp_units(self.failing_max_duration_secs)),
            failure_window: chrono::Duration::minutes(clamp_units(self.failure_window_mins)),
            max_failures: self.max_failures,
            inactive_max_duration: chrono::Duration::seconds(clamp_units(self.inactive_max_duration_secs)),
            history_cap: self.history_cap,
        }
    }
}

/// Keeps chrono duration constructors far from their overflow bound.
fn clamp_units(value: u64) -> i64 {
    i64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(content: &str) -> (PathBuf, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, content).expect("write config");
        (path, dir)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let (path, _dir) = write_config(
            r#"
[[sources]]
url = "https://example.com/sub.txt"
"#,
        );
        let config = RuntimeConfig::load(&path).expect("load");
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].priority, 1);
        assert_eq!(config.sources[0].weight, 1.0);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.concurrent_limit, 16);
        assert!(config.strict_batch);
        assert_eq!(config.formats.len(), OutputFormat::ALL.len());
        assert_eq!(config.history_path(), PathBuf::from("./output").join(HISTORY_FILE));
    }

    #[test]
    fn overrides_are_applied() {
        let (path, _dir) = write_config(
            r#"
save_every = 10
strict_batch = false
formats = ["raw", "clash"]
include_protocols = ["VLESS", "trojan"]
deadline_secs = 60

[[sources]]
url = "https://a.example/list"
tier = "gold"
weight = 0.5
priority = 2
protocols = ["vless"]
"#,
        );
        let config = RuntimeConfig::load(&path).expect("load");
        assert_eq!(config.save_every, 10);
        assert!(!config.strict_batch);
        assert_eq!(config.formats, vec![OutputFormat::Raw, OutputFormat::Clash]);
        assert_eq!(config.deadline(), Some(Duration::from_secs(60)));
        assert_eq!(config.sources[0].tier, "gold");
    }

    #[test]
    fn empty_sources_is_fatal() {
        let (path, _dir) = write_config("save_every = 5\n");
        let err = RuntimeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::NoSources));
    }

    #[test]
    fn bad_weight_is_rejected() {
        let mut config = RuntimeConfig::default();
        let mut source = SourceDescriptor::from_url("https://a.example/list");
        source.weight = 1.5;
        config.sources.push(source);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSource { .. })));
    }

    #[test]
    fn non_http_source_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.sources.push(SourceDescriptor::from_url("ftp://a.example/list"));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSource { .. })));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.sources.push(SourceDescriptor::from_url("https://a.example/list"));
        config.exclude_patterns.push("([unclosed".into());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = TempDir::new().expect("temp dir");
        let err = RuntimeConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let (path, _dir) = write_config("sources = [[[");
        assert!(matches!(RuntimeConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn state_policy_mirrors_config() {
        let config = RuntimeConfig::default();
        let policy = config.state_policy();
        assert_eq!(policy.failing_max_duration, chrono::Duration::seconds(300));
        assert_eq!(policy.failure_window, chrono::Duration::minutes(10));
        assert_eq!(policy.max_failures, 5);
    }
}
