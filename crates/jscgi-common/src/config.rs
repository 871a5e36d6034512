//! Server configuration.
//!
//! The configuration is built once at startup (defaults, then an optional
//! JSON config file, then command-line overrides), validated, and then shared
//! read-only as an `Arc<Config>`. Worker processes receive it serialized.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CgiError, Result};

/// Name of the config file picked up when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "js-cgi.config";

/// Name of the middleware script each worker loads at boot, if present.
pub const DEFAULT_USE_FILE: &str = "use.js";

/// Environment variable the supervisor uses to hand the configuration to
/// worker processes.
pub const WORKER_CONFIG_ENV: &str = "JSCGI_WORKER_CONFIG";

/// Immutable server configuration.
///
/// # Fields
///
/// - `host` / `port` - listen address shared by every worker (default `0.0.0.0:3000`)
/// - `workers` - pool size, at least 1 (default: CPU count minus one)
/// - `timeout` - default script deadline in milliseconds; `<= 0` disables it (default 30000)
/// - `localhost_only` - reject non-loopback clients with 401 (default true)
/// - `watch_required` - evict cached modules when their files change (default false)
/// - `document_root` - fallback document root (default `<install dir>/www`)
/// - `output_log` - append-only log of every line (default `<install dir>/js-cgi.log`)
/// - `error_log` - append-only log of warnings and errors (default `<install dir>/err.log`)
/// - `use_file` - middleware script loaded by every worker (default `<install dir>/use.js`)
///
/// The install dir is the directory holding the `jscgi` executable. A log set
/// to `null` in the config file is not written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub workers: usize,
    pub timeout: i64,
    #[serde(alias = "localhostOnly")]
    pub localhost_only: bool,
    pub watch_required: bool,
    pub document_root: PathBuf,
    pub output_log: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
    pub use_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            workers: default_workers(),
            timeout: 30_000,
            localhost_only: true,
            watch_required: false,
            document_root: install_dir().join("www"),
            output_log: Some(install_dir().join("js-cgi.log")),
            error_log: Some(install_dir().join("err.log")),
            use_file: install_dir().join(DEFAULT_USE_FILE),
        }
    }
}

/// Directory holding the running executable, or the working directory if
/// that cannot be determined.
pub fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// One worker per CPU, minus one for the supervisor, never fewer than one.
pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

impl Config {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON config file on top of the defaults.
    ///
    /// Keys missing from the file keep their default value.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CgiError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Parses a JSON document on top of the defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CgiError::Config(e.to_string()))
    }

    /// Serializes the configuration for a worker process.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Resolves the config to start from: an explicit file, else
    /// [`DEFAULT_CONFIG_FILE`] in the working directory, else the same name in
    /// the install dir, else defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let candidates = [PathBuf::from(DEFAULT_CONFIG_FILE), install_dir().join(DEFAULT_CONFIG_FILE)];
        match candidates.iter().find(|path| path.is_file()) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout_ms(mut self, timeout: i64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_localhost_only(mut self, localhost_only: bool) -> Self {
        self.localhost_only = localhost_only;
        self
    }

    pub fn with_watch(mut self, watch_required: bool) -> Self {
        self.watch_required = watch_required;
        self
    }

    pub fn with_document_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.document_root = root.into();
        self
    }

    pub fn with_output_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_log = Some(path.into());
        self
    }

    pub fn with_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_log = Some(path.into());
        self
    }

    /// Disables both log files; output still goes to stderr.
    pub fn without_log_files(mut self) -> Self {
        self.output_log = None;
        self.error_log = None;
        self
    }

    pub fn with_use_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.use_file = path.into();
        self
    }

    /// Address every worker binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Default deadline, or `None` when deadlines are disabled.
    pub fn default_timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.timeout as f64)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The worker count is zero
    /// - The document root is empty
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CgiError::Config("worker count must be at least 1".to_string()));
        }

        if self.document_root.as_os_str().is_empty() {
            return Err(CgiError::Config("document root must not be empty".to_string()));
        }

        Ok(())
    }
}

/// Converts a millisecond timeout into a deadline duration.
///
/// Values `<= 0`, NaN and infinities disable the deadline.
pub fn timeout_from_ms(ms: f64) -> Option<Duration> {
    if ms.is_finite() && ms > 0.0 {
        Some(Duration::from_millis(ms as u64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.timeout, 30_000);
        assert!(config.localhost_only);
        assert!(!config.watch_required);
        assert!(config.workers >= 1);
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_file_defaults_live_next_to_executable() {
        let dir = std::env::current_exe().unwrap().parent().unwrap().to_path_buf();
        let config = Config::default();
        assert_eq!(install_dir(), dir);
        assert_eq!(config.document_root, dir.join("www"));
        assert_eq!(config.output_log, Some(dir.join("js-cgi.log")));
        assert_eq!(config.error_log, Some(dir.join("err.log")));
        assert_eq!(config.use_file, dir.join("use.js"));
    }

    #[test]
    fn test_null_log_disables_it() {
        let config = Config::from_json(r#"{"output_log": null}"#).unwrap();
        assert_eq!(config.output_log, None);
        assert!(config.error_log.is_some());
        assert_eq!(Config::new().without_log_files().error_log, None);
    }

    #[test]
    fn test_default_workers_has_floor_of_one() {
        assert!(default_workers() >= 1);
        assert!(default_workers() <= num_cpus::get().max(1));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{"port": 8081, "watch_required": true}"#).unwrap();
        assert_eq!(config.port, 8081);
        assert!(config.watch_required);
        assert_eq!(config.timeout, 30_000);
        assert!(config.localhost_only);
    }

    #[test]
    fn test_legacy_localhost_key() {
        let config = Config::from_json(r#"{"localhostOnly": false}"#).unwrap();
        assert!(!config.localhost_only);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"timeout": 500, "workers": 2, "error_log": "/tmp/err.log"}}"#).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.timeout, 500);
        assert_eq!(config.workers, 2);
        assert_eq!(config.error_log, Some(PathBuf::from("/tmp/err.log")));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file("/nonexistent/js-cgi.config").unwrap_err();
        assert!(matches!(err, CgiError::Config(_)));
    }

    #[test]
    fn test_worker_handoff_roundtrip() {
        let config = Config::new()
            .with_port(0)
            .with_workers(3)
            .with_document_root("/srv/www")
            .with_localhost_only(false);
        let restored = Config::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let err = Config::new().with_workers(0).validate().unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_non_positive_timeout_disables_deadline() {
        assert_eq!(Config::new().with_timeout_ms(0).default_timeout(), None);
        assert_eq!(Config::new().with_timeout_ms(-5).default_timeout(), None);
        assert_eq!(timeout_from_ms(f64::NAN), None);
        assert_eq!(timeout_from_ms(200.0), Some(Duration::from_millis(200)));
    }
}
