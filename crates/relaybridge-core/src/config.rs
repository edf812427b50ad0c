//! Configuration resolution for relaybridge.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. Config file (`--config`, else `./config.yaml`, else
//!    `<config_dir>/relaybridge/config.yaml`)
//! 3. Environment variables (`RELAYBRIDGE_*`)
//! 4. CLI arguments (applied by the binary)
//!
//! The file keys `backend_listen` / `backend_url` are accepted as aliases for
//! `listen` / `upstream_url`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// File name looked up in the working directory and the user config dir.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Complete relaybridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Observer-facing listener, `host:port`.
    #[serde(alias = "backend_listen")]
    pub listen: String,
    /// Upstream aggregator WebSocket URL; no upstream link when unset.
    #[serde(alias = "backend_url")]
    pub upstream_url: Option<String>,
    pub worker: WorkerConfig,
    pub upstream: UpstreamSettings,
    pub observers: ObserverConfig,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "localhost:3126".to_string(),
            upstream_url: None,
            worker: WorkerConfig::default(),
            upstream: UpstreamSettings::default(),
            observers: ObserverConfig::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// When the supervised worker is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStart {
    /// As soon as the bridge is up.
    Immediate,
    /// The first time the upstream link connects. Falls back to
    /// `Immediate` when no upstream is configured.
    #[default]
    OnUpstream,
    /// Never automatically.
    Manual,
}

/// What `start()` does while a worker is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    #[default]
    Reject,
    /// Terminate the running worker first.
    Replace,
}

/// Worker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub path: Option<PathBuf>,
    pub args: Vec<String>,
    pub start: WorkerStart,
    pub on_busy: BusyPolicy,
    /// Seconds to wait after SIGTERM before killing.
    pub terminate_timeout_secs: u64,
    /// Write upstream `command` messages to the worker's stdin.
    pub accept_commands: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            path: None,
            args: Vec::new(),
            start: WorkerStart::default(),
            on_busy: BusyPolicy::default(),
            terminate_timeout_secs: 5,
            accept_commands: false,
        }
    }
}

impl WorkerConfig {
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Upstream link reconnection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub reconnect_delay_ms: u64,
    /// 1.0 keeps the delay fixed.
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 3000,
            backoff_multiplier: 1.0,
            max_delay_ms: 60_000,
            max_attempts: None,
        }
    }
}

/// Observer connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Per-connection outbound queue; an observer that falls this far behind is dropped.
    pub queue_capacity: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

impl Config {
    /// Worker start mode after accounting for a missing upstream.
    pub fn effective_worker_start(&self) -> WorkerStart {
        match self.worker.start {
            WorkerStart::OnUpstream if self.upstream_url.is_none() => WorkerStart::Immediate,
            other => other,
        }
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        parse_listen(&self.listen)?;
        if let Some(url) = &self.upstream_url {
            validate_upstream_url(url)?;
        }
        if self.observers.queue_capacity == 0 {
            return Err(Error::Config(
                "observers.queue_capacity must be greater than 0".into(),
            ));
        }
        if self.upstream.reconnect_delay_ms == 0 {
            return Err(Error::Config(
                "upstream.reconnect_delay_ms must be greater than 0".into(),
            ));
        }
        let multiplier = self.upstream.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(Error::Config(
                "upstream.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.worker.path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            return Err(Error::Config("worker.path must not be empty".into()));
        }
        Ok(())
    }
}

/// Split a `host:port` listen address.
pub fn parse_listen(listen: &str) -> Result<(String, u16)> {
    let (host, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("listen address '{listen}' is not host:port")))?;
    if host.is_empty() {
        return Err(Error::Config(format!(
            "listen address '{listen}' has an empty host"
        )));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("listen address '{listen}' has an invalid port")))?;
    if port == 0 {
        return Err(Error::Config(format!(
            "listen address '{listen}' must use a non-zero port"
        )));
    }
    Ok((host.to_string(), port))
}

fn validate_upstream_url(raw: &str) -> Result<()> {
    let url = url::Url::parse(raw)
        .map_err(|e| Error::Config(format!("upstream_url '{raw}' is invalid: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::Config(format!(
            "upstream_url '{raw}' must use ws:// or wss://"
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::Config(format!("upstream_url '{raw}' has no host")));
    }
    Ok(())
}

/// Load configuration with hierarchical resolution.
///
/// An explicit path must exist. Without one, the first discovered config file
/// is used, falling back to defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = match explicit {
        Some(path) => load_config_file(path)?,
        None => match discover_config_path() {
            Some(path) => load_config_file(&path)?,
            None => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// First existing config file in the default search locations.
pub fn discover_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    global_config_path().filter(|p| p.exists())
}

/// `<config_dir>/relaybridge/config.yaml`.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relaybridge").join(CONFIG_FILE_NAME))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

/// Apply `RELAYBRIDGE_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("RELAYBRIDGE_LISTEN") {
        config.listen = val;
    }
    if let Some(val) = lookup("RELAYBRIDGE_UPSTREAM_URL") {
        config.upstream_url = Some(val).filter(|v| !v.is_empty());
    }
    if let Some(val) = lookup("RELAYBRIDGE_WORKER_PATH") {
        config.worker.path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("RELAYBRIDGE_LOG_LEVEL") {
        config.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.listen, "localhost:3126");
        assert_eq!(config.upstream.reconnect_delay_ms, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn legacy_keys_are_accepted() {
        let file = write_config(
            "backend_listen: 0.0.0.0:4000\nbackend_url: ws://localhost:3126?type=controller\nfrontend_port: 5173\n",
        );
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.listen, "0.0.0.0:4000");
        assert_eq!(
            config.upstream_url.as_deref(),
            Some("ws://localhost:3126?type=controller")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn nested_sections_parse() {
        let file = write_config(
            "listen: 127.0.0.1:9000\nworker:\n  path: ./battlefield\n  args: [--games, '10']\n  start: manual\n  on_busy: replace\nupstream:\n  reconnect_delay_ms: 500\n",
        );
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.worker.path, Some(PathBuf::from("./battlefield")));
        assert_eq!(config.worker.args, vec!["--games", "10"]);
        assert_eq!(config.worker.start, WorkerStart::Manual);
        assert_eq!(config.worker.on_busy, BusyPolicy::Replace);
        assert_eq!(config.upstream.reconnect_delay_ms, 500);
        assert_eq!(config.observers.queue_capacity, 256);
    }

    #[test]
    fn empty_file_means_defaults() {
        let file = write_config("   \n");
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.listen, Config::default().listen);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unparseable_file_is_an_error() {
        let file = write_config("listen: [unterminated\n");
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn validate_rejects_bad_listen() {
        for listen in ["localhost", ":3126", "localhost:http", "localhost:0", "h:70000"] {
            let config = Config {
                listen: listen.to_string(),
                ..Config::default()
            };
            assert!(config.validate().is_err(), "{listen} should be rejected");
        }
    }

    #[test]
    fn validate_rejects_non_websocket_upstream() {
        for url in ["http://localhost:3126", "not a url", "ws://"] {
            let config = Config {
                upstream_url: Some(url.to_string()),
                ..Config::default()
            };
            assert!(config.validate().is_err(), "{url} should be rejected");
        }
    }

    #[test]
    fn validate_rejects_zero_capacity_and_delay() {
        let mut config = Config::default();
        config.observers.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.upstream.reconnect_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_listen_splits_host_and_port() {
        assert_eq!(
            parse_listen("localhost:3126").unwrap(),
            ("localhost".to_string(), 3126)
        );
        assert_eq!(parse_listen("[::1]:80").unwrap(), ("[::1]".to_string(), 80));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("RELAYBRIDGE_LISTEN", "0.0.0.0:1234"),
            ("RELAYBRIDGE_UPSTREAM_URL", "ws://agg:1"),
            ("RELAYBRIDGE_WORKER_PATH", "/opt/worker"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string));
        assert_eq!(config.listen, "0.0.0.0:1234");
        assert_eq!(config.upstream_url.as_deref(), Some("ws://agg:1"));
        assert_eq!(config.worker.path, Some(PathBuf::from("/opt/worker")));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn empty_upstream_env_clears_url() {
        let mut config = Config {
            upstream_url: Some("ws://x:1".into()),
            ..Config::default()
        };
        apply_env_overrides(&mut config, |k| {
            (k == "RELAYBRIDGE_UPSTREAM_URL").then(String::new)
        });
        assert!(config.upstream_url.is_none());
    }

    #[test]
    fn on_upstream_without_url_starts_immediately() {
        let config = Config::default();
        assert_eq!(config.effective_worker_start(), WorkerStart::Immediate);
        let config = Config {
            upstream_url: Some("ws://agg:1".into()),
            ..Config::default()
        };
        assert_eq!(config.effective_worker_start(), WorkerStart::OnUpstream);
    }
}
