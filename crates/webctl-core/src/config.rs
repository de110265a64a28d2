//! Configuration resolution for webctl.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/webctl/settings.json)
//! 3. Project config (.webctl/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Complete webctl configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub sessions: SessionSettings,
}

/// When idle sessions are swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// The run loop ticks every `sweep_interval_secs`.
    #[default]
    Timer,
    /// `handle_request` sweeps opportunistically once the interval has passed.
    OnRequest,
}

/// Request controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Dispatch requests through the worker pool instead of the caller task.
    pub threaded: bool,
    pub worker_threads: usize,
    /// Uploads declaring a larger total are aborted.
    pub max_request_bytes: u64,
    /// Serve every request from this one session.
    pub single_session_id: Option<String>,
    /// Upper bound on a single readiness wait.
    pub poll_interval_ms: u16,
    pub expiry_policy: ExpiryPolicy,
    pub log_level: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            threaded: true,
            worker_threads: 10,
            max_request_bytes: 128 * 1024 * 1024, // 128 MB
            single_session_id: None,
            poll_interval_ms: 100,
            expiry_policy: ExpiryPolicy::Timer,
            log_level: "info".to_string(),
        }
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Idle time after which a session is expired.
    pub timeout_secs: u64,
    pub session_id_length: usize,
    pub sweep_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            session_id_length: 16,
            sweep_interval_secs: 5,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".webctl").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("webctl").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.controller.single_session_id.is_some() {
        base.controller.single_session_id = overlay.controller.single_session_id;
    }
    base.controller.threaded = overlay.controller.threaded;
    base.controller.worker_threads = overlay.controller.worker_threads;
    base.controller.max_request_bytes = overlay.controller.max_request_bytes;
    base.controller.poll_interval_ms = overlay.controller.poll_interval_ms;
    base.controller.expiry_policy = overlay.controller.expiry_policy;
    base.controller.log_level = overlay.controller.log_level;

    base.sessions = overlay.sessions;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("WEBCTL_THREADED")
        && let Ok(b) = val.parse()
    {
        config.controller.threaded = b;
    }
    if let Ok(val) = std::env::var("WEBCTL_WORKER_THREADS")
        && let Ok(n) = val.parse()
    {
        config.controller.worker_threads = n;
    }
    if let Ok(val) = std::env::var("WEBCTL_SESSION_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.sessions.timeout_secs = n;
    }
    if let Ok(val) = std::env::var("WEBCTL_SINGLE_SESSION_ID") {
        config.controller.single_session_id = (!val.is_empty()).then_some(val);
    }
    if let Ok(val) = std::env::var("WEBCTL_LOG_LEVEL") {
        config.controller.log_level = val;
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.controller.worker_threads == 0 {
        return Err(Error::Config("worker_threads must be positive".into()));
    }
    if config.sessions.timeout_secs == 0 {
        return Err(Error::Config("timeout_secs must be positive".into()));
    }
    if config.sessions.session_id_length == 0 {
        return Err(Error::Config("session_id_length must be positive".into()));
    }
    if let Some(id) = &config.controller.single_session_id
        && !id.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(Error::Config(format!(
            "single_session_id must be alphanumeric: {id:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_threaded() {
        let config = Config::default();
        assert!(config.controller.threaded);
        assert_eq!(config.controller.worker_threads, 10);
        assert_eq!(config.controller.expiry_policy, ExpiryPolicy::Timer);
    }

    #[test]
    fn default_session_timeout_is_ten_minutes() {
        let config = Config::default();
        assert_eq!(config.sessions.timeout_secs, 600);
        assert_eq!(config.sessions.session_id_length, 16);
    }

    #[test]
    fn project_file_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = dir.path().join(".webctl");
        std::fs::create_dir_all(&settings).unwrap();
        std::fs::write(
            settings.join("settings.json"),
            r#"{
                "controller": { "threaded": false, "expiry_policy": "on_request" },
                "sessions": { "timeout_secs": 30 }
            }"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert!(!config.controller.threaded);
        assert_eq!(config.controller.expiry_policy, ExpiryPolicy::OnRequest);
        assert_eq!(config.sessions.timeout_secs, 30);
        // Unspecified fields keep their defaults.
        assert_eq!(config.sessions.session_id_length, 16);
    }

    #[test]
    fn malformed_project_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = dir.path().join(".webctl");
        std::fs::create_dir_all(&settings).unwrap();
        std::fs::write(settings.join("settings.json"), "{ not json").unwrap();

        let err = load_config(Some(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = Config::default();
        config.controller.worker_threads = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn zero_session_timeout_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = dir.path().join(".webctl");
        std::fs::create_dir_all(&settings).unwrap();
        std::fs::write(
            settings.join("settings.json"),
            r#"{ "sessions": { "timeout_secs": 0 } }"#,
        )
        .unwrap();

        let err = load_config(Some(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_id_length_rejected() {
        let mut config = Config::default();
        config.sessions.session_id_length = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn non_alphanumeric_single_session_rejected() {
        let mut config = Config::default();
        config.controller.single_session_id = Some("bad id".into());
        assert!(validate(&config).is_err());
        config.controller.single_session_id = Some("fixed01".into());
        assert!(validate(&config).is_ok());
    }
}
