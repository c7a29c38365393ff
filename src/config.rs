//! Server configuration.
//!
//! Loaded from an optional JSON file, then overridden by `CTLFRAME_*`
//! environment variables, then by command-line flags in the binary.
//! Missing file fields fall back to [`ServerConfig::default`].

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Socket file name used when no path is configured.
pub const DEFAULT_SOCKET_NAME: &str = "ctlframe.sock";

/// Longest usable `sun_path` on Linux, excluding the terminating NUL.
pub const MAX_SOCKET_PATH: usize = 107;

/// Configuration of the socket server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Detach from the terminal after binding.
    pub daemon_mode: bool,
    /// Started by a restart of a running server; take over its socket.
    pub restart_mode: bool,
    /// Remove an existing socket file even if a server answers on it.
    pub force_socket: bool,
    /// Name used in log lines and the pid file.
    pub program_name: String,
    /// Control socket path.
    pub socket_path: PathBuf,
    /// Log file; stderr when unset.
    pub log_path: Option<PathBuf>,
    /// Poll timeout while no job is queued, in milliseconds.
    pub select_timeout_ms: u64,
    /// WebSocket listener port; 0 disables it.
    pub ws_port: u16,
    /// WebSocket listener address.
    pub ws_bind: IpAddr,
    /// Permission bits of the control socket file.
    pub socket_mode: u32,
    /// Largest accepted control packet, envelope included.
    pub max_packet_len: usize,
    /// Largest accepted WebSocket message after reassembly.
    pub ws_max_payload: usize,
    /// Ticks handed to the head job per loop iteration.
    pub job_tick_budget: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let socket_path = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(DEFAULT_SOCKET_NAME);
        Self {
            daemon_mode: false,
            restart_mode: false,
            force_socket: false,
            program_name: "ctlframed".to_string(),
            socket_path,
            log_path: None,
            select_timeout_ms: 10_000,
            ws_port: 0,
            ws_bind: IpAddr::from([127, 0, 0, 1]),
            socket_mode: 0o600,
            max_packet_len: 16 * 1024 * 1024,
            ws_max_payload: 16 * 1024 * 1024,
            job_tick_budget: 100,
        }
    }
}

impl ServerConfig {
    /// Load `path` (if given), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `CTLFRAME_*` overrides read through `lookup`. Unparseable
    /// values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    log::warn!("[config] ignoring {}={:?}: not a valid value", key, raw);
                    None
                }
            }
        }
        fn flag(raw: Option<String>) -> Option<bool> {
            raw.map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        }

        if let Some(v) = lookup("CTLFRAME_SOCKET") {
            self.socket_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CTLFRAME_LOG") {
            self.log_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CTLFRAME_PROGRAM_NAME") {
            self.program_name = v;
        }
        if let Some(v) = flag(lookup("CTLFRAME_DAEMON")) {
            self.daemon_mode = v;
        }
        if let Some(v) = flag(lookup("CTLFRAME_FORCE_SOCKET")) {
            self.force_socket = v;
        }
        if let Some(v) = parsed(
            "CTLFRAME_SELECT_TIMEOUT_MS",
            lookup("CTLFRAME_SELECT_TIMEOUT_MS"),
        ) {
            self.select_timeout_ms = v;
        }
        if let Some(v) = parsed("CTLFRAME_WS_PORT", lookup("CTLFRAME_WS_PORT")) {
            self.ws_port = v;
        }
        if let Some(v) = parsed("CTLFRAME_WS_BIND", lookup("CTLFRAME_WS_BIND")) {
            self.ws_bind = v;
        }
        if let Some(v) = parsed("CTLFRAME_MAX_PACKET_LEN", lookup("CTLFRAME_MAX_PACKET_LEN")) {
            self.max_packet_len = v;
        }
        if let Some(v) = parsed("CTLFRAME_WS_MAX_PAYLOAD", lookup("CTLFRAME_WS_MAX_PAYLOAD")) {
            self.ws_max_payload = v;
        }
        if let Some(v) = parsed("CTLFRAME_JOB_TICK_BUDGET", lookup("CTLFRAME_JOB_TICK_BUDGET")) {
            self.job_tick_budget = v;
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let path_len = self.socket_path.as_os_str().len();
        if path_len == 0 {
            bail!("socket path is empty");
        }
        if path_len > MAX_SOCKET_PATH {
            bail!(
                "socket path {} is {} bytes, limit is {}",
                self.socket_path.display(),
                path_len,
                MAX_SOCKET_PATH
            );
        }
        if self.max_packet_len < crate::framing::ENVELOPE_LEN {
            bail!("max_packet_len {} is below the envelope size", self.max_packet_len);
        }
        if self.max_packet_len > u32::MAX as usize {
            bail!("max_packet_len {} does not fit the length prefix", self.max_packet_len);
        }
        if self.ws_max_payload == 0 {
            bail!("ws_max_payload must be positive");
        }
        if self.job_tick_budget == 0 {
            bail!("job_tick_budget must be positive");
        }
        if self.socket_mode > 0o777 {
            bail!("socket_mode {:o} is not a permission mask", self.socket_mode);
        }
        Ok(())
    }

    /// Pid file path: the socket path with a `.pid` extension.
    pub fn pid_path(&self) -> PathBuf {
        self.socket_path.with_extension("pid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.select_timeout_ms, 10_000);
        assert_eq!(config.ws_port, 0);
        assert_eq!(config.socket_mode, 0o600);
        assert!(config.socket_path.ends_with(DEFAULT_SOCKET_NAME));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        fs::write(&path, r#"{"ws_port": 8081, "socket_path": "/tmp/x.sock"}"#).unwrap();

        let config = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.ws_port, 8081);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/x.sock"));
        assert_eq!(config.job_tick_budget, 100);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        fs::write(&path, "{ not json").unwrap();
        let err = ServerConfig::load_from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse config file"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CTLFRAME_SOCKET", "/run/judge.sock"),
            ("CTLFRAME_WS_PORT", "9000"),
            ("CTLFRAME_DAEMON", "yes"),
            ("CTLFRAME_JOB_TICK_BUDGET", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config.apply_overrides(|k| env.get(k).map(ToString::to_string));
        assert_eq!(config.socket_path, PathBuf::from("/run/judge.sock"));
        assert_eq!(config.ws_port, 9000);
        assert!(config.daemon_mode);
        assert_eq!(config.job_tick_budget, 100);
    }

    #[test]
    fn test_validate_rejects_long_socket_path() {
        let config = ServerConfig {
            socket_path: PathBuf::from(format!("/tmp/{}", "s".repeat(200))),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_packet_limit() {
        let config = ServerConfig {
            max_packet_len: 2,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pid_path() {
        let config = ServerConfig {
            socket_path: PathBuf::from("/run/ctl.sock"),
            ..ServerConfig::default()
        };
        assert_eq!(config.pid_path(), PathBuf::from("/run/ctl.pid"));
    }
}
