//! Daemon configuration — TOML file plus `AGENTD_*` environment overrides.
//!
//! Covers `shared_reload` (1..18000), `nocmerged`, transport protocol, plus
//! the filesystem layout paths that would otherwise be compiled-in
//! constants.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Lower and upper bound (inclusive) for `shared_reload`, in seconds.
pub const SHARED_RELOAD_MIN: u64 = 1;
pub const SHARED_RELOAD_MAX: u64 = 18_000;

/// The literal filename of the synthetic merged bundle.
pub const MERGED_BUNDLE_NAME: &str = "merged.mg";

/// Transport protocol selection — affects send pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Connection-oriented transport — no send pacing.
    Stream,
    /// Datagram transport — paced to avoid overrunning the receiver.
    Datagram,
}

impl Protocol {
    /// Whether this protocol requires pacing content frames.
    pub fn is_datagram(self) -> bool {
        matches!(self, Self::Datagram)
    }
}

/// Daemon configuration, loaded from a TOML file and overridden by
/// environment variables of the form `AGENTD_<FIELD>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory containing one subdirectory per group.
    pub shared_dir: PathBuf,
    /// Directory holding per-agent keep-alive files.
    pub agentinfo_dir: PathBuf,
    /// Fixed path to the system active-response configuration file.
    pub active_response_file: PathBuf,
    /// Rebuild cadence, in seconds. Clamped to `[SHARED_RELOAD_MIN, SHARED_RELOAD_MAX]`.
    pub shared_reload: u64,
    /// When true, skip rewriting `merged.mg` but still index present files.
    pub nocmerged: bool,
    /// Maximum number of agents; bounds the pending-queue capacity.
    pub max_agents: usize,
    /// Transport protocol, affecting send pacing.
    pub protocol: Protocol,
    /// Address the daemon's transport listens on.
    pub listen_addr: String,
    /// `tracing` log level (trace/debug/info/warn/error).
    pub log_level: String,
    /// Log format: "text" or "json".
    pub log_format: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            shared_dir: PathBuf::from("/var/ossec/etc/shared"),
            agentinfo_dir: PathBuf::from("/var/ossec/queue/agent-info"),
            active_response_file: PathBuf::from("/var/ossec/etc/shared/ar.conf"),
            shared_reload: 10,
            nocmerged: false,
            max_agents: 16_384,
            protocol: Protocol::Stream,
            listen_addr: "0.0.0.0:1514".to_owned(),
            log_level: "info".to_owned(),
            log_format: "text".to_owned(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `path` (TOML), then apply `AGENTD_*` env
    /// overrides, then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|e| ConfigError {
                path: Some(path.to_path_buf()),
                message: format!("failed to read config file: {e}"),
            })?;
            toml::from_str::<Self>(&text).map_err(|e| ConfigError {
                path: Some(path.to_path_buf()),
                message: format!("failed to parse config file: {e}"),
            })?
        } else {
            Self::default()
        };

        cfg.apply_env_overrides();
        cfg.validate().map_err(|message| ConfigError {
            path: Some(path.to_path_buf()),
            message,
        })?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AGENTD_SHARED_DIR") {
            self.shared_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AGENTD_AGENTINFO_DIR") {
            self.agentinfo_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AGENTD_ACTIVE_RESPONSE_FILE") {
            self.active_response_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AGENTD_SHARED_RELOAD") {
            if let Ok(n) = v.parse::<u64>() {
                self.shared_reload = n;
            }
        }
        if let Ok(v) = std::env::var("AGENTD_NOCMERGED") {
            self.nocmerged = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("AGENTD_MAX_AGENTS") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_agents = n;
            }
        }
        if let Ok(v) = std::env::var("AGENTD_PROTOCOL") {
            match v.to_ascii_lowercase().as_str() {
                "stream" => self.protocol = Protocol::Stream,
                "datagram" => self.protocol = Protocol::Datagram,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("AGENTD_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("AGENTD_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("AGENTD_LOG_FORMAT") {
            self.log_format = v;
        }
    }

    /// Clamp `shared_reload` into range and reject a zero `max_agents`.
    fn validate(&mut self) -> Result<(), String> {
        self.shared_reload = self
            .shared_reload
            .clamp(SHARED_RELOAD_MIN, SHARED_RELOAD_MAX);
        if self.max_agents == 0 {
            return Err("max_agents must be greater than zero".to_owned());
        }
        Ok(())
    }
}
