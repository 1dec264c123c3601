//! The agent configuration distribution core: ties the Bundle Builder,
//! Heartbeat Intake, Reconciliation Worker, Periodic Refresher, and
//! Per-Agent Pending State together behind one handle.

pub mod bundle;
pub mod collaborators;
pub mod intake;
pub mod pending;
pub mod reconcile;
pub mod refresher;
pub mod types;

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

pub use collaborators::{AgentKey, GroupStore, KeyStore, RequestRouter, Transport};
pub use intake::MessageKind;
pub use types::{AgentId, Index};

use crate::config::DaemonConfig;
use crate::error::CoreError;

/// A running core's state, shared between the intake path (driven by
/// whatever accepts connections in `main`) and the two background worker
/// threads.
pub struct Core {
    index: Arc<Mutex<Index>>,
    pending: Arc<pending::PendingState>,
    shared_dir: PathBuf,
    agentinfo_dir: PathBuf,
    active_response_file: PathBuf,
    nocmerged: bool,
    shared_reload: Duration,
}

/// Point-in-time counters for `agentd status`.
#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub groups: usize,
    pub agents_seen: usize,
    pub queue_len: usize,
}

impl Core {
    /// Build a core from `config`: create the agent-info directory and run
    /// an initial Bundle Builder pass before any worker thread starts, so
    /// the first heartbeat that arrives already has an authoritative table
    /// to reconcile against.
    pub fn new(config: &DaemonConfig) -> Result<Self, CoreError> {
        if !config.shared_dir.is_dir() {
            return Err(CoreError::SharedDirUnavailable {
                path: config.shared_dir.clone(),
                detail: "not a directory or does not exist".to_owned(),
            });
        }
        fs::create_dir_all(&config.agentinfo_dir).map_err(|e| CoreError::AgentInfoDirUnavailable {
            path: config.agentinfo_dir.clone(),
            detail: e.to_string(),
        })?;

        let index = Arc::new(Mutex::new(Index::new()));
        bundle::rebuild(
            &index,
            &config.shared_dir,
            &config.active_response_file,
            config.nocmerged,
        );

        Ok(Self {
            index,
            pending: Arc::new(pending::PendingState::new(config.max_agents)),
            shared_dir: config.shared_dir.clone(),
            agentinfo_dir: config.agentinfo_dir.clone(),
            active_response_file: config.active_response_file.clone(),
            nocmerged: config.nocmerged,
            shared_reload: Duration::from_secs(config.shared_reload),
        })
    }

    /// Spawn the Periodic Refresher and Reconciliation Worker on their own
    /// threads. `group_store` and `transport` are shared with the caller's
    /// intake path.
    pub fn spawn_background(
        &self,
        group_store: Arc<dyn GroupStore>,
        transport: Arc<dyn Transport>,
    ) {
        let index = Arc::clone(&self.index);
        let shared_dir = self.shared_dir.clone();
        let active_response_file = self.active_response_file.clone();
        let nocmerged = self.nocmerged;
        let interval = self.shared_reload;
        thread::Builder::new()
            .name("refresher".to_owned())
            .spawn(move || refresher::run(&index, &shared_dir, &active_response_file, nocmerged, interval))
            .expect("failed to spawn periodic-refresher thread");

        let index = Arc::clone(&self.index);
        let pending = Arc::clone(&self.pending);
        let shared_dir = self.shared_dir.clone();
        thread::Builder::new()
            .name("reconciler".to_owned())
            .spawn(move || reconcile::run(&pending, &index, group_store.as_ref(), transport.as_ref(), &shared_dir))
            .expect("failed to spawn reconciliation-worker thread");

        info!("background workers started");
    }

    /// Classify and process one control message from `key.id`. Called from
    /// whatever accepts agent connections in `main`.
    pub fn ingest(
        &self,
        key: &AgentKey,
        message: &str,
        router: &dyn RequestRouter,
        transport: &dyn Transport,
    ) -> MessageKind {
        intake::ingest(key, message, &self.pending, &self.agentinfo_dir, router, transport)
    }

    /// Force an immediate Bundle Builder pass, bypassing `shared_reload`'s
    /// cadence (used by `agentd rebuild`).
    pub fn rebuild_now(&self) {
        bundle::rebuild(&self.index, &self.shared_dir, &self.active_response_file, self.nocmerged);
    }

    /// Snapshot counters for `agentd status`.
    pub fn status(&self) -> CoreStatus {
        let groups = self.index.lock().expect("index mutex poisoned").groups.len();
        CoreStatus {
            groups,
            agents_seen: self.pending.agent_count(),
            queue_len: self.pending.queue_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collaborators::{InMemoryGroupStore, NullRequestRouter, RecordingTransport};
    use std::fs as stdfs;
    use tempfile::TempDir;

    fn config_for(tmp: &TempDir) -> DaemonConfig {
        let shared = tmp.path().join("shared");
        stdfs::create_dir_all(shared.join("default")).unwrap();
        stdfs::write(shared.join("default").join("a.txt"), b"hello").unwrap();
        DaemonConfig {
            shared_dir: shared,
            agentinfo_dir: tmp.path().join("agent-info"),
            active_response_file: tmp.path().join("no-ar.conf"),
            max_agents: 16,
            ..DaemonConfig::default()
        }
    }

    #[test]
    fn new_runs_an_initial_rebuild_and_creates_agentinfo_dir() {
        let tmp = TempDir::new().unwrap();
        let config = config_for(&tmp);
        let core = Core::new(&config).unwrap();

        assert!(config.agentinfo_dir.is_dir());
        let status = core.status();
        assert_eq!(status.groups, 1);
        assert_eq!(status.queue_len, 0);
    }

    #[test]
    fn missing_shared_dir_is_rejected_at_construction() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_for(&tmp);
        config.shared_dir = tmp.path().join("does-not-exist");
        assert!(Core::new(&config).is_err());
    }

    #[test]
    fn ingest_classifies_and_feeds_pending_state() {
        let tmp = TempDir::new().unwrap();
        let config = config_for(&tmp);
        let core = Core::new(&config).unwrap();
        let router = NullRequestRouter;
        let transport = RecordingTransport::new(false);
        let key = AgentKey {
            id: AgentId::from("001"),
            name: "agent-001".to_owned(),
            peer_address: "10.0.0.1".to_owned(),
        };

        let kind = core.ingest(&key, "uname line\n", &router, &transport);
        assert_eq!(kind, MessageKind::KeepAlive);
        assert_eq!(core.status().queue_len, 1);
    }

    #[test]
    fn rebuild_now_picks_up_new_files_without_waiting() {
        let tmp = TempDir::new().unwrap();
        let config = config_for(&tmp);
        let core = Core::new(&config).unwrap();

        stdfs::write(config.shared_dir.join("default").join("b.txt"), b"world").unwrap();
        core.rebuild_now();

        let status = core.status();
        assert_eq!(status.groups, 1);
    }

    #[test]
    fn spawn_background_starts_without_panicking() {
        let tmp = TempDir::new().unwrap();
        let config = config_for(&tmp);
        let core = Core::new(&config).unwrap();
        let group_store: Arc<dyn GroupStore> = Arc::new(InMemoryGroupStore::new());
        let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::new(false));

        core.spawn_background(group_store, transport);
        // Both worker threads block (sleep / condvar wait) almost
        // immediately with nothing to do; reaching this point without a
        // panic is the behavior under test.
        thread::sleep(Duration::from_millis(20));
    }
}
