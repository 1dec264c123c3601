//! Heartbeat Intake: classifies an incoming agent control message, acks it,
//! persists keep-alive payloads to the agent-info directory, and feeds the
//! pending work queue.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::collaborators::{AgentKey, RequestRouter, Transport};
use super::pending::{HeartbeatOutcome, PendingState};

/// First-matching-rule classification grammar.
const REQUEST_PREFIX: &str = "#!-req";
const STARTUP_NOTICE: &str = "#!-agent startup";
const ACK_FRAME: &str = "#!-agent ack";

/// What kind of control message this was, for callers that want to log or
/// test the classification separately from its side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Startup,
    KeepAlive,
}

/// Classify and process one control message from `key.id`.
/// First matching rule wins: request control, startup notice, keep-alive.
pub fn ingest(
    key: &AgentKey,
    message: &str,
    pending: &PendingState,
    agentinfo_dir: &Path,
    router: &dyn RequestRouter,
    transport: &dyn Transport,
) -> MessageKind {
    if let Some(rest) = message.strip_prefix(REQUEST_PREFIX) {
        // The request subsystem owns the reply; no ack is sent here.
        match rest.split_once(' ') {
            Some((counter, payload)) => router.req_save(counter, payload.as_bytes()),
            None => warn!(agent = %key.id, "malformed request control message, missing space"),
        }
        return MessageKind::Request;
    }

    send_ack(&key.id, transport);

    if message == STARTUP_NOTICE {
        debug!(agent = %key.id, name = %key.name, "agent startup notice");
        return MessageKind::Startup;
    }

    handle_keep_alive(key, message, pending, agentinfo_dir);
    MessageKind::KeepAlive
}

fn send_ack(agent: &super::types::AgentId, transport: &dyn Transport) {
    if let Err(err) = transport.send(agent, ACK_FRAME.as_bytes()) {
        warn!(agent = %agent, error = %err, "sending keep-alive ack failed");
    }
}

fn handle_keep_alive(key: &AgentKey, message: &str, pending: &PendingState, agentinfo_dir: &Path) {
    let agent = &key.id;

    if message.find('\n').is_none() {
        warn!(agent = %agent, "malformed keep-alive, missing newline after uname");
        return;
    }
    // Drop any trailing unterminated line (a protocol artifact, not a real
    // file entry) — everything up to and including the last newline is the
    // canonical payload the worker will later re-parse.
    let payload = match message.rfind('\n') {
        Some(idx) => &message[..=idx],
        None => message,
    };
    let uname = payload.split_once('\n').map(|(first, _)| first).unwrap_or(payload);

    let path = pending.keep_alive_path(agent, || derive_keep_alive_path(agentinfo_dir, key));

    match pending.note_heartbeat(agent, payload) {
        HeartbeatOutcome::Duplicate => {
            touch(&path);
            debug!(agent = %agent, "duplicate keep-alive, refreshed mtime only");
        }
        HeartbeatOutcome::Updated { enqueued } => {
            if let Err(err) = persist_keep_alive(&path, uname) {
                warn!(agent = %agent, path = %path.display(), error = %err, "writing keep-alive file failed");
            }
            if !enqueued {
                debug!(agent = %agent, "pending queue full, keep-alive retained but not enqueued");
            }
        }
    }
}

/// Agent-info files live at `<agentinfo_dir>/<name>-<peer_address>`.
fn derive_keep_alive_path(agentinfo_dir: &Path, key: &AgentKey) -> PathBuf {
    agentinfo_dir.join(format!("{}-{}", key.name, key.peer_address))
}

/// Narrow the file's permissions before writing — keep-alive files are
/// not world-readable. `umask` is process-global, so this is scoped as
/// tightly as possible around the single write.
fn persist_keep_alive(path: &Path, uname: &str) -> std::io::Result<()> {
    let previous = unsafe { libc::umask(0o077) };
    let result = (|| {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        writeln!(file, "{uname}")
    })();
    unsafe {
        libc::umask(previous);
    }
    result
}

fn touch(path: &Path) {
    if let Err(err) = utimes_now(path) {
        warn!(path = %path.display(), error = %err, "touching keep-alive file failed");
    }
}

/// Refresh a file's mtime/atime to now without touching its contents —
/// `utimes(path, NULL)`, the same call the original makes, rather than a
/// read-then-rewrite that would expose a momentarily empty file to a
/// concurrent reader.
fn utimes_now(path: &Path) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains a NUL byte")
    })?;
    let ret = unsafe { libc::utimes(c_path.as_ptr(), std::ptr::null()) };
    if ret != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::{NullRequestRouter, RecordingTransport};
    use crate::core::types::AgentId;
    use tempfile::TempDir;

    fn key(id: &str) -> AgentKey {
        AgentKey {
            id: AgentId::from(id),
            name: format!("agent-{id}"),
            peer_address: "10.0.0.1".to_owned(),
        }
    }

    #[test]
    fn startup_notice_is_acked_and_not_enqueued() {
        let tmp = TempDir::new().unwrap();
        let pending = PendingState::new(4);
        let router = NullRequestRouter;
        let transport = RecordingTransport::new(false);

        let kind = ingest(
            &key("001"),
            STARTUP_NOTICE,
            &pending,
            tmp.path(),
            &router,
            &transport,
        );
        assert_eq!(kind, MessageKind::Startup);
        assert_eq!(pending.queue_len(), 0);
        assert_eq!(transport.sent_to(&AgentId::from("001")), ACK_FRAME.as_bytes());
    }

    #[test]
    fn keep_alive_is_classified_acked_and_persisted() {
        let tmp = TempDir::new().unwrap();
        let pending = PendingState::new(4);
        let router = NullRequestRouter;
        let transport = RecordingTransport::new(false);
        let k = key("001");

        let kind = ingest(&k, "uname line\n", &pending, tmp.path(), &router, &transport);
        assert_eq!(kind, MessageKind::KeepAlive);
        assert_eq!(transport.sent_to(&k.id), ACK_FRAME.as_bytes());

        let path = tmp.path().join("agent-001-10.0.0.1");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "uname line\n");
        assert_eq!(pending.queue_len(), 1);
    }

    #[test]
    fn keep_alive_with_checksum_lines_enqueues_full_payload() {
        let tmp = TempDir::new().unwrap();
        let pending = PendingState::new(4);
        let router = NullRequestRouter;
        let transport = RecordingTransport::new(false);
        let k = key("001");

        ingest(
            &k,
            "uname\nxx merged.mg\n",
            &pending,
            tmp.path(),
            &router,
            &transport,
        );

        let (agent, message) = pending.try_drain_one().unwrap();
        assert_eq!(agent, k.id);
        assert_eq!(message, "uname\nxx merged.mg\n");

        // The on-disk keep-alive file holds only the uname line.
        let path = tmp.path().join("agent-001-10.0.0.1");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "uname\n");
    }

    #[test]
    fn duplicate_keep_alive_refreshes_file_without_rewriting_queue() {
        let tmp = TempDir::new().unwrap();
        let pending = PendingState::new(4);
        let router = NullRequestRouter;
        let transport = RecordingTransport::new(false);
        let k = key("001");

        ingest(&k, "same-uname\n", &pending, tmp.path(), &router, &transport);
        // Duplicate before any drain: same agent, same message, changed
        // still true -> short-circuits to a touch, no re-enqueue.
        ingest(&k, "same-uname\n", &pending, tmp.path(), &router, &transport);
        assert_eq!(pending.queue_len(), 1);
    }

    #[test]
    fn missing_newline_after_uname_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let pending = PendingState::new(4);
        let router = NullRequestRouter;
        let transport = RecordingTransport::new(false);

        let kind = ingest(
            &key("001"),
            "no newline here",
            &pending,
            tmp.path(),
            &router,
            &transport,
        );
        assert_eq!(kind, MessageKind::KeepAlive);
        assert_eq!(pending.queue_len(), 0);
    }

    #[test]
    fn request_control_message_is_routed_without_ack() {
        let tmp = TempDir::new().unwrap();
        let pending = PendingState::new(4);
        let router = NullRequestRouter;
        let transport = RecordingTransport::new(false);

        let kind = ingest(
            &key("001"),
            "#!-req123 some-payload",
            &pending,
            tmp.path(),
            &router,
            &transport,
        );
        assert_eq!(kind, MessageKind::Request);
        assert_eq!(pending.queue_len(), 0);
        assert_eq!(transport.send_count(), 0);
    }

    #[test]
    fn malformed_request_control_message_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let pending = PendingState::new(4);
        let router = NullRequestRouter;
        let transport = RecordingTransport::new(false);

        let kind = ingest(
            &key("001"),
            "#!-req123-no-space",
            &pending,
            tmp.path(),
            &router,
            &transport,
        );
        assert_eq!(kind, MessageKind::Request);
        assert_eq!(transport.send_count(), 0);
    }
}
