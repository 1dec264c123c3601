//! Reconciliation Worker: drains the pending queue and, for each agent,
//! compares reported checksums against the authoritative table, streaming
//! out files whose content has drifted.
//!
//! Interpretive note: a naive reading of the `merged.mg` fast path would
//! have it release the Index lock and return immediately as soon as that
//! line is seen. Taken completely literally that would leave a legacy
//! per-file line listed *after* a matching `merged.mg` line unexamined.
//! This worker instead stops parsing only once the merged-bundle decision
//! actually results in a send ("no other file is sent" only applies when
//! something was in fact sent); when `merged.mg` matches (nothing to
//! send), parsing continues so trailing legacy-style lines still get
//! reconciled. When a send *is* triggered, every mark is reset before the
//! sweep is skipped entirely, so a stale legacy line parsed earlier in the
//! same cycle (e.g. `a.txt` before `merged.mg`) cannot leak into a second
//! send alongside the bundle.

use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::collaborators::{GroupStore, Transport};
use super::pending::PendingState;
use super::types::{AgentId, Checksum, Index, Mark};
use crate::config::MERGED_BUNDLE_NAME;

const CONTENT_CHUNK_SIZE: usize = 900;
const DATAGRAM_PACE_EVERY: usize = 30;
const DATAGRAM_PACE_SLEEP: Duration = Duration::from_secs(1);
const CLOSE_FRAME: &str = "#!-close file";
const DEFAULT_GROUP: &str = "default";

/// Block on the pending queue forever, processing one heartbeat at a time.
/// Intended to run on its own thread.
pub fn run(
    pending: &PendingState,
    index: &Mutex<Index>,
    group_store: &dyn GroupStore,
    transport: &dyn Transport,
    shared_dir: &Path,
) -> ! {
    loop {
        let (agent, message) = pending.drain_one();
        process_heartbeat(&agent, &message, index, group_store, transport, shared_dir);
    }
}

/// Process one heartbeat payload for `agent`: resolve its group, mark every
/// reported file fresh or stale, push whatever is stale or unreported.
pub fn process_heartbeat(
    agent: &AgentId,
    message: &str,
    index: &Mutex<Index>,
    group_store: &dyn GroupStore,
    transport: &dyn Transport,
    shared_dir: &Path,
) {
    let Some(body) = message.split_once('\n').map(|(_, rest)| rest) else {
        warn!(agent = %agent, "malformed heartbeat, missing newline after uname");
        return;
    };

    let mut current_group = group_store.get_agent_group(agent);
    let mut guard = index.lock().expect("index mutex poisoned");

    if let Some(name) = current_group.clone() {
        match guard.find_sum_mut(&name) {
            // Marks are reset at the start of every cycle that resolves a
            // table, not only at table-construction time.
            Some(table) => table.reset_marks(),
            None => {
                // The group store can race ahead of a rebuild that dropped
                // this group. The agent is left orphaned until its next
                // heartbeat; there is deliberately no fallback to `default`
                // here.
                warn!(agent = %agent, group = %name, "no such group for agent");
                return;
            }
        }
    }

    let mut saw_merged = false;
    let mut merged_send: Option<Checksum> = None;

    for line in body.lines() {
        if line.starts_with('"') || line.starts_with('!') {
            continue;
        }
        let Some((md5, file)) = line.split_once(' ') else {
            warn!(agent = %agent, "malformed heartbeat line, missing space");
            break;
        };
        let checksum = Checksum::from(md5);

        if current_group.is_none() {
            let resolved = match guard.find_group(file, &checksum).map(str::to_owned) {
                Some(found) => found,
                None => {
                    if guard.find_sum(DEFAULT_GROUP).is_none() {
                        warn!(agent = %agent, "group unknown and no default group exists");
                        return;
                    }
                    DEFAULT_GROUP.to_owned()
                }
            };
            group_store.set_agent_group(agent, &resolved);
            if let Some(table) = guard.find_sum_mut(&resolved) {
                table.reset_marks();
            }
            current_group = Some(resolved);
        }
        let group_name = current_group.as_deref().expect("just resolved above");

        if file == MERGED_BUNDLE_NAME {
            saw_merged = true;
            if let Some(table) = guard.find_sum(group_name) {
                let authoritative = table.merged().checksum.clone();
                if !authoritative.is_empty() && authoritative != checksum {
                    merged_send = Some(authoritative);
                    break;
                }
            }
            continue;
        }

        if let Some(table) = guard.find_sum_mut(group_name) {
            if let Some(entry) = table.find_by_name_mut(file) {
                entry.mark = if entry.checksum == checksum {
                    Mark::Fresh
                } else {
                    Mark::Stale
                };
            }
            // A name with no matching entry was removed server-side since
            // the agent last reported it; silently ignored.
        }
    }

    let Some(group_name) = current_group else {
        return;
    };
    let Some(table) = guard.find_sum_mut(&group_name) else {
        return;
    };

    // A `merged.mg` line that triggers a send wins outright: reset every
    // mark so a stale legacy line parsed earlier in the same cycle cannot
    // leak into a second send alongside the bundle (P7 — the merged bundle
    // is sent and no other file is sent in that cycle).
    if let Some(authoritative) = merged_send {
        table.reset_marks();
        drop(guard);
        send_file(agent, &group_name, MERGED_BUNDLE_NAME, &authoritative, shared_dir, transport);
        return;
    }

    // Push every entry the agent reported as stale, plus every entry it
    // never reported at all — unless this cycle saw a `merged.mg` line, in
    // which case the agent is new-style and bare absence no longer implies
    // drift.
    let mut to_send = Vec::new();
    for (position, entry) in table.entries_mut().iter_mut().enumerate() {
        let eligible = match entry.mark {
            Mark::Stale => true,
            Mark::Fresh => false,
            Mark::Unset => !saw_merged && (position > 0 || !entry.checksum.is_empty()),
        };
        if eligible {
            if let Some(name) = entry.name.clone() {
                to_send.push((name, entry.checksum.clone()));
            }
        }
        entry.mark = Mark::Unset;
    }
    drop(guard);

    for (name, checksum) in to_send {
        send_file(agent, &group_name, &name, &checksum, shared_dir, transport);
    }
}

/// Stream one file to `agent`: header frame, 900-byte content chunks, close
/// frame. Paced one second every 30 content frames for datagram transports.
/// Any transport error aborts the send and is logged; the next
/// reconciliation cycle naturally retries because the agent will still
/// report the old checksum.
fn send_file(
    agent: &AgentId,
    group: &str,
    name: &str,
    checksum: &Checksum,
    shared_dir: &Path,
    transport: &dyn Transport,
) {
    let path = shared_dir.join(group).join(name);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(agent = %agent, path = %path.display(), error = %err, "opening file to send failed");
            return;
        }
    };

    let header = format!("#!-up file {checksum} {name}\n");
    if let Err(err) = transport.send(agent, header.as_bytes()) {
        warn!(agent = %agent, file = %name, error = %err, "sending file header failed");
        return;
    }

    for (sent, chunk) in bytes.chunks(CONTENT_CHUNK_SIZE).enumerate() {
        if let Err(err) = transport.send(agent, chunk) {
            warn!(agent = %agent, file = %name, error = %err, "sending file content failed");
            return;
        }
        if transport.is_datagram() && (sent + 1) % DATAGRAM_PACE_EVERY == 0 {
            thread::sleep(DATAGRAM_PACE_SLEEP);
        }
    }

    if let Err(err) = transport.send(agent, CLOSE_FRAME.as_bytes()) {
        warn!(agent = %agent, file = %name, error = %err, "sending file close frame failed");
        return;
    }
    debug!(agent = %agent, group = %group, file = %name, "sent file to agent");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::{InMemoryGroupStore, RecordingTransport};
    use crate::core::types::{FileEntry, GroupTable};
    use std::fs;
    use tempfile::TempDir;

    fn shared_with_default(tmp: &TempDir) -> std::path::PathBuf {
        let shared = tmp.path().join("shared");
        fs::create_dir_all(shared.join("default")).unwrap();
        shared
    }

    fn table_with(entries: &[(&str, &str)], merged_sum: &str) -> GroupTable {
        let mut table = GroupTable::with_placeholder();
        table.merged_mut().name = Some(MERGED_BUNDLE_NAME.to_owned());
        table.merged_mut().checksum = Checksum::from(merged_sum);
        for (name, sum) in entries {
            table.0.push(FileEntry::new(*name, Checksum::from(*sum)));
        }
        table
    }

    #[test]
    fn first_contact_pushes_merged_and_every_file() {
        // Real-world first contact presupposes the agent is already
        // registered into a group out of band (a key-store concern this
        // core doesn't own) — modeled by pre-seeding the group store before
        // the heartbeat that carries zero file lines.
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);
        fs::write(shared.join("default").join("merged.mg"), b"AB").unwrap();
        fs::write(shared.join("default").join("a.txt"), b"A").unwrap();
        fs::write(shared.join("default").join("b.txt"), b"B").unwrap();

        let mut index = Index::new();
        index.groups.insert(
            "default".to_owned(),
            table_with(&[("a.txt", "aa"), ("b.txt", "bb")], "mm"),
        );
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "default");
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        process_heartbeat(&agent, "uname line\n", &index, &group_store, &transport, &shared);

        assert_eq!(group_store.get_agent_group(&agent).as_deref(), Some("default"));
        // merged.mg + a.txt + b.txt, 3 frames (header, content, close) each.
        assert_eq!(transport.send_count(), 9);
    }

    #[test]
    fn fast_path_sends_only_merged_bundle() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);
        fs::write(shared.join("default").join("merged.mg"), b"AB").unwrap();

        let mut index = Index::new();
        index.groups.insert(
            "default".to_owned(),
            table_with(&[("a.txt", "aa"), ("b.txt", "bb")], "mm"),
        );
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "default");
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        process_heartbeat(&agent, "uname\nxx merged.mg\n", &index, &group_store, &transport, &shared);

        assert_eq!(transport.send_count(), 3); // header + 1 content chunk + close
    }

    #[test]
    fn fast_path_send_discards_stale_mark_from_a_preceding_legacy_line() {
        // A stale legacy line parsed before `merged.mg` must not leak into
        // the send set once the merged-bundle decision triggers a send (P7).
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);
        fs::write(shared.join("default").join("merged.mg"), b"AB").unwrap();
        fs::write(shared.join("default").join("a.txt"), b"A").unwrap();

        let mut index = Index::new();
        index
            .groups
            .insert("default".to_owned(), table_with(&[("a.txt", "aa")], "mm"));
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "default");
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        process_heartbeat(
            &agent,
            "uname\nZZ a.txt\nmm-differs merged.mg\n",
            &index,
            &group_store,
            &transport,
            &shared,
        );

        // Only merged.mg is sent: header + 1 content chunk + close.
        assert_eq!(transport.send_count(), 3);
        let sent = transport.sent_to(&agent);
        assert!(sent.windows(b"merged.mg".len()).any(|w| w == b"merged.mg"));
        assert!(!sent.windows(5).any(|w| w == b"a.txt"));
    }

    #[test]
    fn quiescent_matching_checksum_sends_nothing() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);

        let mut index = Index::new();
        index.groups.insert("default".to_owned(), table_with(&[], "mm"));
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "default");
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        process_heartbeat(&agent, "uname\nmm merged.mg\n", &index, &group_store, &transport, &shared);

        assert_eq!(transport.send_count(), 0);
    }

    #[test]
    fn drift_pushes_only_the_stale_file_not_merged() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);
        fs::write(shared.join("default").join("a.txt"), b"AAA").unwrap();

        let mut index = Index::new();
        index
            .groups
            .insert("default".to_owned(), table_with(&[("a.txt", "aa")], "mm"));
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "default");
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        process_heartbeat(
            &agent,
            "uname\nmm merged.mg\nZZ a.txt\n",
            &index,
            &group_store,
            &transport,
            &shared,
        );

        assert_eq!(transport.send_count(), 3); // header + 1 chunk + close for a.txt only
    }

    #[test]
    fn push_on_absent_includes_merged_bundle_when_never_reported() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);
        fs::write(shared.join("default").join("merged.mg"), b"AB").unwrap();
        fs::write(shared.join("default").join("a.txt"), b"AAA").unwrap();
        fs::write(shared.join("default").join("b.txt"), b"BBB").unwrap();

        let mut index = Index::new();
        index.groups.insert(
            "default".to_owned(),
            table_with(&[("a.txt", "aa"), ("b.txt", "bb")], "mm"),
        );
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "default");
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        // Agent reports a.txt only (matching); b.txt and merged.mg are
        // never mentioned and the agent never reported merged.mg at all,
        // so both count as files the agent does not report.
        process_heartbeat(&agent, "uname\naa a.txt\n", &index, &group_store, &transport, &shared);

        assert_eq!(transport.send_count(), 6); // merged.mg + b.txt, 3 frames each
    }

    #[test]
    fn group_inference_from_unique_checksum_match() {
        let tmp = TempDir::new().unwrap();
        let shared = tmp.path().join("shared");
        fs::create_dir_all(shared.join("g1")).unwrap();
        fs::create_dir_all(shared.join("g2")).unwrap();

        let mut index = Index::new();
        index.groups.insert("g1".to_owned(), table_with(&[("x.cfg", "11")], ""));
        index.groups.insert("g2".to_owned(), table_with(&[("y.cfg", "22")], ""));
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new();
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("042");

        process_heartbeat(&agent, "uname\n22 y.cfg\n", &index, &group_store, &transport, &shared);

        assert_eq!(group_store.get_agent_group(&agent).as_deref(), Some("g2"));
    }

    #[test]
    fn unknown_group_falls_back_to_default_when_no_match() {
        let tmp = TempDir::new().unwrap();
        let shared = tmp.path().join("shared");
        fs::create_dir_all(shared.join("g1")).unwrap();
        fs::create_dir_all(shared.join("default")).unwrap();

        let mut index = Index::new();
        index.groups.insert("g1".to_owned(), table_with(&[("x.cfg", "11")], ""));
        index.groups.insert("default".to_owned(), table_with(&[], ""));
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new();
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("099");

        process_heartbeat(&agent, "uname\nzz nomatch.cfg\n", &index, &group_store, &transport, &shared);

        assert_eq!(group_store.get_agent_group(&agent).as_deref(), Some("default"));
    }

    #[test]
    fn group_rebuilt_away_leaves_agent_orphaned() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);

        let index = Mutex::new(Index::new()); // "webservers" absent entirely
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "webservers");
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        process_heartbeat(&agent, "uname\nmm merged.mg\n", &index, &group_store, &transport, &shared);

        // No fallback to `default` — the agent stays assigned to the
        // now-missing group until its next heartbeat.
        assert_eq!(group_store.get_agent_group(&agent).as_deref(), Some("webservers"));
        assert_eq!(transport.send_count(), 0);
    }

    #[test]
    fn labeled_lines_are_skipped_during_parsing() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);
        fs::write(shared.join("default").join("a.txt"), b"AAA").unwrap();

        let mut index = Index::new();
        index
            .groups
            .insert("default".to_owned(), table_with(&[("a.txt", "aa")], ""));
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "default");
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        process_heartbeat(
            &agent,
            "uname\n\"labeled data here\naa a.txt\n",
            &index,
            &group_store,
            &transport,
            &shared,
        );

        assert_eq!(transport.send_count(), 0); // aa == aa, matches, nothing pushed
    }

    #[test]
    fn checksum_round_trip_no_send_for_matching_legacy_file() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);
        fs::write(shared.join("default").join("a.txt"), b"AAA").unwrap();

        let mut index = Index::new();
        index
            .groups
            .insert("default".to_owned(), table_with(&[("a.txt", "aa")], ""));
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "default");
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        process_heartbeat(&agent, "uname\naa a.txt\n", &index, &group_store, &transport, &shared);

        assert_eq!(transport.send_count(), 0);
    }

    #[test]
    fn missing_newline_after_uname_is_logged_and_dropped() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);
        let index = Mutex::new(Index::new());
        let group_store = InMemoryGroupStore::new();
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        process_heartbeat(&agent, "no newline at all", &index, &group_store, &transport, &shared);

        assert_eq!(transport.send_count(), 0);
    }

    #[test]
    fn unreadable_file_aborts_that_send_only() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);
        // a.txt deliberately not written to disk -> unreadable.

        let mut index = Index::new();
        index
            .groups
            .insert("default".to_owned(), table_with(&[("a.txt", "aa")], ""));
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "default");
        let transport = RecordingTransport::new(false);
        let agent = AgentId::from("007");

        process_heartbeat(&agent, "uname\nzz a.txt\n", &index, &group_store, &transport, &shared);

        assert_eq!(transport.send_count(), 0);
    }

    #[test]
    fn datagram_transport_paces_every_thirty_chunks() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_with_default(&tmp);
        let big = vec![b'x'; CONTENT_CHUNK_SIZE * 31];
        fs::write(shared.join("default").join("a.txt"), &big).unwrap();

        let mut index = Index::new();
        index
            .groups
            .insert("default".to_owned(), table_with(&[("a.txt", "aa")], ""));
        let index = Mutex::new(index);
        let group_store = InMemoryGroupStore::new().with_assignment(AgentId::from("007"), "default");
        let transport = RecordingTransport::new(true);
        let agent = AgentId::from("007");

        let started = std::time::Instant::now();
        process_heartbeat(&agent, "uname\nzz a.txt\n", &index, &group_store, &transport, &shared);
        // 31 content chunks -> one pacing sleep of ~1s after the 30th.
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
