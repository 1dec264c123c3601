//! Shared data model: agent identifiers, checksums, and the group/file
//! tables that make up the authoritative [`Index`].

use std::collections::HashMap;
use std::fmt;

use md5::{Digest, Md5};

/// Identifier for an agent, as handed back by the key store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A 32-hex-character MD5 digest. An empty checksum models the
/// "degraded mode" value used for a merged
/// bundle whose checksum could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct Checksum(pub String);

impl Checksum {
    /// The empty checksum — forces a no-op comparison.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compute the MD5 checksum of a byte slice, formatted as lowercase hex.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        Self(
            digest
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>(),
        )
    }

    /// Compute the MD5 checksum of a file's contents. Returns `None` if the
    /// file cannot be read — the caller is expected to use
    /// [`Checksum::empty`] in that case.
    pub fn of_file(path: &std::path::Path) -> Option<Self> {
        std::fs::read(path).ok().map(|bytes| Self::of_bytes(&bytes))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Checksum {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Reconciliation mark applied to a [`FileEntry`] during one cycle. Reset
/// at the start of every cycle that resolves a table, not only when the
/// table is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mark {
    /// The agent has not reported this file in the current cycle.
    #[default]
    Unset,
    /// The agent reported a checksum that differs from the authoritative one.
    Stale,
    /// The agent reported a checksum that matches the authoritative one.
    Fresh,
}

/// One file in a group bundle. Position 0 of a [`GroupTable`] is always
/// the synthetic merged bundle; its `name` is `None` until the first
/// rebuild completes, then `Some("merged.mg")`.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: Option<String>,
    pub checksum: Checksum,
    pub mark: Mark,
}

impl FileEntry {
    /// The placeholder that always occupies position 0 before a rebuild
    /// fills it in.
    pub fn placeholder() -> Self {
        Self {
            name: None,
            checksum: Checksum::empty(),
            mark: Mark::Unset,
        }
    }

    pub fn new(name: impl Into<String>, checksum: Checksum) -> Self {
        Self {
            name: Some(name.into()),
            checksum,
            mark: Mark::Unset,
        }
    }

    pub fn name_str(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Ordered sequence of [`FileEntry`] for one group.
///
/// Invariant: after any successful rebuild, position 0 is named
/// `merged.mg` and no other entry shares that name.
#[derive(Debug, Clone, Default)]
pub struct GroupTable(pub Vec<FileEntry>);

impl GroupTable {
    /// A table with only the unfilled position-0 placeholder.
    pub fn with_placeholder() -> Self {
        Self(vec![FileEntry::placeholder()])
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.0
    }

    pub fn entries_mut(&mut self) -> &mut [FileEntry] {
        &mut self.0
    }

    /// The merged-bundle entry (position 0).
    pub fn merged(&self) -> &FileEntry {
        &self.0[0]
    }

    pub fn merged_mut(&mut self) -> &mut FileEntry {
        &mut self.0[0]
    }

    /// Reset every entry's mark to `Unset`.
    pub fn reset_marks(&mut self) {
        for entry in &mut self.0 {
            entry.mark = Mark::Unset;
        }
    }

    /// Find an entry among positions 1+ by file name.
    pub fn find_by_name(&self, name: &str) -> Option<&FileEntry> {
        self.0[1..].iter().find(|e| e.name_str() == Some(name))
    }

    pub fn find_by_name_mut(&mut self, name: &str) -> Option<&mut FileEntry> {
        self.0[1..].iter_mut().find(|e| e.name_str() == Some(name))
    }

    /// Check whether any entry among positions 1+ matches both `name` and
    /// `checksum` (used by group inference).
    pub fn matches(&self, name: &str, checksum: &Checksum) -> bool {
        self.0[1..]
            .iter()
            .any(|e| e.name_str() == Some(name) && &e.checksum == checksum)
    }

    /// Position 0 exists and is named `merged.mg`, and no other entry
    /// shares that name.
    #[cfg(debug_assertions)]
    pub fn check_merged_head_invariant(&self, merged_name: &str) {
        assert_eq!(
            self.0[0].name_str(),
            Some(merged_name),
            "position 0 must be the merged bundle"
        );
        assert!(
            self.0[1..].iter().all(|e| e.name_str() != Some(merged_name)),
            "only position 0 may be named {merged_name}"
        );
    }
}

/// Mapping from group name to [`GroupTable`]. Owned solely by
/// the Bundle Builder; the Reconciliation Worker only reads it while
/// holding the Index lock.
#[derive(Debug, Clone, Default)]
pub struct Index {
    pub groups: HashMap<String, GroupTable>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a group's table by name.
    pub fn find_sum(&self, group: &str) -> Option<&GroupTable> {
        self.groups.get(group)
    }

    pub fn find_sum_mut(&mut self, group: &str) -> Option<&mut GroupTable> {
        self.groups.get_mut(group)
    }

    /// Search every group for a FileEntry matching both `name` and
    /// `checksum`, returning the group name.
    pub fn find_group(&self, name: &str, checksum: &Checksum) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, table)| table.matches(name, checksum))
            .map(|(group, _)| group.as_str())
    }
}
