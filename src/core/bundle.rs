//! Bundle Builder: scans the shared-configuration directory tree and
//! produces per-group merged bundles and checksum tables.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::types::{Checksum, FileEntry, GroupTable, Index};
use crate::config::MERGED_BUNDLE_NAME;

/// Rebuild the authoritative [`Index`] by scanning `shared_dir`'s immediate
/// subdirectories (groups). Takes the Index lock for the whole operation
/// and installs the new table set atomically.
///
/// If `shared_dir` cannot be opened, the previous index is left intact and
/// the failure is logged rather than treated as fatal.
pub fn rebuild(
    index: &Mutex<Index>,
    shared_dir: &Path,
    active_response_file: &Path,
    nocmerged: bool,
) {
    debug!("updating shared files sums");

    let group_dirs = match list_group_dirs(shared_dir) {
        Ok(dirs) => dirs,
        Err(err) => {
            warn!(
                dir = %shared_dir.display(),
                error = %err,
                "opening shared-config directory failed, keeping previous index"
            );
            return;
        }
    };

    let mut new_index = Index::new();
    for (name, path) in group_dirs {
        let table = build_group(&path, active_response_file, nocmerged);
        new_index.groups.insert(name, table);
    }

    let mut guard = index.lock().expect("index mutex poisoned");
    *guard = new_index;
    debug!("end updating shared files sums");
}

fn list_group_dirs(shared_dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(shared_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        dirs.push((name, path));
    }
    Ok(dirs)
}

/// Build one group's [`GroupTable`] and (unless `nocmerged`) its merged
/// bundle file.
fn build_group(group_dir: &Path, active_response_file: &Path, nocmerged: bool) -> GroupTable {
    let mut table = GroupTable::with_placeholder();
    let merged_path = group_dir.join(MERGED_BUNDLE_NAME);
    let merged_tmp_path = group_dir.join(format!("{MERGED_BUNDLE_NAME}.tmp"));

    let mut merge_buffer: Option<Vec<u8>> = if nocmerged { None } else { Some(Vec::new()) };

    index_active_response(active_response_file, &mut table, merge_buffer.as_mut());

    if let Err(err) = append_group_files(
        group_dir,
        MERGED_BUNDLE_NAME,
        &mut table,
        merge_buffer.as_mut(),
    ) {
        warn!(dir = %group_dir.display(), error = %err, "reading group directory failed");
    }

    if let Some(buffer) = merge_buffer {
        if let Err(err) = write_merged_bundle(&merged_tmp_path, &merged_path, &buffer) {
            warn!(path = %merged_path.display(), error = %err, "writing merged bundle failed");
        }
    }

    match Checksum::of_file(&merged_path) {
        Some(sum) => {
            table.merged_mut().checksum = sum;
        }
        None => {
            warn!(path = %merged_path.display(), "accessing merged bundle failed, using empty checksum");
            table.merged_mut().checksum = Checksum::empty();
        }
    }
    table.merged_mut().name = Some(MERGED_BUNDLE_NAME.to_owned());

    #[cfg(debug_assertions)]
    table.check_merged_head_invariant(MERGED_BUNDLE_NAME);

    table
}

/// Merge the system-wide active-response file first, if present and
/// readable. Indexed unconditionally — only the byte-append into the
/// merge buffer is gated on `nocmerged` — because hashing an
/// already-present file never requires the write path.
fn index_active_response(
    active_response_file: &Path,
    table: &mut GroupTable,
    merge_buffer: Option<&mut Vec<u8>>,
) {
    let Some(checksum) = Checksum::of_file(active_response_file) else {
        return;
    };
    let Ok(bytes) = fs::read(active_response_file) else {
        return;
    };
    table.0.push(FileEntry::new(
        active_response_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        checksum,
    ));
    if let Some(buffer) = merge_buffer {
        buffer.extend_from_slice(&bytes);
    }
}

/// Iterate the group directory, skipping hidden names and anything sharing
/// the merged bundle's filename prefix.
fn append_group_files(
    group_dir: &Path,
    merged_name: &str,
    table: &mut GroupTable,
    mut merge_buffer: Option<&mut Vec<u8>>,
) -> io::Result<()> {
    for entry in fs::read_dir(group_dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();

        if file_name.starts_with('.') || file_name.starts_with(merged_name) {
            continue;
        }
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(checksum) = Checksum::of_file(&path) else {
            warn!(path = %path.display(), "accessing file failed");
            continue;
        };

        if let Some(buffer) = merge_buffer.as_deref_mut() {
            if let Ok(bytes) = fs::read(&path) {
                buffer.extend_from_slice(&bytes);
            }
        }

        table.0.push(FileEntry::new(file_name, checksum));
    }
    Ok(())
}

/// Write the temp merge file then atomically rename it over the final
/// bundle path.
fn write_merged_bundle(tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> io::Result<()> {
    fs::write(tmp_path, bytes)?;
    fs::rename(tmp_path, final_path)?;
    Ok(())
}
