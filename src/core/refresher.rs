//! Periodic Refresher: invokes the Bundle Builder on a fixed cadence
//! (`shared_reload`).

use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::bundle;
use super::types::Index;

/// Sleep `interval`, rebuild, repeat. Intended to run on its own thread.
pub fn run(
    index: &Mutex<Index>,
    shared_dir: &Path,
    active_response_file: &Path,
    nocmerged: bool,
    interval: Duration,
) -> ! {
    loop {
        thread::sleep(interval);
        tick(index, shared_dir, active_response_file, nocmerged);
    }
}

/// One rebuild cycle, split out from [`run`] so tests and `agentd rebuild`
/// can invoke it without waiting on the interval.
pub fn tick(index: &Mutex<Index>, shared_dir: &Path, active_response_file: &Path, nocmerged: bool) {
    debug!("periodic refresh firing");
    bundle::rebuild(index, shared_dir, active_response_file, nocmerged);
}
