//! Deferred recording removal.
//!
//! User deletions are queued and only carried out while no recorder is
//! writing, so a file is never removed mid-capture. Shutdown forces the
//! drain.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use parking_lot::Mutex;
use pvr_protocol::{Recording, Topic};

use crate::database::{DatabaseHandle, Result};
use crate::notify::Notifier;
use crate::recorder::RecorderPool;

/// Recordings queued for removal.
#[derive(Debug, Default)]
pub struct DeferredRemovals {
    queue: Mutex<Vec<Recording>>,
}

impl DeferredRemovals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a recording; a recording already queued is not added twice.
    pub fn push(&self, recording: Recording) {
        let mut queue = self.queue.lock();
        if !queue.iter().any(|r| r.id == recording.id) {
            queue.push(recording);
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.queue.lock().iter().any(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn take(&self) -> Vec<Recording> {
        std::mem::take(&mut *self.queue.lock())
    }
}

/// Files belonging to a recording, primary first.
fn recording_files(recording: &Recording, work_root: &Path) -> (Vec<PathBuf>, PathBuf) {
    let mut files = vec![recording.path.clone(), recording.hls_sibling()];
    if let Some(indexed) = recording.indexed_path() {
        files.push(indexed);
    }
    (files, recording.work_dir(work_root))
}

fn remove_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove {}: {}", path.display(), e),
    }
}

/// Remove every file of a recording and its database row.
pub async fn remove_now(
    recording: &Recording,
    work_root: &Path,
    database: &DatabaseHandle,
    notifier: &Notifier,
) -> Result<()> {
    let (files, work_dir) = recording_files(recording, work_root);
    for file in &files {
        remove_file(file);
    }
    match std::fs::remove_dir_all(&work_dir) {
        Ok(()) => debug!("Removed {}", work_dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove {}: {}", work_dir.display(), e),
    }

    let deleted = {
        let db = database.lock().await;
        db.delete_recording(recording.id)?
    };
    if deleted {
        notifier.send(Topic::RecordingRemoved, serde_json::json!({ "id": recording.id }));
    }
    info!("Removed recording {} ({})", recording.id, recording.path.display());
    Ok(())
}

/// Drain the queue unless a recorder is active. Returns the number of
/// recordings removed.
pub async fn drain(
    removals: &DeferredRemovals,
    recorders: &RecorderPool,
    force: bool,
    work_root: &Path,
    database: &DatabaseHandle,
    notifier: &Notifier,
) -> usize {
    if removals.is_empty() {
        return 0;
    }
    if !force && recorders.any_active() {
        debug!("Janitor: recorder active, {} removal(s) postponed", removals.len());
        return 0;
    }

    let mut removed = 0;
    for recording in removals.take() {
        match remove_now(&recording, work_root, database, notifier).await {
            Ok(()) => removed += 1,
            Err(e) => {
                warn!("Janitor: failed to remove recording {}: {}", recording.id, e);
                removals.push(recording);
            }
        }
    }
    removed
}
