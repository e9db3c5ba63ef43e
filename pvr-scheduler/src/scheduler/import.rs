//! File-based import of already recorded shows.
//!
//! `recorded.txt` in the import directory lists one show id per line,
//! optionally followed by a tab and the show title. Blank lines and
//! lines starting with `#` are ignored. The file is deleted once every
//! entry is stored.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};
use pvr_protocol::{RecordedShow, Topic};

use super::Result;
use crate::database::DatabaseHandle;
use crate::notify::Notifier;

pub const IMPORT_FILE_NAME: &str = "recorded.txt";

/// Notify progress every this many entries.
const PROGRESS_STEP: usize = 100;

pub fn import_file(import_dir: &Path) -> PathBuf {
    import_dir.join(IMPORT_FILE_NAME)
}

fn parse_line(line: &str) -> Option<RecordedShow> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (show_id, title) = match line.split_once('\t') {
        Some((id, title)) => (id.trim(), Some(title.trim().to_string()).filter(|t| !t.is_empty())),
        None => (line, None),
    };
    Some(RecordedShow::new(show_id, title, Utc::now()))
}

/// Import the pending file, if any. Returns the number of shows stored.
pub async fn run_import(import_dir: &Path, database: &DatabaseHandle, notifier: &Notifier) -> Result<usize> {
    let path = import_file(import_dir);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Import: nothing to import in {}", import_dir.display());
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    // Invalid UTF-8 is replaced so a damaged file is still consumed
    let contents = String::from_utf8_lossy(&bytes);
    let shows: Vec<RecordedShow> = contents.lines().filter_map(parse_line).collect();
    let total = shows.len();
    info!("Import: {} show(s) from {}", total, path.display());
    notifier.send(Topic::ImportProgress, serde_json::json!({ "done": 0, "total": total }));

    for (n, show) in shows.iter().enumerate() {
        {
            let mut db = database.lock().await;
            db.add_recorded_show(show)?;
        }
        let done = n + 1;
        if done % PROGRESS_STEP == 0 && done < total {
            notifier.send(Topic::ImportProgress, serde_json::json!({ "done": done, "total": total }));
        }
    }

    tokio::fs::remove_file(&path).await?;
    notifier.send(Topic::ImportProgress, serde_json::json!({ "done": total, "total": total }));
    info!("Import: finished, {} removed", path.display());
    Ok(total)
}
