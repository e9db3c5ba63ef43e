//! Output file selection.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use log::debug;
use sysinfo::Disks;

const TS_EXTENSION: &str = "ts";
const MAX_SUFFIX: u32 = 10_000;

/// Free space lookup for a directory.
pub trait FreeSpace: Send + Sync {
    /// Bytes available on the file system holding `dir`, if known.
    fn available_space(&self, dir: &Path) -> Option<u64>;
}

/// Reads the free space of mounted disks through `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFreeSpace;

impl FreeSpace for DiskFreeSpace {
    fn available_space(&self, dir: &Path) -> Option<u64> {
        let dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        // Deepest mount point containing the directory
        disks
            .list()
            .iter()
            .filter(|disk| dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space())
    }
}

/// Picks the directory and file name of a new recording.
pub struct OutputPlanner {
    dirs: Vec<PathBuf>,
    space: Arc<dyn FreeSpace>,
}

impl OutputPlanner {
    pub fn new(dirs: Vec<PathBuf>, space: Arc<dyn FreeSpace>) -> Self {
        let dirs = if dirs.is_empty() { vec![PathBuf::from(".")] } else { dirs };
        Self { dirs, space }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// `<dir>/<title>-<YYYYMMDD-HHMM>.ts` in the directory with the most
    /// free space. An existing file is never reused.
    ///
    /// The name is only a preview; use [`OutputPlanner::reserve`] for the
    /// file a capture will write.
    pub fn plan(&self, title: &str, start: DateTime<Utc>) -> PathBuf {
        let (dir, stem) = self.target(title, start);
        let path = candidates(dir, &stem).find(|path| !path.exists()).unwrap_or_else(|| dir.join(&stem));
        path
    }

    /// Like [`OutputPlanner::plan`], but creates the file so that no other
    /// capture can be given the same path.
    pub fn reserve(&self, title: &str, start: DateTime<Utc>) -> io::Result<PathBuf> {
        let (dir, stem) = self.target(title, start);
        for path in candidates(dir, &stem) {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!("Reserved {}", path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("no free name for {}", stem)))
    }

    fn target(&self, title: &str, start: DateTime<Utc>) -> (&Path, String) {
        let stem = format!(
            "{}-{}",
            sanitize_title(title),
            start.with_timezone(&Local).format("%Y%m%d-%H%M")
        );
        (self.roomiest_dir(), stem)
    }

    fn roomiest_dir(&self) -> &Path {
        let mut best: Option<(&PathBuf, u64)> = None;
        for dir in &self.dirs {
            let free = self.space.available_space(dir).unwrap_or(0);
            debug!("{}: {} bytes free", dir.display(), free);
            if best.map_or(true, |(_, most)| free > most) {
                best = Some((dir, free));
            }
        }
        best.map(|(dir, _)| dir.as_path()).unwrap_or_else(|| Path::new("."))
    }
}

/// `<stem>.ts`, then `<stem>-2.ts`, `<stem>-3.ts` and so on.
fn candidates<'a>(dir: &'a Path, stem: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
    (1..=MAX_SUFFIX).map(move |n| match n {
        1 => dir.join(format!("{}.{}", stem, TS_EXTENSION)),
        n => dir.join(format!("{}-{}.{}", stem, n, TS_EXTENSION)),
    })
}

/// File-name safe version of a show title.
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.trim().chars() {
        if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
            out.push(c);
        } else if c.is_whitespace() && !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches(|c| c == '_' || c == '.').to_string();
    if out.is_empty() {
        "recording".to_string()
    } else {
        out
    }
}
