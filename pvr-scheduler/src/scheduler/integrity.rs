//! Output integrity check run when a capture completes.

use pvr_protocol::Recording;

/// Result of inspecting a finished capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    /// The primary file has data.
    Good,
    /// The primary file is empty or missing but the HLS playlist has data.
    HlsFallback,
    /// Nothing usable was written.
    Bad,
}

impl Integrity {
    pub fn is_bad(&self) -> bool {
        *self == Integrity::Bad
    }
}

fn non_empty(path: &std::path::Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Classify the files a recording left on disk.
pub fn check_output(recording: &Recording) -> Integrity {
    if non_empty(&recording.path) {
        Integrity::Good
    } else if non_empty(&recording.hls_sibling()) {
        Integrity::HlsFallback
    } else {
        Integrity::Bad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_empty_without_playlist_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("show.ts");
        let rec = Recording::new("Show", &path, Utc::now());
        assert_eq!(check_output(&rec), Integrity::Bad);

        std::fs::write(&path, b"").unwrap();
        assert!(check_output(&rec).is_bad());

        // An empty playlist does not count either
        std::fs::write(rec.hls_sibling(), b"").unwrap();
        assert!(check_output(&rec).is_bad());
    }

    #[test]
    fn test_playlist_rescues_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("show.ts");
        std::fs::write(&path, b"").unwrap();
        let rec = Recording::new("Show", &path, Utc::now());
        std::fs::write(rec.hls_sibling(), b"#EXTM3U\n").unwrap();
        assert_eq!(check_output(&rec), Integrity::HlsFallback);
        assert!(!check_output(&rec).is_bad());
    }

    #[test]
    fn test_non_empty_file_is_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("show.ts");
        std::fs::write(&path, [0x47u8; 188]).unwrap();
        let rec = Recording::new("Show", &path, Utc::now());
        assert_eq!(check_output(&rec), Integrity::Good);
    }
}
