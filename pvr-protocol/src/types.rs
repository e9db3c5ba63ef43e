//! Data model shared between the scheduler, the recorders and the
//! post-processing workers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

// ============================================================================
// Channels and guide data
// ============================================================================

/// A broadcast channel as seen by the tuners and the guide.
///
/// Channels are identified by their number alone; the display name is
/// informational and does not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Channel number as tuned by the device (e.g. "5" or "5.1").
    pub number: String,
    /// Display name from the guide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Channel {
    /// Create a channel from its number.
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            name: None,
        }
    }

    /// Create a channel with a display name.
    pub fn named(number: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            name: Some(name.into()),
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
    }
}

impl Eq for Channel {}

impl std::hash::Hash for Channel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.number.hash(state);
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", self.number, name),
            None => write!(f, "{}", self.number),
        }
    }
}

/// One airing of a show on a channel, as listed by the guide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowAiring {
    /// Unique episode/airing identity (used by the recorded-show ledger).
    pub show_id: String,
    /// Series the show belongs to, if any.
    pub series_id: Option<String>,
    pub title: String,
    pub episode_title: Option<String>,
    pub channel: Channel,
    pub start: DateTime<Utc>,
    pub duration_secs: u64,
}

impl ShowAiring {
    /// Time at which the airing ends.
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::seconds(self.duration_secs as i64)
    }

    /// Title used for file names and notifications.
    pub fn display_title(&self) -> String {
        match &self.episode_title {
            Some(ep) if !ep.is_empty() => format!("{} - {}", self.title, ep),
            _ => self.title.clone(),
        }
    }
}

// ============================================================================
// Recording rules
// ============================================================================

/// Whether a rule records one airing or every new airing of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    Once,
    Series,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Once => "ONCE",
            RuleKind::Series => "SERIES",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ONCE" => Ok(RuleKind::Once),
            "SERIES" => Ok(RuleKind::Series),
            other => Err(ModelError::InvalidRuleKind(other.to_string())),
        }
    }
}

/// A post-processing step attached to a rule, named after the worker
/// that performs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Worker name (e.g. "mp4", "commercial").
    pub name: String,
    /// Human readable worker title.
    pub title: String,
    pub enabled: bool,
    /// Worker specific settings, kept across reconciliation.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl Task {
    /// A task for a newly available worker: present but disabled.
    pub fn with_defaults(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            enabled: false,
            settings: BTreeMap::new(),
        }
    }
}

/// Persisted user intent to record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingRule {
    pub id: String,
    pub name: String,
    pub kind: RuleKind,
    /// Series identity, required for SERIES rules.
    pub series_id: Option<String>,
    /// Airing identity, required for ONCE rules.
    pub show_id: Option<String>,
    pub channel: Channel,
    /// Ordered post-processing tasks.
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl RecordingRule {
    /// Rule recording a single airing.
    pub fn once(
        id: impl Into<String>,
        name: impl Into<String>,
        show_id: impl Into<String>,
        channel: Channel,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: RuleKind::Once,
            series_id: None,
            show_id: Some(show_id.into()),
            channel,
            tasks: Vec::new(),
        }
    }

    /// Rule recording every new airing of a series on a channel.
    pub fn series(
        id: impl Into<String>,
        name: impl Into<String>,
        series_id: impl Into<String>,
        channel: Channel,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: RuleKind::Series,
            series_id: Some(series_id.into()),
            show_id: None,
            channel,
            tasks: Vec::new(),
        }
    }

    /// Check that the rule carries the identity its kind needs.
    pub fn validate(&self) -> Result<(), ModelError> {
        match self.kind {
            RuleKind::Once if self.show_id.is_none() => {
                Err(ModelError::MissingField { rule: self.id.clone(), field: "show_id" })
            }
            RuleKind::Series if self.series_id.is_none() => {
                Err(ModelError::MissingField { rule: self.id.clone(), field: "series_id" })
            }
            _ => Ok(()),
        }
    }

    /// Names of the enabled tasks, in order.
    pub fn enabled_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.enabled)
    }
}

// ============================================================================
// Recordings and history
// ============================================================================

/// A resolved advertising interval, in seconds from the start of the
/// recording.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Commercial {
    pub start: f64,
    pub end: f64,
}

impl Commercial {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// A captured or in-progress recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Database id (0 until persisted).
    pub id: i64,
    pub title: String,
    pub path: PathBuf,
    /// Wall-clock time the capture actually started.
    pub real_start: DateTime<Utc>,
    pub duration_secs: u64,
    /// True while a recorder is writing this file.
    pub current_recording: bool,
    pub recording_rule_id: Option<String>,
    pub show_id: Option<String>,
    pub channel: Option<Channel>,
    /// Title of the recorder that captured it.
    pub recorder: Option<String>,
    #[serde(default)]
    pub commercials: Vec<Commercial>,
    /// Extension of the indexed sibling file (e.g. "mp4") once indexing ran.
    pub indexed_extension: Option<String>,
}

impl Recording {
    /// A not yet persisted recording for the given file.
    pub fn new(title: impl Into<String>, path: impl Into<PathBuf>, real_start: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            title: title.into(),
            path: path.into(),
            real_start,
            duration_secs: 0,
            current_recording: false,
            recording_rule_id: None,
            show_id: None,
            channel: None,
            recorder: None,
            commercials: Vec::new(),
            indexed_extension: None,
        }
    }

    /// HLS playlist that may stand in for an empty primary file.
    pub fn hls_sibling(&self) -> PathBuf {
        self.path.with_extension("m3u8")
    }

    /// Indexed file, if indexing produced one.
    pub fn indexed_path(&self) -> Option<PathBuf> {
        self.indexed_extension
            .as_deref()
            .map(|ext| self.path.with_extension(ext))
    }

    /// Directory holding the post-processing artefacts of this recording.
    pub fn work_dir(&self, root: &Path) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("recording-{}", self.id));
        root.join(stem)
    }
}

/// Durable marker that an episode has been captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedShow {
    pub show_id: String,
    pub title: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl RecordedShow {
    pub fn new(show_id: impl Into<String>, title: Option<String>, recorded_at: DateTime<Utc>) -> Self {
        Self {
            show_id: show_id.into(),
            title,
            recorded_at,
        }
    }
}

/// Descriptor of a post-processing worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub title: String,
}

impl WorkerInfo {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Topics broadcast to UI/REST listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "recording.added")]
    RecordingAdded,
    #[serde(rename = "recording.updated")]
    RecordingUpdated,
    #[serde(rename = "recording.removed")]
    RecordingRemoved,
    #[serde(rename = "rule.updated")]
    RuleUpdated,
    #[serde(rename = "import.progress")]
    ImportProgress,
    #[serde(rename = "recorder.busy")]
    RecorderBusy,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::RecordingAdded => "recording.added",
            Topic::RecordingUpdated => "recording.updated",
            Topic::RecordingRemoved => "recording.removed",
            Topic::RuleUpdated => "rule.updated",
            Topic::ImportProgress => "import.progress",
            Topic::RecorderBusy => "recorder.busy",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_channel_equality_ignores_name() {
        let a = Channel::named("5", "Five");
        let b = Channel::new("5");
        let c = Channel::new("6");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rule_kind_parse() {
        assert_eq!("once".parse::<RuleKind>().unwrap(), RuleKind::Once);
        assert_eq!("SERIES".parse::<RuleKind>().unwrap(), RuleKind::Series);
        assert!("weekly".parse::<RuleKind>().is_err());
    }

    #[test]
    fn test_rule_validation() {
        let rule = RecordingRule::once("r1", "News", "ep-1", Channel::new("5"));
        assert!(rule.validate().is_ok());

        let mut broken = RecordingRule::series("r2", "Drama", "s-1", Channel::new("5"));
        broken.series_id = None;
        assert!(matches!(
            broken.validate(),
            Err(ModelError::MissingField { field: "series_id", .. })
        ));
    }

    #[test]
    fn test_airing_end() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap();
        let airing = ShowAiring {
            show_id: "ep-1".into(),
            series_id: None,
            title: "News".into(),
            episode_title: None,
            channel: Channel::new("5"),
            start,
            duration_secs: 3600,
        };
        assert_eq!(airing.end(), Utc.with_ymd_and_hms(2024, 1, 1, 21, 0, 0).unwrap());
    }

    #[test]
    fn test_recording_siblings() {
        let mut rec = Recording::new("News", "/rec/news-20240101-2000.ts", Utc::now());
        assert_eq!(rec.hls_sibling(), PathBuf::from("/rec/news-20240101-2000.m3u8"));
        assert_eq!(rec.indexed_path(), None);
        rec.indexed_extension = Some("mp4".into());
        assert_eq!(rec.indexed_path(), Some(PathBuf::from("/rec/news-20240101-2000.mp4")));
        assert_eq!(
            rec.work_dir(Path::new("/work")),
            PathBuf::from("/work/news-20240101-2000")
        );
    }

    #[test]
    fn test_topic_serialization() {
        let json = serde_json::to_string(&Topic::RecordingAdded).unwrap();
        assert_eq!(json, "\"recording.added\"");
        assert_eq!(Topic::ImportProgress.as_str(), "import.progress");
    }
}
