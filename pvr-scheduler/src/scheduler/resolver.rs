//! Pending record resolution.
//!
//! Turns recording rules and guide airings into concrete recorder
//! assignments for one scheduling pass. Nothing computed here is
//! persisted: airings that find no free recorder are reported as
//! deferred and reconsidered from scratch on the next pass.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use pvr_protocol::{Channel, Recording, RecordingRule, RuleKind, ShowAiring};

use super::output::OutputPlanner;
use crate::database::{DatabaseHandle, Result};
use crate::guide::GuideProvider;
use crate::recorder::{Recorder, RecorderPool};

/// One scheduling decision for the current pass.
#[derive(Clone)]
pub struct PendingRecord {
    pub recorder: Arc<Recorder>,
    pub channel: Channel,
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub rule: RecordingRule,
    pub airing: ShowAiring,
    /// Recording to persist once the capture is launched.
    pub recording: Recording,
    pub file: PathBuf,
}

impl std::fmt::Debug for PendingRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRecord")
            .field("recorder", &self.recorder.title())
            .field("channel", &self.channel)
            .field("start", &self.start)
            .field("duration", &self.duration)
            .field("show_id", &self.airing.show_id)
            .field("file", &self.file)
            .finish()
    }
}

/// Result of one resolver pass.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Ready records, ordered by start time.
    pub ready: Vec<PendingRecord>,
    /// Due airings without a free recorder this pass.
    pub deferred: Vec<ShowAiring>,
}

pub struct PendingRecordResolver {
    guide: Arc<dyn GuideProvider>,
    database: DatabaseHandle,
    recorders: RecorderPool,
    planner: Arc<OutputPlanner>,
}

impl PendingRecordResolver {
    pub fn new(
        guide: Arc<dyn GuideProvider>,
        database: DatabaseHandle,
        recorders: RecorderPool,
        planner: Arc<OutputPlanner>,
    ) -> Self {
        Self { guide, database, recorders, planner }
    }

    /// Airings of `rules` starting before `now + lookahead` and not yet
    /// over, each assigned to a recorder not claimed earlier in the pass.
    pub async fn resolve(
        &self,
        rules: &[RecordingRule],
        now: DateTime<Utc>,
        lookahead: Duration,
    ) -> Result<Resolution> {
        let horizon = now + chrono::Duration::from_std(lookahead).unwrap_or_else(|_| chrono::Duration::zero());
        let in_progress: HashSet<String> = {
            let db = self.database.lock().await;
            db.get_current_recordings()?
                .into_iter()
                .filter_map(|r| r.show_id)
                .collect()
        };

        let mut candidates = Vec::new();
        for rule in rules {
            for airing in self.candidates_for(rule).await? {
                if airing.end() <= now || airing.start > horizon {
                    continue;
                }
                if in_progress.contains(&airing.show_id) {
                    debug!("{} is already being recorded", airing.show_id);
                    continue;
                }
                candidates.push((rule, airing));
            }
        }

        // Stable: rule order breaks ties between equal start times
        candidates.sort_by_key(|(_, airing)| airing.start);
        let mut seen = HashSet::new();
        candidates.retain(|(_, airing)| seen.insert(airing.show_id.clone()));

        let mut claimed: HashSet<String> = HashSet::new();
        let mut resolution = Resolution::default();
        for (rule, airing) in candidates {
            let recorder = self.recorders.all().iter().find(|r| {
                !claimed.contains(r.title())
                    && r.accepts(&airing.channel)
                    && (!r.is_recording() || r.is_live_tv())
            });

            let Some(recorder) = recorder else {
                debug!("No free recorder for {} at {}, deferring", airing.show_id, airing.start);
                resolution.deferred.push(airing);
                continue;
            };
            claimed.insert(recorder.title().to_string());
            resolution.ready.push(self.pending_record(Arc::clone(recorder), rule, airing));
        }

        if !resolution.deferred.is_empty() {
            warn!("{} airing(s) deferred: not enough free recorders", resolution.deferred.len());
        }
        Ok(resolution)
    }

    async fn candidates_for(&self, rule: &RecordingRule) -> Result<Vec<ShowAiring>> {
        match rule.kind {
            RuleKind::Once => {
                let Some(show_id) = rule.show_id.as_deref() else {
                    return Ok(Vec::new());
                };
                Ok(self.guide.show_airing(show_id).await?.into_iter().collect())
            }
            RuleKind::Series => {
                let Some(series_id) = rule.series_id.as_deref() else {
                    return Ok(Vec::new());
                };
                let airings = self
                    .guide
                    .show_airings_by_channel_and_series_id(&rule.channel, series_id)
                    .await?;
                let db = self.database.lock().await;
                let mut fresh = Vec::with_capacity(airings.len());
                for airing in airings {
                    if !db.is_already_recorded(&airing.show_id)? {
                        fresh.push(airing);
                    }
                }
                Ok(fresh)
            }
        }
    }

    fn pending_record(&self, recorder: Arc<Recorder>, rule: &RecordingRule, airing: ShowAiring) -> PendingRecord {
        let title = airing.display_title();
        let file = self.planner.plan(&title, airing.start);

        let mut recording = Recording::new(title, &file, airing.start);
        recording.duration_secs = airing.duration_secs;
        recording.recording_rule_id = Some(rule.id.clone());
        recording.show_id = Some(airing.show_id.clone());
        recording.channel = Some(airing.channel.clone());
        recording.recorder = Some(recorder.title().to_string());

        PendingRecord {
            recorder,
            channel: airing.channel.clone(),
            start: airing.start,
            duration: Duration::from_secs(airing.duration_secs),
            rule: rule.clone(),
            airing,
            recording,
            file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::guide::DatabaseGuide;
    use crate::postproc::tool::testing::FakeRunner;
    use crate::recorder::capture::testing::FakeDevice;
    use crate::recorder::RecorderConfig;
    use crate::scheduler::output::DiskFreeSpace;
    use chrono::TimeZone;
    use pvr_protocol::RecordedShow;

    fn airing(show_id: &str, series: Option<&str>, channel: &str, start: DateTime<Utc>) -> ShowAiring {
        ShowAiring {
            show_id: show_id.into(),
            series_id: series.map(String::from),
            title: show_id.into(),
            episode_title: None,
            channel: Channel::new(channel),
            start,
            duration_secs: 3600,
        }
    }

    fn recorder(title: &str, allow: &[&str]) -> Arc<Recorder> {
        let mut config = RecorderConfig::new(title, format!("/dev/{}", title));
        config.quick_tunable = true;
        config.allow_channels = allow.iter().map(|c| c.to_string()).collect();
        Arc::new(Recorder::new(config, Arc::new(FakeDevice::streaming()), Arc::new(FakeRunner::default())))
    }

    fn resolver(db: &DatabaseHandle, recorders: Vec<Arc<Recorder>>, dir: &std::path::Path) -> PendingRecordResolver {
        PendingRecordResolver::new(
            Arc::new(DatabaseGuide::new(db.clone())),
            db.clone(),
            RecorderPool::new(recorders),
            Arc::new(OutputPlanner::new(vec![dir.to_path_buf()], Arc::new(DiskFreeSpace))),
        )
    }

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_once_rule_within_lookahead() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap().into_handle();
        db.lock().await.upsert_show_airing(&airing("ep-1", None, "5", t(20, 0))).unwrap();
        let rules = vec![RecordingRule::once("r1", "News", "ep-1", Channel::new("5"))];
        let resolver = resolver(&db, vec![recorder("tuner0", &["5"])], dir.path());

        // Not due yet
        let early = resolver.resolve(&rules, t(19, 0), Duration::from_secs(15)).await.unwrap();
        assert!(early.ready.is_empty());

        let due = resolver.resolve(&rules, t(19, 59), Duration::from_secs(60)).await.unwrap();
        assert_eq!(due.ready.len(), 1);
        let record = &due.ready[0];
        assert_eq!(record.recorder.title(), "tuner0");
        assert_eq!(record.channel, Channel::new("5"));
        assert_eq!(record.duration, Duration::from_secs(3600));
        assert_eq!(record.recording.recording_rule_id.as_deref(), Some("r1"));
        assert_eq!(record.recording.path, record.file);
        assert!(record.file.starts_with(dir.path()));

        // Over
        let late = resolver.resolve(&rules, t(21, 0), Duration::from_secs(15)).await.unwrap();
        assert!(late.ready.is_empty());
    }

    #[tokio::test]
    async fn test_series_skips_recorded_shows() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap().into_handle();
        {
            let mut guard = db.lock().await;
            guard.upsert_show_airing(&airing("ep-1", Some("s1"), "5", t(20, 0))).unwrap();
            guard.upsert_show_airing(&airing("ep-2", Some("s1"), "5", t(20, 0))).unwrap();
            guard.add_recorded_show(&RecordedShow::new("ep-1", None, t(12, 0))).unwrap();
        }
        let rules = vec![RecordingRule::series("r1", "Drama", "s1", Channel::new("5"))];
        let resolver = resolver(&db, vec![recorder("a", &[]), recorder("b", &[])], dir.path());

        let resolution = resolver.resolve(&rules, t(20, 0), Duration::from_secs(15)).await.unwrap();
        let shows: Vec<&str> = resolution.ready.iter().map(|r| r.airing.show_id.as_str()).collect();
        assert_eq!(shows, vec!["ep-2"]);
    }

    #[tokio::test]
    async fn test_conflict_defers_second_airing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap().into_handle();
        {
            let guard = db.lock().await;
            guard.upsert_show_airing(&airing("news", None, "5", t(20, 0))).unwrap();
            guard.upsert_show_airing(&airing("film", None, "5", t(20, 5))).unwrap();
        }
        let rules = vec![
            RecordingRule::once("r1", "News", "news", Channel::new("5")),
            RecordingRule::once("r2", "Film", "film", Channel::new("5")),
        ];
        let only = recorder("tuner0", &["5"]);
        let resolver = resolver(&db, vec![Arc::clone(&only)], dir.path());

        let first = resolver.resolve(&rules, t(20, 5), Duration::from_secs(15)).await.unwrap();
        assert_eq!(first.ready.len(), 1);
        assert_eq!(first.ready[0].airing.show_id, "news");
        assert_eq!(first.deferred.len(), 1);
        assert_eq!(first.deferred[0].show_id, "film");

        // The news rule goes away; the film is picked up on the next pass
        let second = resolver.resolve(&rules[1..], t(20, 6), Duration::from_secs(15)).await.unwrap();
        assert_eq!(second.ready.len(), 1);
        assert_eq!(second.ready[0].airing.show_id, "film");
    }

    #[tokio::test]
    async fn test_channel_lists_and_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap().into_handle();
        {
            let guard = db.lock().await;
            guard.upsert_show_airing(&airing("ep-7", None, "7", t(20, 0))).unwrap();
            guard.upsert_show_airing(&airing("ep-5", None, "5", t(20, 0))).unwrap();
            let mut current = Recording::new("ep-5", dir.path().join("ep-5.ts"), t(20, 0));
            current.current_recording = true;
            current.show_id = Some("ep-5".into());
            guard.insert_recording(&current).unwrap();
        }
        let rules = vec![
            RecordingRule::once("r7", "Seven", "ep-7", Channel::new("7")),
            RecordingRule::once("r5", "Five", "ep-5", Channel::new("5")),
        ];
        let resolver = resolver(&db, vec![recorder("five-only", &["5"])], dir.path());

        let resolution = resolver.resolve(&rules, t(20, 1), Duration::from_secs(15)).await.unwrap();
        // Channel 7 is not allowed on the only recorder; channel 5 is already capturing
        assert!(resolution.ready.is_empty());
        assert_eq!(resolution.deferred.len(), 1);
        assert_eq!(resolution.deferred[0].show_id, "ep-7");
    }
}
