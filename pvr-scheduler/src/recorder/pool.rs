//! Registry of configured recorders.

use std::sync::Arc;

use futures::future::join_all;
use log::info;

use super::capture::{DeviceSource, WatchdogPolicy};
use super::tuner::{Recorder, RecorderConfig};
use crate::config::RecorderSettings;
use crate::postproc::tool::ToolRunner;

/// All recorders, in configuration order.
#[derive(Clone, Default)]
pub struct RecorderPool {
    recorders: Vec<Arc<Recorder>>,
}

impl RecorderPool {
    pub fn new(recorders: Vec<Arc<Recorder>>) -> Self {
        Self { recorders }
    }

    /// Build the pool from `[[recorder]]` config entries.
    pub fn from_settings(
        settings: &[RecorderSettings],
        watchdog: WatchdogPolicy,
        source: Arc<dyn DeviceSource>,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        let recorders = settings
            .iter()
            .map(|s| {
                info!("Recorder {} on {}", s.title, s.device_path.display());
                Arc::new(Recorder::new(
                    RecorderConfig::from_settings(s, watchdog),
                    Arc::clone(&source),
                    Arc::clone(&runner),
                ))
            })
            .collect();
        Self { recorders }
    }

    pub fn all(&self) -> &[Arc<Recorder>] {
        &self.recorders
    }

    pub fn get(&self, title: &str) -> Option<Arc<Recorder>> {
        self.recorders.iter().find(|r| r.title() == title).cloned()
    }

    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }

    /// Whether any recorder is capturing (scheduled or live).
    pub fn any_active(&self) -> bool {
        self.recorders.iter().any(|r| r.is_recording())
    }

    /// Stop every recorder.
    pub async fn stop_all(&self) {
        join_all(self.recorders.iter().map(|r| r.stop_recording())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postproc::tool::testing::FakeRunner;
    use crate::recorder::capture::testing::FakeDevice;
    use pvr_protocol::Channel;
    use std::path::PathBuf;
    use std::time::Duration;

    fn settings(title: &str) -> RecorderSettings {
        RecorderSettings {
            title: title.into(),
            device_path: PathBuf::from(format!("/dev/{}", title)),
            quick_tunable: true,
            tune_command: None,
            allow_channels: Vec::new(),
            deny_channels: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_lookup_and_stop_all() {
        let dir = tempfile::tempdir().unwrap();
        let pool = RecorderPool::from_settings(
            &[settings("a"), settings("b")],
            WatchdogPolicy::default(),
            Arc::new(FakeDevice::streaming()),
            Arc::new(FakeRunner::default()),
        );
        assert_eq!(pool.len(), 2);
        assert!(pool.get("missing").is_none());

        let a = pool.get("a").unwrap();
        a.start_recording(Channel::new("5"), Some(Duration::from_secs(60)), dir.path().join("a.ts"), false)
            .unwrap();
        assert!(pool.any_active());

        pool.stop_all().await;
        assert!(!pool.any_active());
    }
}
