//! Device capture with a liveness watchdog.
//!
//! The capture job copies the device stream into the destination file.
//! A watchdog task compares the time of the last successful read on a
//! fixed cadence. When no read happened since the previous check, it
//! closes the in-flight read and reopens the device. After more than
//! `failure_threshold` consecutive stalled checks the job fails.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::job::{Job, JobContext, JobError, JobOutcome};

const CHUNK_SIZE: usize = 188 * 1024;

/// A readable device stream.
pub type DeviceStream = Pin<Box<dyn AsyncRead + Send>>;

/// Opens capture device streams.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn open(&self, device: &Path) -> io::Result<DeviceStream>;
}

/// Opens the device node as a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDeviceSource;

#[async_trait]
impl DeviceSource for FileDeviceSource {
    async fn open(&self, device: &Path) -> io::Result<DeviceStream> {
        let file = tokio::fs::File::open(device).await?;
        Ok(Box::pin(file))
    }
}

/// Stall detection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogPolicy {
    pub check_interval: Duration,
    pub failure_threshold: u32,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(2),
            failure_threshold: 20,
        }
    }
}

/// Counters shared between the capture loop, the watchdog and observers.
#[derive(Debug, Default)]
pub struct CaptureStats {
    bytes_written: AtomicU64,
    reopens: AtomicU32,
    last_read: Mutex<Option<Instant>>,
}

impl CaptureStats {
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn reopen_count(&self) -> u32 {
        self.reopens.load(Ordering::Relaxed)
    }

    fn record_read(&self, len: usize) {
        self.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
        *self.last_read.lock() = Some(Instant::now());
    }

    fn last_read(&self) -> Option<Instant> {
        *self.last_read.lock()
    }
}

/// Copies a device stream into a file.
pub struct CaptureJob {
    device: PathBuf,
    destination: PathBuf,
    duration: Option<Duration>,
    source: Arc<dyn DeviceSource>,
    policy: WatchdogPolicy,
    stats: Arc<CaptureStats>,
}

impl CaptureJob {
    pub fn new(
        device: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        duration: Option<Duration>,
        source: Arc<dyn DeviceSource>,
        policy: WatchdogPolicy,
    ) -> Self {
        Self {
            device: device.into(),
            destination: destination.into(),
            duration,
            source,
            policy,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    async fn open_device(&self) -> Result<DeviceStream, JobError> {
        self.source.open(&self.device).await.map_err(|source| JobError::DeviceOpen {
            path: self.device.display().to_string(),
            source,
        })
    }

    /// Spawn the watchdog. `reopen` is notified on every stalled check;
    /// `exhausted` fires once the failure budget is spent.
    fn spawn_watchdog(
        &self,
        stop: CancellationToken,
        reopen: Arc<Notify>,
        exhausted: CancellationToken,
    ) -> tokio::task::JoinHandle<u32> {
        let stats = Arc::clone(&self.stats);
        let policy = self.policy;
        let device = self.device.display().to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + policy.check_interval, policy.check_interval);
            let mut previous = stats.last_read();
            let mut failures = 0u32;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let current = stats.last_read();
                if current != previous {
                    previous = current;
                    failures = 0;
                    continue;
                }

                failures += 1;
                if failures > policy.failure_threshold {
                    warn!("Device {} stalled for {} checks, giving up", device, failures);
                    exhausted.cancel();
                    break;
                }
                warn!(
                    "Device {} stalled ({}/{}), reopening",
                    device, failures, policy.failure_threshold
                );
                reopen.notify_one();
            }
            failures
        })
    }
}

/// Read from the stream if one is open; pend forever otherwise.
async fn read_chunk(stream: &mut Option<DeviceStream>, buf: &mut BytesMut) -> io::Result<usize> {
    match stream {
        Some(stream) => stream.read_buf(buf).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Job for CaptureJob {
    fn name(&self) -> &str {
        "capture"
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutcome, JobError> {
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.destination)
            .await?;
        let mut stream = Some(self.open_device().await?);

        info!(
            "Capturing {} -> {} ({})",
            self.device.display(),
            self.destination.display(),
            self.duration
                .map(|d| format!("{}s", d.as_secs()))
                .unwrap_or_else(|| "until stopped".to_string())
        );

        let watchdog_stop = ctx.token().child_token();
        let reopen = Arc::new(Notify::new());
        let exhausted = CancellationToken::new();
        let watchdog = self.spawn_watchdog(watchdog_stop.clone(), Arc::clone(&reopen), exhausted.clone());

        let deadline = self.duration.map(|d| Instant::now() + d);
        let sleep = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86400 * 365)));
        tokio::pin!(sleep);

        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        // Set when the stream reported end-of-file; reading resumes after a reopen
        let mut drained = false;

        let result = loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break Ok(JobOutcome::Cancelled),
                _ = exhausted.cancelled() => {
                    let failures = self.policy.failure_threshold + 1;
                    break Err(JobError::WatchdogExhausted { failures });
                }
                _ = &mut sleep, if deadline.is_some() => break Ok(JobOutcome::Completed),
                _ = reopen.notified() => {
                    // Dropping the stream aborts the in-flight read
                    stream = None;
                    self.stats.reopens.fetch_add(1, Ordering::Relaxed);
                    match self.source.open(&self.device).await {
                        Ok(reopened) => {
                            stream = Some(reopened);
                            drained = false;
                            ctx.update(format!("reopened {}", self.device.display()));
                        }
                        Err(e) => warn!("Failed to reopen {}: {}", self.device.display(), e),
                    }
                }
                read = read_chunk(&mut stream, &mut buf), if !drained => match read {
                    Ok(0) => {
                        debug!("Device {} reported end of stream", self.device.display());
                        drained = true;
                    }
                    Ok(n) => {
                        if let Err(e) = out.write_all(&buf).await {
                            break Err(JobError::Io(e));
                        }
                        buf.clear();
                        self.stats.record_read(n);
                    }
                    Err(e) => {
                        // A read failing under us is recovered by the next reopen
                        warn!("Read from {} failed: {}", self.device.display(), e);
                        drained = true;
                    }
                },
            }
        };

        watchdog_stop.cancel();
        let _ = watchdog.await;
        out.flush().await?;

        info!(
            "Capture of {} ended: {} bytes, {} reopens",
            self.destination.display(),
            self.stats.bytes_written(),
            self.stats.reopen_count()
        );
        result
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// A read that never completes, like a wedged device.
    pub struct StalledStream;

    impl AsyncRead for StalledStream {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    /// Device producing one TS packet every 100ms, optionally stalling
    /// on the first `stalled_opens` opens.
    #[derive(Default)]
    pub struct FakeDevice {
        pub opens: AtomicU32,
        pub stalled_opens: u32,
        pub always_stalled: bool,
    }

    impl FakeDevice {
        pub fn streaming() -> Self {
            Self::default()
        }

        pub fn stalled() -> Self {
            Self { always_stalled: true, ..Self::default() }
        }

        pub fn stalls_first(opens: u32) -> Self {
            Self { stalled_opens: opens, ..Self::default() }
        }
    }

    #[async_trait]
    impl DeviceSource for FakeDevice {
        async fn open(&self, _device: &Path) -> io::Result<DeviceStream> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if self.always_stalled || n < self.stalled_opens {
                return Ok(Box::pin(StalledStream));
            }
            let (mut tx, rx) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                loop {
                    if tx.write_all(&[0x47; 188]).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            });
            Ok(Box::pin(rx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeDevice;
    use super::*;

    fn job(dir: &Path, device: Arc<dyn DeviceSource>, secs: Option<u64>) -> CaptureJob {
        CaptureJob::new(
            "/dev/fake0",
            dir.join("out.ts"),
            secs.map(Duration::from_secs),
            device,
            WatchdogPolicy { check_interval: Duration::from_secs(2), failure_threshold: 3 },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_runs_for_duration() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), Arc::new(FakeDevice::streaming()), Some(5));
        let stats = job.stats();

        let outcome = job.run(JobContext::detached(CancellationToken::new())).await.unwrap();

        assert_eq!(outcome, JobOutcome::Completed);
        assert!(stats.bytes_written() > 0);
        assert_eq!(stats.reopen_count(), 0);
        let len = std::fs::metadata(dir.path().join("out.ts")).unwrap().len();
        assert_eq!(len, stats.bytes_written());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_triggers_reopen_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FakeDevice::stalls_first(1));
        let job = job(dir.path(), device.clone(), Some(20));
        let stats = job.stats();

        let outcome = job.run(JobContext::detached(CancellationToken::new())).await.unwrap();

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(stats.reopen_count(), 1);
        assert_eq!(device.opens.load(Ordering::SeqCst), 2);
        assert!(stats.bytes_written() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_gives_up_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), Arc::new(FakeDevice::stalled()), None);
        let stats = job.stats();
        let started = Instant::now();

        let err = job.run(JobContext::detached(CancellationToken::new())).await.unwrap_err();

        assert!(matches!(err, JobError::WatchdogExhausted { failures: 4 }));
        assert_eq!(stats.reopen_count(), 3);
        // threshold + 1 checks at 2s each
        assert!(started.elapsed() >= Duration::from_secs(8));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_capture() {
        let dir = tempfile::tempdir().unwrap();
        let job = Arc::new(job(dir.path(), Arc::new(FakeDevice::streaming()), None));
        let cancel = CancellationToken::new();

        let running = {
            let job = Arc::clone(&job);
            let ctx = JobContext::detached(cancel.clone());
            tokio::spawn(async move { job.run(ctx).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_device_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let job = CaptureJob::new(
            dir.path().join("no-such-device"),
            dir.path().join("out.ts"),
            Some(Duration::from_secs(1)),
            Arc::new(FileDeviceSource),
            WatchdogPolicy::default(),
        );
        let err = job.run(JobContext::detached(CancellationToken::new())).await.unwrap_err();
        assert!(matches!(err, JobError::DeviceOpen { .. }));
    }
}
