//! Byte-level progress reporting for snapshot streams.
//!
//! A transfer either drives an `indicatif` bar or emits periodic log lines.
//! Direct pipes carry no byte count and get a [`Heartbeat`] instead.
//! Which one is decided per transfer by [`ProgressMode::choose`] and handed to
//! the [`ProgressReporter`]; nothing here touches global console state.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

/// Callback receiving the running byte count.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Default spacing of progress log lines.
pub const LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Interactive bar on stderr.
    Bar,
    /// One `info!` line per interval.
    Log { interval: Duration },
    Quiet,
}

impl ProgressMode {
    /// The bar is only used when the stream size is known, the stream is not
    /// reshaped by compression or rate limiting, and stderr is a terminal.
    pub fn choose(enabled: bool, total_bytes: Option<u64>, filtered: bool, interactive: bool) -> Self {
        if !enabled {
            return ProgressMode::Quiet;
        }
        if total_bytes.is_some() && !filtered && interactive {
            ProgressMode::Bar
        } else {
            ProgressMode::Log { interval: LOG_INTERVAL }
        }
    }

    pub fn stderr_is_terminal() -> bool {
        std::io::stderr().is_terminal()
    }
}

/// Snapshot of a running transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    /// Expected stream size, if an estimate exists.
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
    pub bytes_per_second: u64,
    pub eta_seconds: Option<u64>,
}

impl TransferProgress {
    pub fn percent_complete(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some((self.transferred_bytes as f64 / total as f64 * 100.0).min(100.0)),
            _ => None,
        }
    }
}

/// Rate and ETA from successive byte counts.
pub struct ProgressTracker {
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
    progress: TransferProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last_bytes: 0,
            progress: TransferProgress {
                total_bytes,
                ..TransferProgress::default()
            },
        }
    }

    pub fn update(&mut self, transferred_bytes: u64) -> &TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();
        if elapsed > 0.0 {
            let diff = transferred_bytes.saturating_sub(self.last_bytes);
            self.progress.bytes_per_second = (diff as f64 / elapsed) as u64;
        }

        self.progress.eta_seconds = match (self.progress.total_bytes, self.progress.bytes_per_second) {
            (Some(total), rate) if rate > 0 => Some(total.saturating_sub(transferred_bytes) / rate),
            _ => None,
        };

        self.progress.transferred_bytes = transferred_bytes;
        self.last_update_time = now;
        self.last_bytes = transferred_bytes;
        &self.progress
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.progress.transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }
}

/// Reports progress of one transfer in the chosen mode.
pub struct ProgressReporter {
    label: String,
    mode: ProgressMode,
    bar: Option<ProgressBar>,
    state: Mutex<ReporterState>,
}

struct ReporterState {
    tracker: ProgressTracker,
    last_log: Instant,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, mode: ProgressMode, total_bytes: Option<u64>) -> Arc<Self> {
        let bar = match mode {
            ProgressMode::Bar => {
                let bar = ProgressBar::new(total_bytes.unwrap_or(0));
                if let Ok(style) = ProgressStyle::default_bar()
                    .template("{msg} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ({eta})")
                {
                    bar.set_style(style.progress_chars("=> "));
                }
                Some(bar)
            }
            _ => None,
        };
        let label = label.into();
        if let Some(bar) = &bar {
            bar.set_message(label.clone());
        }

        let now = Instant::now();
        Arc::new(Self {
            label,
            mode,
            bar,
            state: Mutex::new(ReporterState {
                tracker: ProgressTracker::new(total_bytes),
                last_log: now,
            }),
        })
    }

    pub fn mode(&self) -> ProgressMode {
        self.mode
    }

    /// A callback feeding this reporter, for [`super::progress_stream::ProgressStream`].
    pub fn callback(self: &Arc<Self>) -> ProgressCallback {
        let reporter = Arc::clone(self);
        Arc::new(move |bytes| reporter.update(bytes))
    }

    pub fn update(&self, bytes: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(bytes);
            return;
        }
        let ProgressMode::Log { interval } = self.mode else {
            return;
        };
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.last_log.elapsed() < interval {
            return;
        }
        state.last_log = Instant::now();
        let progress = state.tracker.update(bytes).clone();
        match progress.percent_complete() {
            Some(percent) => info!(
                "{}: {} ({:.1}%) at {}, ETA {}",
                self.label,
                format_bytes(bytes),
                percent,
                format_speed(progress.bytes_per_second),
                progress.eta_seconds.map(format_duration).unwrap_or_else(|| "unknown".into())
            ),
            None => info!(
                "{}: {} at {}",
                self.label,
                format_bytes(bytes),
                format_speed(progress.bytes_per_second)
            ),
        }
    }

    /// Final report. Returns the average speed in bytes per second.
    pub fn finish(&self, bytes: u64) -> u64 {
        if let Some(bar) = &self.bar {
            bar.set_position(bytes);
            bar.finish_and_clear();
        }
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        state.tracker.update(bytes);
        let speed = state.tracker.average_speed();
        if self.mode != ProgressMode::Quiet {
            info!(
                "{}: {} in {} ({})",
                self.label,
                format_bytes(bytes),
                format_duration(state.tracker.elapsed().as_secs()),
                format_speed(speed)
            );
        }
        speed
    }
}

/// Periodic elapsed-time lines for a stream whose bytes are not counted,
/// e.g. a direct pipe into `ssh`. Stops when dropped.
pub struct Heartbeat {
    ticks: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(label: impl Into<String>, interval: Duration) -> Self {
        let label = label.into();
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                counter.fetch_add(1, Ordering::Relaxed);
                info!("{}: running for {}", label, format_duration(start.elapsed().as_secs()));
            }
        });
        Self { ticks, handle }
    }

    /// Lines emitted so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_mode_selection() {
        assert_eq!(ProgressMode::choose(false, Some(10), false, true), ProgressMode::Quiet);
        assert_eq!(ProgressMode::choose(true, Some(10), false, true), ProgressMode::Bar);
        assert_eq!(
            ProgressMode::choose(true, None, false, true),
            ProgressMode::Log { interval: LOG_INTERVAL }
        );
        assert_eq!(
            ProgressMode::choose(true, Some(10), true, true),
            ProgressMode::Log { interval: LOG_INTERVAL }
        );
        assert_eq!(
            ProgressMode::choose(true, Some(10), false, false),
            ProgressMode::Log { interval: LOG_INTERVAL }
        );
    }

    #[test]
    fn test_percent_complete() {
        let mut tracker = ProgressTracker::new(Some(1000));
        assert_eq!(tracker.update(500).percent_complete(), Some(50.0));
        // Estimates can be low; never report past 100%.
        assert_eq!(tracker.update(1500).percent_complete(), Some(100.0));
        assert_eq!(ProgressTracker::new(None).update(5).percent_complete(), None);
    }

    #[test]
    fn test_tracker_rate_and_eta() {
        let mut tracker = ProgressTracker::new(Some(10_000));
        tracker.update(100);
        thread::sleep(Duration::from_millis(100));
        let progress = tracker.update(600);
        assert!(progress.bytes_per_second > 0);
        assert!(progress.eta_seconds.is_some());
    }

    #[test]
    fn test_reporter_finish_in_log_mode() {
        let reporter = ProgressReporter::new("test", ProgressMode::Log { interval: Duration::ZERO }, None);
        let callback = reporter.callback();
        callback(10);
        callback(20);
        reporter.finish(20);
        assert_eq!(reporter.mode(), ProgressMode::Log { interval: Duration::ZERO });
    }

    #[tokio::test]
    async fn test_heartbeat_ticks_until_dropped() {
        let heartbeat = Heartbeat::start("h-1 -> ssh://nas/b", Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(heartbeat.ticks() >= 2);

        let ticks = Arc::clone(&heartbeat.ticks);
        drop(heartbeat);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_drop = ticks.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::Relaxed), after_drop);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }

    #[test]
    fn test_format_speed_and_duration() {
        assert_eq!(format_speed(1024 * 1024), "1.00 MiB/s");
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
