//! A running `send -> filters -> receive` process chain.
//!
//! Stages are connected with OS pipes. With [`TransportStrategy::Filtered`]
//! the last hop into `receive` goes through an in-process pump that counts
//! bytes for progress reporting; with [`TransportStrategy::DirectPipe`] every
//! hop is a plain pipe. All pipes are closed and all tasks stopped on every
//! exit path, including drop.

use super::progress::ProgressCallback;
use super::progress_stream::ProgressStream;
use super::{StageTimeouts, TransportStrategy};
use crate::endpoint::{spawn_stage, Endpoint, ReceiveOptions, SpawnedProcess};
use crate::utils::errors::{AgentError, Result, StageFailure};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Time a stage gets to exit after SIGTERM before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(5);
/// Time to collect the rest of stderr once a stage has exited.
const STDERR_GRACE: Duration = Duration::from_secs(5);

/// One spawned stage plus the task collecting its stderr.
pub(crate) struct RunningStage {
    process: SpawnedProcess,
    stderr: Option<JoinHandle<String>>,
}

impl RunningStage {
    pub(crate) fn new(mut process: SpawnedProcess) -> Self {
        let stderr = process.child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });
        Self { process, stderr }
    }

    pub(crate) fn label(&self) -> &str {
        &self.process.label
    }

    pub(crate) fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.process.child.stdin.take()
    }

    pub(crate) fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.process.child.stdout.take()
    }

    /// Wait for the stage to exit within `limit`. A stage still running at
    /// the deadline is terminated and reported as timed out.
    pub(crate) async fn wait(&mut self, limit: Duration) -> Option<StageFailure> {
        let command = self.process.command.clone();
        match timeout(limit, self.process.child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                self.collect_stderr().await;
                None
            }
            Ok(Ok(status)) => {
                let stderr = self.collect_stderr().await;
                Some(StageFailure::new(command, status.code(), &stderr))
            }
            Ok(Err(e)) => Some(StageFailure::new(command, None, &format!("failed to wait: {}", e))),
            Err(_) => {
                warn!(stage = %self.process.label, "Stage timed out after {:?}, terminating", limit);
                self.terminate().await;
                let stderr = self.collect_stderr().await;
                Some(StageFailure::timeout(command, &stderr))
            }
        }
    }

    async fn terminate(&mut self) {
        if let Some(pid) = self.process.child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if timeout(TERM_GRACE, self.process.child.wait()).await.is_ok() {
                return;
            }
        }
        let _ = self.process.child.kill().await;
    }

    async fn collect_stderr(&mut self) -> String {
        let Some(mut handle) = self.stderr.take() else {
            return String::new();
        };
        match timeout(STDERR_GRACE, &mut handle).await {
            Ok(Ok(text)) => text,
            _ => {
                handle.abort();
                String::new()
            }
        }
    }

    fn close_pipes(&mut self) {
        drop(self.process.child.stdin.take());
        drop(self.process.child.stdout.take());
        drop(self.process.child.stderr.take());
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
    }
}

impl Drop for RunningStage {
    fn drop(&mut self) {
        self.close_pipes();
    }
}

/// Result of a finished pipeline.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub failures: Vec<StageFailure>,
    /// Bytes pumped into `receive`; `None` for direct pipes.
    pub bytes: Option<u64>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Filter stage to place between `send` and `receive`.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub label: String,
    pub argv: Vec<String>,
}

impl FilterSpec {
    pub fn new(label: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            label: label.into(),
            argv,
        }
    }
}

pub struct Pipeline {
    send: RunningStage,
    filters: Vec<RunningStage>,
    receive: RunningStage,
    pump: Option<JoinHandle<io::Result<u64>>>,
    counter: Option<Arc<AtomicU64>>,
    strategy: TransportStrategy,
}

fn into_stdio(stdout: ChildStdout, label: &str) -> Result<Stdio> {
    stdout
        .try_into()
        .map_err(|e: io::Error| AgentError::Command(format!("failed to chain output of '{}': {}", label, e)))
}

impl Pipeline {
    /// Spawn every stage. `send` must have a piped stdout.
    pub fn start(
        send: SpawnedProcess,
        filters: &[FilterSpec],
        destination: &dyn Endpoint,
        receive_options: &ReceiveOptions,
        strategy: TransportStrategy,
        progress: Option<ProgressCallback>,
    ) -> Result<Self> {
        let mut send = RunningStage::new(send);
        let mut upstream = send
            .take_stdout()
            .ok_or_else(|| AgentError::Command(format!("stage '{}' has no stdout", send.label())))?;
        let mut upstream_label = send.label().to_string();

        let mut running = Vec::with_capacity(filters.len());
        for filter in filters {
            let stdin = into_stdio(upstream, &upstream_label)?;
            let mut stage = RunningStage::new(spawn_stage(&filter.label, &filter.argv, stdin, Stdio::piped())?);
            upstream = stage
                .take_stdout()
                .ok_or_else(|| AgentError::Command(format!("stage '{}' has no stdout", filter.label)))?;
            upstream_label = filter.label.clone();
            running.push(stage);
        }

        let (receive, pump, counter) = match strategy {
            TransportStrategy::DirectPipe | TransportStrategy::Chunked => {
                let stdin = into_stdio(upstream, &upstream_label)?;
                (RunningStage::new(destination.receive(stdin, receive_options)?), None, None)
            }
            TransportStrategy::Filtered => {
                let mut receive = RunningStage::new(destination.receive(Stdio::piped(), receive_options)?);
                let sink = receive
                    .take_stdin()
                    .ok_or_else(|| AgentError::Command("receive stage has no stdin".into()))?;
                let stream = ProgressStream::new(ReaderStream::new(upstream), progress);
                let counter = stream.counter();
                (receive, Some(tokio::spawn(pump(stream, sink))), Some(counter))
            }
        };

        debug!(
            stages = running.len() + 2,
            strategy = %strategy,
            "Pipeline started"
        );

        Ok(Self {
            send,
            filters: running,
            receive,
            pump,
            counter,
            strategy,
        })
    }

    pub fn strategy(&self) -> TransportStrategy {
        self.strategy
    }

    /// Bytes pumped so far.
    pub fn bytes_pumped(&self) -> Option<u64> {
        self.counter.as_ref().map(|c| c.load(Ordering::Relaxed))
    }

    /// Wait for every stage. Any non-zero exit, timeout or pump error is a
    /// failure, whatever the other stages reported. The pump and `receive`
    /// share one receive deadline, counted from the end of the upstream stages.
    pub async fn finish(mut self, timeouts: &StageTimeouts) -> PipelineReport {
        let mut report = PipelineReport::default();

        if let Some(failure) = self.send.wait(timeouts.send).await {
            report.failures.push(failure);
        }
        for stage in self.filters.iter_mut() {
            if let Some(failure) = stage.wait(timeouts.filter).await {
                report.failures.push(failure);
            }
        }

        let receive_deadline = Instant::now() + timeouts.receive;
        if let Some(mut pump) = self.pump.take() {
            match timeout_at(receive_deadline, &mut pump).await {
                Ok(Ok(Ok(bytes))) => report.bytes = Some(bytes),
                Ok(Ok(Err(e))) => {
                    report.bytes = self.bytes_pumped();
                    report
                        .failures
                        .push(StageFailure::new("stream pump", None, &e.to_string()));
                }
                Ok(Err(e)) => report
                    .failures
                    .push(StageFailure::new("stream pump", None, &e.to_string())),
                Err(_) => {
                    pump.abort();
                    report.failures.push(StageFailure::timeout("stream pump", ""));
                }
            }
        }

        let remaining = receive_deadline.saturating_duration_since(Instant::now());
        if let Some(failure) = self.receive.wait(remaining).await {
            report.failures.push(failure);
        }

        self.close_all();
        report
    }

    fn close_all(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.send.close_pipes();
        for stage in self.filters.iter_mut() {
            stage.close_pipes();
        }
        self.receive.close_pipes();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close_all();
    }
}

async fn pump<S>(mut stream: S, mut sink: ChildStdin) -> io::Result<u64>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        sink.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    sink.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ShellEndpoint;
    use tempfile::TempDir;

    fn sh(label: &str, script: &str) -> SpawnedProcess {
        spawn_stage(
            label,
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            Stdio::null(),
            Stdio::piped(),
        )
        .unwrap()
    }

    fn timeouts(secs: u64) -> StageTimeouts {
        StageTimeouts {
            send: Duration::from_secs(secs),
            filter: Duration::from_secs(secs),
            receive: Duration::from_secs(secs),
        }
    }

    #[tokio::test]
    async fn test_filtered_pipeline_counts_bytes() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let dest = ShellEndpoint::new(format!("cat > {}", out.display()), "h-");

        let filters = vec![FilterSpec::new("upper", vec!["tr".into(), "a-z".into(), "A-Z".into()])];
        let pipeline = Pipeline::start(
            sh("send", "printf hello"),
            &filters,
            &dest,
            &ReceiveOptions::default(),
            TransportStrategy::Filtered,
            None,
        )
        .unwrap();
        let report = pipeline.finish(&timeouts(30)).await;

        assert!(report.succeeded(), "{:?}", report.failures);
        assert_eq!(report.bytes, Some(5));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "HELLO");
    }

    #[tokio::test]
    async fn test_direct_pipe() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let dest = ShellEndpoint::new(format!("cat > {}", out.display()), "h-");

        let pipeline = Pipeline::start(
            sh("send", "printf direct"),
            &[],
            &dest,
            &ReceiveOptions::default(),
            TransportStrategy::DirectPipe,
            None,
        )
        .unwrap();
        let report = pipeline.finish(&timeouts(30)).await;

        assert!(report.succeeded());
        assert_eq!(report.bytes, None);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "direct");
    }

    #[tokio::test]
    async fn test_any_nonzero_exit_fails() {
        // Receive succeeds, send fails after writing its output.
        let dest = ShellEndpoint::new("cat > /dev/null", "h-");
        let pipeline = Pipeline::start(
            sh("send", "printf data; echo 'send broke' >&2; exit 4"),
            &[],
            &dest,
            &ReceiveOptions::default(),
            TransportStrategy::Filtered,
            None,
        )
        .unwrap();
        let report = pipeline.finish(&timeouts(30)).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].exit_code, Some(4));
        assert!(report.failures[0].stderr.contains("send broke"));
    }

    #[tokio::test]
    async fn test_receive_failure_is_reported() {
        let dest = ShellEndpoint::new("cat > /dev/null; exit 2", "h-");
        let pipeline = Pipeline::start(
            sh("send", "printf data"),
            &[],
            &dest,
            &ReceiveOptions::default(),
            TransportStrategy::DirectPipe,
            None,
        )
        .unwrap();
        let report = pipeline.finish(&timeouts(30)).await;

        assert!(report.failures.iter().any(|f| f.exit_code == Some(2)));
    }

    #[tokio::test]
    async fn test_hung_stage_times_out() {
        let dest = ShellEndpoint::new("cat > /dev/null", "h-");
        let pipeline = Pipeline::start(
            sh("send", "sleep 30"),
            &[],
            &dest,
            &ReceiveOptions::default(),
            TransportStrategy::Filtered,
            None,
        )
        .unwrap();
        let report = pipeline.finish(&timeouts(1)).await;

        assert!(report.failures.iter().any(|f| f.timed_out));
    }

    #[tokio::test]
    async fn test_pump_and_receive_share_one_deadline() {
        // Receive never reads, so the pump stalls once the pipes are full.
        let dest = ShellEndpoint::new("exec sleep 30", "h-");
        let pipeline = Pipeline::start(
            sh("send", "head -c 98304 /dev/zero"),
            &[],
            &dest,
            &ReceiveOptions::default(),
            TransportStrategy::Filtered,
            None,
        )
        .unwrap();
        let limits = StageTimeouts {
            send: Duration::from_secs(30),
            filter: Duration::from_secs(30),
            receive: Duration::from_secs(2),
        };

        let started = std::time::Instant::now();
        let report = pipeline.finish(&limits).await;
        assert_eq!(report.failures.iter().filter(|f| f.timed_out).count(), 2);
        assert!(started.elapsed() < Duration::from_millis(3500), "{:?}", started.elapsed());
    }
}
