//! Byte-counting stream wrapper used by the in-process pump.

use super::progress::ProgressCallback;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Wraps a byte stream, counting what passes through and calling the
/// progress callback at most once per interval plus once at the end.
///
/// The count is shared so it stays readable after the stream has been moved
/// into a pump task.
pub struct ProgressStream<S> {
    inner: S,
    counter: Arc<AtomicU64>,
    last_update: Instant,
    update_interval: Duration,
    callback: Option<ProgressCallback>,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, callback: Option<ProgressCallback>) -> Self {
        Self {
            inner,
            counter: Arc::new(AtomicU64::new(0)),
            last_update: Instant::now(),
            update_interval: Duration::from_millis(250),
            callback,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Handle on the running byte count.
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.counter)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    fn notify(&self, bytes: u64) {
        if let Some(callback) = &self.callback {
            callback(bytes);
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let total = self.counter.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;
                let now = Instant::now();
                if now.duration_since(self.last_update) >= self.update_interval {
                    self.notify(total);
                    self.last_update = now;
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(None) => {
                self.notify(self.bytes_transferred());
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
