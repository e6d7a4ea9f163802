//! Lazy stream of difference records.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::Result;

use super::record::DiffRecord;
use super::stats::{DiffStats, StatsRecorder};

/// Records of a running diff, in the order workers produce them.
///
/// Dropping the stream cancels the diff: ranges already being compared may
/// finish, no new range is started. After an error item the stream ends.
pub struct DiffStream {
    rx: mpsc::Receiver<Result<DiffRecord>>,
    stats: Arc<StatsRecorder>,
    cancel: CancellationToken,
    finished: bool,
    _guard: DropGuard,
}

impl DiffStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<DiffRecord>>,
        stats: Arc<StatsRecorder>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            stats,
            _guard: cancel.clone().drop_guard(),
            cancel,
            finished: false,
        }
    }

    /// Statistics so far.
    pub fn stats(&self) -> DiffStats {
        self.stats.snapshot()
    }

    /// Stop starting new ranges. The stream ends once in-flight ranges drain.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that cancels this diff when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect_all(mut self) -> Result<Vec<DiffRecord>> {
        let mut records = Vec::new();
        while let Some(item) = self.next().await {
            records.push(item?);
        }
        Ok(records)
    }
}

impl Stream for DiffStream {
    type Item = Result<DiffRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                self.cancel.cancel();
                self.rx.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for DiffStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffStream")
            .field("stats", &self.stats.snapshot())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
