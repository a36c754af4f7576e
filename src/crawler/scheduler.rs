//! Worker pool for processing pending sources
//!
//! This module handles:
//! - A frontier of source ids ordered by the time they become ready
//! - Global concurrency limiting via a semaphore
//! - Re-queueing work that was deferred by politeness or a retry backoff
//! - Cooperative cancellation between units of work

use crate::{ResearchError, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What happened to one unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Failed,
    /// Nothing to do (already processed elsewhere)
    Skipped,
    /// Put the item back and try again after the given wait
    Requeue(Duration),
}

/// A source waiting in the frontier
#[derive(Debug, Clone)]
struct QueuedSource {
    ready_at: Instant,
    /// Insertion sequence; keeps FIFO order among items ready at the same time
    seq: u64,
    source_id: String,
}

// BinaryHeap is a max-heap, so the earliest ready time compares greatest
impl Ord for QueuedSource {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedSource {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedSource {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for QueuedSource {}

/// Summary of one scheduler run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScheduleReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub requeued: usize,
    pub cancelled: bool,
    /// Items never finished (cancelled runs leave work behind)
    pub remaining: Vec<String>,
}

/// Bounded worker pool over a ready-time ordered frontier
pub struct SourceScheduler {
    max_concurrent: usize,
    frontier: BinaryHeap<QueuedSource>,
    next_seq: u64,
}

impl SourceScheduler {
    /// Creates a scheduler with every item ready immediately
    pub fn new(max_concurrent: u32, source_ids: Vec<String>) -> Self {
        let mut scheduler = Self {
            max_concurrent: max_concurrent.max(1) as usize,
            frontier: BinaryHeap::new(),
            next_seq: 0,
        };
        let now = Instant::now();
        for id in source_ids {
            scheduler.push(id, now);
        }
        scheduler
    }

    fn push(&mut self, source_id: String, ready_at: Instant) {
        self.frontier.push(QueuedSource {
            ready_at,
            seq: self.next_seq,
            source_id,
        });
        self.next_seq += 1;
    }

    pub fn pending(&self) -> usize {
        self.frontier.len()
    }

    /// Runs `process` over the frontier until it drains or `cancel` fires
    ///
    /// Cancellation stops dispatching; units already running are awaited.
    /// The first error returned by `process` also stops dispatching and is
    /// returned once in-flight work has finished.
    pub async fn run<F, Fut>(
        mut self,
        cancel: CancellationToken,
        process: F,
    ) -> Result<ScheduleReport>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Disposition>> + Send + 'static,
    {
        let process = Arc::new(process);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks: JoinSet<(String, Result<Disposition>)> = JoinSet::new();
        let mut report = ScheduleReport::default();
        let mut first_error: Option<ResearchError> = None;

        loop {
            if cancel.is_cancelled() || first_error.is_some() {
                break;
            }

            // Dispatch everything that is ready while workers are free
            let now = Instant::now();
            while self.frontier.peek().map_or(false, |q| q.ready_at <= now) {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let Some(queued) = self.frontier.pop() else {
                    break;
                };
                let process = Arc::clone(&process);
                tasks.spawn(async move {
                    let _permit = permit;
                    let id = queued.source_id;
                    let outcome = process(id.clone()).await;
                    (id, outcome)
                });
            }

            if tasks.is_empty() && self.frontier.is_empty() {
                break;
            }

            let next_ready = self.frontier.peek().map(|q| q.ready_at);
            let can_dispatch = semaphore.available_permits() > 0;

            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.handle(joined, &mut report, &mut first_error);
                }
                _ = tokio::time::sleep_until(next_ready.unwrap_or_else(Instant::now)),
                    if next_ready.is_some() && can_dispatch => {}
                _ = cancel.cancelled() => {}
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.handle(joined, &mut report, &mut first_error);
        }

        report.cancelled = cancel.is_cancelled();
        report.remaining = self
            .frontier
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|q| q.source_id)
            .collect();

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn handle(
        &mut self,
        joined: std::result::Result<(String, Result<Disposition>), tokio::task::JoinError>,
        report: &mut ScheduleReport,
        first_error: &mut Option<ResearchError>,
    ) {
        match joined {
            Ok((_, Ok(Disposition::Completed))) => report.completed += 1,
            Ok((_, Ok(Disposition::Failed))) => report.failed += 1,
            Ok((_, Ok(Disposition::Skipped))) => report.skipped += 1,
            Ok((id, Ok(Disposition::Requeue(wait)))) => {
                debug!("Re-queueing source {} in {:?}", id, wait);
                report.requeued += 1;
                self.push(id, Instant::now() + wait);
            }
            Ok((id, Err(e))) => {
                error!("Processing source {} failed: {}", id, e);
                if first_error.is_none() {
                    *first_error = Some(e);
                }
            }
            Err(e) => {
                warn!("Worker task ended abnormally: {}", e);
                report.failed += 1;
            }
        }
    }
}
