//! Coalesces concurrent spawn requests into cohorts.
//!
//! A background task owns the pending set and the batch deadline. The first
//! submission after idle arms a deadline of one batch window; submissions
//! arriving before it join the same cohort. When the deadline passes (or on
//! [`BatchScheduler::flush`]) the pending set is drained into one cohort:
//!
//! - a single member runs directly, with no group id;
//! - larger cohorts get a fresh group id and run in chunks of at most
//!   `max_parallel_children` members, one chunk after another, members of a
//!   chunk concurrently.
//!
//! Every submission resolves independently through its own oneshot channel,
//! so one failing member never affects its siblings.

use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use rlm_core::{RlmError, RlmResult};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Runs one cohort member: the child's context and the cohort's group id
/// (`None` when the member ran alone).
pub type MemberFn = Arc<
    dyn Fn(String, Option<Uuid>) -> BoxFuture<'static, RlmResult<serde_json::Value>>
        + Send
        + Sync,
>;

/// Notified once when a parallel cohort starts and once when it finishes.
pub trait CohortObserver: Send + Sync {
    /// A cohort of `members` submissions is about to run.
    fn cohort_started(&self, group_id: Uuid, members: usize);
    /// Every member of the cohort has resolved.
    fn cohort_finished(&self, group_id: Uuid, members: usize, elapsed: Duration);
}

/// Counters describing how submissions were executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Submissions that ran alone.
    pub sequential_queries: u64,
    /// Cohorts with more than one member.
    pub parallel_groups: u64,
    /// Submissions that ran as part of such a cohort.
    pub parallel_queries: u64,
}

enum Command {
    Submit {
        context: String,
        reply: oneshot::Sender<RlmResult<serde_json::Value>>,
    },
    Flush,
}

struct Pending {
    context: String,
    reply: oneshot::Sender<RlmResult<serde_json::Value>>,
}

/// Handle to a batching task. Dropping it lets the task run whatever is
/// still pending and exit.
pub struct BatchScheduler {
    tx: mpsc::UnboundedSender<Command>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl BatchScheduler {
    /// Spawns the batching task on the current tokio runtime.
    pub fn new(
        window: Duration,
        max_parallel_children: usize,
        member: MemberFn,
        observer: Option<Arc<dyn CohortObserver>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));

        let batcher = Batcher {
            window,
            max_parallel_children,
            member,
            observer,
            stats: Arc::clone(&stats),
        };
        tokio::spawn(batcher.run(rx));

        Self { tx, stats }
    }

    /// Enqueues `context` and returns a future for its result.
    ///
    /// The submission is registered when this is called, not when the future
    /// is first polled, so several submissions made back to back land in the
    /// same cohort.
    pub fn submit(
        &self,
        context: String,
    ) -> impl Future<Output = RlmResult<serde_json::Value>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let queued = self.tx.send(Command::Submit { context, reply }).is_ok();

        async move {
            if !queued {
                return Err(RlmError::Orchestrator(
                    "batch scheduler has shut down".to_string(),
                ));
            }
            rx.await.map_err(|_| {
                RlmError::Orchestrator("batch member was dropped before it resolved".to_string())
            })?
        }
    }

    /// Runs anything pending now instead of at the deadline.
    pub fn flush(&self) {
        // A closed channel means the task already drained and exited.
        let _ = self.tx.send(Command::Flush);
    }

    /// Current counters.
    pub fn stats(&self) -> SchedulerStats {
        *self.stats.lock()
    }

    /// Zeroes the counters. Cohorts already running are not affected.
    pub fn reset_stats(&self) {
        *self.stats.lock() = SchedulerStats::default();
    }
}

struct Batcher {
    window: Duration,
    max_parallel_children: usize,
    member: MemberFn,
    observer: Option<Arc<dyn CohortObserver>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl Batcher {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut pending: Vec<Pending> = Vec::new();

        loop {
            // Idle until the first submission.
            match rx.recv().await {
                Some(Command::Submit { context, reply }) => pending.push(Pending { context, reply }),
                Some(Command::Flush) => continue,
                None => break,
            }

            let deadline = tokio::time::sleep(self.window);
            tokio::pin!(deadline);
            let mut closed = false;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut deadline => break,
                    command = rx.recv() => match command {
                        Some(Command::Submit { context, reply }) => {
                            pending.push(Pending { context, reply });
                        }
                        Some(Command::Flush) => break,
                        None => {
                            closed = true;
                            break;
                        }
                    },
                }
            }

            let cohort = std::mem::take(&mut pending);
            debug!(members = cohort.len(), "Batch window closed");
            tokio::spawn(execute_cohort(
                cohort,
                self.max_parallel_children,
                Arc::clone(&self.member),
                self.observer.clone(),
                Arc::clone(&self.stats),
            ));

            if closed {
                break;
            }
        }
    }
}

async fn execute_cohort(
    mut cohort: Vec<Pending>,
    max_parallel_children: usize,
    member: MemberFn,
    observer: Option<Arc<dyn CohortObserver>>,
    stats: Arc<Mutex<SchedulerStats>>,
) {
    if cohort.len() == 1 {
        if let Some(single) = cohort.pop() {
            stats.lock().sequential_queries += 1;
            let result = member(single.context, None).await;
            // The submitter may have stopped waiting.
            let _ = single.reply.send(result);
        }
        return;
    }

    let size = cohort.len();
    let group_id = Uuid::new_v4();
    let started = Instant::now();
    {
        let mut stats = stats.lock();
        stats.parallel_groups += 1;
        stats.parallel_queries += size as u64;
    }

    info!(
        group_id = %group_id,
        members = size,
        max_parallel_children,
        "Starting parallel cohort"
    );
    if let Some(observer) = &observer {
        observer.cohort_started(group_id, size);
    }

    let chunk_size = if max_parallel_children == 0 {
        size
    } else {
        max_parallel_children
    };

    let mut members = cohort.into_iter().peekable();
    while members.peek().is_some() {
        let chunk: Vec<Pending> = members.by_ref().take(chunk_size).collect();
        join_all(chunk.into_iter().map(|pending| {
            let run = member(pending.context, Some(group_id));
            async move {
                let _ = pending.reply.send(run.await);
            }
        }))
        .await;
    }

    let elapsed = started.elapsed();
    info!(
        group_id = %group_id,
        members = size,
        elapsed_ms = elapsed.as_millis() as u64,
        "Parallel cohort finished"
    );
    if let Some(observer) = &observer {
        observer.cohort_finished(group_id, size, elapsed);
    }
}
