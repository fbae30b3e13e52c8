//! Runs one phase's worth of tasks through a bounded worker pool: enumerate pending
//! work, dispatch FIFO by `(sort_order, task_id)` under a per-phase semaphore, persist
//! the three-transition-per-task lifecycle, and retry transient failures in place with
//! exponential backoff. Grounded on the teacher's `JoinSet` + `Semaphore` execution
//! loop and its separate pure task-scheduling helpers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pc_store::{MetadataStore, StoreError};
use pc_types::{RunId, Task, TaskKind, TaskStatus};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(6);
const MAX_TASK_RETRIES: u32 = 2;
/// How long `run_phase` waits for in-flight tasks to notice cancellation and
/// wind down on their own before it gives up and hard-aborts them.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What a single task attempt produced. Distinguishing transient from permanent
/// failures is the worker's job: it knows whether the underlying error was a network
/// blip/upstream 5xx/rate-limit timeout or something no retry would fix.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded,
    TransientFailure(String),
    PermanentFailure(String),
    /// The worker noticed `cancel` was set partway through and unwound instead
    /// of starting or continuing its upstream call.
    Cancelled(String),
}

#[async_trait]
pub trait PhaseWorker: Send + Sync {
    /// Performs one attempt at `task`. Must not mutate the task's persisted status;
    /// the scheduler owns the pending/running/succeeded/failed transitions. Should
    /// check `cancel` at await points and before/after upstream calls, returning
    /// `TaskOutcome::Cancelled` instead of starting further work once it fires.
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> TaskOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Completed,
    CompletedWithPartialFailures,
    Failed,
}

/// Raw per-kind task counts for a finished phase. Each phase's own pass/fail
/// threshold is domain-specific (spec'd per phase), so this just reports counts; the
/// caller (the run coordinator) turns them into a `PhaseStatus`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct PhaseScheduler {
    store: Arc<MetadataStore>,
}

impl PhaseScheduler {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    /// Runs every currently-pending task of `kind` for `run_id` to completion.
    /// Dispatch is FIFO by `(sort_order, task_id)`, bounded by `concurrency` in-flight
    /// tasks at a time. Returns once every dispatched task has reached a terminal
    /// state, or immediately once `cancel` fires and in-flight tasks have quiesced.
    pub async fn run_phase(
        &self,
        run_id: RunId,
        kind: TaskKind,
        concurrency: u32,
        cancel: CancellationToken,
        worker: Arc<dyn PhaseWorker>,
    ) -> Result<PhaseReport, SchedulerError> {
        let pending = self.store.list_pending_tasks(&run_id, kind).await?;
        let total = pending.len();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1) as usize));
        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut next = 0usize;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            while next < pending.len() {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let task = pending[next].clone();
                next += 1;

                let store = self.store.clone();
                let worker = worker.clone();
                let cancel = cancel.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    run_one_task(&store, task, worker.as_ref(), &cancel).await;
                });
            }

            if join_set.is_empty() {
                if next >= pending.len() {
                    break;
                }
                // Nothing runnable yet (pool saturated); wait for a slot to free.
                tokio::task::yield_now().await;
                continue;
            }

            join_set.join_next().await;
        }

        if cancel.is_cancelled() {
            let drained = tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(%run_id, ?kind, "cancellation drain timed out, aborting remaining tasks");
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                self.finalize_abandoned_running(&run_id, kind).await?;
            }
            self.cancel_remaining(&pending[next.min(pending.len())..]).await?;
        }

        let finished = self.store.list_tasks_by_run(&run_id).await?;
        let mut report = PhaseReport {
            total,
            ..Default::default()
        };
        for task in finished.into_iter().filter(|t| t.kind == kind) {
            match task.status {
                TaskStatus::Succeeded => report.succeeded += 1,
                TaskStatus::Failed => report.failed += 1,
                TaskStatus::Cancelled => report.cancelled += 1,
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }
        Ok(report)
    }

    async fn cancel_remaining(&self, undispatched: &[Task]) -> Result<(), SchedulerError> {
        for task in undispatched {
            let mut task = task.clone();
            task.mark_terminal(TaskStatus::Cancelled, None);
            self.store.update_task(&task).await?;
        }
        Ok(())
    }

    /// Last resort after a hard abort: any task of `kind` still sitting at
    /// `running` lost its future mid-flight and will never reach `run_one_task`'s
    /// terminal match arms on its own, so mark it cancelled directly.
    async fn finalize_abandoned_running(&self, run_id: &RunId, kind: TaskKind) -> Result<(), SchedulerError> {
        let tasks = self.store.list_tasks_by_run(run_id).await?;
        for mut task in tasks.into_iter().filter(|t| t.kind == kind && t.status == TaskStatus::Running) {
            task.mark_terminal(TaskStatus::Cancelled, Some("aborted after cancellation drain timed out".to_string()));
            self.store.update_task(&task).await?;
        }
        Ok(())
    }
}

/// Drives one task through pending→running→{succeeded|failed}, retrying transient
/// failures in place with exponential backoff + full jitter before giving up.
async fn run_one_task(
    store: &MetadataStore,
    mut task: Task,
    worker: &dyn PhaseWorker,
    cancel: &CancellationToken,
) {
    loop {
        task.mark_running();
        if let Err(e) = store.update_task(&task).await {
            tracing::error!(task_id = %task.task_id, error = %e, "failed to persist running transition");
            return;
        }

        let outcome = worker.execute(&task, cancel).await;

        match outcome {
            TaskOutcome::Succeeded => {
                task.mark_terminal(TaskStatus::Succeeded, None);
                if let Err(e) = store.update_task(&task).await {
                    tracing::error!(task_id = %task.task_id, error = %e, "failed to persist succeeded transition");
                }
                return;
            }
            TaskOutcome::PermanentFailure(msg) => {
                task.mark_terminal(TaskStatus::Failed, Some(msg));
                if let Err(e) = store.update_task(&task).await {
                    tracing::error!(task_id = %task.task_id, error = %e, "failed to persist failed transition");
                }
                return;
            }
            TaskOutcome::Cancelled(msg) => {
                task.mark_terminal(TaskStatus::Cancelled, Some(msg));
                if let Err(e) = store.update_task(&task).await {
                    tracing::error!(task_id = %task.task_id, error = %e, "failed to persist cancelled transition");
                }
                return;
            }
            TaskOutcome::TransientFailure(msg) => {
                if cancel.is_cancelled() {
                    task.mark_terminal(TaskStatus::Cancelled, Some(msg));
                    let _ = store.update_task(&task).await;
                    return;
                }
                if task.attempts > MAX_TASK_RETRIES {
                    task.mark_terminal(TaskStatus::Failed, Some(msg));
                    if let Err(e) = store.update_task(&task).await {
                        tracing::error!(task_id = %task.task_id, error = %e, "failed to persist failed transition");
                    }
                    return;
                }
                tracing::warn!(task_id = %task.task_id, attempts = task.attempts, error = %msg, "transient task failure, retrying");
                tokio::time::sleep(backoff_delay(task.attempts)).await;
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let scaled = RETRY_BASE.saturating_mul(1 << attempt.min(8));
    let capped = scaled.min(RETRY_CAP);
    let jittered_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64);
    Duration::from_millis(jittered_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct ScriptedWorker {
        calls: AtomicU32,
        script: StdMutex<Vec<TaskOutcome>>,
    }

    #[async_trait]
    impl PhaseWorker for ScriptedWorker {
        async fn execute(&self, _task: &Task, _cancel: &CancellationToken) -> TaskOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                TaskOutcome::Succeeded
            } else {
                script.remove(0)
            }
        }
    }

    async fn seeded_store_with_tasks(run_id: RunId, count: usize, kind: TaskKind) -> MetadataStore {
        let store = MetadataStore::open_in_memory().await.unwrap();
        for i in 0..count {
            let task = Task::new(run_id, kind, i as i64, None, serde_json::json!({}));
            store.insert_task(&task).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn runs_every_pending_task_to_a_terminal_state() {
        let run_id = RunId::new();
        let store = Arc::new(seeded_store_with_tasks(run_id, 5, TaskKind::GenerateFpf).await);
        let scheduler = PhaseScheduler::new(store.clone());
        let worker = Arc::new(ScriptedWorker {
            calls: AtomicU32::new(0),
            script: StdMutex::new(Vec::new()),
        });

        let report = scheduler
            .run_phase(run_id, TaskKind::GenerateFpf, 2, CancellationToken::new(), worker)
            .await
            .unwrap();

        assert_eq!(report.total, 5);
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let run_id = RunId::new();
        let store = Arc::new(seeded_store_with_tasks(run_id, 1, TaskKind::SingleEval).await);
        let scheduler = PhaseScheduler::new(store.clone());
        let worker = Arc::new(ScriptedWorker {
            calls: AtomicU32::new(0),
            script: StdMutex::new(vec![
                TaskOutcome::TransientFailure("blip".to_string()),
                TaskOutcome::Succeeded,
            ]),
        });

        let report = scheduler
            .run_phase(run_id, TaskKind::SingleEval, 1, CancellationToken::new(), worker.clone())
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_does_not_retry() {
        let run_id = RunId::new();
        let store = Arc::new(seeded_store_with_tasks(run_id, 1, TaskKind::PairwiseEval).await);
        let scheduler = PhaseScheduler::new(store.clone());
        let worker = Arc::new(ScriptedWorker {
            calls: AtomicU32::new(0),
            script: StdMutex::new(vec![TaskOutcome::PermanentFailure("bad request".to_string())]),
        });

        let report = scheduler
            .run_phase(run_id, TaskKind::PairwiseEval, 1, CancellationToken::new(), worker.clone())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_on_transient_failures_fails_the_task() {
        let run_id = RunId::new();
        let store = Arc::new(seeded_store_with_tasks(run_id, 1, TaskKind::Combine).await);
        let scheduler = PhaseScheduler::new(store.clone());
        let worker = Arc::new(ScriptedWorker {
            calls: AtomicU32::new(0),
            script: StdMutex::new(vec![
                TaskOutcome::TransientFailure("1".to_string()),
                TaskOutcome::TransientFailure("2".to_string()),
                TaskOutcome::TransientFailure("3".to_string()),
            ]),
        });

        let report = scheduler
            .run_phase(run_id, TaskKind::Combine, 1, CancellationToken::new(), worker.clone())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
    }

    struct CancellingWorker;

    #[async_trait]
    impl PhaseWorker for CancellingWorker {
        async fn execute(&self, _task: &Task, cancel: &CancellationToken) -> TaskOutcome {
            if cancel.is_cancelled() {
                return TaskOutcome::Cancelled("cancelled before starting".to_string());
            }
            cancel.cancel();
            tokio::time::sleep(Duration::from_millis(20)).await;
            TaskOutcome::Cancelled("cancelled mid-execution".to_string())
        }
    }

    #[tokio::test]
    async fn cancellation_mid_execution_leaves_no_task_running() {
        let run_id = RunId::new();
        let store = Arc::new(seeded_store_with_tasks(run_id, 4, TaskKind::GenerateFpf).await);
        let scheduler = PhaseScheduler::new(store.clone());
        let cancel = CancellationToken::new();

        let report = scheduler
            .run_phase(run_id, TaskKind::GenerateFpf, 2, cancel, Arc::new(CancellingWorker))
            .await
            .unwrap();

        assert_eq!(report.total, 4);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 0);

        let tasks = store.list_tasks_by_run(&run_id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status.is_terminal()));
    }
}
