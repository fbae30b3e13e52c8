use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{DocumentId, RunId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    GenerateFpf,
    GenerateResearch,
    SingleEval,
    PairwiseEval,
    Combine,
    PostCombineEval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub sort_order: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// The document this task operates on, when the phase is document-scoped
    /// (Generation, single/pairwise/post-combine eval reference artifacts that
    /// trace back to one). `None` for run-wide tasks like Combine.
    pub document_id: Option<DocumentId>,
    /// Phase-specific routing data the scheduler's generic `Task` has no field for:
    /// e.g. `{provider, model, iteration}` for a generation task, or
    /// `{judge_provider, judge_model, dimension, iteration, artifact_id}` for a
    /// single-doc eval task. Opaque to the scheduler; read by the phase's worker.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(run_id: RunId, kind: TaskKind, sort_order: i64, document_id: Option<DocumentId>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::new(),
            run_id,
            kind,
            status: TaskStatus::Pending,
            sort_order,
            attempts: 0,
            last_error: None,
            document_id,
            payload,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.attempts += 1;
        self.started_at.get_or_insert_with(Utc::now);
        self.updated_at = Utc::now();
    }

    pub fn mark_terminal(&mut self, status: TaskStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.last_error = error;
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}
