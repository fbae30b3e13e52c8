use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TypeError;
use crate::ids::{RunId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the run state DAG.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Running) => true,
            (Running, Completed | Failed) => true,
            (s, Cancelled) if !s.is_terminal() => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub project_id: String,
    pub title: Option<String>,
    pub status: RunStatus,
    pub priority: u8,
    /// Frozen at creation; validated once, then treated as an opaque blob.
    pub config: Value,
    pub tags: Vec<String>,
    pub requested_by: String,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_LEN: usize = 32;

impl Run {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: TenantId,
        project_id: String,
        title: Option<String>,
        config: Value,
        tags: Vec<String>,
        priority: u8,
        requested_by: String,
    ) -> Result<Self, TypeError> {
        let priority = validate_priority(priority)?;
        let tags = normalize_tags(tags)?;
        let now = Utc::now();
        Ok(Self {
            run_id: RunId::new(),
            tenant_id,
            project_id,
            title,
            status: RunStatus::Pending,
            priority,
            config,
            tags,
            requested_by,
            summary: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    /// Applies a validated status transition, stamping the relevant timestamp.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), TypeError> {
        if !self.status.can_transition_to(next) {
            return Err(TypeError::InvalidStatusTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }
        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at.get_or_insert(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

pub fn validate_priority(priority: u8) -> Result<u8, TypeError> {
    if (1..=9).contains(&priority) {
        Ok(priority)
    } else {
        Err(TypeError::Validation(format!(
            "priority must be in 1..=9, got {priority}"
        )))
    }
}

pub fn normalize_tags(tags: Vec<String>) -> Result<Vec<String>, TypeError> {
    if tags.len() > MAX_TAGS {
        return Err(TypeError::Validation(format!(
            "at most {MAX_TAGS} tags allowed, got {}",
            tags.len()
        )));
    }
    tags.into_iter()
        .map(|t| {
            let lowered = t.trim().to_lowercase();
            if lowered.is_empty() || lowered.len() > MAX_TAG_LEN {
                Err(TypeError::Validation(format!(
                    "tag {:?} must be 1..={MAX_TAG_LEN} characters",
                    t
                )))
            } else {
                Ok(lowered)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> Run {
        Run::new(
            TenantId::new("tenant-a").unwrap(),
            "proj-1".to_string(),
            None,
            serde_json::json!({}),
            vec!["smoke".to_string()],
            5,
            "user-1".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn happy_path_transitions_follow_the_dag() {
        let mut run = sample_run();
        run.transition(RunStatus::Queued).unwrap();
        run.transition(RunStatus::Running).unwrap();
        assert!(run.started_at.is_some());
        run.transition(RunStatus::Completed).unwrap();
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn transition_outside_dag_is_rejected_and_state_is_unchanged() {
        let mut run = sample_run();
        let before = run.status;
        let err = run.transition(RunStatus::Completed).unwrap_err();
        assert!(matches!(err, TypeError::InvalidStatusTransition { .. }));
        assert_eq!(run.status, before);
    }

    #[test]
    fn terminal_states_are_sinks() {
        let mut run = sample_run();
        run.transition(RunStatus::Queued).unwrap();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Cancelled).unwrap();
        assert!(run.transition(RunStatus::Running).is_err());
    }

    #[test]
    fn tag_limits_are_enforced() {
        let too_many = vec!["t".to_string(); MAX_TAGS + 1];
        assert!(normalize_tags(too_many).is_err());
        let too_long = vec!["x".repeat(MAX_TAG_LEN + 1)];
        assert!(normalize_tags(too_long).is_err());
        assert_eq!(normalize_tags(vec!["MiXED".into()]).unwrap(), vec!["mixed"]);
    }
}
