//! Drives one run through the fixed phase DAG:
//! `Generation -> SingleDocEval -> PairwiseEval -> Combine -> PostCombineEval -> Done`.
//! Each phase enumerates its own tasks idempotently (a restart after a crash
//! finds the prior phase's tasks already on disk and skips re-enumeration),
//! runs them through the `PhaseScheduler`, and interprets the resulting
//! `PhaseReport` against a phase-specific pass/fail threshold before deciding
//! whether to continue to the next phase.

use std::collections::HashMap;
use std::sync::Arc;

use pc_judge::JudgeRunner;
use pc_observability::{emit_event, ObservabilityEvent, RunTimeline};
use pc_scheduler::{PhaseReport, PhaseScheduler, PhaseWorker};
use pc_types::{
    Artifact, EvalMode, GeneratorKind, RunConfig, RunDocument, RunId, RunStatus, Task, TaskKind,
};
use tokio_util::sync::CancellationToken;

use crate::workers::{CombineWorker, GenerationWorker, PairwiseEvalWorker, SingleEvalWorker};
use crate::{CoordinatorError, RunCoordinator};

/// Below this fraction of failed rows, a threshold phase still counts as
/// completed (with partial failures); at or above it, the phase fails the run.
const PARTIAL_FAILURE_THRESHOLD: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Scheduler(#[from] pc_scheduler::SchedulerError),
    #[error(transparent)]
    Store(#[from] pc_store::StoreError),
}

enum PhaseOutcome {
    Completed,
    CompletedWithPartialFailures,
    Failed(String),
}

pub async fn run_pipeline(
    coordinator: Arc<RunCoordinator>,
    run_id: RunId,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let run = coordinator
        .store
        .get_run(&run_id)
        .await?
        .ok_or(CoordinatorError::RunNotFound)?;
    let config = RunConfig::validate(&run.config).map_err(CoordinatorError::from)?;
    let documents = coordinator.store.list_run_documents(&run_id).await?;
    let scheduler = PhaseScheduler::new(coordinator.store.clone());
    let judge_runner = Arc::new(JudgeRunner::new(
        coordinator.judge_client.clone(),
        coordinator.limiter.clone(),
        coordinator.store.clone(),
    ));

    let mut timeline = RunTimeline::default();
    let mut any_partial_failures = false;

    macro_rules! bail_if_cancelled {
        () => {
            if cancel.is_cancelled() {
                return finish(&coordinator, run_id, RunStatus::Cancelled, timeline, None).await;
            }
        };
    }

    bail_if_cancelled!();
    let generation = run_generation(
        &coordinator,
        &scheduler,
        run_id,
        &config,
        &documents,
        cancel.clone(),
    )
    .await?;
    record(&mut timeline, "generation", &generation);
    match generation {
        PhaseOutcome::Failed(reason) => {
            return finish(&coordinator, run_id, RunStatus::Failed, timeline, Some(reason)).await
        }
        PhaseOutcome::CompletedWithPartialFailures => any_partial_failures = true,
        PhaseOutcome::Completed => {}
    }

    bail_if_cancelled!();
    if matches!(config.eval.mode, EvalMode::Single | EvalMode::Both) {
        let artifacts = generation_artifacts(&coordinator, run_id).await?;
        let single_eval = run_single_eval(
            &coordinator,
            &scheduler,
            &judge_runner,
            run_id,
            &config,
            TaskKind::SingleEval,
            &artifacts,
            cancel.clone(),
        )
        .await?;
        record(&mut timeline, "single-doc-eval", &single_eval);
        match single_eval {
            PhaseOutcome::Failed(reason) => {
                return finish(&coordinator, run_id, RunStatus::Failed, timeline, Some(reason)).await
            }
            PhaseOutcome::CompletedWithPartialFailures => any_partial_failures = true,
            PhaseOutcome::Completed => {}
        }
    }

    bail_if_cancelled!();
    if matches!(config.eval.mode, EvalMode::Pairwise | EvalMode::Both) {
        let artifacts = generation_artifacts(&coordinator, run_id).await?;
        let pairwise = run_pairwise_eval(
            &coordinator,
            &scheduler,
            &judge_runner,
            run_id,
            &config,
            &artifacts,
            cancel.clone(),
        )
        .await?;
        record(&mut timeline, "pairwise-eval", &pairwise);
        match pairwise {
            PhaseOutcome::Failed(reason) => {
                return finish(&coordinator, run_id, RunStatus::Failed, timeline, Some(reason)).await
            }
            PhaseOutcome::CompletedWithPartialFailures => any_partial_failures = true,
            PhaseOutcome::Completed => {}
        }
    }

    bail_if_cancelled!();
    if config.combine.enabled {
        let combine = run_combine(
            &coordinator,
            &scheduler,
            run_id,
            &config,
            &documents,
            cancel.clone(),
        )
        .await?;
        record(&mut timeline, "combine", &combine);
        match combine {
            PhaseOutcome::Failed(reason) => {
                return finish(&coordinator, run_id, RunStatus::Failed, timeline, Some(reason)).await
            }
            PhaseOutcome::CompletedWithPartialFailures => any_partial_failures = true,
            PhaseOutcome::Completed => {}
        }

        bail_if_cancelled!();
        if matches!(config.eval.mode, EvalMode::Single | EvalMode::Both) {
            let artifacts = combine_artifacts(&coordinator, run_id).await?;
            let post_combine_eval = run_single_eval(
                &coordinator,
                &scheduler,
                &judge_runner,
                run_id,
                &config,
                TaskKind::PostCombineEval,
                &artifacts,
                cancel.clone(),
            )
            .await?;
            record(&mut timeline, "post-combine-eval", &post_combine_eval);
            match post_combine_eval {
                PhaseOutcome::Failed(reason) => {
                    return finish(&coordinator, run_id, RunStatus::Failed, timeline, Some(reason)).await
                }
                PhaseOutcome::CompletedWithPartialFailures => any_partial_failures = true,
                PhaseOutcome::Completed => {}
            }
        }
    }

    let summary = if any_partial_failures {
        Some("completed with partial failures in one or more phases".to_string())
    } else {
        None
    };
    finish(&coordinator, run_id, RunStatus::Completed, timeline, summary).await
}

fn record(timeline: &mut RunTimeline, phase: &str, outcome: &PhaseOutcome) {
    let status = match outcome {
        PhaseOutcome::Completed => "completed",
        PhaseOutcome::CompletedWithPartialFailures => "completed-with-partial-failures",
        PhaseOutcome::Failed(_) => "failed",
    };
    timeline.push(phase, status, 0, 0);
}

async fn finish(
    coordinator: &RunCoordinator,
    run_id: RunId,
    status: RunStatus,
    timeline: RunTimeline,
    failure_reason: Option<String>,
) -> Result<(), PipelineError> {
    let mut run = coordinator
        .store
        .get_run(&run_id)
        .await?
        .ok_or(CoordinatorError::RunNotFound)?;
    if !run.status.is_terminal() {
        run.transition(status).map_err(CoordinatorError::from)?;
        if let Some(reason) = &failure_reason {
            run.summary = Some(reason.clone());
        }
        coordinator.store.update_run(&run).await?;
    }

    let timeline_path = format!("runs/{run_id}/timeline.json");
    if let Ok(bytes) = serde_json::to_vec_pretty(&timeline) {
        let _ = coordinator.storage.write(&timeline_path, &bytes, "run timeline").await;
    }

    emit_event(
        tracing::Level::INFO,
        &ObservabilityEvent {
            event: "run_finished",
            component: "coordinator",
            run_id: Some(&run_id.to_string()),
            error: failure_reason.as_deref(),
            ..Default::default()
        },
    );
    Ok(())
}

async fn generation_artifacts(coordinator: &RunCoordinator, run_id: RunId) -> Result<Vec<Artifact>, PipelineError> {
    Ok(coordinator
        .store
        .list_artifacts_by_run(&run_id)
        .await?
        .into_iter()
        .filter(|a| a.generator != GeneratorKind::Combine)
        .collect())
}

async fn combine_artifacts(coordinator: &RunCoordinator, run_id: RunId) -> Result<Vec<Artifact>, PipelineError> {
    Ok(coordinator
        .store
        .list_artifacts_by_run(&run_id)
        .await?
        .into_iter()
        .filter(|a| a.generator == GeneratorKind::Combine)
        .collect())
}

fn failed_over_threshold(report: &PhaseReport) -> bool {
    if report.total == 0 {
        return false;
    }
    (report.failed as f64 / report.total as f64) >= PARTIAL_FAILURE_THRESHOLD
}

fn threshold_outcome(report: &PhaseReport, over_threshold_reason: &str) -> PhaseOutcome {
    if failed_over_threshold(report) {
        PhaseOutcome::Failed(over_threshold_reason.to_string())
    } else if report.failed > 0 {
        PhaseOutcome::CompletedWithPartialFailures
    } else {
        PhaseOutcome::Completed
    }
}

async fn run_generation(
    coordinator: &RunCoordinator,
    scheduler: &PhaseScheduler,
    run_id: RunId,
    config: &RunConfig,
    documents: &[RunDocument],
    cancel: CancellationToken,
) -> Result<PhaseOutcome, PipelineError> {
    ensure_generation_tasks(coordinator, run_id, config, documents).await?;

    let concurrency = config.concurrency_for("generation");
    let mut combined = PhaseReport::default();
    for kind in [TaskKind::GenerateFpf, TaskKind::GenerateResearch] {
        let worker: Arc<dyn PhaseWorker> = Arc::new(GenerationWorker {
            store: coordinator.store.clone(),
            storage: coordinator.storage.clone(),
            vault: coordinator.vault.clone(),
            limiter: coordinator.limiter.clone(),
            client: coordinator.generator_client.clone(),
            tenant_id: run_tenant_id(coordinator, run_id).await?,
            run_id,
        });
        let report = scheduler
            .run_phase(run_id, kind, concurrency, cancel.clone(), worker)
            .await?;
        combined.total += report.total;
        combined.succeeded += report.succeeded;
        combined.failed += report.failed;
        combined.cancelled += report.cancelled;
    }

    let artifacts = generation_artifacts(coordinator, run_id).await?;
    let any_document_produced_an_artifact = documents
        .iter()
        .any(|doc| artifacts.iter().any(|a| a.document_id == Some(doc.document_id)));

    if !any_document_produced_an_artifact {
        return Ok(PhaseOutcome::Failed(
            "generation produced zero artifacts across every attached document".to_string(),
        ));
    }
    if combined.failed > 0 {
        Ok(PhaseOutcome::CompletedWithPartialFailures)
    } else {
        Ok(PhaseOutcome::Completed)
    }
}

async fn run_tenant_id(coordinator: &RunCoordinator, run_id: RunId) -> Result<pc_types::TenantId, PipelineError> {
    let run = coordinator
        .store
        .get_run(&run_id)
        .await?
        .ok_or(CoordinatorError::RunNotFound)?;
    Ok(run.tenant_id)
}

async fn ensure_generation_tasks(
    coordinator: &RunCoordinator,
    run_id: RunId,
    config: &RunConfig,
    documents: &[RunDocument],
) -> Result<(), PipelineError> {
    let existing = coordinator.store.list_tasks_by_run(&run_id).await?;
    if existing
        .iter()
        .any(|t| matches!(t.kind, TaskKind::GenerateFpf | TaskKind::GenerateResearch))
    {
        return Ok(());
    }

    let mut sort_order = 0i64;
    for document in documents {
        for spec in &config.generators {
            let kind = match spec.kind.as_str() {
                "fpf" => TaskKind::GenerateFpf,
                "research" => TaskKind::GenerateResearch,
                other => {
                    return Err(CoordinatorError::Validation(format!("unknown generator kind: {other}")).into())
                }
            };
            for iteration in 0..spec.iterations {
                let payload = serde_json::json!({
                    "provider": spec.provider,
                    "model": spec.model,
                    "iteration": iteration,
                });
                let task = Task::new(run_id, kind, sort_order, Some(document.document_id), payload);
                sort_order += 1;
                coordinator.store.insert_task(&task).await?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_single_eval(
    coordinator: &RunCoordinator,
    scheduler: &PhaseScheduler,
    judge_runner: &Arc<JudgeRunner>,
    run_id: RunId,
    config: &RunConfig,
    task_kind: TaskKind,
    artifacts: &[Artifact],
    cancel: CancellationToken,
) -> Result<PhaseOutcome, PipelineError> {
    ensure_single_eval_tasks(coordinator, run_id, config, task_kind, artifacts).await?;

    let phase_name = if task_kind == TaskKind::PostCombineEval {
        "post_combine_eval"
    } else {
        "single_doc_eval"
    };
    let concurrency = config.concurrency_for(phase_name);
    let worker: Arc<dyn PhaseWorker> = Arc::new(SingleEvalWorker {
        judge_runner: judge_runner.clone(),
        store: coordinator.store.clone(),
        storage: coordinator.storage.clone(),
        run_id,
    });
    let report = scheduler.run_phase(run_id, task_kind, concurrency, cancel, worker).await?;
    Ok(threshold_outcome(
        &report,
        "too many single-document evaluation rows failed",
    ))
}

async fn ensure_single_eval_tasks(
    coordinator: &RunCoordinator,
    run_id: RunId,
    config: &RunConfig,
    task_kind: TaskKind,
    artifacts: &[Artifact],
) -> Result<(), PipelineError> {
    let existing = coordinator.store.list_tasks_by_run(&run_id).await?;
    if existing.iter().any(|t| t.kind == task_kind) {
        return Ok(());
    }

    let mut sort_order = 0i64;
    for artifact in artifacts {
        for judge in &config.eval.judges {
            for dimension in pc_judge::prompts::DIMENSIONS {
                for iteration in 0..config.eval.iterations {
                    let payload = serde_json::json!({
                        "artifact_id": artifact.artifact_id.to_string(),
                        "judge_provider": judge.provider,
                        "judge_model": judge.model,
                        "dimension": dimension,
                        "iteration": iteration,
                    });
                    let task = Task::new(run_id, task_kind, sort_order, artifact.document_id, payload);
                    sort_order += 1;
                    coordinator.store.insert_task(&task).await?;
                }
            }
        }
    }
    Ok(())
}

async fn run_pairwise_eval(
    coordinator: &RunCoordinator,
    scheduler: &PhaseScheduler,
    judge_runner: &Arc<JudgeRunner>,
    run_id: RunId,
    config: &RunConfig,
    artifacts: &[Artifact],
    cancel: CancellationToken,
) -> Result<PhaseOutcome, PipelineError> {
    ensure_pairwise_tasks(coordinator, run_id, config, artifacts).await?;

    let concurrency = config.concurrency_for("pairwise_eval");
    let worker: Arc<dyn PhaseWorker> = Arc::new(PairwiseEvalWorker {
        judge_runner: judge_runner.clone(),
        store: coordinator.store.clone(),
        storage: coordinator.storage.clone(),
        run_id,
    });
    let report = scheduler
        .run_phase(run_id, TaskKind::PairwiseEval, concurrency, cancel, worker)
        .await?;
    Ok(threshold_outcome(&report, "too many scheduled pairs failed"))
}

async fn ensure_pairwise_tasks(
    coordinator: &RunCoordinator,
    run_id: RunId,
    config: &RunConfig,
    artifacts: &[Artifact],
) -> Result<(), PipelineError> {
    let existing = coordinator.store.list_tasks_by_run(&run_id).await?;
    if existing.iter().any(|t| t.kind == TaskKind::PairwiseEval) {
        return Ok(());
    }

    let ratings: HashMap<_, _> = coordinator
        .store
        .list_elo_ratings_ranked(&run_id)
        .await?
        .into_iter()
        .map(|r| (r.artifact_id, r.rating))
        .collect();

    let mut document_ids: Vec<_> = artifacts.iter().filter_map(|a| a.document_id).collect();
    document_ids.sort();
    document_ids.dedup();

    let mut sort_order = 0i64;
    for document_id in document_ids {
        let scoped: Vec<Artifact> = artifacts
            .iter()
            .filter(|a| a.document_id == Some(document_id))
            .cloned()
            .collect();
        let pairs = pc_judge::schedule_pairs(config.eval.tournament, &scoped, &ratings, config.eval.pairwise_top_n);
        for (artifact_a, artifact_b) in pairs {
            for judge in &config.eval.judges {
                for iteration in 0..config.eval.iterations {
                    let payload = serde_json::json!({
                        "artifact_a": artifact_a.to_string(),
                        "artifact_b": artifact_b.to_string(),
                        "judge_provider": judge.provider,
                        "judge_model": judge.model,
                        "iteration": iteration,
                    });
                    let task = Task::new(run_id, TaskKind::PairwiseEval, sort_order, Some(document_id), payload);
                    sort_order += 1;
                    coordinator.store.insert_task(&task).await?;
                }
            }
        }
    }
    Ok(())
}

async fn run_combine(
    coordinator: &RunCoordinator,
    scheduler: &PhaseScheduler,
    run_id: RunId,
    config: &RunConfig,
    documents: &[RunDocument],
    cancel: CancellationToken,
) -> Result<PhaseOutcome, PipelineError> {
    ensure_combine_tasks(coordinator, run_id, config, documents).await?;

    let concurrency = config.concurrency_for("combine");
    let worker: Arc<dyn PhaseWorker> = Arc::new(CombineWorker {
        store: coordinator.store.clone(),
        storage: coordinator.storage.clone(),
        run_id,
    });
    let report = scheduler
        .run_phase(run_id, TaskKind::Combine, concurrency, cancel, worker)
        .await?;
    if report.failed > 0 {
        Ok(PhaseOutcome::Failed("a combine step failed".to_string()))
    } else {
        Ok(PhaseOutcome::Completed)
    }
}

async fn ensure_combine_tasks(
    coordinator: &RunCoordinator,
    run_id: RunId,
    config: &RunConfig,
    documents: &[RunDocument],
) -> Result<(), PipelineError> {
    let existing = coordinator.store.list_tasks_by_run(&run_id).await?;
    if existing.iter().any(|t| t.kind == TaskKind::Combine) {
        return Ok(());
    }

    let artifacts = generation_artifacts(coordinator, run_id).await?;
    let mut sort_order = 0i64;
    for document in documents {
        let has_source_artifact = artifacts.iter().any(|a| a.document_id == Some(document.document_id));
        if !has_source_artifact {
            continue;
        }
        for model in &config.combine.models {
            let payload = serde_json::json!({ "model": model });
            let task = Task::new(run_id, TaskKind::Combine, sort_order, Some(document.document_id), payload);
            sort_order += 1;
            coordinator.store.insert_task(&task).await?;
        }
    }
    Ok(())
}
