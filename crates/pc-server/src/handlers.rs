use axum::extract::{Extension, Path, Query, State};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pc_coordinator::{DocumentSpec, RunUpdate};
use pc_types::{DocumentId, DocumentSource, RunId, RunStatus, TaskKind, TaskStatus};
use pc_wire::{
    AttachDocumentSpec, BatchAttachDocumentsRequest, CreateRunRequest, EvaluateResultsResponse,
    EvaluateStatusResponse, HealthResponse, ListRunsQuery, RankedArtifact, RateLimitBucketStatus,
    RateLimitStatusResponse, RunDocumentResponse, RunListResponse, RunResponse, UpdateRunRequest,
};

use crate::auth::Principal;
use crate::error::ApiError;
use crate::AppState;

fn run_to_response(run: pc_types::Run) -> RunResponse {
    RunResponse {
        run_id: run.run_id.to_string(),
        tenant_id: run.tenant_id.to_string(),
        project_id: run.project_id,
        title: run.title,
        status: format!("{:?}", run.status).to_lowercase(),
        priority: run.priority,
        config: run.config,
        tags: run.tags,
        summary: run.summary,
        created_at: run.created_at,
        updated_at: run.updated_at,
        started_at: run.started_at,
        completed_at: run.completed_at,
    }
}

fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Validation(format!("malformed run id: {raw}")))
}

fn parse_document_id(raw: &str) -> Result<DocumentId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Validation(format!("malformed document id: {raw}")))
}

fn parse_status(raw: &str) -> Result<RunStatus, ApiError> {
    match raw {
        "pending" => Ok(RunStatus::Pending),
        "queued" => Ok(RunStatus::Queued),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(ApiError::Validation(format!("unknown status: {other}"))),
    }
}

fn spec_from_wire(spec: AttachDocumentSpec) -> Result<DocumentSpec, ApiError> {
    match spec {
        AttachDocumentSpec::Stored {
            repository,
            git_ref,
            path,
            display_name,
        } => Ok(DocumentSpec {
            source: DocumentSource::Stored {
                repository,
                git_ref,
                path,
            },
            display_name,
        }),
        AttachDocumentSpec::Inline {
            content_base64,
            filename,
            mime,
            display_name,
        } => {
            let content = BASE64
                .decode(content_base64)
                .map_err(|e| ApiError::Validation(format!("invalid base64 content: {e}")))?;
            Ok(DocumentSpec {
                source: DocumentSource::Inline {
                    content,
                    filename,
                    mime,
                },
                display_name,
            })
        }
    }
}

pub async fn create_run(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateRunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let tags = body.tags;
    let priority = body.priority.unwrap_or(5);
    let run_id = state
        .coordinator
        .create_run(
            principal.tenant_id.clone(),
            body.project_id,
            body.title,
            body.config,
            tags,
            priority,
            "api".to_string(),
        )
        .await?;
    let run = state.coordinator.get_run(run_id, &principal.tenant_id).await?;
    Ok(Json(run_to_response(run)))
}

pub async fn list_runs(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<RunListResponse>, ApiError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let limit = query.limit.unwrap_or(50).min(500) as i64;
    let offset = query.offset.unwrap_or(0) as i64;
    let runs = state
        .coordinator
        .list_runs(&principal.tenant_id, status, limit, offset)
        .await?;
    let total = runs.len() as u64;
    Ok(Json(RunListResponse {
        runs: runs.into_iter().map(run_to_response).collect(),
        total,
    }))
}

pub async fn get_run(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let run = state.coordinator.get_run(run_id, &principal.tenant_id).await?;
    Ok(Json(run_to_response(run)))
}

pub async fn update_run(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(run_id): Path<String>,
    Json(body): Json<UpdateRunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let run = state
        .coordinator
        .update_run(
            run_id,
            &principal.tenant_id,
            RunUpdate {
                title: body.title,
                priority: body.priority,
                tags: body.tags,
                summary: body.summary,
            },
        )
        .await?;
    Ok(Json(run_to_response(run)))
}

pub async fn delete_run(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    state.coordinator.delete_run(run_id, &principal.tenant_id).await?;
    Ok(Json(serde_json::json!({ "run_id": run_id.to_string(), "status": "cancelled" })))
}

pub async fn start_run(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    state.coordinator.clone().start(run_id, &principal.tenant_id).await?;
    Ok(Json(serde_json::json!({ "run_id": run_id.to_string(), "status": "queued" })))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    match state.coordinator.cancel(run_id, &principal.tenant_id).await {
        Ok(()) => {}
        // cancel() on a terminal run is a documented no-op, not an error.
        Err(pc_coordinator::CoordinatorError::RunAlreadyTerminal) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(Json(serde_json::json!({ "run_id": run_id.to_string() })))
}

pub async fn attach_document(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(run_id): Path<String>,
    Json(body): Json<pc_wire::AttachDocumentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let spec = spec_from_wire(body.spec)?;
    state
        .coordinator
        .attach_documents(run_id, &principal.tenant_id, vec![spec])
        .await?;
    Ok(Json(serde_json::json!({ "run_id": run_id.to_string() })))
}

pub async fn attach_documents_batch(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(run_id): Path<String>,
    Json(body): Json<BatchAttachDocumentsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let specs = body.0;
    if specs.len() > pc_wire::MAX_BATCH_DOCUMENTS {
        return Err(ApiError::Validation(format!(
            "at most {} documents per batch",
            pc_wire::MAX_BATCH_DOCUMENTS
        )));
    }
    let specs = specs
        .into_iter()
        .map(spec_from_wire)
        .collect::<Result<Vec<_>, _>>()?;
    let count = specs.len();
    state
        .coordinator
        .attach_documents(run_id, &principal.tenant_id, specs)
        .await?;
    Ok(Json(serde_json::json!({ "run_id": run_id.to_string(), "attached": count })))
}

pub async fn list_documents(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<RunDocumentResponse>>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let store = state.coordinator.store();
    let run_documents = state
        .coordinator
        .list_documents(run_id, &principal.tenant_id)
        .await?;
    let mut out = Vec::with_capacity(run_documents.len());
    for rd in run_documents {
        let display_name = store
            .get_document(&rd.document_id)
            .await?
            .map(|d| d.display_name)
            .unwrap_or_default();
        out.push(RunDocumentResponse {
            document_id: rd.document_id.to_string(),
            display_name,
            status: format!("{:?}", rd.status).to_lowercase(),
            sort_order: rd.sort_order,
            error_message: rd.error_message,
        });
    }
    Ok(Json(out))
}

pub async fn detach_document(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((run_id, document_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let document_id = parse_document_id(&document_id)?;
    state
        .coordinator
        .detach_document(run_id, &principal.tenant_id, document_id)
        .await?;
    Ok(Json(serde_json::json!({ "run_id": run_id.to_string(), "document_id": document_id.to_string() })))
}

fn phase_for_tasks(run_status: RunStatus, tasks: &[pc_types::Task]) -> String {
    let is_generation = |k: TaskKind| matches!(k, TaskKind::GenerateFpf | TaskKind::GenerateResearch);
    let phases: [(&str, &dyn Fn(TaskKind) -> bool); 5] = [
        ("generation", &is_generation),
        ("single_doc_eval", &|k| k == TaskKind::SingleEval),
        ("pairwise_eval", &|k| k == TaskKind::PairwiseEval),
        ("combine", &|k| k == TaskKind::Combine),
        ("post_combine_eval", &|k| k == TaskKind::PostCombineEval),
    ];
    for (name, matches_kind) in phases {
        let in_phase: Vec<_> = tasks.iter().filter(|t| matches_kind(t.kind)).collect();
        if in_phase.is_empty() {
            continue;
        }
        if in_phase.iter().any(|t| !t.status.is_terminal()) {
            return name.to_string();
        }
    }
    format!("{:?}", run_status).to_lowercase()
}

pub async fn evaluate_status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(run_id): Path<String>,
) -> Result<Json<EvaluateStatusResponse>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let run = state.coordinator.get_run(run_id, &principal.tenant_id).await?;
    let store = state.coordinator.store();
    let tasks = store.list_tasks_by_run(&run_id).await?;

    let is_single_doc = |k: TaskKind| matches!(k, TaskKind::SingleEval | TaskKind::PostCombineEval);
    let single_doc_rows_total = tasks.iter().filter(|t| is_single_doc(t.kind)).count() as u64;
    let single_doc_rows_completed = tasks
        .iter()
        .filter(|t| is_single_doc(t.kind) && t.status == TaskStatus::Succeeded)
        .count() as u64;
    let pairwise_results_total = tasks.iter().filter(|t| t.kind == TaskKind::PairwiseEval).count() as u64;
    let pairwise_results_completed = tasks
        .iter()
        .filter(|t| t.kind == TaskKind::PairwiseEval && t.status == TaskStatus::Succeeded)
        .count() as u64;

    Ok(Json(EvaluateStatusResponse {
        run_id: run_id.to_string(),
        phase: phase_for_tasks(run.status, &tasks),
        single_doc_rows_completed,
        single_doc_rows_total,
        pairwise_results_completed,
        pairwise_results_total,
    }))
}

#[derive(Debug, serde::Deserialize, Default)]
pub struct EvaluateResultsQuery {
    pub limit: Option<u32>,
    pub sort_by: Option<String>,
}

pub async fn evaluate_results(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(run_id): Path<String>,
    Query(query): Query<EvaluateResultsQuery>,
) -> Result<Json<EvaluateResultsResponse>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    state.coordinator.get_run(run_id, &principal.tenant_id).await?;
    let store = state.coordinator.store();
    let ratings = store.list_elo_ratings_ranked(&run_id).await?;
    let artifacts = store.list_artifacts_by_run(&run_id).await?;
    let rows = store.list_evaluation_rows_by_run(&run_id).await?;

    let mut rankings: Vec<RankedArtifact> = ratings
        .into_iter()
        .filter_map(|rating| {
            let artifact = artifacts.iter().find(|a| a.artifact_id == rating.artifact_id)?;
            let scores: Vec<u8> = rows
                .iter()
                .filter(|r| r.artifact_id == rating.artifact_id && !r.failed_parse)
                .filter_map(|r| r.score)
                .collect();
            let mean_single_doc_score = if scores.is_empty() {
                None
            } else {
                Some(scores.iter().map(|s| *s as f64).sum::<f64>() / scores.len() as f64)
            };
            Some(RankedArtifact {
                artifact_id: rating.artifact_id.to_string(),
                document_id: artifact.document_id.map(|d| d.to_string()),
                model_id: artifact.model_id.clone(),
                elo_rating: rating.rating,
                games_played: rating.games_played,
                mean_single_doc_score,
            })
        })
        .collect();

    if query.sort_by.as_deref() == Some("mean_score") {
        rankings.sort_by(|a, b| {
            b.mean_single_doc_score
                .unwrap_or(0.0)
                .partial_cmp(&a.mean_single_doc_score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    if let Some(limit) = query.limit {
        rankings.truncate(limit as usize);
    }

    Ok(Json(EvaluateResultsResponse {
        run_id: run_id.to_string(),
        rankings,
    }))
}

pub async fn rate_limit_status(State(state): State<AppState>) -> Json<RateLimitStatusResponse> {
    let buckets = state
        .coordinator
        .limiter()
        .status()
        .await
        .into_iter()
        .map(|((provider, model), bucket)| RateLimitBucketStatus {
            provider,
            model,
            rpm_limit: bucket.rpm_limit,
            rpm_remaining: bucket.rpm_remaining,
            tpm_limit: bucket.tpm_limit,
            tpm_remaining: bucket.tpm_remaining,
            window_reset_at: bucket.window_reset_at,
        })
        .collect();
    Json(RateLimitStatusResponse { buckets })
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_string() })
}
