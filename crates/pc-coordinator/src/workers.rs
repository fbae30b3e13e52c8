//! `PhaseWorker` implementations: one per `TaskKind`, each reading its
//! routing data out of `Task::payload` and writing results through the store
//! and storage provider it's handed at construction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pc_judge::JudgeRunner;
use pc_providers::{GeneratorClient, GeneratorRequest, ProviderError};
use pc_ratelimit::RateLimiter;
use pc_scheduler::{PhaseWorker, TaskOutcome};
use pc_storage::StorageProvider;
use pc_store::MetadataStore;
use pc_types::{Artifact, ArtifactId, DocumentId, GeneratorKind, RunId, Task, TaskKind, TenantId};
use pc_vault::KeyVault;
use tokio_util::sync::CancellationToken;

const RATE_LIMIT_TIMEOUT: Duration = Duration::from_secs(30);

fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4).max(1) as u64
}

async fn find_artifact(store: &MetadataStore, run_id: RunId, artifact_id: ArtifactId) -> Option<Artifact> {
    store
        .list_artifacts_by_run(&run_id)
        .await
        .ok()?
        .into_iter()
        .find(|a| a.artifact_id == artifact_id)
}

async fn read_artifact_content(storage: &dyn StorageProvider, artifact: &Artifact) -> Option<String> {
    let bytes = storage.read(&artifact.storage_location).await.ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

pub struct GenerationWorker {
    pub store: Arc<MetadataStore>,
    pub storage: Arc<dyn StorageProvider>,
    pub vault: Arc<KeyVault>,
    pub limiter: Arc<RateLimiter>,
    pub client: Arc<dyn GeneratorClient>,
    pub tenant_id: TenantId,
    pub run_id: RunId,
}

#[async_trait]
impl PhaseWorker for GenerationWorker {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> TaskOutcome {
        if cancel.is_cancelled() {
            return TaskOutcome::Cancelled("cancelled before generation started".to_string());
        }
        let Some(document_id) = task.document_id else {
            return TaskOutcome::PermanentFailure("generation task has no document_id".to_string());
        };
        let (provider, model, iteration) = match parse_generation_payload(&task.payload) {
            Ok(v) => v,
            Err(e) => return TaskOutcome::PermanentFailure(e),
        };
        let generator = match task.kind {
            TaskKind::GenerateFpf => GeneratorKind::Fpf,
            TaskKind::GenerateResearch => GeneratorKind::Research,
            _ => return TaskOutcome::PermanentFailure("unexpected task kind for generation worker".to_string()),
        };

        let document = match self.store.get_document(&document_id).await {
            Ok(Some(d)) => d,
            Ok(None) => return TaskOutcome::PermanentFailure("document not found".to_string()),
            Err(e) => return TaskOutcome::TransientFailure(e.to_string()),
        };
        let path = match &document.source {
            pc_types::DocumentSource::Inline { .. } => format!("documents/{}", document.document_id),
            pc_types::DocumentSource::Stored { path, .. } => path.clone(),
        };
        let content = match self.storage.read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => return TaskOutcome::TransientFailure(e.to_string()),
        };

        let credentials = match self.vault.materialize(self.tenant_id.as_str()).await {
            Ok(c) => c,
            Err(e) => return TaskOutcome::PermanentFailure(e.to_string()),
        };

        let config = serde_json::json!({ "iteration": iteration });
        let request = GeneratorRequest {
            prompt: &content,
            config: &config,
        };
        let permit = match self
            .limiter
            .acquire(&provider, &model, estimate_tokens(&content), RATE_LIMIT_TIMEOUT)
            .await
        {
            Ok(p) => p,
            Err(e) => return TaskOutcome::TransientFailure(e.to_string()),
        };
        if cancel.is_cancelled() {
            self.limiter.release(permit, None, None).await;
            return TaskOutcome::Cancelled("cancelled before provider call".to_string());
        }

        let endpoint = format!("https://{provider}/generate");
        let outcome = match self.client.generate(&endpoint, &credentials, &request).await {
            Ok(response) => {
                self.limiter
                    .release(permit, Some(response.token_count), Some(&response.response_headers))
                    .await;
                self.persist_artifact(document_id, generator, &model, iteration, response).await
            }
            Err(ProviderError::ClientError { status, body }) => {
                self.limiter.release(permit, None, None).await;
                TaskOutcome::PermanentFailure(format!("{status}: {body}"))
            }
            Err(e) => {
                self.limiter.release(permit, None, None).await;
                TaskOutcome::TransientFailure(e.to_string())
            }
        };
        outcome
    }
}

impl GenerationWorker {
    async fn persist_artifact(
        &self,
        document_id: DocumentId,
        generator: GeneratorKind,
        model: &str,
        iteration: u32,
        response: pc_providers::GeneratorResponse,
    ) -> TaskOutcome {
        let content_hash = pc_storage::sha256_hex(&response.artifact_bytes);
        let mut artifact = Artifact::new(
            self.run_id,
            Some(document_id),
            generator,
            model.to_string(),
            String::new(),
            content_hash,
            response.cost_usd,
            response.token_count,
            response.duration_ms,
            serde_json::json!({ "iteration": iteration, "source_refs": response.source_refs }),
        );
        artifact.storage_location = format!("runs/{}/artifacts/{}.bin", self.run_id, artifact.artifact_id);

        if let Err(e) = self
            .storage
            .write(&artifact.storage_location, &response.artifact_bytes, "generation artifact")
            .await
        {
            return TaskOutcome::TransientFailure(e.to_string());
        }

        match self.store.insert_artifact(&artifact).await {
            Ok(()) => TaskOutcome::Succeeded,
            Err(e) => TaskOutcome::TransientFailure(e.to_string()),
        }
    }
}

fn parse_generation_payload(payload: &serde_json::Value) -> Result<(String, String, u32), String> {
    let provider = payload
        .get("provider")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "payload missing provider".to_string())?;
    let model = payload
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "payload missing model".to_string())?;
    let iteration = payload.get("iteration").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    Ok((provider.to_string(), model.to_string(), iteration))
}

/// Grades one artifact on one dimension for one judge. Shared between the
/// `SingleEval` and `PostCombineEval` kinds: the judge call is identical, only
/// which artifacts are enumerated upstream differs.
pub struct SingleEvalWorker {
    pub judge_runner: Arc<JudgeRunner>,
    pub store: Arc<MetadataStore>,
    pub storage: Arc<dyn StorageProvider>,
    pub run_id: RunId,
}

#[async_trait]
impl PhaseWorker for SingleEvalWorker {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> TaskOutcome {
        if cancel.is_cancelled() {
            return TaskOutcome::Cancelled("cancelled before single-doc eval started".to_string());
        }
        let payload = &task.payload;
        let (artifact_id, judge_provider, judge_model, dimension, iteration) =
            match parse_single_eval_payload(payload) {
                Ok(v) => v,
                Err(e) => return TaskOutcome::PermanentFailure(e),
            };
        let rubric_override = payload.get("rubric").and_then(|v| v.as_str());

        let Some(artifact) = find_artifact(&self.store, self.run_id, artifact_id).await else {
            return TaskOutcome::PermanentFailure("artifact not found".to_string());
        };
        let Some(content) = read_artifact_content(self.storage.as_ref(), &artifact).await else {
            return TaskOutcome::TransientFailure("could not read artifact content".to_string());
        };
        if cancel.is_cancelled() {
            return TaskOutcome::Cancelled("cancelled before judge call".to_string());
        }

        match self
            .judge_runner
            .evaluate_single(
                self.run_id,
                &artifact,
                &content,
                &judge_provider,
                &judge_model,
                &dimension,
                rubric_override,
                iteration,
            )
            .await
        {
            Ok(_row) => TaskOutcome::Succeeded,
            Err(pc_judge::JudgeError::RateLimit(msg)) => TaskOutcome::TransientFailure(msg),
            Err(e) => TaskOutcome::TransientFailure(e.to_string()),
        }
    }
}

fn parse_single_eval_payload(
    payload: &serde_json::Value,
) -> Result<(ArtifactId, String, String, String, u32), String> {
    let artifact_id: ArtifactId = payload
        .get("artifact_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "payload missing artifact_id".to_string())?
        .parse()
        .map_err(|_| "payload has malformed artifact_id".to_string())?;
    let judge_provider = payload
        .get("judge_provider")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "payload missing judge_provider".to_string())?
        .to_string();
    let judge_model = payload
        .get("judge_model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "payload missing judge_model".to_string())?
        .to_string();
    let dimension = payload
        .get("dimension")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "payload missing dimension".to_string())?
        .to_string();
    let iteration = payload.get("iteration").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    Ok((artifact_id, judge_provider, judge_model, dimension, iteration))
}

pub struct PairwiseEvalWorker {
    pub judge_runner: Arc<JudgeRunner>,
    pub store: Arc<MetadataStore>,
    pub storage: Arc<dyn StorageProvider>,
    pub run_id: RunId,
}

#[async_trait]
impl PhaseWorker for PairwiseEvalWorker {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> TaskOutcome {
        if cancel.is_cancelled() {
            return TaskOutcome::Cancelled("cancelled before pairwise eval started".to_string());
        }
        let payload = &task.payload;
        let parse = |key: &str| -> Result<ArtifactId, String> {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .ok_or_else(|| format!("payload missing {key}"))?
                .parse()
                .map_err(|_| format!("payload has malformed {key}"))
        };
        let (artifact_a_id, artifact_b_id) = match (parse("artifact_a"), parse("artifact_b")) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => return TaskOutcome::PermanentFailure(e),
        };
        let judge_provider = match payload.get("judge_provider").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => return TaskOutcome::PermanentFailure("payload missing judge_provider".to_string()),
        };
        let judge_model = match payload.get("judge_model").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => return TaskOutcome::PermanentFailure("payload missing judge_model".to_string()),
        };
        let iteration = payload.get("iteration").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

        let (Some(artifact_a), Some(artifact_b)) = (
            find_artifact(&self.store, self.run_id, artifact_a_id).await,
            find_artifact(&self.store, self.run_id, artifact_b_id).await,
        ) else {
            return TaskOutcome::PermanentFailure("artifact not found".to_string());
        };
        let (Some(content_a), Some(content_b)) = (
            read_artifact_content(self.storage.as_ref(), &artifact_a).await,
            read_artifact_content(self.storage.as_ref(), &artifact_b).await,
        ) else {
            return TaskOutcome::TransientFailure("could not read artifact content".to_string());
        };
        if cancel.is_cancelled() {
            return TaskOutcome::Cancelled("cancelled before judge call".to_string());
        }

        match self
            .judge_runner
            .evaluate_pairwise(
                self.run_id,
                &artifact_a,
                &artifact_b,
                &content_a,
                &content_b,
                &judge_provider,
                &judge_model,
                iteration,
            )
            .await
        {
            Ok(_result) => TaskOutcome::Succeeded,
            Err(pc_judge::JudgeError::RateLimit(msg)) => TaskOutcome::TransientFailure(msg),
            Err(e) => TaskOutcome::TransientFailure(e.to_string()),
        }
    }
}

/// Combines every succeeded generation artifact for a document into one
/// artifact per configured combine model. No external call: concatenation is
/// deterministic local work, not a provider-owned concern.
pub struct CombineWorker {
    pub store: Arc<MetadataStore>,
    pub storage: Arc<dyn StorageProvider>,
    pub run_id: RunId,
}

#[async_trait]
impl PhaseWorker for CombineWorker {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> TaskOutcome {
        if cancel.is_cancelled() {
            return TaskOutcome::Cancelled("cancelled before combine started".to_string());
        }
        let Some(model) = task.payload.get("model").and_then(|v| v.as_str()) else {
            return TaskOutcome::PermanentFailure("payload missing model".to_string());
        };

        let artifacts = match self.store.list_artifacts_by_run(&self.run_id).await {
            Ok(a) => a,
            Err(e) => return TaskOutcome::TransientFailure(e.to_string()),
        };
        let sources: Vec<&Artifact> = artifacts
            .iter()
            .filter(|a| a.document_id == task.document_id && a.generator != GeneratorKind::Combine)
            .collect();
        if sources.is_empty() {
            return TaskOutcome::PermanentFailure("no source artifacts to combine".to_string());
        }

        let mut combined = String::new();
        let mut total_cost = 0.0;
        let mut total_tokens = 0u64;
        for source in &sources {
            let Some(content) = read_artifact_content(self.storage.as_ref(), source).await else {
                return TaskOutcome::TransientFailure("could not read source artifact".to_string());
            };
            combined.push_str(&content);
            combined.push_str("\n\n---\n\n");
            total_cost += source.cost_usd;
            total_tokens += source.token_count;
        }

        let bytes = combined.into_bytes();
        let content_hash = pc_storage::sha256_hex(&bytes);
        let mut artifact = Artifact::new(
            self.run_id,
            task.document_id,
            GeneratorKind::Combine,
            model.to_string(),
            String::new(),
            content_hash,
            total_cost,
            total_tokens,
            0,
            serde_json::json!({ "combined_from": sources.len() }),
        );
        artifact.storage_location = format!("runs/{}/artifacts/{}.bin", self.run_id, artifact.artifact_id);

        if let Err(e) = self
            .storage
            .write(&artifact.storage_location, &bytes, "combine artifact")
            .await
        {
            return TaskOutcome::TransientFailure(e.to_string());
        }

        match self.store.insert_artifact(&artifact).await {
            Ok(()) => TaskOutcome::Succeeded,
            Err(e) => TaskOutcome::TransientFailure(e.to_string()),
        }
    }
}
