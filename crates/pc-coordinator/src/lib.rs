//! Public entry point for runs: create/attach/start/cancel/inspect, the
//! boot-time reap of orphaned `running` rows, and the phase-by-phase pipeline
//! that drives a run from `queued` to a terminal status. Grounded on the
//! teacher's `OrchestratorEngine` (lifecycle handlers owning the state
//! machine) and its reap-on-boot precedent in the metadata store.

mod pipeline;
mod workers;

use std::collections::HashMap;
use std::sync::Arc;

use pc_providers::GeneratorClient;
use pc_storage::StorageProvider;
use pc_store::{MetadataStore, StoreError};
use pc_types::{
    Document, DocumentSource, Run, RunDocument, RunDocumentStatus, RunId, RunStatus, TenantId,
    TypeError,
};
use pc_vault::KeyVault;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub use pipeline::run_pipeline;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("run not found")]
    RunNotFound,
    #[error("run is already in a terminal state")]
    RunAlreadyTerminal,
    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },
    #[error("document already attached to run")]
    DocumentAlreadyAttached,
    #[error("document not attached to run")]
    DocumentNotAttached,
    #[error("run does not belong to the calling tenant")]
    TenantMismatch,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("vault error: {0}")]
    Vault(#[from] pc_vault::VaultError),
    #[error("storage error: {0}")]
    Storage(#[from] pc_storage::StorageError),
}

impl CoordinatorError {
    /// The domain error code named in the external-interface error taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::RunNotFound => "RUN_NOT_FOUND",
            CoordinatorError::RunAlreadyTerminal => "RUN_ALREADY_TERMINAL",
            CoordinatorError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            CoordinatorError::DocumentAlreadyAttached => "DOCUMENT_ALREADY_ATTACHED",
            CoordinatorError::DocumentNotAttached => "DOCUMENT_NOT_ATTACHED",
            CoordinatorError::TenantMismatch => "TENANT_MISMATCH",
            CoordinatorError::Validation(_) => "VALIDATION",
            CoordinatorError::Store(_) => "INTERNAL",
            CoordinatorError::Vault(_) => "INTERNAL",
            CoordinatorError::Storage(_) => "INTERNAL",
        }
    }
}

impl From<TypeError> for CoordinatorError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::Validation(msg) => CoordinatorError::Validation(msg),
            TypeError::InvalidStatusTransition { from, to } => {
                CoordinatorError::InvalidStatusTransition { from, to }
            }
        }
    }
}

/// One document to attach, at the granularity the coordinator's component-level
/// API works with (the HTTP layer translates its own wire DTOs into this).
pub struct DocumentSpec {
    pub source: DocumentSource,
    pub display_name: Option<String>,
}

pub struct RunUpdate {
    pub title: Option<String>,
    pub priority: Option<u8>,
    pub tags: Option<Vec<String>>,
    pub summary: Option<String>,
}

pub struct RunCoordinator {
    store: Arc<MetadataStore>,
    vault: Arc<KeyVault>,
    storage: Arc<dyn StorageProvider>,
    limiter: Arc<pc_ratelimit::RateLimiter>,
    generator_client: Arc<dyn GeneratorClient>,
    judge_client: Arc<dyn pc_providers::JudgeClient>,
    cancellations: RwLock<HashMap<RunId, CancellationToken>>,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<MetadataStore>,
        vault: Arc<KeyVault>,
        storage: Arc<dyn StorageProvider>,
        limiter: Arc<pc_ratelimit::RateLimiter>,
        generator_client: Arc<dyn GeneratorClient>,
        judge_client: Arc<dyn pc_providers::JudgeClient>,
    ) -> Self {
        Self {
            store,
            vault,
            storage,
            limiter,
            generator_client,
            judge_client,
            cancellations: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<pc_ratelimit::RateLimiter> {
        &self.limiter
    }

    /// Reaps orphaned `running` rows left by a prior crash. Must run before the
    /// scheduler accepts any new work.
    pub async fn reap_on_boot(&self) -> Result<(), CoordinatorError> {
        let (reaped_tasks, reaped_runs) = self.store.reap_running_tasks().await?;
        for task_id in &reaped_tasks {
            pc_observability::emit_event(
                tracing::Level::WARN,
                &pc_observability::ObservabilityEvent {
                    event: "task_reaped_on_boot",
                    component: "coordinator",
                    task_id: Some(&task_id.to_string()),
                    ..Default::default()
                },
            );
        }
        for run_id in &reaped_runs {
            pc_observability::emit_event(
                tracing::Level::WARN,
                &pc_observability::ObservabilityEvent {
                    event: "run_reaped_on_boot",
                    component: "coordinator",
                    run_id: Some(&run_id.to_string()),
                    ..Default::default()
                },
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_run(
        &self,
        tenant_id: TenantId,
        project_id: String,
        title: Option<String>,
        config: serde_json::Value,
        tags: Vec<String>,
        priority: u8,
        requested_by: String,
    ) -> Result<RunId, CoordinatorError> {
        pc_types::RunConfig::validate(&config)
            .map_err(|e| CoordinatorError::Validation(e.to_string()))?;
        let run = Run::new(tenant_id, project_id, title, config, tags, priority, requested_by)?;
        let run_id = run.run_id;
        self.store.insert_run(&run).await?;
        Ok(run_id)
    }

    async fn load_run(&self, run_id: RunId) -> Result<Run, CoordinatorError> {
        self.store
            .get_run(&run_id)
            .await?
            .ok_or(CoordinatorError::RunNotFound)
    }

    /// Loads a run and rejects it unless it belongs to `tenant_id`. Every
    /// entry point below that is reachable with a caller-supplied `run_id`
    /// must route through this rather than `load_run` directly, so a run
    /// never leaks across the tenant boundary.
    async fn load_run_for_tenant(
        &self,
        run_id: RunId,
        tenant_id: &TenantId,
    ) -> Result<Run, CoordinatorError> {
        let run = self.load_run(run_id).await?;
        if &run.tenant_id != tenant_id {
            return Err(CoordinatorError::TenantMismatch);
        }
        Ok(run)
    }

    pub async fn attach_documents(
        &self,
        run_id: RunId,
        tenant_id: &TenantId,
        specs: Vec<DocumentSpec>,
    ) -> Result<(), CoordinatorError> {
        let run = self.load_run_for_tenant(run_id, tenant_id).await?;
        if run.status != RunStatus::Pending {
            return Err(CoordinatorError::InvalidStatusTransition {
                from: format!("{:?}", run.status),
                to: "documents-attached".to_string(),
            });
        }

        let existing = self.store.list_run_documents(&run_id).await?;
        let mut next_sort_order = existing.len() as i64;

        for spec in specs {
            let document = match &spec.source {
                DocumentSource::Inline { content, .. } => {
                    let hash = sha256_hex(content);
                    if let Some(found) = self.store.find_document_by_hash(&hash).await? {
                        found
                    } else {
                        let document = Document::new(spec.source, spec.display_name)?;
                        self.storage
                            .write(
                                &document_storage_path(&document),
                                content,
                                "attach document",
                            )
                            .await?;
                        self.store.insert_document(&document).await?;
                        document
                    }
                }
                DocumentSource::Stored { .. } => {
                    let document = Document::new(spec.source, spec.display_name)?;
                    self.store.insert_document(&document).await?;
                    document
                }
            };

            let run_document = RunDocument {
                run_id,
                document_id: document.document_id,
                status: RunDocumentStatus::Pending,
                sort_order: next_sort_order,
                error_message: None,
                started_at: None,
                completed_at: None,
            };
            next_sort_order += 1;
            match self.store.attach_run_document(&run_document).await {
                Ok(()) => {}
                Err(StoreError::DocumentAlreadyAttached) => {
                    return Err(CoordinatorError::DocumentAlreadyAttached)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn list_documents(
        &self,
        run_id: RunId,
        tenant_id: &TenantId,
    ) -> Result<Vec<RunDocument>, CoordinatorError> {
        self.load_run_for_tenant(run_id, tenant_id).await?;
        Ok(self.store.list_run_documents(&run_id).await?)
    }

    /// Detaches one document from a run. Only legal while the run has not yet started,
    /// same as attach.
    pub async fn detach_document(
        &self,
        run_id: RunId,
        tenant_id: &TenantId,
        document_id: pc_types::DocumentId,
    ) -> Result<(), CoordinatorError> {
        let run = self.load_run_for_tenant(run_id, tenant_id).await?;
        if run.status != RunStatus::Pending {
            return Err(CoordinatorError::InvalidStatusTransition {
                from: format!("{:?}", run.status),
                to: "documents-detached".to_string(),
            });
        }
        match self.store.detach_run_document(&run_id, &document_id).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => Err(CoordinatorError::DocumentNotAttached),
            Err(e) => Err(e.into()),
        }
    }

    /// Validates `pending -> queued -> running` and spawns the phase pipeline.
    /// Takes `Arc<Self>` so the spawned pipeline task can hold its own handle.
    pub async fn start(self: Arc<Self>, run_id: RunId, tenant_id: &TenantId) -> Result<(), CoordinatorError> {
        let mut run = self.load_run_for_tenant(run_id, tenant_id).await?;
        run.transition(RunStatus::Queued)?;
        self.store.update_run(&run).await?;
        run.transition(RunStatus::Running)?;
        self.store.update_run(&run).await?;

        let cancel = CancellationToken::new();
        self.cancellations.write().await.insert(run_id, cancel.clone());

        let coordinator = self;
        tokio::spawn(async move {
            if let Err(e) = pipeline::run_pipeline(coordinator.clone(), run_id, cancel).await {
                tracing::error!(run_id = %run_id, error = %e, "run pipeline exited with an error");
            }
            coordinator.cancellations.write().await.remove(&run_id);
        });
        Ok(())
    }

    /// Fires the run's cancellation token if it is executing, or transitions it
    /// directly to `cancelled` if it has not started running yet.
    pub async fn cancel(&self, run_id: RunId, tenant_id: &TenantId) -> Result<(), CoordinatorError> {
        let mut run = self.load_run_for_tenant(run_id, tenant_id).await?;
        if run.status.is_terminal() {
            return Err(CoordinatorError::RunAlreadyTerminal);
        }
        if let Some(token) = self.cancellations.read().await.get(&run_id) {
            token.cancel();
            return Ok(());
        }
        run.transition(RunStatus::Cancelled)?;
        self.store.update_run(&run).await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: RunId, tenant_id: &TenantId) -> Result<Run, CoordinatorError> {
        self.load_run_for_tenant(run_id, tenant_id).await
    }

    pub async fn list_runs(
        &self,
        tenant_id: &TenantId,
        status: Option<RunStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Run>, CoordinatorError> {
        Ok(self.store.list_runs(tenant_id, status, limit, offset).await?)
    }

    pub async fn update_run(
        &self,
        run_id: RunId,
        tenant_id: &TenantId,
        update: RunUpdate,
    ) -> Result<Run, CoordinatorError> {
        let mut run = self.load_run_for_tenant(run_id, tenant_id).await?;
        if run.status.is_terminal() && (update.priority.is_some() || update.tags.is_some()) {
            return Err(CoordinatorError::RunAlreadyTerminal);
        }
        if let Some(title) = update.title {
            run.title = Some(title);
        }
        if let Some(priority) = update.priority {
            run.priority = pc_types::validate_priority(priority)?;
        }
        if let Some(tags) = update.tags {
            run.tags = pc_types::normalize_tags(tags)?;
        }
        if let Some(summary) = update.summary {
            run.summary = Some(summary);
        }
        run.updated_at = chrono::Utc::now();
        self.store.update_run(&run).await?;
        Ok(run)
    }

    /// Soft delete: transitions to `cancelled` and retains every row. Hard
    /// delete is an administrative path outside this entry point.
    pub async fn delete_run(&self, run_id: RunId, tenant_id: &TenantId) -> Result<(), CoordinatorError> {
        let mut run = self.load_run_for_tenant(run_id, tenant_id).await?;
        if !run.status.is_terminal() {
            run.transition(RunStatus::Cancelled)?;
            self.store.update_run(&run).await?;
        }
        Ok(())
    }
}

fn document_storage_path(document: &Document) -> String {
    match &document.source {
        DocumentSource::Inline { .. } => format!("documents/{}", document.document_id),
        DocumentSource::Stored { path, .. } => path.clone(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
