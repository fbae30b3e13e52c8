use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ArtifactId, DocumentId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    Fpf,
    Research,
    /// Tags an artifact produced by the combine phase rather than a generator call.
    Combine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub run_id: RunId,
    pub document_id: Option<DocumentId>,
    pub generator: GeneratorKind,
    pub model_id: String,
    pub storage_location: String,
    pub content_hash: String,
    pub cost_usd: f64,
    pub token_count: u64,
    pub generation_ms: u64,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        document_id: Option<DocumentId>,
        generator: GeneratorKind,
        model_id: String,
        storage_location: String,
        content_hash: String,
        cost_usd: f64,
        token_count: u64,
        generation_ms: u64,
        metadata: Value,
    ) -> Self {
        // immutable after creation: no mutator methods are provided on purpose
        Self {
            artifact_id: ArtifactId::new(),
            run_id,
            document_id,
            generator,
            model_id,
            storage_location,
            content_hash,
            cost_usd,
            token_count,
            generation_ms,
            metadata,
            created_at: Utc::now(),
        }
    }
}
