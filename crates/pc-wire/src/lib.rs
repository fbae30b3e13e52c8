//! Wire-format DTOs for the HTTP API. Kept separate from `pc-types` so that
//! internal entity refactors don't ripple into the HTTP contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub project_id: String,
    pub title: Option<String>,
    pub config: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    pub priority: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    pub status: Option<String>,
    pub project_id: Option<String>,
    pub tags: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub order_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRunRequest {
    pub title: Option<String>,
    pub priority: Option<u8>,
    pub tags: Option<Vec<String>>,
    pub summary: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub run_id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub title: Option<String>,
    pub status: String,
    pub priority: u8,
    pub config: Value,
    pub tags: Vec<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunListResponse {
    pub runs: Vec<RunResponse>,
    pub total: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttachDocumentSpec {
    Stored {
        repository: String,
        git_ref: String,
        path: String,
        display_name: Option<String>,
    },
    Inline {
        content_base64: String,
        filename: String,
        mime: String,
        display_name: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttachDocumentRequest {
    #[serde(flatten)]
    pub spec: AttachDocumentSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchAttachDocumentsRequest(pub Vec<AttachDocumentSpec>);

pub const MAX_BATCH_DOCUMENTS: usize = 100;

#[derive(Debug, Serialize, Deserialize)]
pub struct RunDocumentResponse {
    pub document_id: String,
    pub display_name: String,
    pub status: String,
    pub sort_order: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EvaluateStatusResponse {
    pub run_id: String,
    pub phase: String,
    pub single_doc_rows_completed: u64,
    pub single_doc_rows_total: u64,
    pub pairwise_results_completed: u64,
    pub pairwise_results_total: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RankedArtifact {
    pub artifact_id: String,
    pub document_id: Option<String>,
    pub model_id: String,
    pub elo_rating: f64,
    pub games_played: u32,
    pub mean_single_doc_score: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EvaluateResultsResponse {
    pub run_id: String,
    pub rankings: Vec<RankedArtifact>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitBucketStatus {
    pub provider: String,
    pub model: String,
    pub rpm_limit: u32,
    pub rpm_remaining: u32,
    pub tpm_limit: u64,
    pub tpm_remaining: u64,
    pub window_reset_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitStatusResponse {
    pub buckets: Vec<RateLimitBucketStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Error body shape: `{error_type, error_message, details?}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_type: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}
