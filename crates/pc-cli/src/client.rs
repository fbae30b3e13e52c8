//! Thin `reqwest` wrapper over the HTTP API, one method per CLI-facing
//! operation. Grounded on the retry-less request/response shape used for
//! judge and generator calls: build request, send, branch on status, parse
//! either the success body or the wire `ErrorBody`.

use std::time::Duration;

use pc_wire::{
    AttachDocumentRequest, BatchAttachDocumentsRequest, CreateRunRequest, ErrorBody,
    EvaluateResultsResponse, EvaluateStatusResponse, HealthResponse, RateLimitStatusResponse,
    RunDocumentResponse, RunListResponse, RunResponse, UpdateRunRequest,
};
use reqwest::{Client, StatusCode};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not reach {0}: {1}")]
    Connection(String, reqwest::Error),
    #[error("{error_type}: {error_message}")]
    Api {
        status: StatusCode,
        error_type: String,
        error_message: String,
    },
    #[error("malformed response: {0}")]
    InvalidResponse(reqwest::Error),
}

impl ClientError {
    /// Whether this failure belongs in the "couldn't connect" exit-code bucket
    /// rather than the generic "application error" one.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, ClientError::Connection(..))
    }
}

pub struct ApiClient {
    http: Client,
    base_url: String,
    credential: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: String, credential: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static config");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ClientError> {
        let url = self.url(path);
        let mut req = self.http.request(method, &url);
        if let Some(credential) = &self.credential {
            req = req.bearer_auth(credential);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send()
            .await
            .map_err(|e| ClientError::Connection(url, e))
    }

    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
        let status = resp.status();
        if status.is_success() {
            resp.json::<T>().await.map_err(ClientError::InvalidResponse)
        } else {
            let body: ErrorBody = resp
                .json()
                .await
                .unwrap_or_else(|_| ErrorBody {
                    error_type: "UNKNOWN".to_string(),
                    error_message: format!("request failed with status {status}"),
                    details: None,
                });
            Err(ClientError::Api {
                status,
                error_type: body.error_type,
                error_message: body.error_message,
            })
        }
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let resp = self.send::<()>(reqwest::Method::GET, "/health", None).await?;
        Self::decode(resp).await
    }

    pub async fn create_run(&self, body: &CreateRunRequest) -> Result<RunResponse, ClientError> {
        let resp = self.send(reqwest::Method::POST, "/runs", Some(body)).await?;
        Self::decode(resp).await
    }

    pub async fn list_runs(&self, query: &str) -> Result<RunListResponse, ClientError> {
        let path = if query.is_empty() {
            "/runs".to_string()
        } else {
            format!("/runs?{query}")
        };
        let resp = self.send::<()>(reqwest::Method::GET, &path, None).await?;
        Self::decode(resp).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunResponse, ClientError> {
        let resp = self
            .send::<()>(reqwest::Method::GET, &format!("/runs/{run_id}"), None)
            .await?;
        Self::decode(resp).await
    }

    pub async fn update_run(&self, run_id: &str, body: &UpdateRunRequest) -> Result<RunResponse, ClientError> {
        let resp = self
            .send(reqwest::Method::PATCH, &format!("/runs/{run_id}"), Some(body))
            .await?;
        Self::decode(resp).await
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<serde_json::Value, ClientError> {
        let resp = self
            .send::<()>(reqwest::Method::DELETE, &format!("/runs/{run_id}"), None)
            .await?;
        Self::decode(resp).await
    }

    pub async fn start_run(&self, run_id: &str) -> Result<serde_json::Value, ClientError> {
        let resp = self
            .send::<()>(reqwest::Method::POST, &format!("/runs/{run_id}/start"), None)
            .await?;
        Self::decode(resp).await
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<serde_json::Value, ClientError> {
        let resp = self
            .send::<()>(reqwest::Method::POST, &format!("/runs/{run_id}/cancel"), None)
            .await?;
        Self::decode(resp).await
    }

    pub async fn attach_document(
        &self,
        run_id: &str,
        body: &AttachDocumentRequest,
    ) -> Result<serde_json::Value, ClientError> {
        let resp = self
            .send(reqwest::Method::POST, &format!("/runs/{run_id}/documents"), Some(body))
            .await?;
        Self::decode(resp).await
    }

    pub async fn attach_documents_batch(
        &self,
        run_id: &str,
        body: &BatchAttachDocumentsRequest,
    ) -> Result<serde_json::Value, ClientError> {
        let resp = self
            .send(
                reqwest::Method::POST,
                &format!("/runs/{run_id}/documents/batch"),
                Some(body),
            )
            .await?;
        Self::decode(resp).await
    }

    pub async fn list_documents(&self, run_id: &str) -> Result<Vec<RunDocumentResponse>, ClientError> {
        let resp = self
            .send::<()>(reqwest::Method::GET, &format!("/runs/{run_id}/documents"), None)
            .await?;
        Self::decode(resp).await
    }

    pub async fn detach_document(&self, run_id: &str, document_id: &str) -> Result<serde_json::Value, ClientError> {
        let resp = self
            .send::<()>(
                reqwest::Method::DELETE,
                &format!("/runs/{run_id}/documents/{document_id}"),
                None,
            )
            .await?;
        Self::decode(resp).await
    }

    pub async fn evaluate_status(&self, run_id: &str) -> Result<EvaluateStatusResponse, ClientError> {
        let resp = self
            .send::<()>(reqwest::Method::GET, &format!("/runs/{run_id}/evaluate/status"), None)
            .await?;
        Self::decode(resp).await
    }

    pub async fn evaluate_results(&self, run_id: &str, query: &str) -> Result<EvaluateResultsResponse, ClientError> {
        let path = if query.is_empty() {
            format!("/runs/{run_id}/evaluate/results")
        } else {
            format!("/runs/{run_id}/evaluate/results?{query}")
        };
        let resp = self.send::<()>(reqwest::Method::GET, &path, None).await?;
        Self::decode(resp).await
    }

    pub async fn rate_limit_status(&self) -> Result<RateLimitStatusResponse, ClientError> {
        let resp = self
            .send::<()>(reqwest::Method::GET, "/rate-limits/status", None)
            .await?;
        Self::decode(resp).await
    }
}
