//! Credential-header extraction. Generalizes the single-token gate idiom (a
//! static shared secret compared against one `Authorization` header) to a
//! multi-tenant table: a tenant API key resolves directly to a `TenantId`; a
//! service/plugin secret authenticates as an operator acting on behalf of a
//! tenant named by `X-Tenant-Id`.

use std::collections::HashMap;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use pc_types::TenantId;

use crate::error::ApiError;
use crate::AppState;

/// Resolved caller identity for one request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub tenant_id: TenantId,
}

#[derive(Debug, Default)]
pub struct CredentialTable {
    /// Tenant API key -> tenant.
    api_keys: HashMap<String, TenantId>,
    /// Plugin/service secrets, which authenticate as whatever tenant the
    /// caller names via `X-Tenant-Id` rather than a fixed one.
    service_secrets: Vec<String>,
}

impl CredentialTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(mut self, key: impl Into<String>, tenant_id: TenantId) -> Self {
        self.api_keys.insert(key.into(), tenant_id);
        self
    }

    pub fn with_service_secret(mut self, secret: impl Into<String>) -> Self {
        self.service_secrets.push(secret.into());
        self
    }

    fn resolve(&self, headers: &HeaderMap) -> Option<Principal> {
        let credential = extract_credential(headers)?;
        if let Some(tenant_id) = self.api_keys.get(&credential) {
            return Some(Principal {
                tenant_id: tenant_id.clone(),
            });
        }
        if self.service_secrets.iter().any(|s| s == &credential) {
            let raw = headers.get("x-tenant-id")?.to_str().ok()?;
            let tenant_id = TenantId::new(raw).ok()?;
            return Some(Principal { tenant_id });
        }
        None
    }
}

fn extract_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(key.to_string());
    }
    let auth = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let trimmed = auth.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .unwrap_or(trimmed)
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Runs before every handler. `/health` is exempt; everything else requires a
/// resolvable credential.
pub async fn auth_gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }
    match state.credentials.resolve(request.headers()) {
        Some(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        None => ApiError::auth("missing or invalid credential header").into_response(),
    }
}
