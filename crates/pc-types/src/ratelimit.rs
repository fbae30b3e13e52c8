use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Not persisted: process-wide in-memory state per `(provider, model)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub rpm_limit: u32,
    pub tpm_limit: u64,
    pub rpm_remaining: u32,
    pub tpm_remaining: u64,
    pub window_reset_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl RateLimitBucket {
    pub fn from_defaults(rpm_limit: u32, tpm_limit: u64) -> Self {
        let now = Utc::now();
        Self {
            rpm_limit,
            tpm_limit,
            rpm_remaining: rpm_limit,
            tpm_remaining: tpm_limit,
            window_reset_at: now + chrono::Duration::minutes(1),
            last_updated: now,
        }
    }
}
