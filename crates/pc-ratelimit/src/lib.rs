//! A token-bucket keyed by `(provider, model)` composed
//! with a per-provider concurrency semaphore. Hand-rolled on `tokio::sync` primitives
//! rather than a generic crate, because the header-driven dynamic quota overwrite
//! (headers are authoritative once parsed) and the strict semaphore-then-bucket
//! acquisition order (acquiring the bucket permit first would deadlock) are exact
//! contractual requirements this engine owns, not generic rate-limiting behavior.

mod headers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use pc_types::RateLimitBucket;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;

pub use headers::{parse_provider_headers, ParsedLimits};

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit acquire timed out after {0:?}")]
    Timeout(StdDuration),
}

#[derive(Debug, Clone, Copy)]
pub struct BucketDefaults {
    pub rpm_limit: u32,
    pub tpm_limit: u64,
}

impl Default for BucketDefaults {
    /// Conservative fallback for providers/models with no configured default.
    fn default() -> Self {
        Self {
            rpm_limit: 20,
            tpm_limit: 40_000,
        }
    }
}

type BucketKey = (String, String);

struct BucketSlot {
    bucket: Mutex<RateLimitBucket>,
    /// Single-permit semaphore used purely for FIFO-fair queuing per bucket key
    /// (FIFO per `(provider, model)` queue).
    fairness: Semaphore,
}

pub struct RateLimitTable {
    defaults: HashMap<BucketKey, BucketDefaults>,
    fallback: BucketDefaults,
}

impl RateLimitTable {
    pub fn new(defaults: HashMap<BucketKey, BucketDefaults>) -> Self {
        Self {
            defaults,
            fallback: BucketDefaults::default(),
        }
    }

    fn defaults_for(&self, provider: &str, model: &str) -> BucketDefaults {
        self.defaults
            .get(&(provider.to_string(), model.to_string()))
            .copied()
            .unwrap_or(self.fallback)
    }
}

pub struct RateLimiter {
    table: RateLimitTable,
    buckets: RwLock<HashMap<BucketKey, Arc<BucketSlot>>>,
    provider_semaphores: RwLock<HashMap<String, Arc<Semaphore>>>,
    default_provider_concurrency: usize,
}

/// Scoped capability to perform one outbound LLM call. Always release it via
/// `RateLimiter::release` on every exit path (success, error, or cancellation before
/// the call even starts by simply dropping it -- the concurrency slot is reclaimed by
/// `OwnedSemaphorePermit`'s `Drop`, but bucket remaining-counts are only ever mutated
/// by a successful `acquire`, never rolled back on drop).
pub struct Permit {
    key: BucketKey,
    estimated_tokens: u64,
    _concurrency_permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(table: RateLimitTable, default_provider_concurrency: usize) -> Self {
        Self {
            table,
            buckets: RwLock::new(HashMap::new()),
            provider_semaphores: RwLock::new(HashMap::new()),
            default_provider_concurrency,
        }
    }

    async fn provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        if let Some(sem) = self.provider_semaphores.read().await.get(provider) {
            return sem.clone();
        }
        let mut write = self.provider_semaphores.write().await;
        write
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.default_provider_concurrency)))
            .clone()
    }

    async fn bucket_slot(&self, provider: &str, model: &str) -> Arc<BucketSlot> {
        let key = (provider.to_string(), model.to_string());
        if let Some(slot) = self.buckets.read().await.get(&key) {
            return slot.clone();
        }
        let mut write = self.buckets.write().await;
        write
            .entry(key)
            .or_insert_with(|| {
                let defaults = self.table.defaults_for(provider, model);
                Arc::new(BucketSlot {
                    bucket: Mutex::new(RateLimitBucket::from_defaults(
                        defaults.rpm_limit,
                        defaults.tpm_limit,
                    )),
                    fairness: Semaphore::new(1),
                })
            })
            .clone()
    }

    /// Blocks the caller until capacity is available under `timeout`, then atomically
    /// decrements the bucket. Acquires the per-provider concurrency slot first, then
    /// the token-bucket permit (inner-first is forbidden, would deadlock).
    pub async fn acquire(
        &self,
        provider: &str,
        model: &str,
        estimated_tokens: u64,
        timeout: StdDuration,
    ) -> Result<Permit, RateLimitError> {
        let deadline = Instant::now() + timeout;

        let provider_sem = self.provider_semaphore(provider).await;
        let concurrency_permit = tokio::time::timeout_at(deadline, provider_sem.acquire_owned())
            .await
            .map_err(|_| RateLimitError::Timeout(timeout))?
            .expect("provider semaphore is never closed");

        let slot = self.bucket_slot(provider, model).await;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RateLimitError::Timeout(timeout));
            }

            let fairness_permit = tokio::time::timeout_at(deadline, slot.fairness.acquire())
                .await
                .map_err(|_| RateLimitError::Timeout(timeout))?
                .expect("fairness semaphore is never closed");

            let mut bucket = slot.bucket.lock().await;
            refill_if_needed(&mut bucket);

            if bucket.rpm_remaining >= 1 && bucket.tpm_remaining >= estimated_tokens {
                bucket.rpm_remaining -= 1;
                bucket.tpm_remaining -= estimated_tokens;
                bucket.last_updated = Utc::now();
                drop(bucket);
                drop(fairness_permit);
                return Ok(Permit {
                    key: (provider.to_string(), model.to_string()),
                    estimated_tokens,
                    _concurrency_permit: concurrency_permit,
                });
            }

            let wait = wait_duration(&bucket);
            drop(bucket);
            drop(fairness_permit);

            let wait_deadline = (Instant::now() + wait).min(deadline);
            tokio::time::sleep_until(wait_deadline).await;
        }
    }

    /// Releases a permit. If `response_headers` parse, the bucket is overwritten from
    /// them (headers are authoritative). Otherwise, if `actual_tokens` undershot the
    /// estimate, the difference is returned to `tpm_remaining`.
    pub async fn release(
        &self,
        permit: Permit,
        actual_tokens: Option<u64>,
        response_headers: Option<&HashMap<String, String>>,
    ) {
        let slot = self.bucket_slot(&permit.key.0, &permit.key.1).await;
        let mut bucket = slot.bucket.lock().await;

        let parsed = response_headers
            .and_then(|headers| parse_provider_headers(&permit.key.0, headers));
        if let Some(parsed) = parsed {
            if let Some(limit) = parsed.rpm_limit {
                bucket.rpm_limit = limit;
            }
            if let Some(remaining) = parsed.rpm_remaining {
                bucket.rpm_remaining = remaining;
            }
            if let Some(limit) = parsed.tpm_limit {
                bucket.tpm_limit = limit;
            }
            if let Some(remaining) = parsed.tpm_remaining {
                bucket.tpm_remaining = remaining;
            }
            if let Some(reset_at) = parsed.window_reset_at {
                bucket.window_reset_at = reset_at;
            }
            bucket.last_updated = Utc::now();
        } else if let Some(actual) = actual_tokens {
            if actual < permit.estimated_tokens {
                bucket.tpm_remaining += permit.estimated_tokens - actual;
            }
        }
        // `permit._concurrency_permit` drops here, freeing the provider slot.
    }

    pub async fn status(&self) -> Vec<((String, String), RateLimitBucket)> {
        let buckets = self.buckets.read().await;
        let mut out = Vec::with_capacity(buckets.len());
        for (key, slot) in buckets.iter() {
            out.push((key.clone(), *slot.bucket.lock().await));
        }
        out
    }
}

fn refill_if_needed(bucket: &mut RateLimitBucket) {
    if Utc::now() >= bucket.window_reset_at {
        bucket.rpm_remaining = bucket.rpm_limit;
        bucket.tpm_remaining = bucket.tpm_limit;
        bucket.window_reset_at = Utc::now() + chrono::Duration::minutes(1);
    }
}

/// `min(seconds_until(window_reset_at), 1.0)`.
fn wait_duration(bucket: &RateLimitBucket) -> StdDuration {
    let seconds_until = (bucket.window_reset_at - Utc::now())
        .num_milliseconds()
        .max(0) as f64
        / 1000.0;
    StdDuration::from_secs_f64(seconds_until.min(1.0).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(provider: &str, model: &str, rpm: u32, tpm: u64) -> RateLimitTable {
        let mut defaults = HashMap::new();
        defaults.insert(
            (provider.to_string(), model.to_string()),
            BucketDefaults {
                rpm_limit: rpm,
                tpm_limit: tpm,
            },
        );
        RateLimitTable::new(defaults)
    }

    #[tokio::test]
    async fn acquire_then_release_restores_capacity_from_headers() {
        let limiter = RateLimiter::new(table_with("openai", "m-a", 2, 1000), 4);
        let permit = limiter
            .acquire("openai", "m-a", 100, StdDuration::from_secs(1))
            .await
            .unwrap();

        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-remaining-requests".to_string(), "2".to_string());
        headers.insert("x-ratelimit-limit-requests".to_string(), "2".to_string());
        limiter.release(permit, Some(80), Some(&headers)).await;

        let status = limiter.status().await;
        let (_, bucket) = status.iter().find(|(k, _)| k.0 == "openai").unwrap();
        assert_eq!(bucket.rpm_remaining, 2);
    }

    #[tokio::test]
    async fn undershoot_of_estimated_tokens_is_returned_to_the_bucket() {
        let limiter = RateLimiter::new(table_with("openai", "m-a", 5, 1000), 4);
        let permit = limiter
            .acquire("openai", "m-a", 100, StdDuration::from_secs(1))
            .await
            .unwrap();
        limiter.release(permit, Some(20), None).await;

        let status = limiter.status().await;
        let (_, bucket) = status.iter().find(|(k, _)| k.0 == "openai").unwrap();
        assert_eq!(bucket.tpm_remaining, 1000 - 20);
    }

    #[tokio::test]
    async fn acquire_times_out_when_rpm_is_exhausted() {
        let limiter = RateLimiter::new(table_with("openai", "m-a", 1, 1000), 4);
        let first = limiter
            .acquire("openai", "m-a", 10, StdDuration::from_secs(1))
            .await
            .unwrap();

        let result = limiter
            .acquire("openai", "m-a", 10, StdDuration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RateLimitError::Timeout(_))));
        limiter.release(first, Some(10), None).await;
    }

    #[tokio::test]
    async fn concurrency_semaphore_is_acquired_before_the_bucket_permit() {
        // capacity 1 at the provider level; a second caller must wait on the semaphore
        // even though the bucket itself has room for both.
        let limiter = RateLimiter::new(table_with("openai", "m-a", 10, 100_000), 1);
        let first = limiter
            .acquire("openai", "m-a", 10, StdDuration::from_secs(1))
            .await
            .unwrap();

        let second = limiter.acquire("openai", "m-a", 10, StdDuration::from_millis(50)).await;
        assert!(matches!(second, Err(RateLimitError::Timeout(_))));
        limiter.release(first, Some(10), None).await;

        // now that the provider slot is free, a new acquire succeeds.
        let third = limiter
            .acquire("openai", "m-a", 10, StdDuration::from_secs(1))
            .await
            .unwrap();
        limiter.release(third, Some(10), None).await;
    }
}
