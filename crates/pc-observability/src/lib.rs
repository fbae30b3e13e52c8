//! Structured logging, per-run timelines, and rate-limit metrics.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// One structured log event at a component boundary. All fields but `event` and
/// `component` are optional since most events only populate a few of them.
#[derive(Debug, Default, Clone)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub request_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub tenant_id: Option<&'a str>,
    pub provider: Option<&'a str>,
    pub model: Option<&'a str>,
    pub elapsed_ms: Option<u64>,
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub error: Option<&'a str>,
}

pub fn emit_event(level: tracing::Level, ev: &ObservabilityEvent<'_>) {
    macro_rules! log_at {
        ($macro:ident) => {
            tracing::$macro!(
                target: "pipeline.obs",
                event = ev.event,
                component = ev.component,
                request_id = ev.request_id,
                run_id = ev.run_id,
                task_id = ev.task_id,
                tenant_id = ev.tenant_id,
                provider = ev.provider,
                model = ev.model,
                elapsed_ms = ev.elapsed_ms,
                remaining = ev.remaining,
                limit = ev.limit,
                error = ev.error,
            )
        };
    }
    match level {
        tracing::Level::ERROR => log_at!(error),
        tracing::Level::WARN => log_at!(warn),
        tracing::Level::INFO => log_at!(info),
        tracing::Level::DEBUG => log_at!(debug),
        tracing::Level::TRACE => log_at!(trace),
    }
}

/// Masks everything but the first/last few characters, for logging values that look
/// like they might be credentials without fully losing debuggability.
pub fn redact_text(value: &str) -> String {
    let len = value.chars().count();
    if len <= 8 {
        return "*".repeat(len);
    }
    let head: String = value.chars().take(3).collect();
    let tail: String = value.chars().skip(len - 3).collect();
    format!("{head}...{tail}")
}

pub struct LoggingInitInfo {
    pub log_file_prefix: String,
}

/// Sets up a JSON file sink (daily rotation) plus a compact console sink for
/// process-wide structured logging.
pub fn init_logging(
    logs_dir: impl AsRef<Path>,
    env_filter: &str,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    use tracing_subscriber::prelude::*;

    std::fs::create_dir_all(logs_dir.as_ref())?;
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("pipeline-engine")
        .filename_suffix("jsonl")
        .build(logs_dir.as_ref())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);
    let console_layer = tracing_subscriber::fmt::layer().compact();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .ok();

    Ok((
        guard,
        LoggingInitInfo {
            log_file_prefix: "pipeline-engine".to_string(),
        },
    ))
}

/// One entry in a run's persisted timeline: an ordered list of phase
/// transitions and aggregate counts, persisted at run completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub phase: String,
    pub status: String,
    pub at: DateTime<Utc>,
    pub succeeded_count: u64,
    pub failed_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunTimeline {
    pub entries: Vec<TimelineEntry>,
}

impl RunTimeline {
    pub fn push(&mut self, phase: impl Into<String>, status: impl Into<String>, succeeded: u64, failed: u64) {
        self.entries.push(TimelineEntry {
            phase: phase.into(),
            status: status.into(),
            at: Utc::now(),
            succeeded_count: succeeded,
            failed_count: failed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        assert_eq!(redact_text("short"), "*****");
        assert_eq!(redact_text("sk-abcdef123456"), "sk-...456");
    }

    #[test]
    fn timeline_entries_are_appended_in_order() {
        let mut timeline = RunTimeline::default();
        timeline.push("generation", "completed", 3, 0);
        timeline.push("single_doc_eval", "completed-with-partial-failures", 12, 3);
        assert_eq!(timeline.entries.len(), 2);
        assert_eq!(timeline.entries[0].phase, "generation");
        assert_eq!(timeline.entries[1].failed_count, 3);
    }
}
