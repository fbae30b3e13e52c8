//! Relational persistence for runs, documents, tasks,
//! artifacts and evaluation state. Grounded on the connection-and-schema idiom used
//! elsewhere in this workspace (`Arc<Mutex<Connection>>`, schema applied via
//! `CREATE TABLE IF NOT EXISTS` plus `PRAGMA table_info` migrations, `INSERT OR
//! REPLACE` upserts, `.optional()` single-row lookups).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pc_types::{
    Artifact, Document, DocumentSource, EloRating, EvaluationRow, GeneratorKind, PairwiseResult,
    Run, RunDocument, RunDocumentStatus, RunId, RunStatus, Task, TaskKind, TaskStatus, TenantId,
    Winner,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid timestamp stored in database: {0}")]
    InvalidTimestamp(String),
    #[error("invalid id stored in database: {0}")]
    InvalidId(String),
    #[error("not found")]
    NotFound,
    #[error("document already attached to run")]
    DocumentAlreadyAttached,
}

pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataStore {
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                title TEXT,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                config TEXT NOT NULL,
                tags TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                summary TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_tenant_status ON runs(tenant_id, status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                document_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                content_hash TEXT,
                display_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_documents_content_hash ON documents(content_hash)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_documents (
                run_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                status TEXT NOT NULL,
                sort_order INTEGER NOT NULL,
                error_message TEXT,
                started_at TEXT,
                completed_at TEXT,
                PRIMARY KEY (run_id, document_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_run_documents_run ON run_documents(run_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                sort_order INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT,
                document_id TEXT,
                payload TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )",
            [],
        )?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks(run_id)", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS artifacts (
                artifact_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                document_id TEXT,
                generator TEXT NOT NULL,
                model_id TEXT NOT NULL,
                storage_location TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                cost_usd REAL NOT NULL,
                token_count INTEGER NOT NULL,
                generation_ms INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS evaluation_rows (
                run_id TEXT NOT NULL,
                artifact_id TEXT NOT NULL,
                judge_model TEXT NOT NULL,
                dimension TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                score INTEGER,
                rationale TEXT,
                failed_parse INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, artifact_id, judge_model, dimension, iteration)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_evaluation_rows_run ON evaluation_rows(run_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pairwise_results (
                run_id TEXT NOT NULL,
                artifact_a TEXT NOT NULL,
                artifact_b TEXT NOT NULL,
                judge_model TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                winner TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, artifact_a, artifact_b, judge_model, iteration)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pairwise_results_run ON pairwise_results(run_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS elo_ratings (
                run_id TEXT NOT NULL,
                artifact_id TEXT NOT NULL,
                rating REAL NOT NULL,
                games_played INTEGER NOT NULL,
                PRIMARY KEY (run_id, artifact_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_elo_ratings_run ON elo_ratings(run_id)",
            [],
        )?;

        Ok(())
    }

    // -- runs ----------------------------------------------------------------

    pub async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO runs (run_id, tenant_id, project_id, title, status, priority, config, tags,
                requested_by, summary, created_at, updated_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                run.run_id.as_str(),
                run.tenant_id.as_str(),
                run.project_id,
                run.title,
                to_enum_str(&run.status)?,
                run.priority,
                run.config.to_string(),
                serde_json::to_string(&run.tags)?,
                run.requested_by,
                run.summary,
                to_rfc3339(run.created_at),
                to_rfc3339(run.updated_at),
                run.started_at.map(to_rfc3339),
                run.completed_at.map(to_rfc3339),
            ],
        )?;
        Ok(())
    }

    pub async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE runs SET title = ?2, status = ?3, config = ?4, tags = ?5, summary = ?6,
                updated_at = ?7, started_at = ?8, completed_at = ?9
             WHERE run_id = ?1",
            params![
                run.run_id.as_str(),
                run.title,
                to_enum_str(&run.status)?,
                run.config.to_string(),
                serde_json::to_string(&run.tags)?,
                run.summary,
                to_rfc3339(run.updated_at),
                run.started_at.map(to_rfc3339),
                run.completed_at.map(to_rfc3339),
            ],
        )?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT run_id, tenant_id, project_id, title, status, priority, config, tags,
                requested_by, summary, created_at, updated_at, started_at, completed_at
             FROM runs WHERE run_id = ?1",
            params![run_id.as_str()],
            row_to_run,
        )
        .optional()?
        .transpose()
    }

    pub async fn list_runs(
        &self,
        tenant_id: &TenantId,
        status: Option<RunStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Run>, StoreError> {
        let conn = self.conn.lock().await;
        let status_filter = status.map(|s| to_enum_str(&s)).transpose()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, tenant_id, project_id, title, status, priority, config, tags,
                requested_by, summary, created_at, updated_at, started_at, completed_at
             FROM runs
             WHERE tenant_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY run_id DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(
            params![tenant_id.as_str(), status_filter, limit, offset],
            row_to_run,
        )?;
        rows.collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
    }

    pub async fn delete_run(&self, run_id: &RunId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id.as_str()])?;
        conn.execute(
            "DELETE FROM run_documents WHERE run_id = ?1",
            params![run_id.as_str()],
        )?;
        conn.execute("DELETE FROM tasks WHERE run_id = ?1", params![run_id.as_str()])?;
        conn.execute("DELETE FROM artifacts WHERE run_id = ?1", params![run_id.as_str()])?;
        conn.execute(
            "DELETE FROM evaluation_rows WHERE run_id = ?1",
            params![run_id.as_str()],
        )?;
        conn.execute(
            "DELETE FROM pairwise_results WHERE run_id = ?1",
            params![run_id.as_str()],
        )?;
        conn.execute(
            "DELETE FROM elo_ratings WHERE run_id = ?1",
            params![run_id.as_str()],
        )?;
        Ok(())
    }

    // -- documents -------------------------------------------------------------

    pub async fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO documents (document_id, source, content_hash, display_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                document.document_id.as_str(),
                serde_json::to_string(&document.source)?,
                document.content_hash,
                document.display_name,
                to_rfc3339(document.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_document(&self, document_id: &pc_types::DocumentId) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT document_id, source, content_hash, display_name, created_at
             FROM documents WHERE document_id = ?1",
            params![document_id.as_str()],
            row_to_document,
        )
        .optional()?
        .transpose()
    }

    pub async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT document_id, source, content_hash, display_name, created_at
             FROM documents WHERE content_hash = ?1 LIMIT 1",
            params![content_hash],
            row_to_document,
        )
        .optional()?
        .transpose()
    }

    pub async fn attach_run_document(&self, run_document: &RunDocument) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO run_documents (run_id, document_id, status, sort_order,
                error_message, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_document.run_id.as_str(),
                run_document.document_id.as_str(),
                to_enum_str(&run_document.status)?,
                run_document.sort_order,
                run_document.error_message,
                run_document.started_at.map(to_rfc3339),
                run_document.completed_at.map(to_rfc3339),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                Err(StoreError::DocumentAlreadyAttached)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn detach_run_document(
        &self,
        run_id: &RunId,
        document_id: &pc_types::DocumentId,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "DELETE FROM run_documents WHERE run_id = ?1 AND document_id = ?2",
            params![run_id.as_str(), document_id.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn list_run_documents(&self, run_id: &RunId) -> Result<Vec<RunDocument>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_id, document_id, status, sort_order, error_message, started_at, completed_at
             FROM run_documents WHERE run_id = ?1 ORDER BY sort_order ASC",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], row_to_run_document)?;
        rows.collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
    }

    // -- tasks -------------------------------------------------------------

    pub async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (task_id, run_id, kind, status, sort_order, attempts, last_error,
                document_id, payload, created_at, updated_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                task.task_id.as_str(),
                task.run_id.as_str(),
                to_enum_str(&task.kind)?,
                to_enum_str(&task.status)?,
                task.sort_order,
                task.attempts,
                task.last_error,
                task.document_id.as_ref().map(|d| d.as_str()),
                task.payload.to_string(),
                to_rfc3339(task.created_at),
                to_rfc3339(task.updated_at),
                task.started_at.map(to_rfc3339),
                task.completed_at.map(to_rfc3339),
            ],
        )?;
        Ok(())
    }

    pub async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = ?2, attempts = ?3, last_error = ?4,
                updated_at = ?5, started_at = ?6, completed_at = ?7
             WHERE task_id = ?1",
            params![
                task.task_id.as_str(),
                to_enum_str(&task.status)?,
                task.attempts,
                task.last_error,
                to_rfc3339(task.updated_at),
                task.started_at.map(to_rfc3339),
                task.completed_at.map(to_rfc3339),
            ],
        )?;
        Ok(())
    }

    pub async fn list_tasks_by_run(&self, run_id: &RunId) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT task_id, run_id, kind, status, sort_order, attempts, last_error,
                document_id, payload, created_at, updated_at, started_at, completed_at
             FROM tasks WHERE run_id = ?1 ORDER BY sort_order ASC, task_id ASC",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
    }

    pub async fn list_pending_tasks(&self, run_id: &RunId, kind: TaskKind) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT task_id, run_id, kind, status, sort_order, attempts, last_error,
                document_id, payload, created_at, updated_at, started_at, completed_at
             FROM tasks WHERE run_id = ?1 AND kind = ?2 AND status = 'pending'
             ORDER BY sort_order ASC, task_id ASC",
        )?;
        let rows = stmt.query_map(params![run_id.as_str(), to_enum_str(&kind)?], row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
    }

    /// Boot-time recovery: every `running` task becomes `failed` with
    /// `reaped_on_boot`, and every `running` run becomes `failed`. Returns the reaped
    /// task and run ids so the caller can emit one structured event per row.
    pub async fn reap_running_tasks(&self) -> Result<(Vec<pc_types::TaskId>, Vec<RunId>), StoreError> {
        let conn = self.conn.lock().await;
        let now = to_rfc3339(Utc::now());

        let mut reaped_tasks = Vec::new();
        {
            let mut stmt = conn.prepare("SELECT task_id FROM tasks WHERE status = 'running'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                let raw = row?;
                reaped_tasks.push(
                    raw.parse::<pc_types::TaskId>()
                        .map_err(|_| StoreError::InvalidId(raw))?,
                );
            }
        }
        conn.execute(
            "UPDATE tasks SET status = 'failed', last_error = 'reaped_on_boot', updated_at = ?1, completed_at = ?1
             WHERE status = 'running'",
            params![now],
        )?;

        let mut reaped_runs = Vec::new();
        {
            let mut stmt = conn.prepare("SELECT run_id FROM runs WHERE status = 'running'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                let raw = row?;
                reaped_runs.push(raw.parse::<RunId>().map_err(|_| StoreError::InvalidId(raw))?);
            }
        }
        conn.execute(
            "UPDATE runs SET status = 'failed', updated_at = ?1, completed_at = ?1
             WHERE status = 'running'",
            params![now],
        )?;

        Ok((reaped_tasks, reaped_runs))
    }

    // -- artifacts -------------------------------------------------------------

    pub async fn insert_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO artifacts (artifact_id, run_id, document_id, generator, model_id,
                storage_location, content_hash, cost_usd, token_count, generation_ms, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                artifact.artifact_id.as_str(),
                artifact.run_id.as_str(),
                artifact.document_id.as_ref().map(|d| d.as_str()),
                to_enum_str(&artifact.generator)?,
                artifact.model_id,
                artifact.storage_location,
                artifact.content_hash,
                artifact.cost_usd,
                artifact.token_count as i64,
                artifact.generation_ms as i64,
                artifact.metadata.to_string(),
                to_rfc3339(artifact.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn list_artifacts_by_run(&self, run_id: &RunId) -> Result<Vec<Artifact>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT artifact_id, run_id, document_id, generator, model_id, storage_location,
                content_hash, cost_usd, token_count, generation_ms, metadata, created_at
             FROM artifacts WHERE run_id = ?1 ORDER BY artifact_id ASC",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], row_to_artifact)?;
        rows.collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
    }

    // -- evaluation --------------------------------------------------------

    pub async fn insert_evaluation_row(&self, row: &EvaluationRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO evaluation_rows (run_id, artifact_id, judge_model, dimension,
                iteration, score, rationale, failed_parse, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.run_id.as_str(),
                row.artifact_id.as_str(),
                row.judge_model,
                row.dimension,
                row.iteration,
                row.score,
                row.rationale,
                row.failed_parse as i64,
                to_rfc3339(row.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn list_evaluation_rows_by_run(&self, run_id: &RunId) -> Result<Vec<EvaluationRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_id, artifact_id, judge_model, dimension, iteration, score, rationale,
                failed_parse, created_at
             FROM evaluation_rows WHERE run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], row_to_evaluation_row)?;
        rows.collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
    }

    pub async fn insert_pairwise_result(&self, result: &PairwiseResult) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO pairwise_results (run_id, artifact_a, artifact_b, judge_model,
                iteration, winner, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                result.run_id.as_str(),
                result.artifact_a.as_str(),
                result.artifact_b.as_str(),
                result.judge_model,
                result.iteration,
                result.winner.map(|w| to_enum_str(&w)).transpose()?,
                to_rfc3339(result.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn list_pairwise_results_by_run(&self, run_id: &RunId) -> Result<Vec<PairwiseResult>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_id, artifact_a, artifact_b, judge_model, iteration, winner, created_at
             FROM pairwise_results WHERE run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], row_to_pairwise_result)?;
        rows.collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
    }

    /// Persists a pairwise outcome's Elo update for both sides in one write path.
    pub async fn upsert_elo_rating(&self, rating: &EloRating) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO elo_ratings (run_id, artifact_id, rating, games_played)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id, artifact_id) DO UPDATE SET rating = excluded.rating,
                games_played = excluded.games_played",
            params![
                rating.run_id.as_str(),
                rating.artifact_id.as_str(),
                rating.rating,
                rating.games_played,
            ],
        )?;
        Ok(())
    }

    pub async fn get_elo_rating(&self, run_id: &RunId, artifact_id: &pc_types::ArtifactId) -> Result<Option<EloRating>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT run_id, artifact_id, rating, games_played FROM elo_ratings
             WHERE run_id = ?1 AND artifact_id = ?2",
            params![run_id.as_str(), artifact_id.as_str()],
            row_to_elo_rating,
        )
        .optional()?
        .transpose()
    }

    /// Ranked leaderboard: rating desc, tie-break by `games_played` desc then
    /// `artifact_id` asc (spec supplement, see SPEC_FULL.md §C).
    pub async fn list_elo_ratings_ranked(&self, run_id: &RunId) -> Result<Vec<EloRating>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_id, artifact_id, rating, games_played FROM elo_ratings
             WHERE run_id = ?1
             ORDER BY rating DESC, games_played DESC, artifact_id ASC",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], row_to_elo_rating)?;
        rows.collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
    }
}

fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn from_rfc3339(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))
}

fn to_enum_str<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn from_enum_str<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(raw.to_string()))?)
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Result<Run, StoreError>> {
    Ok((|| {
        let tags: String = row.get(7)?;
        let started_at: Option<String> = row.get(12)?;
        let completed_at: Option<String> = row.get(13)?;
        Ok(Run {
            run_id: row.get::<_, String>(0)?.parse().map_err(|_| StoreError::InvalidId("run_id".into()))?,
            tenant_id: TenantId::new(row.get::<_, String>(1)?).map_err(StoreError::InvalidId)?,
            project_id: row.get(2)?,
            title: row.get(3)?,
            status: from_enum_str(&row.get::<_, String>(4)?)?,
            priority: row.get(5)?,
            config: serde_json::from_str(&row.get::<_, String>(6)?)?,
            tags: serde_json::from_str(&tags)?,
            requested_by: row.get(8)?,
            summary: row.get(9)?,
            created_at: from_rfc3339(&row.get::<_, String>(10)?)?,
            updated_at: from_rfc3339(&row.get::<_, String>(11)?)?,
            started_at: started_at.map(|s| from_rfc3339(&s)).transpose()?,
            completed_at: completed_at.map(|s| from_rfc3339(&s)).transpose()?,
        })
    })())
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Result<Document, StoreError>> {
    Ok((|| {
        let source: DocumentSource = serde_json::from_str(&row.get::<_, String>(1)?)?;
        Ok(Document {
            document_id: row
                .get::<_, String>(0)?
                .parse()
                .map_err(|_| StoreError::InvalidId("document_id".into()))?,
            source,
            content_hash: row.get(2)?,
            display_name: row.get(3)?,
            created_at: from_rfc3339(&row.get::<_, String>(4)?)?,
        })
    })())
}

fn row_to_run_document(row: &Row<'_>) -> rusqlite::Result<Result<RunDocument, StoreError>> {
    Ok((|| {
        let started_at: Option<String> = row.get(5)?;
        let completed_at: Option<String> = row.get(6)?;
        Ok(RunDocument {
            run_id: row.get::<_, String>(0)?.parse().map_err(|_| StoreError::InvalidId("run_id".into()))?,
            document_id: row
                .get::<_, String>(1)?
                .parse()
                .map_err(|_| StoreError::InvalidId("document_id".into()))?,
            status: from_enum_str::<RunDocumentStatus>(&row.get::<_, String>(2)?)?,
            sort_order: row.get(3)?,
            error_message: row.get(4)?,
            started_at: started_at.map(|s| from_rfc3339(&s)).transpose()?,
            completed_at: completed_at.map(|s| from_rfc3339(&s)).transpose()?,
        })
    })())
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Result<Task, StoreError>> {
    Ok((|| {
        let document_id: Option<String> = row.get(7)?;
        let started_at: Option<String> = row.get(11)?;
        let completed_at: Option<String> = row.get(12)?;
        Ok(Task {
            task_id: row.get::<_, String>(0)?.parse().map_err(|_| StoreError::InvalidId("task_id".into()))?,
            run_id: row.get::<_, String>(1)?.parse().map_err(|_| StoreError::InvalidId("run_id".into()))?,
            kind: from_enum_str::<TaskKind>(&row.get::<_, String>(2)?)?,
            status: from_enum_str::<TaskStatus>(&row.get::<_, String>(3)?)?,
            sort_order: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            document_id: document_id
                .map(|d| d.parse())
                .transpose()
                .map_err(|_| StoreError::InvalidId("document_id".into()))?,
            payload: serde_json::from_str(&row.get::<_, String>(8)?)?,
            created_at: from_rfc3339(&row.get::<_, String>(9)?)?,
            updated_at: from_rfc3339(&row.get::<_, String>(10)?)?,
            started_at: started_at.map(|s| from_rfc3339(&s)).transpose()?,
            completed_at: completed_at.map(|s| from_rfc3339(&s)).transpose()?,
        })
    })())
}

fn row_to_artifact(row: &Row<'_>) -> rusqlite::Result<Result<Artifact, StoreError>> {
    Ok((|| {
        let document_id: Option<String> = row.get(2)?;
        Ok(Artifact {
            artifact_id: row
                .get::<_, String>(0)?
                .parse()
                .map_err(|_| StoreError::InvalidId("artifact_id".into()))?,
            run_id: row.get::<_, String>(1)?.parse().map_err(|_| StoreError::InvalidId("run_id".into()))?,
            document_id: document_id
                .map(|d| d.parse())
                .transpose()
                .map_err(|_| StoreError::InvalidId("document_id".into()))?,
            generator: from_enum_str::<GeneratorKind>(&row.get::<_, String>(3)?)?,
            model_id: row.get(4)?,
            storage_location: row.get(5)?,
            content_hash: row.get(6)?,
            cost_usd: row.get(7)?,
            token_count: row.get::<_, i64>(8)? as u64,
            generation_ms: row.get::<_, i64>(9)? as u64,
            metadata: serde_json::from_str(&row.get::<_, String>(10)?)?,
            created_at: from_rfc3339(&row.get::<_, String>(11)?)?,
        })
    })())
}

fn row_to_evaluation_row(row: &Row<'_>) -> rusqlite::Result<Result<EvaluationRow, StoreError>> {
    Ok((|| {
        Ok(EvaluationRow {
            run_id: row.get::<_, String>(0)?.parse().map_err(|_| StoreError::InvalidId("run_id".into()))?,
            artifact_id: row
                .get::<_, String>(1)?
                .parse()
                .map_err(|_| StoreError::InvalidId("artifact_id".into()))?,
            judge_model: row.get(2)?,
            dimension: row.get(3)?,
            iteration: row.get(4)?,
            score: row.get(5)?,
            rationale: row.get(6)?,
            failed_parse: row.get::<_, i64>(7)? != 0,
            created_at: from_rfc3339(&row.get::<_, String>(8)?)?,
        })
    })())
}

fn row_to_pairwise_result(row: &Row<'_>) -> rusqlite::Result<Result<PairwiseResult, StoreError>> {
    Ok((|| {
        let winner: Option<String> = row.get(5)?;
        Ok(PairwiseResult {
            run_id: row.get::<_, String>(0)?.parse().map_err(|_| StoreError::InvalidId("run_id".into()))?,
            artifact_a: row
                .get::<_, String>(1)?
                .parse()
                .map_err(|_| StoreError::InvalidId("artifact_id".into()))?,
            artifact_b: row
                .get::<_, String>(2)?
                .parse()
                .map_err(|_| StoreError::InvalidId("artifact_id".into()))?,
            judge_model: row.get(3)?,
            iteration: row.get(4)?,
            winner: winner.map(|w| from_enum_str::<Winner>(&w)).transpose()?,
            created_at: from_rfc3339(&row.get::<_, String>(6)?)?,
        })
    })())
}

fn row_to_elo_rating(row: &Row<'_>) -> rusqlite::Result<Result<EloRating, StoreError>> {
    Ok((|| {
        Ok(EloRating {
            run_id: row.get::<_, String>(0)?.parse().map_err(|_| StoreError::InvalidId("run_id".into()))?,
            artifact_id: row
                .get::<_, String>(1)?
                .parse()
                .map_err(|_| StoreError::InvalidId("artifact_id".into()))?,
            rating: row.get(2)?,
            games_played: row.get(3)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pc_types::DocumentSource;

    fn sample_run() -> Run {
        Run::new(
            TenantId::new("tenant-a").unwrap(),
            "proj-1".to_string(),
            None,
            serde_json::json!({"generators": [{"kind": "fpf", "model_id": "m"}]}),
            vec!["smoke".to_string()],
            5,
            "user-1".to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn insert_then_get_round_trips_a_run() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let run = sample_run();
        store.insert_run(&run).await.unwrap();

        let loaded = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.tenant_id, run.tenant_id);
        assert_eq!(loaded.tags, run.tags);
    }

    #[tokio::test]
    async fn list_runs_filters_by_tenant_and_status() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let mut run_a = sample_run();
        store.insert_run(&run_a).await.unwrap();
        run_a.transition(RunStatus::Queued).unwrap();
        store.update_run(&run_a).await.unwrap();

        let run_b = sample_run();
        store.insert_run(&run_b).await.unwrap();

        let queued = store
            .list_runs(&run_a.tenant_id, Some(RunStatus::Queued), 10, 0)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].run_id, run_a.run_id);
    }

    #[tokio::test]
    async fn attaching_the_same_document_twice_is_rejected() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let run = sample_run();
        store.insert_run(&run).await.unwrap();

        let doc = Document::new(
            DocumentSource::Inline {
                content: b"hello".to_vec(),
                filename: "a.md".into(),
                mime: "text/markdown".into(),
            },
            None,
        )
        .unwrap();
        store.insert_document(&doc).await.unwrap();

        let run_doc = RunDocument {
            run_id: run.run_id,
            document_id: doc.document_id,
            status: RunDocumentStatus::Pending,
            sort_order: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
        };
        store.attach_run_document(&run_doc).await.unwrap();

        let err = store.attach_run_document(&run_doc).await.unwrap_err();
        assert!(matches!(err, StoreError::DocumentAlreadyAttached));
    }

    #[tokio::test]
    async fn reap_running_tasks_fails_running_tasks_and_runs() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let mut run = sample_run();
        store.insert_run(&run).await.unwrap();
        run.transition(RunStatus::Queued).unwrap();
        run.transition(RunStatus::Running).unwrap();
        store.update_run(&run).await.unwrap();

        let mut task = Task::new(run.run_id, TaskKind::GenerateFpf, 0, None, serde_json::json!({}));
        store.insert_task(&task).await.unwrap();
        task.mark_running();
        store.update_task(&task).await.unwrap();

        let (reaped_tasks, reaped_runs) = store.reap_running_tasks().await.unwrap();
        assert_eq!(reaped_tasks, vec![task.task_id]);
        assert_eq!(reaped_runs, vec![run.run_id]);

        let reloaded_task = store
            .list_tasks_by_run(&run.run_id)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(reloaded_task.status, TaskStatus::Failed);
        assert_eq!(reloaded_task.last_error.as_deref(), Some("reaped_on_boot"));

        let reloaded_run = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(reloaded_run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn elo_ratings_rank_by_rating_then_games_played_then_artifact_id() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let run = sample_run();
        store.insert_run(&run).await.unwrap();

        let a = pc_types::ArtifactId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = pc_types::ArtifactId::new();

        store
            .upsert_elo_rating(&EloRating {
                run_id: run.run_id,
                artifact_id: a,
                rating: 1500.0,
                games_played: 3,
            })
            .await
            .unwrap();
        store
            .upsert_elo_rating(&EloRating {
                run_id: run.run_id,
                artifact_id: b,
                rating: 1500.0,
                games_played: 5,
            })
            .await
            .unwrap();

        let ranked = store.list_elo_ratings_ranked(&run.run_id).await.unwrap();
        assert_eq!(ranked[0].artifact_id, b);
        assert_eq!(ranked[1].artifact_id, a);
    }
}
