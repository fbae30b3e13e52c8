mod client;
mod config;
mod format;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use client::{ApiClient, ClientError};
use format::OutputFormat;
use pc_coordinator::RunCoordinator;
use pc_providers::HttpProviderClient;
use pc_ratelimit::{RateLimitTable, RateLimiter};
use pc_server::{AppState, CredentialTable};
use pc_store::MetadataStore;
use pc_types::TenantId;
use pc_vault::{KeyVault, MasterKey};
use pc_wire::{AttachDocumentRequest, AttachDocumentSpec, CreateRunRequest};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pipeline-engine")]
#[command(about = "Multi-tenant LLM pipeline coordinator")]
struct Cli {
    #[arg(long, global = true, env = "PIPELINE_ENGINE_STATE_DIR")]
    state_dir: Option<String>,

    #[arg(long, global = true, env = "PIPELINE_ENGINE_SERVER_URL")]
    server_url: Option<String>,

    #[arg(long, global = true, env = "PIPELINE_ENGINE_API_KEY")]
    api_key: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boots the HTTP API in-process.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run lifecycle operations.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
    /// Document attach/detach operations.
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },
    /// Evaluation status/results.
    Eval {
        #[command(subcommand)]
        action: EvalAction,
    },
    /// Local CLI settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum RunsAction {
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        project_id: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    Create {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        config: String,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        priority: Option<u8>,
    },
    Get {
        run_id: String,
    },
    Start {
        run_id: String,
    },
    Cancel {
        run_id: String,
    },
    Delete {
        run_id: String,
    },
    /// Polls a run's status until it reaches a terminal state.
    Watch {
        run_id: String,
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,
    },
}

#[derive(Subcommand, Debug)]
enum DocsAction {
    List {
        run_id: String,
    },
    Add {
        run_id: String,
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        git_ref: Option<String>,
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        display_name: Option<String>,
    },
    Remove {
        run_id: String,
        document_id: String,
    },
    Status {
        run_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum EvalAction {
    Status {
        run_id: String,
    },
    Results {
        run_id: String,
        #[arg(long)]
        sort_by: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
    Start {
        run_id: String,
    },
    Cancel {
        run_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
    },
    Init,
    Path,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = cli.format;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime builds")
        .block_on(run(cli, format))
}

async fn run(cli: Cli, format: OutputFormat) -> ExitCode {
    let state_dir = config::resolve_state_dir(cli.state_dir.clone());

    match dispatch(cli, format, &state_dir).await {
        Ok(()) => ExitCode::from(0),
        Err(AppError::Client(e)) if e.is_connection_failure() => {
            eprintln!("error: {e}");
            ExitCode::from(3)
        }
        Err(AppError::Interrupted) => ExitCode::from(130),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    #[error("interrupted")]
    Interrupted,
}

async fn dispatch(cli: Cli, format: OutputFormat, state_dir: &std::path::Path) -> Result<(), AppError> {
    match cli.command {
        Command::Serve { host, port } => {
            serve(state_dir, host, port).await.map_err(AppError::Other)
        }
        Command::Config { action } => handle_config(state_dir, action).map_err(AppError::Other),
        other => {
            let cfg = config::load(state_dir).map_err(AppError::Other)?;
            let server_url = cli.server_url.unwrap_or(cfg.server_url);
            let api_key = cli.api_key.or(cfg.api_key);
            let client = ApiClient::new(server_url, api_key);
            handle_remote(other, format, &client).await
        }
    }
}

fn handle_config(state_dir: &std::path::Path, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let cfg = config::load(state_dir)?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        ConfigAction::Get { key } => {
            let cfg = config::load(state_dir)?;
            match key.as_str() {
                "server_url" => println!("{}", cfg.server_url),
                "api_key" => println!("{}", cfg.api_key.unwrap_or_default()),
                other => anyhow::bail!("unknown config key: {other}"),
            }
        }
        ConfigAction::Set { key, value } => {
            let mut cfg = config::load(state_dir)?;
            match key.as_str() {
                "server_url" => cfg.server_url = value,
                "api_key" => cfg.api_key = Some(value),
                other => anyhow::bail!("unknown config key: {other}"),
            }
            config::save(state_dir, &cfg)?;
        }
        ConfigAction::Init => {
            config::save(state_dir, &config::CliConfig::default())?;
            println!("wrote {}", config::config_path(state_dir).display());
        }
        ConfigAction::Path => {
            println!("{}", config::config_path(state_dir).display());
        }
    }
    Ok(())
}

async fn handle_remote(command: Command, format: OutputFormat, client: &ApiClient) -> Result<(), AppError> {
    match command {
        Command::Runs { action } => handle_runs(action, format, client).await,
        Command::Docs { action } => handle_docs(action, format, client).await,
        Command::Eval { action } => handle_eval(action, format, client).await,
        Command::Serve { .. } | Command::Config { .. } => unreachable!("handled by caller"),
    }
}

async fn handle_runs(action: RunsAction, format: OutputFormat, client: &ApiClient) -> Result<(), AppError> {
    match action {
        RunsAction::List { status, project_id, limit, offset } => {
            let mut parts = vec![format!("limit={limit}"), format!("offset={offset}")];
            if let Some(s) = status {
                parts.push(format!("status={s}"));
            }
            if let Some(p) = project_id {
                parts.push(format!("project_id={p}"));
            }
            let list = client.list_runs(&parts.join("&")).await?;
            format::print_run_list(format, &list);
        }
        RunsAction::Create { project_id, title, config, tags, priority } => {
            let config_value: serde_json::Value = serde_json::from_str(&config)
                .context("--config must be valid JSON")
                .map_err(AppError::Other)?;
            let body = CreateRunRequest { project_id, title, config: config_value, tags, priority };
            let run = client.create_run(&body).await?;
            format::print_run(format, &run);
        }
        RunsAction::Get { run_id } => {
            let run = client.get_run(&run_id).await?;
            format::print_run(format, &run);
        }
        RunsAction::Start { run_id } => {
            let resp = client.start_run(&run_id).await?;
            format::print_json(&resp);
        }
        RunsAction::Cancel { run_id } => {
            let resp = client.cancel_run(&run_id).await?;
            format::print_json(&resp);
        }
        RunsAction::Delete { run_id } => {
            let resp = client.delete_run(&run_id).await?;
            format::print_json(&resp);
        }
        RunsAction::Watch { run_id, interval_secs } => {
            loop {
                let run = client.get_run(&run_id).await?;
                format::print_run(format, &run);
                if matches!(run.status.as_str(), "completed" | "failed" | "cancelled") {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(interval_secs)) => {}
                    _ = tokio::signal::ctrl_c() => return Err(AppError::Interrupted),
                }
            }
        }
    }
    Ok(())
}

async fn handle_docs(action: DocsAction, format: OutputFormat, client: &ApiClient) -> Result<(), AppError> {
    match action {
        DocsAction::List { run_id } | DocsAction::Status { run_id } => {
            let docs = client.list_documents(&run_id).await?;
            format::print_documents(format, &docs);
        }
        DocsAction::Add { run_id, repository, git_ref, path, file, display_name } => {
            let spec = if let Some(file) = file {
                let bytes = std::fs::read(&file).context("reading document file").map_err(AppError::Other)?;
                let filename = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "document".to_string());
                AttachDocumentSpec::Inline {
                    content_base64: base64_encode(&bytes),
                    filename,
                    mime: "application/octet-stream".to_string(),
                    display_name,
                }
            } else {
                let repository = repository.context("--repository is required without --file").map_err(AppError::Other)?;
                let git_ref = git_ref.context("--git-ref is required without --file").map_err(AppError::Other)?;
                let path = path.context("--path is required without --file").map_err(AppError::Other)?;
                AttachDocumentSpec::Stored { repository, git_ref, path, display_name }
            };
            let resp = client.attach_document(&run_id, &AttachDocumentRequest { spec }).await?;
            format::print_json(&resp);
        }
        DocsAction::Remove { run_id, document_id } => {
            let resp = client.detach_document(&run_id, &document_id).await?;
            format::print_json(&resp);
        }
    }
    Ok(())
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(bytes)
}

async fn handle_eval(action: EvalAction, format: OutputFormat, client: &ApiClient) -> Result<(), AppError> {
    match action {
        EvalAction::Status { run_id } => {
            let status = client.evaluate_status(&run_id).await?;
            format::print_evaluate_status(format, &status);
        }
        EvalAction::Results { run_id, sort_by, limit } => {
            let mut parts = Vec::new();
            if let Some(s) = sort_by {
                parts.push(format!("sort_by={s}"));
            }
            if let Some(l) = limit {
                parts.push(format!("limit={l}"));
            }
            let results = client.evaluate_results(&run_id, &parts.join("&")).await?;
            format::print_evaluate_results(format, &results);
        }
        EvalAction::Start { run_id } => {
            let resp = client.start_run(&run_id).await?;
            format::print_json(&resp);
        }
        EvalAction::Cancel { run_id } => {
            let resp = client.cancel_run(&run_id).await?;
            format::print_json(&resp);
        }
    }
    Ok(())
}

async fn serve(state_dir: &std::path::Path, host: String, port: u16) -> anyhow::Result<()> {
    let (_guard, _info) = pc_observability::init_logging(state_dir.join("logs"), "info")?;

    std::fs::create_dir_all(state_dir)?;

    let storage = Arc::new(pc_storage::LocalFsStorage::new(state_dir.join("storage")).await?);
    let master_key = MasterKey::load_or_create(state_dir.join("master.key")).await?;
    let vault = Arc::new(KeyVault::open(state_dir.join("vault.db"), master_key).await?);
    let store = Arc::new(MetadataStore::open(&state_dir.join("metadata.db")).await?);

    let provider_client = Arc::new(HttpProviderClient::new());
    let rate_limit_table = RateLimitTable::new(std::collections::HashMap::new());
    let limiter = Arc::new(RateLimiter::new(rate_limit_table, 4));

    let coordinator = Arc::new(RunCoordinator::new(
        store,
        vault,
        storage,
        limiter,
        provider_client.clone(),
        provider_client,
    ));
    coordinator.reap_on_boot().await?;

    let credentials = load_credentials(state_dir)?;
    let app_state = AppState::new(coordinator, credentials);

    let addr: SocketAddr = format!("{host}:{port}").parse().context("invalid host or port")?;
    info!("starting pipeline-engine on http://{addr}");
    pc_server::serve(addr, app_state).await
}

/// Reads tenant credentials from `<state_dir>/credentials.json`, a flat
/// `{"api_keys": {"<key>": "<tenant_id>"}, "service_secrets": ["<secret>"]}`
/// document an operator provisions out of band. Absent the file, the server
/// starts with an empty table (every request will fail auth) rather than
/// refusing to boot, matching the rest of this CLI's fail-open-on-missing-
/// config conventions.
fn load_credentials(state_dir: &std::path::Path) -> anyhow::Result<CredentialTable> {
    #[derive(serde::Deserialize, Default)]
    struct CredentialsFile {
        #[serde(default)]
        api_keys: std::collections::HashMap<String, String>,
        #[serde(default)]
        service_secrets: Vec<String>,
    }

    let path = state_dir.join("credentials.json");
    let parsed: CredentialsFile = match std::fs::read(&path) {
        Ok(raw) => serde_json::from_slice(&raw).context("parsing credentials.json")?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CredentialsFile::default(),
        Err(e) => return Err(e.into()),
    };

    let mut table = CredentialTable::new();
    for (key, tenant_id) in parsed.api_keys {
        let tenant_id = TenantId::new(tenant_id).map_err(|e| anyhow::anyhow!(e))?;
        table = table.with_api_key(key, tenant_id);
    }
    for secret in parsed.service_secrets {
        table = table.with_service_secret(secret);
    }
    Ok(table)
}
