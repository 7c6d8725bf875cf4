//! # Reindex Entry Point
//!
//! `reindex serve` runs the status API and the execution reconciler;
//! `reindex worker` is what an execution unit runs; the remaining commands
//! are operator controls over the shared job registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use reindex::{
    config::{AppConfig, ConfigLoader, ExecutionSubstrate},
    copier::BatchCopier,
    db,
    dispatcher::{
        ExecutionBackend, ExecutionDispatcher, ExecutionStatus, LocalExecutionBackend,
        ProcessExecutionBackend,
    },
    models::{
        CollectionRef, FieldSelection, FieldTransform, JobState, JobStatus, ReindexFilters,
        ReindexJobSpec,
    },
    registry::{DatabaseJobRegistry, JobRegistry},
    server::run_server,
    solr::{SolrClient, schema_unique_key},
    telemetry,
    worker::ReindexWorker,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Bulk Solr reindexing with resumable, isolated execution units
#[derive(Parser, Debug)]
#[command(name = "reindex")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the status API and reconcile execution units
    Serve,
    /// Create a reindex job and launch its first execution unit
    Submit(SubmitArgs),
    /// Run one execution unit for a job (launched by the dispatcher)
    Worker {
        #[arg(long)]
        job_id: Uuid,
        #[arg(long)]
        execution_id: Uuid,
    },
    /// Print a job's state as JSON
    Status { job_id: Uuid },
    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
    /// Ask a running job to stop after its current batch
    Pause { job_id: Uuid },
    /// Continue a paused job
    Resume {
        job_id: Uuid,
        #[arg(long)]
        wait: bool,
    },
    /// Mark a job failed with a cancelled cause
    Cancel { job_id: Uuid },
    /// Create a new job continuing a failed one from its last cursor
    ResumeFailed {
        job_id: Uuid,
        #[arg(long)]
        wait: bool,
    },
    /// Run one reconcile pass and exit
    Reconcile,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Source Solr base URL, e.g. http://solr:8983/solr
    #[arg(long)]
    source_url: String,
    #[arg(long)]
    source: String,
    /// Target Solr base URL (defaults to the source URL)
    #[arg(long)]
    target_url: Option<String>,
    #[arg(long)]
    target: String,
    /// Main query (defaults to *:*)
    #[arg(long)]
    query: Option<String>,
    /// Filter query; repeatable
    #[arg(long = "fq")]
    filter_queries: Vec<String>,
    /// Comma-separated fields to copy (defaults to all stored fields)
    #[arg(long, value_delimiter = ',')]
    fields: Vec<String>,
    /// Field rename as old=new; repeatable
    #[arg(long = "rename")]
    renames: Vec<String>,
    /// Field to drop before writing; repeatable
    #[arg(long = "drop")]
    drop_fields: Vec<String>,
    #[arg(long)]
    batch_size: Option<u32>,
    #[arg(long)]
    max_retries: Option<u32>,
    /// Sort field to page by (defaults to the unique key)
    #[arg(long)]
    sort_field: Option<String>,
    /// Unique key field (defaults to the source schema's uniqueKey)
    #[arg(long)]
    unique_key: Option<String>,
    /// Block until the execution unit exits
    #[arg(long)]
    wait: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;
    info!(profile = %config.profile, "Configuration loaded");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Effective configuration");
    }
    let config = Arc::new(config);

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::migrate(&db).await?;
    db::health_check(&db).await?;
    let registry: Arc<dyn JobRegistry> = Arc::new(DatabaseJobRegistry::new(db));

    match cli.command {
        Command::Serve => {
            let dispatcher = build_dispatcher(&config, Arc::clone(&registry))?;
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    signal.cancel();
                }
            });
            run_server(config, registry, Some(dispatcher), shutdown)
                .await
                .map_err(|err| anyhow::anyhow!("server error: {}", err))?;
        }
        Command::Submit(args) => {
            let mut parts = args.job_spec_parts()?;
            if parts.unique_key.is_none() {
                let solr = solr_client(&config)?;
                let unique_key = schema_unique_key(&solr, &parts.source).await?;
                info!(collection = %parts.source, unique_key = %unique_key, "Resolved schema unique key");
                parts.unique_key = Some(unique_key);
            }
            let spec = build_spec(&config, parts)?;
            let dispatcher = build_dispatcher(&config, registry)?;
            let handle = dispatcher.submit(spec).await?;
            println!("{}", serde_json::to_string_pretty(&handle)?);
            if args.wait || must_wait(&config) {
                finish(&dispatcher, handle).await?;
            }
        }
        Command::Worker {
            job_id,
            execution_id,
        } => {
            let worker = build_worker(&config, registry)?;
            if let Ok(name) = std::env::var("REINDEX_EXECUTION_NAME") {
                info!(execution = %name, job_id = %job_id, "Execution unit starting");
            }
            let cancel = CancellationToken::new();
            let signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping after the current batch");
                    signal.cancel();
                }
            });

            let state = worker.run(job_id, execution_id, cancel).await?;
            print_state(&state)?;
            if state.status == JobStatus::Failed {
                bail!("job {} failed", job_id);
            }
        }
        Command::Status { job_id } => {
            print_state(&registry.get(job_id).await?)?;
        }
        Command::List { status, limit } => {
            let status = status
                .map(|s| s.parse::<JobStatus>())
                .transpose()
                .context("parsing --status")?;
            for job in registry.list(status, limit).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    job.id, job.status, job.docs_copied, job.spec.target
                );
            }
        }
        Command::Pause { job_id } => {
            let dispatcher = build_dispatcher(&config, registry)?;
            print_state(&dispatcher.pause(job_id).await?)?;
        }
        Command::Resume { job_id, wait } => {
            let dispatcher = build_dispatcher(&config, Arc::clone(&registry))?;
            match dispatcher.resume(job_id).await? {
                Some(handle) => {
                    println!("{}", serde_json::to_string_pretty(&handle)?);
                    if wait || must_wait(&config) {
                        finish(&dispatcher, handle).await?;
                    }
                }
                None => print_state(&registry.get(job_id).await?)?,
            }
        }
        Command::Cancel { job_id } => {
            let dispatcher = build_dispatcher(&config, registry)?;
            print_state(&dispatcher.cancel_job(job_id).await?)?;
        }
        Command::ResumeFailed { job_id, wait } => {
            let resumed = registry.create_resume(job_id).await?;
            let dispatcher = build_dispatcher(&config, registry)?;
            let handle = dispatcher.dispatch(resumed).await?;
            println!("{}", serde_json::to_string_pretty(&handle)?);
            if wait || must_wait(&config) {
                finish(&dispatcher, handle).await?;
            }
        }
        Command::Reconcile => {
            let dispatcher = build_dispatcher(&config, registry)?;
            let stats = dispatcher.reconcile_all().await?;
            info!(
                examined = stats.examined,
                marked_lost = stats.marked_lost,
                "Reconcile pass finished"
            );
        }
    }

    Ok(())
}

struct SpecParts {
    source: CollectionRef,
    target: CollectionRef,
    filters: ReindexFilters,
    field_selection: FieldSelection,
    transform: FieldTransform,
    batch_size: Option<u32>,
    max_retries: Option<u32>,
    sort_field: Option<String>,
    unique_key: Option<String>,
}

impl SubmitArgs {
    fn job_spec_parts(&self) -> Result<SpecParts> {
        let source = CollectionRef::new(&self.source_url, &self.source)?;
        let target_url = self.target_url.as_deref().unwrap_or(&self.source_url);
        let target = CollectionRef::new(target_url, &self.target)?;

        let mut renames = BTreeMap::new();
        for rename in &self.renames {
            let Some((from, to)) = rename.split_once('=') else {
                bail!("--rename expects old=new, got '{}'", rename);
            };
            renames.insert(from.trim().to_string(), to.trim().to_string());
        }

        let field_selection = if self.fields.is_empty() {
            FieldSelection::All
        } else {
            FieldSelection::Fields {
                fields: self.fields.clone(),
            }
        };

        Ok(SpecParts {
            source,
            target,
            filters: ReindexFilters {
                query: self.query.clone().unwrap_or_default(),
                filter_queries: self.filter_queries.clone(),
            },
            field_selection,
            transform: FieldTransform {
                renames,
                drop_fields: self.drop_fields.clone(),
            },
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            sort_field: self.sort_field.clone(),
            unique_key: self.unique_key.clone(),
        })
    }
}

fn build_spec(config: &AppConfig, parts: SpecParts) -> Result<ReindexJobSpec> {
    let mut retry = config.retry.policy();
    if let Some(max_retries) = parts.max_retries {
        retry.max_retries = max_retries;
    }

    let mut spec = ReindexJobSpec::new(parts.source, parts.target)
        .with_filters(parts.filters)
        .with_transform(parts.transform)
        .with_batch_size(parts.batch_size.unwrap_or(config.default_batch_size))
        .with_retry(retry);
    spec.field_selection = parts.field_selection;
    if let Some(unique_key) = parts.unique_key {
        spec = spec
            .with_sort_field(unique_key.clone())
            .with_unique_key(unique_key);
    }
    if let Some(sort_field) = parts.sort_field {
        spec = spec.with_sort_field(sort_field);
    }
    Ok(spec)
}

fn solr_client(config: &AppConfig) -> Result<SolrClient> {
    SolrClient::new(config.solr_auth.credentials(), config.solr_request_timeout())
        .context("building Solr client")
}

fn build_worker(config: &AppConfig, registry: Arc<dyn JobRegistry>) -> Result<ReindexWorker> {
    let solr = Arc::new(solr_client(config)?);
    let copier = BatchCopier::new(solr.clone(), solr);
    let liveness = config.dispatcher.settings().liveness_timeout;
    Ok(ReindexWorker::new(registry, copier).with_heartbeat_interval(liveness / 3))
}

fn build_dispatcher(
    config: &AppConfig,
    registry: Arc<dyn JobRegistry>,
) -> Result<Arc<ExecutionDispatcher>> {
    let backend: Arc<dyn ExecutionBackend> = match config.dispatcher.substrate {
        ExecutionSubstrate::Local => Arc::new(LocalExecutionBackend::new(build_worker(
            config,
            Arc::clone(&registry),
        )?)),
        ExecutionSubstrate::Process => match &config.dispatcher.worker_binary {
            Some(program) => Arc::new(ProcessExecutionBackend::new(program.clone())),
            None => Arc::new(ProcessExecutionBackend::current_exe()?),
        },
    };
    Ok(Arc::new(ExecutionDispatcher::new(
        registry,
        backend,
        config.dispatcher.settings(),
    )))
}

/// In-process units die with this command, so the command has to outlive them.
fn must_wait(config: &AppConfig) -> bool {
    config.dispatcher.substrate == ExecutionSubstrate::Local
}

async fn finish(
    dispatcher: &ExecutionDispatcher,
    handle: reindex::dispatcher::ExecutionHandle,
) -> Result<()> {
    let status = dispatcher.wait(&handle).await?;
    let state = dispatcher.reconcile(handle.job_id).await?;
    print_state(&state)?;
    if status == ExecutionStatus::Failed || state.status == JobStatus::Failed {
        bail!("job {} did not complete", handle.job_id);
    }
    Ok(())
}

fn print_state(state: &JobState) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}
