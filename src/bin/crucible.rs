//! crucible: queue and run record export, import and purge jobs
//!
//! Works on a workspace directory holding `schema.json` (the type registry),
//! `store.json` (the object store) and `jobs.json` (job records). Export
//! artifacts land in the configured export directory below it.
//!
//! Usage:
//!   # Queue an export of every Article with its comments
//!   crucible -w ./site export Article --format csv --depth 1
//!
//!   # Queue an import and a purge
//!   crucible -w ./site import Article upload.zip --format json
//!   crucible -w ./site purge Article --filter "Title LIKE 'draft-%'"
//!
//!   # Process everything that is queued, then fetch the export
//!   crucible -w ./site run
//!   crucible -w ./site download <JOB_ID> --output articles.zip

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crucible::gauge::ProcessMemory;
use crucible::jobs::{resolve_download, JobRepository, JsonJobRepository, OwnerOnly};
use crucible::store::Snapshot;
use crucible::{
    EngineConfig, Format, Job, JobContext, JobId, JobKindTag, JobRequest, MemoryStore, Scheduler,
    SchemaInspector, TypeRegistry,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SCHEMA_FILE: &str = "schema.json";
const STORE_FILE: &str = "store.json";
const JOBS_FILE: &str = "jobs.json";

#[derive(Parser, Debug)]
#[command(name = "crucible")]
#[command(about = "Export, import and purge records in memory-bounded chunks", long_about = None)]
struct Args {
    /// Workspace directory
    #[arg(long, short = 'w', default_value = ".")]
    workspace: PathBuf,

    /// Engine configuration file (JSON)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the memory budget per chunk, in MiB
    #[arg(long)]
    memory_budget_mb: Option<u64>,

    /// Debug logging
    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every queued job (or every queued job of one kind)
    Run {
        #[arg(long)]
        kind: Option<KindArg>,
    },

    /// Queue an export job
    Export {
        target_type: String,
        #[arg(long, short = 'f', default_value = "csv")]
        format: Format,
        #[arg(long, short = 'd', default_value_t = 0)]
        depth: usize,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        owner: Option<String>,
    },

    /// Queue an import job for a file or zip bundle
    Import {
        target_type: String,
        source: PathBuf,
        #[arg(long, short = 'f', default_value = "csv")]
        format: Format,
        #[arg(long, short = 'd', default_value_t = 0)]
        depth: usize,
        #[arg(long)]
        owner: Option<String>,
    },

    /// Queue a purge job
    Purge {
        target_type: String,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show one job or list all of them
    Status { job: Option<JobId> },

    /// Resolve the artifact of a finished export
    Download {
        job: JobId,
        /// Principal requesting the download
        #[arg(long = "as")]
        principal: Option<String>,
        /// Copy the artifact here instead of printing its path
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Export,
    Import,
    Purge,
}

impl From<KindArg> for JobKindTag {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Export => JobKindTag::Export,
            KindArg::Import => JobKindTag::Import,
            KindArg::Purge => JobKindTag::Purge,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("crucible=debug,warn")
    } else {
        EnvFilter::new("crucible=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Loaded workspace: schema, configuration and job records
struct Workspace {
    dir: PathBuf,
    registry: Arc<TypeRegistry>,
    inspector: SchemaInspector,
    config: EngineConfig,
    jobs: JsonJobRepository,
}

impl Workspace {
    fn open(args: &Args) -> Result<Self> {
        let dir = args.workspace.clone();
        let schema_path = dir.join(SCHEMA_FILE);
        let registry: TypeRegistry = serde_json::from_slice(
            &fs::read(&schema_path).with_context(|| format!("Failed to read {}", schema_path.display()))?,
        )
        .context("Failed to parse type registry")?;
        registry.validate().context("Invalid type registry")?;
        let registry = Arc::new(registry);

        let mut config = match &args.config {
            Some(path) => serde_json::from_slice(
                &fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?,
            )
            .context("Failed to parse engine configuration")?,
            None => EngineConfig::default(),
        };
        if config.base_dir.is_relative() {
            config.base_dir = dir.join(&config.base_dir);
        }
        if let Some(mb) = args.memory_budget_mb {
            config.memory_budget_bytes = mb * 1024 * 1024;
        }
        config.validate()?;

        let jobs = JsonJobRepository::open(dir.join(JOBS_FILE)).context("Failed to load job records")?;

        Ok(Workspace {
            inspector: SchemaInspector::new(registry.clone()),
            dir,
            registry,
            config,
            jobs,
        })
    }

    fn load_store(&self) -> Result<MemoryStore> {
        let path = self.dir.join(STORE_FILE);
        let snapshot: Snapshot = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?).context("Failed to parse store snapshot")?
        } else {
            Snapshot::default()
        };
        Ok(MemoryStore::from_snapshot(self.registry.clone(), snapshot))
    }

    fn save_store(&self, store: &MemoryStore) -> Result<()> {
        let path = self.dir.join(STORE_FILE);
        let content = serde_json::to_vec_pretty(store.snapshot())?;
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn enqueue(&mut self, request: JobRequest) -> Result<()> {
        let job = Job::create(request, &self.inspector, &self.config)?;
        let id = job.id;
        self.jobs.insert(job)?;
        info!(job = %id, "job queued");
        println!("{}", id);
        Ok(())
    }
}

fn run(args: Args) -> Result<()> {
    let mut workspace = Workspace::open(&args)?;

    match args.command {
        Command::Run { kind } => {
            let mut store = workspace.load_store()?;
            let outcomes = {
                let context = JobContext {
                    inspector: &workspace.inspector,
                    store: &mut store,
                    config: &workspace.config,
                    gauge: &ProcessMemory,
                };
                let mut scheduler = Scheduler::new(context, &mut workspace.jobs);
                match kind {
                    Some(kind) => scheduler.run_pending(kind.into()),
                    None => scheduler.run_all(),
                }
            };
            workspace.save_store(&store)?;

            for outcome in &outcomes {
                let mark = if outcome.success { "ok" } else { "FAILED" };
                println!("{} {} {}: {}", outcome.id, outcome.kind, mark, outcome.message);
            }
            if outcomes.is_empty() {
                println!("No pending jobs");
            }
        }

        Command::Export {
            target_type,
            format,
            depth,
            filter,
            owner,
        } => {
            let mut request = JobRequest::new(JobKindTag::Export, target_type, format).depth(depth);
            request.filter = filter;
            request.owner = owner;
            workspace.enqueue(request)?;
        }

        Command::Import {
            target_type,
            source,
            format,
            depth,
            owner,
        } => {
            let source = fs::canonicalize(&source)
                .with_context(|| format!("Failed to resolve {}", source.display()))?;
            let mut request = JobRequest::new(JobKindTag::Import, target_type, format)
                .depth(depth)
                .source(source);
            request.owner = owner;
            workspace.enqueue(request)?;
        }

        Command::Purge {
            target_type,
            filter,
            owner,
        } => {
            let mut request = JobRequest::new(JobKindTag::Purge, target_type, Format::Csv);
            request.filter = filter;
            request.owner = owner;
            workspace.enqueue(request)?;
        }

        Command::Status { job } => {
            let jobs = match job {
                Some(id) => match workspace.jobs.get(id)? {
                    Some(job) => vec![job],
                    None => bail!("job {} not found", id),
                },
                None => workspace.jobs.all()?,
            };
            for job in &jobs {
                print_status(job);
            }
        }

        Command::Download {
            job,
            principal,
            output,
        } => {
            let download = resolve_download(
                &workspace.jobs,
                &workspace.config,
                job,
                principal.as_deref(),
                &OwnerOnly,
            )?;
            match output {
                Some(target) => {
                    copy_artifact(&download.path, &target)?;
                    println!("{} ({})", target.display(), download.content_type);
                }
                None => println!("{} ({})", download.path.display(), download.content_type),
            }
        }
    }

    Ok(())
}

fn print_status(job: &Job) {
    println!(
        "{}  {:<6} {:<16} {:<40} {}/{}{}",
        job.id,
        job.kind_tag(),
        job.target_type,
        job.status_message(),
        job.progress.completed,
        job.progress.total,
        job.info
            .as_deref()
            .map(|info| format!("  {}", info))
            .unwrap_or_default()
    );
}

fn copy_artifact(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    Ok(())
}
