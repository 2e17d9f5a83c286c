use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use labqueue::config::{CompileToolchain, DrcToolchain, QueueConfig};
use labqueue::node::WorkerNode;
use labqueue::scheduler::{JobSubmission, JobView, QueueClient};
use labqueue::shutdown::install_shutdown_handler;
use labqueue::store::{JobStore, RedisStore, StoreKeys};
use labqueue::strategy::report::summarize_report;
use labqueue::strategy::{
    BuildRequest, BuildSpec, CompileSpec, CompileStrategy, DrcSpec, DrcStrategy, RuleSet,
    StrategySet,
};

#[derive(Parser, Debug)]
#[command(name = "labqueue")]
#[command(version)]
#[command(about = "Build job queue for lab firmware compiles and PCB design-rule checks")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a worker pool and reaper against the shared store
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Summarise a KiCad DRC JSON report
    Report {
        /// Path to the report (drc_<rules>.json)
        path: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Shared job store URL
    #[arg(long, env = "LABQ_STORE_URL", default_value = "redis://127.0.0.1:6379")]
    store_url: String,

    /// Key prefix, so several deployments can share one store
    #[arg(long, env = "LABQ_NAMESPACE", default_value = "labqueue")]
    namespace: String,
}

impl StoreArgs {
    async fn connect(&self) -> Result<Arc<dyn JobStore>, Box<dyn std::error::Error>> {
        let store =
            RedisStore::connect(&self.store_url, StoreKeys::new(self.namespace.clone())).await?;
        Ok(Arc::new(store))
    }
}

#[derive(Parser, Debug)]
struct ClientArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Workers per pool, used for wait estimates
    #[arg(long, env = "LABQ_WORKERS", default_value = "8")]
    workers: usize,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Compile,
    Drc,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Number of concurrent build workers
    #[arg(long, env = "LABQ_WORKERS", default_value = "8")]
    workers: usize,

    /// Build kinds this pool serves
    #[arg(long, value_delimiter = ',', default_value = "compile,drc")]
    kinds: Vec<KindArg>,

    /// Heartbeat interval in seconds
    #[arg(long, env = "LABQ_HEARTBEAT_SECS", default_value = "2")]
    heartbeat_secs: u64,

    /// Seconds without a heartbeat before a job is failed
    #[arg(long, env = "LABQ_STALE_SECS", default_value = "30")]
    stale_secs: u64,

    /// Reaper sweep interval in seconds
    #[arg(long, env = "LABQ_REAPER_SECS", default_value = "5")]
    reaper_secs: u64,

    /// Wall-clock limit for one build, in seconds
    #[arg(long, env = "LABQ_MAX_RUNTIME_SECS", default_value = "60")]
    max_runtime_secs: u64,

    /// Longest single wait on the queue, in milliseconds
    #[arg(long, env = "LABQ_POLL_MS", default_value = "1000")]
    poll_ms: u64,

    // === Compile toolchain ===
    /// TI ARM clang installation
    #[arg(
        long,
        env = "TI_COMPILER_ROOT",
        default_value = "/opt/ti/ccs/tools/compiler/ti-cgt-armllvm_4.0.4.LTS"
    )]
    ti_compiler_root: PathBuf,

    /// MSPM0 SDK installation
    #[arg(long, env = "TI_SDK_ROOT", default_value = "/opt/ti/mspm0_sdk_2_09_00_01")]
    ti_sdk_root: PathBuf,

    /// Directory with one template sub-directory per lab
    #[arg(long, env = "LABQ_TEMPLATE_ROOT", default_value = "template_files")]
    template_root: PathBuf,

    // === DRC toolchain ===
    #[arg(long, env = "KICAD_CLI_PATH", default_value = "kicad-cli")]
    kicad_cli: PathBuf,

    #[arg(long, env = "RSVG_CONVERT_PATH", default_value = "rsvg-convert")]
    rsvg_convert: PathBuf,

    #[arg(long, env = "PYTHON_PATH", default_value = "python3")]
    python: PathBuf,

    /// Script converting DRC JSON into an HTML report
    #[arg(long, env = "DRC_REPORT_SCRIPT", default_value = "drc_report_generator.py")]
    drc_report_script: PathBuf,

    #[arg(long, env = "PCB_PREVIEW_DPI", default_value = "300")]
    preview_dpi: u32,
}

impl WorkerArgs {
    fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            poll_interval: Duration::from_millis(self.poll_ms),
            reaper_interval: Duration::from_secs(self.reaper_secs),
            ..QueueConfig::default()
        }
        .with_workers(self.workers)
        .with_heartbeat(
            Duration::from_secs(self.heartbeat_secs),
            Duration::from_secs(self.stale_secs),
        )
        .with_max_runtime(Duration::from_secs(self.max_runtime_secs))
    }

    fn strategies(&self) -> StrategySet {
        let mut set = StrategySet::new();
        if self.kinds.contains(&KindArg::Compile) {
            set = set.with(Arc::new(CompileStrategy::new(CompileToolchain {
                compiler_root: self.ti_compiler_root.clone(),
                sdk_root: self.ti_sdk_root.clone(),
                template_root: self.template_root.clone(),
                ..CompileToolchain::default()
            })));
        }
        if self.kinds.contains(&KindArg::Drc) {
            set = set.with(Arc::new(DrcStrategy::new(DrcToolchain {
                kicad_cli: self.kicad_cli.clone(),
                rsvg_convert: self.rsvg_convert.clone(),
                python: self.python.clone(),
                report_script: self.drc_report_script.clone(),
                preview_dpi: self.preview_dpi,
                ..DrcToolchain::default()
            })));
        }
        set
    }
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Queue a build for a prepared working directory
    Submit(SubmitArgs),
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// Cancel a job that has not started yet
    Cancel {
        job_id: Uuid,

        /// Student ID the job was submitted under
        #[arg(long)]
        owner: String,
    },
    /// List queued and running jobs
    List,
    /// Queue and worker counts
    Stats,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    #[arg(long, value_enum)]
    kind: KindArg,

    #[arg(long)]
    student_id: String,

    #[arg(long, default_value = "")]
    student_name: String,

    #[arg(long)]
    assignment_id: String,

    #[arg(long)]
    lab: String,

    /// Working directory holding the submission; deleted when the job ends
    #[arg(long)]
    work_dir: PathBuf,

    /// Where build outputs are copied
    #[arg(long)]
    publish_dir: Option<PathBuf>,

    // === compile ===
    /// Source files (comma-separated)
    #[arg(long, value_delimiter = ',')]
    sources: Vec<String>,

    #[arg(long, default_value = "firmware")]
    output_name: String,

    #[arg(long)]
    template_dir: Option<PathBuf>,

    // === drc ===
    /// Board file; defaults to the first *.kicad_pcb in the working directory
    #[arg(long)]
    pcb: Option<String>,

    /// Rule sets as FILE or FILE=LABEL; defaults to every *.kicad_dru
    #[arg(long = "rules")]
    rules: Vec<String>,
}

impl SubmitArgs {
    fn into_submission(self) -> JobSubmission {
        let spec = match self.kind {
            KindArg::Compile => BuildSpec::Compile(CompileSpec {
                source_files: self.sources,
                output_name: self.output_name,
                template_dir: self.template_dir,
            }),
            KindArg::Drc => BuildSpec::Drc(DrcSpec {
                pcb_file: self.pcb,
                rule_sets: self.rules.iter().map(String::as_str).map(parse_rule_set).collect(),
            }),
        };
        JobSubmission {
            student_id: self.student_id,
            student_name: self.student_name,
            assignment_id: self.assignment_id,
            lab_name: self.lab,
            request: BuildRequest {
                work_dir: self.work_dir,
                publish_dir: self.publish_dir,
                spec,
            },
        }
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
}

#[derive(Serialize)]
struct JobCancelOutput {
    success: bool,
    message: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

fn parse_rule_set(raw: &str) -> RuleSet {
    match raw.split_once('=') {
        Some((file, label)) => RuleSet::new(file.trim(), Some(label.trim().to_string())),
        None => RuleSet::new(raw.trim(), None),
    }
}

fn print_job_row(view: &JobView) {
    let record = &view.record;
    let position = if view.position > 0 {
        view.position.to_string()
    } else {
        "-".to_string()
    };
    println!(
        "{:<38} {:<10} {:<8} {:<6} {:<10} {}",
        record.job_id.to_string(),
        record.status.to_string(),
        record.kind.to_string(),
        position,
        record.student_id,
        record.lab_name
    );
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let config = args.queue_config();
    let strategies = args.strategies();

    tracing::info!(
        workers = config.worker_count,
        kinds = ?strategies.kinds(),
        max_runtime_secs = config.max_runtime.as_secs(),
        stale_after_secs = config.stale_after.as_secs(),
        "Starting labqueue worker"
    );

    let store = args.store.connect().await?;
    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone())?;

    WorkerNode::new(store, strategies, config)
        .run(shutdown)
        .await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    queue: &QueueClient,
    args: SubmitArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_id = queue.submit(args.into_submission()).await?;
    match output_format {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                job_id: job_id.to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    queue: &QueueClient,
    job_id: Uuid,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(view) = queue.status(&job_id).await? else {
        eprintln!("Error: Job {} not found", job_id);
        std::process::exit(1);
    };

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        OutputFormat::Table => {
            let record = &view.record;
            println!("Job ID:        {}", record.job_id);
            println!("Kind:          {}", record.kind);
            println!("Status:        {}", record.status);
            println!("Student:       {} ({})", record.student_name, record.student_id);
            println!("Lab:           {}", record.lab_name);
            if view.position > 0 {
                println!("Position:      {}", view.position);
            }
            if let Some(wait) = view.estimated_wait_secs {
                println!("Est. wait:     {}s", wait);
            }
            if let Some(result) = &record.result {
                if let Some(code) = result.exit_code {
                    println!("Exit Code:     {}", code);
                }
                if let Some(error) = &result.error {
                    println!("Error:         {}", error);
                }
                if !result.artifacts.is_empty() {
                    println!("Artifacts:     {}", result.artifacts.join(", "));
                }
                if !result.stdout.is_empty() {
                    println!("Output:");
                    for line in result.stdout.lines() {
                        println!("  {}", line);
                    }
                }
                let stderr_is_error = result.error.as_deref() == Some(result.stderr.as_str());
                if !result.stderr.is_empty() && !stderr_is_error {
                    println!("Stderr:");
                    for line in result.stderr.lines() {
                        println!("  {}", line);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    queue: &QueueClient,
    job_id: Uuid,
    owner: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = queue.cancel(&job_id, owner).await?;
    match output_format {
        OutputFormat::Json => {
            let output = JobCancelOutput {
                success: outcome.success(),
                message: outcome.message(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if outcome.success() {
                println!("{}", outcome.message());
            } else {
                eprintln!("Error: {}", outcome.message());
            }
        }
    }
    if !outcome.success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_job_list(
    queue: &QueueClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = queue.list_active().await?;
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No queued or running jobs.");
            } else {
                println!(
                    "{:<38} {:<10} {:<8} {:<6} {:<10} LAB",
                    "JOB ID", "STATUS", "KIND", "POS", "STUDENT"
                );
                println!("{}", "-".repeat(84));
                for view in &jobs {
                    print_job_row(view);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_stats(
    queue: &QueueClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let stats = queue.stats().await?;
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Table => {
            println!("Queued:    {}", stats.queued);
            println!("Compiling: {}", stats.compiling);
            println!("Workers:   {}", stats.workers);
        }
    }
    Ok(())
}

async fn handle_report(
    path: PathBuf,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let summary = summarize_report(&path).await?;
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Table => {
            println!("{}: {}", path.display(), summary);
            for (kind, count) in summary.errors_by_type() {
                println!("  {:<28} {}", kind, count);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Job { client, command } => {
            init_tracing("warn");
            let store = client.store.connect().await?;
            let config = QueueConfig::default().with_workers(client.workers);
            let queue = QueueClient::new(store, &config);

            match command {
                JobCommands::Submit(submit) => {
                    handle_job_submit(&queue, submit, &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&queue, job_id, &client.output).await?;
                }
                JobCommands::Cancel { job_id, owner } => {
                    handle_job_cancel(&queue, job_id, &owner, &client.output).await?;
                }
                JobCommands::List => {
                    handle_job_list(&queue, &client.output).await?;
                }
                JobCommands::Stats => {
                    handle_job_stats(&queue, &client.output).await?;
                }
            }
        }
        Commands::Report { path, output } => {
            handle_report(path, &output).await?;
        }
    }

    Ok(())
}
