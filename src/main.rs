use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use tool_dispatch::config::{DispatcherConfig, ServerConfig};
use tool_dispatch::scheduler::{JobId, JobRecord, JobStatus};
use tool_dispatch::shutdown::install_shutdown_handler;
use tool_dispatch::{Dispatcher, DispatcherHandle, StatusSnapshot, UploadedFile};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "tool-dispatch")]
#[command(version)]
#[command(about = "Queue shell-command jobs and run them on a fixed worker pool")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    dispatcher: DispatcherArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
struct DispatcherArgs {
    /// Tool-server configuration file (JSON)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Job root directory (overrides the config file)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Number of worker slots (overrides the config file)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Kill commands running longer than this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Read JSON-line requests from stdin and answer on stdout
    Serve,

    /// Submit one job, wait for it and print its result text
    Run {
        /// Command template, e.g. "wc -w INPUT1"
        #[arg(required_unless_present = "tool", conflicts_with = "tool")]
        template: Option<String>,

        /// Catalogued tool to run ("family/title"), requires --config
        #[arg(long)]
        tool: Option<String>,

        /// Literal input, as INPUTn=value (repeatable)
        #[arg(long = "field", short = 'f', value_parser = parse_key_value)]
        fields: Vec<(String, String)>,

        /// File input, as INPUTn=path (repeatable)
        #[arg(long = "file", value_parser = parse_key_path)]
        files: Vec<(String, PathBuf)>,
    },

    /// List pending and completed jobs
    Status {
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Print the result text of a completed job
    Result { job_id: JobId },

    /// Delete a completed job and its working directory
    Delete { job_id: JobId },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Line Protocol (serve)
// =============================================================================

#[derive(Deserialize, Debug)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServeRequest {
    Submit {
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        fields: BTreeMap<String, String>,
        /// input slot -> path of the file to upload
        #[serde(default)]
        files: BTreeMap<String, PathBuf>,
    },
    Status,
    Result {
        job_id: JobId,
    },
    Delete {
        job_id: JobId,
    },
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum ServeResponse {
    Submitted { job_id: JobId },
    Status(StatusOutput),
    Result { job_id: JobId, text: String },
    Deleted { deleted: JobId },
    Error { error: String },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize, Debug)]
struct JobOutput {
    job_id: JobId,
    status: String,
    command: String,
    tool: Option<String>,
    outcome: Option<String>,
    created_at_ms: i64,
    completed_at_ms: Option<i64>,
}

impl From<&JobRecord> for JobOutput {
    fn from(job: &JobRecord) -> Self {
        Self {
            job_id: job.id,
            status: job.status.to_string(),
            command: job.command.clone(),
            tool: job.tool.clone(),
            outcome: job.outcome.as_ref().map(|o| o.to_string()),
            created_at_ms: job.timestamp_millis(),
            completed_at_ms: job.completed_at.map(|t| t.timestamp_millis()),
        }
    }
}

#[derive(Serialize, Debug)]
struct StatusOutput {
    pending: Vec<JobOutput>,
    completed: Vec<JobOutput>,
}

impl From<&StatusSnapshot> for StatusOutput {
    fn from(snapshot: &StatusSnapshot) -> Self {
        Self {
            pending: snapshot.pending.values().map(JobOutput::from).collect(),
            completed: snapshot.completed.values().map(JobOutput::from).collect(),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected INPUTn=value, got {:?}", s))
}

fn parse_key_path(s: &str) -> Result<(String, PathBuf), String> {
    parse_key_value(s).map(|(k, v)| (k, PathBuf::from(v)))
}

fn load_configs(
    args: &DispatcherArgs,
) -> Result<(DispatcherConfig, Option<ServerConfig>), Box<dyn std::error::Error>> {
    let server = match &args.config {
        Some(path) => Some(ServerConfig::load(path)?),
        None => None,
    };

    let mut config = match &server {
        Some(server) => {
            tracing::info!(name = %server.name, "Loaded tool-server configuration");
            server.dispatcher_config()
        }
        None => DispatcherConfig::default(),
    };
    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(secs) = args.timeout_secs {
        config.job_timeout = Some(Duration::from_secs(secs));
    }
    config.validate()?;

    Ok((config, server))
}

async fn start_dispatcher(
    args: &DispatcherArgs,
) -> Result<DispatcherHandle, Box<dyn std::error::Error>> {
    let (config, server) = load_configs(args)?;
    let handle = Dispatcher::start(config).await?;
    Ok(match server {
        Some(server) => handle.with_tools(server),
        None => handle,
    })
}

async fn submit(
    handle: &DispatcherHandle,
    template: Option<String>,
    tool: Option<String>,
    fields: BTreeMap<String, String>,
    files: BTreeMap<String, PathBuf>,
) -> tool_dispatch::Result<JobId> {
    let uploads: Vec<UploadedFile> = files
        .into_iter()
        .map(|(input, path)| UploadedFile::from_path(input, path))
        .collect();

    match (tool, template) {
        (Some(tool), _) => handle.submit_tool(&tool, fields, uploads).await,
        (None, Some(template)) => handle.submit(template, fields, uploads).await,
        (None, None) => Err(tool_dispatch::DispatchError::InvalidTemplate(
            "either template or tool is required".to_string(),
        )),
    }
}

fn print_status_table(snapshot: &StatusSnapshot) {
    let jobs: Vec<&JobRecord> = snapshot
        .pending
        .values()
        .chain(snapshot.completed.values())
        .collect();

    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }

    println!("{:<8} {:<12} {:<28} COMMAND", "JOB ID", "STATUS", "OUTCOME");
    println!("{}", "-".repeat(78));
    for job in jobs {
        let outcome = job
            .outcome
            .as_ref()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        let cmd_display = if job.command.chars().count() > 30 {
            format!("{}...", job.command.chars().take(27).collect::<String>())
        } else {
            job.command.clone()
        };
        println!(
            "{:<8} {:<12} {:<28} {}",
            job.id, job.status, outcome, cmd_display
        );
    }
    println!();
    println!(
        "{} pending, {} completed",
        snapshot.pending.len(),
        snapshot.completed.len()
    );
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_serve(handle: DispatcherHandle) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    tracing::info!(root = %handle.root().display(), "Serving requests from stdin");

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => {
                    wait_until_idle(&handle, &shutdown).await?;
                    break;
                }
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ServeRequest>(&line) {
            Ok(request) => answer(&handle, request).await,
            Err(e) => ServeResponse::Error {
                error: format!("invalid request: {}", e),
            },
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    handle.shutdown().await?;
    Ok(())
}

async fn answer(handle: &DispatcherHandle, request: ServeRequest) -> ServeResponse {
    let result = match request {
        ServeRequest::Submit {
            template,
            tool,
            fields,
            files,
        } => submit(handle, template, tool, fields, files)
            .await
            .map(|job_id| ServeResponse::Submitted { job_id }),
        ServeRequest::Status => handle
            .status()
            .await
            .map(|s| ServeResponse::Status(StatusOutput::from(&s))),
        ServeRequest::Result { job_id } => handle
            .fetch_result_text(job_id)
            .await
            .map(|text| ServeResponse::Result { job_id, text }),
        ServeRequest::Delete { job_id } => handle
            .delete_completed(job_id)
            .await
            .map(|()| ServeResponse::Deleted { deleted: job_id }),
    };
    result.unwrap_or_else(|e| ServeResponse::Error {
        error: e.to_string(),
    })
}

/// Wait for queued and running jobs to finish, unless a signal arrives first.
async fn wait_until_idle(
    handle: &DispatcherHandle,
    shutdown: &tokio_util::sync::CancellationToken,
) -> tool_dispatch::Result<()> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = interval.tick() => {
                if handle.status().await?.pending.is_empty() {
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_run(
    handle: &DispatcherHandle,
    template: Option<String>,
    tool: Option<String>,
    fields: Vec<(String, String)>,
    files: Vec<(String, PathBuf)>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let job_id = submit(
        handle,
        template,
        tool,
        fields.into_iter().collect(),
        files.into_iter().collect(),
    )
    .await?;
    tracing::info!(job_id, "Submitted, waiting for completion");

    let job = handle.wait_for_completion(job_id, POLL_INTERVAL).await?;
    print!("{}", handle.fetch_result_text(job_id).await?);
    Ok(job.outcome.is_some_and(|o| o.is_success()))
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays clean for results and the serve protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let handle = start_dispatcher(&args.dispatcher).await?;

    match args.command {
        Commands::Serve => {
            handle_serve(handle).await?;
        }
        Commands::Run {
            template,
            tool,
            fields,
            files,
        } => {
            let succeeded = handle_run(&handle, template, tool, fields, files).await?;
            handle.shutdown().await?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Commands::Status { output } => {
            let snapshot = handle.status().await?;
            match output {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&StatusOutput::from(&snapshot))?
                    );
                }
                OutputFormat::Table => print_status_table(&snapshot),
            }
            handle.shutdown().await?;
        }
        Commands::Result { job_id } => {
            let job = handle.get_job(job_id).await?;
            if job.is_some_and(|j| j.status != JobStatus::Completed) {
                return Err(format!("job {} has not completed", job_id).into());
            }
            print!("{}", handle.fetch_result_text(job_id).await?);
            handle.shutdown().await?;
        }
        Commands::Delete { job_id } => {
            handle.delete_completed(job_id).await?;
            println!("Deleted job {}", job_id);
            handle.shutdown().await?;
        }
    }

    Ok(())
}
