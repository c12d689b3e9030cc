use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use jobfarm::comm::{local::local_group, tcp, Rank};
use jobfarm::config::{EventLoopConfig, GroupConfig, PeerConfig};
use jobfarm::jobs::ShellJob;
use jobfarm::scheduler::JobRecord;
use jobfarm::shutdown::install_shutdown_handler;
use jobfarm::EventLoop;

#[derive(Parser, Debug)]
#[command(name = "jobfarm")]
#[command(version)]
#[command(about = "Distribute shell jobs from a master rank to worker ranks")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run master and workers as tasks inside this process
    Local(LocalArgs),

    /// Run one rank of a TCP group (start one process per rank)
    Member(MemberArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct LocalArgs {
    /// Number of worker ranks (the group has one more rank for the master)
    #[arg(long, short = 'w', default_value = "4")]
    workers: usize,

    #[command(flatten)]
    jobs: JobArgs,
}

#[derive(Parser, Debug)]
struct MemberArgs {
    /// Rank of this process within the group
    #[arg(long)]
    rank: Rank,

    /// Port to listen on for peers
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Peer addresses (comma-separated, format: "rank:host:port")
    /// Example: "0:10.0.0.1:7070,2:10.0.0.3:7070"
    #[arg(long, default_value = "")]
    peers: String,

    /// Give up joining the group after this long
    #[arg(long, default_value = "10000")]
    connect_timeout_ms: u64,

    #[command(flatten)]
    jobs: JobArgs,
}

#[derive(Parser, Debug)]
struct JobArgs {
    /// Shell command to run as a job (repeatable)
    #[arg(long = "command", short = 'c')]
    commands: Vec<String>,

    /// File with one shell command per line
    #[arg(long)]
    commands_file: Option<PathBuf>,

    /// Rank that hands out the jobs
    #[arg(long, default_value = "0")]
    master_rank: Rank,

    /// Log every dispatch at info level
    #[arg(long)]
    log_progress: bool,

    /// Fail if a worker stays silent this long (default: wait forever)
    #[arg(long)]
    worker_timeout_ms: Option<u64>,

    /// Heartbeat period of busy workers (0 disables heartbeats)
    #[arg(long, default_value = "500")]
    heartbeat_interval_ms: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobResultOutput {
    job_id: String,
    status: String,
    command: String,
    executed_by: Option<Rank>,
    exit_code: Option<i32>,
    running_time_ms: Option<u64>,
    output: Option<String>,
    error: Option<String>,
}

impl From<&JobRecord<ShellJob>> for JobResultOutput {
    fn from(record: &JobRecord<ShellJob>) -> Self {
        Self {
            job_id: record.id.to_string(),
            status: record.status.to_string(),
            command: record.job.command.clone(),
            executed_by: record.executed_by,
            exit_code: record.job.exit_code,
            running_time_ms: record.running_time.map(|d| d.as_millis() as u64),
            output: record.job.output.clone(),
            error: record.job.error.clone(),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            if parts.len() == 3 {
                let rank: Rank = parts[0].parse().ok()?;
                let host = parts[1];
                let port = parts[2];
                let addr = format!("{}:{}", host, port);
                Some(PeerConfig { rank, addr })
            } else {
                tracing::warn!(peer, "Invalid peer format, expected rank:host:port");
                None
            }
        })
        .collect()
}

fn load_jobs(args: &JobArgs) -> Result<Vec<ShellJob>, Box<dyn std::error::Error>> {
    let mut jobs: Vec<ShellJob> = args.commands.iter().map(ShellJob::new).collect();
    if let Some(path) = &args.commands_file {
        jobs.extend(ShellJob::load_file(path)?);
    }
    Ok(jobs)
}

fn event_loop_config(args: &JobArgs) -> EventLoopConfig {
    EventLoopConfig {
        master_rank: args.master_rank,
        log_progress: args.log_progress,
        worker_timeout_ms: args.worker_timeout_ms,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
    }
}

fn print_results(
    results: &[JobRecord<ShellJob>],
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            let output: Vec<JobResultOutput> = results.iter().map(JobResultOutput::from).collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if results.is_empty() {
                println!("No jobs completed.");
                return Ok(());
            }
            println!(
                "{:<36}  {:<8}  {:<4}  {:<4}  {:>8}  COMMAND",
                "JOB ID", "STATUS", "RANK", "EXIT", "TIME(ms)"
            );
            println!("{}", "-".repeat(80));
            for record in results {
                let rank = record
                    .executed_by
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let exit = record
                    .job
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let millis = record
                    .running_time
                    .map(|d| d.as_millis().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<36}  {:<8}  {:<4}  {:<4}  {:>8}  {}",
                    record.id, record.status, rank, exit, millis, record.job.command
                );
            }
            let failed = results.iter().filter(|r| !r.job.succeeded()).count();
            println!();
            println!("Total: {} jobs, {} failed", results.len(), failed);
        }
    }
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

async fn run_local(args: LocalArgs) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = load_jobs(&args.jobs)?;
    let config = event_loop_config(&args.jobs);
    let master_rank = config.master_rank;
    let shutdown = install_shutdown_handler();

    tracing::info!(
        workers = args.workers,
        jobs = jobs.len(),
        master_rank,
        "Starting local group"
    );

    let mut handles = Vec::new();
    for mut comm in local_group(args.workers + 1) {
        let rank = comm.rank();
        let event_loop = EventLoop::new(config.clone()).with_shutdown(shutdown.clone());
        let rank_jobs = if rank == master_rank {
            jobs.clone()
        } else {
            Vec::new()
        };
        handles.push(tokio::spawn(async move {
            let results = event_loop.run(&mut comm, rank_jobs).await;
            comm.close().await;
            results
        }));
    }

    let mut master_results = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        let results = handle.await??;
        if rank == master_rank {
            master_results = Some(results);
        }
    }

    match master_results {
        Some(results) => print_results(&results, &args.jobs.output),
        None => Err(format!("master rank {} is not part of the group", master_rank).into()),
    }
}

async fn run_member(args: MemberArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let group = GroupConfig {
        rank: args.rank,
        listen_addr,
        peers: parse_peers(&args.peers),
        connect_timeout_ms: args.connect_timeout_ms,
        ..GroupConfig::default()
    };

    let config = event_loop_config(&args.jobs);
    let jobs = if args.rank == config.master_rank {
        load_jobs(&args.jobs)?
    } else {
        Vec::new()
    };

    let mut comm = tcp::connect(&group).await?;
    let results = EventLoop::new(config.clone())
        .with_shutdown(install_shutdown_handler())
        .run(&mut comm, jobs)
        .await;
    comm.close().await;
    let results = results?;

    if args.rank == config.master_rank {
        print_results(&results, &args.jobs.output)?;
    } else {
        tracing::info!(rank = args.rank, jobs = results.len(), "Received results");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Local(args) => run_local(args).await,
        Commands::Member(args) => run_member(args).await,
    }
}
