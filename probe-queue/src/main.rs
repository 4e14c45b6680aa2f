//! Probe Queue CLI Application
//!
//! Runs worker loops against the shared store, submits checks on behalf of a
//! user, reports job and batch progress, and exposes the admin commands.

mod ui;

use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{ArgGroup, Args as ClapArgs, Parser, Subcommand};
use probe_queue_lib::{
    format_duration, parse_duration, Admin, CheckMode, CommandProbe, ConfigManager, Dispatcher,
    HealthReport, Probe, QueueConfig, RedisStore, Services, Submission, Worker,
};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

const MAX_WORKERS: usize = 64;

/// CLI arguments for probe-queue
#[derive(Parser, Debug)]
#[command(name = "probe-queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Sai Dutt G.V <gvs46@protonmail.com>")]
#[command(about = "Distributed queue, cache and rate limiter for domain checks")]
#[command(
    long_about = "Distributed queue, cache and rate limiter for domain checks.\n\nWorkers pull jobs from a shared Redis store, deduplicate identical checks, retry transient failures and publish reports for producers to poll."
)]
#[command(styles = STYLES)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Explicit configuration file
    #[arg(long = "config", value_name = "FILE", global = true, help_heading = "Configuration")]
    pub config: Option<PathBuf>,

    /// Redis connection URL (overrides config and PQ_REDIS_URL)
    #[arg(long = "redis-url", value_name = "URL", global = true, help_heading = "Configuration")]
    pub redis_url: Option<String>,

    /// Output results in JSON format
    #[arg(short = 'j', long = "json", global = true, help_heading = "Output Format")]
    pub json: bool,

    /// Show debug logging
    #[arg(short = 'v', long = "verbose", global = true, help_heading = "Debugging")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run worker loops until interrupted
    Worker(WorkerArgs),
    /// Submit domains to check on behalf of a user
    Submit(SubmitArgs),
    /// Show the result of a job or the progress of a batch
    Status(StatusArgs),
    /// Operational commands
    #[command(subcommand)]
    Admin(AdminCommand),
    /// Report store reachability, queue figures and worker liveness
    Health,
}

#[derive(ClapArgs, Debug)]
pub struct WorkerArgs {
    /// Worker id (defaults to worker-<pid>)
    #[arg(long = "id", value_name = "ID")]
    pub id: Option<String>,

    /// Number of worker loops in this process
    #[arg(short = 'c', long = "concurrency", default_value = "1")]
    pub concurrency: usize,

    /// Probe program and its arguments; {domain}, {port} and {mode} are substituted
    #[arg(
        long = "probe-cmd",
        value_name = "PROGRAM",
        num_args = 1..,
        allow_hyphen_values = true,
        required = true
    )]
    pub probe_cmd: Vec<String>,
}

#[derive(ClapArgs, Debug)]
pub struct SubmitArgs {
    /// Requesting user id
    #[arg(short = 'u', long = "user", value_name = "ID")]
    pub user: u64,

    /// Request the full report instead of the user's stored preference
    #[arg(long = "full")]
    pub full: bool,

    /// Wait for the report (or batch) to finish
    #[arg(short = 'w', long = "wait")]
    pub wait: bool,

    /// How long --wait may take (e.g. 90s, 5m)
    #[arg(long = "timeout", value_name = "DURATION", default_value = "5m")]
    pub timeout: String,

    /// Domains, URLs or host:port pairs
    #[arg(value_name = "DOMAINS", required = true)]
    pub domains: Vec<String>,
}

#[derive(ClapArgs, Debug)]
#[command(group(ArgGroup::new("target").required(true).args(["batch", "job"])))]
pub struct StatusArgs {
    /// Batch id returned by submit
    #[arg(long = "batch", value_name = "ID")]
    pub batch: Option<String>,

    /// Job id returned by submit
    #[arg(long = "job", value_name = "ID")]
    pub job: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum AdminCommand {
    /// Drop every pending job (in-flight jobs finish normally)
    ResetQueue,
    /// Remove every cached report
    ClearCache,
    /// Show a user's rate-limit counters, violations and ban
    Inspect {
        #[arg(value_name = "USER")]
        user: u64,
    },
    /// Clear a user's counters, violations and ban
    Pardon {
        #[arg(value_name = "USER")]
        user: u64,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    init_tracing(args.verbose);

    match run(args).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// Validate command line arguments
fn validate_args(args: &Args) -> Result<(), String> {
    match &args.command {
        Command::Worker(worker) => {
            if worker.concurrency == 0 || worker.concurrency > MAX_WORKERS {
                return Err(format!("Concurrency must be between 1 and {}", MAX_WORKERS));
            }
            if worker.probe_cmd.first().map_or(true, |p| p.trim().is_empty()) {
                return Err("--probe-cmd needs a program to run".to_string());
            }
        }
        Command::Submit(submit) => {
            if parse_duration(&submit.timeout).is_none() {
                return Err(format!(
                    "Invalid timeout '{}'. Use a number with ms, s, m, h or d",
                    submit.timeout
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Install the log subscriber on stderr; RUST_LOG wins over --verbose.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Resolve configuration: defaults < files < environment < CLI flags.
fn build_config(args: &Args) -> CliResult<QueueConfig> {
    let manager = ConfigManager::new(args.verbose);
    let mut config = manager.resolve(args.config.as_deref())?;
    if let Some(url) = &args.redis_url {
        config.store.redis_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn connect(config: QueueConfig) -> CliResult<Services> {
    let store = RedisStore::connect(&config.store.redis_url, &config.store.key_prefix).await?;
    Ok(Services::new(Arc::new(store), config))
}

/// Run the selected subcommand. `Ok(false)` means "exit non-zero quietly".
async fn run(args: Args) -> CliResult<bool> {
    let config = build_config(&args)?;

    if let Command::Health = args.command {
        return run_health(config, args.json).await;
    }

    let services = connect(config).await?;
    match &args.command {
        Command::Worker(worker) => run_workers(services, worker).await.map(|_| true),
        Command::Submit(submit) => run_submit(services, submit, args.json).await,
        Command::Status(status) => run_status(services, status, args.json).await,
        Command::Admin(command) => run_admin(services, command, args.json).await.map(|_| true),
        Command::Health => Ok(true),
    }
}

async fn run_workers(services: Services, args: &WorkerArgs) -> CliResult<()> {
    let (program, probe_args) = args
        .probe_cmd
        .split_first()
        .ok_or("--probe-cmd needs a program to run")?;
    let probe: Arc<dyn Probe> = Arc::new(CommandProbe::new(program.clone(), probe_args.to_vec()));

    let base_id = args
        .id
        .clone()
        .unwrap_or_else(|| format!("worker-{}", process::id()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!(
        workers = args.concurrency,
        visibility = %format_duration(services.config.queue.visibility_timeout),
        lease = %format_duration(services.config.lock.lease_ttl),
        "Starting workers"
    );

    let mut handles = Vec::with_capacity(args.concurrency);
    for i in 0..args.concurrency {
        let id = if args.concurrency == 1 {
            base_id.clone()
        } else {
            format!("{}-{}", base_id, i + 1)
        };
        let worker = Worker::new(id, services.clone(), probe.clone());
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, finishing current jobs");
    let _ = shutdown_tx.send(true);

    for joined in futures::future::join_all(handles).await {
        if let Err(e) = joined {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }
    Ok(())
}

async fn run_submit(services: Services, args: &SubmitArgs, json_output: bool) -> CliResult<bool> {
    let dispatcher = Dispatcher::new(services.clone());
    let mode = args.full.then_some(CheckMode::Full);
    let timeout = parse_duration(&args.timeout).unwrap_or(Duration::from_secs(300));
    let poll = services.config.queue.poll_interval;

    let submission = match dispatcher.submit(args.user, &args.domains.join(" "), mode).await {
        Ok(submission) => submission,
        Err(e) => {
            if json_output {
                println!(
                    "{}",
                    json!({ "error": e.to_string(), "message": e.user_message(), "retry_after_secs": e.retry_after().map(|d| d.as_secs().max(1)) })
                );
            } else {
                eprintln!("{}", e.user_message());
            }
            return Ok(false);
        }
    };

    match submission {
        Submission::Cached(report) => {
            if json_output {
                println!("{}", json!({ "cached": true, "report": report }));
            } else {
                ui::print_report(&report);
            }
            Ok(!report.is_error())
        }
        Submission::Queued(handle) => {
            if !args.wait {
                if json_output {
                    println!("{}", json!({ "job_id": handle.job_id, "fingerprint": handle.fingerprint }));
                } else {
                    println!("Queued job {} ({})", handle.job_id, handle.fingerprint);
                }
                return Ok(true);
            }

            let spinner = ui::Spinner::start(format!("Checking {}...", handle.fingerprint));
            let waited = handle.wait(&services.queue, timeout, poll).await;
            spinner.stop().await;

            let report = waited?;
            if json_output {
                println!("{}", json!({ "job_id": handle.job_id, "report": report }));
            } else {
                ui::print_report(&report);
            }
            Ok(!report.is_error())
        }
        Submission::Batch(batch_id) => {
            if args.wait {
                let spinner = ui::Spinner::start(format!("Waiting for batch {}...", batch_id));
                let started = tokio::time::Instant::now();
                loop {
                    let progress = dispatcher.batch_progress(&batch_id).await?;
                    if progress.finished || started.elapsed() >= timeout {
                        break;
                    }
                    tokio::time::sleep(poll).await;
                }
                spinner.stop().await;
            }

            let record = dispatcher.batch(&batch_id).await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                ui::print_batch(&record);
            }
            Ok(true)
        }
    }
}

async fn run_status(services: Services, args: &StatusArgs, json_output: bool) -> CliResult<bool> {
    let dispatcher = Dispatcher::new(services.clone());

    if let Some(batch_id) = &args.batch {
        let record = dispatcher.batch(batch_id).await?;
        if json_output {
            println!("{}", serde_json::to_string_pretty(&record)?);
        } else {
            ui::print_batch(&record);
        }
        return Ok(true);
    }

    let Some(job_id) = &args.job else {
        return Err("either --batch or --job is required".into());
    };

    match dispatcher.job_result(job_id).await? {
        Some(report) => {
            if json_output {
                println!("{}", json!({ "job_id": job_id, "status": "done", "report": report }));
            } else {
                ui::print_report(&report);
            }
            Ok(true)
        }
        None => {
            let Some(job) = services.queue.job(job_id).await? else {
                return Err(format!("job '{}' not found", job_id).into());
            };
            if json_output {
                println!("{}", json!({ "job_id": job_id, "status": "pending", "job": job }));
            } else {
                println!(
                    "Job {} ({}) is pending, claimed {} time(s)",
                    job.id,
                    job.fingerprint(),
                    job.attempt_count
                );
            }
            Ok(true)
        }
    }
}

async fn run_admin(services: Services, command: &AdminCommand, json_output: bool) -> CliResult<()> {
    let admin = Admin::new(services);

    match command {
        AdminCommand::ResetQueue => {
            let dropped = admin.reset_queue().await?;
            if json_output {
                println!("{}", json!({ "dropped": dropped }));
            } else {
                println!("Dropped {} pending job(s)", dropped);
            }
        }
        AdminCommand::ClearCache => {
            let removed = admin.clear_cache().await?;
            if json_output {
                println!("{}", json!({ "removed": removed }));
            } else {
                println!("Removed {} cached report(s)", removed);
            }
        }
        AdminCommand::Inspect { user } => {
            let state = admin.inspect_user(*user).await?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                ui::print_rate_state(&state);
            }
        }
        AdminCommand::Pardon { user } => {
            let removed = admin.pardon_user(*user).await?;
            if json_output {
                println!("{}", json!({ "user_id": user, "cleared_keys": removed }));
            } else {
                println!("Pardoned user {} ({} key(s) cleared)", user, removed);
            }
        }
    }
    Ok(())
}

/// Health never fails outright: an unreachable store is reported as unhealthy.
async fn run_health(config: QueueConfig, json_output: bool) -> CliResult<bool> {
    let report = match connect(config).await {
        Ok(services) => Admin::new(services).health().await,
        Err(e) => HealthReport {
            store_ok: false,
            store_error: Some(e.to_string()),
            queue_depth: 0,
            in_flight: 0,
            workers: Vec::new(),
        },
    };

    if json_output {
        println!(
            "{}",
            json!({ "healthy": report.is_healthy(), "report": report })
        );
    } else {
        ui::print_health(&report);
    }
    Ok(report.is_healthy())
}
