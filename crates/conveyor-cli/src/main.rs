use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use conveyor::config::{self, Config};
use conveyor::consumer::Consumer;
use conveyor::job::{self, CreateOptions};
use conveyor::queue::BrokerConnection;
use conveyor::runner::{JobRunner, Reporter};
use conveyor::stage::{HttpFetcher, PayloadStager, StagingArea};
use conveyor::submit::{self, SubmitReceipt};
use conveyor::transaction::{CvmfsServer, DryRunPublisher, Publisher};

#[derive(Parser, Debug)]
#[command(name = "conveyor", version)]
#[command(about = "Queue-driven publishing of payloads into CVMFS repositories")]
struct Cli {
    /// Configuration file (TOML, or JSON when it ends in .json)
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Describe a publish job and put it on the queue.
    Submit {
        /// Target repository, e.g. `example.cern.ch`
        repo: String,
        /// Payload archive URI (http, https or file), optionally with `?checksum=sha256:<hex>`
        payload: String,
        /// Subdirectory of the repository to unpack into
        #[arg(short, long, default_value = "/")]
        path: String,
        /// Transaction script: a local file to embed, or a reference with --remote-script
        #[arg(short, long)]
        script: Option<String>,
        /// Extra argument passed to the script after repo and path
        #[arg(long, allow_hyphen_values = true)]
        script_args: Option<String>,
        /// Send the script as a reference instead of embedding its contents
        #[arg(long)]
        remote_script: bool,
        /// Comma-separated ids of jobs this one depends on
        #[arg(short, long)]
        deps: Option<String>,
        /// Print the job description without publishing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Consume jobs and publish them until interrupted.
    Consume {
        /// Staging directory (overrides worker.temp_dir)
        #[arg(long)]
        temp_dir: Option<PathBuf>,
        /// Repository mount root (overrides worker.repository_root)
        #[arg(long)]
        repository_root: Option<PathBuf>,
        /// JSONL file receiving job events (overrides worker.events_file)
        #[arg(long)]
        events_file: Option<PathBuf>,
        /// Log publisher commands instead of running them
        #[arg(long)]
        mock: bool,
    },
    /// Print the effective configuration and tool availability.
    Check,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = config::load_config(&cli.config)?;
    cfg.apply_env_overrides();

    let mut reporter = CliReporter;

    match cli.cmd {
        Commands::Submit {
            repo,
            payload,
            path,
            script,
            script_args,
            remote_script,
            deps,
            dry_run,
        } => {
            let options = CreateOptions {
                script,
                remote_script,
                script_args,
                deps,
            };
            run_submit(&cfg, &repo, &payload, &path, &options, dry_run, &mut reporter)?;
        }
        Commands::Consume {
            temp_dir,
            repository_root,
            events_file,
            mock,
        } => {
            if let Some(dir) = temp_dir {
                cfg.worker.temp_dir = dir;
            }
            if let Some(root) = repository_root {
                cfg.worker.repository_root = root;
            }
            if events_file.is_some() {
                cfg.worker.events_file = events_file;
            }
            cfg.worker.mock |= mock;
            cfg.validate()?;
            run_consume(&cfg, &mut reporter)?;
        }
        Commands::Check => {
            cfg.validate()?;
            run_check(&cli.config, &cfg, &mut reporter);
        }
    }

    Ok(())
}

fn run_submit(
    cfg: &Config,
    repo: &str,
    payload: &str,
    path: &str,
    options: &CreateOptions,
    dry_run: bool,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let job = job::create(repo, payload, path, options)?;

    println!("Job description:");
    println!(
        "{}",
        serde_json::to_string_pretty(&job).context("failed to render job description")?
    );

    let receipt = if dry_run {
        reporter.info("dry run: not publishing");
        SubmitReceipt::ok(&job)
    } else {
        cfg.validate()?;
        submit::submit(&cfg.queue, &job, reporter)?
    };

    println!("Result:");
    println!("{}", serde_json::to_string(&receipt)?);
    Ok(())
}

fn run_consume(cfg: &Config, reporter: &mut dyn Reporter) -> Result<()> {
    let worker = &cfg.worker;

    let publisher: Box<dyn Publisher> = if worker.mock {
        reporter.warn("mock mode: repository transactions are not executed");
        Box::new(DryRunPublisher::new())
    } else {
        Box::new(CvmfsServer::new(worker.publisher_command.clone()))
    };

    let staging = StagingArea::create(&worker.temp_dir)?;
    let fetcher = HttpFetcher::new(worker.download_timeout)?;
    let stager = PayloadStager::new(staging, worker.repository_root.clone(), Box::new(fetcher));
    let mut consumer = Consumer::new(JobRunner::new(publisher, stager), worker.poll_interval)
        .with_events_file(worker.events_file.clone());

    let shutdown = consumer.shutdown_signal();
    ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
        .context("failed to install signal handler")?;

    let connection = BrokerConnection::open(&cfg.queue, reporter)?;
    let stats = {
        let mut source = connection.consume()?;
        reporter.info(&format!(
            "consuming {} (staging in {})",
            cfg.queue.new_job_queue,
            worker.temp_dir.display()
        ));
        consumer.run(&mut source, reporter)?
    };

    // Removes the staging area.
    drop(consumer);
    connection.close()?;

    reporter.info(&format!(
        "stopped: {} delivered, {} published, {} requeued, {} rejected",
        stats.delivered, stats.acked, stats.requeued, stats.rejected
    ));
    Ok(())
}

fn run_check(path: &Path, cfg: &Config, reporter: &mut dyn Reporter) {
    let source = if path.exists() { "file" } else { "defaults" };
    println!("config: {} ({source})", path.display());
    println!("broker: {}", cfg.queue.display_url());
    println!("exchange: {}", cfg.queue.new_job_exchange);
    println!("queue: {}", cfg.queue.new_job_queue);
    println!("routing_key: {:?}", cfg.queue.routing_key);
    println!("temp_dir: {}", cfg.worker.temp_dir.display());
    println!("repository_root: {}", cfg.worker.repository_root.display());
    println!("download_timeout: {}", humantime::format_duration(cfg.worker.download_timeout));
    if let Some(events) = &cfg.worker.events_file {
        println!("events_file: {}", events.display());
    }
    println!();

    if cfg.worker.mock {
        println!("publisher: {} (mock)", cfg.worker.publisher_command);
    } else {
        print_tool("publisher", &cfg.worker.publisher_command, reporter);
    }
    print_tool("tar", "tar", reporter);
}

fn print_tool(label: &str, program: &str, reporter: &mut dyn Reporter) {
    match conveyor_process::which(program) {
        Some(found) => println!("{label}: {}", found.display()),
        None => {
            println!("{label}: {program} (not found)");
            reporter.warn(&format!("{program} is not on PATH"));
        }
    }
}
