#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # autorobotd
//!
//! Sequence-driven test automation over interactive PTY sessions: a Session
//! Agent negotiates ssh/telnet/serial logins and reads command output, a
//! Sequence Worker drives one sequence file's commands through the agent for
//! some number of loop iterations, and a Master Scheduler spawns and tracks
//! worker processes when a sequence forks further workers via `NEW_WORKER`.
//!
//! ## Subcommands
//!
//! - `autorobotd run` — run one sequence file's worker in this process
//!   (debug / single-sequence mode; reports to a master over IPC if
//!   `AUTOROBOT_MASTER_SOCKET` is set in the environment)
//! - `autorobotd serve` — run as Master: spawn the sequence as a worker
//!   process and track it (and any workers it forks) until everything
//!   completes

mod agent;
mod config;
mod display;
mod error;
mod ipc;
mod master;
mod prompt;
mod pty;
mod sequence;
mod util;
mod worker;

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::Config;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "autorobotd", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sequence file's worker in this process.
    Run {
        /// Path to the sequence file to run.
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Number of loop iterations (default from config).
        #[arg(short = 'l', long = "loop")]
        loops: Option<u32>,
        /// Stop on the first expect failure.
        #[arg(short = 'S', long = "stop-on-failure")]
        stop_on_failure: bool,
        /// Enable per-worker transcript logging.
        #[arg(short = 'L', long = "log")]
        log: bool,
        /// Run single-process without forking a Master (same as the
        /// implicit behavior of `run`; kept for parity with the original
        /// tool's `-D` debug flag).
        #[arg(short = 'D', long = "debug")]
        debug: bool,
        #[arg(long)]
        config: Option<String>,
    },
    /// Run as Master: spawn the sequence as a worker process and track it.
    Serve {
        #[arg(short = 'f', long = "file")]
        file: String,
        #[arg(short = 'l', long = "loop")]
        loops: Option<u32>,
        #[arg(short = 'S', long = "stop-on-failure")]
        stop_on_failure: bool,
        #[arg(short = 'L', long = "log")]
        log: bool,
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, loops, stop_on_failure, log, debug: _, config } => {
            run_worker(&file, loops, stop_on_failure, log, config.as_deref()).await;
        }
        Commands::Serve { file, loops, stop_on_failure, log, config } => {
            run_master(&file, loops, stop_on_failure, log, config.as_deref()).await;
        }
    }
}

fn bootstrap(config: &mut Config, stop_on_failure: bool, log: bool) {
    if stop_on_failure {
        config.run.stop_on_failure = true;
    }
    if log {
        config.run.log_enabled = true;
    }
    for dir in ["test_sequences", "log", "log/failure", "log/errordump", "csvdump"] {
        let _ = std::fs::create_dir_all(dir);
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

fn load_and_validate(config_path: Option<&str>) -> Config {
    let config = Config::load(config_path);
    let errors = config.validate();
    if !errors.is_empty() {
        for err in &errors {
            eprintln!("config error: {err}");
        }
        std::process::exit(1);
    }
    config
}

async fn run_worker(file: &str, loops: Option<u32>, stop_on_failure: bool, log: bool, config_path: Option<&str>) {
    let mut config = load_and_validate(config_path);
    bootstrap(&mut config, stop_on_failure, log);
    init_tracing(&config);

    if !Path::new(file).exists() {
        error!(file, "sequence file not found");
        std::process::exit(1);
    }

    let loops = loops.unwrap_or(config.run.loop_iterations);
    let master_socket = std::env::var("AUTOROBOT_MASTER_SOCKET").ok();
    let config = Arc::new(config);

    info!(file, loops, "starting sequence worker");
    let mut worker = match worker::SequenceWorker::load(file, loops, Arc::clone(&config), master_socket) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to parse sequence file");
            std::process::exit(1);
        }
    };

    if let Err(e) = worker.run_all().await {
        error!(error = %e, "sequence worker exited with error");
        std::process::exit(1);
    }
}

async fn run_master(file: &str, loops: Option<u32>, stop_on_failure: bool, log: bool, config_path: Option<&str>) {
    let mut config = load_and_validate(config_path);
    bootstrap(&mut config, stop_on_failure, log);
    init_tracing(&config);

    if !Path::new(file).exists() {
        error!(file, "sequence file not found");
        std::process::exit(1);
    }

    let loops = loops.unwrap_or(config.run.loop_iterations);
    let config = Arc::new(config);

    info!(file, loops, "starting master scheduler");
    let mut master = match master::Master::spawn(file, loops, Arc::clone(&config)) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to start master scheduler");
            std::process::exit(1);
        }
    };

    if let Err(e) = master.run().await {
        error!(error = %e, "master scheduler exited with error");
        std::process::exit(1);
    }
}
