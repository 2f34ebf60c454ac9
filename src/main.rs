//! Launches one pipeline stage as a broker consumer.
//!
//! Usage:
//!     trawl run-stage worker --width 3 --restart-after 10000

mod error;
mod logging;

use crate::error::{ErrorKind, Result};
use clap::{Args, Parser, Subcommand};
use exn::ResultExt;
use std::path::PathBuf;
use std::process::ExitCode;
use trawl_config::Settings;
use trawl_model::SourceManager;
use trawl_pipeline::{Pipeline, Stage};
use trawl_transport::{AmqpBroker, Runner, RunnerSettings, Transport};

#[derive(Parser, Debug)]
#[command(name = "trawl", version, about = "Scanning pipeline stages")]
struct Cli {
    /// Configuration file, instead of the usual `trawl.toml` locations
    #[arg(long, global = true, env = "TRAWL_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume messages for one stage until stopped
    RunStage(RunStage),
}

#[derive(Args, Debug)]
struct RunStage {
    /// explorer, processor, matcher, tagger or worker
    stage: Stage,

    /// Backend connections a single message may hold open at once
    #[arg(long, env = "WIDTH", default_value_t = 3)]
    width: usize,

    /// Stop after handling this many messages
    #[arg(long, env = "RESTART_AFTER", value_name = "COUNT")]
    restart_after: Option<u64>,

    /// Queue to consume from, most urgent first (repeatable)
    #[arg(long, env = "QUEUE_PRIORITY", value_delimiter = ',', action = clap::ArgAction::Append)]
    queue_priority: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match trawl_config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{err:?}");
            return ExitCode::FAILURE;
        }
    };
    let filter = match logging::init(&settings.logging) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("{err:?}");
            return ExitCode::FAILURE;
        }
    };
    let Command::RunStage(args) = cli.command;
    match run_stage(args, &settings, filter).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "stage failed");
            ExitCode::FAILURE
        }
    }
}

#[tracing::instrument(skip_all, fields(stage = %args.stage))]
async fn run_stage(args: RunStage, settings: &Settings, filter: logging::FilterHandle) -> Result<()> {
    let sm = SourceManager::new(args.width).with_http(settings.model.http());
    let pipeline = Pipeline::new(sm, settings.pipeline.clone());
    let prefetch_count = args.stage.prefetch_count(settings.amqp.prefetch_count);
    let broker = AmqpBroker::connect(&settings.amqp, prefetch_count).await.or_raise(|| ErrorKind::Connect)?;
    let transport = Transport::spawn(broker, settings.amqp.content_encoding);

    let runner_settings = RunnerSettings {
        restart_after: args.restart_after,
        queue_priority: args.queue_priority,
        ..RunnerSettings::default()
    };
    let handled = Runner::new(args.stage, &pipeline, transport, runner_settings)
        .on_log_level(filter.into_hook())
        .run(shutdown_signal())
        .await
        .or_raise(|| ErrorKind::Transport)?;
    tracing::info!(handled, "stage stopped");
    Ok(())
}

/// Completes on ctrl-c, or on SIGTERM where there is one.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("interrupted"),
        () = terminate => tracing::info!("terminated"),
    }
}
