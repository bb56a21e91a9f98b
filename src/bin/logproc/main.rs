// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logproc::batch::DatetimeRange;
use logproc::init::agent::{Agent, TailOptions};
use logproc::init::args::{BatchArgs, LogFormatArg, TailArgs};
use logproc::init::batch::{BatchOptions, run_batch};
use logproc::init::config::{AppConfig, load_config};
use logproc::init::wait;

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Watch the configured log files
    Tail(Box<TailArgs>),

    /// Process the configured log files once
    Batch(Box<BatchArgs>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logproc")]
#[command(bin_name = "logproc")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGPROC_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Tail(args)) => {
            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            // configuration errors are fatal before any file is watched
            let config = match load_config(&args.config) {
                Ok(config) => config,
                Err(e) => {
                    error!(error = %e, "Invalid configuration.");
                    return ExitCode::from(1);
                }
            };

            let options = TailOptions {
                worklog_reset: args.worklog_reset,
                dry_run: args.dry_run,
            };
            if let Err(e) = run_agent(Agent::new(Box::new(config), options)) {
                error!(error = %e, "Failed to run tail.");
                return ExitCode::from(1);
            }
        }
        Some(Commands::Batch(args)) => {
            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            let loaded = load_config(&args.config).and_then(|config| {
                DatetimeRange::parse(args.from.as_deref(), args.to.as_deref())
                    .map(|range| (config, range))
            });
            let (config, range) = match loaded {
                Ok(loaded) => loaded,
                Err(e) => {
                    error!(error = %e, "Invalid configuration.");
                    return ExitCode::from(1);
                }
            };

            let options = BatchOptions {
                worklog_reset: args.worklog_reset,
                dry_run: args.dry_run,
                range,
            };
            if let Err(e) = run_batch_once(config, options) {
                error!(error = %e, "Failed to run batch.");
                return ExitCode::from(1);
            }
        }
        None => {
            // it shouldn't be possible to get here since we mark a subcommand as
            // required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_agent(agent: Agent) -> Result<(), BoxError> {
    let mut agent_join_set = JoinSet::new();

    let cancel_token = CancellationToken::new();
    {
        let token = cancel_token.clone();
        agent_join_set.spawn(async move { agent.run(token).await });
    }

    select! {
        res = signal_wait() => {
            res?;
            info!("Shutdown signal received.");
            cancel_token.cancel();
        },
        e = wait::wait_for_any_task(&mut agent_join_set) => {
            match e {
                Ok(()) => warn!("Unexpected early exit of agent."),
                Err(e) => return Err(e),
            }
        },
    }

    // The agent enforces its own, shorter, timeouts.
    wait::wait_for_tasks_with_timeout(&mut agent_join_set, Duration::from_secs(60)).await?;

    Ok(())
}

#[tokio::main]
async fn run_batch_once(config: AppConfig, options: BatchOptions) -> Result<(), BoxError> {
    let cancel_token = CancellationToken::new();
    let batch = run_batch(&config, options, cancel_token.clone());
    tokio::pin!(batch);

    let report = select! {
        res = &mut batch => res?,
        res = signal_wait() => {
            res?;
            info!("Shutdown signal received, finishing the current file.");
            cancel_token.cancel();
            batch.await?
        },
    };
    info!(
        files = report.num_files,
        lines = report.num_lines,
        written = report.written,
        failed = report.failed,
        "Batch finished"
    );
    if report.failed > 0 {
        return Err(format!("{} chunks were not written", report.failed).into());
    }
    Ok(())
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stdout().is_terminal();

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

async fn signal_wait() -> std::io::Result<()> {
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_int = signal(SignalKind::interrupt())?;

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
    Ok(())
}
