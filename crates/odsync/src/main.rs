mod app;
mod config;
mod report;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use odsync_fetch::{CancelFlag, PlanRunner, ReqwestTransport};
use odsync_state::{read_plan, HistoryLog, SidecarStore};

use crate::app::{App, Commands};
use crate::config::{Config, LoggingConfig};

#[tokio::main]
async fn main() {
    let app = App::parse();
    let code = match run(app).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            40
        }
    };
    std::process::exit(code);
}

async fn run(app: App) -> anyhow::Result<i32> {
    let config = Config::load(app.config.as_deref())?;
    init_logging(&config.logging)?;

    match app.cmd {
        Commands::Run(args) => {
            let items = read_plan(&args.plan)
                .with_context(|| format!("reading plan {}", args.plan.display()))?;
            let runner = build_runner(&config)?;
            let summary = runner.run(items, args.dry_run).await;
            report::log_summary(&summary);
            Ok(summary.exit_code())
        }
        Commands::RetryFailed(args) => {
            let items = read_plan(&args.plan)
                .with_context(|| format!("reading plan {}", args.plan.display()))?;
            let runner = build_runner(&config)?;
            let summary = runner.retry_failed(items).await;
            report::log_summary(&summary);
            Ok(summary.exit_code())
        }
        Commands::History(args) => {
            let log = HistoryLog::in_state_dir(config.state_dir());
            for entry in log.tail(args.limit)? {
                let outcome = if entry.ok { "ok" } else { "failed" };
                println!(
                    "{}  {:<12} {:>7}  {:>10}  {}{}",
                    entry.start,
                    entry.strategy,
                    outcome,
                    report::format_bytes(entry.bytes),
                    entry.resource_url,
                    entry
                        .error
                        .map(|e| format!("  ({e})"))
                        .unwrap_or_default(),
                );
            }
            Ok(0)
        }
    }
}

fn build_runner(config: &Config) -> anyhow::Result<PlanRunner<ReqwestTransport>> {
    let transport = ReqwestTransport::new(&config.http)
        .map_err(|e| anyhow::anyhow!("building HTTP client: {e}"))?;

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight chunks before exit");
            handler_flag.cancel();
        }
    });

    Ok(PlanRunner::new(
        Arc::new(transport),
        Arc::new(SidecarStore::new()),
        Arc::new(HistoryLog::in_state_dir(config.state_dir())),
        Arc::new(config.downloader.clone()),
        cancel,
    ))
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    match &logging.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
    Ok(())
}
