mod cli;
mod config;
mod error;
mod filter;
mod fs_util;
mod orchestrator;
mod store;
mod sync;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use colored::Colorize;
use config::SyncConfig;
use orchestrator::{Orchestrator, Shutdown};
use sync::output::{ConsoleObserver, JsonObserver, SyncObserver};
use sync::SyncEngine;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().as_str()));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    cli.validate()?;
    let config = SyncConfig::resolve(&cli)?;

    if !cli.quiet && !cli.json {
        println!("duosync v{}", env!("CARGO_PKG_VERSION"));
        println!("Syncing {} ⇄ {}", config.replica_a.display(), config.replica_b.display());
        println!(
            "Every {}, settle {}, state in {}",
            format_duration(config.interval),
            format_duration(config.settle),
            config.work_dir.display()
        );
        if !config.filter.is_empty() {
            println!(
                "Excluding {} patterns: {}",
                config.filter.rule_count(),
                config.filter.patterns().join(", ")
            );
        }
        println!("{}\n", "Press Ctrl-C to stop".bright_black());
    }

    let observer: Box<dyn SyncObserver> = if cli.json {
        Box::new(JsonObserver)
    } else {
        Box::new(ConsoleObserver::new(cli.quiet))
    };

    let shutdown = Shutdown::new();
    let engine = SyncEngine::new(&config, observer, shutdown.flag());

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, finishing the current item");
                shutdown.request();
            }
        }
    });

    let report = Orchestrator::new(engine, &config, shutdown).run().await;

    if !cli.quiet && !cli.json {
        let faults = if report.faults > 0 {
            format!(", {} abandoned", report.faults).red().to_string()
        } else {
            String::new()
        };
        let last = report
            .last
            .map(|stats| format!(" (last: {} applied, {} pending)", stats.applied, stats.pending))
            .unwrap_or_default();
        println!(
            "\n{} after {} cycles{}{}",
            "✓ Stopped".green().bold(),
            report.cycles,
            last,
            faults
        );
    }

    Ok(())
}

fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs >= 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        if mins >= 60 {
            let hours = mins / 60;
            let mins = mins % 60;
            format!("{}h {}m {}s", hours, mins, secs)
        } else {
            format!("{}m {}s", mins, secs)
        }
    } else if secs > 0 {
        format!("{}.{:03}s", secs, millis)
    } else {
        format!("{}ms", millis)
    }
}
