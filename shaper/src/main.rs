//! CLI entry point.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use shaper::config::{listener_rules, parse_port_rewrite};
use shaper::dns::DnsCache;
use shaper::supervisor::run_listener;
use shaper::{AppError, Cli, ShaperConfig, Supervisor};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = ShaperConfig::from_cli(&cli);
    let rules = listener_rules(&cli)?;
    let port_rewrite = Arc::new(parse_port_rewrite(cli.mapports.as_deref())?);
    let desthost = cli.desthost.clone().map(Arc::new);
    let dns = Arc::new(DnsCache::new());
    let supervisor = Supervisor::new();
    let mode = cli.mode;

    let mut tasks = Vec::with_capacity(rules.len());
    for rule in rules {
        info!(%rule, "starting listener");
        tasks.push(tokio::spawn(run_listener(
            supervisor.clone(),
            rule,
            mode,
            config,
            desthost.clone(),
            port_rewrite.clone(),
            dns.clone(),
        )));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, closing listeners");
    supervisor.shutdown_all();

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(join_err) => {
                return Err(AppError::Config(format!("listener task panicked: {join_err}")))
            }
        }
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
