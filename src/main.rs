//! WAF abuse reporter CLI.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use waf_abuse_reporter::action_log::ActionLogStore;
use waf_abuse_reporter::clients::abuseipdb::AbuseIPDBSink;
use waf_abuse_reporter::clients::cloudflare::CloudflareSource;
use waf_abuse_reporter::clients::sefinek::SefinekApi;
use waf_abuse_reporter::clients::self_ip::HttpAddressResolver;
use waf_abuse_reporter::cooldown::format_delay;
use waf_abuse_reporter::decision::DecisionEngine;
use waf_abuse_reporter::self_address::SelfAddress;
use waf_abuse_reporter::{Config, Reporter, SyncExporter};

#[derive(Parser, Debug)]
#[command(name = "waf-abuse-reporter")]
#[command(about = "Report IPs blocked by the Cloudflare WAF to AbuseIPDB")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "waf-abuse-reporter.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Run a single cycle (and sync pass, if enabled) and exit
    #[arg(long)]
    once: bool,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let store = Arc::new(ActionLogStore::open(
        &config.action_log.path,
        config.action_log.max_bytes,
    )?);

    let resolver = HttpAddressResolver::new(config.self_ip.clone())?;
    let self_address = Arc::new(SelfAddress::new(Arc::new(resolver)));
    if let Err(e) = self_address.refresh().await {
        warn!(error = %e, "Could not resolve own IP address, it will not be filtered until the next refresh");
    }

    let settings = &config.settings;
    let engine = DecisionEngine::new(settings.cooldown_policy(), settings.max_uri_length);
    let reporter = Reporter::new(
        Arc::new(CloudflareSource::new(config.cloudflare.clone())?),
        Arc::new(AbuseIPDBSink::new(config.abuseipdb.clone())?),
        store.clone(),
        self_address.clone(),
        engine,
    )
    .with_success_cooldown(settings.success_cooldown())
    .with_cycle_interval(settings.cycle_interval());

    let exporter = if config.secondary_sync.enabled {
        let api = SefinekApi::new(config.secondary_sync.clone())?;
        Some(Arc::new(SyncExporter::new(
            store.clone(),
            Arc::new(api),
            self_address.clone(),
        )))
    } else {
        None
    };

    info!(
        log = %store.path().display(),
        cycle_interval = %format_delay(settings.cycle_interval()),
        cooldown = %format_delay(std::time::Duration::from_secs(settings.reported_ip_cooldown_seconds)),
        secondary_sync = exporter.is_some(),
        "WAF abuse reporter initialized"
    );

    if args.once {
        reporter.run_cycle().await;
        if let Some(exporter) = &exporter {
            exporter.sync_once().await;
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown requested, finishing current cycle");
            let _ = shutdown_tx.send(true);
        });
    }

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        self_address
            .clone()
            .run_refresher(settings.self_ip_refresh(), shutdown_rx.clone()),
    ));
    if let Some(exporter) = exporter {
        tasks.push(tokio::spawn(
            exporter.run(config.secondary_sync.interval(), shutdown_rx.clone()),
        ));
    }

    reporter.run(shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        task.await?;
    }

    info!("WAF abuse reporter stopped");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
