//! Geofence gateway - location ingest, transition detection and alert dispatch
//!
//! Module structure:
//! - `domain/` - Core types (Site, Subject, LocationReport, GeofenceEvent)
//! - `io/` - External interfaces (ingest HTTP, JSONL logs, notifiers, site sources)
//! - `services/` - Business logic (Normalizer, Detector, Scheduler, Dispatcher)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use geofence_gateway::infra::{Config, DispatchMode, Metrics, SiteSourceMode};
use geofence_gateway::io::prometheus::{start_metrics_server, LiveGauges};
use geofence_gateway::io::{
    start_ingest_server, EventLog, HttpSites, IngestState, LogChannel, NotificationChannel,
    ReportLog, SiteSource, StaticSites, WebhookChannel,
};
use geofence_gateway::services::{
    create_dispatcher, CachedSiteIndex, ContainmentStore, DispatchSettings, Normalizer, Scheduler,
    SiteIndex, StaticDirectory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Geofence gateway - turns location fixes into enter/exit alerts
#[derive(Parser, Debug)]
#[command(name = "geofence-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file (else CONFIG_FILE, else config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

fn build_site_source(config: &Config) -> anyhow::Result<Box<dyn SiteSource>> {
    match config.site_source_mode() {
        SiteSourceMode::Static => Ok(Box::new(StaticSites::new(config.sites().to_vec()))),
        SiteSourceMode::Http => {
            let url = config
                .site_source_url()
                .ok_or_else(|| anyhow::anyhow!("site_source.url is required in http mode"))?;
            let timeout = Duration::from_millis(config.site_fetch_timeout_ms());
            Ok(Box::new(HttpSites::new(url, timeout)?))
        }
    }
}

fn build_channel(config: &Config) -> anyhow::Result<Arc<dyn NotificationChannel>> {
    match config.dispatch_mode() {
        DispatchMode::Log => Ok(Arc::new(LogChannel)),
        DispatchMode::Webhook => {
            let url = config
                .webhook_url()
                .ok_or_else(|| anyhow::anyhow!("dispatch.webhook_url is required in webhook mode"))?;
            let timeout = Duration::from_millis(config.dispatch_timeout_ms());
            Ok(Arc::new(WebhookChannel::new(url, timeout)?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("geofence-gateway starting");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        bind_address = %config.bind_address(),
        port = %config.server_port(),
        sites = %config.sites().len(),
        subjects = %config.subjects().len(),
        accuracy_ceiling_m = %config.accuracy_ceiling_m(),
        gap_fill = %config.gap_fill_enabled(),
        sweep_interval_secs = %config.sweep_interval_secs(),
        dispatch_mode = ?config.dispatch_mode(),
        site_source = ?config.site_source_mode(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Owned state: report log and event journal are replayed before serving
    let reports = Arc::new(ReportLog::open(config.reports_file()).await?);
    let events = Arc::new(EventLog::open(config.events_file()).await?);
    info!(
        subjects_with_reports = %reports.subject_count(),
        events = %events.len(),
        pending = %events.pending_count(),
        "state_restored"
    );

    let directory = Arc::new(StaticDirectory::from_config(&config));
    let index = Arc::new(CachedSiteIndex::new(
        build_site_source(&config)?,
        config.prefilter_margin_m(),
        Duration::from_secs(config.site_refresh_secs().max(1)),
        Duration::from_secs(config.site_max_stale_secs()),
    ));
    match index.snapshot().await {
        Ok(snapshot) => info!(sites = %snapshot.len(), "site_index_ready"),
        Err(e) => warn!(error = %e, "site_index_unavailable_at_start"),
    }

    // Dispatcher re-enqueues pending events from the journal on its first tick
    let (dispatch_sender, dispatcher) = create_dispatcher(
        config.dispatch_queue_size(),
        events.clone(),
        build_channel(&config)?,
        directory.clone(),
        DispatchSettings::from_config(&config),
        metrics.clone(),
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    let scheduler = Arc::new(Scheduler::new(
        &config,
        Arc::new(ContainmentStore::new()),
        index,
        reports,
        events,
        directory.clone(),
        dispatch_sender,
        metrics.clone(),
    ));
    let scheduler_handle = tokio::spawn(scheduler.clone().run(shutdown_rx.clone()));

    let gauge_scheduler = scheduler.clone();
    let gauges: LiveGauges = Arc::new(move || {
        (gauge_scheduler.reports().subject_count(), gauge_scheduler.store().inside_count())
    });

    // Start ingest server
    let ingest_state = Arc::new(IngestState {
        normalizer: Normalizer::new(directory.clone()),
        scheduler,
        metrics: metrics.clone(),
    });
    let bind_address = config.bind_address().to_string();
    let server_port = config.server_port();
    let ingest_shutdown = shutdown_rx.clone();
    let ingest_handle = tokio::spawn(async move {
        if let Err(e) = start_ingest_server(&bind_address, server_port, ingest_state, ingest_shutdown).await {
            error!(error = %e, "Ingest server error");
        }
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_gauges = gauges.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                start_metrics_server(prometheus_port, prom_metrics, prom_gauges, prom_shutdown).await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            let (active_subjects, inside_pairs) = gauges();
            metrics_clone.report(active_subjects, inside_pairs).log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    let _ = ingest_handle.await;
    let _ = scheduler_handle.await;
    let _ = dispatcher_handle.await;

    info!("geofence-gateway shutdown complete");
    Ok(())
}
