//! `upwatchd run`: wires every subsystem together and runs until Ctrl-C.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use upwatch_health::{HealthProber, NetworkPinger, StatusRecorder};
use upwatch_registry::{MqttSource, RosterConsumer, RosterReplica, memory_bus};
use upwatch_report::UptimeReconstructor;
use upwatch_scheduler::{CycleStats, DailyReport, HealthCycle, ProbeScheduler};
use upwatch_state::{Clock, SystemClock};

use crate::commands::{build_sink, open_store};
use crate::config::UpwatchConfig;

pub async fn run(config: UpwatchConfig) -> anyhow::Result<()> {
    info!(store = %config.store.path.display(), "upwatch daemon starting");

    let store = Arc::new(open_store(&config)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let zone = config.report.zone()?;
    let interval = config.probe.interval()?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Roster replica ─────────────────────────────────────────

    // The consumer starts before the snapshot read so that mutations
    // published meanwhile are buffered rather than lost. It is also the
    // only roster writer while the daemon holds the store.
    let replica = Arc::new(RosterReplica::new());
    let mut idle_bus = None;
    let consumer_handle = if config.bus.enabled {
        let source = MqttSource::connect(&config.bus.mqtt_settings());
        let consumer = RosterConsumer::new(source, Arc::clone(&replica)).with_store(store.clone());
        tokio::spawn(consumer.run(shutdown_rx.clone()))
    } else {
        info!("registry bus disabled, roster fixed at startup snapshot");
        let (publisher, source) = memory_bus(1);
        idle_bus = Some(publisher);
        tokio::spawn(RosterConsumer::new(source, Arc::clone(&replica)).run(shutdown_rx.clone()))
    };

    let bootstrap = replica.bootstrap_from(&*store)?;
    info!(
        endpoints = replica.len(),
        replayed = bootstrap.replayed,
        stale = bootstrap.stale,
        "roster replica ready"
    );

    // ── Probe cycle ────────────────────────────────────────────

    let stats = Arc::new(CycleStats::new());
    let prober = HealthProber::new(
        NetworkPinger::from_method(config.probe.method, config.probe.tcp_port),
        config.probe.prober_config()?,
    );
    let recorder = Arc::new(StatusRecorder::new(
        store.clone(),
        store.clone(),
        Arc::clone(&clock),
        interval,
    ));
    let probe_scheduler = ProbeScheduler::new(
        HealthCycle::new(Arc::clone(&replica), prober, recorder),
        interval,
        Arc::clone(&stats),
    );
    let probe_handle = tokio::spawn(probe_scheduler.run(shutdown_rx.clone()));
    info!(
        method = ?config.probe.method,
        interval_secs = interval.as_secs(),
        "probe scheduler initialized"
    );

    // ── Daily report ───────────────────────────────────────────

    let reconstructor = Arc::new(UptimeReconstructor::new(store.clone(), Arc::clone(&clock), zone));
    let daily = DailyReport::new(
        reconstructor,
        build_sink(&config, zone)?,
        config.report.recipients.clone(),
        config.report.daily_at()?,
        Arc::clone(&clock),
        Arc::clone(&stats),
    )
    .with_mode(config.report.mode);
    let report_handle = tokio::spawn(daily.run(shutdown_rx));

    // ── Wait for Ctrl-C ────────────────────────────────────────

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let consumed = consumer_handle.await?;
    probe_handle.await?;
    report_handle.await?;
    drop(idle_bus);

    let s = stats.snapshot();
    info!(
        mutations_applied = consumed.applied,
        mutations_rejected = consumed.malformed + consumed.store_errors,
        probe_cycles = s.probe_completed,
        probe_skipped = s.probe_skipped,
        reports_sent = s.reports_sent,
        reports_failed = s.reports_failed,
        "upwatch daemon stopped"
    );
    Ok(())
}
