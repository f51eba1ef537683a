//! On-demand commands: single-server uptime, fleet report, roster edits.
//!
//! Reads open the same redb file as the daemon, and redb allows one process
//! per file, so they run against a stopped daemon or a copy of its store.
//! With the registry bus enabled, roster edits are only published: the
//! daemon's consumer persists them and assigns their revisions, and the
//! broker holds them while the daemon is down.

use std::sync::Arc;

use anyhow::{Context, bail};
use chrono_tz::Tz;
use tracing::info;

use upwatch_registry::MqttPublisher;
use upwatch_report::{
    LogSink, OutboxSink, ReportSink, UptimeReconstructor, date_range_window, parse_date,
};
use upwatch_state::{Endpoint, RosterMutation, RosterSource, StateStore, SystemClock};

use crate::config::UpwatchConfig;

pub fn open_store(config: &UpwatchConfig) -> anyhow::Result<StateStore> {
    let path = &config.store.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    StateStore::open(path).with_context(|| {
        format!(
            "opening store {} (is another upwatchd using it?)",
            path.display()
        )
    })
}

pub fn build_sink(config: &UpwatchConfig, zone: Tz) -> anyhow::Result<Arc<dyn ReportSink>> {
    let sink: Arc<dyn ReportSink> = match &config.report.outbox_dir {
        Some(dir) => Arc::new(OutboxSink::new(dir, zone)?),
        None => Arc::new(LogSink::new(zone)),
    };
    Ok(sink)
}

fn open_reconstructor(config: &UpwatchConfig, store: StateStore) -> anyhow::Result<UptimeReconstructor> {
    Ok(UptimeReconstructor::new(
        Arc::new(store),
        Arc::new(SystemClock),
        config.report.zone()?,
    ))
}

pub fn uptime(config: &UpwatchConfig, server: &str, date: &str) -> anyhow::Result<()> {
    let date = parse_date(date)?;
    let reconstructor = open_reconstructor(config, open_store(config)?)?;
    let report = reconstructor.server_uptime_on(server, date)?;
    print!("{}", report.render_text(reconstructor.zone()));
    Ok(())
}

pub fn report(config: &UpwatchConfig, from: &str, to: &str) -> anyhow::Result<()> {
    let zone = config.report.zone()?;
    let window = date_range_window(parse_date(from)?, parse_date(to)?, zone)?;
    let reconstructor = open_reconstructor(config, open_store(config)?)?;
    let report = reconstructor.fleet(window, config.report.mode)?;

    let sink = build_sink(config, zone)?;
    sink.send(&config.report.recipients, &report)?;
    print!("{}", report.render_text(zone));
    Ok(())
}

async fn publish(config: &UpwatchConfig, mutation: &RosterMutation) -> anyhow::Result<()> {
    let mut publisher = MqttPublisher::connect(&config.bus.mqtt_settings());
    publisher
        .publish(mutation)
        .await
        .with_context(|| format!("publishing roster mutation for {}", mutation.id()))?;
    Ok(())
}

pub async fn roster_add(config: &UpwatchConfig, id: &str, address: &str, name: &str) -> anyhow::Result<()> {
    let endpoint = Endpoint::new(id, address, name);
    endpoint.validate()?;

    if config.bus.enabled {
        publish(config, &RosterMutation::from(&endpoint)).await?;
        println!("{id} {address} requested");
        return Ok(());
    }

    let stored = open_store(config)?.put_endpoint(&endpoint)?;
    println!("{} {} revision {}", stored.id, stored.address, stored.revision);
    Ok(())
}

pub async fn roster_remove(config: &UpwatchConfig, id: &str, purge: bool) -> anyhow::Result<()> {
    if config.bus.enabled {
        let request = RosterMutation::Drop {
            id: id.to_string(),
            revision: 0,
        };
        request.validate()?;
        publish(config, &request).await?;
        println!("{id} removal requested");
        if purge {
            let store = open_store(config).context("purging history needs the daemon stopped")?;
            let removed = store.purge_server_events(id)?;
            info!(server_id = %id, removed, "status history purged");
        }
        return Ok(());
    }

    let store = open_store(config)?;
    let Some(mutation) = store.delete_endpoint(id)? else {
        bail!("unknown server: {id}");
    };
    if purge {
        let removed = store.purge_server_events(id)?;
        info!(server_id = %id, removed, "status history purged");
    }
    println!("{id} removed, revision {}", mutation.revision());
    Ok(())
}

pub fn roster_list(config: &UpwatchConfig) -> anyhow::Result<()> {
    let mut endpoints = open_store(config)?.list_endpoints()?;
    endpoints.sort_by(|a, b| a.id.cmp(&b.id));
    for ep in endpoints {
        println!(
            "{}\t{}\t{}\t{}\trev {}",
            ep.id,
            ep.address,
            if ep.last_known_status { "up" } else { "down" },
            ep.display_name,
            ep.revision
        );
    }
    Ok(())
}
