use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use anyhow::Context as _;
use mmv_app::GenericError;
use mmv_polling::{PollingHandle, PollingValue, WriterSink};
use mmv_writer::{MetricName, MetricWriter, MmvFormat};
use tracing::info;

use crate::config::ExporterConfiguration;

const UPTIME_METRIC: &str = "mmv.exporter.uptime_ms";
const POLLS_METRIC: &str = "mmv.exporter.polls";
const HEALTHY_METRIC: &str = "mmv.exporter.healthy";
const HEARTBEATS_METRIC: &str = "mmv.worker.heartbeats";
const WORKERS_DOMAIN: &str = "mmv.workers";

/// Exports metrics until interrupted.
pub async fn run(config: ExporterConfiguration) -> Result<(), GenericError> {
    let path = config.path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory '{}'.", parent.display()))?;
    }

    let writer = Arc::new(MetricWriter::new(&path, MmvFormat::new(config.format_config())));
    let handles = register_and_start(&writer, &config)?;

    info!(
        path = %path.display(),
        metrics = writer.metric_count(),
        interval_ms = config.poll_interval,
        "MMV exporter running. Press Ctrl-C to stop."
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal.")?;

    info!("Received shutdown signal. Stopping pollers.");
    for handle in handles {
        handle.stop();
    }

    writer.flush()?;
    Ok(())
}

/// Registers every exported metric, starts the writer, and spawns a poller per value.
fn register_and_start(
    writer: &Arc<MetricWriter>, config: &ExporterConfiguration,
) -> Result<Vec<PollingHandle>, GenericError> {
    let uptime = MetricName::new(UPTIME_METRIC);
    let polls = MetricName::new(POLLS_METRIC);
    let healthy = MetricName::new(HEALTHY_METRIC);

    writer.add_metric(uptime.clone(), 0u64)?;
    writer.add_metric(polls.clone(), 0u64)?;
    writer.add_metric(healthy.clone(), false)?;

    let heartbeats = config
        .workers
        .iter()
        .map(|worker| {
            let name = MetricName::with_instance(HEARTBEATS_METRIC, worker.as_str(), WORKERS_DOMAIN);
            writer.add_metric(name.clone(), 0u64)?;
            Ok(name)
        })
        .collect::<Result<Vec<_>, GenericError>>()?;

    writer.start()?;
    writer.update_metric(&healthy, &true)?;

    let interval = config.poll_interval();
    let started = Instant::now();
    let poll_count = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::with_capacity(2 + heartbeats.len());

    let counter = Arc::clone(&poll_count);
    let uptime_poller = move || -> Result<u64, GenericError> {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX))
    };
    let sink = WriterSink::new(Arc::clone(writer), uptime);
    handles.push(PollingValue::new(UPTIME_METRIC, interval, uptime_poller, sink)?.spawn());

    let counter = Arc::clone(&poll_count);
    let polls_poller = move || -> Result<u64, GenericError> { Ok(counter.load(Ordering::Relaxed)) };
    let sink = WriterSink::new(Arc::clone(writer), polls);
    handles.push(PollingValue::new(POLLS_METRIC, interval, polls_poller, sink)?.spawn());

    for name in heartbeats {
        let mut beats = 0u64;
        let heartbeat_poller = move || -> Result<u64, GenericError> {
            beats += 1;
            Ok(beats)
        };
        let poller_name = format!("{}[{}]", HEARTBEATS_METRIC, name.instance().unwrap_or_default());
        let sink = WriterSink::new(Arc::clone(writer), name);
        handles.push(PollingValue::new(poller_name, interval, heartbeat_poller, sink)?.spawn());
    }

    Ok(handles)
}
