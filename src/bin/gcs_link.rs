use std::time::Duration;

use anyhow::Result;
use gcs_link::{DiscoveryProgress, LinkConfig, RadioLink};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    setup_logging();
    info!("gcs-link starting...");

    let config = LinkConfig::load_or_default("config/link.toml")?;
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "udpin:0.0.0.0:14550".to_string());

    let link = RadioLink::open(&url, config, log_discovery_progress)?;
    info!(vehicles = ?link.list_vehicles(), "discovery complete");

    link.add_passive_listener("STATUSTEXT", |_frame| {});

    loop {
        std::thread::sleep(Duration::from_secs(5));
        for vehicle in link.vehicle_snapshots() {
            info!(?vehicle, "telemetry tick");
        }
    }
}

fn log_discovery_progress(progress: DiscoveryProgress) {
    if let Some(message) = progress.message {
        info!(%message, "discovery progress");
    }
    if let Some(seconds) = progress.data {
        info!(seconds, "discovery tick");
    }
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(EnvFilter::from_default_env())
        .init();
}

