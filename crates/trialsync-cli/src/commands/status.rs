use std::time::Duration;

use trialsync_core::network::{HttpReachabilityCheck, ReachabilityCheck};
use trialsync_core::pipeline::BandwidthDetector;

use crate::commands::common::CommandContext;
use crate::error::CliError;

pub async fn run_status(context: &CommandContext) -> Result<(), CliError> {
    let config = &context.config;
    let store = context.open_store().await?;
    println!("Device:     {}", store.device_id().await?);
    println!("Store:      {}", context.db_path.display());
    println!("Queued:     {}", store.queue_len().await?);

    let verify_url = config
        .network
        .verify_url
        .clone()
        .or_else(|| config.remote_url.clone());
    match verify_url {
        Some(url) => {
            let check = HttpReachabilityCheck::new(
                url.clone(),
                Duration::from_millis(config.network.verify_timeout_ms),
            )?;
            let state = if check.verify().await {
                "reachable"
            } else {
                "unreachable"
            };
            println!("Remote:     {url} ({state})");
        }
        None => println!("Remote:     not configured"),
    }

    let detector = BandwidthDetector::from_config(&config.bandwidth)?;
    let quality = if config.bandwidth.probe_url.is_some() {
        detector.detect().await
    } else {
        detector.quality()
    };
    let strategy = detector.strategy();
    println!(
        "Connection: {quality} (batch {}, retry delay {}s, compression {}, delta sync {})",
        strategy.batch_size,
        strategy.retry_delay.as_secs(),
        if strategy.compression { "on" } else { "off" },
        if strategy.delta_sync { "on" } else { "off" }
    );
    Ok(())
}
