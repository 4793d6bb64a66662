//! Matrix Remote Application
//!
//! Browses for engines on the local segment, connects to the last used one
//! (or the first discovered) and mirrors its state, logging meter readings
//! periodically. A UI layer would sit on top of the same controller.

use anyhow::Result;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_matrix_remote::{
    codec::{Direction, MessageType},
    config::{self, AppConfig},
    discovery::ServiceBrowser,
    matrix::gain_to_db,
    network::{ConnectionState, Subscription},
    remote::RemoteController,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Matrix Remote");

    let app_config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("config unusable, falling back to defaults: {}", e);
            AppConfig::default()
        }
    };

    let browser = ServiceBrowser::start(
        app_config.discovery.port,
        Duration::from_millis(app_config.discovery.announce_interval_ms),
    )?;
    tracing::info!(port = app_config.discovery.port, "browsing for engines");

    // Control plus full monitoring traffic
    let subscription = Subscription::new(
        [
            MessageType::EnvironmentParameters,
            MessageType::ReinitIoCount,
            MessageType::AnalyzerParameters,
            MessageType::AudioBuffer,
            MessageType::ControlParameters,
        ]
        .into_iter()
        .collect(),
    );
    let controller = RemoteController::start(subscription).await?;

    let preferred = app_config.remote.last_target_description.clone();
    if let Some(ref name) = preferred {
        tracing::info!(target = %name, "waiting for last used engine");
    }

    let mut connected_name: Option<String> = None;
    let mut status = tokio::time::interval(Duration::from_secs(2));
    status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status.tick() => {
                if controller.state() == ConnectionState::Discovering {
                    let candidate = match preferred {
                        Some(ref name) => browser.find_by_name(name),
                        None => browser.services().into_iter().next(),
                    };
                    if let Some(service) = candidate {
                        tracing::info!(name = %service.name, host = %service.host, port = service.port, "connecting");
                        connected_name = Some(service.name.clone());
                        controller.set_target(service).await?;
                    }
                } else {
                    log_status(&controller);
                }
            }
        }
    }

    tracing::info!("shutting down");
    if let Some(name) = connected_name {
        if let Err(e) = config::save_target_description(&name) {
            tracing::warn!("failed to persist last target: {}", e);
        }
    }
    controller.shutdown().await;
    browser.stop().await;
    Ok(())
}

fn log_status(controller: &RemoteController) {
    let env = controller.environment();
    let (inputs, outputs) = controller.hub().io_count();
    let input_peaks = peaks_db(controller, Direction::Input, env.min_db);
    let output_peaks = peaks_db(controller, Direction::Output, env.min_db);
    tracing::info!(
        state = ?controller.state(),
        inputs,
        outputs,
        ?input_peaks,
        ?output_peaks,
        "remote status"
    );
}

fn peaks_db(controller: &RemoteController, direction: Direction, min_db: f32) -> Vec<f32> {
    controller
        .levels(direction)
        .map(|snapshot| {
            snapshot
                .peak
                .iter()
                .map(|&peak| (gain_to_db(peak, min_db) * 10.0).round() / 10.0)
                .collect()
        })
        .unwrap_or_default()
}
