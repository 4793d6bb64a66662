//! Matrix Engine Application
//!
//! Runs the crosspoint matrix engine with a synthetic audio generator so
//! remote surfaces have live meters to look at. A real deployment replaces
//! the generator thread with the audio host's callbacks.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_matrix_remote::{
    analyzer::AudioBlock,
    config::AppConfig,
    constants::DEFAULT_SAMPLE_RATE,
    engine::MatrixEngine,
};

const BLOCK_FRAMES: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Matrix Engine");

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("config unusable, falling back to defaults: {}", e);
            AppConfig::default()
        }
    };
    tracing::info!(
        name = %config.engine.name,
        inputs = config.engine.inputs,
        outputs = config.engine.outputs,
        "engine configuration"
    );

    let engine = Arc::new(MatrixEngine::start(config).await?);
    engine.initialize_audio(DEFAULT_SAMPLE_RATE, BLOCK_FRAMES as u32);
    tracing::info!(port = engine.control_port(), "control server up");

    // Synthetic audio callbacks on a dedicated thread, mimicking the timing
    // of a real audio host
    let running = Arc::new(AtomicBool::new(true));
    let generator = std::thread::spawn({
        let engine = engine.clone();
        let running = running.clone();
        move || generate_audio(&engine, &running)
    });

    let mut stats = tokio::time::interval(Duration::from_secs(10));
    stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stats.tick() => {
                tracing::info!(
                    clients = engine.client_count(),
                    skipped_blocks = engine.skipped_blocks(),
                    "engine stats"
                );
            }
        }
    }

    tracing::info!("shutting down");
    running.store(false, Ordering::Relaxed);
    let _ = generator.join();
    if let Some(engine) = Arc::into_inner(engine) {
        engine.shutdown().await;
    }
    Ok(())
}

/// Per-channel sine generator feeding both analyzer sides through the
/// matrix gains
fn generate_audio(engine: &MatrixEngine, running: &AtomicBool) {
    let (mut inputs, mut outputs) = engine.hub().io_count();
    let mut phases = vec![0f32; inputs as usize];
    let mut input_samples = vec![0f32; inputs as usize * BLOCK_FRAMES];
    let mut output_samples = vec![0f32; outputs as usize * BLOCK_FRAMES];
    let mut gains = vec![0f32; inputs as usize * outputs as usize];
    let block_period = Duration::from_secs_f64(BLOCK_FRAMES as f64 / DEFAULT_SAMPLE_RATE as f64);

    while running.load(Ordering::Relaxed) {
        // Track remote io-count changes
        let (new_inputs, new_outputs) = engine.hub().io_count();
        if (new_inputs, new_outputs) != (inputs, outputs) {
            inputs = new_inputs;
            outputs = new_outputs;
            phases.resize(inputs as usize, 0.0);
            input_samples.resize(inputs as usize * BLOCK_FRAMES, 0.0);
            output_samples.resize(outputs as usize * BLOCK_FRAMES, 0.0);
            gains.resize(inputs as usize * outputs as usize, 0.0);
        }

        // Each input gets its own frequency and level so meters differ
        for ch in 0..inputs as usize {
            let freq = 220.0 * (ch as f32 + 1.0);
            let step = 2.0 * std::f32::consts::PI * freq / DEFAULT_SAMPLE_RATE as f32;
            let amplitude = 0.6 / (ch as f32 + 1.0);
            for frame in 0..BLOCK_FRAMES {
                input_samples[ch * BLOCK_FRAMES + frame] = amplitude * phases[ch].sin();
                phases[ch] += step;
            }
            phases[ch] %= 2.0 * std::f32::consts::PI;
        }

        // One matrix lock per block, outside the per-sample loop
        engine.hub().with_matrix(|m| {
            for i in 0..inputs {
                for o in 0..outputs {
                    gains[(i as usize) * outputs as usize + o as usize] =
                        m.effective_gain(i + 1, o + 1);
                }
            }
        });
        for o in 0..outputs as usize {
            for frame in 0..BLOCK_FRAMES {
                let mut mixed = 0f32;
                for i in 0..inputs as usize {
                    mixed += gains[i * outputs as usize + o]
                        * input_samples[i * BLOCK_FRAMES + frame];
                }
                output_samples[o * BLOCK_FRAMES + frame] = mixed;
            }
        }

        let input_block = AudioBlock::new(&input_samples, inputs, BLOCK_FRAMES);
        if let Err(e) = engine.analyze_input_block(&input_block) {
            tracing::warn!("input analyzer rejected block: {}", e);
        }
        let output_block = AudioBlock::new(&output_samples, outputs, BLOCK_FRAMES);
        if let Err(e) = engine.analyze_output_block(&output_block) {
            tracing::warn!("output analyzer rejected block: {}", e);
        }

        std::thread::sleep(block_period);
    }
}
