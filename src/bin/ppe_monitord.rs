//! ppe-monitord - PPE compliance monitoring daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file plus PPE_* environment overrides)
//! 2. Registers detector backends and preloads configured sources
//! 3. Runs a producer and a detection worker thread per source
//! 4. Serves the dashboard API, MJPEG streams, and the SSE event feed

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use ppe_monitor::api::{ApiConfig, ApiServer};
use ppe_monitor::{AppState, DetectorRegistry, LogMailer, MonitorConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the JSON config file.
    #[arg(long, env = "PPE_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address override, e.g. 0.0.0.0:8870.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = MonitorConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let registry = build_registry();
    let state = AppState::new(&config, registry, Arc::new(LogMailer))?;
    state.preload_sources(&config);

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, state.clone()).spawn()?;
    log::info!("monitor api listening on {}", api_handle.addr);
    log::info!(
        "detector '{}', confidence threshold {}, {} source(s) preloaded",
        config.detector,
        config.confidence_threshold,
        state.sources.len()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("ppe-monitord waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}

fn build_registry() -> DetectorRegistry {
    register_onnx(DetectorRegistry::with_defaults())
}

/// Register the ONNX backend when a model path is configured. YOLO-family
/// PPE models take 640x640 input.
#[cfg(feature = "backend-onnx")]
fn register_onnx(mut registry: DetectorRegistry) -> DetectorRegistry {
    use ppe_monitor::OnnxDetector;
    if let Ok(model) = std::env::var("PPE_ONNX_MODEL") {
        registry.register("onnx", move || {
            Ok(Box::new(OnnxDetector::new(&model, 640, 640)?))
        });
    }
    registry
}

#[cfg(not(feature = "backend-onnx"))]
fn register_onnx(registry: DetectorRegistry) -> DetectorRegistry {
    registry
}
