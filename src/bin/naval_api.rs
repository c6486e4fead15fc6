//! naval_api - upload service for naval image assessment
//!
//! This daemon:
//! 1. Loads configuration (`NAVAL_CONFIG` plus `NAVAL_*` overrides)
//! 2. Builds the pipeline and loads every stage model up front
//! 3. Serves `POST /upload` and `GET /health` until Ctrl-C

use anyhow::Result;
use std::sync::mpsc;
use std::sync::Arc;

use naval_watch::{
    api::{ApiConfig, ApiServer},
    NavalConfig, Pipeline,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = NavalConfig::load()?;
    let pipeline = Pipeline::from_config(&config)?;
    pipeline.warm_up()?;
    log::info!(
        "pipeline ready: {} labels, confidence floor {:.1}%, {} known case(s)",
        config.labels.len(),
        config.min_confidence,
        config.known_cases.iter().count()
    );

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        max_upload_bytes: config.max_upload_bytes,
    };
    let api_handle = ApiServer::new(api_config, Arc::new(pipeline)).spawn()?;
    log::info!("upload api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("naval_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
