use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;

use chapters2audiobook::core::config::Config;
use chapters2audiobook::core::io::NativeStorage;
use chapters2audiobook::services::workflow::{load_units, PipelineManager, Services};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let storage = Arc::new(NativeStorage::new());
    let units = load_units(storage.as_ref(), &config).await?;
    if units.is_empty() {
        warn!("No .txt chapters found in {}", config.input_folder);
        return Ok(());
    }

    let services = Services::from_config(&config)?;
    let manager = PipelineManager::new(config, storage, services);

    let stop = manager.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted: finishing in-flight work, no new chapters will start");
            stop.stop();
        }
    });

    let report = manager.run(units).await?;

    for unit in report.run.units() {
        println!(
            "{:02} {:<24} rewrite: {} | audio: {} | captions: {}",
            unit.index, unit.name, unit.rewrite, unit.synthesis, unit.caption
        );
    }
    if let Some(assembly) = &report.assembly {
        if let Some(path) = &assembly.audio_path {
            info!("Audiobook written to {}", path.display());
        }
        for (name, reason) in &assembly.excluded {
            println!("Excluded from audiobook: {} ({})", name, reason);
        }
    }
    println!("Summary: {}", report.run.summary());

    Ok(())
}
