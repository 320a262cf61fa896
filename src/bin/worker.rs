//! Media worker - consumes process-asset jobs from the bus and renders them.
//!
//! The bootstrap config path resolves from argv[1], then BOOTSTRAP_PATH,
//! then the built-in default. Startup failures (missing config, unreachable
//! bus or store, bad schema) exit with code 1; a clean shutdown exits 0.

use media_pipeline::config::Config;
use media_pipeline::db::AssetStore;
use media_pipeline::profiles::ProfileRegistry;
use media_pipeline::services::bus::Publisher;
use media_pipeline::services::download::Downloader;
use media_pipeline::services::image::ImageEngine;
use media_pipeline::services::ingest::Ingestor;
use media_pipeline::services::object_store::{ObjectStore, S3Backend};
use media_pipeline::services::spool::TempSpool;
use media_pipeline::services::worker::Worker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("worker=info".parse().expect("valid directive"))
                .add_directive("media_pipeline=info".parse().expect("valid directive")),
        )
        .init();

    dotenvy::dotenv().ok();

    let path = Config::resolve_bootstrap_path(std::env::args().nth(1).as_deref());
    let config = match Config::load_from(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    info!(config = %path.display(), "configuration loaded");

    if let Err(e) = run(config).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> media_pipeline::error::Result<()> {
    let profiles = Arc::new(ProfileRegistry::from_config(&config.profiles)?);

    let db = AssetStore::connect(&config.database.url, config.database.max_connections).await?;
    info!("database pool ready");

    let backend = S3Backend::new(&config.s3).await?;
    backend.health_check().await?;
    let store = ObjectStore::new(Arc::new(backend), config.s3.public_base_url.clone());

    let engine = Arc::new(ImageEngine::new(&config.engine));
    let downloader = Downloader::new(&config.http)?;
    let publisher = Arc::new(Publisher::new(&config.rabbit));
    let spool = config
        .temp
        .as_ref()
        .map(|temp| Arc::new(TempSpool::new(temp.upload_dir.clone())));

    let ingestor = Arc::new(Ingestor::new(
        profiles,
        engine,
        store,
        downloader,
        Some(publisher.clone()),
        spool.clone(),
    ));

    println!(
        "media worker consuming {} at {}",
        config.rabbit.queue,
        config.rabbit.endpoint()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // Periodic spool sweep for parked uploads nobody came back for.
    if let (Some(spool), Some(temp)) = (spool, config.temp.as_ref()) {
        let hours = temp.cleanup_after_hours;
        let mut sweep_shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = sweep_shutdown_rx.changed() => {
                        if *sweep_shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let removed = spool.cleanup(hours);
                        if removed > 0 {
                            warn!(removed, "swept stale spool files");
                        }
                    }
                }
            }
        });
    }

    let mut worker = Worker::new(
        ingestor,
        db,
        publisher,
        config.rabbit.clone(),
        shutdown_rx,
    );
    if let Err(e) = worker.run().await {
        error!(error = %e, "worker stopped with an error");
        return Err(e);
    }

    info!("media worker stopped");
    Ok(())
}
