use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod geocode;
mod service;
mod store;
mod sweep;

use config::{BusKind, Config};
use dbus_interface::{PresenceService, BUS_NAME, OBJECT_PATH};
use geocode::{DisabledGeocoder, Geocoder, NominatimGeocoder};
use service::AttendanceService;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        threshold = config.match_threshold,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path)
        .await
        .context("failed to open database")?;
    let engine = engine::spawn_engine(&config).context("failed to load face models")?;

    let geocoder: Arc<dyn Geocoder> = if config.geocoder_enabled {
        Arc::new(NominatimGeocoder::new(config.geocoder_url.clone(), config.geocoder_timeout())?)
    } else {
        tracing::info!("reverse geocoding disabled");
        Arc::new(DisabledGeocoder)
    };

    let service = Arc::new(
        AttendanceService::new(engine, store, geocoder, config.match_policy())
            .with_upload_dir(config.upload_dir.clone()),
    );
    let identities = service
        .rebuild_gallery()
        .await
        .context("failed to build gallery")?;
    if identities == 0 {
        tracing::warn!("no enrolled identities; every check-in will be rejected until users are enrolled");
    }

    if config.sweep_enabled {
        tokio::spawn(sweep::run_daily(service.clone(), config.sweep_hour));
    }

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, PresenceService::new(service))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
