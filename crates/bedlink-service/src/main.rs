//! bedlink - resilient BLE-to-MQTT bridge for adjustable-bed controllers.
//!
//! Run with: `cargo run -p bedlink-service -- --config /data/options.json`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use bedlink_core::{ConnectPreferences, ControllerStatsPort};
use bedlink_service::config::{default_config_path, Config};
use bedlink_service::entities::{BedController, ControllerBuilder};
use bedlink_store::{ControllerStatsStore, PreferenceStore};

/// bedlink - resilient BLE-to-MQTT bridge for adjustable-bed controllers.
#[derive(Parser, Debug)]
#[command(name = "bedlink")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the add-on options file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding persisted connect-preference and controller-stats
    /// JSON files.
    #[arg(long, default_value = "/data")]
    state_dir: PathBuf,
}

/// No vendor is wired into this binary by default: every advertisement is
/// rejected by [`NullControllerBuilder::is_supported`], so the daemon
/// discovers and logs but never connects. A real deployment supplies its own
/// [`ControllerBuilder`] for the bed protocols it speaks.
struct NullControllerBuilder;

impl ControllerBuilder for NullControllerBuilder {
    fn is_supported(&self, _advertisement: &bedlink_types::BleAdvertisement) -> bool {
        false
    }

    fn build(
        &self,
        bed: &bedlink_types::BedConfig,
        _advertisement: &bedlink_types::BleAdvertisement,
        _session: Arc<bedlink_core::DeviceSession>,
    ) -> bedlink_core::Result<Box<dyn BedController>> {
        Err(bedlink_core::Error::not_supported(&bed.friendly_name))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bedlink_service=info,bedlink_core=info")),
        )
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            let core_class = matches!(&e, bedlink_service::Error::Core(inner) if inner.is_socket_or_ble_class());
            error!(error = %e, "bedlink exited with an error");
            if core_class || matches!(&e, bedlink_service::Error::Mqtt(_)) {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

async fn run(args: Args) -> bedlink_service::Result<()> {
    let config_path = args.config.unwrap_or_else(default_config_path);
    info!(path = ?config_path, "loading configuration");
    let config = Config::load_validated(&config_path, None)?;

    std::fs::create_dir_all(&args.state_dir).map_err(|e| {
        bedlink_service::error::Error::mqtt(format!("failed to create state dir {:?}: {e}", args.state_dir))
    })?;

    let preferences_path = PreferenceStore::default_path(&args.state_dir, &config.namespace);
    let stats_path = ControllerStatsStore::default_path(&args.state_dir, &config.namespace, &config.vendor);

    let preferences: Arc<dyn ConnectPreferences> = Arc::new(PreferenceStore::open(preferences_path)?);
    let stats: Arc<dyn ControllerStatsPort> = Arc::new(ControllerStatsStore::open(stats_path)?);
    let builder: Arc<dyn ControllerBuilder> = Arc::new(NullControllerBuilder);

    let health_slot: Arc<std::sync::Mutex<Option<Arc<bedlink_service::HealthMonitor>>>> =
        Arc::new(std::sync::Mutex::new(None));

    tokio::select! {
        result = bedlink_service::supervisor::run(config, builder, preferences, stats, Arc::clone(&health_slot)) => result,
        _ = shutdown_signal() => {
            info!("shutdown signal received, publishing final health snapshot");
            if let Some(health) = health_slot.lock().unwrap().clone() {
                health.publish_final_snapshot().await;
            }
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
