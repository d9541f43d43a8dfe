use hydronics_sim::config::Config;
use hydronics_sim::mqtt::{self, DriverSignals};
use hydronics_sim::{SyncLoop, ThermalModel};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DRIVER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        period_secs = cfg.simulation.period_secs,
        "loaded config from {cfg_path}"
    );

    let model = match cfg.simulation.seed {
        Some(seed) => ThermalModel::seeded(seed),
        None => ThermalModel::from_entropy(),
    };
    let mut sim = SyncLoop::new(
        cfg.simulation.initial_state(),
        model,
        cfg.topics.state.clone(),
    );

    let (client, eventloop) = mqtt::new(mqtt::build_options(&cfg.mqtt));
    let (connected_tx, mut connected_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver = tokio::spawn(mqtt::drive(
        eventloop,
        client.clone(),
        cfg.topics.config.clone(),
        sim.config_handle(),
        DriverSignals {
            connected: connected_tx,
            shutdown: shutdown_tx.clone(),
        },
        cfg.mqtt.max_reconnect_attempts,
    ));

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_tx.send_replace(true);
    });

    let mut waiting = shutdown_rx.clone();
    let connected = tokio::select! {
        res = connected_rx.wait_for(|up| *up) => res.is_ok(),
        _ = waiting.wait_for(|stop| *stop) => false,
    };

    if connected {
        info!(topic = %cfg.topics.state, "publishing state");
        info!(topic = %cfg.topics.config, "listening for config");
        sim.run(cfg.simulation.period(), &client, shutdown_rx).await;
    } else {
        warn!("shutdown requested before the broker connection came up");
    }

    info!("shutdown requested");
    mqtt::close(&client, &cfg.topics.config, driver, DRIVER_FLUSH_TIMEOUT).await;

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
