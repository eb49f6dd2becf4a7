use anyhow::Result;
use bankwarden::banks::RelayTable;
use bankwarden::config::Config;
use bankwarden::hardware::Hardware;
use bankwarden::logging::{get_logger, init_logging};
use bankwarden::notify::LogSink;
use bankwarden::supervisor::Supervisor;
use bankwarden::temperature::TemperatureSource;
use bankwarden::watchdog::{DeviceWatchdog, run_watchdog};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Real bus, GPIO and temperature gateway
#[cfg(feature = "hardware")]
fn open_backends(
    config: &Config,
    _relays: &RelayTable,
) -> Result<(Hardware, Arc<dyn TemperatureSource>)> {
    use bankwarden::hardware::rpi::{RpiBus, RpiPins};
    use bankwarden::temperature::TemperatureLink;

    let bus = RpiBus::open(&config.bus)?;
    let pins = RpiPins::open(&config.gpio)?;
    let link = TemperatureLink::new(&config.temperature);
    Ok((
        Hardware::new(Box::new(bus), Box::new(pins)),
        Arc::new(link),
    ))
}

/// Simulated pack and probes for hosts without the hardware feature
#[cfg(not(feature = "hardware"))]
fn open_backends(
    config: &Config,
    relays: &RelayTable,
) -> Result<(Hardware, Arc<dyn TemperatureSource>)> {
    use bankwarden::hardware::sim::{SimulatedPack, SimulatedTemperatures};

    info!("Built without the hardware feature; running against the simulated rig");
    let voltages = (0..config.banks.count)
        .map(|i| 3.6 + 0.08 * i as f64)
        .collect();
    let pack = SimulatedPack::new(config, relays, voltages);
    let temps = SimulatedTemperatures::new(vec![25.0; usize::from(config.temperature.num_channels)]);
    Ok((
        Hardware::new(Box::new(pack.bus()), Box::new(pack.pins())),
        Arc::new(temps),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Logging init: {}", e))?;

    info!(
        "Bankwarden {} starting up ({} banks, {} channels)",
        env!("APP_VERSION"),
        config.banks.count,
        config.temperature.num_channels
    );

    let relays = RelayTable::from_config(&config.banks)?;
    let (hardware, temperatures) = open_backends(&config, &relays)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (mut supervisor, handle) = Supervisor::new(
        config.clone(),
        hardware,
        relays,
        temperatures,
        Arc::new(LogSink::default()),
        shutdown_rx.clone(),
    )?;

    #[cfg(feature = "web")]
    let web_task = if config.web.enabled {
        let state = bankwarden::web::AppState::new(handle.clone(), config.clone());
        let host = config.web.host.clone();
        let port = config.web.port;
        Some(tokio::spawn(async move {
            if let Err(e) = bankwarden::web::serve(state, &host, port).await {
                error!("Web server error: {}", e);
            }
        }))
    } else {
        None
    };

    let watchdog_task = if config.watchdog.enabled {
        match DeviceWatchdog::open(&config.watchdog.device) {
            Ok(dog) => {
                let wd_config = config.watchdog.clone();
                let snapshots = handle.subscribe();
                let stop = shutdown_rx.clone();
                Some(tokio::spawn(async move {
                    run_watchdog(Box::new(dog), &wd_config, snapshots, stop).await;
                }))
            }
            Err(e) => {
                error!(
                    "Failed to open watchdog device {}: {}",
                    config.watchdog.device, e
                );
                None
            }
        }
    } else {
        None
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            get_logger("main").info("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let result = supervisor.run().await;

    if let Some(task) = watchdog_task {
        let _ = task.await;
    }
    #[cfg(feature = "web")]
    if let Some(task) = web_task {
        task.abort();
    }

    match result {
        Ok(()) => {
            info!("Supervisor shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Supervisor failed with error: {}", e);
            Err(anyhow::anyhow!("Supervisor error: {}", e))
        }
    }
}
