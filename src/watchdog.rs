//! Hardware watchdog petting
//!
//! A background task pets the watchdog device at a fixed interval, but only
//! while the control loop keeps publishing snapshots. A stalled loop stops
//! the petting and the device resets the host.

use crate::config::WatchdogConfig;
use crate::error::Result;
use crate::logging::get_logger;
use crate::supervisor::StatusSnapshot;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval};

/// Keep-alive capability
pub trait Watchdog: Send {
    fn pet(&mut self) -> Result<()>;

    /// Stop the device cleanly on orderly shutdown
    fn disarm(&mut self) -> Result<()>;
}

/// Linux `/dev/watchdog` style character device
pub struct DeviceWatchdog {
    file: File,
}

impl DeviceWatchdog {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Self { file })
    }
}

impl Watchdog for DeviceWatchdog {
    fn pet(&mut self) -> Result<()> {
        self.file.write_all(b"1")?;
        self.file.flush()?;
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        // Magic close character
        self.file.write_all(b"V")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Pet `dog` while snapshots keep arriving; returns on shutdown
pub async fn run_watchdog(
    mut dog: Box<dyn Watchdog>,
    config: &WatchdogConfig,
    mut snapshots: watch::Receiver<Arc<StatusSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let logger = get_logger("watchdog");
    let stall = Duration::from_secs(config.stall_timeout_secs);
    let mut ticker = interval(Duration::from_secs(config.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    let mut stalled = false;

    logger.info(&format!(
        "Watchdog active: {} every {}s, stall after {}s",
        config.device, config.interval_secs, config.stall_timeout_secs
    ));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Ok(_) = shutdown.wait_for(|stop| *stop) => {
                if let Err(e) = dog.disarm() {
                    logger.warn(&format!("Failed to disarm watchdog: {}", e));
                }
                logger.info("Watchdog disarmed");
                return;
            }
        }

        if matches!(snapshots.has_changed(), Ok(true)) {
            snapshots.borrow_and_update();
            last_seen = Instant::now();
        }

        if last_seen.elapsed() > stall {
            if !stalled {
                logger.error(&format!(
                    "Control loop silent for {}s; no longer petting the watchdog",
                    last_seen.elapsed().as_secs()
                ));
                stalled = true;
            }
            continue;
        }
        if stalled {
            logger.info("Control loop alive again; resuming watchdog petting");
            stalled = false;
        }
        if let Err(e) = dog.pet() {
            logger.error(&format!("Failed to pet watchdog {}: {}", config.device, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::StatusPublisher;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Default)]
    struct CountingDog {
        pets: Arc<AtomicU32>,
        disarmed: Arc<AtomicU32>,
    }

    impl Watchdog for CountingDog {
        fn pet(&mut self) -> Result<()> {
            self.pets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disarm(&mut self) -> Result<()> {
            self.disarmed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_petting_when_snapshots_stall() {
        let config = WatchdogConfig {
            enabled: true,
            device: "test".to_string(),
            interval_secs: 1,
            stall_timeout_secs: 5,
        };
        let dog = CountingDog::default();
        let publisher = StatusPublisher::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = {
            let dog = Box::new(dog.clone());
            let rx = publisher.subscribe();
            tokio::spawn(async move { run_watchdog(dog, &config, rx, stop_rx).await })
        };

        // Fresh snapshots every second for 10s
        for _ in 0..10 {
            publisher.update(|_| {});
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let alive = dog.pets.load(Ordering::SeqCst);
        assert!(alive >= 9, "pets while alive: {}", alive);

        // Silence: petting stops once the stall timeout passes
        tokio::time::sleep(Duration::from_secs(20)).await;
        let after_stall = dog.pets.load(Ordering::SeqCst);
        assert!(after_stall <= alive + 6);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(dog.pets.load(Ordering::SeqCst), after_stall);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(dog.disarmed.load(Ordering::SeqCst), 1);
    }
}
