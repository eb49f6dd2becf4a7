//! # Bankwarden - Battery multi-bank supervisor
//!
//! Monitors the temperature probes and terminal voltages of a series battery
//! pack split into banks, flags thermal anomalies, and moves charge from the
//! highest bank to the lowest through a relay-switched DC-DC converter.
//!
//! ## Features
//!
//! - **Temperature acquisition**: Modbus RTU-style frames over TCP with
//!   bounded retries
//! - **Calibration**: per-channel offsets locked on first valid read and
//!   persisted across restarts
//! - **Anomaly detection**: absolute, deviation, rise and group-lag rules
//! - **Balancing**: interlocked state machine, one session at a time
//! - **Self-test**: configuration, connectivity and per-pair balancing checks
//! - **Web Interface**: REST API and SSE streams
//! - **Configuration**: YAML-based configuration with validation
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `modbus`: Frame encoding and response decoding
//! - `temperature`: Temperature gateway link
//! - `banks`: Channel-to-bank layout and relay patterns
//! - `hardware`: Bus and GPIO capabilities, simulated rig
//! - `bus`: Exclusive access to the shared bus
//! - `voltage`: Per-bank voltage sampling
//! - `calibration` / `persistence`: Offsets and their on-disk form
//! - `anomaly` / `alerts`: Detection rules and alert deduplication
//! - `balancing`: Charge transfer state machine
//! - `selftest`: Startup self-test
//! - `notify`: Rate-limited alert delivery
//! - `supervisor`: Control loop and published status
//! - `watchdog`: Hardware watchdog petting
//! - `web`: HTTP server and REST API

pub mod alerts;
pub mod anomaly;
pub mod balancing;
pub mod banks;
pub mod bus;
pub mod calibration;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod modbus;
pub mod notify;
pub mod persistence;
pub mod retry;
pub mod selftest;
pub mod supervisor;
pub mod temperature;
pub mod voltage;
pub mod watchdog;
#[cfg(feature = "web")]
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use error::{BmsError, Result};
pub use supervisor::{Supervisor, SupervisorHandle};
