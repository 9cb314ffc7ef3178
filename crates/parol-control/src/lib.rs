//! # PAROL Control
//!
//! The periodic loops and process management that sit between an operator
//! surface and the headless controller.
//!
//! ## Modules
//!
//! - `intent`: latest jog intent (last write wins)
//! - `cadence`: fixed-rate jog command stream
//! - `poller`: periodic status queries and health
//! - `runner`: one user program at a time, with output capture
//! - `output`: output fan-out to subscribers
//! - `library`: program files on disk
//! - `config`: TOML + environment configuration
//! - `commander`: assembles everything over one Command Channel
//!
//! ## Usage
//!
//! ```rust,no_run
//! use parol_control::{Commander, CommanderConfig, JogIntent};
//! use parol_driver::UdpTransport;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = CommanderConfig::default();
//! config.apply_env()?;
//! let transport = UdpTransport::connect(&config.controller.host, config.controller.port)?;
//! let commander = Commander::start(config, transport)?;
//!
//! commander.submit_jog(JogIntent::joint([20.0, 0.0, 0.0, 0.0, 0.0, 0.0]))?;
//! commander.release_jog();
//! commander.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod cadence;
pub mod commander;
pub mod config;
pub mod error;
pub mod intent;
pub mod library;
pub mod output;
pub mod poller;
pub mod runner;

pub use cadence::{CadenceConfig, CadenceDriver, CadenceStats, CadenceTick};
pub use commander::{Commander, CommanderStatus, RobotAction};
pub use config::CommanderConfig;
pub use error::ControlError;
pub use intent::{IntentSlot, JogIntent, JogMode};
pub use library::{ProgramEntry, ProgramLibrary};
pub use output::{OutputLine, OutputSource, OutputStream};
pub use poller::{HealthStatus, PollerConfig, StatusPoller, TelemetryEvent, TelemetryObserver};
pub use runner::{ProgramRunSnapshot, ProgramRunner, ProgramState, RunId, RunnerConfig};
