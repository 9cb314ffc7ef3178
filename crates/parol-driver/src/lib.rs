//! # PAROL Driver
//!
//! Link to the headless controller and supervision of its process.
//!
//! ## Modules
//!
//! - `transport`: datagram transport trait and the UDP implementation
//! - `channel`: the Command Channel (commands, queries, ownership checks)
//! - `ownership`: exclusive holder of the link (stream loops or a program)
//! - `health`: lock-free link health counters
//! - `supervisor`: controller process lifecycle and readiness
//! - `process`: graceful termination of child process groups
//!
//! ## Threading
//!
//! Every public type is `Send + Sync`. The Command Channel serializes all
//! traffic through one mutex; callers block for at most the query timeout.

pub mod channel;
pub mod error;
pub mod health;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod ownership;
pub mod process;
pub mod supervisor;
pub mod transport;

pub use channel::{ChannelConfig, ChannelHook, CommandChannel, Owner, ProgramLease};
pub use error::DriverError;
pub use health::{LinkHealth, LinkHealthSnapshot};
pub use ownership::{Holder, LinkOwnership, StreamState};
pub use supervisor::{
    ControllerEndpoint, ControllerLaunch, ControllerStatus, ControllerSupervisor,
    SupervisorConfig, SupervisorState,
};
pub use transport::{Transport, UdpTransport};
