//! # PAROL Protocol
//!
//! Headless controller wire protocol (no I/O dependencies).
//!
//! ## Modules
//!
//! - `command`: fire-and-forget commands (jog, stop, one-shot actions)
//! - `query`: request/response pairs and response decoding
//! - `telemetry`: `STATUS` frame payload
//!
//! ## Framing
//!
//! Every message is a single ASCII datagram. Fields are separated by `|`,
//! lists inside a field by `,`. The controller optionally prefixes commands
//! with a correlation id; this crate never does.

pub mod command;
pub mod query;
pub mod telemetry;

pub use command::*;
pub use query::*;
pub use telemetry::*;

use thiserror::Error;

/// Field separator.
pub const FIELD_SEP: char = '|';

/// List separator inside a field.
pub const LIST_SEP: char = ',';

/// Largest datagram the controller emits.
pub const MAX_DATAGRAM: usize = 4096;

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Payload is not valid UTF-8.
    #[error("Datagram is not valid UTF-8")]
    NotUtf8,

    /// Empty payload.
    #[error("Empty datagram")]
    Empty,

    /// First field does not name a known response.
    #[error("Unknown response tag: {tag}")]
    UnknownTag { tag: String },

    /// Response tag is known but does not answer the pending query.
    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: String,
    },

    /// A field failed to parse.
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// A numeric list has the wrong number of entries.
    #[error("Invalid length for {field}: expected {expected}, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Command arguments out of range.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// Parse a comma separated list of floats.
pub(crate) fn parse_f64_list(field: &'static str, raw: &str) -> Result<Vec<f64>, ProtocolError> {
    raw.split(LIST_SEP)
        .map(|s| {
            s.trim().parse::<f64>().map_err(|e| ProtocolError::InvalidField {
                field,
                reason: format!("{s:?}: {e}"),
            })
        })
        .collect()
}
