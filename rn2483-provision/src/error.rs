//! Common error types for rn2483-provision.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::protocol::Step;

/// Why a single command did not get its acknowledgment.
#[derive(Error, Debug)]
pub enum CommandError {
    /// No reply line within the timeout
    #[error("no reply within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The module answered with an error code or an unexpected line
    #[error("module replied {0:?}")]
    Rejected(String),

    /// The serial stream ended
    #[error("link closed")]
    Closed,

    /// Reading or writing the serial stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    /// The raw line received, when the failure was caused by one.
    pub fn reply(&self) -> Option<&str> {
        match self {
            CommandError::Rejected(line) => Some(line),
            _ => None,
        }
    }
}

/// One command sent and the line it got back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub step: Step,
    /// Command text, with key material redacted
    pub command: String,
    pub reply: String,
}

/// Report of the step that stopped a provisioning run.
#[derive(Debug)]
pub struct StepFailure {
    pub step: Step,
    /// Command text, with key material redacted
    pub command: String,
    pub error: CommandError,
    /// Exchanges that succeeded before this step
    pub completed: Vec<Exchange>,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} ({}) failed: `{}`: {}",
            self.step.number(),
            self.step,
            self.command,
            self.error
        )
    }
}

fn describe_reply(received: &Option<String>) -> String {
    match received {
        Some(line) => format!("{:?}", line),
        None => "no reply".to_string(),
    }
}

/// Main error type for rn2483-provision operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened
    #[error("cannot open serial port {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    /// The module did not identify itself as expected
    #[error("module identity mismatch: expected {expected:?}, got {}", describe_reply(.received))]
    IdentityMismatch {
        expected: String,
        received: Option<String>,
    },

    /// A provisioning step failed; later steps were not sent
    #[error("{0}")]
    Step(Box<StepFailure>),

    /// A command outside the provisioning sequence failed
    #[error("`{command}` failed: {source}")]
    Command {
        command: String,
        #[source]
        source: CommandError,
    },

    /// Invalid device address or session key
    #[error("invalid credentials: {0}")]
    Credentials(#[from] CredentialError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("configuration parsing error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl Error {
    /// The step failure, if this error stopped the provisioning sequence.
    pub fn step_failure(&self) -> Option<&StepFailure> {
        match self {
            Error::Step(failure) => Some(failure.as_ref()),
            _ => None,
        }
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
