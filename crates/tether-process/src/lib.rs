//! Starting and supervising the debug adapter process.
//!
//! [`start`] spawns the adapter described by [`AdapterSpawnParams`] and runs the startup
//! handshake: it waits for the readiness line on the adapter's output, a premature exit, or the
//! timeout, whichever comes first. The returned [`AdapterProcess`] reports the exit exactly once
//! and can be terminated any number of times.

use std::io;

use tether_config::expand::ExpandError;
use thiserror::Error;

pub mod environment;
pub mod spawn;
pub mod supervisor;

pub use crate::environment::{adapter_environment, Environment};
pub use crate::spawn::{AdapterSpawnParams, SpawnMode};
pub use crate::supervisor::{
    listening_port_pattern, start, AdapterProcess, ExitEvent, HandshakeOptions, OutputStream,
    Started,
};
pub use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum StartError {
    #[error(
        "failed to start the debug adapter `{program}`: {source}; check that `adapter.program` \
         points to an executable file"
    )]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("the debugger did not start within the allotted time")]
    Timeout { output: String },

    #[error(
        "the debugger exited without completing startup handshake ({})",
        describe_exit(.code, .signal)
    )]
    Handshake {
        code: Option<i32>,
        signal: Option<i32>,
        output: String,
    },

    #[error("invalid adapter environment: {0}")]
    Environment(#[from] ExpandError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StartError {
    /// Adapter output captured before the failure, for diagnostics.
    pub fn output(&self) -> Option<&str> {
        match self {
            StartError::Timeout { output } | StartError::Handshake { output, .. } => Some(output),
            _ => None,
        }
    }
}

fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown exit status".to_string(),
    }
}
