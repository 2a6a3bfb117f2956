use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed header block or a body that is not a DAP message. Fatal to the stream.
    #[error("dap decode error: {0}")]
    Decode(String),

    /// The peer did not present the expected `Auth-Token`.
    #[error("dap peer failed authentication")]
    Auth,

    #[error("dap connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for dap response")]
    Timeout,

    #[error("`{command}` request failed: {message}")]
    RequestFailed { command: String, message: String },

    #[error("dap protocol error: {0}")]
    Protocol(String),
}

pub type Result<T, E = DapError> = std::result::Result<T, E>;
