//! Front doors for externally triggered debug sessions.
//!
//! Both the launch URI handler ([`uri`]) and the RPC gateway ([`rpc`]) turn untrusted input into
//! a [`LaunchRequest`] and hand it to a [`SessionStarter`]. Malformed input is reported as an
//! error and never starts a session with partial data.

use async_trait::async_trait;
use serde_json::{json, Value};
use tether_config::LaunchRequest;
use thiserror::Error;

pub mod client;
pub mod rpc;
pub mod sessions;
pub mod uri;

pub use crate::client::launch;
pub use crate::rpc::{LaunchEnvironment, LaunchResponse, RpcOptions, RpcServer, TerminalId};
pub use crate::sessions::{SessionGuard, SessionRegistry, SESSION_ID_KEY};
pub use crate::uri::{handle_uri, parse_uri, UriRequest};

/// Adapter `type` given to configurations that arrive without one.
pub const DEFAULT_ADAPTER_TYPE: &str = "lldb";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid launch uri: {0}")]
    Uri(String),

    #[error("invalid launch document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid launch configuration: {0}")]
    Resolve(#[from] tether_config::ResolveError),

    #[error("failed to start debug session: {0}")]
    Start(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Starts debug sessions on behalf of the launch endpoints.
#[async_trait]
pub trait SessionStarter: Send + Sync {
    /// Start a session for `config`. Returns whether it started; with `wait_for_end`, the call
    /// returns only after the session has ended.
    async fn start(&self, config: LaunchRequest, wait_for_end: bool) -> Result<bool, LaunchError>;

    /// Start the configuration called `name`, looked up in `folder` or, without one, in every
    /// known folder.
    async fn start_named(&self, folder: Option<&str>, name: &str) -> Result<bool, LaunchError>;
}

/// `{type, request: "launch", name: ""}`, the base every external request is laid over.
pub(crate) fn default_request() -> LaunchRequest {
    let mut request = LaunchRequest::new();
    request.insert("type", json!(DEFAULT_ADAPTER_TYPE));
    request.insert("request", json!("launch"));
    request.insert("name", json!(""));
    request
}

/// `name` falls back to `program` when empty.
pub(crate) fn default_name(request: &mut LaunchRequest) {
    if request.name().map_or(true, str::is_empty) {
        let program = request.get_str("program").unwrap_or_default().to_string();
        request.insert("name", Value::String(program));
    }
}
