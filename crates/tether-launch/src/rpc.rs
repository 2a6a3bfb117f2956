//! The launch gateway: one YAML (or JSON) request per TCP connection.
//!
//! A client connects, writes its document and half-closes. The server reads to end of input,
//! starts the session and answers with a [`LaunchResponse`] before closing.
//!
//! When a token is configured, requests that do not carry it (including documents too broken to
//! read it from) get an empty reply, so a client without the token learns nothing about it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_config::{LaunchRequest, RpcConfig};
use tether_dap::auth::tokens_match;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::sessions::{SessionRegistry, SESSION_ID_KEY};
use crate::{default_name, default_request, LaunchError, SessionStarter};

/// Requests larger than this are dropped unread.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LaunchResponse {
    pub fn ok(success: bool) -> Self {
        Self {
            success,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// The terminal a launcher runs in: a tty device name or a console process id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TerminalId {
    Tty(String),
    Pid(u64),
}

impl TerminalId {
    fn to_value(&self) -> Value {
        match self {
            TerminalId::Tty(name) => Value::String(name.clone()),
            TerminalId::Pid(pid) => Value::from(*pid),
        }
    }
}

/// A launcher's command line and surroundings, to be debugged in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub struct LaunchEnvironment {
    pub cmd: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub env: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<TerminalId>,
    /// Extra configuration as an embedded YAML/JSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl LaunchEnvironment {
    /// The launch configuration this environment stands for.
    pub fn into_request(self) -> Result<LaunchRequest, LaunchError> {
        let mut embedded = match self.config.as_deref() {
            Some(text) => match serde_yaml::from_str::<Value>(text)? {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                _ => {
                    return Err(LaunchError::Start(
                        "embedded launch configuration must be a mapping".to_string(),
                    ))
                }
            },
            None => Map::new(),
        };

        let mut cmd = self.cmd.into_iter();
        let Some(program) = cmd.next() else {
            return Err(LaunchError::Start("empty command line".to_string()));
        };

        let mut request = default_request();
        request.insert("program", Value::String(program));
        request.insert("args", Value::Array(cmd.map(Value::String).collect()));
        if let Some(terminal) = &self.terminal_id {
            request.insert("terminal", terminal.to_value());
        }
        if let Some(token) = self.token {
            request.insert("token", Value::String(token));
        }

        request.insert("waitEndOfSession", Value::Bool(true));

        let mut env = self.env;
        if let Some(Value::Object(extra)) = embedded.remove("env") {
            env.extend(extra);
        }
        for (key, value) in embedded {
            request.insert(key, value);
        }
        request.insert("env", Value::Object(env));
        request.insert("relativePathBase", Value::String(self.cwd));
        Ok(request)
    }
}

#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub token: Option<String>,
    /// How long a waiting request gives its session to come up.
    pub end_of_session_timeout: Duration,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self::from(&RpcConfig::default())
    }
}

impl From<&RpcConfig> for RpcOptions {
    fn from(config: &RpcConfig) -> Self {
        Self {
            token: config.token.clone().filter(|token| !token.is_empty()),
            end_of_session_timeout: config.end_of_session_timeout(),
        }
    }
}

struct ServerState {
    options: RpcOptions,
    starter: Arc<dyn SessionStarter>,
    sessions: Arc<SessionRegistry>,
}

/// A running launch gateway. Dropping it without [`RpcServer::shutdown`] leaves the accept loop
/// running until the runtime stops.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RpcServer {
    pub async fn bind(
        addr: SocketAddr,
        options: RpcOptions,
        starter: Arc<dyn SessionStarter>,
        sessions: Arc<SessionRegistry>,
    ) -> Result<Self, LaunchError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            target: "tether.launch",
            addr = %local_addr,
            authenticated = options.token.is_some(),
            "launch gateway listening"
        );

        let state = Arc::new(ServerState {
            options,
            starter,
            sessions,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, state, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Requests already being handled run to completion.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            res = listener.accept() => {
                let (stream, peer_addr) = match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(target: "tether.launch", error = %err, "failed to accept launch connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, &state).await {
                        tracing::debug!(
                            target: "tether.launch",
                            peer = %peer_addr,
                            error = %err,
                            "launch connection failed"
                        );
                    }
                });
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: &ServerState) -> std::io::Result<()> {
    let mut raw = Vec::new();
    (&mut stream)
        .take(MAX_REQUEST_BYTES as u64 + 1)
        .read_to_end(&mut raw)
        .await?;

    let response = if raw.len() > MAX_REQUEST_BYTES {
        unreadable(state, "request too large")
    } else {
        match String::from_utf8(raw) {
            Ok(text) => process_request(&text, state).await,
            Err(_) => unreadable(state, "request is not valid UTF-8"),
        }
    };

    if let Some(response) = response {
        let body = serde_json::to_vec(&response)?;
        stream.write_all(&body).await?;
    }
    stream.shutdown().await
}

/// Reply for a request that cannot be read far enough to check its token.
fn unreadable(state: &ServerState, message: &str) -> Option<LaunchResponse> {
    match state.options.token {
        Some(_) => None,
        None => Some(LaunchResponse::failure(message)),
    }
}

async fn process_request(text: &str, state: &ServerState) -> Option<LaunchResponse> {
    let mut request = match parse_request(text) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!(target: "tether.launch", error = %err, "rejected launch request");
            return unreadable(state, &err.to_string());
        }
    };

    // Never forwarded to the session, whether or not the gateway checks it.
    let presented = request.remove("token");
    if let Some(expected) = &state.options.token {
        let matches = presented
            .as_ref()
            .and_then(Value::as_str)
            .is_some_and(|token| tokens_match(token, expected));
        if !matches {
            tracing::warn!(target: "tether.launch", "launch request with a missing or wrong token");
            return None;
        }
    }

    let wait_for_end = request
        .remove("waitEndOfSession")
        .and_then(|value| value.as_bool())
        .unwrap_or(false);

    let result = if wait_for_end {
        start_and_wait(request, state).await
    } else {
        state.starter.start(request, false).await
    };

    Some(match result {
        Ok(success) => LaunchResponse::ok(success),
        Err(err) => LaunchResponse::failure(err.to_string()),
    })
}

/// Parse a naked configuration or a [`LaunchEnvironment`] document.
pub fn parse_request(text: &str) -> Result<LaunchRequest, LaunchError> {
    let document: Value = serde_yaml::from_str(text)?;
    let Value::Object(map) = document else {
        return Err(LaunchError::Start(
            "launch request must be a mapping".to_string(),
        ));
    };

    let mut request = if map.get("type").and_then(Value::as_str) == Some("LaunchEnvironment") {
        let environment: LaunchEnvironment = serde_json::from_value(Value::Object(map))
            .map_err(|err| LaunchError::Start(format!("invalid LaunchEnvironment: {err}")))?;
        environment.into_request()?
    } else {
        let mut request = default_request();
        request.insert("env", Value::Object(Map::new()));
        for (key, value) in map {
            request.insert(key, value);
        }
        request
    };
    default_name(&mut request);
    Ok(request)
}

/// Start a session and resolve when it ends. Fails if the session has not come up within the
/// configured window.
async fn start_and_wait(mut request: LaunchRequest, state: &ServerState) -> Result<bool, LaunchError> {
    let id = SessionRegistry::new_session_id()
        .map_err(|err| LaunchError::Start(format!("failed to generate session id: {err}")))?;
    request.insert(SESSION_ID_KEY, Value::String(id.clone()));

    let start = state.starter.start(request, true);
    tokio::pin!(start);

    let registered = tokio::time::timeout(
        state.options.end_of_session_timeout,
        state.sessions.wait_registered(&id),
    );
    tokio::select! {
        result = &mut start => return result,
        registered = registered => {
            if registered.is_err() {
                tracing::warn!(target: "tether.launch", session = %id, "session did not start in time");
                return Ok(false);
            }
        }
    }

    let result = start.await;
    state.sessions.wait_removed(&id).await;
    result
}
