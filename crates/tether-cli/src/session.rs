//! Headless debug sessions: the [`SessionStarter`] behind `tether serve` and `tether open-uri`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tether_config::{resolve, LaunchRequest, ResolveContext, TetherConfig};
use tether_dap::{generate_auth_token, DapClient, DapClientConfig, DapError, ReverseConnector};
use tether_launch::{LaunchError, SessionGuard, SessionRegistry, SessionStarter, SESSION_ID_KEY};
use tether_process::{
    start, AdapterProcess, AdapterSpawnParams, Environment, HandshakeOptions, SpawnMode,
    StartError,
};
use tokio::sync::broadcast;

/// How long the adapter gets to answer `disconnect` once a session is over.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Starts sessions against the configured adapter without any editor attached.
pub struct HeadlessStarter {
    config: Arc<TetherConfig>,
    sessions: Arc<SessionRegistry>,
    base_env: Environment,
    workspace_folder: Option<PathBuf>,
}

impl HeadlessStarter {
    pub fn new(config: Arc<TetherConfig>, sessions: Arc<SessionRegistry>) -> Self {
        let base_env = Environment::from_process(config.case_insensitive_env);
        Self {
            config,
            sessions,
            base_env,
            workspace_folder: None,
        }
    }

    /// Folder `${workspaceFolder}` refers to when a request does not name one.
    pub fn with_workspace_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.workspace_folder = Some(folder.into());
        self
    }

    /// Environment the adapter (and `${env:NAME}`) starts from instead of this process's.
    pub fn with_base_environment(mut self, env: Environment) -> Self {
        self.base_env = env;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    async fn launch(
        &self,
        mut request: LaunchRequest,
        wait_for_end: bool,
        workspace_folder: Option<PathBuf>,
    ) -> Result<bool, LaunchError> {
        let id = match request.remove(SESSION_ID_KEY) {
            Some(Value::String(id)) => id,
            _ => SessionRegistry::new_session_id()
                .map_err(|err| LaunchError::Start(format!("failed to generate session id: {err}")))?,
        };

        let cx = ResolveContext {
            workspace_folder: workspace_folder.or_else(|| self.workspace_folder.clone()),
            env: self
                .base_env
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        };
        let request = resolve(request, &self.config, &cx)?;
        let name = request.name().unwrap_or_default().to_string();
        tracing::info!(target: "tether.launch", session = %id, name = %name, "starting debug session");

        let adapter = self.connect_adapter().await?;
        let session = match adapter.configure(request, self.config.adapter.handshake_timeout()).await {
            Ok(session) => session,
            Err(err) => {
                adapter.shutdown().await;
                return Err(err);
            }
        };

        let Some(guard) = self.sessions.register(id.clone(), name) else {
            adapter.shutdown().await;
            return Err(LaunchError::Start(format!("session id `{id}` is already in use")));
        };

        if wait_for_end {
            adapter.run_to_end(session, guard).await;
        } else {
            tokio::spawn(adapter.run_to_end(session, guard));
        }
        Ok(true)
    }

    /// Spawn the adapter and open the DAP connection to it.
    async fn connect_adapter(&self) -> Result<ConnectedAdapter, LaunchError> {
        let adapter = &self.config.adapter;
        let timeout = adapter.handshake_timeout();

        if !adapter.reverse {
            let params = AdapterSpawnParams::build(adapter, &self.base_env, &SpawnMode::Listen, None)
                .map_err(StartError::from)
                .map_err(start_failed)?;
            let started = start(params, &HandshakeOptions::with_timeout(timeout))
                .await
                .map_err(start_failed)?;
            let Some(port) = started.port() else {
                return Err(LaunchError::Start(
                    "adapter did not announce a valid port".to_string(),
                ));
            };
            let process = started.process;

            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            let client = match DapClient::connect_tcp(addr).await {
                Ok(client) => client,
                Err(err) => {
                    process.terminate().await;
                    return Err(dap_failed(err));
                }
            };
            tracing::debug!(target: "tether.launch", port, "connected to adapter");
            return Ok(ConnectedAdapter {
                process,
                client,
                connector: None,
            });
        }

        let token = generate_auth_token()?;
        let connector = ReverseConnector::listen(token.clone())
            .await
            .map_err(dap_failed)?;
        let mode = SpawnMode::Connect {
            port: connector.port(),
        };
        let params = AdapterSpawnParams::build(adapter, &self.base_env, &mode, Some(&token))
            .map_err(StartError::from)
            .map_err(start_failed)?;
        let options = HandshakeOptions {
            ready: None,
            ..HandshakeOptions::with_timeout(timeout)
        };
        let process = start(params, &options).await.map_err(start_failed)?.process;

        let accepted = accept_from(
            &process,
            timeout,
            connector.accept_client(DapClientConfig::default()),
        )
        .await;
        match accepted {
            Ok(client) => Ok(ConnectedAdapter {
                process,
                client,
                connector: Some(connector),
            }),
            Err(err) => {
                connector.dispose();
                process.terminate().await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl SessionStarter for HeadlessStarter {
    async fn start(&self, config: LaunchRequest, wait_for_end: bool) -> Result<bool, LaunchError> {
        self.launch(config, wait_for_end, None).await
    }

    async fn start_named(&self, folder: Option<&str>, name: &str) -> Result<bool, LaunchError> {
        let Some(named) = self.config.find_configuration(folder, name) else {
            return Err(LaunchError::Start(match folder {
                Some(folder) => format!("no launch configuration named `{name}` in `{folder}`"),
                None => format!("no launch configuration named `{name}`"),
            }));
        };
        let folder = named.folder.clone().map(PathBuf::from);
        self.launch(named.to_request(), false, folder).await
    }
}

/// Wait for the adapter to dial back, giving up when it exits or `timeout` passes.
pub(crate) async fn accept_from<T>(
    process: &AdapterProcess,
    timeout: Duration,
    accept: impl std::future::Future<Output = tether_dap::Result<T>>,
) -> Result<T, LaunchError> {
    tokio::select! {
        accepted = accept => accepted.map_err(dap_failed),
        exit = process.wait_exit() => Err(start_failed(StartError::Handshake {
            code: exit.code,
            signal: exit.signal,
            output: String::new(),
        })),
        _ = tokio::time::sleep(timeout) => Err(start_failed(StartError::Timeout {
            output: String::new(),
        })),
    }
}

fn start_failed(err: StartError) -> LaunchError {
    if let Some(output) = err.output().filter(|output| !output.is_empty()) {
        tracing::warn!(target: "tether.launch", output, "adapter output before failure");
    }
    LaunchError::Start(err.to_string())
}

fn dap_failed(err: DapError) -> LaunchError {
    LaunchError::Start(err.to_string())
}

struct ConnectedAdapter {
    process: AdapterProcess,
    client: DapClient,
    connector: Option<ReverseConnector>,
}

/// Subscriptions taken before the session starts, so no end-of-session event is missed.
struct SessionEvents {
    terminated: broadcast::Receiver<tether_dap::Event>,
    exited: broadcast::Receiver<tether_dap::Event>,
}

impl ConnectedAdapter {
    /// `initialize`, `launch`/`attach`, then `configurationDone` once the adapter reports
    /// `initialized`. Fails if the adapter exits or refuses any of them.
    async fn configure(
        &self,
        request: LaunchRequest,
        timeout: Duration,
    ) -> Result<SessionEvents, LaunchError> {
        let events = SessionEvents {
            terminated: self.client.subscribe("terminated"),
            exited: self.client.subscribe("exited"),
        };

        tokio::select! {
            configured = self.configure_inner(request, timeout) => configured.map_err(dap_failed)?,
            exit = self.process.wait_exit() => {
                return Err(LaunchError::Start(format!(
                    "the debug adapter exited during session setup (code {:?}, signal {:?})",
                    exit.code, exit.signal
                )));
            }
        }
        Ok(events)
    }

    async fn configure_inner(&self, request: LaunchRequest, timeout: Duration) -> tether_dap::Result<()> {
        let mut initialized = self.client.subscribe("initialized");
        let adapter_id = request.get_str("type").unwrap_or("lldb").to_string();
        self.client
            .send_with_timeout(
                "initialize",
                Some(json!({
                    "clientID": "tether",
                    "clientName": "tether",
                    "adapterID": adapter_id,
                    "linesStartAt1": true,
                    "columnsStartAt1": true,
                    "pathFormat": "path",
                })),
                timeout,
            )
            .await?;

        let command = match request.get_str("request") {
            Some("attach") => "attach",
            _ => "launch",
        };
        let launched = self.client.submit(command, Some(request.into_value())).await?;

        if tokio::time::timeout(timeout, initialized.recv()).await.is_err() {
            tracing::warn!(target: "tether.launch", "adapter never sent `initialized`; configuring anyway");
        }
        self.client.send("configurationDone", None).await?;
        launched.wait().await?;
        Ok(())
    }

    /// Keep the session registered until the debuggee ends or the adapter goes away, then
    /// tear everything down.
    async fn run_to_end(self, mut events: SessionEvents, guard: SessionGuard) {
        let closed = self.client.closed();
        let reason = tokio::select! {
            _ = events.terminated.recv() => "terminated",
            _ = events.exited.recv() => "exited",
            _ = closed.cancelled() => "connection closed",
            _ = self.process.wait_exit() => "adapter exited",
        };
        tracing::info!(target: "tether.launch", session = %guard.id(), reason, "debug session ended");

        self.shutdown().await;
        drop(guard);
    }

    async fn shutdown(self) {
        if !self.client.is_closed() {
            let disconnect = self
                .client
                .send_with_timeout(
                    "disconnect",
                    Some(json!({ "terminateDebuggee": true })),
                    DISCONNECT_TIMEOUT,
                )
                .await;
            if let Err(err) = disconnect {
                tracing::debug!(target: "tether.launch", error = %err, "disconnect failed");
            }
            // A well-behaved adapter exits on its own after `disconnect`.
            let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, self.process.wait_exit()).await;
        }
        self.client.close();
        if let Some(connector) = &self.connector {
            connector.dispose();
        }
        let exit = self.process.terminate().await;
        tracing::debug!(target: "tether.launch", code = ?exit.code, signal = ?exit.signal, "adapter stopped");
    }
}
