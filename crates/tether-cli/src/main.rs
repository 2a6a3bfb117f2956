use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_config::{init_tracing, TetherConfig};
use tether_launch::{handle_uri, RpcOptions, RpcServer, SessionRegistry};
use tether_process::Environment;

use tether_cli::{launcher, load_config, proxy, HeadlessStarter};

/// Debug adapter launcher: runs debug sessions headlessly, serves launch requests and relays
/// adapter traffic.
#[derive(Debug, Parser)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `TETHER_CONFIG` is used as a fallback. When neither is provided, built-in
    /// defaults apply.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the launch gateway until interrupted.
    Serve {
        /// Address to listen on; overrides `rpc.listen`.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Workspace folder used for `${workspaceFolder}`.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Start the session described by a launch URI and wait for it to end.
    OpenUri {
        uri: String,

        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Ask a running gateway to debug a command line in this terminal.
    Launch {
        /// Gateway address.
        #[arg(long, env = "TETHER_LAUNCH_CONNECT")]
        connect: SocketAddr,

        /// Additional launch configuration as a YAML or JSON document.
        #[arg(long, env = "TETHER_LAUNCH_CONFIG")]
        config: Option<String>,

        #[arg(long, env = "TETHER_LAUNCH_TOKEN", hide_env_values = true)]
        token: Option<String>,

        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },

    /// Start the adapter and relay its DAP traffic over stdin/stdout.
    Proxy,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config);
    init_tracing(&config.logging);

    match cli.command {
        Command::Serve { listen, workspace } => serve(config, listen, workspace).await,
        Command::OpenUri { uri, workspace } => open_uri(config, &uri, workspace).await,
        Command::Launch {
            connect,
            config,
            token,
            cmd,
        } => {
            let request = launcher::launch_environment(cmd, config, token)?;
            let response = tether_launch::launch(connect, &request)
                .await
                .with_context(|| format!("launch request to {connect} failed"))?;
            if response.success {
                Ok(())
            } else {
                let message = response.message.unwrap_or_else(|| "launch failed".to_string());
                eprintln!("tether: {message}");
                std::process::exit(1);
            }
        }
        Command::Proxy => {
            let base_env = Environment::from_process(config.case_insensitive_env);
            let result =
                proxy::run(&config, &base_env, tokio::io::stdin(), tokio::io::stdout()).await;
            if let Err(err) = &result {
                eprintln!("tether: {err:#}");
            }
            // A blocking stdin read would otherwise keep the runtime from shutting down.
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
    }
}

fn headless_starter(
    config: Arc<TetherConfig>,
    sessions: Arc<SessionRegistry>,
    workspace: Option<PathBuf>,
) -> HeadlessStarter {
    let starter = HeadlessStarter::new(config, sessions);
    match workspace {
        Some(folder) => starter.with_workspace_folder(folder),
        None => starter,
    }
}

async fn serve(
    config: TetherConfig,
    listen: Option<SocketAddr>,
    workspace: Option<PathBuf>,
) -> anyhow::Result<()> {
    let addr = listen
        .or(config.rpc.listen)
        .context("no listen address; pass --listen or set rpc.listen")?;
    let options = RpcOptions::from(&config.rpc);

    let config = Arc::new(config);
    let sessions = SessionRegistry::new();
    let starter = Arc::new(headless_starter(config, Arc::clone(&sessions), workspace));
    let server = RpcServer::bind(addr, options, starter, sessions)
        .await
        .with_context(|| format!("failed to bind launch gateway on {addr}"))?;
    println!("Listening on {}", server.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    tracing::info!(target: "tether.launch", "shutting down launch gateway");
    server.shutdown().await;
    Ok(())
}

async fn open_uri(config: TetherConfig, uri: &str, workspace: Option<PathBuf>) -> anyhow::Result<()> {
    let sessions = SessionRegistry::new();
    let starter = headless_starter(Arc::new(config), Arc::clone(&sessions), workspace);
    let started = handle_uri(uri, &starter)
        .await
        .with_context(|| format!("failed to launch {uri}"))?;
    anyhow::ensure!(started, "the debug session did not start");

    // Sessions from URIs run detached; stay around until they are over.
    sessions.wait_idle().await;
    Ok(())
}
