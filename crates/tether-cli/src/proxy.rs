//! `tether proxy`: start the adapter in reverse mode and relay DAP traffic between it and a
//! byte stream (normally this process's stdin/stdout).

use std::time::Duration;

use anyhow::Context;
use tether_config::TetherConfig;
use tether_dap::dap_tokio::{DapReader, DapWriter};
use tether_dap::{generate_auth_token, Message, ReverseConnector};
use tether_process::{
    start, AdapterProcess, AdapterSpawnParams, Environment, HandshakeOptions, SpawnMode,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::session::accept_from;

/// How long the connection gets to deliver what the adapter wrote before it exited.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Relay until the editor side closes its input, the adapter drops the connection or the
/// adapter exits. The adapter is stopped before this returns.
pub async fn run<R, W>(config: &TetherConfig, base_env: &Environment, input: R, output: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let token = generate_auth_token().context("failed to generate an auth token")?;
    let connector = ReverseConnector::listen(token.clone())
        .await
        .context("failed to listen for the adapter connection")?;
    // Subscribed before accepting, so the adapter's first message is not missed.
    let inbound = connector.subscribe();

    let mode = SpawnMode::Connect {
        port: connector.port(),
    };
    let params = AdapterSpawnParams::build(&config.adapter, base_env, &mode, Some(&token))
        .context("invalid adapter configuration")?;
    let timeout = config.adapter.handshake_timeout();
    let options = HandshakeOptions {
        ready: None,
        ..HandshakeOptions::with_timeout(timeout)
    };
    let process = start(params, &options).await?.process;

    let accepted = accept_from(&process, timeout, async {
        connector.accept().await?;
        connector.wait_authenticated().await
    })
    .await;
    if let Err(err) = accepted {
        connector.dispose();
        process.terminate().await;
        return Err(err.into());
    }
    tracing::info!(target: "tether.launch", port = connector.port(), "adapter connected; relaying");

    let mut writer = DapWriter::new(output);
    let relayed = relay(&connector, &process, inbound, DapReader::new(input), &mut writer).await;

    connector.dispose();
    process.terminate().await;
    let _ = writer.shutdown().await;
    relayed
}

async fn relay<R, W>(
    connector: &ReverseConnector,
    process: &AdapterProcess,
    mut inbound: broadcast::Receiver<Message>,
    mut reader: DapReader<R>,
    writer: &mut DapWriter<W>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let closed = connector.closed();

    loop {
        tokio::select! {
            message = reader.read_message() => match message.context("failed to read from the editor")? {
                Some(message) => connector.handle_message(&message).await?,
                None => break,
            },
            message = inbound.recv() => match message {
                Ok(message) => writer.write_message(&message).await?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "tether.launch", skipped, "dropped adapter messages");
                }
                Err(RecvError::Closed) => break,
            },
            _ = closed.cancelled() => break,
            exit = process.wait_exit() => {
                tracing::info!(target: "tether.launch", code = ?exit.code, signal = ?exit.signal, "adapter exited");
                let _ = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, closed.cancelled()).await;
                break;
            }
        }
    }

    // Whatever the adapter sent before it went away still belongs to the editor.
    loop {
        match inbound.try_recv() {
            Ok(message) => writer.write_message(&message).await?,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    Ok(())
}
