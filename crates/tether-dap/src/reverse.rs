use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::client::{DapClient, DapClientConfig};
use crate::dap::messages::Message;
use crate::dap_tokio::{DapReader, DapWriter};
use crate::error::{DapError, Result};

#[derive(Debug, Clone)]
pub struct ReverseConnectorConfig {
    /// Inbound messages buffered per subscriber.
    pub channel_size: usize,
}

impl Default for ReverseConnectorConfig {
    fn default() -> Self {
        Self { channel_size: 256 }
    }
}

struct Inner {
    port: u16,
    token: String,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    writer: Mutex<Option<DapWriter<OwnedWriteHalf>>>,
    messages: broadcast::Sender<Message>,
    connected: AtomicBool,
    authenticated: CancellationToken,
    disposed: CancellationToken,
    connection_closed: CancellationToken,
}

/// Accepts the single connection an adapter makes back to us when started with
/// `--connect <port> --auth-token <token>`.
///
/// The listening port is known as soon as [`ReverseConnector::listen`] returns, so it can be
/// put on the adapter's command line before anything connects. The peer must present the
/// matching `Auth-Token` header before anything is published or written to it; a missing or
/// wrong token tears the connection down.
pub struct ReverseConnector {
    inner: Arc<Inner>,
}

impl ReverseConnector {
    /// Listen on an ephemeral loopback port.
    pub async fn listen(token: impl Into<String>) -> Result<Self> {
        Self::listen_on(0, token, ReverseConnectorConfig::default()).await
    }

    pub async fn listen_on(
        port: u16,
        token: impl Into<String>,
        config: ReverseConnectorConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
        let port = listener.local_addr()?.port();
        let (messages, _) = broadcast::channel(config.channel_size);
        tracing::debug!(target: "tether.dap", port, "reverse connector listening");

        Ok(Self {
            inner: Arc::new(Inner {
                port,
                token: token.into(),
                listener: parking_lot::Mutex::new(Some(listener)),
                writer: Mutex::new(None),
                messages,
                connected: AtomicBool::new(false),
                authenticated: CancellationToken::new(),
                disposed: CancellationToken::new(),
                connection_closed: CancellationToken::new(),
            }),
        })
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// Inbound messages from the adapter. Subscribe before [`ReverseConnector::accept`] to see
    /// the first one.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inner.messages.subscribe()
    }

    /// Wait for the adapter to connect, then publish its messages to subscribers once it has
    /// authenticated.
    ///
    /// The listening socket is closed as soon as one connection has been accepted.
    pub async fn accept(&self) -> Result<()> {
        let stream = self.accept_stream().await?;
        let (read, write) = stream.into_split();
        self.inner.connected.store(true, Ordering::SeqCst);

        let reader = DapReader::with_auth_token(read, self.inner.token.clone());
        tokio::spawn(pump(self.inner.clone(), reader, write));
        Ok(())
    }

    /// Accept the adapter's connection and drive it with a [`DapClient`] instead of the
    /// message stream.
    ///
    /// Returns only after the peer has authenticated; nothing is written to it before that.
    /// Disposing the connector closes the client.
    pub async fn accept_client(&self, config: DapClientConfig) -> Result<DapClient> {
        let stream = self.accept_stream().await?;
        let (read, write) = stream.into_split();
        self.inner.connected.store(true, Ordering::SeqCst);

        let mut reader = DapReader::with_auth_token(read, self.inner.token.clone());
        let authenticated = tokio::select! {
            _ = self.inner.disposed.cancelled() => Err(DapError::ConnectionClosed),
            authenticated = reader.wait_authenticated() => authenticated,
        };
        if let Err(err) = authenticated {
            self.reject(&err);
            return Err(err);
        }
        self.inner.authenticated.cancel();

        let client = DapClient::from_parts(reader, write, config);
        let (closed, disposed) = (client.closed(), self.inner.disposed.clone());
        let connection_closed = self.inner.connection_closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = disposed.cancelled() => closed.cancel(),
                _ = closed.cancelled() => {}
            }
            connection_closed.cancel();
        });
        Ok(client)
    }

    /// Resolves once the accepted connection has presented the right token. Fails if nothing
    /// has been accepted yet, or if the connection ends or the connector is disposed first.
    pub async fn wait_authenticated(&self) -> Result<()> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(DapError::ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.inner.authenticated.cancelled() => Ok(()),
            _ = self.inner.connection_closed.cancelled() => Err(DapError::ConnectionClosed),
            _ = self.inner.disposed.cancelled() => Err(DapError::ConnectionClosed),
        }
    }

    /// Frame and send `message` to the adapter, waiting for it to authenticate first.
    pub async fn handle_message(&self, message: &Message) -> Result<()> {
        self.wait_authenticated().await?;
        let mut writer = self.inner.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(DapError::ConnectionClosed);
        };
        writer.write_message(message).await
    }

    /// Cancelled when an accepted connection ends (peer EOF, decode or auth failure, dispose).
    pub fn closed(&self) -> CancellationToken {
        self.inner.connection_closed.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }

    /// Close the listening socket and the connection. Calling it again does nothing.
    pub fn dispose(&self) {
        if self.inner.disposed.is_cancelled() {
            return;
        }
        self.inner.disposed.cancel();
        self.inner.listener.lock().take();
        // A writer busy in `handle_message` is released by the pump task on its way out.
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        tracing::debug!(target: "tether.dap", port = self.inner.port, "reverse connector disposed");
    }

    fn reject(&self, err: &DapError) {
        log_rejection(self.inner.port, err);
        self.inner.connection_closed.cancel();
    }

    async fn accept_stream(&self) -> Result<TcpStream> {
        let listener = self.inner.listener.lock().take().ok_or_else(|| {
            if self.inner.disposed.is_cancelled() {
                DapError::ConnectionClosed
            } else {
                DapError::Protocol("reverse connector already accepted a connection".to_string())
            }
        })?;

        let (stream, peer) = tokio::select! {
            _ = self.inner.disposed.cancelled() => return Err(DapError::ConnectionClosed),
            accepted = listener.accept() => accepted?,
        };
        drop(listener);

        let _ = stream.set_nodelay(true);
        tracing::debug!(target: "tether.dap", %peer, port = self.inner.port, "adapter connected");
        Ok(stream)
    }
}

impl Drop for ReverseConnector {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn pump(inner: Arc<Inner>, mut reader: DapReader<OwnedReadHalf>, write: OwnedWriteHalf) {
    // Nothing goes out, and nothing is published, until the peer has proven it knows the token.
    let authenticated = tokio::select! {
        _ = inner.disposed.cancelled() => false,
        authenticated = reader.wait_authenticated() => match authenticated {
            Ok(()) => true,
            Err(err) => {
                log_rejection(inner.port, &err);
                false
            }
        },
    };

    if authenticated {
        *inner.writer.lock().await = Some(DapWriter::new(write));
        inner.authenticated.cancel();
        relay_inbound(&inner, &mut reader).await;
    } else {
        drop(write);
    }

    inner.writer.lock().await.take();
    inner.connection_closed.cancel();
}

async fn relay_inbound(inner: &Inner, reader: &mut DapReader<OwnedReadHalf>) {
    loop {
        let next = tokio::select! {
            _ = inner.disposed.cancelled() => break,
            next = reader.read_message() => next,
        };

        match next {
            Ok(Some(message)) => {
                let _ = inner.messages.send(message);
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(target: "tether.dap", error = %err, "reverse connection failed");
                break;
            }
        }
    }
}

fn log_rejection(port: u16, err: &DapError) {
    match err {
        DapError::Auth => tracing::warn!(
            target: "tether.dap",
            port,
            "reverse connection presented a missing or wrong auth token; dropping it"
        ),
        err => tracing::debug!(
            target: "tether.dap",
            port,
            error = %err,
            "reverse connection ended before authenticating"
        ),
    }
}
