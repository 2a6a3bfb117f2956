use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::dap::messages::{Event, Message, Request, Response};
use crate::dap_tokio::{DapReader, DapWriter};
use crate::error::{DapError, Result};

#[derive(Debug, Clone)]
pub struct DapClientConfig {
    /// Buffered events per subscription before slow subscribers start lagging.
    pub event_channel_size: usize,
}

impl Default for DapClientConfig {
    fn default() -> Self {
        Self {
            event_channel_size: 64,
        }
    }
}

/// Bound on closing the write side once the stream is done; a stuck write must not pin the
/// reader task.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct PendingTable {
    closed: bool,
    entries: HashMap<i64, oneshot::Sender<Response>>,
}

#[derive(Default)]
struct EventChannels {
    closed: bool,
    by_name: HashMap<String, broadcast::Sender<Event>>,
    all: Option<broadcast::Sender<Event>>,
}

struct Inner {
    writer: Mutex<DapWriter<BoxedWriter>>,
    pending: parking_lot::Mutex<PendingTable>,
    next_seq: AtomicI64,
    events: parking_lot::Mutex<EventChannels>,
    closed: CancellationToken,
    config: DapClientConfig,
}

/// DAP client half of a session: issues requests and correlates responses by `request_seq`.
///
/// One background task owns the read side of the stream. It resolves pending requests and
/// publishes events to per-name subscribers without waiting on them. When the stream ends,
/// every request still waiting fails with [`DapError::ConnectionClosed`].
#[derive(Clone)]
pub struct DapClient {
    inner: Arc<Inner>,
}

impl DapClient {
    pub async fn connect_tcp(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer))
    }

    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_parts(DapReader::new(reader), writer, DapClientConfig::default())
    }

    /// Build a client over an already-configured reader, e.g. one that enforces an
    /// `Auth-Token` on the first inbound frame.
    pub fn from_parts<R, W>(reader: DapReader<R>, writer: W, config: DapClientConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(Inner {
            writer: Mutex::new(DapWriter::new(Box::new(writer) as BoxedWriter)),
            pending: parking_lot::Mutex::new(PendingTable::default()),
            next_seq: AtomicI64::new(1),
            events: parking_lot::Mutex::new(EventChannels::default()),
            closed: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));
        Self { inner }
    }

    /// Send `command` and wait for the matching response.
    ///
    /// A response with `success: false` becomes [`DapError::RequestFailed`] carrying the
    /// adapter's error text.
    pub async fn send(&self, command: &str, arguments: Option<Value>) -> Result<Response> {
        self.request(command, arguments, None).await
    }

    pub async fn send_with_timeout(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Response> {
        self.request(command, arguments, Some(timeout)).await
    }

    /// Subscribe to events named `event`. Events published before subscribing are not replayed.
    pub fn subscribe(&self, event: &str) -> broadcast::Receiver<Event> {
        let mut channels = self.inner.events.lock();
        if channels.closed {
            return broadcast::channel(1).1;
        }
        let capacity = self.inner.config.event_channel_size;
        channels
            .by_name
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe()
    }

    /// Subscribe to every event regardless of name.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        let mut channels = self.inner.events.lock();
        if channels.closed {
            return broadcast::channel(1).1;
        }
        let capacity = self.inner.config.event_channel_size;
        channels
            .all
            .get_or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe()
    }

    /// Cancelled once the stream has ended, for whatever reason.
    pub fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Stop reading; pending requests fail with [`DapError::ConnectionClosed`].
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Write `command` now and hand back a handle to its response.
    ///
    /// Useful when a later request must follow this one on the wire before the response can
    /// arrive, such as `launch` followed by `configurationDone`.
    pub async fn submit(&self, command: &str, arguments: Option<Value>) -> Result<PendingResponse> {
        let seq = self.inner.next_seq();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.closed {
                return Err(DapError::ConnectionClosed);
            }
            pending.entries.insert(seq, tx);
        }

        tracing::trace!(target: "tether.dap", seq, command, "sending request");
        let request = Message::Request(Request::new(seq, command, arguments));
        let written = self.inner.writer.lock().await.write_message(&request).await;
        if let Err(err) = written {
            self.inner.forget(seq);
            return Err(err);
        }

        Ok(PendingResponse {
            seq,
            rx,
            inner: self.inner.clone(),
        })
    }

    async fn request(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.submit(command, arguments).await?.finish(timeout).await
    }
}

/// A request already written to the adapter, waiting for its response.
pub struct PendingResponse {
    seq: i64,
    rx: oneshot::Receiver<Response>,
    inner: Arc<Inner>,
}

impl PendingResponse {
    pub fn seq(&self) -> i64 {
        self.seq
    }

    pub async fn wait(self) -> Result<Response> {
        self.finish(None).await
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<Response> {
        self.finish(Some(timeout)).await
    }

    async fn finish(self, timeout: Option<Duration>) -> Result<Response> {
        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.rx).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    self.inner.forget(self.seq);
                    return Err(DapError::Timeout);
                }
            },
            None => self.rx.await,
        };
        let response = received.map_err(|_closed| DapError::ConnectionClosed)?;

        if !response.success {
            return Err(DapError::RequestFailed {
                command: response.command.clone(),
                message: response.error_message(),
            });
        }
        Ok(response)
    }
}

impl Inner {
    fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn forget(&self, seq: i64) {
        self.pending.lock().entries.remove(&seq);
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::Response(response) => {
                let waiter = self.pending.lock().entries.remove(&response.request_seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::debug!(
                        target: "tether.dap",
                        request_seq = response.request_seq,
                        command = %response.command,
                        "ignoring response to unknown request"
                    ),
                }
            }
            Message::Event(event) => self.publish(event),
            Message::Request(request) => self.reject_reverse_request(request).await,
        }
    }

    fn publish(&self, event: Event) {
        let channels = self.events.lock();
        if let Some(all) = &channels.all {
            let _ = all.send(event.clone());
        }
        if let Some(tx) = channels.by_name.get(&event.event) {
            let _ = tx.send(event);
        }
    }

    async fn reject_reverse_request(&self, request: Request) {
        tracing::debug!(
            target: "tether.dap",
            seq = request.seq,
            command = %request.command,
            "rejecting reverse request"
        );
        let message = format!("`{}` is not supported by this client", request.command);
        let response = Message::Response(Response::error(self.next_seq(), &request, message));
        if let Err(err) = self.writer.lock().await.write_message(&response).await {
            tracing::debug!(target: "tether.dap", error = %err, "failed to answer reverse request");
        }
    }

    fn shutdown(&self) {
        {
            let mut pending = self.pending.lock();
            pending.closed = true;
            // Dropping the senders fails every waiter with `ConnectionClosed`.
            pending.entries.clear();
        }
        {
            let mut channels = self.events.lock();
            channels.closed = true;
            channels.by_name.clear();
            channels.all = None;
        }
        self.closed.cancel();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: DapReader<R>, inner: Arc<Inner>) {
    loop {
        let message = tokio::select! {
            _ = inner.closed.cancelled() => break,
            message = reader.read_message() => message,
        };

        match message {
            Ok(Some(message)) => inner.dispatch(message).await,
            Ok(None) => {
                tracing::debug!(target: "tether.dap", "DAP stream closed by peer");
                break;
            }
            Err(err) => {
                tracing::warn!(target: "tether.dap", error = %err, "DAP stream failed");
                break;
            }
        }
    }

    inner.shutdown();

    // The peer sees EOF even while clones of this client are still around.
    let _ = tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, async {
        inner.writer.lock().await.shutdown().await
    })
    .await;
}
