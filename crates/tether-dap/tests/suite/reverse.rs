use std::sync::Arc;
use std::time::Duration;

use tether_dap::dap_tokio::{DapReader, DapWriter};
use tether_dap::{DapClientConfig, DapError, Event, Message, Request, ReverseConnector};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn dial(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

#[tokio::test]
async fn port_is_known_before_any_connection() {
    let connector = ReverseConnector::listen("token").await.unwrap();
    assert_ne!(connector.port(), 0);
    assert_eq!(connector.token(), "token");
}

#[tokio::test]
async fn authenticated_adapter_exchanges_messages() {
    let connector = ReverseConnector::listen("good-token").await.unwrap();
    let mut inbound = connector.subscribe();
    let port = connector.port();

    let adapter = tokio::spawn(async move {
        let (read, write) = dial(port).await.into_split();
        let mut writer = DapWriter::with_auth_token(write, "good-token");
        writer
            .write_message(&Message::Event(Event::new(1, "initialized", None)))
            .await
            .unwrap();
        DapReader::new(read).read_message().await.unwrap()
    });

    connector.accept().await.unwrap();
    let message = tokio::time::timeout(TIMEOUT, inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, Message::Event(Event::new(1, "initialized", None)));

    let outbound = Message::Request(Request::new(1, "configurationDone", None));
    connector.handle_message(&outbound).await.unwrap();
    assert_eq!(adapter.await.unwrap(), Some(outbound));

    assert!(matches!(inbound.try_recv(), Err(TryRecvError::Empty)));
}

async fn assert_rejected(connector: ReverseConnector, writer_token: Option<&'static str>) {
    let mut inbound = connector.subscribe();
    let port = connector.port();

    let adapter = tokio::spawn(async move {
        let (mut read, write) = dial(port).await.into_split();
        let mut writer = match writer_token {
            Some(token) => DapWriter::with_auth_token(write, token),
            None => DapWriter::new(write),
        };
        writer
            .write_message(&Message::Event(Event::new(1, "output", None)))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        // The connector hangs up without answering.
        read.read(&mut buf).await.unwrap_or(0)
    });

    connector.accept().await.unwrap();
    tokio::time::timeout(TIMEOUT, connector.closed().cancelled())
        .await
        .unwrap();

    assert_eq!(adapter.await.unwrap(), 0);
    assert!(matches!(inbound.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(
        connector
            .handle_message(&Message::Event(Event::new(2, "output", None)))
            .await,
        Err(DapError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn wrong_token_drops_connection_silently() {
    let connector = ReverseConnector::listen("good-token").await.unwrap();
    assert_rejected(connector, Some("bad-token")).await;
}

#[tokio::test]
async fn missing_token_drops_connection_silently() {
    let connector = ReverseConnector::listen("good-token").await.unwrap();
    assert_rejected(connector, None).await;
}

#[tokio::test]
async fn only_one_connection_is_accepted() {
    let connector = ReverseConnector::listen("t").await.unwrap();
    let port = connector.port();

    let first = tokio::spawn(async move { dial(port).await });
    connector.accept().await.unwrap();
    let _first = first.await.unwrap();

    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    assert!(matches!(
        connector.accept().await,
        Err(DapError::Protocol(_))
    ));
}

#[tokio::test]
async fn dispose_is_idempotent_and_closes_listener() {
    let connector = ReverseConnector::listen("t").await.unwrap();
    let port = connector.port();

    connector.dispose();
    connector.dispose();
    assert!(connector.is_disposed());

    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    assert!(matches!(
        connector.accept().await,
        Err(DapError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn dispose_interrupts_pending_accept() {
    let connector = Arc::new(ReverseConnector::listen("t").await.unwrap());
    let accept = tokio::spawn({
        let connector = connector.clone();
        async move { connector.accept().await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    connector.dispose();

    let result = tokio::time::timeout(TIMEOUT, accept).await.unwrap().unwrap();
    assert!(matches!(result, Err(DapError::ConnectionClosed)), "{result:?}");
}

#[tokio::test]
async fn dispose_tears_down_active_connection() {
    let connector = ReverseConnector::listen("t").await.unwrap();
    let port = connector.port();

    let adapter = tokio::spawn(async move {
        let (mut read, write) = dial(port).await.into_split();
        let mut writer = DapWriter::with_auth_token(write, "t");
        writer
            .write_message(&Message::Event(Event::new(1, "initialized", None)))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        (read.read(&mut buf).await.unwrap_or(0), writer)
    });

    connector.accept().await.unwrap();
    connector.dispose();

    let (n, _writer) = tokio::time::timeout(TIMEOUT, adapter).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn accept_client_drives_a_dap_client() {
    let connector = ReverseConnector::listen("client-token").await.unwrap();
    let port = connector.port();

    let adapter = tokio::spawn(async move {
        let (read, write) = dial(port).await.into_split();
        let mut reader = DapReader::new(read);
        let mut writer = DapWriter::with_auth_token(write, "client-token");
        writer.send_auth_token().await.unwrap();
        let Some(Message::Request(request)) = reader.read_message().await.unwrap() else {
            panic!("expected a request");
        };
        let response = tether_dap::Response::success(1, &request, None);
        writer
            .write_message(&Message::Response(response))
            .await
            .unwrap();
        request.command
    });

    let client = connector
        .accept_client(DapClientConfig::default())
        .await
        .unwrap();
    let response = client.send("initialize", None).await.unwrap();
    assert!(response.success);
    assert_eq!(adapter.await.unwrap(), "initialize");
}

#[tokio::test]
async fn silent_peer_is_never_written_to() {
    let connector = ReverseConnector::listen("t").await.unwrap();
    let port = connector.port();

    let peer = tokio::spawn(async move {
        let mut stream = dial(port).await;
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_millis(300), stream.read(&mut buf))
            .await
            .map(|read| read.unwrap_or(0));
        (read, stream)
    });

    connector.accept().await.unwrap();
    let outbound = Message::Request(Request::new(1, "initialize", None));
    let sent = tokio::time::timeout(
        Duration::from_millis(200),
        connector.handle_message(&outbound),
    )
    .await;
    assert!(sent.is_err(), "handle_message completed for an unauthenticated peer");

    // Timing out means the peer received nothing at all.
    let (read, _stream) = peer.await.unwrap();
    assert!(read.is_err(), "peer received {read:?}");
    assert!(!connector.closed().is_cancelled());
}

#[tokio::test]
async fn early_auth_line_unblocks_outbound_messages() {
    let connector = ReverseConnector::listen("t").await.unwrap();
    let port = connector.port();

    let adapter = tokio::spawn(async move {
        let (read, write) = dial(port).await.into_split();
        let mut writer = DapWriter::with_auth_token(write, "t");
        writer.send_auth_token().await.unwrap();
        let message = DapReader::new(read).read_message().await.unwrap();
        (message, writer)
    });

    connector.accept().await.unwrap();
    tokio::time::timeout(TIMEOUT, connector.wait_authenticated())
        .await
        .unwrap()
        .unwrap();
    let outbound = Message::Request(Request::new(1, "initialize", None));
    connector.handle_message(&outbound).await.unwrap();

    let (message, _writer) = tokio::time::timeout(TIMEOUT, adapter).await.unwrap().unwrap();
    assert_eq!(message, Some(outbound));
}

#[tokio::test]
async fn wait_authenticated_fails_before_any_connection() {
    let connector = ReverseConnector::listen("t").await.unwrap();
    assert!(matches!(
        connector.wait_authenticated().await,
        Err(DapError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn dispose_closes_an_accepted_client() {
    let connector = ReverseConnector::listen("t").await.unwrap();
    let port = connector.port();

    let adapter = tokio::spawn(async move {
        let (mut read, write) = dial(port).await.into_split();
        let mut writer = DapWriter::with_auth_token(write, "t");
        writer.send_auth_token().await.unwrap();
        let mut buf = [0u8; 64];
        (read.read(&mut buf).await.unwrap_or(0), writer)
    });

    let client = connector
        .accept_client(DapClientConfig::default())
        .await
        .unwrap();
    connector.dispose();

    let (n, _writer) = tokio::time::timeout(TIMEOUT, adapter).await.unwrap().unwrap();
    assert_eq!(n, 0);
    tokio::time::timeout(TIMEOUT, client.closed().cancelled())
        .await
        .unwrap();
    assert!(client.is_closed());
    tokio::time::timeout(TIMEOUT, connector.closed().cancelled())
        .await
        .unwrap();
}
