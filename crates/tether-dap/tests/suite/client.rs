use std::time::Duration;

use serde_json::{json, Value};
use tether_dap::dap_tokio::{DapReader, DapWriter};
use tether_dap::{DapClient, DapError, Event, Message, Request, Response};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Adapter side of an in-memory DAP session.
struct FakeAdapter {
    reader: DapReader<ReadHalf<DuplexStream>>,
    writer: DapWriter<WriteHalf<DuplexStream>>,
    seq: i64,
}

impl FakeAdapter {
    async fn next_message(&mut self) -> Message {
        tokio::time::timeout(TIMEOUT, self.reader.read_message())
            .await
            .expect("timed out waiting for client message")
            .unwrap()
            .expect("client closed the stream")
    }

    async fn next_request(&mut self) -> Request {
        match self.next_message().await {
            Message::Request(request) => request,
            other => panic!("expected request, got {other:?}"),
        }
    }

    async fn send(&mut self, message: Message) {
        self.writer.write_message(&message).await.unwrap();
    }

    async fn reply(&mut self, request: &Request, body: Value) {
        self.seq += 1;
        let response = Response::success(self.seq, request, Some(body));
        self.send(Message::Response(response)).await;
    }

    async fn event(&mut self, name: &str, body: Value) {
        self.seq += 1;
        self.send(Message::Event(Event::new(self.seq, name, Some(body))))
            .await;
    }
}

fn connect() -> (DapClient, FakeAdapter) {
    let (client_io, adapter_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (adapter_read, adapter_write) = tokio::io::split(adapter_io);

    let client = DapClient::new(client_read, client_write);
    let adapter = FakeAdapter {
        reader: DapReader::new(adapter_read),
        writer: DapWriter::new(adapter_write),
        seq: 1000,
    };
    (client, adapter)
}

#[tokio::test]
async fn out_of_order_responses_reach_the_right_caller() {
    let (client, mut adapter) = connect();

    let threads = tokio::spawn({
        let client = client.clone();
        async move { client.send("threads", None).await }
    });
    let first = adapter.next_request().await;

    let stack = tokio::spawn({
        let client = client.clone();
        async move { client.send("stackTrace", Some(json!({"threadId": 7}))).await }
    });
    let second = adapter.next_request().await;

    assert_eq!(first.command, "threads");
    assert_eq!(second.command, "stackTrace");
    assert!(second.seq > first.seq);

    adapter.reply(&second, json!({"frames": ["main"]})).await;
    adapter.reply(&first, json!({"threads": [7]})).await;

    let stack = stack.await.unwrap().unwrap();
    assert_eq!(stack.command, "stackTrace");
    assert_eq!(stack.body, Some(json!({"frames": ["main"]})));

    let threads = threads.await.unwrap().unwrap();
    assert_eq!(threads.command, "threads");
    assert_eq!(threads.body, Some(json!({"threads": [7]})));
}

#[tokio::test]
async fn unsuccessful_response_surfaces_adapter_message() {
    let (client, mut adapter) = connect();

    let launch = tokio::spawn({
        let client = client.clone();
        async move { client.send("launch", Some(json!({"program": "/nope"}))).await }
    });
    let request = adapter.next_request().await;
    adapter.seq += 1;
    let response = Response::error(adapter.seq, &request, "program not found: /nope");
    adapter.send(Message::Response(response)).await;

    match launch.await.unwrap() {
        Err(DapError::RequestFailed { command, message }) => {
            assert_eq!(command, "launch");
            assert_eq!(message, "program not found: /nope");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn response_for_unknown_request_is_ignored() {
    let (client, mut adapter) = connect();

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send("threads", None).await }
    });
    let request = adapter.next_request().await;

    let stray = Request::new(9_999, "threads", None);
    adapter.reply(&stray, json!({"stray": true})).await;
    adapter.reply(&request, json!({"stray": false})).await;

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.body, Some(json!({"stray": false})));
    assert!(!client.is_closed());
}

#[tokio::test]
async fn events_fan_out_by_name_without_blocking_requests() {
    let (client, mut adapter) = connect();

    let mut stopped_a = client.subscribe("stopped");
    let mut stopped_b = client.subscribe("stopped");
    let mut output = client.subscribe("output");
    let mut everything = client.subscribe_all();

    adapter.event("output", json!({"output": "hello\n"})).await;
    adapter.event("stopped", json!({"reason": "breakpoint"})).await;

    // Nobody has drained the subscriptions yet; requests must still complete.
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send("threads", None).await }
    });
    let request = adapter.next_request().await;
    adapter.reply(&request, json!({})).await;
    pending.await.unwrap().unwrap();

    for rx in [&mut stopped_a, &mut stopped_b] {
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "stopped");
        assert_eq!(event.body, Some(json!({"reason": "breakpoint"})));
        assert!(rx.try_recv().is_err());
    }

    let event = output.recv().await.unwrap();
    assert_eq!(event.event, "output");
    assert!(output.try_recv().is_err());

    assert_eq!(everything.recv().await.unwrap().event, "output");
    assert_eq!(everything.recv().await.unwrap().event, "stopped");
}

#[tokio::test]
async fn stream_end_fails_pending_requests() {
    let (client, mut adapter) = connect();
    let mut exited = client.subscribe("exited");

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send("continue", None).await }
    });
    let _request = adapter.next_request().await;
    drop(adapter);

    let result = tokio::time::timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(DapError::ConnectionClosed)), "{result:?}");

    tokio::time::timeout(TIMEOUT, client.closed().cancelled())
        .await
        .unwrap();
    assert!(client.is_closed());
    assert!(matches!(
        client.send("threads", None).await,
        Err(DapError::ConnectionClosed)
    ));
    assert!(exited.recv().await.is_err());
}

#[tokio::test]
async fn malformed_message_is_fatal_to_the_stream() {
    let (client, mut adapter) = connect();

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send("threads", None).await }
    });
    let _request = adapter.next_request().await;
    adapter
        .writer
        .write_frame(br#"{"seq":1,"type":"notification"}"#)
        .await
        .unwrap();

    let result = tokio::time::timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(DapError::ConnectionClosed)), "{result:?}");
}

#[tokio::test]
async fn timed_out_request_is_forgotten() {
    let (client, mut adapter) = connect();

    let err = client
        .send_with_timeout("evaluate", None, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, DapError::Timeout), "{err:?}");

    // A late answer to the abandoned request is dropped; the session keeps working.
    let late = adapter.next_request().await;
    adapter.reply(&late, json!({"late": true})).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send("threads", None).await }
    });
    let request = adapter.next_request().await;
    adapter.reply(&request, json!({"late": false})).await;
    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.body, Some(json!({"late": false})));
}

#[tokio::test]
async fn reverse_requests_are_rejected() {
    let (_client, mut adapter) = connect();

    adapter
        .send(Message::Request(Request::new(
            5,
            "runInTerminal",
            Some(json!({"args": ["/bin/true"]})),
        )))
        .await;

    match adapter.next_message().await {
        Message::Response(response) => {
            assert_eq!(response.request_seq, 5);
            assert!(!response.success);
            assert_eq!(response.command, "runInTerminal");
        }
        other => panic!("expected response, got {other:?}"),
    }
}

#[tokio::test]
async fn submitted_request_is_on_the_wire_before_the_next_one() {
    let (client, mut adapter) = connect();

    let launch = client
        .submit("launch", Some(json!({"program": "/bin/app"})))
        .await
        .unwrap();
    let done = tokio::spawn({
        let client = client.clone();
        async move { client.send("configurationDone", None).await }
    });

    let first = adapter.next_request().await;
    let second = adapter.next_request().await;
    assert_eq!(first.command, "launch");
    assert_eq!(first.seq, launch.seq());
    assert_eq!(second.command, "configurationDone");

    // The adapter answers `launch` only once configuration is done.
    adapter.reply(&second, json!({})).await;
    adapter.reply(&first, json!({"launched": true})).await;

    done.await.unwrap().unwrap();
    let response = launch.wait_timeout(TIMEOUT).await.unwrap();
    assert_eq!(response.body, Some(json!({"launched": true})));
}

#[tokio::test]
async fn close_ends_the_stream_for_the_adapter_too() {
    let (client, mut adapter) = connect();
    let _still_held = client.clone();

    client.close();

    let next = tokio::time::timeout(TIMEOUT, adapter.reader.read_message())
        .await
        .expect("adapter should see the stream end")
        .unwrap();
    assert_eq!(next, None);
}
