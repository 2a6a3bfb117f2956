//! Stand-in debug adapter for the tether-cli integration tests.
//!
//! `--port 0` binds a loopback port, prints `Listening on port N` and serves one connection.
//! `--connect N --auth-token T` dials back to port N and sends the token with its first frame.
//!
//! Other flags: `--silent` (never announce the port), `--exit-early CODE`. Every request, and
//! the argument vector, is appended as a JSON line to `$TETHER_MOCK_LOG` when it is set.
//!
//! Launch arguments understood: `mockFail` (refuse to launch) and `mockRunMs` (how long the
//! debuggee "runs" after `configurationDone` before `exited`/`terminated` are sent).

use std::fs::OpenOptions;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::process;
use std::time::Duration;

use serde_json::{json, Value};
use tether_dap::dap_tokio::{DapReader, DapWriter};
use tether_dap::{Event, Message, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct Options {
    port: Option<u16>,
    connect: Option<u16>,
    auth_token: Option<String>,
    silent: bool,
    exit_early: Option<i32>,
}

fn parse<T: std::str::FromStr>(value: Option<String>, flag: &str) -> T {
    let Some(value) = value else {
        eprintln!("missing value for {flag}");
        process::exit(2);
    };
    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid value for {flag}: {value}");
        process::exit(2);
    })
}

fn parse_args() -> Options {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => options.port = Some(parse(args.next(), "--port")),
            "--connect" => options.connect = Some(parse(args.next(), "--connect")),
            "--auth-token" => options.auth_token = Some(parse(args.next(), "--auth-token")),
            "--silent" => options.silent = true,
            "--exit-early" => options.exit_early = Some(parse(args.next(), "--exit-early")),
            // Flags a real adapter takes; the mock has no use for their values.
            "--liblldb" | "--settings" => {
                args.next();
            }
            _ => {}
        }
    }
    options
}

fn record(entry: Value) {
    let Some(path) = std::env::var_os("TETHER_MOCK_LOG") else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{entry}");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let options = parse_args();
    record(json!({ "argv": std::env::args().skip(1).collect::<Vec<_>>() }));

    if let Some(code) = options.exit_early {
        eprintln!("mock adapter giving up before the handshake");
        process::exit(code);
    }

    let result = match options.connect {
        Some(port) => dial_back(port, options.auth_token).await,
        None => listen(options.port.unwrap_or(0), options.silent).await,
    };
    if let Err(err) = result {
        eprintln!("mock adapter: {err}");
        process::exit(1);
    }
}

async fn dial_back(port: u16, token: Option<String>) -> tether_dap::Result<()> {
    let stream = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
    let (read, write) = stream.into_split();
    let mut writer = match token {
        Some(token) => DapWriter::with_auth_token(write, token),
        None => DapWriter::new(write),
    };
    writer.send_auth_token().await?;
    serve(DapReader::new(read), writer).await
}

async fn listen(port: u16, silent: bool) -> tether_dap::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
    if silent {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        return Ok(());
    }

    let port = listener.local_addr()?.port();
    println!("Listening on port {port}");
    let _ = std::io::stdout().flush();

    let (stream, _) = listener.accept().await?;
    let (read, write) = stream.into_split();
    serve(DapReader::new(read), DapWriter::new(write)).await
}

async fn serve<R, W>(mut reader: DapReader<R>, mut writer: DapWriter<W>) -> tether_dap::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut seq = 0;
    let mut run_for = Duration::ZERO;

    while let Some(message) = reader.read_message().await? {
        let Message::Request(request) = message else {
            continue;
        };
        record(json!({ "command": request.command, "arguments": request.arguments }));

        seq += 1;
        match request.command.as_str() {
            "initialize" => {
                let capabilities = json!({ "supportsConfigurationDoneRequest": true });
                let response = Response::success(seq, &request, Some(capabilities));
                writer.write_message(&Message::Response(response)).await?;
                seq += 1;
                let initialized = Event::new(seq, "initialized", None);
                writer.write_message(&Message::Event(initialized)).await?;
            }
            "launch" | "attach" => {
                let arguments = request.arguments.clone().unwrap_or(Value::Null);
                let response = if arguments.get("mockFail").and_then(Value::as_bool) == Some(true) {
                    Response::error(seq, &request, "mock adapter refused to start the debuggee")
                } else {
                    let run_ms = arguments.get("mockRunMs").and_then(Value::as_u64);
                    run_for = Duration::from_millis(run_ms.unwrap_or(0));
                    Response::success(seq, &request, None)
                };
                writer.write_message(&Message::Response(response)).await?;
            }
            "configurationDone" => {
                let response = Response::success(seq, &request, None);
                writer.write_message(&Message::Response(response)).await?;

                tokio::time::sleep(run_for).await;
                seq += 1;
                let exited = Event::new(seq, "exited", Some(json!({ "exitCode": 0 })));
                writer.write_message(&Message::Event(exited)).await?;
                seq += 1;
                writer
                    .write_message(&Message::Event(Event::new(seq, "terminated", None)))
                    .await?;
            }
            "disconnect" => {
                let response = Response::success(seq, &request, None);
                writer.write_message(&Message::Response(response)).await?;
                return Ok(());
            }
            _ => {
                let response = Response::success(seq, &request, None);
                writer.write_message(&Message::Response(response)).await?;
            }
        }
    }
    Ok(())
}
