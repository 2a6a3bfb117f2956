use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::spawn::AdapterSpawnParams;
use crate::StartError;

/// Output kept while waiting for the readiness line; older output is dropped first.
const MAX_HANDSHAKE_OUTPUT: usize = 64 * 1024;

/// How long output is still collected after the adapter exits during the handshake. Anything it
/// spawned may hold the pipes open far longer.
const EXIT_OUTPUT_DRAIN: Duration = Duration::from_millis(200);

/// The line an adapter in listening mode prints once its socket is bound.
pub fn listening_port_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^Listening on port (\d+)\s").expect("listening-port regex should compile")
    })
}

#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Output that marks the adapter as ready. With `None` the adapter is ready once spawned.
    pub ready: Option<Regex>,
    pub timeout: Duration,
    /// Time between the graceful and the forced kill when stopping the adapter.
    pub kill_grace: Duration,
}

impl HandshakeOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            ready: Some(listening_port_pattern().clone()),
            timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(250),
        }
    }
}

/// How the adapter process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitEvent {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitEvent {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug)]
struct OutputChunk {
    stream: OutputStream,
    text: String,
}

/// A running adapter. Dropping it kills the process.
#[derive(Debug)]
pub struct AdapterProcess {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitEvent>>,
    kill: CancellationToken,
    terminating: AtomicBool,
}

impl AdapterProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_event(&self) -> Option<ExitEvent> {
        *self.exit.borrow()
    }

    /// Receives `Some(event)` once, when the process exits.
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ExitEvent>> {
        self.exit.clone()
    }

    pub async fn wait_exit(&self) -> ExitEvent {
        let mut exit = self.exit.clone();
        let event = match exit.wait_for(Option::is_some).await {
            Ok(event) => *event,
            Err(_) => None,
        };
        event.unwrap_or_default()
    }

    /// Stop the process tree and wait for the exit. Only the first call on a live process sends
    /// any signal.
    pub async fn terminate(&self) -> ExitEvent {
        if self.is_alive() && !self.terminating.swap(true, Ordering::SeqCst) {
            tracing::debug!(target: "tether.process", pid = ?self.pid, "terminating adapter");
            self.kill.cancel();
        }
        self.wait_exit().await
    }
}

impl Drop for AdapterProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// A process that completed its startup handshake.
#[derive(Debug)]
pub struct Started {
    pub process: AdapterProcess,
    /// Capture groups of the readiness match; index 0 is the whole match.
    pub captures: Vec<Option<String>>,
}

impl Started {
    /// The port announced by [`listening_port_pattern`].
    pub fn port(&self) -> Option<u16> {
        self.captures.get(1)?.as_deref()?.parse().ok()
    }
}

enum Handshake {
    Ready(Vec<Option<String>>),
    TimedOut(String),
    Exited(ExitEvent, String),
}

/// Spawn the adapter and wait until it reports readiness, exits, or runs out of time.
///
/// On timeout the process is killed before this returns. After a successful handshake the
/// adapter's output keeps flowing to the `tether.adapter` log target.
pub async fn start(
    params: AdapterSpawnParams,
    options: &HandshakeOptions,
) -> Result<Started, StartError> {
    let program = params.program.display().to_string();

    let mut cmd = Command::new(&params.program);
    cmd.args(&params.args)
        .env_clear()
        .envs(params.env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = params.cwd.as_ref() {
        if cwd.is_dir() {
            cmd.current_dir(cwd);
        } else {
            tracing::warn!(
                target: "tether.process",
                path = %cwd.display(),
                "adapter working directory is not a directory; using the current one"
            );
        }
    }

    // Own process group, so stopping the adapter also stops anything it spawned.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|source| StartError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    tracing::debug!(target: "tether.process", pid = ?pid, program = %program, "adapter spawned");

    let Some(stdout) = child.stdout.take() else {
        return Err(io::Error::other("adapter stdout was not captured").into());
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(io::Error::other("adapter stderr was not captured").into());
    };
    let (output_tx, mut output_rx) = mpsc::channel(64);
    tokio::spawn(pump_output(stdout, OutputStream::Stdout, output_tx.clone()));
    tokio::spawn(pump_output(stderr, OutputStream::Stderr, output_tx));

    let (exit_tx, exit_rx) = watch::channel(None);
    let kill = CancellationToken::new();
    tokio::spawn(supervise(child, pid, kill.clone(), options.kill_grace, exit_tx));

    let process = AdapterProcess {
        pid,
        exit: exit_rx,
        kill,
        terminating: AtomicBool::new(false),
    };

    let Some(pattern) = options.ready.as_ref() else {
        tokio::spawn(forward_output(output_rx, pid));
        return Ok(Started {
            process,
            captures: Vec::new(),
        });
    };

    match wait_for_ready(&process, &mut output_rx, pattern, options.timeout).await {
        Handshake::Ready(captures) => {
            tracing::info!(target: "tether.process", pid = ?pid, "adapter ready");
            tokio::spawn(forward_output(output_rx, pid));
            Ok(Started { process, captures })
        }
        Handshake::TimedOut(output) => {
            tracing::warn!(
                target: "tether.process",
                pid = ?pid,
                timeout_ms = options.timeout.as_millis() as u64,
                "adapter did not complete its startup handshake in time"
            );
            process.terminate().await;
            Err(StartError::Timeout { output })
        }
        Handshake::Exited(event, output) => {
            kill_process_group(pid);
            Err(StartError::Handshake {
                code: event.code,
                signal: event.signal,
                output,
            })
        }
    }
}

async fn wait_for_ready(
    process: &AdapterProcess,
    output: &mut mpsc::Receiver<OutputChunk>,
    pattern: &Regex,
    timeout: Duration,
) -> Handshake {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut captured = String::new();
    let mut output_open = true;
    let mut exited: Option<ExitEvent> = None;
    let mut drain_until: Option<Instant> = None;

    loop {
        if drain_until.is_some_and(|until| Instant::now() >= until) {
            output_open = false;
        }
        // Exit is only final once the pipes are drained; the marker may still be in flight.
        if let (Some(event), false) = (exited, output_open) {
            return Handshake::Exited(event, captured);
        }

        tokio::select! {
            biased;

            chunk = output.recv(), if output_open => match chunk {
                Some(chunk) => {
                    captured.push_str(&chunk.text);
                    if let Some(caps) = pattern.captures(&captured) {
                        let groups = caps
                            .iter()
                            .map(|group| group.map(|group| group.as_str().to_string()))
                            .collect();
                        return Handshake::Ready(groups);
                    }
                    trim_front(&mut captured, MAX_HANDSHAKE_OUTPUT);
                }
                None => output_open = false,
            },
            event = process.wait_exit(), if exited.is_none() => {
                exited = Some(event);
                drain_until = Some(Instant::now() + EXIT_OUTPUT_DRAIN);
            }
            _ = tokio::time::sleep_until(drain_until.unwrap_or_else(Instant::now)),
                if drain_until.is_some() =>
            {
                output_open = false;
            }
            _ = &mut deadline => {
                return match exited {
                    Some(event) => Handshake::Exited(event, captured),
                    None => Handshake::TimedOut(captured),
                };
            }
        }
    }
}

fn trim_front(text: &mut String, max_len: usize) {
    if text.len() <= max_len {
        return;
    }
    let mut cut = text.len() - max_len;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}

async fn pump_output<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];
    let mut pending = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        let text = take_utf8(&mut pending);
        if text.is_empty() {
            continue;
        }
        if tx.send(OutputChunk { stream, text }).await.is_err() {
            return;
        }
    }
    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(OutputChunk { stream, text }).await;
    }
}

/// Decode `pending`, leaving an incomplete trailing sequence for the next read. Invalid bytes
/// become U+FFFD.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut rest = pending.as_slice();
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                rest = &[];
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match err.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }
    let kept = rest.len();
    pending.drain(..pending.len() - kept);
    text
}

async fn forward_output(mut output: mpsc::Receiver<OutputChunk>, pid: Option<u32>) {
    while let Some(chunk) = output.recv().await {
        for line in chunk.text.lines().filter(|line| !line.trim().is_empty()) {
            tracing::debug!(
                target: "tether.adapter",
                pid = ?pid,
                stream = chunk.stream.as_str(),
                "{line}"
            );
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    kill: CancellationToken,
    grace: Duration,
    exit: watch::Sender<Option<ExitEvent>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => terminate_process_tree(&mut child, grace).await,
    };

    let event = match status {
        Ok(status) => ExitEvent::from_status(status),
        Err(err) => {
            tracing::warn!(target: "tether.process", pid = ?pid, error = %err, "failed to wait for adapter");
            ExitEvent::default()
        }
    };
    tracing::info!(
        target: "tether.process",
        pid = ?pid,
        code = ?event.code,
        signal = ?event.signal,
        "adapter exited"
    );
    let _ = exit.send(Some(event));
}

/// SIGKILL whatever is left in the adapter's process group once the adapter itself is gone.
fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            let _ = libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

async fn terminate_process_tree(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pid = pid as i32;
            // Negative pid targets the process group set up in `pre_exec`.
            unsafe {
                let _ = libc::kill(-pid, libc::SIGTERM);
            }
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return status;
            }
            unsafe {
                let _ = libc::kill(-pid, libc::SIGKILL);
            }
        }
        child.wait().await
    }

    #[cfg(windows)]
    {
        let _ = grace;
        // `taskkill /T` takes down the whole tree rooted at the adapter.
        if let Some(pid) = child.id() {
            let _ = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
        let _ = child.start_kill();
        child.wait().await
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = grace;
        let _ = child.start_kill();
        child.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listening_pattern_requires_line_start_and_terminator() {
        let re = listening_port_pattern();
        let caps = re.captures("starting\nListening on port 4711\n").unwrap();
        assert_eq!(&caps[1], "4711");
        assert!(re.captures("Listening on port 4711").is_none());
        assert!(re.captures("xListening on port 1\n").is_none());
    }

    #[test]
    fn trim_front_keeps_the_tail_on_char_boundaries() {
        let mut text = "ééééé".to_string();
        trim_front(&mut text, 3);
        assert_eq!(text, "é");

        let mut short = "abc".to_string();
        trim_front(&mut short, 10);
        assert_eq!(short, "abc");
    }

    #[test]
    fn multibyte_characters_split_across_reads_survive() {
        let bytes = "café → ok".as_bytes();
        let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut pending = bytes[..split].to_vec();
        assert_eq!(take_utf8(&mut pending), "caf");
        assert_eq!(pending, vec![0xC3]);

        pending.extend_from_slice(&bytes[split..]);
        assert_eq!(take_utf8(&mut pending), "é → ok");
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_bytes_are_replaced_not_held_back() {
        let mut pending = b"a\xFFb\xE2\x86".to_vec();
        assert_eq!(take_utf8(&mut pending), "a\u{FFFD}b");
        assert_eq!(pending, vec![0xE2, 0x86]);
    }

    #[test]
    fn started_port_parses_first_group() {
        let (_tx, rx) = watch::channel(Some(ExitEvent::default()));
        let started = Started {
            process: AdapterProcess {
                pid: None,
                exit: rx,
                kill: CancellationToken::new(),
                terminating: AtomicBool::new(false),
            },
            captures: vec![Some("Listening on port 9\n".into()), Some("9".into())],
        };
        assert_eq!(started.port(), Some(9));
        assert!(!started.process.is_alive());
    }
}
