use std::fmt::Write as _;

use crate::error::{DapError, Result};

pub use super::{AUTH_TOKEN_HEADER, MAX_DAP_HEADER_BYTES, MAX_DAP_MESSAGE_BYTES};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A complete frame: the body plus the header values the decoder cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Value of the `Auth-Token` header, if the header block carried one.
    pub auth_token: Option<String>,
    pub body: Vec<u8>,
}

/// Frame `body` with a bare `Content-Length` header.
pub fn encode(body: &[u8]) -> Vec<u8> {
    encode_with_headers(&[], body)
}

/// Frame `body`, writing `headers` ahead of `Content-Length`.
///
/// ```text
/// Auth-Token: 4f1c...\r\n
/// Content-Length: 42\r\n
/// \r\n
/// { ...json... }
/// ```
pub fn encode_with_headers(headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut head = String::new();
    for (name, value) in headers {
        let _ = write!(head, "{name}: {value}\r\n");
    }
    let _ = write!(head, "Content-Length: {}\r\n\r\n", body.len());

    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    out
}

#[derive(Debug, Clone)]
struct Header {
    content_length: usize,
    auth_token: Option<String>,
}

/// Incremental decoder for `Content-Length` framed byte streams.
///
/// Chunks of any size are appended with [`FrameDecoder::feed`], which returns every frame
/// completed by that chunk in stream order. A partial header or body is simply kept until more
/// bytes arrive. Consumed bytes are reclaimed lazily, so a burst of small frames does not shift
/// the buffer once per frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Start of the unconsumed region of `buf`.
    head: usize,
    /// Bytes past `head` already searched for the header terminator without success.
    scanned: usize,
    /// Parsed header of the frame whose body is still arriving.
    header: Option<Header>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes that have not been emitted as part of a frame yet.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.head
    }

    /// `true` when the decoder sits exactly on a frame boundary.
    pub fn is_idle(&self) -> bool {
        self.header.is_none() && self.buffered() == 0
    }

    /// Value of header `name` among the complete lines of a header block that is still
    /// arriving.
    ///
    /// An adapter that dials back writes its `Auth-Token` line as soon as it connects, long
    /// before the first frame is complete.
    pub fn pending_header_value(&self, name: &str) -> Option<&str> {
        if self.header.is_some() {
            return None;
        }
        let pending = &self.buf[self.head..];
        let end = pending.windows(2).rposition(|window| window == b"\r\n")?;
        let text = std::str::from_utf8(&pending[..end]).ok()?;
        text.split("\r\n")
            .take_while(|line| !line.is_empty())
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
            })
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let header = match self.header.take() {
                Some(header) => header,
                None => match self.take_header()? {
                    Some(header) => header,
                    None => break,
                },
            };

            if self.buffered() < header.content_length {
                self.header = Some(header);
                break;
            }

            let end = self.head + header.content_length;
            frames.push(Frame {
                auth_token: header.auth_token,
                body: self.buf[self.head..end].to_vec(),
            });
            self.head = end;
        }

        self.compact();
        Ok(frames)
    }

    fn take_header(&mut self) -> Result<Option<Header>> {
        let pending = &self.buf[self.head..];
        // Re-scan the tail of the previous search in case the terminator straddles two chunks.
        let from = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);

        let Some(pos) = find(&pending[from..], HEADER_TERMINATOR).map(|pos| pos + from) else {
            if pending.len() > MAX_DAP_HEADER_BYTES {
                return Err(DapError::Decode(format!(
                    "DAP header block exceeds maximum size ({MAX_DAP_HEADER_BYTES} bytes)"
                )));
            }
            self.scanned = pending.len();
            return Ok(None);
        };

        let block_len = pos + HEADER_TERMINATOR.len();
        if block_len > MAX_DAP_HEADER_BYTES {
            return Err(DapError::Decode(format!(
                "DAP header block exceeds maximum size ({MAX_DAP_HEADER_BYTES} bytes)"
            )));
        }

        let header = parse_header(&pending[..pos])?;
        self.head += block_len;
        self.scanned = 0;
        Ok(Some(header))
    }

    fn compact(&mut self) {
        if self.head == self.buf.len() {
            self.buf.clear();
            self.head = 0;
        } else if self.head > 0 && self.head >= self.buf.len() / 2 {
            self.buf.drain(..self.head);
            self.head = 0;
        }
    }
}

fn parse_header(block: &[u8]) -> Result<Header> {
    let text = std::str::from_utf8(block)
        .map_err(|_| DapError::Decode("DAP header block is not UTF-8".to_string()))?;

    let mut content_length = None;
    let mut auth_token = None;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());

        if name.eq_ignore_ascii_case("Content-Length") {
            let len = value.parse::<usize>().map_err(|err| {
                DapError::Decode(format!("invalid Content-Length {value:?}: {err}"))
            })?;
            if len > MAX_DAP_MESSAGE_BYTES {
                return Err(DapError::Decode(format!(
                    "DAP message Content-Length {len} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}"
                )));
            }
            content_length = Some(len);
        } else if name.eq_ignore_ascii_case(AUTH_TOKEN_HEADER) {
            auth_token = Some(value.to_string());
        }
    }

    let Some(content_length) = content_length else {
        return Err(DapError::Decode(
            "DAP message missing Content-Length header".to_string(),
        ));
    };

    Ok(Header {
        content_length,
        auth_token,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Strip user data out of a serde error message.
///
/// `serde_json` echoes offending scalars (`invalid type: string "..."`) and field names
/// (``unknown field `...` ``). DAP bodies carry launch environments and tokens, so every quoted
/// value and the first back-ticked segment are replaced with `<redacted>`; later back-ticked
/// segments are the "expected ..." list and stay readable.
pub fn redact_error_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(open) = rest.find('"') {
        out.push_str(&rest[..=open]);
        rest = &rest[open + 1..];
        match rest.find('"') {
            Some(close) => {
                out.push_str("<redacted>\"");
                rest = &rest[close + 1..];
            }
            None => {
                out.push_str(rest);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    if let Some(open) = out.find('`') {
        if let Some(len) = out[open + 1..].find('`') {
            out.replace_range(open + 1..open + 1 + len, "<redacted>");
        }
    }
    out
}
