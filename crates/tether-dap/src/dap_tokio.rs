use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::tokens_match;
use crate::dap::codec::{encode_with_headers, Frame, FrameDecoder};
use crate::dap::messages::Message;
use crate::dap::AUTH_TOKEN_HEADER;
use crate::error::{DapError, Result};

const READ_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug)]
enum AuthState {
    NotRequired,
    Pending(String),
    Failed,
}

/// Reads frames from an async byte stream through a [`FrameDecoder`].
pub struct DapReader<R> {
    reader: R,
    decoder: FrameDecoder,
    ready: VecDeque<Frame>,
    chunk: Box<[u8]>,
    auth: AuthState,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES].into_boxed_slice(),
            auth: AuthState::NotRequired,
        }
    }

    /// Like [`DapReader::new`], but the peer must present `Auth-Token: <token>` before or with
    /// its first frame.
    ///
    /// A missing or different token fails that read with [`DapError::Auth`], and every read
    /// after it fails the same way.
    pub fn with_auth_token(reader: R, token: impl Into<String>) -> Self {
        Self {
            auth: AuthState::Pending(token.into()),
            ..Self::new(reader)
        }
    }

    /// Next complete frame, or `None` on a clean EOF between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if matches!(self.auth, AuthState::Failed) {
                return Err(DapError::Auth);
            }

            if let Some(frame) = self.ready.pop_front() {
                self.check_token(frame.auth_token.as_deref())?;
                return Ok(Some(frame));
            }

            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Next decoded message. Frames with an empty body carry nothing and are skipped.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            let Some(frame) = self.read_frame().await? else {
                return Ok(None);
            };
            if frame.body.is_empty() {
                continue;
            }
            return Message::decode(&frame.body).map(Some);
        }
    }

    /// Read until the peer has proven it knows the token, without consuming any frame.
    ///
    /// The token is accepted from a complete `Auth-Token` header line even while the rest of
    /// the first frame is still missing. A reader created with [`DapReader::new`] is
    /// authenticated from the start.
    pub async fn wait_authenticated(&mut self) -> Result<()> {
        loop {
            match self.auth {
                AuthState::NotRequired => return Ok(()),
                AuthState::Failed => return Err(DapError::Auth),
                AuthState::Pending(_) => {}
            }

            if let Some(presented) = self.ready.front().map(|frame| frame.auth_token.clone()) {
                self.check_token(presented.as_deref())?;
                continue;
            }
            if let Some(presented) = self.decoder.pending_header_value(AUTH_TOKEN_HEADER) {
                let presented = presented.to_string();
                self.check_token(Some(&presented))?;
                continue;
            }

            if !self.fill().await? {
                return Err(DapError::ConnectionClosed);
            }
        }
    }

    /// Read one chunk into the decoder. `false` on a clean EOF between frames.
    async fn fill(&mut self) -> Result<bool> {
        let n = self.reader.read(&mut self.chunk).await?;
        if n == 0 {
            if self.decoder.is_idle() {
                return Ok(false);
            }
            return Err(DapError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF inside a DAP frame",
            )));
        }
        self.ready.extend(self.decoder.feed(&self.chunk[..n])?);
        Ok(true)
    }

    fn check_token(&mut self, presented: Option<&str>) -> Result<()> {
        let AuthState::Pending(expected) = &self.auth else {
            return Ok(());
        };

        if presented.is_some_and(|token| tokens_match(token, expected)) {
            self.auth = AuthState::NotRequired;
            Ok(())
        } else {
            self.auth = AuthState::Failed;
            self.ready.clear();
            Err(DapError::Auth)
        }
    }
}

/// Writes framed messages to an async byte stream, flushing after each one.
pub struct DapWriter<W> {
    writer: W,
    auth_token: Option<String>,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            auth_token: None,
        }
    }

    /// Like [`DapWriter::new`], but the first frame written carries `Auth-Token: <token>`.
    pub fn with_auth_token(writer: W, token: impl Into<String>) -> Self {
        Self {
            writer,
            auth_token: Some(token.into()),
        }
    }

    /// Send the `Auth-Token` line right away instead of with the first frame, so the peer can
    /// authenticate us before we have anything to say.
    pub async fn send_auth_token(&mut self) -> Result<()> {
        let Some(token) = self.auth_token.take() else {
            return Ok(());
        };
        let line = format!("{AUTH_TOKEN_HEADER}: {token}\r\n");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        let framed = match self.auth_token.take() {
            Some(token) => encode_with_headers(&[(AUTH_TOKEN_HEADER, &token)], body),
            None => encode_with_headers(&[], body),
        };
        self.writer.write_all(&framed).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        let body = message.encode()?;
        self.write_frame(&body).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
