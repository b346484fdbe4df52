//! The response-writer contract and the recording wrapper.
//!
//! Server bindings implement [`ResponseWriter`] for their native write
//! surface. The module wraps that writer in a [`ResponseRecorder`], which
//! captures the status code and byte count needed for the follow-up agent
//! calls and applies agent-supplied header actions exactly once, at the
//! first write.
//!
//! Optional capabilities (flush for streaming, hijack for upgrades,
//! read-from for sendfile-style copies, close-notify) are discovered
//! through the `as_*` accessors. The recorder answers the flush probe with
//! `Some` exactly when its base writer does, so downstream capability
//! checks observe the same answer through the wrapper as on the raw writer.

use std::io;

use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use crate::schema::{action, HeaderAction};

/// A bidirectional stream obtained by hijacking the connection.
pub trait HijackedIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> HijackedIo for T {}

/// Streaming flush capability.
#[async_trait]
pub trait Flush: Send {
    /// Pushes buffered response bytes to the client.
    async fn flush(&mut self) -> io::Result<()>;
}

/// Connection-takeover capability, used for protocol upgrades.
#[async_trait]
pub trait Hijack: Send {
    /// Takes over the underlying connection. After a successful hijack the
    /// writer must not be used again.
    async fn hijack(&mut self) -> io::Result<Box<dyn HijackedIo>>;
}

/// Bulk-copy capability.
#[async_trait]
pub trait ReadFrom: Send {
    /// Copies `src` to the response until end of stream, returning the
    /// number of bytes copied.
    async fn read_from(&mut self, src: &mut (dyn AsyncRead + Send + Unpin)) -> io::Result<u64>;
}

/// Client-disconnect notification capability.
pub trait CloseNotify: Send {
    /// Returns a channel that receives a value when the client goes away.
    fn close_notify(&mut self) -> mpsc::Receiver<bool>;
}

/// The write surface of one HTTP response.
///
/// If `write_head` is never called explicitly, the first `write` is
/// understood by servers as an implicit `write_head(200)`; the recorder
/// relies on that contract for its default status.
#[async_trait]
pub trait ResponseWriter: Send {
    /// The response headers, mutable until the head is written.
    fn headers(&self) -> &HeaderMap;

    /// Mutable access to the response headers.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Writes the status line and headers.
    async fn write_head(&mut self, status: StatusCode) -> io::Result<()>;

    /// Writes a chunk of the response body.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Flush capability, when the writer supports it.
    fn as_flush(&mut self) -> Option<&mut dyn Flush> {
        None
    }

    /// Hijack capability, when the writer supports it.
    fn as_hijack(&mut self) -> Option<&mut dyn Hijack> {
        None
    }

    /// Bulk-copy capability, when the writer supports it.
    fn as_read_from(&mut self) -> Option<&mut dyn ReadFrom> {
        None
    }

    /// Close-notify capability, when the writer supports it.
    fn as_close_notify(&mut self) -> Option<&mut dyn CloseNotify> {
        None
    }
}

/// Wraps a base writer, recording the status code and bytes written and
/// applying agent-supplied header actions at the first write.
pub struct ResponseRecorder<'a> {
    base: &'a mut (dyn ResponseWriter + 'a),
    status: StatusCode,
    bytes_written: u64,
    actions: Option<Vec<HeaderAction>>,
    sentinels: Vec<mpsc::Sender<bool>>,
}

impl<'a> ResponseRecorder<'a> {
    /// Wraps `base` with no pending header actions.
    pub fn new(base: &'a mut (dyn ResponseWriter + 'a)) -> Self {
        ResponseRecorder::with_actions(base, Vec::new())
    }

    /// Wraps `base`, holding `actions` to apply at the first write.
    pub fn with_actions(base: &'a mut (dyn ResponseWriter + 'a), actions: Vec<HeaderAction>) -> Self {
        ResponseRecorder {
            base,
            status: StatusCode::OK,
            bytes_written: 0,
            actions: if actions.is_empty() { None } else { Some(actions) },
            sentinels: Vec::new(),
        }
    }

    /// The recorded status code; 200 until `write_head` is called.
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// The number of body bytes written through the recorder.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// The wrapped base writer.
    pub fn base_writer(&mut self) -> &mut dyn ResponseWriter {
        &mut *self.base
    }

    /// Applies the pending header actions in order, once.
    ///
    /// Conflicting actions for the same name resolve last-writer-wins
    /// within this single pass.
    fn merge_header_actions(&mut self) {
        let Some(actions) = self.actions.take() else {
            return;
        };
        let headers = self.base.headers_mut();
        for act in &actions {
            apply_header_action(headers, act);
        }
    }
}

/// Applies one action to `headers`. Actions with malformed names or values
/// are skipped.
fn apply_header_action(headers: &mut HeaderMap, act: &HeaderAction) {
    let Some(name) = act.name() else {
        return;
    };
    let Ok(name) = HeaderName::try_from(name) else {
        debug!(name = act.name(), "skipping header action with invalid name");
        return;
    };

    if act.code() == action::DEL {
        headers.remove(&name);
        return;
    }

    let Some(value) = act.value() else {
        return;
    };
    let Ok(value) = HeaderValue::try_from(value) else {
        debug!(name = %name, "skipping header action with invalid value");
        return;
    };

    match act.code() {
        action::ADD => {
            headers.append(name, value);
        }
        action::SET => {
            headers.insert(name, value);
        }
        action::SET_IF_ABSENT => {
            let current_empty = headers.get(&name).map_or(true, |v| v.is_empty());
            if current_empty {
                headers.insert(name, value);
            }
        }
        // unknown opcodes are skipped so the action vocabulary can grow
        _ => {
            debug!(code = act.code(), "skipping header action with unknown opcode");
        }
    }
}

#[async_trait]
impl ResponseWriter for ResponseRecorder<'_> {
    fn headers(&self) -> &HeaderMap {
        self.base.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.base.headers_mut()
    }

    async fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
        self.merge_header_actions();
        self.status = status;
        self.base.write_head(status).await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.merge_header_actions();
        let written = self.base.write(buf).await?;
        self.bytes_written += written as u64;
        Ok(written)
    }

    fn as_flush(&mut self) -> Option<&mut dyn Flush> {
        if self.base.as_flush().is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn as_hijack(&mut self) -> Option<&mut dyn Hijack> {
        Some(self)
    }

    fn as_read_from(&mut self) -> Option<&mut dyn ReadFrom> {
        Some(self)
    }

    fn as_close_notify(&mut self) -> Option<&mut dyn CloseNotify> {
        Some(self)
    }
}

#[async_trait]
impl Flush for ResponseRecorder<'_> {
    async fn flush(&mut self) -> io::Result<()> {
        match self.base.as_flush() {
            Some(flusher) => flusher.flush().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Hijack for ResponseRecorder<'_> {
    async fn hijack(&mut self) -> io::Result<Box<dyn HijackedIo>> {
        match self.base.as_hijack() {
            Some(hijacker) => hijacker.hijack().await,
            // Required for WebSockets to work
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "base response writer does not support hijacking",
            )),
        }
    }
}

#[async_trait]
impl ReadFrom for ResponseRecorder<'_> {
    async fn read_from(&mut self, src: &mut (dyn AsyncRead + Send + Unpin)) -> io::Result<u64> {
        if let Some(reader) = self.base.as_read_from() {
            return reader.read_from(src).await;
        }
        // plain copy onto the base writer
        let mut buf = [0u8; 8192];
        let mut copied = 0u64;
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                return Ok(copied);
            }
            self.base.write(&buf[..n]).await?;
            copied += n as u64;
        }
    }
}

impl CloseNotify for ResponseRecorder<'_> {
    fn close_notify(&mut self) -> mpsc::Receiver<bool> {
        if let Some(notifier) = self.base.as_close_notify() {
            return notifier.close_notify();
        }
        // a channel that never fires, for writers without the capability
        let (tx, rx) = mpsc::channel(1);
        self.sentinels.push(tx);
        rx
    }
}
