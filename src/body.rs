//! Request-body handling: the buffering gate and the rebindable body type.
//!
//! The lifecycle buffers a request body only when the gate in
//! [`should_read_body`] says so. Buffered bodies are rebound as an
//! in-memory [`RequestBody`] so the downstream handler reads exactly the
//! bytes the client sent, with no observable difference.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Request};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;

use crate::config::ModuleConfig;

/// Boxed error used by streaming bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The request body as seen by the module and the downstream handler.
///
/// A body is either absent, an in-memory buffer, or a streaming body handed
/// over by the server binding. After buffering, the lifecycle replaces a
/// streaming body with a buffered one holding the captured bytes; the
/// buffer is shared with the pre-request message rather than copied.
#[derive(Debug, Default)]
pub struct RequestBody {
    inner: Inner,
}

#[derive(Debug, Default)]
enum Inner {
    #[default]
    None,
    Buffered(Option<Bytes>),
    Stream(BoxBody<Bytes, BoxError>),
}

impl RequestBody {
    /// A request with no body.
    pub fn none() -> RequestBody {
        RequestBody { inner: Inner::None }
    }

    /// An in-memory body over `bytes`.
    pub fn buffered(bytes: impl Into<Bytes>) -> RequestBody {
        RequestBody {
            inner: Inner::Buffered(Some(bytes.into())),
        }
    }

    /// A streaming body handed over by the server binding.
    pub fn stream<B>(body: B) -> RequestBody
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        RequestBody {
            inner: Inner::Stream(body.map_err(Into::into).boxed()),
        }
    }

    /// Returns `true` when there is no body at all.
    pub fn is_none(&self) -> bool {
        matches!(self.inner, Inner::None)
    }

    /// Drains the body, returning every byte read.
    ///
    /// Read errors end the stream silently; whatever was read up to that
    /// point is returned and treated as the body.
    pub async fn collect_bytes(&mut self) -> Bytes {
        match &mut self.inner {
            Inner::None => Bytes::new(),
            Inner::Buffered(bytes) => bytes.take().unwrap_or_default(),
            Inner::Stream(stream) => {
                let mut buf = BytesMut::new();
                loop {
                    match stream.frame().await {
                        Some(Ok(frame)) => {
                            if let Ok(data) = frame.into_data() {
                                buf.extend_from_slice(&data);
                            }
                        }
                        Some(Err(_)) | None => break,
                    }
                }
                buf.freeze()
            }
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> RequestBody {
        RequestBody::buffered(bytes)
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> RequestBody {
        RequestBody::buffered(Bytes::from_static(s.as_bytes()))
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::None => Poll::Ready(None),
            Inner::Buffered(bytes) => match bytes.take() {
                Some(data) if !data.is_empty() => Poll::Ready(Some(Ok(Frame::data(data)))),
                _ => Poll::Ready(None),
            },
            Inner::Stream(stream) => Pin::new(stream).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            Inner::None => true,
            Inner::Buffered(bytes) => bytes.as_ref().map_or(true, Bytes::is_empty),
            Inner::Stream(stream) => stream.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            Inner::None => SizeHint::with_exact(0),
            Inner::Buffered(bytes) => {
                SizeHint::with_exact(bytes.as_ref().map_or(0, |b| b.len() as u64))
            }
            Inner::Stream(stream) => stream.size_hint(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Body-read gate
// ─────────────────────────────────────────────────────────────────────────

/// Decides whether the request body should be buffered for inspection.
///
/// True exactly when a body exists, its declared length is within bounds
/// (or unknown and explicitly allowed), and the content type is one the
/// agent can inspect.
pub fn should_read_body(req: &Request<RequestBody>, config: &ModuleConfig) -> bool {
    // nothing to do
    if req.body().is_none() {
        return false;
    }

    match declared_content_length(req.headers()) {
        // skip reading if too long or explicitly empty
        Some(0) => return false,
        Some(n) if n > config.max_content_length() => return false,
        Some(n) if n > 0 => {}
        // unknown length is opt-in
        _ => {
            if !config.allow_unknown_content_length() {
                return false;
            }
        }
    }

    // Multiple content-type values or a comma-separated list imply
    // structured content worth inspecting.
    let mut values = req.headers().get_all(CONTENT_TYPE).iter();
    let first = values.next();
    if values.next().is_some() {
        return true;
    }
    let content_type = match first {
        Some(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
        None => String::new(),
    };
    if content_type.contains(',') {
        return true;
    }
    if content_type.is_empty() {
        return true;
    }

    let lowered = content_type.to_ascii_lowercase();
    inspectable_content_type(&lowered)
        || config
            .expected_content_types()
            .iter()
            .any(|prefix| lowered.starts_with(prefix.as_str()))
}

/// The declared `Content-Length`, or `None` when absent or unparseable.
fn declared_content_length(headers: &HeaderMap) -> Option<i64> {
    let value = headers.get(http::header::CONTENT_LENGTH)?;
    let parsed = value.to_str().ok()?.trim().parse::<i64>().ok()?;
    if parsed < 0 {
        return None;
    }
    Some(parsed)
}

/// Returns `true` for content types the agent knows how to inspect.
///
/// `value` must already be lowercased.
pub fn inspectable_content_type(value: &str) -> bool {
    value.starts_with("application/x-www-form-urlencoded")
        || value.starts_with("multipart/form-data")
        || value.contains("json")
        || value.contains("javascript")
        || value.starts_with("text/xml")
        || value.starts_with("application/xml")
        || value.contains("+xml")
        || value.starts_with("application/grpc")
        || value.starts_with("application/graphql")
}
