//! Shared test doubles: an in-memory response writer, a scriptable
//! inspector, and a recording downstream handler.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, StatusCode};
use tokio::sync::mpsc;

use sigsci_module::body::RequestBody;
use sigsci_module::error::InspectorError;
use sigsci_module::inspector::Inspector;
use sigsci_module::schema::{HeaderAction, HeaderList, RequestIn, RequestInFollowup, ResponseOut};
use sigsci_module::writer::{Flush, ResponseWriter};

// ─────────────────────────────────────────────────────────────────────────
// MockWriter
// ─────────────────────────────────────────────────────────────────────────

/// In-memory response writer with a configurable flush capability.
///
/// It deliberately supports neither hijack nor close-notify, so tests can
/// tell the raw writer and the recording wrapper apart by probing.
pub struct MockWriter {
    pub headers: HeaderMap,
    pub status: Option<StatusCode>,
    pub body: Vec<u8>,
    pub flushable: bool,
    pub flushes: usize,
}

impl MockWriter {
    pub fn new() -> MockWriter {
        MockWriter {
            headers: HeaderMap::new(),
            status: None,
            body: Vec::new(),
            flushable: false,
            flushes: 0,
        }
    }

    pub fn flushable() -> MockWriter {
        MockWriter {
            flushable: true,
            ..MockWriter::new()
        }
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
impl ResponseWriter for MockWriter {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
        self.status = Some(status);
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn as_flush(&mut self) -> Option<&mut dyn Flush> {
        if self.flushable {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl Flush for MockWriter {
    async fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────
// ScriptedInspector
// ─────────────────────────────────────────────────────────────────────────

/// Every agent call observed by a [`ScriptedInspector`].
#[derive(Debug, Clone)]
pub enum AgentCall {
    Init(RequestIn),
    Pre(RequestIn),
    Post(RequestIn),
    Update(RequestInFollowup),
}

impl AgentCall {
    pub fn name(&self) -> &'static str {
        match self {
            AgentCall::Init(_) => "init",
            AgentCall::Pre(_) => "pre",
            AgentCall::Post(_) => "post",
            AgentCall::Update(_) => "update",
        }
    }
}

/// An in-process inspector that replies from a fixed script and records
/// every call it receives.
pub struct ScriptedInspector {
    pub verdict: i32,
    pub request_id: String,
    pub request_headers: HeaderList,
    pub resp_actions: Vec<HeaderAction>,
    pub fail_pre_request: bool,
    pub update_delay: Option<Duration>,
    events: mpsc::UnboundedSender<AgentCall>,
}

impl ScriptedInspector {
    /// An inspector answering every pre-request with `verdict` and nothing
    /// else, plus the receiving end of its call log.
    pub fn allowing(verdict: i32) -> (ScriptedInspector, mpsc::UnboundedReceiver<AgentCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ScriptedInspector {
                verdict,
                request_id: String::new(),
                request_headers: Vec::new(),
                resp_actions: Vec::new(),
                fail_pre_request: false,
                update_delay: None,
                events: tx,
            },
            rx,
        )
    }

    pub fn with_request_id(mut self, id: &str) -> ScriptedInspector {
        self.request_id = id.to_owned();
        self
    }

    pub fn with_request_header(mut self, name: &str, value: &str) -> ScriptedInspector {
        self.request_headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_resp_action(mut self, action: HeaderAction) -> ScriptedInspector {
        self.resp_actions.push(action);
        self
    }

    pub fn failing_pre_request(mut self) -> ScriptedInspector {
        self.fail_pre_request = true;
        self
    }

    pub fn with_update_delay(mut self, delay: Duration) -> ScriptedInspector {
        self.update_delay = Some(delay);
        self
    }

    fn record(&self, call: AgentCall) {
        // the receiver may be gone in tests that do not care
        let _ = self.events.send(call);
    }
}

#[async_trait]
impl Inspector for ScriptedInspector {
    async fn module_init(&self, input: &RequestIn) -> Result<ResponseOut, InspectorError> {
        self.record(AgentCall::Init(input.clone()));
        Ok(ResponseOut {
            waf_response: 200,
            ..ResponseOut::default()
        })
    }

    async fn pre_request(&self, input: &RequestIn) -> Result<ResponseOut, InspectorError> {
        self.record(AgentCall::Pre(input.clone()));
        if self.fail_pre_request {
            return Err(InspectorError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "agent socket refused connection",
            )));
        }
        Ok(ResponseOut {
            waf_response: self.verdict,
            request_id: self.request_id.clone(),
            request_headers: self.request_headers.clone(),
            resp_actions: self.resp_actions.clone(),
        })
    }

    async fn post_request(&self, input: &RequestIn) -> Result<(), InspectorError> {
        self.record(AgentCall::Post(input.clone()));
        Ok(())
    }

    async fn update_request(&self, input: &RequestInFollowup) -> Result<(), InspectorError> {
        if let Some(delay) = self.update_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(AgentCall::Update(input.clone()));
        Ok(())
    }
}

/// Waits up to one second for the next recorded agent call.
pub async fn next_call(rx: &mut mpsc::UnboundedReceiver<AgentCall>) -> AgentCall {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for an agent call")
        .expect("agent call channel closed")
}

/// Asserts that no further agent call arrives within a short grace period.
pub async fn assert_no_more_calls(rx: &mut mpsc::UnboundedReceiver<AgentCall>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Ok(call) = rx.try_recv() {
        panic!("unexpected agent call: {}", call.name());
    }
}

// ─────────────────────────────────────────────────────────────────────────
// RecordingHandler
// ─────────────────────────────────────────────────────────────────────────

/// What the downstream handler observed while serving.
#[derive(Debug, Default)]
pub struct HandlerState {
    pub invocations: AtomicUsize,
    pub seen_headers: Mutex<Option<HeaderMap>>,
    pub seen_body: Mutex<Option<Bytes>>,
    pub saw_hijack_capability: Mutex<Option<bool>>,
    pub saw_flush_capability: Mutex<Option<bool>>,
}

impl HandlerState {
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn seen_header(&self, name: &str) -> Vec<String> {
        let guard = self.seen_headers.lock().expect("lock");
        let Some(headers) = guard.as_ref() else {
            return Vec::new();
        };
        headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect()
    }
}

/// A downstream handler that records what it sees and writes a scripted
/// response.
pub struct RecordingHandler {
    pub status: Option<u16>,
    pub body: Vec<u8>,
    pub response_headers: Vec<(String, String)>,
    pub read_body: bool,
    pub state: Arc<HandlerState>,
}

impl RecordingHandler {
    /// Writes `body` with an implicit 200 status.
    pub fn ok(body: &str) -> RecordingHandler {
        RecordingHandler {
            status: None,
            body: body.as_bytes().to_vec(),
            response_headers: Vec::new(),
            read_body: false,
            state: Arc::new(HandlerState::default()),
        }
    }

    pub fn with_status(mut self, status: u16) -> RecordingHandler {
        self.status = Some(status);
        self
    }

    pub fn with_response_header(mut self, name: &str, value: &str) -> RecordingHandler {
        self.response_headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn reading_body(mut self) -> RecordingHandler {
        self.read_body = true;
        self
    }

    pub fn state(&self) -> Arc<HandlerState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl sigsci_module::module::Handler for RecordingHandler {
    async fn serve(&self, w: &mut dyn ResponseWriter, req: &mut Request<RequestBody>) {
        self.state.invocations.fetch_add(1, Ordering::SeqCst);
        *self.state.seen_headers.lock().expect("lock") = Some(req.headers().clone());
        *self.state.saw_hijack_capability.lock().expect("lock") = Some(w.as_hijack().is_some());
        *self.state.saw_flush_capability.lock().expect("lock") = Some(w.as_flush().is_some());

        if self.read_body {
            let bytes = req.body_mut().collect_bytes().await;
            *self.state.seen_body.lock().expect("lock") = Some(bytes);
        }

        for (name, value) in &self.response_headers {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                w.headers_mut().insert(name, value);
            }
        }
        if let Some(status) = self.status {
            if let Ok(status) = StatusCode::from_u16(status) {
                let _ = w.write_head(status).await;
            }
        }
        if !self.body.is_empty() {
            let _ = w.write(&self.body).await;
        }
    }
}
