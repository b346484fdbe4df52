//! The per-request lifecycle: inspection gate, pre-request verdict,
//! downstream dispatch, and follow-up reporting.
//!
//! A [`Module`] wraps a downstream [`Handler`] and forwards request
//! metadata (plus a bounded slice of the body) to the local agent before
//! the handler runs. The agent's verdict decides whether the handler is
//! invoked, the request is blocked, or the client is redirected. After the
//! response, at most one background call reports the outcome.
//!
//! The module never fails a request because of the agent: a slow,
//! unreachable, or misbehaving agent always results in the request being
//! served as though inspection never happened.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Request, StatusCode, Version};
use tracing::{debug, error};

use crate::body::{should_read_body, RequestBody};
use crate::config::ModuleConfig;
use crate::error::InspectorError;
use crate::inspector::{Inspector, RpcInspector};
use crate::schema::{HeaderList, RequestIn, RequestInFollowup, ResponseOut, UNKNOWN};
use crate::writer::{ResponseRecorder, ResponseWriter};

/// Inbound header set to the verdict code after a pre-request exchange.
pub const X_SIGSCI_AGENTRESPONSE: HeaderName = HeaderName::from_static("x-sigsci-agentresponse");
/// Inbound header carrying the agent-issued request id, when one exists.
pub const X_SIGSCI_REQUESTID: HeaderName = HeaderName::from_static("x-sigsci-requestid");
/// Inbound header carrying agent-assigned tags; cleared before each verdict.
pub const X_SIGSCI_TAGS: HeaderName = HeaderName::from_static("x-sigsci-tags");
/// Inbound header carrying the redirect location for 3xx block verdicts.
pub const X_SIGSCI_REDIRECT: HeaderName = HeaderName::from_static("x-sigsci-redirect");

/// Connection metadata supplied by the server binding through request
/// extensions.
///
/// Bindings insert a `PeerInfo` into [`Request::extensions_mut`] before
/// handing the request to [`Module::handle`]. A missing `PeerInfo` is
/// tolerated; the fingerprint then carries empty connection fields.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    /// Remote socket address, `ip:port` or bare IP.
    pub remote_addr: String,
    /// TLS session parameters; `None` for plaintext connections.
    pub tls: Option<TlsInfo>,
}

/// Human-readable TLS session parameters.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// e.g. `TLSv1.3`
    pub protocol: String,
    /// e.g. `TLS_AES_128_GCM_SHA256`
    pub cipher: String,
}

/// The downstream application handler wrapped by the module.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serves one request, writing the response through `w`.
    async fn serve(&self, w: &mut dyn ResponseWriter, req: &mut Request<RequestBody>);
}

type BackgroundCall = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The inspection middleware.
///
/// Cheap to clone; every clone shares the same configuration, inspector,
/// and downstream handler. `handle` may be called concurrently from any
/// number of request tasks.
#[derive(Clone)]
pub struct Module {
    config: Arc<ModuleConfig>,
    inspector: Arc<dyn Inspector>,
    handler: Arc<dyn Handler>,
}

impl Module {
    /// Wraps `handler` with inspection per `config`.
    ///
    /// Announces the module to the agent; an unreachable agent is logged
    /// (when debug is enabled) but does not prevent the module from
    /// serving traffic.
    pub async fn new(handler: impl Handler + 'static, config: ModuleConfig) -> Module {
        let inspector = match config.inspector() {
            Some(custom) => Arc::clone(custom),
            None => Arc::new(RpcInspector::from_config(&config)),
        };
        let module = Module {
            config: Arc::new(config),
            inspector,
            handler: Arc::new(handler),
        };

        let now = Utc::now();
        let init = RequestIn {
            module_version: module.config.module_identifier().to_owned(),
            server_version: module.config.server_identifier().to_owned(),
            server_flavor: module.config.server_flavor().to_owned(),
            timestamp: now.timestamp(),
            now_millis: now.timestamp_millis(),
            ..RequestIn::default()
        };
        if let Err(err) = module.inspector.module_init(&init).await {
            if module.config.debug() {
                debug!(error = %err, "module-init call to agent failed");
            }
        }

        module
    }

    /// The active inspector.
    pub fn inspector(&self) -> &Arc<dyn Inspector> {
        &self.inspector
    }

    /// The module configuration.
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Handles one request, wrapping the downstream handler.
    ///
    /// Never returns an error: any inspection failure falls back to serving
    /// the request as if the module were absent.
    pub async fn handle(&self, w: &mut dyn ResponseWriter, mut req: Request<RequestBody>) {
        let start = Instant::now();
        let config = &self.config;

        // Bypassed requests get the raw writer so every optional capability
        // of the underlying connection stays observable downstream.
        if let Some(init) = config.inspector_init() {
            if !init(&req) {
                self.handler.serve(w, &mut req).await;
                return;
            }
        }

        if config.debug() {
            debug!(
                method = %req.method(),
                host = %request_host(&req),
                uri = %req.uri(),
                "calling pre-request inspection"
            );
        }
        let (mut followup, out) = match self.inspector_pre_request(&mut req).await {
            Ok(exchange) => exchange,
            Err(err) => {
                if config.debug() {
                    debug!(error = %err, "pre-request call failed, failing open");
                }
                self.handler.serve(w, &mut req).await;
                self.dispatch_background(None, req);
                return;
            }
        };

        let mut recorder = ResponseRecorder::with_actions(w, out.resp_actions.clone());
        let verdict = out.waf_response;
        let handler_ran = if config.is_allow_code(verdict) {
            self.handler.serve(&mut recorder, &mut req).await;
            true
        } else if config.is_block_code(verdict) {
            // agent-rendered response; no anomaly report needed later
            block_request(&mut recorder, &req, verdict).await;
            false
        } else {
            error!(code = verdict, "received invalid response code from inspector, failing open");
            self.handler.serve(&mut recorder, &mut req).await;
            true
        };

        let duration = start.elapsed();
        let code = recorder.status_code();
        let size = recorder.bytes_written();
        let headers_out = header_list(recorder.headers(), "");
        drop(recorder);

        let background: Option<BackgroundCall> = if !followup.request_id.is_empty() {
            followup.response_code = i32::from(code.as_u16());
            followup.response_size = size as i64;
            followup.response_millis = duration.as_millis() as i64;
            followup.headers_out = headers_out;
            if config.debug() {
                debug!(
                    request_id = %followup.request_id,
                    code = code.as_u16(),
                    size,
                    ?duration,
                    "dispatching update-request for returned request id"
                );
            }
            let inspector = Arc::clone(&self.inspector);
            let debug_enabled = config.debug();
            Some(Box::pin(async move {
                if let Err(err) = inspector.update_request(&followup).await {
                    if debug_enabled {
                        debug!(error = %err, "update-request call failed");
                    }
                }
            }))
        } else if handler_ran
            && (i32::from(code.as_u16()) >= 300
                || size as i64 >= config.anomaly_size()
                || duration >= config.anomaly_duration())
        {
            if config.debug() {
                debug!(
                    code = code.as_u16(),
                    size,
                    ?duration,
                    "dispatching post-request for anomalous response"
                );
            }
            let mut message = self.build_request_in(
                &req,
                Bytes::new(),
                i32::from(code.as_u16()),
                duration.as_millis() as i64,
                size as i64,
            );
            message.waf_response = verdict;
            message.headers_out = headers_out;
            let inspector = Arc::clone(&self.inspector);
            let debug_enabled = config.debug();
            Some(Box::pin(async move {
                if let Err(err) = inspector.post_request(&message).await {
                    if debug_enabled {
                        debug!(error = %err, "post-request call failed");
                    }
                }
            }))
        } else {
            None
        };

        self.dispatch_background(background, req);
    }

    /// Buffers the body when the gate selects it, performs the pre-request
    /// exchange, and applies the verdict's inbound-header side effects.
    async fn inspector_pre_request(
        &self,
        req: &mut Request<RequestBody>,
    ) -> Result<(RequestInFollowup, ResponseOut), InspectorError> {
        let mut post_body = Bytes::new();
        if should_read_body(req, &self.config) {
            // Read errors are tolerated; partial bytes become the body.
            post_body = req.body_mut().collect_bytes().await;
            // Rebind so the handler reads the same bytes as the client sent.
            *req.body_mut() = RequestBody::buffered(post_body.clone());
        }

        let message =
            self.build_request_in(req, post_body, UNKNOWN as i32, UNKNOWN, UNKNOWN);
        let out = self.inspector.pre_request(&message).await?;

        let headers = req.headers_mut();
        // An upstream proxy may already have stamped these; replace rather
        // than append so the handler sees only this exchange's values.
        if let Ok(value) = HeaderValue::try_from(out.waf_response.to_string()) {
            headers.insert(X_SIGSCI_AGENTRESPONSE, value);
        }
        if out.request_id.is_empty() {
            headers.remove(X_SIGSCI_REQUESTID);
        } else if let Ok(value) = HeaderValue::try_from(out.request_id.as_str()) {
            headers.insert(X_SIGSCI_REQUESTID, value);
        }
        headers.remove(X_SIGSCI_TAGS);
        headers.remove(X_SIGSCI_REDIRECT);

        for (name, value) in &out.request_headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) else {
                debug!(name = %name, "skipping malformed agent request header");
                continue;
            };
            if name.as_str().starts_with("x-sigsci-") {
                headers.insert(name, value);
            } else {
                headers.append(name, value);
            }
        }

        let followup = RequestInFollowup {
            request_id: out.request_id.clone(),
            ..RequestInFollowup::default()
        };
        Ok((followup, out))
    }

    /// Builds the request fingerprint sent to the agent.
    fn build_request_in(
        &self,
        req: &Request<RequestBody>,
        post_body: Bytes,
        response_code: i32,
        response_millis: i64,
        response_size: i64,
    ) -> RequestIn {
        let config = &self.config;
        let now = Utc::now();
        let peer = req
            .extensions()
            .get::<PeerInfo>()
            .cloned()
            .unwrap_or_default();
        let (scheme, tls_protocol, tls_cipher) = match peer.tls {
            Some(tls) => ("https", tls.protocol, tls.cipher),
            None => ("http", String::new(), String::new()),
        };

        let host = request_host(req);
        let headers_in = match config.header_extractor() {
            Some(extract) => match extract(req) {
                Ok(extracted) => header_list(&extracted, &host),
                Err(err) => {
                    if config.debug() {
                        debug!(error = %err, "custom header extractor failed, using request headers");
                    }
                    header_list(req.headers(), &host)
                }
            },
            None => header_list(req.headers(), &host),
        };

        RequestIn {
            module_version: config.module_identifier().to_owned(),
            server_version: config.server_identifier().to_owned(),
            server_flavor: config.server_flavor().to_owned(),
            server_name: host,
            timestamp: now.timestamp(),
            now_millis: now.timestamp_millis(),
            remote_addr: strip_port(&peer.remote_addr),
            method: req.method().to_string(),
            scheme: scheme.to_owned(),
            uri: request_uri(req),
            protocol: protocol_string(req.version()),
            tls_protocol,
            tls_cipher,
            response_code,
            response_millis,
            response_size,
            headers_in,
            post_body,
            ..RequestIn::default()
        }
    }

    /// Spawns the optional background agent call and, once it completes,
    /// the fini hook. The serving task is never blocked on either.
    fn dispatch_background(&self, background: Option<BackgroundCall>, req: Request<RequestBody>) {
        let fini = self.config.inspector_fini().map(Arc::clone);
        if background.is_none() && fini.is_none() {
            return;
        }
        tokio::spawn(async move {
            if let Some(call) = background {
                call.await;
            }
            if let Some(fini) = fini {
                fini(&req);
            }
        });
    }
}

/// Writes the block response for a rejected request: a redirect when the
/// verdict is 3xx and the agent supplied a location, a plain-text status
/// page otherwise.
async fn block_request(w: &mut dyn ResponseWriter, req: &Request<RequestBody>, verdict: i32) {
    let status = match StatusCode::from_u16(verdict as u16) {
        Ok(status) => status,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if (300..=399).contains(&verdict) {
        let redirect = req
            .headers()
            .get(&X_SIGSCI_REDIRECT)
            .and_then(|v| v.to_str().ok())
            .filter(|location| !location.is_empty())
            .map(str::to_owned);
        if let Some(location) = redirect {
            if let Err(err) = write_redirect(w, status, &location).await {
                debug!(error = %err, "writing redirect response failed");
            }
            return;
        }
    }

    if let Err(err) = write_error(w, status).await {
        debug!(error = %err, "writing block response failed");
    }
}

/// Writes a `Location` redirect with no body.
async fn write_redirect(
    w: &mut dyn ResponseWriter,
    status: StatusCode,
    location: &str,
) -> std::io::Result<()> {
    if let Ok(value) = HeaderValue::try_from(location) {
        w.headers_mut().insert(http::header::LOCATION, value);
    }
    w.write_head(status).await
}

/// Writes a standard `"<code> <reason>\n"` error body.
async fn write_error(w: &mut dyn ResponseWriter, status: StatusCode) -> std::io::Result<()> {
    let headers = w.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    w.write_head(status).await?;
    let body = format!(
        "{} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    w.write(body.as_bytes()).await?;
    Ok(())
}

/// The request's hostname: the `Host` header when present, the URI
/// authority otherwise.
fn request_host(req: &Request<RequestBody>) -> String {
    if let Some(host) = req.headers().get(http::header::HOST) {
        return String::from_utf8_lossy(host.as_bytes()).into_owned();
    }
    req.uri()
        .authority()
        .map(|authority| authority.to_string())
        .unwrap_or_default()
}

/// The raw path-and-query of the request.
fn request_uri(req: &Request<RequestBody>) -> String {
    match req.uri().path_and_query() {
        Some(path_and_query) => path_and_query.as_str().to_owned(),
        None => req.uri().to_string(),
    }
}

/// Renders the HTTP protocol version the way servers report it.
fn protocol_string(version: Version) -> String {
    if version == Version::HTTP_09 {
        "HTTP/0.9".to_owned()
    } else if version == Version::HTTP_10 {
        "HTTP/1.0".to_owned()
    } else if version == Version::HTTP_11 {
        "HTTP/1.1".to_owned()
    } else if version == Version::HTTP_2 {
        "HTTP/2.0".to_owned()
    } else if version == Version::HTTP_3 {
        "HTTP/3.0".to_owned()
    } else {
        format!("{version:?}")
    }
}

/// Removes a trailing `:port` from an address, leaving anything that does
/// not look like `host:port` untouched.
fn strip_port(addr: &str) -> String {
    // bracketed IPv6, e.g. "[::1]:8080"
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_owned();
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty()
                && !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && !host.contains(':') =>
        {
            host.to_owned()
        }
        _ => addr.to_owned(),
    }
}

/// Flattens a header map into an ordered `[name, value]` list, using
/// canonical header casing. A non-empty `host` is re-inserted as the first
/// entry, standing in for the host line servers strip from the header map.
fn header_list(headers: &HeaderMap, host: &str) -> HeaderList {
    let mut list = Vec::with_capacity(headers.len() + 1);
    if !host.is_empty() {
        list.push(("Host".to_owned(), host.to_owned()));
    }
    for (name, value) in headers {
        if *name == http::header::HOST {
            continue;
        }
        list.push((
            canonical_header_name(name.as_str()),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        ));
    }
    list
}

/// Canonical MIME casing for a header name: each dash-separated segment
/// starts with an uppercase letter.
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for b in name.chars() {
        if upper_next {
            out.extend(b.to_uppercase());
        } else {
            out.push(b);
        }
        upper_next = b == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_port_cases() {
        let cases = [
            ("", ""),
            ("foo:bar:baz", "foo:bar:baz"),
            ("127.0.0.1", "127.0.0.1"),
            ("127.0.0.1:8000", "127.0.0.1"),
            ("::1", "::1"),
            ("[::1]:8000", "::1"),
        ];
        for (input, want) in cases {
            assert_eq!(strip_port(input), want, "{input}");
        }
    }

    #[test]
    fn canonical_header_names() {
        assert_eq!(canonical_header_name("x-sigsci-tags"), "X-Sigsci-Tags");
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("host"), "Host");
        assert_eq!(canonical_header_name("etag"), "Etag");
    }

    #[test]
    fn header_list_reinserts_host_first() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("text/plain"));
        let list = header_list(&headers, "example.com");
        assert_eq!(list[0], ("Host".to_owned(), "example.com".to_owned()));
        assert_eq!(
            &list[1..],
            [
                ("Accept".to_owned(), "text/html".to_owned()),
                ("Accept".to_owned(), "text/plain".to_owned()),
            ]
        );
    }

    #[test]
    fn header_list_drops_duplicate_host_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, HeaderValue::from_static("example.com"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        let list = header_list(&headers, "example.com");
        let hosts: Vec<_> = list.iter().filter(|(name, _)| name == "Host").collect();
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn protocol_strings() {
        assert_eq!(protocol_string(Version::HTTP_11), "HTTP/1.1");
        assert_eq!(protocol_string(Version::HTTP_2), "HTTP/2.0");
    }

    #[test]
    fn request_uri_prefers_path_and_query() {
        let req = Request::builder()
            .uri("http://example.com/search?q=1")
            .body(RequestBody::none())
            .expect("request");
        assert_eq!(request_uri(&req), "/search?q=1");
    }

    #[test]
    fn request_host_prefers_host_header() {
        let req = Request::builder()
            .uri("http://authority.example/")
            .header(http::header::HOST, "header.example")
            .body(RequestBody::none())
            .expect("request");
        assert_eq!(request_host(&req), "header.example");

        let req = Request::builder()
            .uri("http://authority.example/")
            .body(RequestBody::none())
            .expect("request");
        assert_eq!(request_host(&req), "authority.example");
    }
}
