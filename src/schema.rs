//! Messages exchanged with the inspection agent.
//!
//! Field names on the wire follow the agent's schema exactly, so every
//! struct here carries serde renames. Structs are encoded as maps keyed by
//! field name; header lists are arrays of `[name, value]` pairs in
//! insertion order with duplicates preserved; header actions are fixed-size
//! two-element tuples. Decoding skips unknown map fields so the agent's
//! vocabulary can grow independently of the module.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Ordered list of header `(name, value)` pairs.
///
/// Duplicate names are legal and order is significant.
pub type HeaderList = Vec<(String, String)>;

/// Marker for response code/millis/size fields before a response exists.
pub const UNKNOWN: i64 = -1;

/// The request fingerprint sent to the agent.
///
/// Built once before the downstream handler runs (pre-request) and again,
/// with the response fields populated, when an anomalous response triggers a
/// post call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RequestIn {
    /// Deprecated site key, always sent empty.
    #[serde(rename = "AccessKeyID")]
    pub access_key_id: String,
    /// Module build identity, e.g. `sigsci-module-rust 0.1.0`
    pub module_version: String,
    /// Hosting server identity, e.g. `rust 1.85`
    pub server_version: String,
    /// Additional server configuration info (optional)
    pub server_flavor: String,
    /// Hostname from the request
    pub server_name: String,
    /// Start of request, Unix seconds
    pub timestamp: i64,
    /// Current time, Unix milliseconds
    pub now_millis: i64,
    /// Remote IP address with any port stripped
    pub remote_addr: String,
    /// HTTP method
    pub method: String,
    /// `http` or `https`
    pub scheme: String,
    /// Raw path and query
    #[serde(rename = "URI")]
    pub uri: String,
    /// HTTP protocol, e.g. `HTTP/1.1`
    pub protocol: String,
    /// Human-readable TLS protocol, e.g. `TLSv1.2`; empty for plaintext
    #[serde(rename = "TLSProtocol")]
    pub tls_protocol: String,
    /// Human-readable TLS cipher; empty for plaintext
    #[serde(rename = "TLSCipher")]
    pub tls_cipher: String,
    /// Verdict code from the pre-request exchange; set only on post calls
    #[serde(rename = "WAFResponse")]
    pub waf_response: i32,
    /// HTTP response status code, [`UNKNOWN`] before the response exists
    pub response_code: i32,
    /// Response duration in milliseconds, [`UNKNOWN`] before the response exists
    pub response_millis: i64,
    /// Response size in bytes, [`UNKNOWN`] before the response exists
    pub response_size: i64,
    /// Request headers, ordered, duplicates preserved
    pub headers_in: HeaderList,
    /// Response headers; empty except on post calls
    pub headers_out: HeaderList,
    /// Buffered request body; empty when no buffering was performed
    pub post_body: Bytes,
}

impl Default for RequestIn {
    fn default() -> Self {
        RequestIn {
            access_key_id: String::new(),
            module_version: String::new(),
            server_version: String::new(),
            server_flavor: String::new(),
            server_name: String::new(),
            timestamp: 0,
            now_millis: 0,
            remote_addr: String::new(),
            method: String::new(),
            scheme: String::new(),
            uri: String::new(),
            protocol: String::new(),
            tls_protocol: String::new(),
            tls_cipher: String::new(),
            waf_response: 0,
            response_code: UNKNOWN as i32,
            response_millis: UNKNOWN,
            response_size: UNKNOWN,
            headers_in: Vec::new(),
            headers_out: Vec::new(),
            post_body: Bytes::new(),
        }
    }
}

/// The follow-up fingerprint sent after the response when the agent issued a
/// request id. There is no meaningful reply to this message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RequestInFollowup {
    /// Correlation token returned by the pre-request call
    #[serde(rename = "RequestID")]
    pub request_id: String,
    /// HTTP response status code
    pub response_code: i32,
    /// Response duration in milliseconds
    pub response_millis: i64,
    /// Response size in bytes
    pub response_size: i64,
    /// Response headers
    pub headers_out: HeaderList,
}

/// The agent verdict returned by the pre-request exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ResponseOut {
    /// Numeric verdict code; see
    /// [`ModuleConfig::is_allow_code`](crate::config::ModuleConfig::is_allow_code)
    /// and [`is_block_code`](crate::config::ModuleConfig::is_block_code)
    #[serde(rename = "WAFResponse")]
    pub waf_response: i32,
    /// Opaque correlation token; when non-empty the module must follow up
    /// with an update call instead of a post call
    #[serde(rename = "RequestID", skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    /// Headers to apply to the inbound request before the handler runs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers: HeaderList,
    /// Header actions to apply to the outbound response
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resp_actions: Vec<HeaderAction>,
}

/// Header-action opcodes carried in [`HeaderAction`].
pub mod action {
    /// Append a header value.
    pub const ADD: i8 = 1;
    /// Replace all values for the header.
    pub const SET: i8 = 2;
    /// Set the header only when it is currently absent or empty.
    pub const SET_IF_ABSENT: i8 = 3;
    /// Remove the header.
    pub const DEL: i8 = 4;
}

/// A single response-header mutation: `(opcode, [name, value...])`.
///
/// Encoded as a fixed two-element tuple on the wire. The argument list
/// holds the header name and, for everything but [`action::DEL`], the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderAction(pub i8, pub Vec<String>);

impl HeaderAction {
    /// Append `value` to `name`.
    pub fn add(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderAction(action::ADD, vec![name.into(), value.into()])
    }

    /// Replace all values of `name` with `value`.
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderAction(action::SET, vec![name.into(), value.into()])
    }

    /// Set `name` to `value` only when currently absent or empty.
    pub fn set_if_absent(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderAction(action::SET_IF_ABSENT, vec![name.into(), value.into()])
    }

    /// Remove `name`.
    pub fn del(name: impl Into<String>) -> Self {
        HeaderAction(action::DEL, vec![name.into()])
    }

    /// The opcode, one of the [`action`] constants.
    pub fn code(&self) -> i8 {
        self.0
    }

    /// The header name, if present.
    pub fn name(&self) -> Option<&str> {
        self.1.first().map(String::as_str)
    }

    /// The header value, if present.
    pub fn value(&self) -> Option<&str> {
        self.1.get(1).map(String::as_str)
    }
}
