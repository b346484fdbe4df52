//! sigsci-module - in-process HTTP inspection middleware.
//!
//! This library sits between inbound HTTP requests and the application
//! handler. For each request it forwards the request fingerprint (and a
//! bounded slice of the body) to a locally running inspection agent over a
//! UNIX domain socket or TCP, then enforces the agent's verdict:
//!
//! - **Allow (200):** the downstream handler runs normally, behind a
//!   recording writer that captures status and size for follow-up reporting.
//! - **Block (300-599):** the handler is skipped and a plain status page is
//!   written - or, for 3xx verdicts with an agent-supplied location, an
//!   HTTP redirect.
//! - **Anything else:** fail open; the handler runs as if the module were
//!   absent.
//!
//! The module **fails open** on every agent problem - slow, unreachable, or
//! malformed replies never drop a request. After the response, at most one
//! background call reports the outcome to the agent without delaying the
//! client.
//!
//! # Integration
//!
//! Server bindings implement [`ResponseWriter`] over their native write
//! surface and [`Handler`] for the application, then hand both to a
//! [`Module`]:
//!
//! ```ignore
//! let config = ModuleConfig::new(vec![
//!     config::socket("unix", "/var/run/sigsci.sock"),
//!     config::timeout(Duration::from_millis(100)),
//! ])?;
//! let module = Module::new(app, config).await;
//! // per request:
//! module.handle(&mut writer, request).await;
//! ```
//!
//! Connection metadata (remote address, TLS parameters) is supplied through
//! a [`PeerInfo`] request extension.

pub mod body;
pub mod config;
pub mod error;
pub mod inspector;
pub mod module;
pub mod schema;
pub mod transport;
pub mod writer;

pub use body::{should_read_body, RequestBody};
pub use config::{ModuleConfig, Network};
pub use error::{ConfigError, InspectorError};
pub use inspector::{Inspector, RpcInspector};
pub use module::{Handler, Module, PeerInfo, TlsInfo};
pub use schema::{HeaderAction, HeaderList, RequestIn, RequestInFollowup, ResponseOut};
pub use writer::{ResponseRecorder, ResponseWriter};
