//! The inspector contract: how the module talks to the inspection engine.
//!
//! The default implementation, [`RpcInspector`], speaks MessagePack-RPC to
//! the local agent. Custom implementations (in-process doubles for tests,
//! alternative transports) plug in through
//! [`custom_inspector`](crate::config::custom_inspector).

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ModuleConfig, Network};
use crate::error::InspectorError;
use crate::schema::{RequestIn, RequestInFollowup, ResponseOut};
use crate::transport::AgentTransport;

/// Abstraction over the inspection engine.
///
/// Implementations must be thread-safe and idempotent; the module calls
/// them concurrently from many request tasks and never serializes access.
#[async_trait]
pub trait Inspector: Send + Sync {
    /// Announces the module to the agent once at construction.
    async fn module_init(&self, input: &RequestIn) -> Result<ResponseOut, InspectorError>;

    /// Submits the request fingerprint and returns the agent's verdict.
    async fn pre_request(&self, input: &RequestIn) -> Result<ResponseOut, InspectorError>;

    /// Reports an anomalous response. The reply carries no usable payload.
    async fn post_request(&self, input: &RequestIn) -> Result<(), InspectorError>;

    /// Completes a transaction the agent issued a request id for. The reply
    /// carries no usable payload.
    async fn update_request(&self, input: &RequestInFollowup) -> Result<(), InspectorError>;
}

/// The default inspector: one fresh agent connection per call.
#[derive(Debug)]
pub struct RpcInspector {
    transport: AgentTransport,
}

impl RpcInspector {
    /// Creates an inspector for the given agent socket.
    pub fn new(network: Network, address: impl Into<String>, timeout: Duration, debug: bool) -> Self {
        RpcInspector {
            transport: AgentTransport::new(network, address, timeout, debug),
        }
    }

    /// Creates an inspector from the module configuration.
    pub fn from_config(config: &ModuleConfig) -> Self {
        RpcInspector::new(
            config.rpc_network(),
            config.rpc_address(),
            config.timeout(),
            config.debug(),
        )
    }
}

#[async_trait]
impl Inspector for RpcInspector {
    async fn module_init(&self, input: &RequestIn) -> Result<ResponseOut, InspectorError> {
        let result = self.transport.call("RPC.ModuleInit", input).await?;
        rmpv::ext::from_value(result)
            .map_err(|err| InspectorError::Protocol(format!("decoding module-init reply: {err}")))
    }

    async fn pre_request(&self, input: &RequestIn) -> Result<ResponseOut, InspectorError> {
        let result = self.transport.call("RPC.PreRequest", input).await?;
        rmpv::ext::from_value(result)
            .map_err(|err| InspectorError::Protocol(format!("decoding pre-request reply: {err}")))
    }

    async fn post_request(&self, input: &RequestIn) -> Result<(), InspectorError> {
        // the reply payload is a bare status int, ignored
        self.transport.call("RPC.PostRequest", input).await?;
        Ok(())
    }

    async fn update_request(&self, input: &RequestInFollowup) -> Result<(), InspectorError> {
        self.transport.call("RPC.UpdateRequest", input).await?;
        Ok(())
    }
}
