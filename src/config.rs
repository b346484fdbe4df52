//! Module configuration built from composable, validated options.
//!
//! A [`ModuleConfig`] starts from defaults and is refined by an ordered list
//! of [`ModuleConfigOption`] functions. Each option validates its input and
//! may fail, aborting construction; this is the only fatal error path in the
//! crate. Once built, the configuration is immutable.
//!
//! ```no_run
//! use std::time::Duration;
//! use sigsci_module::config::{self, ModuleConfig};
//!
//! let cfg = ModuleConfig::new(vec![
//!     config::socket("tcp", "127.0.0.1:9999"),
//!     config::timeout(Duration::from_millis(50)),
//!     config::debug(true),
//! ])?;
//! # Ok::<(), sigsci_module::ConfigError>(())
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Request};

use crate::body::RequestBody;
use crate::error::ConfigError;
use crate::inspector::Inspector;

// ─────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────

/// Default agent socket network.
pub const DEFAULT_RPC_NETWORK: Network = Network::Unix;
/// Default agent socket address.
pub const DEFAULT_RPC_ADDRESS: &str = "/var/run/sigsci.sock";
/// Default per-RPC deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
/// Default response-size threshold that triggers a post call.
pub const DEFAULT_ANOMALY_SIZE: i64 = 512 * 1024;
/// Default response-duration threshold that triggers a post call.
pub const DEFAULT_ANOMALY_DURATION: Duration = Duration::from_secs(1);
/// Default inclusive upper bound on buffered request bodies.
pub const DEFAULT_MAX_CONTENT_LENGTH: i64 = 100_000;
/// Default module identity sent to the agent.
pub const DEFAULT_MODULE_IDENTIFIER: &str =
    concat!("sigsci-module-rust ", env!("CARGO_PKG_VERSION"));
/// Default server identity sent to the agent.
pub const DEFAULT_SERVER_IDENTIFIER: &str = "rust";

/// The transport used to reach the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// UNIX domain socket; the address is an absolute path.
    Unix,
    /// TCP; the address is `host:port`.
    Tcp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Unix => write!(f, "unix"),
            Network::Tcp => write!(f, "tcp"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Hook types
// ─────────────────────────────────────────────────────────────────────────

/// Decides per request whether inspection should run at all.
///
/// Returning `false` bypasses inspection: the downstream handler is invoked
/// with the original, unwrapped response writer.
pub type InspectorInitFn = Arc<dyn Fn(&Request<RequestBody>) -> bool + Send + Sync>;

/// Invoked once per inspected request, after any background agent call for
/// that request has completed.
pub type InspectorFiniFn = Arc<dyn Fn(&Request<RequestBody>) + Send + Sync>;

/// Alternative extraction of the inbound header map.
///
/// On error the default extraction (the request's own headers) is used.
pub type HeaderExtractorFn = Arc<
    dyn Fn(&Request<RequestBody>) -> Result<HeaderMap, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// A single configuration option; options are applied in order and may fail.
pub type ModuleConfigOption = Box<dyn FnOnce(&mut ModuleConfig) -> Result<(), ConfigError> + Send>;

// ─────────────────────────────────────────────────────────────────────────
// ModuleConfig
// ─────────────────────────────────────────────────────────────────────────

/// Immutable configuration for a [`Module`](crate::module::Module).
#[derive(Clone)]
pub struct ModuleConfig {
    allow_unknown_content_length: bool,
    anomaly_duration: Duration,
    anomaly_size: i64,
    debug: bool,
    expected_content_types: Vec<String>,
    header_extractor: Option<HeaderExtractorFn>,
    inspector: Option<Arc<dyn Inspector>>,
    inspector_init: Option<InspectorInitFn>,
    inspector_fini: Option<InspectorFiniFn>,
    max_content_length: i64,
    module_identifier: String,
    rpc_address: String,
    rpc_network: Network,
    server_identifier: String,
    server_flavor: String,
    timeout: Duration,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        ModuleConfig {
            allow_unknown_content_length: false,
            anomaly_duration: DEFAULT_ANOMALY_DURATION,
            anomaly_size: DEFAULT_ANOMALY_SIZE,
            debug: false,
            expected_content_types: Vec::new(),
            header_extractor: None,
            inspector: None,
            inspector_init: None,
            inspector_fini: None,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            module_identifier: DEFAULT_MODULE_IDENTIFIER.to_owned(),
            rpc_address: DEFAULT_RPC_ADDRESS.to_owned(),
            rpc_network: DEFAULT_RPC_NETWORK,
            server_identifier: DEFAULT_SERVER_IDENTIFIER.to_owned(),
            server_flavor: String::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl fmt::Debug for ModuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleConfig")
            .field("allow_unknown_content_length", &self.allow_unknown_content_length)
            .field("anomaly_duration", &self.anomaly_duration)
            .field("anomaly_size", &self.anomaly_size)
            .field("debug", &self.debug)
            .field("expected_content_types", &self.expected_content_types)
            .field("max_content_length", &self.max_content_length)
            .field("module_identifier", &self.module_identifier)
            .field("rpc_address", &self.rpc_address)
            .field("rpc_network", &self.rpc_network)
            .field("server_identifier", &self.server_identifier)
            .field("server_flavor", &self.server_flavor)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ModuleConfig {
    /// Build a configuration by applying `options` to the defaults.
    pub fn new(
        options: impl IntoIterator<Item = ModuleConfigOption>,
    ) -> Result<ModuleConfig, ConfigError> {
        let mut config = ModuleConfig::default();
        for opt in options {
            opt(&mut config)?;
        }
        Ok(config)
    }

    /// Returns `true` for verdict codes that allow the request.
    pub fn is_allow_code(&self, code: i32) -> bool {
        code == 200
    }

    /// Returns `true` for verdict codes that block the request.
    pub fn is_block_code(&self, code: i32) -> bool {
        (300..=599).contains(&code)
    }

    /// Whether bodies without a declared content length may be buffered.
    pub fn allow_unknown_content_length(&self) -> bool {
        self.allow_unknown_content_length
    }

    /// Response-duration threshold for post calls.
    pub fn anomaly_duration(&self) -> Duration {
        self.anomaly_duration
    }

    /// Response-size threshold for post calls.
    pub fn anomaly_size(&self) -> i64 {
        self.anomaly_size
    }

    /// Whether diagnostic logging is enabled.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Additional content-type prefixes treated as inspectable.
    pub fn expected_content_types(&self) -> &[String] {
        &self.expected_content_types
    }

    /// The configured alternative header extractor, if any.
    pub fn header_extractor(&self) -> Option<&HeaderExtractorFn> {
        self.header_extractor.as_ref()
    }

    /// The configured custom inspector, if any.
    pub fn inspector(&self) -> Option<&Arc<dyn Inspector>> {
        self.inspector.as_ref()
    }

    /// The configured inspection-init hook, if any.
    pub fn inspector_init(&self) -> Option<&InspectorInitFn> {
        self.inspector_init.as_ref()
    }

    /// The configured inspection-fini hook, if any.
    pub fn inspector_fini(&self) -> Option<&InspectorFiniFn> {
        self.inspector_fini.as_ref()
    }

    /// Inclusive upper bound on buffered request-body size.
    pub fn max_content_length(&self) -> i64 {
        self.max_content_length
    }

    /// Module identity sent to the agent.
    pub fn module_identifier(&self) -> &str {
        &self.module_identifier
    }

    /// Agent socket address.
    pub fn rpc_address(&self) -> &str {
        &self.rpc_address
    }

    /// Agent socket network.
    pub fn rpc_network(&self) -> Network {
        self.rpc_network
    }

    /// The network and address as a single display string.
    pub fn rpc_address_string(&self) -> String {
        format!("{}:{}", self.rpc_network, self.rpc_address)
    }

    /// Server identity sent to the agent.
    pub fn server_identifier(&self) -> &str {
        &self.server_identifier
    }

    /// Server flavor sent to the agent.
    pub fn server_flavor(&self) -> &str {
        &self.server_flavor
    }

    /// Per-RPC deadline covering connect, send, and receive.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Functional options
// ─────────────────────────────────────────────────────────────────────────

/// Sets where to reach the agent. `network` must be `unix` (absolute path
/// address) or `tcp` (`host:port` address).
pub fn socket(network: impl Into<String>, address: impl Into<String>) -> ModuleConfigOption {
    let network = network.into();
    let address = address.into();
    Box::new(move |c| {
        match network.as_str() {
            "unix" => {
                if !Path::new(&address).is_absolute() {
                    return Err(ConfigError::UnixAddressNotAbsolute(address));
                }
                c.rpc_network = Network::Unix;
            }
            "tcp" => {
                let valid = match address.rsplit_once(':') {
                    Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
                    None => false,
                };
                if !valid {
                    return Err(ConfigError::InvalidTcpAddress(address));
                }
                c.rpc_network = Network::Tcp;
            }
            _ => return Err(ConfigError::InvalidNetwork(network)),
        }
        c.rpc_address = address;
        Ok(())
    })
}

/// Sets the maximum time to wait for an agent reply. Once the deadline is
/// reached the module fails open.
pub fn timeout(timeout: Duration) -> ModuleConfigOption {
    Box::new(move |c| {
        c.timeout = timeout;
        Ok(())
    })
}

/// Sets the response-size threshold beyond which a post call is made.
pub fn anomaly_size(size: i64) -> ModuleConfigOption {
    Box::new(move |c| {
        c.anomaly_size = size;
        Ok(())
    })
}

/// Sets the response-duration threshold beyond which a post call is made.
pub fn anomaly_duration(duration: Duration) -> ModuleConfigOption {
    Box::new(move |c| {
        c.anomaly_duration = duration;
        Ok(())
    })
}

/// Sets the maximum request-body length that will be buffered.
pub fn max_content_length(size: i64) -> ModuleConfigOption {
    Box::new(move |c| {
        c.max_content_length = size;
        Ok(())
    })
}

/// Permits buffering bodies whose content length is not declared.
///
/// NOTE: this can be dangerous (unbounded memory) unless the server itself
/// limits request sizes. Intended for gRPC-style deployments where the
/// maximum receive size is enforced elsewhere.
pub fn allow_unknown_content_length(allow: bool) -> ModuleConfigOption {
    Box::new(move |c| {
        c.allow_unknown_content_length = allow;
        Ok(())
    })
}

/// Treats one additional content-type prefix as inspectable.
///
/// May be given multiple times; matching is case-insensitive.
pub fn expected_content_type(content_type: impl Into<String>) -> ModuleConfigOption {
    let content_type: String = content_type.into();
    let content_type = content_type.to_ascii_lowercase();
    Box::new(move |c| {
        c.expected_content_types.push(content_type);
        Ok(())
    })
}

/// Replaces the default RPC inspector with a custom implementation, with an
/// optional init predicate (inspection is skipped when it returns `false`)
/// and an optional fini callback run after inspection completes.
pub fn custom_inspector(
    inspector: Arc<dyn Inspector>,
    init: Option<InspectorInitFn>,
    fini: Option<InspectorFiniFn>,
) -> ModuleConfigOption {
    Box::new(move |c| {
        c.inspector = Some(inspector);
        c.inspector_init = init;
        c.inspector_fini = fini;
        Ok(())
    })
}

/// Sets a function to extract an alternative header map from the request.
/// Primarily intended for internal use by bindings.
pub fn custom_header_extractor(extractor: HeaderExtractorFn) -> ModuleConfigOption {
    Box::new(move |c| {
        c.header_extractor = Some(extractor);
        Ok(())
    })
}

/// Sets the module name and version sent to the agent.
/// The version should be a sem-version, e.g. `1.2.3`.
pub fn module_identifier(name: impl Into<String>, version: impl Into<String>) -> ModuleConfigOption {
    let (name, version): (String, String) = (name.into(), version.into());
    let identifier = format!("{name} {version}");
    Box::new(move |c| {
        c.module_identifier = identifier;
        Ok(())
    })
}

/// Sets the server identifier sent to the agent.
pub fn server_identifier(id: impl Into<String>) -> ModuleConfigOption {
    let id = id.into();
    Box::new(move |c| {
        c.server_identifier = id;
        Ok(())
    })
}

/// Sets the server flavor sent to the agent.
pub fn server_flavor(flavor: impl Into<String>) -> ModuleConfigOption {
    let flavor = flavor.into();
    Box::new(move |c| {
        c.server_flavor = flavor;
        Ok(())
    })
}

/// Enables diagnostic logging.
pub fn debug(enable: bool) -> ModuleConfigOption {
    Box::new(move |c| {
        c.debug = enable;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[test]
    fn default_config() {
        let c = ModuleConfig::default();
        assert!(!c.allow_unknown_content_length());
        assert_eq!(c.anomaly_duration(), Duration::from_secs(1));
        assert_eq!(c.anomaly_size(), 512 * 1024);
        assert!(!c.debug());
        assert_eq!(c.max_content_length(), 100_000);
        assert_eq!(c.rpc_network(), Network::Unix);
        assert_eq!(c.rpc_address(), "/var/run/sigsci.sock");
        assert_eq!(c.timeout(), Duration::from_millis(100));
        assert!(c.inspector().is_none());
        assert!(c.inspector_init().is_none());
        assert!(c.inspector_fini().is_none());
        assert!(c.header_extractor().is_none());
        assert!(c.module_identifier().starts_with("sigsci-module-rust "));
    }

    #[test]
    fn options_apply_in_order() {
        let c = ModuleConfig::new(vec![
            allow_unknown_content_length(true),
            anomaly_duration(Duration::from_secs(10)),
            anomaly_size(8192),
            debug(true),
            max_content_length(500_000),
            module_identifier("custom-module", "1.2.3"),
            server_identifier("test-server"),
            server_flavor("SugarAndSpice"),
            socket("tcp", "0.0.0.0:1234"),
            timeout(Duration::from_millis(10)),
            expected_content_type("application/octet-stream"),
        ])
        .expect("valid options");

        assert!(c.allow_unknown_content_length());
        assert_eq!(c.anomaly_duration(), Duration::from_secs(10));
        assert_eq!(c.anomaly_size(), 8192);
        assert!(c.debug());
        assert_eq!(c.max_content_length(), 500_000);
        assert_eq!(c.module_identifier(), "custom-module 1.2.3");
        assert_eq!(c.server_identifier(), "test-server");
        assert_eq!(c.server_flavor(), "SugarAndSpice");
        assert_eq!(c.rpc_network(), Network::Tcp);
        assert_eq!(c.rpc_address(), "0.0.0.0:1234");
        assert_eq!(c.rpc_address_string(), "tcp:0.0.0.0:1234");
        assert_eq!(c.timeout(), Duration::from_millis(10));
        assert_eq!(c.expected_content_types(), ["application/octet-stream"]);
    }

    #[test]
    fn socket_rejects_unknown_network() {
        let err = ModuleConfig::new(vec![socket("udp", "1.2.3.4:80")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNetwork(_)));
    }

    #[test]
    fn socket_rejects_relative_unix_path() {
        let err = ModuleConfig::new(vec![socket("unix", "run/agent.sock")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnixAddressNotAbsolute(_)));
    }

    #[test]
    fn socket_rejects_malformed_tcp_address() {
        for addr in ["localhost", "1.2.3.4:", ":80", "1.2.3.4:notaport"] {
            let err = ModuleConfig::new(vec![socket("tcp", addr)]).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidTcpAddress(_)), "{addr}");
        }
    }

    #[test]
    fn verdict_code_classification() {
        let c = ModuleConfig::default();
        assert!(c.is_allow_code(200));
        assert!(!c.is_allow_code(201));
        assert!(!c.is_block_code(200));
        assert!(c.is_block_code(300));
        assert!(c.is_block_code(406));
        assert!(c.is_block_code(599));
        assert!(!c.is_block_code(600));
        assert!(!c.is_block_code(-1));
    }
}
