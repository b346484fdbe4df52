//! Low-level RPC transport to the inspection agent.
//!
//! Every call opens a fresh connection over the configured network, performs
//! exactly one request/response exchange, and closes the connection. A
//! single deadline covers connect, send, and receive; when it expires the
//! call fails with a timeout error and the caller fails open.
//!
//! The wire format is a MessagePack-RPC exchange: the request is the array
//! `[0, seq, method, [argument]]` with the argument struct encoded as a map
//! keyed by field name, and the response is `[1, seq, error-or-nil,
//! result]`. Unknown fields inside the result are skipped during decoding.

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::Network;
use crate::error::InspectorError;

/// Message-kind marker for requests.
const MSG_REQUEST: i64 = 0;
/// Message-kind marker for responses.
const MSG_RESPONSE: u64 = 1;

/// One-shot RPC transport bound to an agent socket.
///
/// The transport is cheap to share; the only mutable state is the sequence
/// counter used to correlate frames within a connection.
#[derive(Debug)]
pub struct AgentTransport {
    network: Network,
    address: String,
    timeout: Duration,
    debug: bool,
    seq: AtomicU32,
}

impl AgentTransport {
    /// Creates a transport for the given socket and per-call deadline.
    pub fn new(network: Network, address: impl Into<String>, timeout: Duration, debug: bool) -> Self {
        AgentTransport {
            network,
            address: address.into(),
            timeout,
            debug,
            seq: AtomicU32::new(0),
        }
    }

    /// The configured per-call deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Performs one named call, returning the raw result value.
    ///
    /// The exchange runs on the blocking pool; the socket carries read and
    /// write deadlines so an orphaned exchange cannot outlive the budget by
    /// much even after the outer deadline has already failed the call.
    pub async fn call<T>(
        &self,
        method: &'static str,
        argument: &T,
    ) -> Result<rmpv::Value, InspectorError>
    where
        T: Serialize,
    {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let frame = encode_request(seq, method, argument)?;

        if self.debug {
            debug!(method, seq, address = %self.address, "opening a new agent connection");
        }

        let network = self.network;
        let address = self.address.clone();
        let io_timeout = self.timeout;
        let exchange = tokio::task::spawn_blocking(move || -> Result<rmpv::Value, InspectorError> {
            let response = match network {
                Network::Unix => {
                    let mut conn = UnixStream::connect(&address)?;
                    conn.set_read_timeout(Some(io_timeout))?;
                    conn.set_write_timeout(Some(io_timeout))?;
                    exchange_frame(&mut conn, &frame)?
                }
                Network::Tcp => {
                    let addr = resolve_tcp(&address)?;
                    let mut conn = TcpStream::connect_timeout(&addr, io_timeout)?;
                    conn.set_read_timeout(Some(io_timeout))?;
                    conn.set_write_timeout(Some(io_timeout))?;
                    exchange_frame(&mut conn, &frame)?
                }
            };
            decode_response(response, seq)
        });

        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => Err(InspectorError::Timeout {
                method,
                timeout: self.timeout,
            }),
            Ok(Err(join_err)) => Err(InspectorError::Protocol(format!(
                "agent exchange task failed: {join_err}"
            ))),
            Ok(Ok(result)) => result,
        };

        // socket deadlines surface as i/o errors; report them as the
        // single-deadline timeout they are
        result.map_err(|err| match err {
            InspectorError::Io(io_err)
                if matches!(
                    io_err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                InspectorError::Timeout {
                    method,
                    timeout: self.timeout,
                }
            }
            other => other,
        })
    }
}

/// Builds the `[0, seq, method, [argument]]` request frame.
fn encode_request<T: Serialize>(
    seq: u32,
    method: &str,
    argument: &T,
) -> Result<Vec<u8>, InspectorError> {
    let mut frame = Vec::with_capacity(256);
    rmp::encode::write_array_len(&mut frame, 4)
        .map_err(|err| InspectorError::Protocol(format!("encoding call header: {err}")))?;
    rmp::encode::write_sint(&mut frame, MSG_REQUEST)
        .map_err(|err| InspectorError::Protocol(format!("encoding message kind: {err}")))?;
    rmp::encode::write_uint(&mut frame, u64::from(seq))
        .map_err(|err| InspectorError::Protocol(format!("encoding sequence id: {err}")))?;
    rmp::encode::write_str(&mut frame, method)
        .map_err(|err| InspectorError::Protocol(format!("encoding method name: {err}")))?;
    rmp::encode::write_array_len(&mut frame, 1)
        .map_err(|err| InspectorError::Protocol(format!("encoding argument list: {err}")))?;

    let mut ser = rmp_serde::Serializer::new(&mut frame).with_struct_map();
    argument
        .serialize(&mut ser)
        .map_err(|err| InspectorError::Protocol(format!("encoding argument: {err}")))?;
    Ok(frame)
}

/// Writes the request frame and reads back one complete response value.
fn exchange_frame<C: Read + Write>(conn: &mut C, frame: &[u8]) -> Result<rmpv::Value, InspectorError> {
    conn.write_all(frame)?;
    conn.flush()?;
    let mut reader = BufReader::new(conn);
    rmpv::decode::read_value(&mut reader).map_err(|err| match err {
        rmpv::decode::Error::InvalidMarkerRead(io_err)
        | rmpv::decode::Error::InvalidDataRead(io_err) => InspectorError::Io(io_err),
        other => InspectorError::Protocol(format!("reading response: {other}")),
    })
}

/// Validates the `[1, seq, error, result]` response envelope and extracts
/// the result value.
fn decode_response(response: rmpv::Value, seq: u32) -> Result<rmpv::Value, InspectorError> {
    let mut parts = match response {
        rmpv::Value::Array(parts) if parts.len() == 4 => parts,
        other => {
            return Err(InspectorError::Protocol(format!(
                "expected a 4-element response array, got {other}"
            )))
        }
    };

    if parts[0].as_u64() != Some(MSG_RESPONSE) {
        return Err(InspectorError::Protocol(format!(
            "unexpected message kind {}",
            parts[0]
        )));
    }
    if parts[1].as_u64() != Some(u64::from(seq)) {
        return Err(InspectorError::Protocol(format!(
            "sequence mismatch: sent {seq}, got {}",
            parts[1]
        )));
    }

    let result = parts.pop().unwrap_or(rmpv::Value::Nil);
    let error = parts.pop().unwrap_or(rmpv::Value::Nil);
    match error {
        rmpv::Value::Nil => Ok(result),
        rmpv::Value::String(s) => Err(InspectorError::Remote(
            s.into_str().unwrap_or_else(|| "<non-utf8 error>".to_owned()),
        )),
        other => Err(InspectorError::Remote(other.to_string())),
    }
}

/// Resolves a `host:port` address to a socket address.
fn resolve_tcp(address: &str) -> Result<std::net::SocketAddr, std::io::Error> {
    use std::net::ToSocketAddrs;
    address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_shape() {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Arg {
            module_version: String,
        }

        let frame = encode_request(
            7,
            "RPC.PreRequest",
            &Arg {
                module_version: "m 1.0".into(),
            },
        )
        .expect("encode");

        let value = rmpv::decode::read_value(&mut &frame[..]).expect("decode");
        let parts = value.as_array().expect("array");
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].as_i64(), Some(0));
        assert_eq!(parts[1].as_u64(), Some(7));
        assert_eq!(parts[2].as_str(), Some("RPC.PreRequest"));

        let args = parts[3].as_array().expect("argument list");
        assert_eq!(args.len(), 1);
        let arg = args[0].as_map().expect("argument map");
        assert_eq!(arg[0].0.as_str(), Some("ModuleVersion"));
        assert_eq!(arg[0].1.as_str(), Some("m 1.0"));
    }

    #[test]
    fn response_envelope_ok() {
        let value = rmpv::Value::Array(vec![
            1.into(),
            3.into(),
            rmpv::Value::Nil,
            rmpv::Value::Map(vec![("WAFResponse".into(), 200.into())]),
        ]);
        let result = decode_response(value, 3).expect("ok envelope");
        assert!(result.is_map());
    }

    #[test]
    fn response_envelope_remote_error() {
        let value = rmpv::Value::Array(vec![
            1.into(),
            3.into(),
            "boom".into(),
            rmpv::Value::Nil,
        ]);
        let err = decode_response(value, 3).unwrap_err();
        assert!(matches!(err, InspectorError::Remote(msg) if msg == "boom"));
    }

    #[test]
    fn response_envelope_rejects_wrong_shape() {
        let err = decode_response(rmpv::Value::Array(vec![1.into(), 3.into()]), 3).unwrap_err();
        assert!(matches!(err, InspectorError::Protocol(_)));

        let wrong_kind = rmpv::Value::Array(vec![
            0.into(),
            3.into(),
            rmpv::Value::Nil,
            rmpv::Value::Nil,
        ]);
        let err = decode_response(wrong_kind, 3).unwrap_err();
        assert!(matches!(err, InspectorError::Protocol(_)));

        let wrong_seq = rmpv::Value::Array(vec![
            1.into(),
            9.into(),
            rmpv::Value::Nil,
            rmpv::Value::Nil,
        ]);
        let err = decode_response(wrong_seq, 3).unwrap_err();
        assert!(matches!(err, InspectorError::Protocol(_)));
    }
}
