//! Async client for the in-app stub hook.
//!
//! [`StubClient`] owns one connection and sends [`StubCommand`]s over the
//! newline-delimited JSON protocol in [`crate::stub_protocol`]. Sequence
//! numbers start at 1 and increase by one per request on a connection;
//! reconnecting restarts them.
//!
//! # Example
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use uixt_core::stub_client::StubClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let addr: SocketAddr = "127.0.0.1:32111".parse()?;
//! let mut client = StubClient::new(addr);
//!
//! client.connect().await?;
//! client.ping().await?;
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, debug_span, trace, Instrument};

use crate::driver::DriverError;
use crate::forward::DeviceStream;
use crate::stub_protocol::{decode_response, encode_request, ProtocolError, StubCommand};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Timeout for establishing a TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for reading a response line.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StubClientError {
    /// Attempted to send a command without an active connection.
    #[error("not connected to stub hook")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The hook closed the connection.
    #[error("connection closed by stub hook")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The hook answered with an `Error`.
    #[error("stub error: {0}")]
    Remote(String),

    #[error("operation timed out")]
    Timeout,
}

impl StubClientError {
    /// True when the connection is unusable and a reconnect may help.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            StubClientError::NotConnected
                | StubClientError::ConnectionFailed(_)
                | StubClientError::Closed
                | StubClientError::Io(_)
                | StubClientError::Timeout
        )
    }
}

impl From<StubClientError> for DriverError {
    fn from(err: StubClientError) -> Self {
        match err {
            StubClientError::NotConnected => DriverError::NotConnected,
            StubClientError::ConnectionFailed(msg) => DriverError::ConnectionLost(msg),
            StubClientError::Closed => DriverError::ConnectionLost("stub hook closed the connection".into()),
            StubClientError::Io(e) => DriverError::Io(e),
            StubClientError::Protocol(e) => DriverError::JsonParse(e.to_string()),
            StubClientError::Remote(msg) => DriverError::CommandFailed(msg),
            StubClientError::Timeout => DriverError::Timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// StubClient
// ---------------------------------------------------------------------------

pub struct StubClient {
    stream: Option<BufReader<Box<dyn DeviceStream>>>,
    addr: Option<SocketAddr>,
    next_seq: u64,
}

impl StubClient {
    /// Creates a client targeting `addr`; nothing is opened until
    /// [`connect`](Self::connect).
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            stream: None,
            addr: Some(addr),
            next_seq: 1,
        }
    }

    /// Creates a client over an already connected stream.
    pub fn from_stream(stream: impl DeviceStream + 'static) -> Self {
        Self {
            stream: Some(BufReader::new(Box::new(stream))),
            addr: None,
            next_seq: 1,
        }
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub async fn connect(&mut self) -> Result<(), StubClientError> {
        let addr = self
            .addr
            .ok_or_else(|| StubClientError::ConnectionFailed("no address configured".into()))?;

        debug!(%addr, "connecting to stub hook");
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| StubClientError::Timeout)?
            .map_err(|e| StubClientError::ConnectionFailed(e.to_string()))?;

        let boxed: Box<dyn DeviceStream> = Box::new(stream);
        self.stream = Some(BufReader::new(boxed));
        self.next_seq = 1;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.stream.take();
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Sends `command` and returns the `Result` payload.
    ///
    /// Any I/O failure or timeout drops the connection, so a late answer can
    /// never be read as the reply to the next command.
    pub async fn send(&mut self, command: &StubCommand) -> Result<Value, StubClientError> {
        let span = debug_span!("stub_send", cmd = command.name());
        async {
            let seq = self.next_seq;
            self.next_seq += 1;
            let line = encode_request(seq, command)?;

            let outcome = self.round_trip(&line).await;
            let reply = match outcome {
                Ok(reply) => reply,
                Err(e) => {
                    self.stream.take();
                    return Err(e);
                }
            };

            let frame = decode_response(reply.as_bytes(), seq)?;
            frame.into_result().map_err(StubClientError::Remote)
        }
        .instrument(span)
        .await
    }

    pub async fn ping(&mut self) -> Result<(), StubClientError> {
        self.send(&StubCommand::Ping).await?;
        Ok(())
    }

    async fn round_trip(&mut self, line: &[u8]) -> Result<String, StubClientError> {
        let stream = self.stream.as_mut().ok_or(StubClientError::NotConnected)?;
        trace!(bytes = line.len(), "writing line");
        stream.get_mut().write_all(line).await?;
        stream.get_mut().flush().await?;

        let mut reply = String::new();
        let read = timeout(READ_TIMEOUT, stream.read_line(&mut reply))
            .await
            .map_err(|_| StubClientError::Timeout)??;
        if read == 0 {
            return Err(StubClientError::Closed);
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub_protocol::{decode_request, encode_response, ResponseFrame};
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    #[test]
    fn new_client_is_disconnected() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let client = StubClient::new(addr);
        assert!(!client.is_connected());
        assert_eq!(client.addr(), Some(addr));
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let mut client = StubClient::new("127.0.0.1:0".parse().unwrap());
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, StubClientError::NotConnected));
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn sequence_numbers_increase() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut server = BufReader::new(server_side);
            for _ in 0..2 {
                let mut line = String::new();
                server.read_line(&mut line).await.unwrap();
                let request = decode_request(line.as_bytes()).unwrap();
                let reply = ResponseFrame::ok(request.seq, json!(request.seq));
                server
                    .get_mut()
                    .write_all(&encode_response(&reply).unwrap())
                    .await
                    .unwrap();
            }
        });

        let mut client = StubClient::from_stream(client_side);
        assert_eq!(client.send(&StubCommand::Ping).await.unwrap(), json!(1));
        assert_eq!(client.send(&StubCommand::IsLogin).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn remote_error_keeps_connection() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut server = BufReader::new(server_side);
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            let reply = ResponseFrame::err(1, "captcha expired");
            server
                .get_mut()
                .write_all(&encode_response(&reply).unwrap())
                .await
                .unwrap();
            let mut rest = Vec::new();
            let _ = server.read_to_end(&mut rest).await;
        });

        let mut client = StubClient::from_stream(client_side);
        let err = client.send(&StubCommand::Logout).await.unwrap_err();
        assert!(matches!(err, StubClientError::Remote(ref m) if m == "captcha expired"));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn closed_connection_is_dropped() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        drop(server_side);
        let mut client = StubClient::from_stream(client_side);
        let err = client.ping().await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(!client.is_connected());
    }

    #[test]
    fn maps_into_driver_errors() {
        let err: DriverError = StubClientError::Remote("boom".into()).into();
        assert!(matches!(err, DriverError::CommandFailed(_)));
        let err: DriverError = StubClientError::Closed.into();
        assert!(err.is_transport());
    }
}
