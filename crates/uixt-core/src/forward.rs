//! Local TCP port forwarding.
//!
//! A [`PortForwarder`] owns one relay listener per local port. Each accepted
//! connection is paired with a fresh upstream stream from a
//! [`StreamConnector`] and bytes are pumped both ways until either side
//! closes. Devices use this to expose on-device servers (WDA, the stub socket)
//! on `127.0.0.1`.
//!
//! Forwarding a local port that already has a relay cancels and awaits the
//! previous relay before binding again, so a port is never leaked.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::driver::{DriverError, Result};

/// Backlog for relay listeners.
const LISTEN_BACKLOG: i32 = 128;

// ---------------------------------------------------------------------------
// Streams and connectors
// ---------------------------------------------------------------------------

/// A bidirectional async byte stream.
///
/// Both [`TcpStream`] and usbmuxd tunnels satisfy these bounds.
pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceStream for T {}

/// Opens upstream connections for a relay.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DeviceStream>>;

    /// Human-readable upstream description for logs.
    fn describe(&self) -> String;
}

/// Connects to a plain TCP address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn DeviceStream>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| DriverError::ConnectionLost(format!("{}: {e}", self.addr)))?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.addr)
    }
}

/// Connects to a port on an iOS device through usbmuxd.
#[derive(Debug, Clone)]
pub struct UsbTunnelConnector {
    udid: String,
    port: u16,
}

impl UsbTunnelConnector {
    pub fn new(udid: impl Into<String>, port: u16) -> Self {
        Self {
            udid: udid.into(),
            port,
        }
    }
}

#[async_trait]
impl StreamConnector for UsbTunnelConnector {
    async fn connect(&self) -> Result<Box<dyn DeviceStream>> {
        Ok(crate::usb_tunnel::connect(&self.udid, self.port).await?)
    }

    fn describe(&self) -> String {
        format!("usbmuxd:{}:{}", self.udid, self.port)
    }
}

// ---------------------------------------------------------------------------
// PortForwarder
// ---------------------------------------------------------------------------

struct Relay {
    upstream: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Relay {
    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Per-local-port relay bookkeeping.
#[derive(Default)]
pub struct PortForwarder {
    relays: Mutex<HashMap<u16, Relay>>,
}

impl PortForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts relaying `127.0.0.1:local_port` to `connector`.
    ///
    /// A `local_port` of 0 picks a free ephemeral port. Returns the bound
    /// local port.
    pub async fn forward(&self, local_port: u16, connector: Arc<dyn StreamConnector>) -> Result<u16> {
        let mut relays = self.relays.lock().await;

        if local_port != 0 {
            if let Some(previous) = relays.remove(&local_port) {
                info!(
                    local_port,
                    previous = %previous.upstream,
                    "re-forwarding busy local port, closing previous relay"
                );
                previous.shutdown().await;
            }
        }

        let listener = bind_listener(local_port)?;
        let port = listener.local_addr()?.port();
        let upstream = connector.describe();

        let cancel = CancellationToken::new();
        let span = tracing::debug_span!("port_forward", local_port = port, upstream = %upstream);
        let handle = tokio::spawn(relay_loop(listener, connector, cancel.clone()).instrument(span));

        debug!(local_port = port, %upstream, "port forward started");
        relays.insert(
            port,
            Relay {
                upstream,
                cancel,
                handle,
            },
        );
        Ok(port)
    }

    /// Stops the relay on `local_port`. Returns `false` if none existed.
    pub async fn remove(&self, local_port: u16) -> bool {
        let relay = self.relays.lock().await.remove(&local_port);
        match relay {
            Some(relay) => {
                relay.shutdown().await;
                debug!(local_port, "port forward removed");
                true
            }
            None => false,
        }
    }

    pub async fn remove_all(&self) {
        let relays: Vec<Relay> = self.relays.lock().await.drain().map(|(_, r)| r).collect();
        for relay in relays {
            relay.shutdown().await;
        }
    }

    /// Local ports with an active relay, sorted.
    pub async fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.relays.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub async fn upstream(&self, local_port: u16) -> Option<String> {
        self.relays
            .lock()
            .await
            .get(&local_port)
            .map(|r| r.upstream.clone())
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        for relay in self.relays.get_mut().values() {
            relay.cancel.cancel();
        }
    }
}

/// Binds a loopback listener with `SO_REUSEADDR`.
fn bind_listener(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

async fn relay_loop(
    listener: TcpListener,
    connector: Arc<dyn StreamConnector>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (mut inbound, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let connector = connector.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut upstream = match connector.connect().await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(%peer, error = %e, "upstream connect failed");
                            return;
                        }
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        result = tokio::io::copy_bidirectional(&mut inbound, &mut upstream) => {
                            if let Err(e) = result {
                                debug!(%peer, error = %e, "relay connection closed with error");
                            }
                        }
                    }
                });
            }
        }
    }
}
