//! Network listeners that frame incoming bytes into lines and hand them off for aggregation.
use std::{fmt, io, net::SocketAddr, str::FromStr, sync::Arc};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

mod tcp;
pub use self::tcp::TcpServer;

mod udp;
pub use self::udp::UdpServer;

/// Errors that could occur while binding or serving a listener.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listening socket.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        /// Address that was being bound.
        addr: SocketAddr,

        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The transport name is not supported.
    #[error("unsupported transport: {0:?}")]
    UnsupportedTransport(String),

    /// Accepting connections failed in a way that cannot be recovered from.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// The bound address of the listening socket could not be determined.
    #[error("failed to get local address: {0}")]
    LocalAddr(#[source] io::Error),

    /// The listener is serving already, or has been stopped.
    #[error("server is already serving or has been stopped")]
    AlreadyServing,
}

/// Network transport of a listener.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Transport {
    /// Stream transport. One line per newline-terminated chunk of a connection.
    #[default]
    Tcp,

    /// Datagram transport. Each datagram holds one or more newline-separated lines.
    Udp,
}

impl Transport {
    /// Returns the name of the transport.
    pub const fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl FromStr for Transport {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "tcp4" | "tcp6" => Ok(Transport::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Transport::Udp),
            _ => Err(ServerError::UnsupportedTransport(s.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives free-text notifications about recoverable problems.
pub trait Reporter: Send + Sync + 'static {
    /// Reports a condition that is expected in normal operation, such as a client disconnecting.
    fn on_debug(&self, args: fmt::Arguments<'_>);

    /// Reports a condition that likely needs attention, such as a malformed line.
    fn on_warning(&self, args: fmt::Arguments<'_>);
}

/// A [`Reporter`] that emits `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn on_debug(&self, args: fmt::Arguments<'_>) {
        debug!("{}", args);
    }

    fn on_warning(&self, args: fmt::Arguments<'_>) {
        warn!("{}", args);
    }
}

/// A raw line and the address it was received from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMetric {
    /// The line, trimmed of surrounding whitespace.
    pub raw: String,

    /// Address of the peer that sent the line.
    pub addr: SocketAddr,
}

/// A bound listener of either transport.
pub enum Server {
    /// Stream listener.
    Tcp(TcpServer),

    /// Datagram listener.
    Udp(UdpServer),
}

impl Server {
    /// Binds a listener of the given transport to `addr`.
    ///
    /// # Errors
    ///
    /// If the socket cannot be bound, an error is returned.
    pub async fn bind(transport: Transport, addr: SocketAddr) -> Result<Self, ServerError> {
        match transport {
            Transport::Tcp => TcpServer::bind(addr).await.map(Server::Tcp),
            Transport::Udp => UdpServer::bind(addr).await.map(Server::Udp),
        }
    }

    /// Returns the transport of the listener.
    pub fn transport(&self) -> Transport {
        match self {
            Server::Tcp(_) => Transport::Tcp,
            Server::Udp(_) => Transport::Udp,
        }
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Server::Tcp(server) => server.local_addr(),
            Server::Udp(server) => server.local_addr(),
        }
    }

    /// Serves until the listener is closed, or fails.
    ///
    /// Every non-empty line received is sent to `sender`. A full queue slows down reading.
    ///
    /// A requested stop is not an error: once [`close`][Self::close] is called, this returns
    /// `Ok(())`, including when the listener was closed before it started serving.
    ///
    /// # Errors
    ///
    /// If accepting or receiving fails irrecoverably, [`ServerError::Accept`] is returned. If the
    /// listener is serving already, or has already served, [`ServerError::AlreadyServing`] is
    /// returned.
    pub async fn serve(
        &self,
        sender: mpsc::Sender<RawMetric>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<(), ServerError> {
        match self {
            Server::Tcp(server) => server.serve(sender, reporter).await,
            Server::Udp(server) => server.serve(sender, reporter).await,
        }
    }

    /// Closes the listener, and waits for in-flight connections to finish.
    pub async fn close(&self) {
        match self {
            Server::Tcp(server) => server.close().await,
            Server::Udp(server) => server.close().await,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ServerState {
    Created,
    Serving,
    Stopping,
    Stopped,
    /// Closed without ever serving.
    Closed,
}

/// Tracks the `Created -> Serving -> Stopped` lifecycle of a listener, and lets `close` wait for
/// `serve` to wind down. Closing a listener that never served moves it to `Closed` instead.
struct Lifecycle {
    state: watch::Sender<ServerState>,
}

impl Lifecycle {
    fn new() -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self { state }
    }

    /// Moves to `Serving`, returning a receiver that observes the stop request.
    ///
    /// Returns `Ok(None)` if the listener was closed before serving, in which case there is
    /// nothing to serve.
    fn start(&self) -> Result<Option<watch::Receiver<ServerState>>, ServerError> {
        let mut previous = ServerState::Created;
        let started = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == ServerState::Created {
                *state = ServerState::Serving;
                true
            } else {
                false
            }
        });

        match previous {
            _ if started => Ok(Some(self.state.subscribe())),
            ServerState::Closed => Ok(None),
            _ => Err(ServerError::AlreadyServing),
        }
    }

    /// Resolves once a stop has been requested.
    async fn stop_requested(state: &mut watch::Receiver<ServerState>) {
        // The sender lives as long as the server, so this only fails if the server is gone.
        let _ = state.wait_for(|state| *state != ServerState::Serving).await;
    }

    fn finish(&self) {
        self.state.send_replace(ServerState::Stopped);
    }

    /// Requests a stop, and waits until serving has finished.
    async fn close(&self) {
        self.state.send_modify(|state| {
            *state = match *state {
                ServerState::Created | ServerState::Closed => ServerState::Closed,
                ServerState::Serving | ServerState::Stopping => ServerState::Stopping,
                ServerState::Stopped => ServerState::Stopped,
            };
        });

        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| matches!(state, ServerState::Stopped | ServerState::Closed))
            .await;
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Sends `line` to the queue, unless it is empty once trimmed.
///
/// Returns `false` if the queue has been closed.
async fn forward_line(
    line: &[u8],
    addr: SocketAddr,
    sender: &mpsc::Sender<RawMetric>,
    reporter: &dyn Reporter,
) -> bool {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line.trim(),
        Err(e) => {
            reporter.on_warning(format_args!("Dropping non UTF-8 line from {addr}: {e}"));
            return true;
        }
    };

    if line.is_empty() {
        return true;
    }

    sender.send(RawMetric { raw: line.to_string(), addr }).await.is_ok()
}
