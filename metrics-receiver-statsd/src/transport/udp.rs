use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::debug;

use super::{forward_line, Lifecycle, RawMetric, Reporter, ServerError};

const MAX_DATAGRAM_SIZE: usize = 65_535;

/// A datagram listener.
///
/// Every datagram is split on newlines, and each line is attributed to the datagram's sender.
pub struct UdpServer {
    socket: Mutex<Option<UdpSocket>>,
    local_addr: SocketAddr,
    lifecycle: Lifecycle,
}

impl UdpServer {
    /// Binds a new `UdpServer` to `addr`.
    ///
    /// # Errors
    ///
    /// If the socket cannot be bound, an error is returned.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ServerError> {
        let socket =
            UdpSocket::bind(addr).await.map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = socket.local_addr().map_err(ServerError::LocalAddr)?;

        Ok(Self { socket: Mutex::new(Some(socket)), local_addr, lifecycle: Lifecycle::new() })
    }

    /// Returns the address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receives datagrams until the server is closed.
    ///
    /// Receive errors are reported and skipped. Closing the server, even before it started
    /// serving, makes this return `Ok(())`.
    ///
    /// # Errors
    ///
    /// If the server is serving already, or has already served, an error is returned.
    pub async fn serve(
        &self,
        sender: mpsc::Sender<RawMetric>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<(), ServerError> {
        let Some(mut state) = self.lifecycle.start()? else {
            debug!(addr = %self.local_addr, "Closed before serving.");
            return Ok(());
        };
        let Some(socket) = self.socket.lock().take() else {
            // `close` took it between the state check and here.
            self.lifecycle.finish();
            return Ok(());
        };

        debug!(addr = %self.local_addr, "Serving UDP datagrams.");

        let mut buf = vec![0; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                () = Lifecycle::stop_requested(&mut state) => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if !forward_datagram(&buf[..len], peer, &sender, reporter.as_ref()).await {
                            break;
                        }
                    }
                    Err(e) => reporter.on_warning(format_args!("Failed to receive datagram: {e}")),
                },
            }
        }

        drop(socket);
        self.lifecycle.finish();
        debug!(addr = %self.local_addr, "Stopped serving UDP datagrams.");

        Ok(())
    }

    /// Stops receiving datagrams.
    pub async fn close(&self) {
        self.socket.lock().take();
        self.lifecycle.close().await;
    }
}

async fn forward_datagram(
    datagram: &[u8],
    peer: SocketAddr,
    sender: &mpsc::Sender<RawMetric>,
    reporter: &dyn Reporter,
) -> bool {
    for line in datagram.split(|b| *b == b'\n') {
        if !forward_line(line, peer, sender, reporter).await {
            return false;
        }
    }
    true
}
