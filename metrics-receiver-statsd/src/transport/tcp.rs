use std::{net::SocketAddr, sync::Arc};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::{
    io::AsyncReadExt as _,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinSet,
};
use tracing::debug;

use super::{forward_line, is_transient, Lifecycle, RawMetric, Reporter, ServerError};
use crate::telemetry;

const READ_BUFFER_SIZE: usize = 4096;

/// A stream listener.
///
/// Each accepted connection is handled by its own task, which splits the byte stream into lines.
/// A line may span any number of reads.
pub struct TcpServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    lifecycle: Lifecycle,
}

impl TcpServer {
    /// Binds a new `TcpServer` to `addr`.
    ///
    /// # Errors
    ///
    /// If the socket cannot be bound, an error is returned.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(addr).await.map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        Ok(Self { listener: Mutex::new(Some(listener)), local_addr, lifecycle: Lifecycle::new() })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the server is closed, or accepting fails.
    ///
    /// In both cases, the listening socket is closed and connection tasks are waited on before
    /// returning. Closing is a clean stop and returns `Ok(())`, also when the server is closed
    /// before it started serving.
    ///
    /// # Errors
    ///
    /// If accepting fails irrecoverably, [`ServerError::Accept`] is returned. If the server is
    /// serving already, or has already served, [`ServerError::AlreadyServing`] is returned.
    pub async fn serve(
        &self,
        sender: mpsc::Sender<RawMetric>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<(), ServerError> {
        let Some(mut state) = self.lifecycle.start()? else {
            debug!(addr = %self.local_addr, "Closed before serving.");
            return Ok(());
        };
        let Some(listener) = self.listener.lock().take() else {
            // `close` took it between the state check and here.
            self.lifecycle.finish();
            return Ok(());
        };

        debug!(addr = %self.local_addr, "Serving TCP connections.");

        let mut connections = JoinSet::new();
        let result = loop {
            tokio::select! {
                () = Lifecycle::stop_requested(&mut state) => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        telemetry::connection_accepted();
                        reporter.on_debug(format_args!("Accepted connection from {peer}."));
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            sender.clone(),
                            Arc::clone(&reporter),
                        ));
                    }
                    Err(e) if is_transient(&e) => {
                        reporter.on_debug(format_args!("Failed to accept connection: {e}"));
                    }
                    Err(e) => break Err(ServerError::Accept(e)),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        reporter.on_warning(format_args!("Connection task failed: {e}"));
                    }
                }
            }
        };

        drop(listener);
        drop(sender);

        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                reporter.on_warning(format_args!("Connection task failed: {e}"));
            }
        }

        self.lifecycle.finish();
        debug!(addr = %self.local_addr, "Stopped serving TCP connections.");

        result
    }

    /// Stops accepting connections, and waits for open connections to be closed by their peers.
    pub async fn close(&self) {
        // Covers a server that was never served.
        self.listener.lock().take();
        self.lifecycle.close().await;
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    sender: mpsc::Sender<RawMetric>,
    reporter: Arc<dyn Reporter>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    // Bytes before this position are known not to contain a newline.
    let mut scanned = 0;

    loop {
        if buf.capacity() == buf.len() {
            buf.reserve(READ_BUFFER_SIZE);
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                if !buf.is_empty() {
                    forward_line(&buf, peer, &sender, reporter.as_ref()).await;
                }
                reporter.on_debug(format_args!("Connection from {peer} closed."));
                return;
            }
            Ok(_) => {
                while let Some(pos) = buf[scanned..].iter().position(|b| *b == b'\n') {
                    let line = buf.split_to(scanned + pos + 1);
                    scanned = 0;

                    if !forward_line(&line[..line.len() - 1], peer, &sender, reporter.as_ref()).await
                    {
                        // The aggregator is gone, so there is no point in reading further.
                        return;
                    }
                }
                scanned = buf.len();
            }
            Err(e) => {
                reporter.on_debug(format_args!("Failed to read from {peer}: {e}"));
                return;
            }
        }
    }
}
