//! TCP listener serving one session per accepted connection.
//!
//! Sessions are independent: each connection gets its own module, backend
//! and function cache, and runs in its own task.

use super::session::ServerSession;
use crate::backend::ModuleLoader;
use crate::config::StreamConfig;
use crate::error::Result;
use crate::transport::stream::StreamServerTransport;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running stream server. Dropping shuts down the server.
pub struct StreamServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
    active_connections: Arc<AtomicUsize>,
}

impl StreamServerHandle {
    /// Address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Stop accepting connections and end every running session.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Wait until the accept loop has stopped.
    pub async fn join(mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for StreamServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Offload server over TCP.
pub struct StreamServer;

impl StreamServer {
    /// Bind `addr` and serve sessions in background tasks.
    ///
    /// Port 0 picks a free port; read it back from the handle.
    pub async fn start<L: ModuleLoader>(
        addr: SocketAddr,
        loader: Arc<L>,
    ) -> Result<StreamServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("Offload server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            loader,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(StreamServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
            active_connections,
        })
    }

    async fn accept_loop<L: ModuleLoader>(
        listener: TcpListener,
        loader: Arc<L>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Offload server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= StreamConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    StreamConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let loader = loader.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Session from {}", peer_addr);
                                tokio::select! {
                                    result = Self::handle_connection(stream, loader) => {
                                        if let Err(e) = result {
                                            error!("Session with {} failed: {}", peer_addr, e);
                                        }
                                    }
                                    _ = conn_shutdown.changed() => {
                                        debug!("Session with {} cancelled by shutdown", peer_addr);
                                    }
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<L: ModuleLoader>(stream: TcpStream, loader: Arc<L>) -> Result<()> {
        let transport = StreamServerTransport::new(stream)?;
        let peer = transport.peer_addr();
        let summary = ServerSession::new(transport, loader).run().await?;
        debug!("Session with {} served {} calls", peer, summary.calls);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kernels;
    use crate::transport::stream::StreamClientTransport;
    use crate::transport::ClientTransport;

    async fn start() -> StreamServerHandle {
        let loader = Arc::new(kernels::builtin_table().unwrap());
        StreamServer::start("127.0.0.1:0".parse().unwrap(), loader)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let server = start().await;

        let mut first = StreamClientTransport::connect(server.addr()).await.unwrap();
        let mut second = StreamClientTransport::connect(server.addr()).await.unwrap();
        first.send_module(kernels::ADD).await.unwrap();
        second.send_module(kernels::SCALE).await.unwrap();

        first.send_call(b"add:2:3").await.unwrap();
        let reply = String::from_utf8(first.receive_reply().await.unwrap()).unwrap();
        assert!(reply.ends_with(":5"), "{}", reply);

        // `add` is not part of the second session's module.
        second.send_call(b"add:2:3").await.unwrap();
        assert!(second.receive_reply().await.unwrap_err().is_peer_closed());

        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_sessions() {
        let mut server = start().await;
        let mut client = StreamClientTransport::connect(server.addr()).await.unwrap();
        client.send_module(kernels::ADD).await.unwrap();

        server.shutdown();
        assert!(client.receive_reply().await.unwrap_err().is_peer_closed());
        server.join().await;
    }
}
