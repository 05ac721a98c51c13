//! UDP dispatch plane
//!
//! Frontends send one `DispatchRequest` per datagram; workers decode, route
//! through the dispatcher, and reply from a separate ephemeral source port.
//! All workers share the receive socket; the runtime balances them.

use crate::dispatcher::Dispatcher;
use nexus_core::time::unix_now_ns;
use nexus_core::wire::DispatchRequest;
use nexus_core::{DispatcherConfig, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// UDP server fronting a [`Dispatcher`].
pub struct UdpDispatchServer {
    config: DispatcherConfig,
    dispatcher: Arc<Dispatcher>,
    rx_socket: Arc<UdpSocket>,
    tx_socket: Arc<UdpSocket>,
}

impl UdpDispatchServer {
    /// Bind the receive and reply sockets. Port 0 binds an ephemeral port;
    /// see [`UdpDispatchServer::local_addr`].
    pub async fn bind(config: DispatcherConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let rx_socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.udp_port)).await?);
        let tx_socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        info!(
            listen = %rx_socket.local_addr()?,
            reply_from = %tx_socket.local_addr()?,
            workers = config.num_udp_workers,
            "UDP dispatch server bound"
        );
        Ok(Self {
            config,
            dispatcher,
            rx_socket,
            tx_socket,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.rx_socket.local_addr()?)
    }

    /// Run worker tasks until the first one fails.
    pub async fn serve(&self) -> Result<()> {
        let mut workers: Vec<JoinHandle<Result<()>>> = Vec::new();
        for worker_id in 0..self.config.num_udp_workers {
            let rx = self.rx_socket.clone();
            let tx = self.tx_socket.clone();
            let dispatcher = self.dispatcher.clone();
            let max_datagram = self.config.max_datagram_bytes;
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, tx, dispatcher, max_datagram).await
            }));
        }

        for worker in workers {
            match worker.await {
                Ok(result) => result?,
                Err(err) => {
                    error!(error = %err, "UDP worker panicked");
                    return Err(nexus_core::Error::transport("UDP worker panicked"));
                }
            }
        }
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    rx_socket: Arc<UdpSocket>,
    tx_socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    max_datagram: usize,
) -> Result<()> {
    let mut buf = vec![0u8; max_datagram];
    loop {
        let (len, peer) = rx_socket.recv_from(&mut buf).await?;
        let dispatcher_recv_ns = unix_now_ns();
        if len == 0 {
            continue;
        }
        let request = match DispatchRequest::from_bytes(&buf[..len]) {
            Ok(request) => request,
            Err(err) => {
                warn!(peer = %peer, len, error = %err, "Bad dispatch request");
                continue;
            }
        };

        // Replies go to the frontend's advertised RPC port, not the
        // ephemeral source of the request
        let reply_addr = SocketAddr::new(peer.ip(), request.udp_rpc_port);
        let mut query = request.query_without_input;
        query.clock.dispatcher_recv_ns = dispatcher_recv_ns;
        debug!(worker_id, peer = %peer, query_id = %query.query_id, "Dispatch request");

        let Some(reply) = dispatcher.dispatch_request(query) else {
            continue;
        };
        let msg = match reply.to_bytes() {
            Ok(msg) => msg,
            Err(err) => {
                error!(error = %err, "Failed to serialize dispatch reply");
                continue;
            }
        };
        if msg.len() > max_datagram {
            warn!(len = msg.len(), "Dispatch reply exceeds datagram budget");
            continue;
        }
        match tx_socket.send_to(&msg, reply_addr).await {
            Ok(sent) if sent != msg.len() => {
                warn!(sent, expected = msg.len(), peer = %reply_addr, "Partial reply send");
            }
            Ok(_) => {}
            Err(err) => warn!(peer = %reply_addr, error = %err, "Failed to send reply"),
        }
    }
}
