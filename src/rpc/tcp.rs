//! TCP transport
//!
//! One multiplexed connection per peer address. Requests from any number of
//! callers share the connection's writer task; a reader task routes replies
//! to the pending table by correlation id. A connection that fails is
//! forgotten and the next call reconnects; calls still waiting on it fail
//! at once instead of running out their deadline.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::codec::{decode, encode, read_frame, write_frame};
use super::message::{CallId, RpcReply, RpcRequest};
use super::pending::PendingCalls;
use super::server::RpcServer;
use super::Transport;
use crate::error::{MeshError, Result};
use crate::registry::Node;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const OUTBOUND_QUEUE: usize = 1024;
// Prune timed-out cids from a connection's in-flight set past this size
const IN_FLIGHT_PRUNE_AT: usize = 4096;

/// Request/reply calls sent on one connection and not yet answered
#[derive(Default)]
struct InFlight {
    cids: DashSet<CallId>,
    closed: AtomicBool,
}

impl InFlight {
    /// Stop accepting calls and fail every call still waiting
    fn close(&self, pending: &PendingCalls, peer: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let cids: Vec<CallId> = self.cids.iter().map(|cid| *cid).collect();
        for cid in cids {
            self.cids.remove(&cid);
            if pending.fail(cid, format!("connection to {} lost", peer)) {
                debug!("Failed in-flight call cid={} to {}", cid, peer);
            }
        }
    }
}

#[derive(Clone)]
struct PeerConnection {
    id: u64,
    outbound: mpsc::Sender<RpcRequest>,
    in_flight: Arc<InFlight>,
}

pub struct TcpTransport {
    pending: Arc<PendingCalls>,
    peers: Arc<DashMap<String, PeerConnection>>,
    next_connection_id: AtomicU64,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl TcpTransport {
    pub fn new(pending: Arc<PendingCalls>) -> Self {
        Self {
            pending,
            peers: Arc::new(DashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.len()
    }

    async fn connection(&self, address: &str) -> Result<PeerConnection> {
        if let Some(existing) = self.peers.get(address) {
            if !existing.outbound.is_closed() {
                return Ok(existing.clone());
            }
        }
        self.peers
            .remove_if(address, |_, conn| conn.outbound.is_closed());

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| MeshError::Transport(format!("Connect to {} timed out", address)))?
            .map_err(|e| MeshError::Transport(format!("Connect to {} failed: {}", address, e)))?;
        stream.set_nodelay(true)?;
        debug!("Connected to peer {}", address);

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let in_flight = Arc::new(InFlight::default());
        let (outbound, mut requests) = mpsc::channel::<RpcRequest>(OUTBOUND_QUEUE);
        let (mut reader, mut writer) = stream.into_split();

        let peers = self.peers.clone();
        let peer = address.to_string();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let sent = match encode(&request) {
                    Ok(data) => write_frame(&mut writer, &data).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!("Write to {} failed: {}", peer, e);
                    break;
                }
            }
            peers.remove_if(&peer, |_, conn| conn.id == id);
        });

        let peers = self.peers.clone();
        let pending = self.pending.clone();
        let peer = address.to_string();
        let reader_in_flight = in_flight.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(data)) => match decode::<RpcReply>(&data) {
                        Ok(reply) => {
                            reader_in_flight.cids.remove(&reply.cid);
                            pending.complete(reply);
                        }
                        Err(e) => warn!("Undecodable reply from {}: {}", peer, e),
                    },
                    Ok(None) => {
                        debug!("Peer {} closed the connection", peer);
                        break;
                    }
                    Err(e) => {
                        warn!("Read from {} failed: {}", peer, e);
                        break;
                    }
                }
            }
            peers.remove_if(&peer, |_, conn| conn.id == id);
            reader_in_flight.close(&pending, &peer);
        });

        let conn = PeerConnection {
            id,
            outbound,
            in_flight,
        };
        // Another caller may have connected meanwhile; theirs wins
        let entry = self
            .peers
            .entry(address.to_string())
            .or_insert_with(|| conn.clone());
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dispatch(&self, node: &Node, request: RpcRequest) -> Result<()> {
        let conn = self.connection(&node.address).await?;
        let cid = request.cid;
        if request.reply {
            if conn.in_flight.cids.len() >= IN_FLIGHT_PRUNE_AT {
                let pending = &self.pending;
                conn.in_flight.cids.retain(|cid| pending.contains(*cid));
            }
            conn.in_flight.cids.insert(cid);
            if conn.in_flight.closed.load(Ordering::SeqCst) {
                conn.in_flight.cids.remove(&cid);
                return Err(MeshError::Transport(format!("Connection to {} closed", node)));
            }
        }
        let sent = conn.outbound.send(request).await;
        if sent.is_err() {
            conn.in_flight.cids.remove(&cid);
            return Err(MeshError::Transport(format!("Connection to {} closed", node)));
        }
        Ok(())
    }
}

/// Accepts peer connections and feeds their calls to an [`RpcServer`]
pub struct TcpRpcListener {
    pub local_addr: SocketAddr,
    listener: TcpListener,
    server: Arc<RpcServer>,
}

impl TcpRpcListener {
    pub async fn bind(bind_addr: SocketAddr, server: Arc<RpcServer>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| MeshError::Transport(format!("Socket creation failed: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MeshError::Transport(format!("Socket creation failed: {}", e)))?;
        Ok(Self {
            local_addr,
            listener,
            server,
        })
    }

    /// Start the accept loop
    pub fn spawn(self) -> JoinHandle<()> {
        info!("RPC listening on {}", self.local_addr);
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match self.listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("TCP accept failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", peer_addr, e);
                }
                tokio::spawn(serve_connection(stream, peer_addr, self.server.clone()));
            }
        })
    }
}

async fn serve_connection(stream: TcpStream, peer_addr: SocketAddr, server: Arc<RpcServer>) {
    debug!("Accepted RPC connection from {}", peer_addr);
    let (mut reader, mut writer) = stream.into_split();
    let (replies_tx, mut replies) = mpsc::channel::<RpcReply>(OUTBOUND_QUEUE);

    let writer_task = tokio::spawn(async move {
        while let Some(reply) = replies.recv().await {
            let sent = match encode(&reply) {
                Ok(data) => write_frame(&mut writer, &data).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!("Reply to {} failed: {}", peer_addr, e);
                break;
            }
        }
    });

    loop {
        let data = match read_frame(&mut reader).await {
            Ok(Some(data)) => data,
            Ok(None) => break,
            Err(e) => {
                warn!("Read from {} failed: {}", peer_addr, e);
                break;
            }
        };
        let request: RpcRequest = match decode(&data) {
            Ok(request) => request,
            Err(e) => {
                warn!("Undecodable request from {}: {}", peer_addr, e);
                continue;
            }
        };

        let server = server.clone();
        let replies_tx = replies_tx.clone();
        tokio::spawn(async move {
            if let Some(reply) = server.handle(request).await {
                // Connection may be gone by now
                let _ = replies_tx.send(reply).await;
            }
        });
    }

    drop(replies_tx);
    let _ = writer_task.await;
    debug!("RPC connection from {} closed", peer_addr);
}
