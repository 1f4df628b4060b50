//! Peer datagram transport: one frame per UDP datagram, no retries.
//!
//! Delivery is at-most-once and unordered; the core tolerates loss, duplication
//! and reordering on its own.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use ride_core::wire::decode_frame;
use ride_core::PeerId;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::node::Input;

const MAX_DATAGRAM: usize = 65_536;

/// Outbound side of the PeerChannel as seen by the node actor.
pub trait PeerChannel: Send + 'static {
    fn send(&self, to: PeerId, frame: Vec<u8>);
    fn broadcast(&self, frame: Vec<u8>);
}

/// Peer id → datagram address, fed by discovery and by inbound traffic.
#[derive(Clone, Default)]
pub struct AddressBook(Arc<Mutex<HashMap<PeerId, SocketAddr>>>);

impl AddressBook {
    /// One peer per address: a restarted daemon on the same port replaces its old id.
    pub async fn insert(&self, peer: PeerId, addr: SocketAddr) -> bool {
        let mut book = self.0.lock().await;
        book.retain(|p, a| *p == peer || *a != addr);
        book.insert(peer, addr) != Some(addr)
    }

    pub async fn remove(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.0.lock().await.remove(peer)
    }

    pub async fn get(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.0.lock().await.get(peer).copied()
    }

    pub async fn peer_at(&self, addr: SocketAddr) -> Option<PeerId> {
        self.0
            .lock()
            .await
            .iter()
            .find(|(_, a)| **a == addr)
            .map(|(p, _)| *p)
    }

    pub async fn addrs(&self) -> Vec<SocketAddr> {
        self.0.lock().await.values().copied().collect()
    }
}

enum Outgoing {
    To(PeerId, Vec<u8>),
    All(Vec<u8>),
}

pub struct UdpChannel {
    out: mpsc::UnboundedSender<Outgoing>,
    local_addr: SocketAddr,
}

impl UdpChannel {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl PeerChannel for UdpChannel {
    fn send(&self, to: PeerId, frame: Vec<u8>) {
        if self.out.send(Outgoing::To(to, frame)).is_err() {
            debug!("transport closed; frame dropped");
        }
    }

    fn broadcast(&self, frame: Vec<u8>) {
        if self.out.send(Outgoing::All(frame)).is_err() {
            debug!("transport closed; frame dropped");
        }
    }
}

/// Bind the peer socket and spawn its send and receive loops.
pub async fn bind(
    addr: SocketAddr,
    book: AddressBook,
    inputs: mpsc::Sender<Input>,
) -> std::io::Result<UdpChannel> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local_addr = socket.local_addr()?;
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(send_loop(socket.clone(), book.clone(), out_rx));
    tokio::spawn(async move {
        if let Err(e) = recv_loop(socket, book, inputs).await {
            warn!(error = %e, "transport receive loop stopped");
        }
    });
    Ok(UdpChannel {
        out: out_tx,
        local_addr,
    })
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    book: AddressBook,
    mut out: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(next) = out.recv().await {
        let (targets, frame) = match next {
            Outgoing::To(peer, frame) => match book.get(&peer).await {
                Some(addr) => (vec![addr], frame),
                None => {
                    debug!(peer = %peer.short(), "no address for peer; frame dropped");
                    continue;
                }
            },
            Outgoing::All(frame) => (book.addrs().await, frame),
        };
        for addr in targets {
            if let Err(e) = socket.send_to(&frame, addr).await {
                debug!(%addr, error = %e, "send failed");
            }
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    book: AddressBook,
    inputs: mpsc::Sender<Input>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let bytes = buf[..n].to_vec();
        // The transport identity of a datagram is its source address. Unknown
        // sources are learned from the envelope (a joiner the host never discovered).
        let peer = match book.peer_at(from).await {
            Some(p) => p,
            None => match decode_frame(&bytes) {
                Ok((envelope, _)) => {
                    book.insert(envelope.sender, from).await;
                    envelope.sender
                }
                Err(e) => {
                    debug!(%from, error = %e, "undecodable datagram dropped");
                    continue;
                }
            },
        };
        if inputs.send(Input::Frame { from: peer, bytes }).await.is_err() {
            return Ok(());
        }
    }
}
