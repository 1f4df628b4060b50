//! LAN discovery: UDP multicast beacon, parse beacons, maintain peer list.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ride_core::protocol::{Envelope, Message};
use ride_core::wire::{decode_frame, encode_frame};
use ride_core::{PeerId, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::node::Input;
use crate::transport::AddressBook;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

/// Parsed beacon from another device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub peer: PeerId,
    pub display_name: String,
    pub listen_port: u16,
}

pub fn beacon_frame(me: PeerId, display_name: &str, listen_port: u16) -> std::io::Result<Vec<u8>> {
    let message = Message::Beacon {
        display_name: display_name.to_string(),
        listen_port,
    };
    encode_frame(&Envelope::new(me, message))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Beacon from someone else with our protocol version, or None.
pub fn parse_beacon(bytes: &[u8], me: PeerId) -> Option<Beacon> {
    let (envelope, _) = decode_frame(bytes).ok()?;
    if envelope.protocol_version != PROTOCOL_VERSION || envelope.sender == me {
        return None;
    }
    match envelope.message {
        Message::Beacon {
            display_name,
            listen_port,
        } => Some(Beacon {
            peer: envelope.sender,
            display_name,
            listen_port,
        }),
        _ => None,
    }
}

pub async fn run_discovery(
    me: PeerId,
    display_name: String,
    discovery_port: u16,
    transport_port: u16,
    book: AddressBook,
    inputs: mpsc::Sender<Input>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let frame = beacon_frame(me, &display_name, transport_port)?;
    let last_seen: Arc<Mutex<HashMap<PeerId, Instant>>> = Arc::new(Mutex::new(HashMap::new()));

    let beacon_task = tokio::spawn(beacon_loop(socket.clone(), frame.clone(), discovery_port));
    let recv_task = tokio::spawn(recv_loop(
        socket,
        frame,
        me,
        last_seen.clone(),
        book.clone(),
        inputs.clone(),
    ));
    let timeout_task = tokio::spawn(peer_timeout_loop(last_seen, book, inputs));

    let _ = tokio::try_join!(beacon_task, recv_task, timeout_task);
    Ok(())
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    frame: Vec<u8>,
    discovery_port: u16,
) -> std::io::Result<()> {
    let dest = SocketAddr::new(MULTICAST_GROUP.into(), discovery_port);
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    own_beacon: Vec<u8>,
    me: PeerId,
    last_seen: Arc<Mutex<HashMap<PeerId, Instant>>>,
    book: AddressBook,
    inputs: mpsc::Sender<Input>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(beacon) = parse_beacon(&buf[..n], me) else {
            continue;
        };
        let is_new = last_seen
            .lock()
            .await
            .insert(beacon.peer, Instant::now())
            .is_none();
        book.insert(beacon.peer, SocketAddr::new(from.ip(), beacon.listen_port))
            .await;
        if is_new {
            info!(peer = %beacon.peer, name = %beacon.display_name, "peer discovered");
            // Answer directly so the newcomer need not wait a full beacon interval.
            let _ = socket.send_to(&own_beacon, from).await;
        }
        let input = Input::Discovered {
            peer: beacon.peer,
            display_name: beacon.display_name,
        };
        if inputs.send(input).await.is_err() {
            return Ok(());
        }
    }
}

async fn peer_timeout_loop(
    last_seen: Arc<Mutex<HashMap<PeerId, Instant>>>,
    book: AddressBook,
    inputs: mpsc::Sender<Input>,
) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        let timed_out: Vec<PeerId> = {
            let mut seen = last_seen.lock().await;
            let list: Vec<PeerId> = seen
                .iter()
                .filter(|(_, t)| now.duration_since(**t) >= PEER_TIMEOUT)
                .map(|(id, _)| *id)
                .collect();
            for id in &list {
                seen.remove(id);
            }
            list
        };
        for peer in timed_out {
            debug!(peer = %peer.short(), "beacons stopped");
            book.remove(&peer).await;
            if inputs.send(Input::Disconnected(peer)).await.is_err() {
                return Ok(());
            }
        }
    }
}
