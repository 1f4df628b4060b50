//! Presence: live set of peers heard on the channel and their connection state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::PeerId;
use crate::protocol::ConnectionState;

/// Connection-state change for MembershipCoordinator to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    Discovered(PeerId),
    Connected(PeerId),
    Lost(PeerId),
    /// Lost for longer than the grace period; timers for the peer are gone.
    Removed(PeerId),
}

struct Tracked {
    state: ConnectionState,
    last_seen: Instant,
    lost_at: Option<Instant>,
}

/// Tracks liveness per peer. Time is passed in by the caller.
pub struct PresenceTracker {
    peers: HashMap<PeerId, Tracked>,
    liveness_timeout: Duration,
    grace_period: Duration,
}

impl PresenceTracker {
    pub fn new(liveness_timeout: Duration, grace_period: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            liveness_timeout,
            grace_period,
        }
    }

    /// PeerChannel discovery event. A lost peer that is rediscovered goes back to connecting.
    pub fn on_peer_discovered(&mut self, peer: PeerId, now: Instant) -> Vec<PresenceEvent> {
        match self.peers.get_mut(&peer) {
            Some(t) => {
                t.last_seen = now;
                if t.state == ConnectionState::Lost {
                    t.state = ConnectionState::Connecting;
                    t.lost_at = None;
                    return vec![PresenceEvent::Discovered(peer)];
                }
                vec![]
            }
            None => {
                self.peers.insert(
                    peer,
                    Tracked {
                        state: ConnectionState::Connecting,
                        last_seen: now,
                        lost_at: None,
                    },
                );
                vec![PresenceEvent::Discovered(peer)]
            }
        }
    }

    /// Any message or heartbeat from `peer`. Unknown peers count as discovered.
    pub fn heartbeat(&mut self, peer: PeerId, now: Instant) -> Vec<PresenceEvent> {
        match self.peers.get_mut(&peer) {
            Some(t) => {
                t.last_seen = now;
                if t.state != ConnectionState::Connected {
                    t.state = ConnectionState::Connected;
                    t.lost_at = None;
                    return vec![PresenceEvent::Connected(peer)];
                }
                vec![]
            }
            None => {
                self.peers.insert(
                    peer,
                    Tracked {
                        state: ConnectionState::Connected,
                        last_seen: now,
                        lost_at: None,
                    },
                );
                vec![
                    PresenceEvent::Discovered(peer),
                    PresenceEvent::Connected(peer),
                ]
            }
        }
    }

    /// PeerChannel disconnect event. Ignored for unknown peers (loss always follows discovery).
    pub fn on_peer_lost(&mut self, peer: PeerId, now: Instant) -> Vec<PresenceEvent> {
        match self.peers.get_mut(&peer) {
            Some(t) if t.state != ConnectionState::Lost => {
                t.state = ConnectionState::Lost;
                t.lost_at = Some(now);
                vec![PresenceEvent::Lost(peer)]
            }
            _ => vec![],
        }
    }

    /// Forget a peer immediately (graceful leave). No event.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer).is_some()
    }

    /// Forget everyone (local session teardown).
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Liveness check: silent peers become lost; peers lost past the grace period are removed.
    pub fn tick(&mut self, now: Instant) -> Vec<PresenceEvent> {
        let mut events = Vec::new();
        let mut removed = Vec::new();
        for (&peer, t) in self.peers.iter_mut() {
            match t.state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    if now.saturating_duration_since(t.last_seen) > self.liveness_timeout {
                        t.state = ConnectionState::Lost;
                        t.lost_at = Some(now);
                        events.push(PresenceEvent::Lost(peer));
                    }
                }
                ConnectionState::Lost => {
                    let lost_at = t.lost_at.unwrap_or(now);
                    if now.saturating_duration_since(lost_at) >= self.grace_period {
                        removed.push(peer);
                    }
                }
            }
        }
        removed.sort();
        for peer in removed {
            self.peers.remove(&peer);
            events.push(PresenceEvent::Removed(peer));
        }
        events
    }

    pub fn state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.peers.get(peer).map(|t| t.state)
    }
}
