//! Membership: group roster, host designation, join/leave protocol.
//!
//! Star topology: the host is authoritative for the roster and fans out every
//! change as a versioned diff; members never relay membership to each other.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::identity::PeerId;
use crate::presence::PresenceEvent;
use crate::protocol::{ConnectionState, Message, PeerInfo, RosterChange, RosterDiff, RosterSnapshot};

/// This device's relation to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Solo,
    Joining { host: PeerId, started_at: Instant },
    Member { host: PeerId },
    Host,
}

/// Roster entry with local bookkeeping (instants are this device's clock).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: PeerId,
    pub display_name: String,
    pub is_host: bool,
    pub join_order: u64,
    pub joined_at: Instant,
    pub last_seen_at: Instant,
    pub connection: ConnectionState,
}

impl Peer {
    fn from_info(info: &PeerInfo, now: Instant) -> Self {
        Self {
            peer_id: info.peer_id,
            display_name: info.display_name.clone(),
            is_host: info.is_host,
            join_order: info.join_order,
            joined_at: now,
            last_seen_at: now,
            connection: info.connection,
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id,
            display_name: self.display_name.clone(),
            is_host: self.is_host,
            join_order: self.join_order,
            connection: self.connection,
        }
    }
}

/// Ordered-by-join roster. Exactly one entry has `is_host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    host: PeerId,
    version: u64,
    peers: Vec<Peer>,
}

impl Roster {
    pub fn host(&self) -> PeerId {
        self.host
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn get(&self, peer: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.peer_id == *peer)
    }

    fn get_mut(&mut self, peer: &PeerId) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.peer_id == *peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.get(peer).is_some()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.peer_id).collect()
    }

    fn upsert(&mut self, peer: Peer) -> bool {
        match self.get_mut(&peer.peer_id) {
            Some(existing) => {
                existing.display_name = peer.display_name;
                existing.is_host = peer.is_host;
                existing.join_order = peer.join_order;
                existing.connection = peer.connection;
                false
            }
            None => {
                let idx = self
                    .peers
                    .iter()
                    .position(|p| p.join_order > peer.join_order)
                    .unwrap_or(self.peers.len());
                self.peers.insert(idx, peer);
                true
            }
        }
    }

    fn remove(&mut self, peer: &PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.peer_id != *peer);
        self.peers.len() != before
    }

    fn from_snapshot(snapshot: &RosterSnapshot, now: Instant) -> Self {
        let mut peers: Vec<Peer> = snapshot
            .peers
            .iter()
            .map(|info| Peer::from_info(info, now))
            .collect();
        peers.sort_by_key(|p| p.join_order);
        Self {
            host: snapshot.host,
            version: snapshot.version,
            peers,
        }
    }

    pub fn snapshot(&self, command_seq: u64) -> RosterSnapshot {
        RosterSnapshot {
            host: self.host,
            version: self.version,
            command_seq,
            peers: self.peers.iter().map(Peer::info).collect(),
        }
    }
}

/// Membership change surfaced to the rest of the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    GroupCreated,
    JoinCompleted { host: PeerId, command_seq: u64 },
    JoinFailed(JoinError),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    ConnectionChanged(PeerId, ConnectionState),
    /// Host only: a present peer re-joined under a new name.
    ProfileChangeRequested { peer: PeerId, display_name: String },
    /// Snapshot replaced the roster; these peers are gone.
    RosterReplaced { removed: Vec<PeerId> },
    /// Member saw a diff gap; a resync should be requested from the host.
    RosterBehind,
    HostLost,
    HostRecovered,
    LeftGroup,
    RemovedByHost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEffect {
    Send(PeerId, Message),
    Event(MembershipEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("join request timed out")]
    Timeout,
    #[error("already in a group")]
    AlreadyInGroup,
    #[error("join rejected: {0}")]
    Rejected(String),
}

/// Single owner of the roster on this device.
pub struct MembershipCoordinator {
    self_id: PeerId,
    display_name: String,
    role: Role,
    roster: Option<Roster>,
    next_join_order: u64,
    join_timeout: Duration,
}

impl MembershipCoordinator {
    pub fn new(self_id: PeerId, display_name: &str, join_timeout: Duration) -> Self {
        Self {
            self_id,
            display_name: display_name.to_string(),
            role: Role::Solo,
            roster: None,
            next_join_order: 0,
            join_timeout,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn in_group(&self) -> bool {
        matches!(self.role, Role::Host | Role::Member { .. })
    }

    pub fn host(&self) -> Option<PeerId> {
        match self.role {
            Role::Host => Some(self.self_id),
            Role::Member { host } => Some(host),
            _ => None,
        }
    }

    pub fn roster(&self) -> Option<&Roster> {
        self.roster.as_ref()
    }

    pub fn is_known(&self, peer: &PeerId) -> bool {
        self.roster.as_ref().is_some_and(|r| r.contains(peer))
    }

    /// Roster members other than this device.
    pub fn others(&self) -> Vec<PeerId> {
        self.roster
            .as_ref()
            .map(|r| {
                r.peers
                    .iter()
                    .map(|p| p.peer_id)
                    .filter(|p| *p != self.self_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Become host of a new group; roster = {self}.
    pub fn create_group(&mut self, now: Instant) -> Result<Vec<MembershipEffect>, JoinError> {
        if self.role != Role::Solo {
            return Err(JoinError::AlreadyInGroup);
        }
        let me = Peer {
            peer_id: self.self_id,
            display_name: self.display_name.clone(),
            is_host: true,
            join_order: 0,
            joined_at: now,
            last_seen_at: now,
            connection: ConnectionState::Connected,
        };
        self.next_join_order = 1;
        self.roster = Some(Roster {
            host: self.self_id,
            version: 1,
            peers: vec![me],
        });
        self.role = Role::Host;
        info!(peer = %self.self_id.short(), "group created");
        Ok(vec![MembershipEffect::Event(MembershipEvent::GroupCreated)])
    }

    /// Send a join request to `host`. Completes on `join_ack`, fails on rejection or `tick` timeout.
    pub fn join(&mut self, host: PeerId, now: Instant) -> Result<Vec<MembershipEffect>, JoinError> {
        if self.role != Role::Solo {
            return Err(JoinError::AlreadyInGroup);
        }
        self.role = Role::Joining {
            host,
            started_at: now,
        };
        debug!(host = %host.short(), "join requested");
        Ok(vec![MembershipEffect::Send(
            host,
            Message::Join {
                display_name: self.display_name.clone(),
            },
        )])
    }

    /// Abandon a pending join. Returns false if no join was pending.
    pub fn cancel_join(&mut self) -> bool {
        if let Role::Joining { host, .. } = self.role {
            debug!(host = %host.short(), "join cancelled");
            self.role = Role::Solo;
            return true;
        }
        false
    }

    /// Leave the group gracefully. The host tells every member; a member tells the host.
    pub fn leave_group(&mut self) -> Vec<MembershipEffect> {
        let mut out = Vec::new();
        match self.role {
            Role::Host => {
                for peer in self.others() {
                    out.push(MembershipEffect::Send(peer, Message::Leave));
                }
            }
            Role::Member { host } => out.push(MembershipEffect::Send(host, Message::Leave)),
            Role::Joining { .. } => {
                self.role = Role::Solo;
                return out;
            }
            Role::Solo => return out,
        }
        info!("left group");
        self.role = Role::Solo;
        self.roster = None;
        out.push(MembershipEffect::Event(MembershipEvent::LeftGroup));
        out
    }

    /// Change this device's display name. A member re-sends its join under the new
    /// name; the host turns it into a profile update for the group.
    pub fn set_display_name(&mut self, display_name: &str) -> Vec<MembershipEffect> {
        if self.display_name == display_name {
            return vec![];
        }
        self.display_name = display_name.to_string();
        match self.role {
            Role::Member { host } => vec![MembershipEffect::Send(
                host,
                Message::Join {
                    display_name: self.display_name.clone(),
                },
            )],
            Role::Host => vec![MembershipEffect::Event(
                MembershipEvent::ProfileChangeRequested {
                    peer: self.self_id,
                    display_name: self.display_name.clone(),
                },
            )],
            Role::Solo | Role::Joining { .. } => vec![],
        }
    }

    /// Member: drop a group whose host stopped answering. Nothing is sent.
    pub fn abandon_group(&mut self) -> Vec<MembershipEffect> {
        let Role::Member { host } = self.role else {
            return vec![];
        };
        warn!(host = %host.short(), "host gone; leaving group locally");
        self.role = Role::Solo;
        self.roster = None;
        vec![MembershipEffect::Event(MembershipEvent::LeftGroup)]
    }

    /// Host: incoming join. Duplicate joins re-send the snapshot and never add twice.
    pub fn on_join(
        &mut self,
        from: PeerId,
        display_name: &str,
        command_seq: u64,
        now: Instant,
    ) -> Vec<MembershipEffect> {
        if self.role != Role::Host {
            return vec![MembershipEffect::Send(
                from,
                Message::JoinRejected {
                    reason: "not hosting a group".into(),
                },
            )];
        }
        let Some(roster) = self.roster.as_mut() else {
            return vec![];
        };
        let mut out = Vec::new();
        if let Some(existing) = roster.get_mut(&from) {
            existing.last_seen_at = now;
            let renamed = existing.display_name != display_name;
            out.push(MembershipEffect::Send(
                from,
                Message::JoinAck(roster.snapshot(command_seq)),
            ));
            if renamed {
                out.push(MembershipEffect::Event(
                    MembershipEvent::ProfileChangeRequested {
                        peer: from,
                        display_name: display_name.to_string(),
                    },
                ));
            }
            return out;
        }
        let peer = Peer {
            peer_id: from,
            display_name: display_name.to_string(),
            is_host: false,
            join_order: self.next_join_order,
            joined_at: now,
            last_seen_at: now,
            connection: ConnectionState::Connected,
        };
        self.next_join_order += 1;
        let info = peer.info();
        roster.upsert(peer);
        roster.version += 1;
        info!(peer = %from.short(), name = display_name, version = roster.version, "peer joined");
        out.push(MembershipEffect::Send(
            from,
            Message::JoinAck(roster.snapshot(command_seq)),
        ));
        let diff = RosterDiff {
            version: roster.version,
            change: RosterChange::Upsert(info),
        };
        out.extend(self.fan_out(Message::RosterDiff(diff), Some(from)));
        out.push(MembershipEffect::Event(MembershipEvent::PeerJoined(from)));
        out
    }

    /// Joiner: host accepted. A late ack after cancel or timeout is answered with `leave`.
    pub fn on_join_ack(
        &mut self,
        from: PeerId,
        snapshot: &RosterSnapshot,
        now: Instant,
    ) -> Vec<MembershipEffect> {
        match self.role {
            Role::Joining { host, .. } if host == from && snapshot.host == from => {
                self.roster = Some(Roster::from_snapshot(snapshot, now));
                self.role = Role::Member { host };
                info!(host = %host.short(), members = snapshot.peers.len(), "joined group");
                vec![MembershipEffect::Event(MembershipEvent::JoinCompleted {
                    host,
                    command_seq: snapshot.command_seq,
                })]
            }
            Role::Member { host } if host == from => self.on_roster_snapshot(from, snapshot, now),
            Role::Solo => {
                debug!(from = %from.short(), "late join ack; leaving");
                vec![MembershipEffect::Send(from, Message::Leave)]
            }
            _ => vec![],
        }
    }

    pub fn on_join_rejected(&mut self, from: PeerId, reason: &str) -> Vec<MembershipEffect> {
        match self.role {
            Role::Joining { host, .. } if host == from => {
                self.role = Role::Solo;
                warn!(host = %from.short(), reason, "join rejected");
                vec![MembershipEffect::Event(MembershipEvent::JoinFailed(
                    JoinError::Rejected(reason.to_string()),
                ))]
            }
            _ => vec![],
        }
    }

    /// Member: apply a host diff. Duplicates are ignored; a version gap asks for a resync.
    pub fn on_roster_diff(
        &mut self,
        from: PeerId,
        diff: &RosterDiff,
        now: Instant,
    ) -> Vec<MembershipEffect> {
        let Role::Member { host } = self.role else {
            return vec![];
        };
        if from != host {
            warn!(from = %from.short(), "roster diff from non-host ignored");
            return vec![];
        }
        let Some(roster) = self.roster.as_mut() else {
            return vec![];
        };
        if diff.version <= roster.version {
            return vec![];
        }
        if diff.version > roster.version + 1 {
            debug!(local = roster.version, remote = diff.version, "roster diff gap");
            return vec![MembershipEffect::Event(MembershipEvent::RosterBehind)];
        }
        roster.version = diff.version;
        match &diff.change {
            RosterChange::Upsert(info) => {
                let connection = info.connection;
                let added = roster.upsert(Peer::from_info(info, now));
                if added {
                    vec![MembershipEffect::Event(MembershipEvent::PeerJoined(info.peer_id))]
                } else {
                    vec![MembershipEffect::Event(MembershipEvent::ConnectionChanged(
                        info.peer_id,
                        connection,
                    ))]
                }
            }
            RosterChange::Remove(peer) if *peer == self.self_id => {
                warn!("removed from group by host");
                self.role = Role::Solo;
                self.roster = None;
                vec![MembershipEffect::Event(MembershipEvent::RemovedByHost)]
            }
            RosterChange::Remove(peer) => {
                if roster.remove(peer) {
                    vec![MembershipEffect::Event(MembershipEvent::PeerLeft(*peer))]
                } else {
                    vec![]
                }
            }
        }
    }

    /// Member: adopt a newer full roster from the host.
    pub fn on_roster_snapshot(
        &mut self,
        from: PeerId,
        snapshot: &RosterSnapshot,
        now: Instant,
    ) -> Vec<MembershipEffect> {
        let Role::Member { host } = self.role else {
            return vec![];
        };
        if from != host || snapshot.host != host {
            return vec![];
        }
        match self.roster.as_ref() {
            Some(current) if snapshot.version > current.version => {}
            _ => return vec![],
        }
        if !snapshot.peers.iter().any(|p| p.peer_id == self.self_id) {
            warn!("snapshot no longer lists us; removed from group");
            self.role = Role::Solo;
            self.roster = None;
            return vec![MembershipEffect::Event(MembershipEvent::RemovedByHost)];
        }
        let Some(current) = self.roster.as_ref() else {
            return vec![];
        };
        let removed: Vec<PeerId> = current
            .peers
            .iter()
            .map(|p| p.peer_id)
            .filter(|id| !snapshot.peers.iter().any(|p| p.peer_id == *id))
            .collect();
        let mut replaced = Roster::from_snapshot(snapshot, now);
        for p in replaced.peers.iter_mut() {
            if let Some(old) = current.get(&p.peer_id) {
                p.joined_at = old.joined_at;
                p.last_seen_at = old.last_seen_at;
            }
        }
        debug!(version = snapshot.version, removed = removed.len(), "roster resynced");
        self.roster = Some(replaced);
        vec![MembershipEffect::Event(MembershipEvent::RosterReplaced {
            removed,
        })]
    }

    /// Graceful leave from `from`.
    pub fn on_leave(&mut self, from: PeerId) -> Vec<MembershipEffect> {
        match self.role {
            Role::Host => self.host_remove(from),
            Role::Member { host } if host == from => {
                if let Some(p) = self.roster.as_mut().and_then(|r| r.get_mut(&host)) {
                    p.connection = ConnectionState::Lost;
                }
                warn!(host = %host.short(), "host left the group");
                vec![MembershipEffect::Event(MembershipEvent::HostLost)]
            }
            _ => vec![],
        }
    }

    /// Host: is `from` asking for a snapshot it does not have yet?
    pub fn on_resync(&self, from: PeerId, roster_version: u64, command_seq: u64) -> Vec<MembershipEffect> {
        let Some(roster) = self.roster.as_ref().filter(|_| self.is_host()) else {
            return vec![];
        };
        if !roster.contains(&from) || roster_version >= roster.version {
            return vec![];
        }
        vec![MembershipEffect::Send(
            from,
            Message::RosterSnapshot(roster.snapshot(command_seq)),
        )]
    }

    /// Feed a presence change. The host fans out connection changes and removals;
    /// a member only watches its host.
    pub fn on_presence_event(&mut self, event: PresenceEvent) -> Vec<MembershipEffect> {
        match (self.role, event) {
            (Role::Host, PresenceEvent::Lost(peer)) => {
                self.host_set_connection(peer, ConnectionState::Lost)
            }
            (Role::Host, PresenceEvent::Connected(peer)) => {
                self.host_set_connection(peer, ConnectionState::Connected)
            }
            (Role::Host, PresenceEvent::Removed(peer)) => self.host_remove(peer),
            (Role::Member { host }, PresenceEvent::Lost(peer)) if peer == host => {
                if let Some(p) = self.roster.as_mut().and_then(|r| r.get_mut(&host)) {
                    p.connection = ConnectionState::Lost;
                }
                warn!(host = %host.short(), "host lost");
                vec![MembershipEffect::Event(MembershipEvent::HostLost)]
            }
            (Role::Member { host }, PresenceEvent::Connected(peer)) if peer == host => {
                let Some(p) = self.roster.as_mut().and_then(|r| r.get_mut(&host)) else {
                    return vec![];
                };
                if p.connection == ConnectionState::Lost {
                    p.connection = ConnectionState::Connected;
                    info!(host = %host.short(), "host recovered");
                    return vec![MembershipEffect::Event(MembershipEvent::HostRecovered)];
                }
                p.connection = ConnectionState::Connected;
                vec![]
            }
            _ => vec![],
        }
    }

    /// Record traffic from a roster member.
    pub fn touch(&mut self, peer: PeerId, now: Instant) {
        if let Some(p) = self.roster.as_mut().and_then(|r| r.get_mut(&peer)) {
            p.last_seen_at = now;
        }
    }

    /// Apply a profile update; returns false for unknown peers.
    pub fn rename(&mut self, peer: PeerId, display_name: &str) -> bool {
        if peer == self.self_id {
            self.display_name = display_name.to_string();
        }
        match self.roster.as_mut().and_then(|r| r.get_mut(&peer)) {
            Some(p) => {
                p.display_name = display_name.to_string();
                true
            }
            None => false,
        }
    }

    /// Join timeout check.
    pub fn tick(&mut self, now: Instant) -> Vec<MembershipEffect> {
        if let Role::Joining { host, started_at } = self.role {
            if now.saturating_duration_since(started_at) >= self.join_timeout {
                self.role = Role::Solo;
                warn!(host = %host.short(), "join timed out");
                return vec![MembershipEffect::Event(MembershipEvent::JoinFailed(
                    JoinError::Timeout,
                ))];
            }
        }
        vec![]
    }

    fn host_set_connection(&mut self, peer: PeerId, state: ConnectionState) -> Vec<MembershipEffect> {
        if peer == self.self_id {
            return vec![];
        }
        let Some(roster) = self.roster.as_mut() else {
            return vec![];
        };
        let Some(p) = roster.get_mut(&peer) else {
            return vec![];
        };
        if p.connection == state {
            return vec![];
        }
        p.connection = state;
        let info = p.info();
        roster.version += 1;
        debug!(peer = %peer.short(), ?state, version = roster.version, "connection changed");
        let diff = RosterDiff {
            version: roster.version,
            change: RosterChange::Upsert(info),
        };
        let mut out = self.fan_out(Message::RosterDiff(diff), None);
        out.push(MembershipEffect::Event(MembershipEvent::ConnectionChanged(
            peer, state,
        )));
        out
    }

    fn host_remove(&mut self, peer: PeerId) -> Vec<MembershipEffect> {
        if peer == self.self_id {
            return vec![];
        }
        let Some(roster) = self.roster.as_mut() else {
            return vec![];
        };
        if !roster.remove(&peer) {
            return vec![];
        }
        roster.version += 1;
        info!(peer = %peer.short(), version = roster.version, "peer left");
        let diff = RosterDiff {
            version: roster.version,
            change: RosterChange::Remove(peer),
        };
        let mut out = self.fan_out(Message::RosterDiff(diff), None);
        out.push(MembershipEffect::Event(MembershipEvent::PeerLeft(peer)));
        out
    }

    fn fan_out(&self, message: Message, skip: Option<PeerId>) -> Vec<MembershipEffect> {
        self.others()
            .into_iter()
            .filter(|p| Some(*p) != skip)
            .map(|p| MembershipEffect::Send(p, message.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(name: &str) -> MembershipCoordinator {
        MembershipCoordinator::new(PeerId::generate(), name, Duration::from_secs(5))
    }

    fn sends(effects: &[MembershipEffect]) -> Vec<(PeerId, &Message)> {
        effects
            .iter()
            .filter_map(|e| match e {
                MembershipEffect::Send(p, m) => Some((*p, m)),
                _ => None,
            })
            .collect()
    }

    fn events(effects: &[MembershipEffect]) -> Vec<&MembershipEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                MembershipEffect::Event(ev) => Some(ev),
                _ => None,
            })
            .collect()
    }

    fn ack_for(effects: &[MembershipEffect], peer: PeerId) -> RosterSnapshot {
        sends(effects)
            .into_iter()
            .find_map(|(to, m)| match m {
                Message::JoinAck(s) if to == peer => Some(s.clone()),
                _ => None,
            })
            .expect("join ack")
    }

    #[test]
    fn create_group_makes_self_host() {
        let mut host = coordinator("host");
        host.create_group(Instant::now()).unwrap();
        assert!(host.is_host());
        let roster = host.roster().unwrap();
        assert_eq!(roster.peer_ids(), vec![host.self_id()]);
        assert_eq!(roster.peers().iter().filter(|p| p.is_host).count(), 1);
        assert_eq!(
            host.create_group(Instant::now()),
            Err(JoinError::AlreadyInGroup)
        );
    }

    #[test]
    fn join_round_trip_installs_snapshot() {
        let now = Instant::now();
        let mut host = coordinator("host");
        let mut member = coordinator("ana");
        host.create_group(now).unwrap();

        let req = member.join(host.self_id(), now).unwrap();
        assert_eq!(sends(&req).len(), 1);
        assert!(matches!(member.role(), Role::Joining { .. }));

        let reply = host.on_join(member.self_id(), "ana", 4, now);
        let snapshot = ack_for(&reply, member.self_id());
        assert_eq!(snapshot.command_seq, 4);

        let done = member.on_join_ack(host.self_id(), &snapshot, now);
        assert_eq!(
            events(&done),
            vec![&MembershipEvent::JoinCompleted {
                host: host.self_id(),
                command_seq: 4
            }]
        );
        assert_eq!(member.role(), Role::Member { host: host.self_id() });
        assert_eq!(
            member.roster().unwrap().peer_ids(),
            host.roster().unwrap().peer_ids()
        );
    }

    #[test]
    fn duplicate_join_is_idempotent() {
        let now = Instant::now();
        let mut host = coordinator("host");
        host.create_group(now).unwrap();
        let peer = PeerId::generate();
        host.on_join(peer, "ana", 0, now);
        let version = host.roster().unwrap().version();
        let again = host.on_join(peer, "ana", 0, now);
        assert_eq!(host.roster().unwrap().peers().len(), 2);
        assert_eq!(host.roster().unwrap().version(), version);
        // The duplicate still gets an ack (the first may have been lost).
        assert_eq!(sends(&again).len(), 1);
        assert!(events(&again).is_empty());
    }

    #[test]
    fn rejoin_with_new_name_requests_profile_change() {
        let now = Instant::now();
        let mut host = coordinator("host");
        host.create_group(now).unwrap();
        let peer = PeerId::generate();
        host.on_join(peer, "ana", 0, now);
        let again = host.on_join(peer, "ana b", 0, now);
        assert_eq!(
            events(&again),
            vec![&MembershipEvent::ProfileChangeRequested {
                peer,
                display_name: "ana b".into()
            }]
        );
    }

    #[test]
    fn rename_resends_join_or_requests_profile_update() {
        let now = Instant::now();
        let mut host = coordinator("host");
        let mut member = coordinator("ana");
        host.create_group(now).unwrap();
        member.join(host.self_id(), now).unwrap();
        let reply = host.on_join(member.self_id(), "ana", 0, now);
        member.on_join_ack(host.self_id(), &ack_for(&reply, member.self_id()), now);

        let effects = member.set_display_name("ana r");
        assert_eq!(
            sends(&effects),
            vec![(
                host.self_id(),
                &Message::Join {
                    display_name: "ana r".into()
                }
            )]
        );
        assert_eq!(member.display_name(), "ana r");
        assert!(member.set_display_name("ana r").is_empty());

        let effects = host.set_display_name("lead");
        assert_eq!(
            events(&effects),
            vec![&MembershipEvent::ProfileChangeRequested {
                peer: host.self_id(),
                display_name: "lead".into()
            }]
        );

        let mut solo = coordinator("solo");
        assert!(solo.set_display_name("solo 2").is_empty());
        assert_eq!(solo.display_name(), "solo 2");
    }

    #[test]
    fn abandoning_a_silent_host_leaves_locally() {
        let now = Instant::now();
        let mut host = coordinator("host");
        let mut member = coordinator("ana");
        host.create_group(now).unwrap();
        member.join(host.self_id(), now).unwrap();
        let reply = host.on_join(member.self_id(), "ana", 0, now);
        member.on_join_ack(host.self_id(), &ack_for(&reply, member.self_id()), now);

        let effects = member.abandon_group();
        assert!(sends(&effects).is_empty());
        assert_eq!(events(&effects), vec![&MembershipEvent::LeftGroup]);
        assert_eq!(member.role(), Role::Solo);
        assert!(member.roster().is_none());
        assert!(host.abandon_group().is_empty());
        assert!(host.is_host());
    }

    #[test]
    fn host_fans_out_join_to_existing_members() {
        let now = Instant::now();
        let mut host = coordinator("host");
        host.create_group(now).unwrap();
        let a = PeerId::generate();
        let b = PeerId::generate();
        host.on_join(a, "a", 0, now);
        let effects = host.on_join(b, "b", 0, now);
        let out = sends(&effects);
        assert!(out
            .iter()
            .any(|(to, m)| *to == a && matches!(m, Message::RosterDiff(_))));
        assert!(!out
            .iter()
            .any(|(to, m)| *to == b && matches!(m, Message::RosterDiff(_))));
    }

    #[test]
    fn join_to_non_host_is_rejected() {
        let now = Instant::now();
        let mut not_host = coordinator("solo");
        let mut joiner = coordinator("ana");
        joiner.join(not_host.self_id(), now).unwrap();
        let reply = not_host.on_join(joiner.self_id(), "ana", 0, now);
        let (_, msg) = sends(&reply)[0];
        let Message::JoinRejected { reason } = msg else {
            panic!("expected rejection");
        };
        let effects = joiner.on_join_rejected(not_host.self_id(), reason);
        assert!(matches!(
            events(&effects)[0],
            MembershipEvent::JoinFailed(JoinError::Rejected(_))
        ));
        assert_eq!(joiner.role(), Role::Solo);
    }

    #[test]
    fn join_times_out() {
        let t0 = Instant::now();
        let mut joiner = coordinator("ana");
        joiner.join(PeerId::generate(), t0).unwrap();
        assert!(joiner.tick(t0 + Duration::from_secs(4)).is_empty());
        let effects = joiner.tick(t0 + Duration::from_secs(5));
        assert_eq!(
            events(&effects),
            vec![&MembershipEvent::JoinFailed(JoinError::Timeout)]
        );
        assert_eq!(joiner.role(), Role::Solo);
    }

    #[test]
    fn late_ack_after_cancel_answers_leave() {
        let now = Instant::now();
        let mut host = coordinator("host");
        let mut member = coordinator("ana");
        host.create_group(now).unwrap();
        member.join(host.self_id(), now).unwrap();
        assert!(member.cancel_join());
        assert!(!member.cancel_join());
        let snapshot = ack_for(&host.on_join(member.self_id(), "ana", 0, now), member.self_id());
        let effects = member.on_join_ack(host.self_id(), &snapshot, now);
        assert_eq!(sends(&effects), vec![(host.self_id(), &Message::Leave)]);
        assert_eq!(member.role(), Role::Solo);
    }

    #[test]
    fn diff_gap_requests_resync_and_duplicates_ignored() {
        let now = Instant::now();
        let mut host = coordinator("host");
        let mut member = coordinator("ana");
        host.create_group(now).unwrap();
        member.join(host.self_id(), now).unwrap();
        let snap = ack_for(&host.on_join(member.self_id(), "ana", 0, now), member.self_id());
        member.on_join_ack(host.self_id(), &snap, now);

        let mut diffs = Vec::new();
        for name in ["b", "c"] {
            let effects = host.on_join(PeerId::generate(), name, 0, now);
            for (to, m) in sends(&effects) {
                if let (true, Message::RosterDiff(d)) = (to == member.self_id(), m) {
                    diffs.push(d.clone());
                }
            }
        }
        assert_eq!(diffs.len(), 2);
        // Second diff first: gap.
        let gap = member.on_roster_diff(host.self_id(), &diffs[1], now);
        assert_eq!(events(&gap), vec![&MembershipEvent::RosterBehind]);
        member.on_roster_diff(host.self_id(), &diffs[0], now);
        member.on_roster_diff(host.self_id(), &diffs[1], now);
        assert!(member.on_roster_diff(host.self_id(), &diffs[1], now).is_empty());
        assert_eq!(
            member.roster().unwrap().peer_ids(),
            host.roster().unwrap().peer_ids()
        );
    }

    #[test]
    fn resync_snapshot_repairs_member_roster() {
        let now = Instant::now();
        let mut host = coordinator("host");
        let mut member = coordinator("ana");
        host.create_group(now).unwrap();
        member.join(host.self_id(), now).unwrap();
        let snap = ack_for(&host.on_join(member.self_id(), "ana", 0, now), member.self_id());
        member.on_join_ack(host.self_id(), &snap, now);
        let gone = PeerId::generate();
        host.on_join(gone, "gone", 0, now);
        host.on_leave(gone);
        host.on_join(PeerId::generate(), "c", 0, now);

        let local = member.roster().unwrap().version();
        let reply = host.on_resync(member.self_id(), local, 0);
        let Message::RosterSnapshot(s) = sends(&reply)[0].1.clone() else {
            panic!("expected snapshot");
        };
        member.on_roster_snapshot(host.self_id(), &s, now);
        assert_eq!(
            member.roster().unwrap().peer_ids(),
            host.roster().unwrap().peer_ids()
        );
        // Up-to-date members get nothing.
        assert!(host
            .on_resync(member.self_id(), host.roster().unwrap().version(), 0)
            .is_empty());
    }

    #[test]
    fn host_loss_and_recovery_surface_events() {
        let now = Instant::now();
        let mut host = coordinator("host");
        let mut member = coordinator("ana");
        host.create_group(now).unwrap();
        member.join(host.self_id(), now).unwrap();
        let snap = ack_for(&host.on_join(member.self_id(), "ana", 0, now), member.self_id());
        member.on_join_ack(host.self_id(), &snap, now);

        let lost = member.on_presence_event(PresenceEvent::Lost(host.self_id()));
        assert_eq!(events(&lost), vec![&MembershipEvent::HostLost]);
        // No re-election: host designation is unchanged.
        assert_eq!(member.host(), Some(host.self_id()));
        let back = member.on_presence_event(PresenceEvent::Connected(host.self_id()));
        assert_eq!(events(&back), vec![&MembershipEvent::HostRecovered]);
    }

    #[test]
    fn host_removes_peer_after_grace() {
        let now = Instant::now();
        let mut host = coordinator("host");
        host.create_group(now).unwrap();
        let a = PeerId::generate();
        let b = PeerId::generate();
        host.on_join(a, "a", 0, now);
        host.on_join(b, "b", 0, now);
        let lost = host.on_presence_event(PresenceEvent::Lost(a));
        assert!(sends(&lost).iter().any(|(to, _)| *to == b));
        let removed = host.on_presence_event(PresenceEvent::Removed(a));
        assert_eq!(events(&removed), vec![&MembershipEvent::PeerLeft(a)]);
        assert!(!host.is_known(&a));
        assert!(host.on_presence_event(PresenceEvent::Removed(a)).is_empty());
    }

    #[test]
    fn roster_stays_in_join_order() {
        let now = Instant::now();
        let mut host = coordinator("host");
        host.create_group(now).unwrap();
        let ids: Vec<PeerId> = (0..4).map(|_| PeerId::generate()).collect();
        for id in &ids {
            host.on_join(*id, "x", 0, now);
        }
        let orders: Vec<u64> = host.roster().unwrap().peers().iter().map(|p| p.join_order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
        assert_eq!(&host.roster().unwrap().peer_ids()[1..], ids.as_slice());
    }
}
