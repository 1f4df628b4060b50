//! Command bus: host-authoritative control commands with per-issuer sequence numbers.
//!
//! Effective application is at most once per (issuer, seq). Commands apply in
//! sequence order per issuer and only after the issuer is in the local roster.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::identity::PeerId;
use crate::protocol::{Command, CommandKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("only the host may broadcast commands")]
    NotAuthorized,
    #[error("command issuer {0:?} is not the current host")]
    UnauthorizedIssuer(PeerId),
    #[error("stale command {seq} from {issuer:?}")]
    StaleCommand { issuer: PeerId, seq: u64 },
}

struct Pending {
    command: Command,
    received_at: Instant,
}

/// Per-device command bus. Holds a read-only view of the roster (host + members),
/// refreshed by the owner on every membership change.
pub struct CommandBus {
    self_id: PeerId,
    last_issued: u64,
    last_applied: HashMap<PeerId, u64>,
    pending: Vec<Pending>,
    log: VecDeque<Command>,
    host: Option<PeerId>,
    known: HashSet<PeerId>,
    buffer_capacity: usize,
    buffer_timeout: Duration,
    log_capacity: usize,
}

impl CommandBus {
    pub fn new(
        self_id: PeerId,
        buffer_capacity: usize,
        buffer_timeout: Duration,
        log_capacity: usize,
    ) -> Self {
        Self {
            self_id,
            last_issued: 0,
            last_applied: HashMap::new(),
            pending: Vec::new(),
            log: VecDeque::new(),
            host: None,
            known: HashSet::new(),
            buffer_capacity,
            buffer_timeout,
            log_capacity,
        }
    }

    /// Last sequence number this device issued (0 if none).
    pub fn last_issued(&self) -> u64 {
        self.last_issued
    }

    pub fn last_applied(&self, issuer: &PeerId) -> Option<u64> {
        self.last_applied.get(issuer).copied()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn is_host(&self) -> bool {
        self.host == Some(self.self_id)
    }

    /// Host only: assign the next sequence number. The caller applies the returned
    /// command locally before sending it; local application is never rolled back.
    pub fn broadcast(&mut self, kind: CommandKind) -> Result<Command, CommandError> {
        if !self.is_host() {
            return Err(CommandError::NotAuthorized);
        }
        self.last_issued += 1;
        let command = Command {
            issuer: self.self_id,
            seq: self.last_issued,
            kind,
        };
        self.last_applied.insert(self.self_id, command.seq);
        self.log.push_back(command.clone());
        while self.log.len() > self.log_capacity {
            self.log.pop_front();
        }
        debug!(seq = command.seq, kind = command.kind.name(), "command issued");
        Ok(command)
    }

    /// Host only: logged commands after `seq`, for a member's resync.
    pub fn commands_after(&self, seq: u64) -> Vec<Command> {
        if !self.is_host() {
            return vec![];
        }
        self.log.iter().filter(|c| c.seq > seq).cloned().collect()
    }

    /// Duplicate-suppression baseline for `issuer` (from a join snapshot).
    pub fn set_baseline(&mut self, issuer: PeerId, seq: u64) {
        let entry = self.last_applied.entry(issuer).or_insert(seq);
        *entry = (*entry).max(seq);
        self.pending
            .retain(|p| p.command.issuer != issuer || p.command.seq > seq);
    }

    /// True if some sequence up to the host's advertised one is neither applied nor buffered.
    pub fn is_behind(&self, issuer: &PeerId, advertised: u64) -> bool {
        let applied = self.last_applied(issuer).unwrap_or(0);
        if advertised <= applied {
            return false;
        }
        let buffered: HashSet<u64> = self
            .pending
            .iter()
            .filter(|p| p.command.issuer == *issuer)
            .map(|p| p.command.seq)
            .filter(|seq| (applied + 1..=advertised).contains(seq))
            .collect();
        (buffered.len() as u64) < advertised - applied
    }

    /// Incoming command. Returns the commands now ready to apply, in order
    /// (empty if buffered).
    pub fn on_command_received(
        &mut self,
        command: Command,
        now: Instant,
    ) -> Result<Vec<Command>, CommandError> {
        let issuer = command.issuer;
        let seq = command.seq;
        if issuer == self.self_id || self.last_applied(&issuer).is_some_and(|last| seq <= last) {
            return Err(CommandError::StaleCommand { issuer, seq });
        }
        if self
            .pending
            .iter()
            .any(|p| p.command.issuer == issuer && p.command.seq == seq)
        {
            return Err(CommandError::StaleCommand { issuer, seq });
        }
        if !self.known.contains(&issuer) {
            debug!(issuer = %issuer.short(), seq, "issuer not in roster yet; buffering");
            self.buffer(command, now);
            return Ok(vec![]);
        }
        if self.host != Some(issuer) {
            warn!(issuer = %issuer.short(), seq, "command from non-host dropped");
            return Err(CommandError::UnauthorizedIssuer(issuer));
        }
        match self.last_applied(&issuer) {
            Some(last) if seq != last + 1 => {
                debug!(issuer = %issuer.short(), seq, last, "sequence gap; buffering");
                self.buffer(command, now);
                Ok(vec![])
            }
            _ => {
                self.last_applied.insert(issuer, seq);
                let mut ready = vec![command];
                ready.extend(self.drain_contiguous(issuer));
                Ok(ready)
            }
        }
    }

    /// Refresh the roster view. Returns buffered commands that became ready.
    pub fn on_roster_changed(&mut self, host: Option<PeerId>, members: &[PeerId]) -> Vec<Command> {
        self.host = host;
        self.known = members.iter().copied().collect();
        let mut ready = Vec::new();
        let issuers: Vec<PeerId> = self.buffered_issuers();
        for issuer in issuers {
            if !self.known.contains(&issuer) {
                continue;
            }
            if self.host != Some(issuer) {
                warn!(issuer = %issuer.short(), "buffered commands from non-host dropped");
                self.pending.retain(|p| p.command.issuer != issuer);
                continue;
            }
            ready.extend(self.drain_contiguous(issuer));
        }
        ready
    }

    /// Left the group: forget roster view and everything buffered.
    pub fn clear_group(&mut self) {
        self.host = None;
        self.known.clear();
        self.pending.clear();
        self.last_applied.retain(|p, _| *p == self.self_id);
    }

    /// Expire buffered commands. Unknown-issuer commands are dropped; commands
    /// waiting on a sequence gap are applied past the gap.
    pub fn tick(&mut self, now: Instant) -> Vec<Command> {
        let timeout = self.buffer_timeout;
        let expired: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|p| now.saturating_duration_since(p.received_at) >= timeout)
            .map(|p| p.command.issuer)
            .collect();
        if expired.is_empty() {
            return vec![];
        }
        let mut ready = Vec::new();
        let mut issuers = expired;
        issuers.sort();
        issuers.dedup();
        for issuer in issuers {
            if !self.known.contains(&issuer) || self.host != Some(issuer) {
                let before = self.pending.len();
                self.pending.retain(|p| {
                    p.command.issuer != issuer
                        || now.saturating_duration_since(p.received_at) < timeout
                });
                warn!(
                    issuer = %issuer.short(),
                    dropped = before - self.pending.len(),
                    "buffered commands expired; issuer never became host"
                );
                continue;
            }
            let mut mine: Vec<Command> = Vec::new();
            self.pending.retain(|p| {
                if p.command.issuer == issuer {
                    mine.push(p.command.clone());
                    false
                } else {
                    true
                }
            });
            mine.sort_by_key(|c| c.seq);
            let last = self.last_applied(&issuer).unwrap_or(0);
            warn!(issuer = %issuer.short(), last, next = mine.first().map(|c| c.seq), "sequence gap expired; skipping");
            for c in mine {
                if c.seq > self.last_applied(&issuer).unwrap_or(0) {
                    self.last_applied.insert(issuer, c.seq);
                    ready.push(c);
                }
            }
        }
        ready
    }

    fn buffer(&mut self, command: Command, now: Instant) {
        if self.pending.len() >= self.buffer_capacity {
            let oldest = self
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.received_at)
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                let dropped = self.pending.remove(i);
                warn!(
                    issuer = %dropped.command.issuer.short(),
                    seq = dropped.command.seq,
                    "command buffer full; dropped oldest"
                );
            }
        }
        self.pending.push(Pending {
            command,
            received_at: now,
        });
    }

    fn buffered_issuers(&self) -> Vec<PeerId> {
        let mut issuers: Vec<PeerId> = self.pending.iter().map(|p| p.command.issuer).collect();
        issuers.sort();
        issuers.dedup();
        issuers
    }

    /// Pop buffered commands for `issuer` that follow last-applied without a gap.
    fn drain_contiguous(&mut self, issuer: PeerId) -> Vec<Command> {
        let mut ready = Vec::new();
        loop {
            let last = self.last_applied(&issuer);
            self.pending
                .retain(|p| p.command.issuer != issuer || last.map_or(true, |l| p.command.seq > l));
            let next = self.pending.iter().position(|p| {
                p.command.issuer == issuer && last.map_or(true, |l| p.command.seq == l + 1)
            });
            let Some(i) = next else { break };
            if last.is_none() {
                // No baseline: start from the lowest buffered sequence.
                let lowest = self
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.command.issuer == issuer)
                    .min_by_key(|(_, p)| p.command.seq)
                    .map(|(i, _)| i)
                    .unwrap_or(i);
                let p = self.pending.remove(lowest);
                self.last_applied.insert(issuer, p.command.seq);
                ready.push(p.command);
                continue;
            }
            let p = self.pending.remove(i);
            self.last_applied.insert(issuer, p.command.seq);
            ready.push(p.command);
        }
        ready
    }
}
