//! Host-driven API: RideCore receives events from the host, returns actions.
//!
//! One instance per device. Components never reach into each other; every
//! cross-component effect is routed here.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::audio::{AudioControlState, AudioState};
use crate::command::{CommandBus, CommandError};
use crate::config::Config;
use crate::identity::PeerId;
use crate::membership::{
    JoinError, MembershipCoordinator, MembershipEffect, MembershipEvent, Role, Roster,
};
use crate::playback::{NowPlayingView, PlaybackError, PlaybackSyncEngine};
use crate::presence::{PresenceEvent, PresenceTracker};
use crate::protocol::{
    AudioMode, Command, CommandKind, ConnectionState, Envelope, HostState, Message,
    PROTOCOL_VERSION,
};
use crate::session::{HostSilence, RideSession, RideState, TransitionError};
use crate::wire;

/// Event for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    RideStateChanged(RideState),
    GroupCreated,
    JoinCompleted { host: PeerId },
    JoinFailed(JoinError),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    PeerConnection(PeerId, ConnectionState),
    RosterChanged,
    HostLost,
    HostRecovered,
    LeftGroup,
    RemovedFromGroup,
    CommandApplied { issuer: PeerId, seq: u64, kind: &'static str },
    AudioChanged(PeerId),
    Sos { from: PeerId, note: Option<String> },
    NowPlayingChanged { origin: PeerId },
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    SendMessage(PeerId, Vec<u8>),
    /// Loss-tolerant signal to every peer on the channel.
    Broadcast(Vec<u8>),
    Notify(CoreEvent),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode message")]
    DecodeFailed,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("envelope sender does not match transport peer")]
    SenderMismatch,
}

/// Errors surfaced by local intents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
}

/// Main coordinator. Host passes events; core returns actions.
pub struct RideCore {
    peer_id: PeerId,
    config: Config,
    presence: PresenceTracker,
    membership: MembershipCoordinator,
    commands: CommandBus,
    session: RideSession,
    audio: AudioControlState,
    playback: PlaybackSyncEngine,
    last_heartbeat: Option<Instant>,
}

impl RideCore {
    pub fn new(display_name: &str, config: Config) -> Self {
        Self::with_peer_id(PeerId::generate(), display_name, config)
    }

    pub fn with_peer_id(peer_id: PeerId, display_name: &str, config: Config) -> Self {
        Self {
            peer_id,
            presence: PresenceTracker::new(config.liveness_timeout, config.grace_period),
            membership: MembershipCoordinator::new(peer_id, display_name, config.join_timeout),
            commands: CommandBus::new(
                peer_id,
                config.command_buffer_capacity,
                config.command_buffer_timeout,
                config.command_log_capacity,
            ),
            session: RideSession::new(config.host_silence_timeout),
            audio: AudioControlState::new(
                peer_id,
                config.speaking_window,
                config.speaking_threshold,
                config.level_signal_interval,
            ),
            playback: PlaybackSyncEngine::new(peer_id, config.now_playing_refresh),
            last_heartbeat: None,
            config,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn display_name(&self) -> &str {
        self.membership.display_name()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ---- observers ----

    pub fn role(&self) -> Role {
        self.membership.role()
    }

    pub fn is_host(&self) -> bool {
        self.membership.is_host()
    }

    pub fn ride(&self) -> &RideSession {
        &self.session
    }

    pub fn ride_state(&self) -> RideState {
        self.session.state()
    }

    pub fn roster(&self) -> Option<&Roster> {
        self.membership.roster()
    }

    pub fn audio_state(&self, peer: &PeerId, now: Instant) -> AudioState {
        self.audio.state(peer, now)
    }

    pub fn now_playing(&self, now: Instant) -> Option<NowPlayingView> {
        self.playback.view(now)
    }

    pub fn now_playing_position(&self, now: Instant) -> Option<Duration> {
        self.playback.current_position(now)
    }

    pub fn presence_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.presence.state(peer)
    }

    // ---- group intents ----

    pub fn create_group(&mut self, now: Instant) -> Result<Vec<OutboundAction>, CoreError> {
        let effects = self.membership.create_group(now)?;
        let mut out = Vec::new();
        self.route_membership(effects, now, &mut out);
        Ok(out)
    }

    pub fn join_group(&mut self, host: PeerId, now: Instant) -> Result<Vec<OutboundAction>, CoreError> {
        let effects = self.membership.join(host, now)?;
        let mut out = Vec::new();
        self.route_membership(effects, now, &mut out);
        Ok(out)
    }

    /// Cancel a pending join. Returns false if none was pending.
    pub fn cancel_join(&mut self) -> bool {
        self.membership.cancel_join()
    }

    pub fn leave_group(&mut self, now: Instant) -> Vec<OutboundAction> {
        let effects = self.membership.leave_group();
        let mut out = Vec::new();
        self.route_membership(effects, now, &mut out);
        out
    }

    /// Rename this device. Group members learn the new name through a profile update.
    pub fn rename(&mut self, display_name: &str, now: Instant) -> Vec<OutboundAction> {
        let effects = self.membership.set_display_name(display_name);
        let mut out = Vec::new();
        self.route_membership(effects, now, &mut out);
        out
    }

    // ---- ride intents ----

    pub fn start_ride(&mut self, now: Instant) -> Result<Vec<OutboundAction>, CoreError> {
        self.session.start(now, self.membership.in_group())?;
        Ok(vec![OutboundAction::Notify(CoreEvent::RideStateChanged(
            RideState::Active,
        ))])
    }

    pub fn pause_ride(&mut self, now: Instant) -> Result<Vec<OutboundAction>, CoreError> {
        self.session.pause(now)?;
        Ok(vec![OutboundAction::Notify(CoreEvent::RideStateChanged(
            RideState::Paused,
        ))])
    }

    pub fn resume_ride(&mut self, now: Instant) -> Result<Vec<OutboundAction>, CoreError> {
        self.session.resume(now)?;
        Ok(vec![OutboundAction::Notify(CoreEvent::RideStateChanged(
            RideState::Active,
        ))])
    }

    /// End the local ride. The host also broadcasts end-session to the group.
    pub fn end_ride(&mut self, now: Instant) -> Result<Vec<OutboundAction>, CoreError> {
        self.session.end(now)?;
        let mut out = vec![OutboundAction::Notify(CoreEvent::RideStateChanged(
            RideState::Ended,
        ))];
        if self.membership.is_host() {
            out.extend(self.host_broadcast(CommandKind::EndSession, now)?);
        }
        Ok(out)
    }

    pub fn reset_ride(&mut self) -> Result<Vec<OutboundAction>, CoreError> {
        self.session.reset()?;
        Ok(vec![OutboundAction::Notify(CoreEvent::RideStateChanged(
            RideState::Idle,
        ))])
    }

    // ---- audio intents ----

    pub fn toggle_self_voice_mute(&mut self) -> bool {
        self.audio.toggle_self_voice_mute()
    }

    pub fn toggle_self_music_mute(&mut self) -> bool {
        self.audio.toggle_self_music_mute()
    }

    pub fn set_audio_mode(&mut self, mode: AudioMode) {
        self.audio.set_audio_mode(mode);
    }

    /// Host only: force one peer's voice mute (targeted mute-all-voice).
    pub fn force_peer_voice_mute(
        &mut self,
        peer: PeerId,
        now: Instant,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        self.host_broadcast(
            CommandKind::MuteAllVoice {
                targets: Some(vec![peer]),
            },
            now,
        )
    }

    /// Local audio-level sample (0.0..=1.0) from the capture pipeline.
    pub fn on_local_audio_level(&mut self, level: f32, now: Instant) -> Vec<OutboundAction> {
        if !self.audio.record_local_level(level, now) || !self.membership.in_group() {
            return vec![];
        }
        self.encode(Message::AudioLevel { level })
            .map(OutboundAction::Broadcast)
            .into_iter()
            .collect()
    }

    // ---- host commands ----

    /// Host only. Applies locally first, then sends to every roster member.
    /// Non-hosts get `NotAuthorized` and nothing is sent.
    pub fn host_broadcast(
        &mut self,
        kind: CommandKind,
        now: Instant,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        if !self.membership.is_host() {
            return Err(CommandError::NotAuthorized.into());
        }
        let command = self.commands.broadcast(kind)?;
        let mut out = Vec::new();
        self.apply_command(&command, now, &mut out);
        info!(seq = command.seq, kind = command.kind.name(), "command broadcast");
        if let Some(frame) = self.encode(Message::Command(command)) {
            for peer in self.membership.others() {
                out.push(OutboundAction::SendMessage(peer, frame.clone()));
            }
        }
        Ok(out)
    }

    // ---- playback ----

    pub fn publish_now_playing(
        &mut self,
        track_id: &str,
        title: &str,
        artist: &str,
        position: Duration,
        is_playing: bool,
        now: Instant,
    ) -> Vec<OutboundAction> {
        let update = self
            .playback
            .publish(track_id, title, artist, position, is_playing, now);
        let mut out = vec![OutboundAction::Notify(CoreEvent::NowPlayingChanged {
            origin: self.peer_id,
        })];
        out.extend(self.send_to_others(Message::NowPlaying(update)));
        out
    }

    // ---- channel events ----

    pub fn on_peer_discovered(&mut self, peer: PeerId, display_name: &str, now: Instant) -> Vec<OutboundAction> {
        if peer == self.peer_id {
            return vec![];
        }
        debug!(peer = %peer.short(), name = display_name, "peer discovered");
        let events = self.presence.on_peer_discovered(peer, now);
        let mut out = Vec::new();
        self.route_presence(events, now, &mut out);
        out
    }

    pub fn on_peer_disconnected(&mut self, peer: PeerId, now: Instant) -> Vec<OutboundAction> {
        let events = self.presence.on_peer_lost(peer, now);
        let mut out = Vec::new();
        self.route_presence(events, now, &mut out);
        out
    }

    /// Process a received frame: decode, validate sender, update state, return responses.
    pub fn on_message_received(
        &mut self,
        from: PeerId,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<OutboundAction>, MessageError> {
        let (envelope, _consumed) =
            wire::decode_frame(bytes).map_err(|_| MessageError::DecodeFailed)?;
        if envelope.protocol_version != PROTOCOL_VERSION {
            return Err(MessageError::Version(envelope.protocol_version));
        }
        if envelope.sender != from {
            return Err(MessageError::SenderMismatch);
        }
        if from == self.peer_id {
            return Ok(vec![]);
        }

        let mut out = Vec::new();
        let events = self.presence.heartbeat(from, now);
        self.route_presence(events, now, &mut out);
        self.membership.touch(from, now);

        debug!(from = %from.short(), kind = envelope.message.kind(), "message received");
        match envelope.message {
            Message::Beacon { .. } => {
                let events = self.presence.on_peer_discovered(from, now);
                self.route_presence(events, now, &mut out);
            }
            Message::Join { display_name } => {
                let effects =
                    self.membership
                        .on_join(from, &display_name, self.commands.last_issued(), now);
                self.route_membership(effects, now, &mut out);
            }
            Message::JoinAck(snapshot) => {
                let effects = self.membership.on_join_ack(from, &snapshot, now);
                self.route_membership(effects, now, &mut out);
            }
            Message::JoinRejected { reason } => {
                let effects = self.membership.on_join_rejected(from, &reason);
                self.route_membership(effects, now, &mut out);
            }
            Message::RosterDiff(diff) => {
                let effects = self.membership.on_roster_diff(from, &diff, now);
                self.route_membership(effects, now, &mut out);
            }
            Message::RosterSnapshot(snapshot) => {
                let effects = self.membership.on_roster_snapshot(from, &snapshot, now);
                self.route_membership(effects, now, &mut out);
            }
            Message::Leave => {
                self.presence.remove(&from);
                let effects = self.membership.on_leave(from);
                self.route_membership(effects, now, &mut out);
            }
            Message::Command(command) => self.on_command(from, command, now, &mut out),
            Message::Presence(presence) => {
                if self.membership.is_known(&from) && self.audio.on_presence(from, &presence) {
                    out.push(OutboundAction::Notify(CoreEvent::AudioChanged(from)));
                }
                if let (Role::Member { host }, Some(hs)) = (self.membership.role(), presence.host_state) {
                    if host == from {
                        self.check_behind(host, hs, &mut out);
                    }
                }
            }
            Message::AudioLevel { level } => {
                if self.membership.is_known(&from) {
                    self.audio.on_remote_level(from, level, now);
                }
            }
            Message::NowPlaying(update) => {
                if !self.membership.is_known(&from) {
                    debug!(from = %from.short(), "now playing from non-member ignored");
                } else {
                    match self.playback.on_now_playing_received(from, update, now) {
                        Ok(()) => out.push(OutboundAction::Notify(CoreEvent::NowPlayingChanged {
                            origin: from,
                        })),
                        Err(e) => debug!(error = %e, "now playing dropped"),
                    }
                }
            }
            Message::Resync {
                roster_version,
                command_seq,
            } => {
                let effects = self.membership.on_resync(from, roster_version, self.commands.last_issued());
                self.route_membership(effects, now, &mut out);
                if self.membership.is_known(&from) {
                    for command in self.commands.commands_after(command_seq) {
                        if let Some(frame) = self.encode(Message::Command(command)) {
                            out.push(OutboundAction::SendMessage(from, frame));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Periodic tick: liveness, join timeout, command buffer expiry, host silence,
    /// now-playing refresh and heartbeats.
    pub fn tick(&mut self, now: Instant) -> Vec<OutboundAction> {
        let mut out = Vec::new();

        let events = self.presence.tick(now);
        self.route_presence(events, now, &mut out);

        let effects = self.membership.tick(now);
        self.route_membership(effects, now, &mut out);

        for command in self.commands.tick(now) {
            self.apply_command(&command, now, &mut out);
        }

        if let HostSilence::Expired { ride_ended } = self.session.tick(now) {
            if ride_ended {
                out.push(OutboundAction::Notify(CoreEvent::RideStateChanged(
                    RideState::Ended,
                )));
            }
            // Later rides on this device are solo.
            let effects = self.membership.abandon_group();
            self.route_membership(effects, now, &mut out);
        }

        if let Some(update) = self.playback.refresh(now) {
            out.extend(self.send_to_others(Message::NowPlaying(update)));
        }

        let heartbeat_due = self
            .last_heartbeat
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.heartbeat_interval);
        if heartbeat_due && self.membership.in_group() {
            self.last_heartbeat = Some(now);
            let mut presence = self.audio.next_presence();
            if self.membership.is_host() {
                presence.host_state = self.membership.roster().map(|r| HostState {
                    roster_version: r.version(),
                    command_seq: self.commands.last_issued(),
                });
            }
            if let Some(frame) = self.encode(Message::Presence(presence)) {
                out.push(OutboundAction::Broadcast(frame));
            }
        }
        out
    }

    // ---- routing ----

    fn on_command(&mut self, from: PeerId, command: Command, now: Instant, out: &mut Vec<OutboundAction>) {
        if command.issuer != from {
            warn!(from = %from.short(), issuer = %command.issuer.short(), "relayed command dropped");
            return;
        }
        match self.commands.on_command_received(command, now) {
            Ok(ready) => {
                for c in ready {
                    self.apply_command(&c, now, out);
                }
            }
            Err(CommandError::StaleCommand { issuer, seq }) => {
                debug!(issuer = %issuer.short(), seq, "stale command ignored");
            }
            Err(e) => warn!(error = %e, "command rejected"),
        }
    }

    fn apply_command(&mut self, command: &Command, now: Instant, out: &mut Vec<OutboundAction>) {
        match &command.kind {
            CommandKind::MuteAllVoice { targets } => {
                let targets: Vec<PeerId> = match targets {
                    Some(list) => list.clone(),
                    None => self
                        .membership
                        .roster()
                        .map(|r| r.peer_ids())
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|p| *p != command.issuer)
                        .collect(),
                };
                for peer in targets {
                    self.audio.force_voice_mute(peer);
                    out.push(OutboundAction::Notify(CoreEvent::AudioChanged(peer)));
                }
            }
            CommandKind::MuteAllMusic => {
                if command.issuer != self.peer_id {
                    self.audio.mute_own_music();
                    out.push(OutboundAction::Notify(CoreEvent::AudioChanged(self.peer_id)));
                }
            }
            CommandKind::Sos { note } => {
                warn!(from = %command.issuer.short(), "SOS raised");
                out.push(OutboundAction::Notify(CoreEvent::Sos {
                    from: command.issuer,
                    note: note.clone(),
                }));
            }
            CommandKind::EndSession => {
                if self.session.force_end(now) {
                    out.push(OutboundAction::Notify(CoreEvent::RideStateChanged(
                        RideState::Ended,
                    )));
                }
            }
            CommandKind::ProfileUpdate {
                peer_id,
                display_name,
            } => {
                if self.membership.rename(*peer_id, display_name) {
                    out.push(OutboundAction::Notify(CoreEvent::RosterChanged));
                }
            }
        }
        out.push(OutboundAction::Notify(CoreEvent::CommandApplied {
            issuer: command.issuer,
            seq: command.seq,
            kind: command.kind.name(),
        }));
    }

    fn route_presence(&mut self, events: Vec<PresenceEvent>, now: Instant, out: &mut Vec<OutboundAction>) {
        for event in events {
            let effects = self.membership.on_presence_event(event);
            self.route_membership(effects, now, out);
        }
    }

    fn route_membership(
        &mut self,
        effects: Vec<MembershipEffect>,
        now: Instant,
        out: &mut Vec<OutboundAction>,
    ) {
        for effect in effects {
            match effect {
                MembershipEffect::Send(peer, message) => {
                    if let Some(frame) = self.encode(message) {
                        out.push(OutboundAction::SendMessage(peer, frame));
                    }
                }
                MembershipEffect::Event(event) => self.on_membership_event(event, now, out),
            }
        }
    }

    fn on_membership_event(&mut self, event: MembershipEvent, now: Instant, out: &mut Vec<OutboundAction>) {
        match event {
            MembershipEvent::GroupCreated => {
                self.sync_roster_view(now, out);
                out.push(OutboundAction::Notify(CoreEvent::GroupCreated));
            }
            MembershipEvent::JoinCompleted { host, command_seq } => {
                self.commands.set_baseline(host, command_seq);
                self.sync_roster_view(now, out);
                out.push(OutboundAction::Notify(CoreEvent::JoinCompleted { host }));
            }
            MembershipEvent::JoinFailed(e) => {
                out.push(OutboundAction::Notify(CoreEvent::JoinFailed(e)));
            }
            MembershipEvent::PeerJoined(peer) => {
                self.sync_roster_view(now, out);
                if self.membership.is_host() {
                    if let Some(update) = self.playback.local_update(now) {
                        if let Some(frame) = self.encode(Message::NowPlaying(update)) {
                            out.push(OutboundAction::SendMessage(peer, frame));
                        }
                    }
                }
                out.push(OutboundAction::Notify(CoreEvent::PeerJoined(peer)));
            }
            MembershipEvent::PeerLeft(peer) => {
                self.forget_peer(&peer);
                self.sync_roster_view(now, out);
                out.push(OutboundAction::Notify(CoreEvent::PeerLeft(peer)));
            }
            MembershipEvent::ConnectionChanged(peer, state) => {
                out.push(OutboundAction::Notify(CoreEvent::PeerConnection(peer, state)));
            }
            MembershipEvent::ProfileChangeRequested { peer, display_name } => {
                if let Err(e) = self
                    .host_broadcast(CommandKind::ProfileUpdate { peer_id: peer, display_name }, now)
                    .map(|actions| out.extend(actions))
                {
                    warn!(error = %e, "profile update not broadcast");
                }
            }
            MembershipEvent::RosterReplaced { removed } => {
                for peer in &removed {
                    self.forget_peer(peer);
                }
                self.sync_roster_view(now, out);
            }
            MembershipEvent::RosterBehind => {
                if let Some(host) = self.membership.host() {
                    let message = Message::Resync {
                        roster_version: self.membership.roster().map_or(0, |r| r.version()),
                        command_seq: self.commands.last_applied(&host).unwrap_or(0),
                    };
                    if let Some(frame) = self.encode(message) {
                        out.push(OutboundAction::SendMessage(host, frame));
                    }
                }
            }
            MembershipEvent::HostLost => {
                self.session.on_host_lost(now);
                out.push(OutboundAction::Notify(CoreEvent::HostLost));
            }
            MembershipEvent::HostRecovered => {
                self.session.on_host_recovered();
                out.push(OutboundAction::Notify(CoreEvent::HostRecovered));
            }
            MembershipEvent::LeftGroup => {
                self.clear_group_state();
                out.push(OutboundAction::Notify(CoreEvent::LeftGroup));
            }
            MembershipEvent::RemovedByHost => {
                self.clear_group_state();
                out.push(OutboundAction::Notify(CoreEvent::RemovedFromGroup));
            }
        }
    }

    /// Refresh the command bus's roster view and apply commands it was holding back.
    fn sync_roster_view(&mut self, now: Instant, out: &mut Vec<OutboundAction>) {
        let members = self
            .membership
            .roster()
            .map(|r| r.peer_ids())
            .unwrap_or_default();
        let ready = self
            .commands
            .on_roster_changed(self.membership.host(), &members);
        for command in ready {
            self.apply_command(&command, now, out);
        }
        out.push(OutboundAction::Notify(CoreEvent::RosterChanged));
    }

    fn check_behind(&mut self, host: PeerId, hs: HostState, out: &mut Vec<OutboundAction>) {
        let local_version = self.membership.roster().map_or(0, |r| r.version());
        let roster_behind = local_version < hs.roster_version;
        let commands_behind = self.commands.is_behind(&host, hs.command_seq);
        if !roster_behind && !commands_behind {
            return;
        }
        debug!(local_version, remote_version = hs.roster_version, commands_behind, "requesting resync");
        let message = Message::Resync {
            roster_version: local_version,
            command_seq: self.commands.last_applied(&host).unwrap_or(0),
        };
        if let Some(frame) = self.encode(message) {
            out.push(OutboundAction::SendMessage(host, frame));
        }
    }

    fn clear_group_state(&mut self) {
        self.presence.clear();
        self.commands.clear_group();
        self.session.on_host_recovered();
        self.audio.forget_all();
        self.playback.forget_remote();
        self.last_heartbeat = None;
    }

    fn forget_peer(&mut self, peer: &PeerId) {
        self.audio.forget(peer);
        self.playback.forget(peer);
    }

    fn send_to_others(&self, message: Message) -> Vec<OutboundAction> {
        let Some(frame) = self.encode(message) else {
            return vec![];
        };
        self.membership
            .others()
            .into_iter()
            .map(|p| OutboundAction::SendMessage(p, frame.clone()))
            .collect()
    }

    fn encode(&self, message: Message) -> Option<Vec<u8>> {
        let kind = message.kind();
        match wire::encode_frame(&Envelope::new(self.peer_id, message)) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(kind, error = %e, "failed to encode frame");
                None
            }
        }
    }
}
