//! GroupRide wire protocol: envelope, message types and version.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Current protocol version. Carried in every envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// Transport-agnostic envelope. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: u8,
    pub sender: PeerId,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender: PeerId, message: Message) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            sender,
            message,
        }
    }
}

/// All wire message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence and the datagram port to reach us on.
    Beacon { display_name: String, listen_port: u16 },
    /// Request to join the sender's target host. Re-sent joins are idempotent and refresh the name.
    Join { display_name: String },
    /// Host accepted the join: full roster snapshot.
    JoinAck(RosterSnapshot),
    /// Recipient is not hosting a group.
    JoinRejected { reason: String },
    /// Host-fanned membership change.
    RosterDiff(RosterDiff),
    /// Full roster, sent by the host in reply to a resync.
    RosterSnapshot(RosterSnapshot),
    /// Graceful leave.
    Leave,
    /// Host-issued control command.
    Command(Command),
    /// Liveness heartbeat carrying the sender's displayable audio flags.
    Presence(Presence),
    /// Lightweight speaking signal; loss-tolerant, most-recent-wins.
    AudioLevel { level: f32 },
    NowPlaying(NowPlayingUpdate),
    /// Member is behind the host's advertised roster version or command sequence.
    Resync { roster_version: u64, command_seq: u64 },
}

impl Message {
    /// Short type tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Beacon { .. } => "beacon",
            Message::Join { .. } => "join",
            Message::JoinAck(_) => "join_ack",
            Message::JoinRejected { .. } => "join_rejected",
            Message::RosterDiff(_) => "roster_diff",
            Message::RosterSnapshot(_) => "roster_snapshot",
            Message::Leave => "leave",
            Message::Command(_) => "command",
            Message::Presence(_) => "presence",
            Message::AudioLevel { .. } => "audio_level",
            Message::NowPlaying(_) => "now_playing",
            Message::Resync { .. } => "resync",
        }
    }
}

/// Connection state of a roster member as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Lost,
}

/// Replicated part of a roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub display_name: String,
    pub is_host: bool,
    /// Host-assigned join order; roster ordering key.
    pub join_order: u64,
    pub connection: ConnectionState,
}

/// Full roster as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    pub host: PeerId,
    pub version: u64,
    /// Host's last issued command sequence; the joiner's duplicate-suppression baseline.
    pub command_seq: u64,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterDiff {
    /// Roster version after this change.
    pub version: u64,
    pub change: RosterChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RosterChange {
    Upsert(PeerInfo),
    Remove(PeerId),
}

/// Sequence-numbered control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub issuer: PeerId,
    /// Strictly increasing per issuer.
    pub seq: u64,
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Force voice mute. `None` targets every peer except the issuer.
    MuteAllVoice { targets: Option<Vec<PeerId>> },
    /// Each receiver mutes its own music locally.
    MuteAllMusic,
    Sos { note: Option<String> },
    EndSession,
    ProfileUpdate { peer_id: PeerId, display_name: String },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::MuteAllVoice { .. } => "mute_all_voice",
            CommandKind::MuteAllMusic => "mute_all_music",
            CommandKind::Sos { .. } => "sos",
            CommandKind::EndSession => "end_session",
            CommandKind::ProfileUpdate { .. } => "profile_update",
        }
    }
}

/// Local audio mode composite. Not replicated as a command; only shown via presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioMode {
    VoiceOnly,
    MusicOnly,
    #[default]
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    /// Per-sender counter; older presence is ignored.
    pub seq: u64,
    pub voice_muted: bool,
    pub music_muted: bool,
    pub audio_mode: AudioMode,
    /// Only set by the host: lets members detect missed diffs and commands.
    pub host_state: Option<HostState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    pub roster_version: u64,
    pub command_seq: u64,
}

/// Published playback state. The receiver stamps its own receipt time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NowPlayingUpdate {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    /// Position at the moment the origin sampled it.
    pub position: Duration,
    pub is_playing: bool,
    pub epoch_seq: u64,
}
