//! GroupRide coordination core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod audio;
pub mod command;
pub mod config;
pub mod core;
pub mod identity;
pub mod membership;
pub mod playback;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod wire;

#[cfg(test)]
mod sim;

pub use audio::AudioState;
pub use command::CommandError;
pub use config::Config;
pub use core::{CoreError, CoreEvent, MessageError, OutboundAction, RideCore};
pub use identity::PeerId;
pub use membership::{JoinError, Role, Roster};
pub use playback::{NowPlayingView, PlaybackError};
pub use protocol::{AudioMode, CommandKind, ConnectionState, Message, PROTOCOL_VERSION};
pub use session::{RideState, TransitionError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
