//! Line-oriented intent console on stdin. Stands in for a UI.

use std::time::Duration;

use ride_core::session::RideAction;
use ride_core::{AudioMode, CommandKind, PeerId};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::node::{NodeError, NodeHandle, NodeStatus, Track};

pub const HELP: &str = "\
commands:
  create | join <peer-id> | cancel | leave | name <new-name>
  start | pause | resume | end | reset
  voice | music | mode voice|music|both
  mute-all-voice | mute-all-music | sos [note] | end-session | mute <peer-id>
  play <track-id> <secs> <title> / <artist> | stop <track-id> <secs> <title> / <artist>
  level <0..1> | status | help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Create,
    Join(PeerId),
    Cancel,
    Leave,
    Rename(String),
    Ride(RideAction),
    ToggleVoice,
    ToggleMusic,
    Mode(AudioMode),
    Broadcast(CommandKind),
    Mute(PeerId),
    NowPlaying(Track),
    Level(f32),
    Status,
    Help,
    Quit,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command {0:?} (try `help`)")]
    Unknown(String),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid {0}")]
    Invalid(&'static str),
}

pub fn parse(line: &str) -> Result<ConsoleCommand, ParseError> {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let peer = |s: &str| -> Result<PeerId, ParseError> {
        if s.is_empty() {
            return Err(ParseError::Missing("peer id"));
        }
        PeerId::parse_hex(s).map_err(|_| ParseError::Invalid("peer id"))
    };
    Ok(match word {
        "create" => ConsoleCommand::Create,
        "join" => ConsoleCommand::Join(peer(rest)?),
        "cancel" => ConsoleCommand::Cancel,
        "leave" => ConsoleCommand::Leave,
        "name" if rest.is_empty() => return Err(ParseError::Missing("name")),
        "name" => ConsoleCommand::Rename(rest.to_string()),
        "start" => ConsoleCommand::Ride(RideAction::Start),
        "pause" => ConsoleCommand::Ride(RideAction::Pause),
        "resume" => ConsoleCommand::Ride(RideAction::Resume),
        "end" => ConsoleCommand::Ride(RideAction::End),
        "reset" => ConsoleCommand::Ride(RideAction::Reset),
        "voice" => ConsoleCommand::ToggleVoice,
        "music" => ConsoleCommand::ToggleMusic,
        "mode" => ConsoleCommand::Mode(match rest {
            "voice" => AudioMode::VoiceOnly,
            "music" => AudioMode::MusicOnly,
            "both" => AudioMode::Both,
            "" => return Err(ParseError::Missing("mode")),
            _ => return Err(ParseError::Invalid("mode")),
        }),
        "mute-all-voice" => ConsoleCommand::Broadcast(CommandKind::MuteAllVoice { targets: None }),
        "mute-all-music" => ConsoleCommand::Broadcast(CommandKind::MuteAllMusic),
        "sos" => ConsoleCommand::Broadcast(CommandKind::Sos {
            note: (!rest.is_empty()).then(|| rest.to_string()),
        }),
        "end-session" => ConsoleCommand::Broadcast(CommandKind::EndSession),
        "mute" => ConsoleCommand::Mute(peer(rest)?),
        "play" => ConsoleCommand::NowPlaying(parse_track(rest, true)?),
        "stop" => ConsoleCommand::NowPlaying(parse_track(rest, false)?),
        "level" => ConsoleCommand::Level(
            rest.parse::<f32>()
                .ok()
                .filter(|l| (0.0..=1.0).contains(l))
                .ok_or(ParseError::Invalid("level"))?,
        ),
        "status" | "" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    })
}

fn parse_track(rest: &str, is_playing: bool) -> Result<Track, ParseError> {
    let mut parts = rest.splitn(3, ' ');
    let track_id = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::Missing("track id"))?;
    let secs = parts
        .next()
        .ok_or(ParseError::Missing("position"))?
        .parse::<f64>()
        .ok()
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .ok_or(ParseError::Invalid("position"))?;
    let meta = parts.next().unwrap_or("");
    let (title, artist) = meta.split_once(" / ").unwrap_or((meta, ""));
    Ok(Track {
        track_id: track_id.to_string(),
        title: title.trim().to_string(),
        artist: artist.trim().to_string(),
        position: secs,
        is_playing,
    })
}

pub fn render_status(s: &NodeStatus) -> String {
    let mut out = format!(
        "{} ({}) role={:?} ride={:?} elapsed={}s",
        s.display_name,
        s.peer_id,
        s.role,
        s.ride,
        s.ride_elapsed.as_secs()
    );
    for m in &s.members {
        out.push_str(&format!(
            "\n  {}{} {} {:?} voice_muted={} music_muted={} speaking={} mode={:?}",
            if m.is_host { "*" } else { " " },
            m.display_name,
            m.peer_id.short(),
            m.connection,
            m.audio.voice_muted,
            m.audio.music_muted,
            m.audio.is_speaking,
            m.audio.audio_mode,
        ));
    }
    if let Some(np) = &s.now_playing {
        out.push_str(&format!(
            "\n  now playing: {} - {} [{}] {:.1}s{}",
            np.artist,
            np.title,
            np.track_id,
            np.position.as_secs_f64(),
            if np.is_playing { "" } else { " (paused)" }
        ));
    }
    out
}

/// Run one command against the node. Returns the text to show, or None to quit.
async fn execute(handle: &NodeHandle, cmd: ConsoleCommand) -> Result<Option<String>, NodeError> {
    let done = Some("ok".to_string());
    Ok(match cmd {
        ConsoleCommand::Create => {
            handle.create_group().await?;
            Some(format!("hosting; others join with `join {}`", handle.peer_id()))
        }
        ConsoleCommand::Join(host) => {
            handle.join(host).await?;
            Some("joined".to_string())
        }
        ConsoleCommand::Cancel => Some(format!("cancelled={}", handle.cancel_join().await?)),
        ConsoleCommand::Leave => {
            handle.leave_group().await?;
            done
        }
        ConsoleCommand::Rename(name) => {
            handle.rename(name.clone()).await?;
            Some(format!("now known as {name}"))
        }
        ConsoleCommand::Ride(action) => {
            handle.ride(action).await?;
            done
        }
        ConsoleCommand::ToggleVoice => Some(format!("voice_muted={}", handle.toggle_voice_mute().await?)),
        ConsoleCommand::ToggleMusic => Some(format!("music_muted={}", handle.toggle_music_mute().await?)),
        ConsoleCommand::Mode(mode) => {
            handle.set_audio_mode(mode).await?;
            done
        }
        ConsoleCommand::Broadcast(kind) => {
            handle.host_broadcast(kind).await?;
            done
        }
        ConsoleCommand::Mute(peer) => {
            handle.force_peer_voice_mute(peer).await?;
            done
        }
        ConsoleCommand::NowPlaying(track) => {
            handle.publish_now_playing(track).await?;
            done
        }
        ConsoleCommand::Level(level) => {
            handle.audio_level(level).await?;
            Some(String::new())
        }
        ConsoleCommand::Status => Some(render_status(&handle.status())),
        ConsoleCommand::Help => Some(HELP.to_string()),
        ConsoleCommand::Quit => None,
    })
}

/// Read intents from stdin until EOF or `quit`.
pub async fn run_console(handle: NodeHandle) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", render_status(&handle.status()));
    while let Some(line) = lines.next_line().await? {
        let cmd = match parse(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                println!("error: {e}");
                continue;
            }
        };
        match execute(&handle, cmd).await {
            Ok(Some(text)) if text.is_empty() => {}
            Ok(Some(text)) => println!("{text}"),
            Ok(None) => break,
            Err(e) => println!("error: {e}"),
        }
    }
    Ok(())
}
