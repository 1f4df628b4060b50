//! Audio control state: own voice/music mute and mode, plus a display view of other peers.
//!
//! `music_muted` is local policy only: no remote peer ever sets another device's
//! music flag. The host can force voice mute through the command bus.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::PeerId;
use crate::protocol::{AudioMode, Presence};

/// Per-peer audio state as shown to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioState {
    pub voice_muted: bool,
    pub music_muted: bool,
    pub is_speaking: bool,
    pub audio_mode: AudioMode,
}

#[derive(Debug, Default)]
struct RemoteView {
    voice_muted: bool,
    music_muted: bool,
    audio_mode: AudioMode,
    presence_seq: Option<u64>,
    last_loud_at: Option<Instant>,
}

pub struct AudioControlState {
    self_id: PeerId,
    voice_muted: bool,
    music_muted: bool,
    audio_mode: AudioMode,
    self_last_loud_at: Option<Instant>,
    last_signal_at: Option<Instant>,
    presence_seq: u64,
    remote: HashMap<PeerId, RemoteView>,
    speaking_window: Duration,
    speaking_threshold: f32,
    signal_interval: Duration,
}

impl AudioControlState {
    pub fn new(
        self_id: PeerId,
        speaking_window: Duration,
        speaking_threshold: f32,
        signal_interval: Duration,
    ) -> Self {
        Self {
            self_id,
            voice_muted: false,
            music_muted: false,
            audio_mode: AudioMode::Both,
            self_last_loud_at: None,
            last_signal_at: None,
            presence_seq: 0,
            remote: HashMap::new(),
            speaking_window,
            speaking_threshold,
            signal_interval,
        }
    }

    /// Flip own voice mute. Local only; nothing is broadcast.
    pub fn toggle_self_voice_mute(&mut self) -> bool {
        self.voice_muted = !self.voice_muted;
        self.voice_muted
    }

    /// Flip own music mute. Local only; nothing is broadcast.
    pub fn toggle_self_music_mute(&mut self) -> bool {
        self.music_muted = !self.music_muted;
        self.music_muted
    }

    /// Mode composite: sets both flags.
    pub fn set_audio_mode(&mut self, mode: AudioMode) {
        self.audio_mode = mode;
        let (voice_muted, music_muted) = match mode {
            AudioMode::VoiceOnly => (false, true),
            AudioMode::MusicOnly => (true, false),
            AudioMode::Both => (false, false),
        };
        self.voice_muted = voice_muted;
        self.music_muted = music_muted;
    }

    pub fn self_voice_muted(&self) -> bool {
        self.voice_muted
    }

    pub fn self_music_muted(&self) -> bool {
        self.music_muted
    }

    pub fn audio_mode(&self) -> AudioMode {
        self.audio_mode
    }

    /// Host-forced voice mute (mute-all-voice effect). Own flag or display view.
    pub fn force_voice_mute(&mut self, peer: PeerId) {
        if peer == self.self_id {
            self.voice_muted = true;
        } else {
            self.remote.entry(peer).or_default().voice_muted = true;
        }
    }

    /// Mute-all-music effect: only ever touches this device's own flag.
    pub fn mute_own_music(&mut self) {
        self.music_muted = true;
    }

    /// Next heartbeat payload for this device.
    pub fn next_presence(&mut self) -> Presence {
        self.presence_seq += 1;
        Presence {
            seq: self.presence_seq,
            voice_muted: self.voice_muted,
            music_muted: self.music_muted,
            audio_mode: self.audio_mode,
            host_state: None,
        }
    }

    /// Replicated flags from a peer's heartbeat; older heartbeats are ignored.
    pub fn on_presence(&mut self, peer: PeerId, presence: &Presence) -> bool {
        if peer == self.self_id {
            return false;
        }
        let view = self.remote.entry(peer).or_default();
        if view.presence_seq.is_some_and(|s| presence.seq <= s) {
            return false;
        }
        view.presence_seq = Some(presence.seq);
        view.voice_muted = presence.voice_muted;
        view.music_muted = presence.music_muted;
        view.audio_mode = presence.audio_mode;
        true
    }

    /// Local audio-level sample. Returns true when a level signal should go out now.
    pub fn record_local_level(&mut self, level: f32, now: Instant) -> bool {
        if level < self.speaking_threshold || self.voice_muted {
            return false;
        }
        self.self_last_loud_at = Some(now);
        let due = self
            .last_signal_at
            .map_or(true, |t| now.saturating_duration_since(t) >= self.signal_interval);
        if due {
            self.last_signal_at = Some(now);
        }
        due
    }

    pub fn on_remote_level(&mut self, peer: PeerId, level: f32, now: Instant) {
        if peer == self.self_id || level < self.speaking_threshold {
            return;
        }
        let view = self.remote.entry(peer).or_default();
        if view.last_loud_at.map_or(true, |t| now >= t) {
            view.last_loud_at = Some(now);
        }
    }

    /// True while the peer's level exceeded the threshold within the speaking window.
    pub fn is_speaking(&self, peer: &PeerId, now: Instant) -> bool {
        let last = if *peer == self.self_id {
            self.self_last_loud_at
        } else {
            self.remote.get(peer).and_then(|v| v.last_loud_at)
        };
        last.is_some_and(|t| now.saturating_duration_since(t) <= self.speaking_window)
    }

    pub fn state(&self, peer: &PeerId, now: Instant) -> AudioState {
        if *peer == self.self_id {
            return AudioState {
                voice_muted: self.voice_muted,
                music_muted: self.music_muted,
                is_speaking: self.is_speaking(peer, now),
                audio_mode: self.audio_mode,
            };
        }
        let (voice_muted, music_muted, audio_mode) = self
            .remote
            .get(peer)
            .map(|v| (v.voice_muted, v.music_muted, v.audio_mode))
            .unwrap_or((false, false, AudioMode::Both));
        AudioState {
            voice_muted,
            music_muted,
            is_speaking: self.is_speaking(peer, now),
            audio_mode,
        }
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.remote.remove(peer);
    }

    pub fn forget_all(&mut self) {
        self.remote.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(id: PeerId) -> AudioControlState {
        AudioControlState::new(id, Duration::from_millis(300), 0.1, Duration::from_millis(100))
    }

    fn presence(seq: u64, voice_muted: bool) -> Presence {
        Presence {
            seq,
            voice_muted,
            music_muted: false,
            audio_mode: AudioMode::Both,
            host_state: None,
        }
    }

    #[test]
    fn toggles_flip_local_flags() {
        let me = PeerId::generate();
        let mut a = audio(me);
        assert!(a.toggle_self_voice_mute());
        assert!(!a.toggle_self_voice_mute());
        assert!(a.toggle_self_music_mute());
        let s = a.state(&me, Instant::now());
        assert!(!s.voice_muted);
        assert!(s.music_muted);
    }

    #[test]
    fn audio_mode_sets_composite_flags() {
        let mut a = audio(PeerId::generate());
        a.set_audio_mode(AudioMode::VoiceOnly);
        assert!(!a.self_voice_muted() && a.self_music_muted());
        a.set_audio_mode(AudioMode::MusicOnly);
        assert!(a.self_voice_muted() && !a.self_music_muted());
        a.set_audio_mode(AudioMode::Both);
        assert!(!a.self_voice_muted() && !a.self_music_muted());
    }

    #[test]
    fn forced_voice_mute_never_touches_music() {
        let me = PeerId::generate();
        let other = PeerId::generate();
        let mut a = audio(me);
        a.toggle_self_music_mute();
        a.force_voice_mute(me);
        a.force_voice_mute(other);
        let now = Instant::now();
        assert!(a.state(&me, now).voice_muted);
        assert!(a.state(&me, now).music_muted);
        assert!(a.state(&other, now).voice_muted);
        assert!(!a.state(&other, now).music_muted);
    }

    #[test]
    fn presence_is_most_recent_wins() {
        let me = PeerId::generate();
        let peer = PeerId::generate();
        let mut a = audio(me);
        assert!(a.on_presence(peer, &presence(2, true)));
        assert!(!a.on_presence(peer, &presence(1, false)));
        assert!(a.state(&peer, Instant::now()).voice_muted);
        assert!(a.on_presence(peer, &presence(3, false)));
        assert!(!a.state(&peer, Instant::now()).voice_muted);
    }

    #[test]
    fn speaking_window_expires() {
        let me = PeerId::generate();
        let peer = PeerId::generate();
        let mut a = audio(me);
        let t0 = Instant::now();
        a.on_remote_level(peer, 0.05, t0);
        assert!(!a.is_speaking(&peer, t0));
        a.on_remote_level(peer, 0.5, t0);
        assert!(a.is_speaking(&peer, t0 + Duration::from_millis(250)));
        assert!(!a.is_speaking(&peer, t0 + Duration::from_millis(400)));
    }

    #[test]
    fn local_level_signals_are_rate_limited() {
        let me = PeerId::generate();
        let mut a = audio(me);
        let t0 = Instant::now();
        assert!(a.record_local_level(0.5, t0));
        assert!(!a.record_local_level(0.5, t0 + Duration::from_millis(50)));
        assert!(a.record_local_level(0.5, t0 + Duration::from_millis(100)));
        assert!(!a.record_local_level(0.01, t0 + Duration::from_millis(300)));
        assert!(a.is_speaking(&me, t0 + Duration::from_millis(150)));
    }

    #[test]
    fn muted_voice_is_not_signalled() {
        let me = PeerId::generate();
        let mut a = audio(me);
        a.toggle_self_voice_mute();
        assert!(!a.record_local_level(0.9, Instant::now()));
        assert!(!a.is_speaking(&me, Instant::now()));
    }
}
