//! Playback sync: replicate "now playing" without a shared clock.
//!
//! Every position is anchored to the local monotonic clock of the device that
//! holds it: the origin anchors at sample time, a receiver at receipt time.
//! Extrapolation is linear; each new publication re-anchors and removes drift.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::identity::PeerId;
use crate::protocol::NowPlayingUpdate;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("stale now-playing epoch {epoch_seq} from {origin:?}")]
    StaleNowPlaying { origin: PeerId, epoch_seq: u64 },
}

/// Stored publication with the local instant its position refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlaying {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub position: Duration,
    /// Local monotonic instant at which `position` was valid.
    pub anchored_at: Instant,
    pub is_playing: bool,
    pub origin: PeerId,
    pub epoch_seq: u64,
}

impl NowPlaying {
    /// Interpolated position at local `now`.
    pub fn position_at(&self, now: Instant) -> Duration {
        if self.is_playing {
            self.position + now.saturating_duration_since(self.anchored_at)
        } else {
            self.position
        }
    }

    fn to_update(&self, now: Instant) -> NowPlayingUpdate {
        NowPlayingUpdate {
            track_id: self.track_id.clone(),
            title: self.title.clone(),
            artist: self.artist.clone(),
            position: self.position_at(now),
            is_playing: self.is_playing,
            epoch_seq: self.epoch_seq,
        }
    }
}

/// Presentation view: metadata plus live-extrapolated position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlayingView {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub position: Duration,
    pub is_playing: bool,
    pub origin: PeerId,
}

pub struct PlaybackSyncEngine {
    self_id: PeerId,
    next_epoch: u64,
    last_published_at: Option<Instant>,
    entries: HashMap<PeerId, NowPlaying>,
    /// Origin of the most recently applied publication.
    current: Option<PeerId>,
    refresh: Duration,
}

impl PlaybackSyncEngine {
    pub fn new(self_id: PeerId, refresh: Duration) -> Self {
        Self {
            self_id,
            next_epoch: 0,
            last_published_at: None,
            entries: HashMap::new(),
            current: None,
            refresh,
        }
    }

    /// Local playback changed. Stamps the sample instant and next epoch; returns the update to send.
    pub fn publish(
        &mut self,
        track_id: &str,
        title: &str,
        artist: &str,
        position: Duration,
        is_playing: bool,
        now: Instant,
    ) -> NowPlayingUpdate {
        self.next_epoch += 1;
        let np = NowPlaying {
            track_id: track_id.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            position,
            anchored_at: now,
            is_playing,
            origin: self.self_id,
            epoch_seq: self.next_epoch,
        };
        let update = np.to_update(now);
        self.entries.insert(self.self_id, np);
        self.current = Some(self.self_id);
        self.last_published_at = Some(now);
        debug!(track = track_id, epoch = self.next_epoch, is_playing, "now playing published");
        update
    }

    /// Remote publication. Anything at or below the last applied epoch for its origin is stale
    /// and leaves the interpolation base untouched.
    pub fn on_now_playing_received(
        &mut self,
        origin: PeerId,
        update: NowPlayingUpdate,
        now: Instant,
    ) -> Result<(), PlaybackError> {
        if origin == self.self_id
            || self
                .entries
                .get(&origin)
                .is_some_and(|e| update.epoch_seq <= e.epoch_seq)
        {
            return Err(PlaybackError::StaleNowPlaying {
                origin,
                epoch_seq: update.epoch_seq,
            });
        }
        self.entries.insert(
            origin,
            NowPlaying {
                track_id: update.track_id,
                title: update.title,
                artist: update.artist,
                position: update.position,
                anchored_at: now,
                is_playing: update.is_playing,
                origin,
                epoch_seq: update.epoch_seq,
            },
        );
        self.current = Some(origin);
        Ok(())
    }

    /// Republish a locally playing track once the refresh interval has passed.
    pub fn refresh(&mut self, now: Instant) -> Option<NowPlayingUpdate> {
        let local = self.entries.get(&self.self_id)?;
        if !local.is_playing {
            return None;
        }
        let due = self
            .last_published_at
            .map_or(true, |t| now.saturating_duration_since(t) >= self.refresh);
        if !due {
            return None;
        }
        let (track_id, title, artist) = (
            local.track_id.clone(),
            local.title.clone(),
            local.artist.clone(),
        );
        let position = local.position_at(now);
        Some(self.publish(&track_id, &title, &artist, position, true, now))
    }

    /// Current local publication, extrapolated to `now` (for a late joiner).
    pub fn local_update(&self, now: Instant) -> Option<NowPlayingUpdate> {
        self.entries.get(&self.self_id).map(|np| np.to_update(now))
    }

    /// Shared "now playing": the most recently applied publication.
    pub fn current(&self) -> Option<&NowPlaying> {
        self.current.and_then(|o| self.entries.get(&o))
    }

    pub fn current_position(&self, now: Instant) -> Option<Duration> {
        self.current().map(|np| np.position_at(now))
    }

    pub fn view(&self, now: Instant) -> Option<NowPlayingView> {
        self.current().map(|np| NowPlayingView {
            track_id: np.track_id.clone(),
            title: np.title.clone(),
            artist: np.artist.clone(),
            position: np.position_at(now),
            is_playing: np.is_playing,
            origin: np.origin,
        })
    }

    /// Drop an origin that left the group. Its epoch history goes with it.
    pub fn forget(&mut self, origin: &PeerId) {
        if *origin == self.self_id {
            return;
        }
        self.entries.remove(origin);
        if self.current == Some(*origin) {
            self.current = self.entries.contains_key(&self.self_id).then_some(self.self_id);
        }
    }

    pub fn forget_remote(&mut self) {
        let me = self.self_id;
        self.entries.retain(|o, _| *o == me);
        if self.current != Some(me) {
            self.current = self.entries.contains_key(&me).then_some(me);
        }
    }
}
