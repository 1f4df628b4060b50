//! Node actor: sole owner of the RideCore. Discovery, transport, ticks and
//! intents all arrive on one mailbox, so the core never sees concurrent calls.

use std::time::{Duration, Instant};

use ride_core::audio::AudioState;
use ride_core::session::RideAction;
use ride_core::{
    AudioMode, CommandKind, ConnectionState, CoreError, CoreEvent, NowPlayingView, OutboundAction,
    PeerId, RideCore, RideState, Role,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::PeerChannel;

const INBOX_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("join timed out")]
    JoinTimeout,
    #[error("join cancelled")]
    JoinCancelled,
    #[error("node stopped")]
    Stopped,
}

pub type Reply<T> = oneshot::Sender<Result<T, NodeError>>;

/// Local playback sample to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub position: Duration,
    pub is_playing: bool,
}

#[derive(Debug)]
pub enum Intent {
    CreateGroup(Reply<()>),
    JoinGroup(PeerId, Reply<()>),
    CancelJoin(Reply<bool>),
    LeaveGroup(Reply<()>),
    Rename(String, Reply<()>),
    Ride(RideAction, Reply<()>),
    ToggleVoiceMute(Reply<bool>),
    ToggleMusicMute(Reply<bool>),
    SetAudioMode(AudioMode, Reply<()>),
    HostBroadcast(CommandKind, Reply<()>),
    ForcePeerVoiceMute(PeerId, Reply<()>),
    PublishNowPlaying(Track, Reply<()>),
    AudioLevel(f32),
}

#[derive(Debug)]
pub enum Input {
    Discovered { peer: PeerId, display_name: String },
    Disconnected(PeerId),
    Frame { from: PeerId, bytes: Vec<u8> },
    Intent(Intent),
}

/// Roster entry as shown to the console.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberStatus {
    pub peer_id: PeerId,
    pub display_name: String,
    pub is_host: bool,
    pub connection: ConnectionState,
    pub audio: AudioState,
}

/// Snapshot published after every input.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub peer_id: PeerId,
    pub display_name: String,
    pub role: Role,
    pub ride: RideState,
    pub ride_elapsed: Duration,
    pub members: Vec<MemberStatus>,
    pub now_playing: Option<NowPlayingView>,
}

pub fn inbox() -> (mpsc::Sender<Input>, mpsc::Receiver<Input>) {
    mpsc::channel(INBOX_CAPACITY)
}

pub struct RideNode<C: PeerChannel> {
    core: RideCore,
    channel: C,
    inbox: mpsc::Receiver<Input>,
    status: watch::Sender<NodeStatus>,
    events: broadcast::Sender<CoreEvent>,
    pending_join: Option<Reply<()>>,
    tick: Duration,
}

impl<C: PeerChannel> RideNode<C> {
    /// Spawn the actor. `inputs` must be the sender half of `inbox`.
    pub fn spawn(
        core: RideCore,
        channel: C,
        tick: Duration,
        inputs: mpsc::Sender<Input>,
        inbox: mpsc::Receiver<Input>,
    ) -> (NodeHandle, JoinHandle<()>) {
        let (status_tx, status_rx) = watch::channel(status_of(&core, Instant::now()));
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = NodeHandle {
            peer_id: core.peer_id(),
            inputs,
            status: status_rx,
            events: events_tx.clone(),
            join_timeout: core.config().join_timeout,
        };
        let node = RideNode {
            core,
            channel,
            inbox,
            status: status_tx,
            events: events_tx,
            pending_join: None,
            tick,
        };
        (handle, tokio::spawn(node.run()))
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick(),
                input = self.inbox.recv() => match input {
                    Some(input) => self.handle(input),
                    None => break,
                },
            }
            self.status.send_replace(status_of(&self.core, Instant::now()));
        }
        debug!("node inbox closed; actor stopped");
    }

    fn on_tick(&mut self) {
        self.drop_abandoned_join();
        let actions = self.core.tick(Instant::now());
        self.perform(actions);
    }

    /// A join whose caller went away is cancelled.
    fn drop_abandoned_join(&mut self) {
        if self.pending_join.as_ref().is_some_and(|r| r.is_closed()) {
            self.pending_join = None;
            self.core.cancel_join();
        }
    }

    fn handle(&mut self, input: Input) {
        let now = Instant::now();
        match input {
            Input::Discovered { peer, display_name } => {
                let actions = self.core.on_peer_discovered(peer, &display_name, now);
                self.perform(actions);
            }
            Input::Disconnected(peer) => {
                let actions = self.core.on_peer_disconnected(peer, now);
                self.perform(actions);
            }
            Input::Frame { from, bytes } => match self.core.on_message_received(from, &bytes, now) {
                Ok(actions) => self.perform(actions),
                Err(e) => warn!(from = %from.short(), error = %e, "frame rejected"),
            },
            Input::Intent(intent) => self.handle_intent(intent, now),
        }
    }

    fn handle_intent(&mut self, intent: Intent, now: Instant) {
        match intent {
            Intent::CreateGroup(reply) => {
                let result = self.core.create_group(now);
                self.finish(result, reply);
            }
            Intent::JoinGroup(host, reply) => {
                self.drop_abandoned_join();
                if self.pending_join.is_some() {
                    let _ = reply.send(Err(CoreError::Join(ride_core::JoinError::AlreadyInGroup).into()));
                    return;
                }
                match self.core.join_group(host, now) {
                    Ok(actions) => {
                        info!(host = %host.short(), "joining group");
                        self.pending_join = Some(reply);
                        self.perform(actions);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Intent::CancelJoin(reply) => {
                let cancelled = self.core.cancel_join();
                if let Some(pending) = self.pending_join.take() {
                    let _ = pending.send(Err(NodeError::JoinCancelled));
                }
                let _ = reply.send(Ok(cancelled));
            }
            Intent::LeaveGroup(reply) => {
                let actions = self.core.leave_group(now);
                self.perform(actions);
                let _ = reply.send(Ok(()));
            }
            Intent::Rename(name, reply) => {
                let actions = self.core.rename(&name, now);
                self.perform(actions);
                let _ = reply.send(Ok(()));
            }
            Intent::Ride(action, reply) => {
                let result = match action {
                    RideAction::Start => self.core.start_ride(now),
                    RideAction::Pause => self.core.pause_ride(now),
                    RideAction::Resume => self.core.resume_ride(now),
                    RideAction::End => self.core.end_ride(now),
                    RideAction::Reset => self.core.reset_ride(),
                };
                self.finish(result, reply);
            }
            Intent::ToggleVoiceMute(reply) => {
                let _ = reply.send(Ok(self.core.toggle_self_voice_mute()));
            }
            Intent::ToggleMusicMute(reply) => {
                let _ = reply.send(Ok(self.core.toggle_self_music_mute()));
            }
            Intent::SetAudioMode(mode, reply) => {
                self.core.set_audio_mode(mode);
                let _ = reply.send(Ok(()));
            }
            Intent::HostBroadcast(kind, reply) => {
                let result = self.core.host_broadcast(kind, now);
                self.finish(result, reply);
            }
            Intent::ForcePeerVoiceMute(peer, reply) => {
                let result = self.core.force_peer_voice_mute(peer, now);
                self.finish(result, reply);
            }
            Intent::PublishNowPlaying(track, reply) => {
                let actions = self.core.publish_now_playing(
                    &track.track_id,
                    &track.title,
                    &track.artist,
                    track.position,
                    track.is_playing,
                    now,
                );
                self.perform(actions);
                let _ = reply.send(Ok(()));
            }
            Intent::AudioLevel(level) => {
                let actions = self.core.on_local_audio_level(level, now);
                self.perform(actions);
            }
        }
    }

    fn finish(&mut self, result: Result<Vec<OutboundAction>, CoreError>, reply: Reply<()>) {
        match result {
            Ok(actions) => {
                self.perform(actions);
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                debug!(error = %e, "intent refused");
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    fn perform(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::SendMessage(to, frame) => self.channel.send(to, frame),
                OutboundAction::Broadcast(frame) => self.channel.broadcast(frame),
                OutboundAction::Notify(event) => self.notify(event),
            }
        }
    }

    fn notify(&mut self, event: CoreEvent) {
        match &event {
            CoreEvent::JoinCompleted { host } => {
                info!(host = %host.short(), "joined group");
                if let Some(reply) = self.pending_join.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            CoreEvent::JoinFailed(e) => {
                warn!(error = %e, "join failed");
                if let Some(reply) = self.pending_join.take() {
                    let _ = reply.send(Err(CoreError::Join(e.clone()).into()));
                }
            }
            CoreEvent::Sos { from, note } => {
                warn!(from = %from.short(), note = note.as_deref().unwrap_or(""), "SOS");
            }
            CoreEvent::RideStateChanged(state) => info!(?state, "ride state"),
            other => debug!(event = ?other, "core event"),
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn status_of(core: &RideCore, now: Instant) -> NodeStatus {
    let members = core
        .roster()
        .map(|r| {
            r.peers()
                .iter()
                .map(|p| MemberStatus {
                    peer_id: p.peer_id,
                    display_name: p.display_name.clone(),
                    is_host: p.is_host,
                    connection: p.connection,
                    audio: core.audio_state(&p.peer_id, now),
                })
                .collect()
        })
        .unwrap_or_default();
    NodeStatus {
        peer_id: core.peer_id(),
        display_name: core.display_name().to_string(),
        role: core.role(),
        ride: core.ride_state(),
        ride_elapsed: core.ride().elapsed(now),
        members,
        now_playing: core.now_playing(now),
    }
}

/// Cloneable front door to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    peer_id: PeerId,
    inputs: mpsc::Sender<Input>,
    status: watch::Receiver<NodeStatus>,
    events: broadcast::Sender<CoreEvent>,
    join_timeout: Duration,
}

impl NodeHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Event stream (SOS, roster and ride changes). Slow subscribers may lag.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Intent) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.inputs
            .send(Input::Intent(make(tx)))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn create_group(&self) -> Result<(), NodeError> {
        self.request(Intent::CreateGroup).await
    }

    /// Join `host`'s group. Gives up (and cancels) after the join timeout.
    pub async fn join(&self, host: PeerId) -> Result<(), NodeError> {
        match tokio::time::timeout(self.join_timeout, self.request(|r| Intent::JoinGroup(host, r)))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                let _ = self.cancel_join().await;
                Err(NodeError::JoinTimeout)
            }
        }
    }

    pub async fn cancel_join(&self) -> Result<bool, NodeError> {
        self.request(Intent::CancelJoin).await
    }

    pub async fn leave_group(&self) -> Result<(), NodeError> {
        self.request(Intent::LeaveGroup).await
    }

    pub async fn rename(&self, display_name: String) -> Result<(), NodeError> {
        self.request(|r| Intent::Rename(display_name, r)).await
    }

    pub async fn ride(&self, action: RideAction) -> Result<(), NodeError> {
        self.request(|r| Intent::Ride(action, r)).await
    }

    pub async fn toggle_voice_mute(&self) -> Result<bool, NodeError> {
        self.request(Intent::ToggleVoiceMute).await
    }

    pub async fn toggle_music_mute(&self) -> Result<bool, NodeError> {
        self.request(Intent::ToggleMusicMute).await
    }

    pub async fn set_audio_mode(&self, mode: AudioMode) -> Result<(), NodeError> {
        self.request(|r| Intent::SetAudioMode(mode, r)).await
    }

    pub async fn host_broadcast(&self, kind: CommandKind) -> Result<(), NodeError> {
        self.request(|r| Intent::HostBroadcast(kind, r)).await
    }

    pub async fn force_peer_voice_mute(&self, peer: PeerId) -> Result<(), NodeError> {
        self.request(|r| Intent::ForcePeerVoiceMute(peer, r)).await
    }

    pub async fn publish_now_playing(&self, track: Track) -> Result<(), NodeError> {
        self.request(|r| Intent::PublishNowPlaying(track, r)).await
    }

    pub async fn audio_level(&self, level: f32) -> Result<(), NodeError> {
        self.inputs
            .send(Input::Intent(Intent::AudioLevel(level)))
            .await
            .map_err(|_| NodeError::Stopped)
    }
}
