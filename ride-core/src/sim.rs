//! In-memory multi-device network for scenario tests.
//!
//! Frames queue between cores under a manual clock. The network can drop,
//! duplicate and reorder frames from a seeded RNG so runs are reproducible.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::core::{CoreEvent, OutboundAction, RideCore};
use crate::identity::PeerId;

struct InFlight {
    from: PeerId,
    to: PeerId,
    frame: Vec<u8>,
}

pub struct SimNetwork {
    nodes: HashMap<PeerId, RideCore>,
    order: Vec<PeerId>,
    queue: VecDeque<InFlight>,
    events: HashMap<PeerId, Vec<CoreEvent>>,
    offline: HashSet<PeerId>,
    rng: StdRng,
    drop_rate: f64,
    duplicate_rate: f64,
    reorder: bool,
    config: Config,
    now: Instant,
}

impl SimNetwork {
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, Config::default())
    }

    pub fn with_config(seed: u64, config: Config) -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            queue: VecDeque::new(),
            events: HashMap::new(),
            offline: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            reorder: false,
            config,
            now: Instant::now(),
        }
    }

    /// Lossy mode: each frame is dropped / duplicated with the given probability and
    /// delivery order is shuffled.
    pub fn set_faults(&mut self, drop_rate: f64, duplicate_rate: f64, reorder: bool) {
        self.drop_rate = drop_rate;
        self.duplicate_rate = duplicate_rate;
        self.reorder = reorder;
    }

    pub fn add(&mut self, name: &str) -> PeerId {
        let core = RideCore::new(name, self.config.clone());
        let id = core.peer_id();
        self.nodes.insert(id, core);
        self.order.push(id);
        id
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn node(&self, id: PeerId) -> &RideCore {
        &self.nodes[&id]
    }

    pub fn events(&self, id: PeerId) -> &[CoreEvent] {
        self.events.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count_events(&self, id: PeerId, pred: impl Fn(&CoreEvent) -> bool) -> usize {
        self.events(id).iter().filter(|e| pred(e)).count()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Take a device off the network: it neither ticks nor sends nor receives.
    pub fn set_offline(&mut self, id: PeerId, offline: bool) {
        if offline {
            self.offline.insert(id);
        } else {
            self.offline.remove(&id);
        }
    }

    /// Run an intent on one device and queue whatever it emits.
    pub fn act<T>(
        &mut self,
        id: PeerId,
        f: impl FnOnce(&mut RideCore, Instant) -> T,
    ) -> T
    where
        T: IntoActions,
    {
        let now = self.now;
        let core = self.nodes.get_mut(&id).expect("unknown node");
        let result = f(core, now);
        if let Some(actions) = result.actions() {
            self.dispatch(id, actions);
        }
        result
    }

    /// Host creates a group and each member joins it over a clean network.
    pub fn form_group(&mut self, host: PeerId, members: &[PeerId]) {
        self.act(host, |c, now| c.create_group(now)).expect("create group");
        for m in members {
            self.act(*m, |c, now| c.join_group(host, now)).expect("join");
            self.deliver_all();
        }
    }

    /// Deliver queued frames until the network is quiet.
    pub fn deliver_all(&mut self) {
        let mut budget = 100_000;
        while let Some(f) = self.next_frame() {
            budget -= 1;
            assert!(budget > 0, "network never went quiet");
            if self.offline.contains(&f.to) || self.offline.contains(&f.from) {
                continue;
            }
            if self.rng.gen_bool(self.drop_rate) {
                continue;
            }
            let copies = if self.rng.gen_bool(self.duplicate_rate) { 2 } else { 1 };
            for _ in 0..copies {
                let now = self.now;
                let Some(core) = self.nodes.get_mut(&f.to) else {
                    continue;
                };
                match core.on_message_received(f.from, &f.frame, now) {
                    Ok(actions) => self.dispatch(f.to, actions),
                    Err(e) => panic!("frame rejected: {e}"),
                }
            }
        }
    }

    /// Advance the clock in `step`s, ticking every online device and delivering after each step.
    pub fn run_for(&mut self, total: Duration, step: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.now += step;
            elapsed += step;
            for id in self.order.clone() {
                if self.offline.contains(&id) {
                    continue;
                }
                let now = self.now;
                let Some(core) = self.nodes.get_mut(&id) else {
                    continue;
                };
                let actions = core.tick(now);
                self.dispatch(id, actions);
            }
            self.deliver_all();
        }
    }

    fn next_frame(&mut self) -> Option<InFlight> {
        if self.reorder && self.queue.len() > 1 {
            let i = self.rng.gen_range(0..self.queue.len());
            return self.queue.remove(i);
        }
        self.queue.pop_front()
    }

    fn dispatch(&mut self, from: PeerId, actions: Vec<OutboundAction>) {
        if self.offline.contains(&from) {
            return;
        }
        for action in actions {
            match action {
                OutboundAction::SendMessage(to, frame) => {
                    self.queue.push_back(InFlight { from, to, frame })
                }
                OutboundAction::Broadcast(frame) => {
                    for to in self.order.iter().copied().filter(|p| *p != from) {
                        self.queue.push_back(InFlight {
                            from,
                            to,
                            frame: frame.clone(),
                        });
                    }
                }
                OutboundAction::Notify(event) => self.events.entry(from).or_default().push(event),
            }
        }
    }
}

/// Intent results that carry actions for the network.
pub trait IntoActions {
    fn actions(&self) -> Option<Vec<OutboundAction>>;
}

impl IntoActions for Vec<OutboundAction> {
    fn actions(&self) -> Option<Vec<OutboundAction>> {
        Some(self.clone())
    }
}

impl<E> IntoActions for Result<Vec<OutboundAction>, E> {
    fn actions(&self) -> Option<Vec<OutboundAction>> {
        self.as_ref().ok().cloned()
    }
}

impl IntoActions for bool {
    fn actions(&self) -> Option<Vec<OutboundAction>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandError;
    use crate::core::CoreError;
    use crate::membership::Role;
    use crate::protocol::CommandKind;
    use crate::session::RideState;

    fn ids(net: &SimNetwork, id: PeerId) -> Vec<PeerId> {
        net.node(id).roster().map(|r| r.peer_ids()).unwrap_or_default()
    }

    #[test]
    fn rosters_converge_after_joins() {
        let mut net = SimNetwork::new(1);
        let host = net.add("host");
        let members: Vec<PeerId> = ["ana", "ben", "cy"].iter().map(|n| net.add(n)).collect();
        net.form_group(host, &members);

        let expected = ids(&net, host);
        assert_eq!(expected.len(), 4);
        assert_eq!(expected[0], host);
        for m in &members {
            assert_eq!(net.node(*m).role(), Role::Member { host });
            assert_eq!(ids(&net, *m), expected);
            assert_eq!(
                net.node(*m).roster().unwrap().version(),
                net.node(host).roster().unwrap().version()
            );
        }
    }

    #[test]
    fn lossy_network_repairs_roster_and_commands() {
        let config = Config {
            command_buffer_timeout: Duration::from_secs(10),
            ..Config::default()
        };
        let mut net = SimNetwork::with_config(7, config);
        let host = net.add("host");
        let members: Vec<PeerId> = ["ana", "ben", "cy"].iter().map(|n| net.add(n)).collect();
        net.form_group(host, &members);

        net.set_faults(0.2, 0.1, true);
        let leaver = members[2];
        net.act(leaver, |c, now| c.leave_group(now));
        for i in 0..5 {
            net.act(host, |c, now| {
                c.host_broadcast(CommandKind::Sos { note: Some(format!("#{i}")) }, now)
            })
            .expect("host broadcast");
            net.run_for(Duration::from_secs(1), Duration::from_millis(250));
        }
        // Long enough for the host to drop a leaver whose leave frame was lost.
        net.run_for(Duration::from_secs(20), Duration::from_millis(500));

        net.set_faults(0.0, 0.0, false);
        net.run_for(Duration::from_secs(3), Duration::from_millis(500));

        let expected = ids(&net, host);
        assert!(!expected.contains(&leaver));
        for m in &members[..2] {
            assert_eq!(ids(&net, *m), expected);
            let sos = net.count_events(*m, |e| matches!(e, CoreEvent::Sos { .. }));
            assert_eq!(sos, 5, "each SOS applied exactly once");
        }
    }

    #[test]
    fn end_session_ends_every_ride() {
        let mut net = SimNetwork::new(2);
        let host = net.add("host");
        let a = net.add("a");
        let b = net.add("b");
        net.form_group(host, &[a, b]);

        for id in [host, a, b] {
            net.act(id, |c, now| c.start_ride(now)).unwrap();
        }
        net.act(b, |c, now| c.pause_ride(now)).unwrap();
        net.act(host, |c, now| c.end_ride(now)).unwrap();
        net.deliver_all();

        for id in [host, a, b] {
            assert_eq!(net.node(id).ride_state(), RideState::Ended);
        }
        // Members can start afresh after reset; their rides are independent again.
        net.act(a, |c, _| c.reset_ride()).unwrap();
        net.act(a, |c, now| c.start_ride(now)).unwrap();
        assert_eq!(net.node(b).ride_state(), RideState::Ended);
    }

    #[test]
    fn pause_does_not_propagate() {
        let mut net = SimNetwork::new(3);
        let host = net.add("host");
        let a = net.add("a");
        net.form_group(host, &[a]);
        net.act(host, |c, now| c.start_ride(now)).unwrap();
        net.act(a, |c, now| c.start_ride(now)).unwrap();
        net.act(host, |c, now| c.pause_ride(now)).unwrap();
        net.deliver_all();
        assert_eq!(net.node(a).ride_state(), RideState::Active);
    }

    #[test]
    fn mute_all_voice_mutes_everyone_but_the_host() {
        let mut net = SimNetwork::new(4);
        let host = net.add("host");
        let a = net.add("a");
        let b = net.add("b");
        net.form_group(host, &[a, b]);
        net.act(b, |c, _| c.toggle_self_music_mute());

        net.act(host, |c, now| c.host_broadcast(CommandKind::MuteAllVoice { targets: None }, now))
            .unwrap();
        net.deliver_all();

        let now = net.now();
        for id in [a, b] {
            assert!(net.node(id).audio_state(&id, now).voice_muted);
            assert!(net.node(host).audio_state(&id, now).voice_muted);
        }
        assert!(!net.node(host).audio_state(&host, now).voice_muted);
        // Music flags are untouched.
        assert!(!net.node(a).audio_state(&a, now).music_muted);
        assert!(net.node(b).audio_state(&b, now).music_muted);
    }

    #[test]
    fn member_cannot_issue_commands() {
        let mut net = SimNetwork::new(5);
        let host = net.add("host");
        let a = net.add("a");
        net.form_group(host, &[a]);
        let result = net.act(a, |c, now| c.host_broadcast(CommandKind::EndSession, now));
        assert_eq!(result, Err(CoreError::Command(CommandError::NotAuthorized)));
        assert_eq!(net.in_flight(), 0);
    }

    #[test]
    fn duplicated_now_playing_applies_once() {
        let mut net = SimNetwork::new(6);
        let host = net.add("host");
        let a = net.add("a");
        net.form_group(host, &[a]);
        net.set_faults(0.0, 1.0, false);

        net.act(host, |c, now| {
            c.publish_now_playing("trk", "Song", "Band", Duration::from_secs(30), true, now)
        });
        net.deliver_all();
        let changed = net.count_events(a, |e| matches!(e, CoreEvent::NowPlayingChanged { .. }));
        assert_eq!(changed, 1);

        let later = net.now() + Duration::from_secs(5);
        let view = net.node(a).now_playing(later).unwrap();
        assert_eq!(view.track_id, "trk");
        assert_eq!(view.origin, host);
        assert_eq!(view.position, Duration::from_secs(35));
    }

    #[test]
    fn speaking_indicator_reaches_peers() {
        let mut net = SimNetwork::new(8);
        let host = net.add("host");
        let a = net.add("a");
        net.form_group(host, &[a]);
        net.act(a, |c, now| c.on_local_audio_level(0.6, now));
        net.deliver_all();
        let now = net.now();
        assert!(net.node(host).audio_state(&a, now).is_speaking);
        assert!(!net.node(host).audio_state(&a, now + Duration::from_secs(1)).is_speaking);
    }

    #[test]
    fn silent_host_ends_member_rides() {
        let mut net = SimNetwork::new(9);
        let host = net.add("host");
        let a = net.add("a");
        net.form_group(host, &[a]);
        net.act(a, |c, now| c.start_ride(now)).unwrap();

        net.set_offline(host, true);
        net.run_for(Duration::from_secs(10), Duration::from_secs(1));
        assert!(net.events(a).contains(&CoreEvent::HostLost));
        assert_eq!(net.node(a).ride_state(), RideState::Active);
        // Host designation is not re-elected.
        assert_eq!(net.node(a).role(), Role::Member { host });

        net.run_for(Duration::from_secs(30), Duration::from_secs(1));
        assert_eq!(net.node(a).ride_state(), RideState::Ended);
        assert_eq!(net.node(a).role(), Role::Solo);
    }

    #[test]
    fn returning_host_cancels_silence_timer() {
        let mut net = SimNetwork::new(10);
        let host = net.add("host");
        let a = net.add("a");
        net.form_group(host, &[a]);
        net.act(a, |c, now| c.start_ride(now)).unwrap();

        net.set_offline(host, true);
        net.run_for(Duration::from_secs(8), Duration::from_secs(1));
        net.set_offline(host, false);
        net.run_for(Duration::from_secs(40), Duration::from_secs(1));
        assert!(net.events(a).contains(&CoreEvent::HostRecovered));
        assert_eq!(net.node(a).ride_state(), RideState::Active);
    }

    #[test]
    fn rename_reaches_every_roster() {
        let mut net = SimNetwork::new(11);
        let host = net.add("host");
        let a = net.add("ana");
        let b = net.add("ben");
        net.form_group(host, &[a, b]);

        net.act(a, |c, now| c.rename("ana r", now));
        net.deliver_all();
        net.act(host, |c, now| c.rename("lead", now));
        net.deliver_all();
        for id in [host, a, b] {
            let roster = net.node(id).roster().unwrap();
            assert_eq!(roster.get(&a).unwrap().display_name, "ana r");
            assert_eq!(roster.get(&host).unwrap().display_name, "lead");
        }
        assert_eq!(net.node(a).display_name(), "ana r");
        assert_eq!(net.node(host).display_name(), "lead");
    }

    #[test]
    fn ride_started_after_host_died_is_solo() {
        let mut net = SimNetwork::new(12);
        let host = net.add("host");
        let a = net.add("a");
        net.form_group(host, &[a]);

        net.set_offline(host, true);
        net.run_for(Duration::from_secs(45), Duration::from_secs(1));
        assert!(net.events(a).contains(&CoreEvent::HostLost));
        assert!(net.events(a).contains(&CoreEvent::LeftGroup));
        assert_eq!(net.node(a).role(), Role::Solo);

        net.act(a, |c, now| c.start_ride(now)).unwrap();
        assert!(!net.node(a).ride().is_group_ride());
        net.run_for(Duration::from_secs(300), Duration::from_secs(1));
        assert_eq!(net.node(a).ride_state(), RideState::Active);
        assert_eq!(net.node(a).role(), Role::Solo);
    }
}
