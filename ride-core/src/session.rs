//! Ride lifecycle: idle → active ⇄ paused → ended → idle.

use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideState {
    Idle,
    Active,
    Paused,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideAction {
    Start,
    Pause,
    Resume,
    End,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid transition: cannot {action:?} while {from:?}")]
    InvalidTransition { from: RideState, action: RideAction },
}

/// Result of checking the host-silence timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSilence {
    NotExpired,
    /// The host has been silent too long. `ride_ended` is set when a ride in progress was ended.
    Expired { ride_ended: bool },
}

/// Per-device ride. Each device owns exactly one; group members converge only via end-session.
#[derive(Debug, Clone)]
pub struct RideSession {
    state: RideState,
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    ended_at: Option<Instant>,
    is_group_ride: bool,
    paused_total: Duration,
    host_lost_at: Option<Instant>,
    host_silence_timeout: Duration,
}

impl RideSession {
    pub fn new(host_silence_timeout: Duration) -> Self {
        Self {
            state: RideState::Idle,
            started_at: None,
            paused_at: None,
            ended_at: None,
            is_group_ride: false,
            paused_total: Duration::ZERO,
            host_lost_at: None,
            host_silence_timeout,
        }
    }

    pub fn state(&self) -> RideState {
        self.state
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn paused_at(&self) -> Option<Instant> {
        self.paused_at
    }

    pub fn ended_at(&self) -> Option<Instant> {
        self.ended_at
    }

    pub fn is_group_ride(&self) -> bool {
        self.is_group_ride
    }

    fn invalid(&self, action: RideAction) -> TransitionError {
        TransitionError::InvalidTransition {
            from: self.state,
            action,
        }
    }

    /// idle → active. An ended ride must be reset first.
    pub fn start(&mut self, now: Instant, in_group: bool) -> Result<(), TransitionError> {
        if self.state != RideState::Idle {
            return Err(self.invalid(RideAction::Start));
        }
        self.state = RideState::Active;
        self.started_at = Some(now);
        self.is_group_ride = in_group;
        info!(group = in_group, "ride started");
        Ok(())
    }

    pub fn pause(&mut self, now: Instant) -> Result<(), TransitionError> {
        if self.state != RideState::Active {
            return Err(self.invalid(RideAction::Pause));
        }
        self.state = RideState::Paused;
        self.paused_at = Some(now);
        Ok(())
    }

    pub fn resume(&mut self, now: Instant) -> Result<(), TransitionError> {
        if self.state != RideState::Paused {
            return Err(self.invalid(RideAction::Resume));
        }
        if let Some(p) = self.paused_at.take() {
            self.paused_total += now.saturating_duration_since(p);
        }
        self.state = RideState::Active;
        Ok(())
    }

    /// active | paused → ended. Broadcasting end-session (when host) is the caller's job.
    pub fn end(&mut self, now: Instant) -> Result<(), TransitionError> {
        if !matches!(self.state, RideState::Active | RideState::Paused) {
            return Err(self.invalid(RideAction::End));
        }
        self.finish(now);
        info!("ride ended");
        Ok(())
    }

    /// Remote end-session: terminal override. Returns false when there is no ride in progress.
    pub fn force_end(&mut self, now: Instant) -> bool {
        if !matches!(self.state, RideState::Active | RideState::Paused) {
            return false;
        }
        self.finish(now);
        info!("ride ended by host");
        true
    }

    /// ended → idle; clears all timestamps.
    pub fn reset(&mut self) -> Result<(), TransitionError> {
        if self.state != RideState::Ended {
            return Err(self.invalid(RideAction::Reset));
        }
        self.state = RideState::Idle;
        self.started_at = None;
        self.paused_at = None;
        self.ended_at = None;
        self.is_group_ride = false;
        self.paused_total = Duration::ZERO;
        Ok(())
    }

    /// Start the host-silence timer (first loss wins).
    pub fn on_host_lost(&mut self, now: Instant) {
        if self.host_lost_at.is_none() {
            self.host_lost_at = Some(now);
        }
    }

    pub fn on_host_recovered(&mut self) {
        self.host_lost_at = None;
    }

    pub fn host_silence_pending(&self) -> bool {
        self.host_lost_at.is_some()
    }

    /// Once the host has been silent too long, ends any ride in progress. The timer
    /// fires even with no ride, so the caller can drop the dead group.
    pub fn tick(&mut self, now: Instant) -> HostSilence {
        let Some(lost_at) = self.host_lost_at else {
            return HostSilence::NotExpired;
        };
        if now.saturating_duration_since(lost_at) < self.host_silence_timeout {
            return HostSilence::NotExpired;
        }
        self.host_lost_at = None;
        if !matches!(self.state, RideState::Active | RideState::Paused) {
            return HostSilence::Expired { ride_ended: false };
        }
        warn!("host silent too long; ending ride locally");
        self.finish(now);
        HostSilence::Expired { ride_ended: true }
    }

    /// Riding time so far, excluding pauses.
    pub fn elapsed(&self, now: Instant) -> Duration {
        let Some(start) = self.started_at else {
            return Duration::ZERO;
        };
        let until = match (self.state, self.paused_at, self.ended_at) {
            (RideState::Ended, _, Some(end)) => end,
            (RideState::Paused, Some(p), _) => p,
            _ => now,
        };
        until
            .saturating_duration_since(start)
            .saturating_sub(self.paused_total)
    }

    fn finish(&mut self, now: Instant) {
        if let Some(p) = self.paused_at.take() {
            self.paused_total += now.saturating_duration_since(p);
        }
        self.state = RideState::Ended;
        self.ended_at = Some(now);
        self.host_lost_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RideSession {
        RideSession::new(Duration::from_secs(30))
    }

    #[test]
    fn start_from_idle_only() {
        let mut s = session();
        let now = Instant::now();
        assert!(s.start(now, false).is_ok());
        assert_eq!(s.state(), RideState::Active);
        assert_eq!(s.started_at(), Some(now));
        assert_eq!(
            s.start(now, false),
            Err(TransitionError::InvalidTransition {
                from: RideState::Active,
                action: RideAction::Start
            })
        );
    }

    #[test]
    fn end_from_idle_is_invalid() {
        let mut s = session();
        assert!(s.end(Instant::now()).is_err());
        assert_eq!(s.state(), RideState::Idle);
        assert_eq!(s.ended_at(), None);
    }

    #[test]
    fn full_lifecycle() {
        let mut s = session();
        let t0 = Instant::now();
        s.start(t0, true).unwrap();
        s.pause(t0 + Duration::from_secs(10)).unwrap();
        assert_eq!(s.paused_at(), Some(t0 + Duration::from_secs(10)));
        s.resume(t0 + Duration::from_secs(15)).unwrap();
        s.end(t0 + Duration::from_secs(20)).unwrap();
        assert_eq!(s.state(), RideState::Ended);
        assert_eq!(s.elapsed(t0 + Duration::from_secs(99)), Duration::from_secs(15));
        assert!(s.start(t0, false).is_err());
        s.reset().unwrap();
        assert_eq!(s.state(), RideState::Idle);
        assert_eq!(s.started_at(), None);
        assert!(!s.is_group_ride());
        s.start(t0, false).unwrap();
    }

    #[test]
    fn invalid_transitions_leave_state_unchanged() {
        let mut s = session();
        let now = Instant::now();
        assert!(s.pause(now).is_err());
        assert!(s.resume(now).is_err());
        assert!(s.reset().is_err());
        s.start(now, false).unwrap();
        assert!(s.resume(now).is_err());
        assert!(s.reset().is_err());
        assert_eq!(s.state(), RideState::Active);
        assert_eq!(s.paused_at(), None);
    }

    #[test]
    fn force_end_from_active_or_paused() {
        let now = Instant::now();
        let mut active = session();
        active.start(now, true).unwrap();
        assert!(active.force_end(now));
        assert_eq!(active.state(), RideState::Ended);

        let mut paused = session();
        paused.start(now, true).unwrap();
        paused.pause(now).unwrap();
        assert!(paused.force_end(now));
        assert_eq!(paused.state(), RideState::Ended);

        let mut idle = session();
        assert!(!idle.force_end(now));
        assert_eq!(idle.state(), RideState::Idle);
    }

    #[test]
    fn host_silence_ends_ride_locally() {
        let t0 = Instant::now();
        let mut s = session();
        s.start(t0, true).unwrap();
        s.on_host_lost(t0);
        assert_eq!(s.tick(t0 + Duration::from_secs(29)), HostSilence::NotExpired);
        assert_eq!(
            s.tick(t0 + Duration::from_secs(30)),
            HostSilence::Expired { ride_ended: true }
        );
        assert_eq!(s.state(), RideState::Ended);
        assert!(!s.host_silence_pending());
    }

    #[test]
    fn host_silence_expires_without_a_ride() {
        let t0 = Instant::now();
        let mut s = session();
        s.on_host_lost(t0);
        assert_eq!(
            s.tick(t0 + Duration::from_secs(30)),
            HostSilence::Expired { ride_ended: false }
        );
        assert_eq!(s.state(), RideState::Idle);
        assert!(!s.host_silence_pending());
    }

    #[test]
    fn host_recovery_cancels_silence_timer() {
        let t0 = Instant::now();
        let mut s = session();
        s.start(t0, true).unwrap();
        s.on_host_lost(t0);
        s.on_host_recovered();
        assert_eq!(s.tick(t0 + Duration::from_secs(60)), HostSilence::NotExpired);
        assert_eq!(s.state(), RideState::Active);
    }
}
