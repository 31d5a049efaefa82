//! Time- and silence-based conditions that request a leave.
//!
//! The tracker is pure bookkeeping over injected instants so the checks are
//! deterministic under test; adapters feed it from their event streams and
//! poll [`AutoLeaveTracker::check`] once per supervisor tick.

use std::time::Instant;

use crate::models::AutoLeaveSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoLeaveTrigger {
    Silence,
    OnlyParticipantInMeeting,
    MaxUptimeExceeded,
    WaitingForHostTimeout,
    WaitingRoomTimeout,
}

#[derive(Debug)]
pub struct AutoLeaveTracker {
    started_at: Instant,
    joined_at: Option<Instant>,
    only_one_participant_in_meeting_at: Option<Instant>,
    last_audio_received_at: Option<Instant>,
    silence_detection_activated: bool,
    waiting_for_host_since: Option<Instant>,
    in_waiting_room_since: Option<Instant>,
}

impl AutoLeaveTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            joined_at: None,
            only_one_participant_in_meeting_at: None,
            last_audio_received_at: None,
            silence_detection_activated: false,
            waiting_for_host_since: None,
            in_waiting_room_since: None,
        }
    }

    pub fn note_joined(&mut self, now: Instant) {
        self.joined_at = Some(now);
        self.waiting_for_host_since = None;
        self.in_waiting_room_since = None;
    }

    pub fn note_audio_received(&mut self, now: Instant) {
        self.last_audio_received_at = Some(now);
    }

    pub fn note_participant_count(&mut self, count: usize, now: Instant) {
        if count <= 1 {
            self.only_one_participant_in_meeting_at.get_or_insert(now);
        } else {
            self.only_one_participant_in_meeting_at = None;
        }
    }

    pub fn note_waiting_for_host(&mut self, now: Instant) {
        self.waiting_for_host_since.get_or_insert(now);
    }

    pub fn note_in_waiting_room(&mut self, now: Instant) {
        self.in_waiting_room_since.get_or_insert(now);
    }

    /// Evaluate all conditions at `now`. The first triggered condition wins;
    /// callers stop polling once a leave is underway.
    pub fn check(&mut self, settings: &AutoLeaveSettings, now: Instant) -> Option<AutoLeaveTrigger> {
        if let Some(since) = self.waiting_for_host_since {
            if elapsed_secs(since, now) > settings.wait_for_host_to_start_meeting_timeout_seconds {
                return Some(AutoLeaveTrigger::WaitingForHostTimeout);
            }
        }

        if let Some(since) = self.in_waiting_room_since {
            if elapsed_secs(since, now) > settings.waiting_room_timeout_seconds {
                return Some(AutoLeaveTrigger::WaitingRoomTimeout);
            }
        }

        if let Some(max_uptime) = settings.max_uptime_seconds {
            if elapsed_secs(self.started_at, now) > max_uptime {
                return Some(AutoLeaveTrigger::MaxUptimeExceeded);
            }
        }

        if let Some(alone_since) = self.only_one_participant_in_meeting_at {
            if elapsed_secs(alone_since, now)
                > settings.only_participant_in_meeting_timeout_seconds
            {
                return Some(AutoLeaveTrigger::OnlyParticipantInMeeting);
            }
        }

        // Silence detection arms a while after join, then measures from the
        // last received audio.
        if !self.silence_detection_activated {
            if let Some(joined_at) = self.joined_at {
                if elapsed_secs(joined_at, now) > settings.silence_activate_after_seconds {
                    self.silence_detection_activated = true;
                    self.last_audio_received_at.get_or_insert(now);
                }
            }
        }
        if self.silence_detection_activated {
            if let Some(last_audio) = self.last_audio_received_at {
                if elapsed_secs(last_audio, now) > settings.silence_timeout_seconds {
                    return Some(AutoLeaveTrigger::Silence);
                }
            }
        }

        None
    }
}

fn elapsed_secs(from: Instant, to: Instant) -> u64 {
    to.saturating_duration_since(from).as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> AutoLeaveSettings {
        AutoLeaveSettings::default()
    }

    #[test]
    fn silence_triggers_after_activation_plus_timeout() {
        let start = Instant::now();
        let mut tracker = AutoLeaveTracker::new(start);
        let config = settings();
        tracker.note_joined(start);
        tracker.note_audio_received(start + Duration::from_secs(10));
        tracker.note_participant_count(2, start);

        // Before activation nothing fires even with stale audio.
        let before = start + Duration::from_secs(config.silence_activate_after_seconds - 1);
        assert_eq!(tracker.check(&config, before), None);

        // After activation + silence timeout it fires.
        let after = start
            + Duration::from_secs(
                config.silence_activate_after_seconds + config.silence_timeout_seconds + 1,
            );
        assert_eq!(tracker.check(&config, after), Some(AutoLeaveTrigger::Silence));
    }

    #[test]
    fn recent_audio_resets_silence_clock() {
        let start = Instant::now();
        let mut tracker = AutoLeaveTracker::new(start);
        let config = settings();
        tracker.note_joined(start);

        let activated = start + Duration::from_secs(config.silence_activate_after_seconds + 1);
        assert_eq!(tracker.check(&config, activated), None);

        tracker.note_audio_received(activated + Duration::from_secs(500));
        let later = activated + Duration::from_secs(500 + config.silence_timeout_seconds - 1);
        assert_eq!(tracker.check(&config, later), None);
    }

    #[test]
    fn only_participant_triggers_after_timeout() {
        let start = Instant::now();
        let mut tracker = AutoLeaveTracker::new(start);
        let config = settings();
        tracker.note_joined(start);
        tracker.note_participant_count(1, start);

        let just_before = start
            + Duration::from_secs(config.only_participant_in_meeting_timeout_seconds);
        assert_eq!(tracker.check(&config, just_before), None);

        let after = start
            + Duration::from_secs(config.only_participant_in_meeting_timeout_seconds + 1);
        assert_eq!(
            tracker.check(&config, after),
            Some(AutoLeaveTrigger::OnlyParticipantInMeeting)
        );
    }

    #[test]
    fn other_participant_arriving_clears_alone_timer() {
        let start = Instant::now();
        let mut tracker = AutoLeaveTracker::new(start);
        let config = settings();
        tracker.note_joined(start);
        tracker.note_participant_count(1, start);
        tracker.note_participant_count(2, start + Duration::from_secs(30));

        let after = start
            + Duration::from_secs(config.only_participant_in_meeting_timeout_seconds + 30);
        assert_eq!(tracker.check(&config, after), None);
    }

    #[test]
    fn wait_for_host_timeout() {
        let start = Instant::now();
        let mut tracker = AutoLeaveTracker::new(start);
        let mut config = settings();
        config.wait_for_host_to_start_meeting_timeout_seconds = 1;
        tracker.note_waiting_for_host(start);

        assert_eq!(
            tracker.check(&config, start + Duration::from_secs(2)),
            Some(AutoLeaveTrigger::WaitingForHostTimeout)
        );
    }

    #[test]
    fn waiting_room_timeout() {
        let start = Instant::now();
        let mut tracker = AutoLeaveTracker::new(start);
        let config = settings();
        tracker.note_in_waiting_room(start);

        let after = start + Duration::from_secs(config.waiting_room_timeout_seconds + 1);
        assert_eq!(
            tracker.check(&config, after),
            Some(AutoLeaveTrigger::WaitingRoomTimeout)
        );
    }

    #[test]
    fn max_uptime_unbounded_by_default() {
        let start = Instant::now();
        let mut tracker = AutoLeaveTracker::new(start);
        let config = settings();
        tracker.note_joined(start);
        tracker.note_participant_count(2, start);
        tracker.note_audio_received(start + Duration::from_secs(100_000));
        assert_eq!(
            tracker.check(&config, start + Duration::from_secs(100_000)),
            None
        );

        let mut bounded = settings();
        bounded.max_uptime_seconds = Some(60);
        assert_eq!(
            tracker.check(&bounded, start + Duration::from_secs(61)),
            Some(AutoLeaveTrigger::MaxUptimeExceeded)
        );
    }

    #[test]
    fn joining_clears_lobby_timers() {
        let start = Instant::now();
        let mut tracker = AutoLeaveTracker::new(start);
        let mut config = settings();
        config.wait_for_host_to_start_meeting_timeout_seconds = 1;
        tracker.note_waiting_for_host(start);
        tracker.note_joined(start + Duration::from_secs(1));
        tracker.note_participant_count(2, start);
        assert_eq!(tracker.check(&config, start + Duration::from_secs(10)), None);
    }
}
