//! Session state machine.
//!
//! ```text
//!            start            opened           first audio
//!   Idle ───────────► Connecting ───────► Listening ─────────► Speaking
//!    ▲                    │                  ▲  ▲ interrupted     │
//!    │                    │                  │  └─────────────────┤
//!    │                    │                  └─── drained ────────┘
//!    └──── closed / error / stop (from any non-idle state) ───────┘
//! ```
//!
//! Every accepted trigger yields a [`Transition`] carrying the feedback the
//! host should play. Triggers that do not apply in the current state are
//! rejected with `None` and leave the state untouched.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Speaking,
}

impl SessionState {
    /// Listening or speaking: the transport is open and audio flows.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Listening | Self::Speaking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    StartRequested,
    TransportOpened,
    AudioReceived,
    PlaybackDrained,
    Interrupted,
    TransportClosed,
    Failed,
    StopRequested,
}

/// Vibration pattern for one transition. Durations alternate on/off in ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HapticPattern {
    SessionStart,
    SessionOpened,
    FirstAudio,
    PlaybackDrained,
    Interrupted,
    SessionClosed,
    SessionError,
    SessionStopped,
}

impl HapticPattern {
    pub fn pulses(self) -> &'static [u32] {
        match self {
            Self::SessionStart => &[50],
            Self::SessionOpened => &[30, 50, 30],
            Self::FirstAudio => &[10],
            Self::PlaybackDrained => &[8, 8],
            Self::Interrupted => &[20],
            Self::SessionClosed => &[50, 100],
            Self::SessionError => &[100, 50, 100],
            Self::SessionStopped => &[60],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accent {
    Slate,
    Blue,
    Green,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Icon {
    Microphone,
    VolumeHigh,
}

/// What the host shows while the session sits in a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualCue {
    pub accent: Accent,
    pub icon: Icon,
    pub caption: String,
    /// Pulsing ring around the orb while the session is live.
    pub animated: bool,
}

impl VisualCue {
    pub fn for_state(state: SessionState) -> Self {
        let (accent, icon, caption) = match state {
            SessionState::Idle => (
                Accent::Slate,
                Icon::Microphone,
                "Connect for secure technical assistance.",
            ),
            SessionState::Connecting => (
                Accent::Slate,
                Icon::Microphone,
                "Calibrating audio path...",
            ),
            SessionState::Listening => (
                Accent::Blue,
                Icon::Microphone,
                "Agent is waiting. Speak now.",
            ),
            SessionState::Speaking => {
                (Accent::Green, Icon::VolumeHigh, "Synthesizing answer...")
            }
        };
        Self {
            accent,
            icon,
            caption: caption.to_string(),
            animated: state.is_live(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub haptic: HapticPattern,
    pub visual: VisualCue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub trigger: Trigger,
    pub feedback: Feedback,
}

#[derive(Debug, Default)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply a trigger. Returns the transition taken, or `None` when the
    /// trigger does not apply in the current state.
    pub fn apply(&mut self, trigger: Trigger) -> Option<Transition> {
        use SessionState::*;
        use Trigger::*;

        let (to, haptic) = match (self.state, trigger) {
            (Idle, StartRequested) => (Connecting, HapticPattern::SessionStart),
            (Connecting, TransportOpened) => (Listening, HapticPattern::SessionOpened),
            (Listening, AudioReceived) => (Speaking, HapticPattern::FirstAudio),
            (Speaking, PlaybackDrained) => (Listening, HapticPattern::PlaybackDrained),
            // Barge-in always lands in listening, even from listening.
            (Listening | Speaking, Interrupted) => (Listening, HapticPattern::Interrupted),
            (Idle, TransportClosed | Failed | StopRequested) => return None,
            (_, TransportClosed) => (Idle, HapticPattern::SessionClosed),
            (_, Failed) => (Idle, HapticPattern::SessionError),
            (_, StopRequested) => (Idle, HapticPattern::SessionStopped),
            _ => return None,
        };

        let from = self.state;
        self.state = to;
        Some(Transition {
            from,
            to,
            trigger,
            feedback: Feedback {
                haptic,
                visual: VisualCue::for_state(to),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL_STATES: [SessionState; 4] = [
        SessionState::Idle,
        SessionState::Connecting,
        SessionState::Listening,
        SessionState::Speaking,
    ];

    const ALL_TRIGGERS: [Trigger; 8] = [
        Trigger::StartRequested,
        Trigger::TransportOpened,
        Trigger::AudioReceived,
        Trigger::PlaybackDrained,
        Trigger::Interrupted,
        Trigger::TransportClosed,
        Trigger::Failed,
        Trigger::StopRequested,
    ];

    fn machine_in(state: SessionState) -> SessionStateMachine {
        SessionStateMachine { state }
    }

    #[test]
    fn happy_path_walks_the_full_cycle() {
        let mut m = SessionStateMachine::new();
        let steps = [
            (Trigger::StartRequested, SessionState::Connecting),
            (Trigger::TransportOpened, SessionState::Listening),
            (Trigger::AudioReceived, SessionState::Speaking),
            (Trigger::PlaybackDrained, SessionState::Listening),
            (Trigger::AudioReceived, SessionState::Speaking),
            (Trigger::StopRequested, SessionState::Idle),
        ];
        for (trigger, expected) in steps {
            let t = m.apply(trigger).expect("transition");
            assert_eq!(t.to, expected);
            assert_eq!(m.state(), expected);
        }
    }

    #[test]
    fn only_audio_leaves_listening_for_speaking() {
        for trigger in ALL_TRIGGERS {
            let mut m = machine_in(SessionState::Listening);
            let to = m.apply(trigger).map(|t| t.to);
            assert_eq!(
                to == Some(SessionState::Speaking),
                trigger == Trigger::AudioReceived,
                "{trigger:?}"
            );
        }
    }

    #[test]
    fn only_drain_or_interruption_returns_speaking_to_listening() {
        for trigger in ALL_TRIGGERS {
            let mut m = machine_in(SessionState::Speaking);
            let to = m.apply(trigger).map(|t| t.to);
            let expected = matches!(trigger, Trigger::PlaybackDrained | Trigger::Interrupted);
            assert_eq!(to == Some(SessionState::Listening), expected, "{trigger:?}");
        }
    }

    #[test]
    fn close_error_and_stop_reach_idle_from_every_state() {
        for state in ALL_STATES {
            for trigger in [
                Trigger::TransportClosed,
                Trigger::Failed,
                Trigger::StopRequested,
            ] {
                let mut m = machine_in(state);
                m.apply(trigger);
                assert_eq!(m.state(), SessionState::Idle, "{state:?} + {trigger:?}");
            }
        }
    }

    #[test]
    fn interruption_in_listening_is_a_self_transition() {
        let mut m = machine_in(SessionState::Listening);
        let t = m.apply(Trigger::Interrupted).expect("transition");
        assert_eq!((t.from, t.to), (SessionState::Listening, SessionState::Listening));
        assert_eq!(t.feedback.haptic, HapticPattern::Interrupted);
    }

    #[test]
    fn inapplicable_triggers_leave_state_untouched() {
        let cases = [
            (SessionState::Idle, Trigger::TransportOpened),
            (SessionState::Idle, Trigger::AudioReceived),
            (SessionState::Connecting, Trigger::AudioReceived),
            (SessionState::Connecting, Trigger::Interrupted),
            (SessionState::Connecting, Trigger::StartRequested),
            (SessionState::Listening, Trigger::PlaybackDrained),
            (SessionState::Speaking, Trigger::AudioReceived),
            (SessionState::Speaking, Trigger::TransportOpened),
        ];
        for (state, trigger) in cases {
            let mut m = machine_in(state);
            assert!(m.apply(trigger).is_none(), "{state:?} + {trigger:?}");
            assert_eq!(m.state(), state);
        }
    }

    #[test]
    fn every_transition_kind_has_its_own_haptic_pattern() {
        let mut seen = HashSet::new();
        for state in ALL_STATES {
            for trigger in ALL_TRIGGERS {
                if let Some(t) = machine_in(state).apply(trigger) {
                    seen.insert((trigger, t.feedback.haptic));
                }
            }
        }
        let patterns: HashSet<_> = seen.iter().map(|(_, h)| h.pulses()).collect();
        let triggers: HashSet<_> = seen.iter().map(|(t, _)| *t).collect();
        assert_eq!(patterns.len(), triggers.len());
    }

    #[test]
    fn visual_cue_follows_target_state() {
        let speaking = VisualCue::for_state(SessionState::Speaking);
        assert_eq!(speaking.accent, Accent::Green);
        assert_eq!(speaking.icon, Icon::VolumeHigh);
        assert!(speaking.animated);

        let idle = VisualCue::for_state(SessionState::Idle);
        assert_eq!(idle.accent, Accent::Slate);
        assert!(!idle.animated);
        assert_eq!(idle.caption, "Connect for secure technical assistance.");

        let json = serde_json::to_value(VisualCue::for_state(SessionState::Listening)).unwrap();
        assert_eq!(json["accent"], "blue");
        assert_eq!(json["icon"], "microphone");
    }
}
