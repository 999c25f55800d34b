//! State machine for the wake word service
//!
//! This module implements the core state machine using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute. Commands that are not
//! allowed in the current state are rejected with a [`ServiceError`] and leave
//! the state untouched.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detector::DetectorConfig;
use crate::error::ServiceError;

/// Internal state of the service.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Stopped,
    Starting {
        session_id: Uuid,
        detector: DetectorConfig,
    },
    Running {
        session_id: Uuid,
        detector: DetectorConfig,
    },
    Paused {
        session_id: Uuid,
        detector: DetectorConfig,
    },
    Stopping {
        session_id: Uuid,
    },
}

/// Plain projection of [`State`] reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl State {
    pub fn phase(&self) -> ServiceState {
        match self {
            State::Stopped => ServiceState::Stopped,
            State::Starting { .. } => ServiceState::Starting,
            State::Running { .. } => ServiceState::Running,
            State::Paused { .. } => ServiceState::Paused,
            State::Stopping { .. } => ServiceState::Stopping,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Stopped => None,
            State::Starting { session_id, .. }
            | State::Running { session_id, .. }
            | State::Paused { session_id, .. }
            | State::Stopping { session_id } => Some(*session_id),
        }
    }

    pub fn detector(&self) -> Option<&DetectorConfig> {
        match self {
            State::Starting { detector, .. }
            | State::Running { detector, .. }
            | State::Paused { detector, .. } => Some(detector),
            State::Stopped | State::Stopping { .. } => None,
        }
    }

    /// A session exists and has not been asked to stop
    pub fn is_running(&self) -> bool {
        matches!(self, State::Running { .. } | State::Paused { .. })
    }

    /// Audio is being forwarded to the detector
    pub fn is_listening(&self) -> bool {
        matches!(self, State::Running { .. })
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Paused => "paused",
            ServiceState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Events that can trigger state transitions.
/// Commands come from callers; completions come from the controller after it
/// has executed an effect.
#[derive(Debug, Clone)]
pub enum Event {
    Start { detector: DetectorConfig },
    Pause,
    Resume,
    Stop,

    // Session lifecycle completions (include id to prevent stale events)
    SessionOpened { id: Uuid },
    SessionFailed { id: Uuid },
    SessionClosed { id: Uuid },
    /// Frame loop exited on its own (the audio source went away)
    SessionEnded { id: Uuid },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenSession { id: Uuid, detector: DetectorConfig },
    SetPaused { id: Uuid, paused: bool },
    CloseSession { id: Uuid },
}

pub type Transition = (State, Vec<Effect>);

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore completions with stale session IDs
/// - Rejected commands return an error and no effects
pub fn reduce(state: &State, event: Event) -> Result<Transition, ServiceError> {
    use Effect::*;
    use Event::*;
    use State::*;

    let transition = match (state, event) {
        // -----------------
        // Commands
        // -----------------
        (Stopped, Start { detector }) => {
            let id = Uuid::new_v4();
            (
                Starting {
                    session_id: id,
                    detector: detector.clone(),
                },
                vec![OpenSession { id, detector }],
            )
        }
        (_, Start { .. }) => return Err(ServiceError::AlreadyRunning),

        (
            Running {
                session_id,
                detector,
            },
            Pause,
        ) => (
            Paused {
                session_id: *session_id,
                detector: detector.clone(),
            },
            vec![SetPaused {
                id: *session_id,
                paused: true,
            }],
        ),
        (Paused { .. }, Pause) => (state.clone(), vec![]),

        (
            Paused {
                session_id,
                detector,
            },
            Resume,
        ) => (
            Running {
                session_id: *session_id,
                detector: detector.clone(),
            },
            vec![SetPaused {
                id: *session_id,
                paused: false,
            }],
        ),
        (Running { .. }, Resume) => (state.clone(), vec![]),

        (Stopped | Starting { .. } | Stopping { .. }, Pause | Resume) => {
            return Err(ServiceError::NoActiveSession)
        }

        (Running { session_id, .. } | Paused { session_id, .. }, Stop) => (
            Stopping {
                session_id: *session_id,
            },
            vec![CloseSession { id: *session_id }],
        ),
        // Session not open yet: it is closed as soon as the open completes
        (Starting { session_id, .. }, Stop) => (
            Stopping {
                session_id: *session_id,
            },
            vec![],
        ),
        (Stopped | Stopping { .. }, Stop) => (state.clone(), vec![]),

        // -----------------
        // Completions
        // -----------------
        (
            Starting {
                session_id,
                detector,
            },
            SessionOpened { id },
        ) if *session_id == id => (
            Running {
                session_id: id,
                detector: detector.clone(),
            },
            vec![],
        ),
        (Starting { session_id, .. }, SessionFailed { id }) if *session_id == id => {
            (Stopped, vec![])
        }

        (Stopping { session_id }, SessionOpened { id }) if *session_id == id => {
            (state.clone(), vec![CloseSession { id }])
        }
        (Stopping { session_id }, SessionFailed { id } | SessionClosed { id })
            if *session_id == id =>
        {
            (Stopped, vec![])
        }

        // Audio source died under a live session: release it and stop
        (
            Running { session_id, .. } | Paused { session_id, .. },
            SessionEnded { id },
        ) if *session_id == id => (
            Stopping { session_id: id },
            vec![CloseSession { id }],
        ),

        // Stale or out-of-phase completions are ignored
        (
            _,
            SessionOpened { .. }
            | SessionFailed { .. }
            | SessionClosed { .. }
            | SessionEnded { .. },
        ) => (state.clone(), vec![]),
    };

    Ok(transition)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp() -> DetectorConfig {
        DetectorConfig::Udp {
            address: "10.0.0.5".to_string(),
            port: 5555,
        }
    }

    fn running(id: Uuid) -> State {
        State::Running {
            session_id: id,
            detector: udp(),
        }
    }

    fn start(state: &State) -> (Uuid, State) {
        let (next, effects) = reduce(state, Event::Start { detector: udp() }).unwrap();
        let id = next.session_id().unwrap();
        assert_eq!(effects, vec![Effect::OpenSession { id, detector: udp() }]);
        (id, next)
    }

    #[test]
    fn test_start_opens_session() {
        let (id, state) = start(&State::Stopped);
        assert_eq!(state.phase(), ServiceState::Starting);
        assert_eq!(state.detector(), Some(&udp()));

        let (state, effects) = reduce(&state, Event::SessionOpened { id }).unwrap();
        assert_eq!(state, running(id));
        assert!(effects.is_empty());
        assert!(state.is_running());
        assert!(state.is_listening());
    }

    #[test]
    fn test_start_failure_returns_to_stopped() {
        let (id, state) = start(&State::Stopped);
        let (state, effects) = reduce(&state, Event::SessionFailed { id }).unwrap();
        assert_eq!(state, State::Stopped);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_start_rejected_unless_stopped() {
        let id = Uuid::new_v4();
        let states = vec![
            State::Starting {
                session_id: id,
                detector: udp(),
            },
            running(id),
            State::Paused {
                session_id: id,
                detector: udp(),
            },
            State::Stopping { session_id: id },
        ];

        for state in states {
            let err = reduce(&state, Event::Start { detector: udp() }).unwrap_err();
            assert_eq!(err, ServiceError::AlreadyRunning, "from {:?}", state);
        }
    }

    #[test]
    fn test_pause_and_resume() {
        let id = Uuid::new_v4();

        let (paused, effects) = reduce(&running(id), Event::Pause).unwrap();
        assert_eq!(paused.phase(), ServiceState::Paused);
        assert_eq!(effects, vec![Effect::SetPaused { id, paused: true }]);
        assert!(paused.is_running());
        assert!(!paused.is_listening());

        // Pausing twice is harmless
        let (again, effects) = reduce(&paused, Event::Pause).unwrap();
        assert_eq!(again, paused);
        assert!(effects.is_empty());

        let (resumed, effects) = reduce(&paused, Event::Resume).unwrap();
        assert_eq!(resumed, running(id));
        assert_eq!(effects, vec![Effect::SetPaused { id, paused: false }]);

        let (again, effects) = reduce(&resumed, Event::Resume).unwrap();
        assert_eq!(again, resumed);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_pause_without_session() {
        let id = Uuid::new_v4();
        let states = vec![
            State::Stopped,
            State::Starting {
                session_id: id,
                detector: udp(),
            },
            State::Stopping { session_id: id },
        ];

        for state in states {
            assert_eq!(
                reduce(&state, Event::Pause).unwrap_err(),
                ServiceError::NoActiveSession
            );
            assert_eq!(
                reduce(&state, Event::Resume).unwrap_err(),
                ServiceError::NoActiveSession
            );
        }
    }

    #[test]
    fn test_stop_closes_session() {
        let id = Uuid::new_v4();
        let (paused, _) = reduce(&running(id), Event::Pause).unwrap();

        for state in [running(id), paused] {
            let (stopping, effects) = reduce(&state, Event::Stop).unwrap();
            assert_eq!(stopping, State::Stopping { session_id: id });
            assert_eq!(effects, vec![Effect::CloseSession { id }]);
            assert!(!stopping.is_running());

            let (stopped, effects) = reduce(&stopping, Event::SessionClosed { id }).unwrap();
            assert_eq!(stopped, State::Stopped);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let (state, effects) = reduce(&State::Stopped, Event::Stop).unwrap();
        assert_eq!(state, State::Stopped);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_stop_while_starting_closes_after_open() {
        let (id, starting) = start(&State::Stopped);

        let (stopping, effects) = reduce(&starting, Event::Stop).unwrap();
        assert_eq!(stopping, State::Stopping { session_id: id });
        assert!(effects.is_empty());

        let (state, effects) = reduce(&stopping, Event::SessionOpened { id }).unwrap();
        assert_eq!(state, stopping);
        assert_eq!(effects, vec![Effect::CloseSession { id }]);

        let (state, _) = reduce(&state, Event::SessionClosed { id }).unwrap();
        assert_eq!(state, State::Stopped);
    }

    #[test]
    fn test_ended_session_is_closed_and_stopped() {
        let id = Uuid::new_v4();
        let (paused, _) = reduce(&running(id), Event::Pause).unwrap();

        for state in [running(id), paused] {
            let (stopping, effects) = reduce(&state, Event::SessionEnded { id }).unwrap();
            assert_eq!(stopping, State::Stopping { session_id: id });
            assert_eq!(effects, vec![Effect::CloseSession { id }]);
            assert!(!stopping.is_listening());

            let (stopped, _) = reduce(&stopping, Event::SessionClosed { id }).unwrap();
            assert_eq!(stopped, State::Stopped);
        }

        // Already stopping or stopped, or a different session: nothing to do
        let stopping = State::Stopping { session_id: id };
        let (state, effects) = reduce(&stopping, Event::SessionEnded { id }).unwrap();
        assert_eq!(state, stopping);
        assert!(effects.is_empty());

        let (state, effects) =
            reduce(&running(id), Event::SessionEnded { id: Uuid::new_v4() }).unwrap();
        assert_eq!(state, running(id));
        assert!(effects.is_empty());

        let (state, _) = reduce(&State::Stopped, Event::SessionEnded { id }).unwrap();
        assert_eq!(state, State::Stopped);
    }

    #[test]
    fn test_stale_completions_are_ignored() {
        let id = Uuid::new_v4();
        let stale = Uuid::new_v4();

        let (state, effects) = reduce(&running(id), Event::SessionClosed { id: stale }).unwrap();
        assert_eq!(state, running(id));
        assert!(effects.is_empty());

        let (_, starting) = start(&State::Stopped);
        let (state, _) = reduce(&starting, Event::SessionOpened { id: stale }).unwrap();
        assert_eq!(state, starting);

        let (state, _) = reduce(&State::Stopped, Event::SessionOpened { id }).unwrap();
        assert_eq!(state, State::Stopped);
    }

    #[test]
    fn test_service_state_wire_names() {
        assert_eq!(
            serde_json::to_value(ServiceState::Running).unwrap(),
            serde_json::json!("running")
        );
        assert_eq!(ServiceState::Paused.to_string(), "paused");
    }
}
