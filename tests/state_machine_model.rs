//! Model check of the service state machine
//!
//! Random command sequences are run through the reducer, completing every
//! effect the way the controller would, and compared against a minimal model
//! of the documented transitions.

use proptest::prelude::*;

use wakeword_lib::detector::DetectorConfig;
use wakeword_lib::state_machine::{reduce, Effect, Event, ServiceState, State};
use wakeword_lib::ServiceError;

#[derive(Debug, Clone)]
enum Op {
    /// Start; `open_fails` makes session setup fail
    Start { open_fails: bool },
    Pause,
    Resume,
    Stop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<bool>().prop_map(|open_fails| Op::Start { open_fails }),
        Just(Op::Pause),
        Just(Op::Resume),
        Just(Op::Stop),
    ]
}

fn detector() -> DetectorConfig {
    DetectorConfig::Udp {
        address: "10.0.0.5".to_string(),
        port: 5555,
    }
}

/// Expected outcome of `op` from a settled `phase`
fn model(phase: ServiceState, op: &Op) -> (ServiceState, Result<(), ServiceError>) {
    use ServiceState::*;
    match (phase, op) {
        (Stopped, Op::Start { open_fails: false }) => (Running, Ok(())),
        (Stopped, Op::Start { open_fails: true }) => (
            Stopped,
            Err(ServiceError::AudioUnavailable(String::new())),
        ),
        (_, Op::Start { .. }) => (phase, Err(ServiceError::AlreadyRunning)),
        (Running | Paused, Op::Pause) => (Paused, Ok(())),
        (Running | Paused, Op::Resume) => (Running, Ok(())),
        (_, Op::Pause | Op::Resume) => (phase, Err(ServiceError::NoActiveSession)),
        (_, Op::Stop) => (Stopped, Ok(())),
    }
}

/// Apply `op` and drive its effects to completion, like the controller does
fn execute(state: &State, op: &Op) -> (State, Result<(), ServiceError>) {
    let (event, open_fails) = match op {
        Op::Start { open_fails } => (
            Event::Start {
                detector: detector(),
            },
            *open_fails,
        ),
        Op::Pause => (Event::Pause, false),
        Op::Resume => (Event::Resume, false),
        Op::Stop => (Event::Stop, false),
    };

    let (mut state, mut pending) = match reduce(state, event) {
        Ok(transition) => transition,
        Err(e) => return (state.clone(), Err(e)),
    };
    let mut outcome = Ok(());

    while let Some(effect) = pending.pop() {
        let completion = match effect {
            Effect::OpenSession { id, .. } if open_fails => {
                outcome = Err(ServiceError::AudioUnavailable(String::new()));
                Event::SessionFailed { id }
            }
            Effect::OpenSession { id, .. } => Event::SessionOpened { id },
            Effect::CloseSession { id } => Event::SessionClosed { id },
            Effect::SetPaused { .. } => continue,
        };
        let (next, effects) = reduce(&state, completion).expect("completions never fail");
        state = next;
        pending.extend(effects);
    }

    (state, outcome)
}

proptest! {
    #[test]
    fn reducer_matches_model(ops in prop::collection::vec(op(), 1..40)) {
        let mut state = State::default();
        let mut phase = ServiceState::Stopped;

        for op in &ops {
            let before = state.clone();
            let (expected_phase, expected) = model(phase, op);
            let (next, outcome) = execute(&state, op);

            prop_assert_eq!(next.phase(), expected_phase, "after {:?}", op);
            prop_assert_eq!(&outcome, &expected, "result of {:?}", op);
            if outcome.is_err() && !matches!(op, Op::Start { open_fails: true }) {
                prop_assert_eq!(&next, &before, "rejected {:?} changed state", op);
            }

            // Queries follow the phase
            prop_assert_eq!(
                next.is_running(),
                matches!(expected_phase, ServiceState::Running | ServiceState::Paused)
            );
            prop_assert_eq!(next.is_listening(), expected_phase == ServiceState::Running);

            state = next;
            phase = expected_phase;
        }
    }

    #[test]
    fn start_never_succeeds_twice_without_stop(ops in prop::collection::vec(op(), 1..40)) {
        let mut state = State::default();
        let mut active = false;

        for op in &ops {
            let (next, outcome) = execute(&state, op);
            match op {
                Op::Start { .. } if outcome.is_ok() => {
                    prop_assert!(!active, "second successful start without stop");
                    active = true;
                }
                Op::Stop => active = false,
                _ => {}
            }
            state = next;
        }
    }
}

#[test]
fn pause_then_resume_is_listening_again() {
    let (state, _) = execute(&State::default(), &Op::Start { open_fails: false });
    let (state, _) = execute(&state, &Op::Pause);
    let (state, _) = execute(&state, &Op::Resume);
    assert!(state.is_running());
    assert!(state.is_listening());

    let (state, result) = execute(&state, &Op::Stop);
    assert_eq!(result, Ok(()));
    assert!(!state.is_running());
    assert!(!state.is_listening());
}
