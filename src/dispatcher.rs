//! Reply dispatcher and completion poller
//!
//! [`dispatch`] is the single place where an inbound payload changes the
//! sequence. It never performs I/O; the session carries out the returned
//! [`Action`].

use crate::pipeline::{PipelineState, Step};
use crate::protocol::{self, Reply};

/// What the dispatcher expects the next payload to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    ExpectingDeviceList,
    ExpectingRateList,
    ExpectingCommandResponse,
    ExpectingProcessingPoll,
}

impl Phase {
    /// Whether a command is outstanding in this phase
    pub fn is_busy(&self) -> bool {
        !matches!(self, Phase::Idle)
    }

    pub fn expects_list(&self) -> bool {
        matches!(self, Phase::ExpectingDeviceList | Phase::ExpectingRateList)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Devices,
    SampleRates,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Payload arrived with nothing outstanding
    Ignore,
    /// Run the pending step now
    Invoke(Step),
    /// Ask for processing status immediately
    Poll,
    /// Ask for processing status again after the poll interval
    PollLater,
    /// Device rejected the command; the sequence stops here
    Halt(String),
    /// Acknowledged with no step pending
    Finished,
    Populate(ListKind, Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub phase: Phase,
    pub state: PipelineState,
    pub action: Action,
}

fn halted(payload: &str) -> Transition {
    Transition {
        phase: Phase::Idle,
        state: PipelineState::default(),
        action: Action::Halt(protocol::normalize(payload).to_string()),
    }
}

fn resume(mut state: PipelineState) -> Transition {
    match state.continuation.take() {
        Some(step) => Transition {
            phase: Phase::ExpectingCommandResponse,
            state,
            action: Action::Invoke(step),
        },
        None => Transition {
            phase: Phase::Idle,
            state,
            action: Action::Finished,
        },
    }
}

/// Route one inbound payload according to the current phase.
///
/// A `NAK` halts the sequence only as the answer to a command or list
/// request. While polling for completion, any reply without the completion
/// marker, `NAK` included, schedules another poll.
pub fn dispatch(phase: Phase, state: PipelineState, payload: &str) -> Transition {
    let reply = protocol::classify(payload);

    match phase {
        Phase::Idle => Transition {
            phase,
            state,
            action: Action::Ignore,
        },
        Phase::ExpectingDeviceList | Phase::ExpectingRateList => {
            if reply == Reply::Nak {
                return halted(payload);
            }
            let kind = if phase == Phase::ExpectingDeviceList {
                ListKind::Devices
            } else {
                ListKind::SampleRates
            };
            Transition {
                phase: Phase::Idle,
                state,
                action: Action::Populate(kind, protocol::parse_list(payload)),
            }
        }
        Phase::ExpectingCommandResponse => {
            if reply == Reply::Nak {
                return halted(payload);
            }
            if state.await_completion {
                Transition {
                    phase: Phase::ExpectingProcessingPoll,
                    state,
                    action: Action::Poll,
                }
            } else {
                resume(state)
            }
        }
        Phase::ExpectingProcessingPoll => match reply {
            Reply::Nak | Reply::Ack => Transition {
                phase,
                state,
                action: Action::PollLater,
            },
            Reply::Complete => {
                let mut state = state;
                state.await_completion = false;
                resume(state)
            }
        },
    }
}
