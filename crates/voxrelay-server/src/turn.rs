//! Who holds the conversational floor.
//!
//! The owner lives in a `watch` channel so the pumps, the diagnostics
//! registry and tests can all observe it. Every transition goes through
//! `send_if_modified`, which serializes concurrent callers: a transition is
//! reported to exactly one of them.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use voxrelay_types::TurnOwner;

/// Inputs to the turn machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// The session went live. The engine always speaks first.
    Activated,
    /// The engine finished its response.
    EngineTurnComplete,
    /// The VAD detected the end of the human's utterance.
    EndOfUtterance,
    /// The client sent a typed utterance.
    ClientText,
    /// The client explicitly stopped listening.
    ClientStopListening,
    /// The session is shutting down. Terminal.
    Teardown,
}

/// A state change reported by [`TurnTaking::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TurnOwner,
    pub to: TurnOwner,
}

fn next_owner(current: TurnOwner, event: TurnEvent) -> Option<TurnOwner> {
    use TurnEvent::*;
    match (current, event) {
        (_, Teardown) => Some(TurnOwner::None),
        (TurnOwner::None, Activated) => Some(TurnOwner::Agent),
        (TurnOwner::Agent, EngineTurnComplete) => Some(TurnOwner::Human),
        (TurnOwner::Human, EndOfUtterance | ClientText | ClientStopListening) => {
            Some(TurnOwner::Agent)
        }
        _ => None,
    }
}

#[derive(Debug)]
pub struct TurnTaking {
    owner: watch::Sender<TurnOwner>,
    ended: AtomicBool,
}

impl Default for TurnTaking {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTaking {
    pub fn new() -> Self {
        let (owner, _) = watch::channel(TurnOwner::None);
        Self {
            owner,
            ended: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> TurnOwner {
        *self.owner.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnOwner> {
        self.owner.subscribe()
    }

    /// Inbound audio is only forwarded while the human holds the floor.
    pub fn admits_audio(&self) -> bool {
        self.current() == TurnOwner::Human
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Feeds one event to the machine. Returns the transition if the owner
    /// changed; `None` means the event was a no-op.
    pub fn apply(&self, event: TurnEvent) -> Option<Transition> {
        let mut transition = None;
        self.owner.send_if_modified(|owner| {
            // The closure runs under the channel's write lock, which also
            // orders access to `ended`.
            if self.ended.load(Ordering::Acquire) {
                return false;
            }
            if event == TurnEvent::Teardown {
                self.ended.store(true, Ordering::Release);
            }
            match next_owner(*owner, event) {
                Some(to) if to != *owner => {
                    transition = Some(Transition { from: *owner, to });
                    *owner = to;
                    true
                }
                _ => false,
            }
        });
        transition
    }

    pub fn activate(&self) -> Option<Transition> {
        self.apply(TurnEvent::Activated)
    }

    pub fn engine_turn_complete(&self) -> Option<Transition> {
        self.apply(TurnEvent::EngineTurnComplete)
    }

    pub fn end_of_utterance(&self) -> Option<Transition> {
        self.apply(TurnEvent::EndOfUtterance)
    }

    pub fn client_text(&self) -> Option<Transition> {
        self.apply(TurnEvent::ClientText)
    }

    pub fn stop_listening(&self) -> Option<Transition> {
        self.apply(TurnEvent::ClientStopListening)
    }

    pub fn teardown(&self) -> Option<Transition> {
        self.apply(TurnEvent::Teardown)
    }
}
