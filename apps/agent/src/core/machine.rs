use std::fmt::Debug;
use std::time::Duration;

use thiserror::Error;

/// Fixed retry delay for transport-level failures inside reconcilers.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Retry delay for event-source probing.
pub const PROBE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A reconciler state. Every state declares the exact set of states it may
/// move to; anything else is a programming fault.
pub trait Phase: Copy + Eq + Debug + Send + 'static {
    fn successors(self) -> &'static [Self];
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionFault {
    pub from: String,
    pub to: String,
}

/// Guarded state holder shared by all reconcilers.
pub struct Machine<S: Phase> {
    current: S,
}

impl<S: Phase> Machine<S> {
    pub fn new(initial: S) -> Self {
        Self { current: initial }
    }

    pub fn state(&self) -> S {
        self.current
    }

    /// Move to `to`, which must be a declared successor of the current
    /// state. The caller halts the reconciler on `TransitionFault`; the
    /// machine itself stays where it was.
    pub fn advance(&mut self, to: S) -> Result<(), TransitionFault> {
        if self.current.successors().contains(&to) {
            self.current = to;
            Ok(())
        } else {
            Err(TransitionFault {
                from: format!("{:?}", self.current),
                to: format!("{to:?}"),
            })
        }
    }
}
