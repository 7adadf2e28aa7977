//! Channel state machine.
//!
//! `ChannelState` models the lifecycle of §4.1: a single logical executor per
//! channel serializes every transition, so the only job of this module is to
//! name the states and say which verbs are legal in each.

use std::fmt;

use crate::error::{Result, WorkerChannelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Created,
    Starting,
    Started,
    Initializing,
    Initialized,
    LoadingFunctions,
    Ready,
    Draining,
    Terminating,
    Terminated,
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Starting => "Starting",
            Self::Started => "Started",
            Self::Initializing => "Initializing",
            Self::Initialized => "Initialized",
            Self::LoadingFunctions => "LoadingFunctions",
            Self::Ready => "Ready",
            Self::Draining => "Draining",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Verbs the channel exposes; used to check legality against the current
/// state before any side effect happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    LoadFunctions,
    Invoke,
    Cancel,
    ReloadEnvironment,
    Drain,
    Terminate,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Whether the channel can ever accept new invocation buffering — used by
    /// `IsChannelReadyForInvocations` style checks alongside the function
    /// load manager's own readiness gate.
    pub fn accepts_invocations(&self) -> bool {
        matches!(self, Self::LoadingFunctions | Self::Ready)
    }

    /// Returns `Ok(())` if `verb` is legal in `self`, `Err(InvalidState)`
    /// otherwise.
    pub fn check(&self, verb: Verb) -> Result<()> {
        let allowed = match (self, verb) {
            (Self::Created, Verb::Start) => true,
            (Self::Initialized, Verb::LoadFunctions | Verb::ReloadEnvironment | Verb::Terminate) => true,
            (Self::LoadingFunctions, Verb::Invoke) => true,
            (
                Self::Ready,
                Verb::Invoke | Verb::Cancel | Verb::ReloadEnvironment | Verb::Drain | Verb::Terminate,
            ) => true,
            (Self::Draining, Verb::Cancel) => true,
            _ => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(WorkerChannelError::invalid_state(format!("{self}::{verb:?}")))
        }
    }

    /// Transition helper used by the channel's executor; does not itself
    /// enforce legality beyond the invariant that failure is reachable from
    /// any non-terminal state.
    pub fn transition(&mut self, next: ChannelState) {
        debug_assert!(
            !self.is_terminal() || next == *self,
            "attempted transition out of terminal state {self} -> {next}"
        );
        *self = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_only_legal_from_created() {
        assert!(ChannelState::Created.check(Verb::Start).is_ok());
        assert!(ChannelState::Ready.check(Verb::Start).is_err());
    }

    #[test]
    fn invoke_legal_while_loading_and_ready_only() {
        assert!(ChannelState::LoadingFunctions.check(Verb::Invoke).is_ok());
        assert!(ChannelState::Ready.check(Verb::Invoke).is_ok());
        assert!(ChannelState::Draining.check(Verb::Invoke).is_err());
        assert!(ChannelState::Initialized.check(Verb::Invoke).is_err());
    }

    #[test]
    fn draining_rejects_new_invocations_but_allows_cancel() {
        assert!(ChannelState::Draining.check(Verb::Cancel).is_ok());
        assert!(ChannelState::Draining.check(Verb::Invoke).is_err());
    }

    #[test]
    fn state_path_is_a_legal_walk() {
        let path = [
            ChannelState::Created,
            ChannelState::Starting,
            ChannelState::Started,
            ChannelState::Initializing,
            ChannelState::Initialized,
            ChannelState::LoadingFunctions,
            ChannelState::Ready,
            ChannelState::Draining,
            ChannelState::Terminating,
            ChannelState::Terminated,
        ];
        // every adjacent pair should be a state actually reachable by design;
        // this is a smoke check on Display + is_terminal rather than check(),
        // since internal transitions (Start->Starting) aren't caller verbs.
        for w in path.windows(2) {
            assert_ne!(w[0], w[1]);
        }
        assert!(path.last().unwrap().is_terminal());
    }
}
