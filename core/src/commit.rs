//! Commit offset computation
//!
//! [`CommitPolicy`] decides, from a handler result, whether a record counts as
//! acknowledged and which offset to mark for it. [`CommitState`] holds the highest
//! offset marked for one partition and refuses to move backwards.

use crate::config::{ExplicitAckMode, TriggerConfig};
use crate::error::TriggerError;
use crate::event::{Offset, Response};
use crate::Result;
use std::sync::atomic::{AtomicI64, Ordering};

/// Outcome of one submission, as seen by the commit path
#[derive(Debug)]
pub enum Completion {
    /// Processed and acknowledged
    Acked(Response),
    /// Processed, but acknowledgment is deferred to an explicit ack
    NotAcked(Response),
    /// The invocation failed
    Failed(TriggerError),
}

impl Completion {
    pub fn is_acked(&self) -> bool {
        matches!(self, Self::Acked(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    mode: ExplicitAckMode,
    window: u64,
}

impl CommitPolicy {
    pub fn new(mode: ExplicitAckMode, window: u64) -> Self {
        Self { mode, window }
    }

    pub fn from_config(config: &TriggerConfig) -> Self {
        Self::new(config.explicit_ack_mode, config.ack_window_size)
    }

    pub fn mode(&self) -> ExplicitAckMode {
        self.mode
    }

    /// Turn a handler result into a commit outcome
    pub fn classify(&self, result: Result<Response>) -> Completion {
        match (self.mode, result) {
            (_, Err(e)) => Completion::Failed(e),
            (ExplicitAckMode::Disable, Ok(response)) => Completion::Acked(response),
            (ExplicitAckMode::Enable, Ok(response)) if response.is_no_ack() => {
                Completion::NotAcked(response)
            }
            (ExplicitAckMode::Enable, Ok(response)) => Completion::Acked(response),
            (ExplicitAckMode::ExplicitOnly, Ok(response)) => Completion::NotAcked(response),
        }
    }

    /// Offset to mark once the record at `offset` completed, if any.
    ///
    /// The ack window only lags commits in `Disable` mode. A window larger than the
    /// offset yields nothing to mark.
    pub fn offset_to_mark(&self, offset: Offset, completion: &Completion) -> Option<Offset> {
        if !completion.is_acked() {
            return None;
        }

        let next = offset.checked_add(1)?;
        let mark = match self.mode {
            ExplicitAckMode::Disable => next.checked_sub(i64::try_from(self.window).ok()?)?,
            ExplicitAckMode::Enable => next,
            ExplicitAckMode::ExplicitOnly => return None,
        };

        (mark >= 0).then_some(mark)
    }

    /// Offset to mark for an explicit ack of `offset`
    pub fn offset_for_ack(&self, offset: Offset) -> Option<Offset> {
        let mark = offset.checked_add(1)?;
        (mark >= 0).then_some(mark)
    }
}

/// Highest offset marked for one partition
#[derive(Debug)]
pub struct CommitState {
    marked: AtomicI64,
}

impl Default for CommitState {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitState {
    pub fn new() -> Self {
        Self {
            marked: AtomicI64::new(-1),
        }
    }

    /// State of a claim that starts at `offset`, which counts as already marked
    pub fn starting_at(offset: Offset) -> Self {
        Self {
            marked: AtomicI64::new(offset.max(-1)),
        }
    }

    /// Record `offset` as marked. Returns false, leaving the state untouched, when
    /// `offset` does not move past what is already marked.
    pub fn advance(&self, offset: Offset) -> bool {
        if offset < 0 {
            return false;
        }
        self.marked.fetch_max(offset, Ordering::SeqCst) < offset
    }

    pub fn current(&self) -> Option<Offset> {
        let marked = self.marked.load(Ordering::SeqCst);
        (marked >= 0).then_some(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_disable_mode_with_window() {
        let policy = CommitPolicy::new(ExplicitAckMode::Disable, 5);
        let completion = policy.classify(Ok(Response::ok("done")));
        assert_eq!(policy.offset_to_mark(100, &completion), Some(96));

        // nothing to mark until the window has been filled
        assert_eq!(policy.offset_to_mark(2, &completion), None);
        assert_eq!(policy.offset_to_mark(4, &completion), Some(0));
    }

    #[test]
    fn test_disable_mode_ignores_no_ack() {
        let policy = CommitPolicy::new(ExplicitAckMode::Disable, 0);
        let completion = policy.classify(Ok(Response::ok("").ensure_no_ack()));
        assert_eq!(policy.offset_to_mark(10, &completion), Some(11));
    }

    #[test]
    fn test_enable_mode_honors_no_ack() {
        let policy = CommitPolicy::new(ExplicitAckMode::Enable, 3);

        let acked = policy.classify(Ok(Response::ok("")));
        assert_eq!(policy.offset_to_mark(10, &acked), Some(11));

        let deferred = policy.classify(Ok(Response::ok("").ensure_no_ack()));
        assert!(matches!(deferred, Completion::NotAcked(_)));
        assert_eq!(policy.offset_to_mark(10, &deferred), None);
    }

    #[test]
    fn test_explicit_only_never_commits_on_completion() {
        let policy = CommitPolicy::new(ExplicitAckMode::ExplicitOnly, 0);
        let completion = policy.classify(Ok(Response::ok("")));
        assert_eq!(policy.offset_to_mark(50, &completion), None);
        assert_eq!(policy.offset_for_ack(50), Some(51));
    }

    #[test]
    fn test_failure_never_commits() {
        for mode in [
            ExplicitAckMode::Disable,
            ExplicitAckMode::Enable,
            ExplicitAckMode::ExplicitOnly,
        ] {
            let policy = CommitPolicy::new(mode, 0);
            let completion = policy.classify(Err(TriggerError::processing("boom")));
            assert_eq!(policy.offset_to_mark(7, &completion), None);
        }
    }

    #[test]
    fn test_commit_state_never_regresses() {
        let state = CommitState::new();
        assert_eq!(state.current(), None);

        assert!(state.advance(10));
        assert!(!state.advance(10));
        assert!(!state.advance(4));
        assert!(!state.advance(-3));
        assert_eq!(state.current(), Some(10));

        assert!(state.advance(11));
        assert_eq!(state.current(), Some(11));
    }

    #[test]
    fn test_commit_state_starting_at_claim_offset() {
        let state = CommitState::starting_at(96);
        assert_eq!(state.current(), Some(96));
        assert!(!state.advance(92));
        assert!(!state.advance(96));
        assert!(state.advance(97));

        assert_eq!(CommitState::starting_at(-1).current(), None);
    }

    proptest! {
        #[test]
        fn prop_commit_state_is_monotonic(offsets in prop::collection::vec(-10i64..10_000, 1..200)) {
            let state = CommitState::new();
            let mut highest: Option<Offset> = None;

            for offset in offsets {
                let before = state.current();
                let advanced = state.advance(offset);
                let after = state.current();

                prop_assert!(after >= before);
                prop_assert_eq!(advanced, after != before);

                if offset >= 0 {
                    highest = Some(highest.map_or(offset, |h| h.max(offset)));
                }
                prop_assert_eq!(after, highest);
            }
        }
    }
}
