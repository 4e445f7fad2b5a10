//! Reveal gate for face-locked messages.
//!
//! `Locked → Verifying → Unlocked | Failed`, `Failed → Verifying` on retry.
//! `Unlocked` is terminal. The gate never verifies anything itself; it only
//! tracks which message is waiting on the external verification call.

use serde::Serialize;
use std::collections::HashMap;

use super::chat_types::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LockState {
    Locked,
    Verifying,
    Unlocked,
    Failed,
}

impl LockState {
    /// `Failed` is shown exactly like `Locked` so the user can retry.
    pub fn presents_locked(self) -> bool {
        matches!(self, Self::Locked | Self::Failed)
    }
}

/// Result of a user asking to unlock a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockRequest {
    /// Caller must start exactly one verification call.
    Started,
    /// A call is already in flight; this request is dropped.
    AlreadyVerifying,
    AlreadyUnlocked,
    /// The message is not face-locked (or unknown).
    NotLocked,
}

/// Result of feeding a verification result back into the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Unlocked,
    Failed,
    /// No verification was pending for this message.
    Ignored,
}

#[derive(Debug, Default)]
pub struct LockGate {
    states: HashMap<MessageId, LockState>,
}

impl LockGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a flagged message as `Locked`. Returns false if it was
    /// already tracked, in which case its state is left alone.
    pub fn track(&mut self, id: MessageId) -> bool {
        if self.states.contains_key(&id) {
            return false;
        }
        self.states.insert(id, LockState::Locked);
        true
    }

    pub fn request(&mut self, id: &MessageId) -> UnlockRequest {
        match self.states.get_mut(id) {
            None => UnlockRequest::NotLocked,
            Some(LockState::Verifying) => {
                log::debug!("Unlock of {} already in progress", id);
                UnlockRequest::AlreadyVerifying
            }
            Some(LockState::Unlocked) => UnlockRequest::AlreadyUnlocked,
            Some(state) => {
                *state = LockState::Verifying;
                log::info!("Verifying face to unlock message {}", id);
                UnlockRequest::Started
            }
        }
    }

    pub fn complete(&mut self, id: &MessageId, verified: bool) -> VerificationOutcome {
        match self.states.get_mut(id) {
            Some(state) if *state == LockState::Verifying => {
                if verified {
                    *state = LockState::Unlocked;
                    log::info!("Message {} unlocked", id);
                    VerificationOutcome::Unlocked
                } else {
                    *state = LockState::Failed;
                    log::warn!("Face verification failed for message {}", id);
                    VerificationOutcome::Failed
                }
            }
            _ => VerificationOutcome::Ignored,
        }
    }

    pub fn state(&self, id: &MessageId) -> Option<LockState> {
        self.states.get(id).copied()
    }

    pub fn verifying_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == LockState::Verifying)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> MessageId {
        MessageId::from(n)
    }

    #[test]
    fn test_success_path() {
        let mut gate = LockGate::new();
        assert!(gate.track(id(1)));
        assert_eq!(gate.state(&id(1)), Some(LockState::Locked));
        assert_eq!(gate.request(&id(1)), UnlockRequest::Started);
        assert_eq!(gate.state(&id(1)), Some(LockState::Verifying));
        assert_eq!(gate.complete(&id(1), true), VerificationOutcome::Unlocked);
        assert_eq!(gate.state(&id(1)), Some(LockState::Unlocked));
    }

    #[test]
    fn test_failure_allows_retry() {
        let mut gate = LockGate::new();
        gate.track(id(1));
        gate.request(&id(1));
        assert_eq!(gate.complete(&id(1), false), VerificationOutcome::Failed);
        let state = gate.state(&id(1)).unwrap();
        assert_eq!(state, LockState::Failed);
        assert!(state.presents_locked());
        assert_eq!(gate.request(&id(1)), UnlockRequest::Started);
        assert_eq!(gate.complete(&id(1), true), VerificationOutcome::Unlocked);
    }

    #[test]
    fn test_duplicate_requests_coalesce() {
        let mut gate = LockGate::new();
        gate.track(id(1));
        assert_eq!(gate.request(&id(1)), UnlockRequest::Started);
        assert_eq!(gate.request(&id(1)), UnlockRequest::AlreadyVerifying);
        assert_eq!(gate.request(&id(1)), UnlockRequest::AlreadyVerifying);
        assert_eq!(gate.verifying_count(), 1);
    }

    #[test]
    fn test_unlocked_is_terminal() {
        let mut gate = LockGate::new();
        gate.track(id(1));
        gate.request(&id(1));
        gate.complete(&id(1), true);
        assert_eq!(gate.request(&id(1)), UnlockRequest::AlreadyUnlocked);
        assert_eq!(gate.complete(&id(1), false), VerificationOutcome::Ignored);
        assert!(!gate.track(id(1)));
        assert_eq!(gate.state(&id(1)), Some(LockState::Unlocked));
    }

    #[test]
    fn test_result_without_pending_request_ignored() {
        let mut gate = LockGate::new();
        gate.track(id(1));
        assert_eq!(gate.complete(&id(1), true), VerificationOutcome::Ignored);
        assert_eq!(gate.state(&id(1)), Some(LockState::Locked));
        assert_eq!(gate.complete(&id(2), true), VerificationOutcome::Ignored);
    }

    #[test]
    fn test_untracked_message_not_locked() {
        let mut gate = LockGate::new();
        assert_eq!(gate.request(&id(3)), UnlockRequest::NotLocked);
        assert!(gate.state(&id(3)).is_none());
    }
}
