//! Question/answer coordination
//!
//! Bridges a poll loop blocked on a backend question and the out-of-band
//! path that delivers the user's answer. State is kept per base session key
//! so sessions never contend with each other.
//!
//! Guarantees:
//! - the waiting loop is woken on every exit path of a submission, including
//!   a failed or abandoned one;
//! - once a question has timed out, answers for it are ignored and can never
//!   wake a loop.

use crate::backend::{AgentBackend, BackendQuestion, QuestionOption, TurnHandle};
use crate::error::{RemoteError, Result};
use crate::identity::AnswerChoice;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Default time a question may wait for an answer (30 minutes).
pub const DEFAULT_QUESTION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// An interactive question waiting for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuestion {
    pub base_key: String,
    /// Id of the tool call that asked; doubles as the correlation id
    pub call_id: String,
    pub text: String,
    pub options: Vec<QuestionOption>,
    /// Unix millis
    pub created_at: i64,
    /// Unix millis
    pub deadline: i64,
}

impl PendingQuestion {
    /// Answer text for a selection: 1-based option index or free text.
    pub fn resolve_choice(&self, choice: &AnswerChoice) -> Option<String> {
        match choice {
            AnswerChoice::Option(index) => index
                .checked_sub(1)
                .and_then(|i| self.options.get(i))
                .map(|o| o.label.clone()),
            AnswerChoice::Text(text) => {
                let text = text.trim();
                (!text.is_empty()).then(|| text.to_string())
            }
        }
    }
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Answered,
    TimedOut,
    Cancelled,
    SubmissionFailed(String),
}

/// Why an answer was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The question already timed out
    TimedOut,
    /// No live question with that correlation id
    NotPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Delivered,
    Ignored(IgnoreReason),
}

struct AnswerTarget {
    backend: Arc<dyn AgentBackend>,
    turn: TurnHandle,
}

#[derive(Default)]
struct QuestionSlot {
    pending: Option<PendingQuestion>,
    waker: Option<oneshot::Sender<WaitOutcome>>,
    target: Option<AnswerTarget>,
    timed_out: HashSet<String>,
    seen: HashSet<String>,
}

/// Handle returned by [`QuestionCoordinator::register`]
pub struct Waiter {
    base_key: String,
    call_id: String,
    rx: oneshot::Receiver<WaitOutcome>,
}

/// Sends the wait outcome when dropped, whatever happened before.
struct WakeGuard {
    tx: Option<oneshot::Sender<WaitOutcome>>,
    outcome: WaitOutcome,
}

impl WakeGuard {
    fn new(tx: Option<oneshot::Sender<WaitOutcome>>) -> Self {
        Self {
            tx,
            outcome: WaitOutcome::SubmissionFailed("answer submission was abandoned".to_string()),
        }
    }

    fn set(&mut self, outcome: WaitOutcome) {
        self.outcome = outcome;
    }
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let outcome = std::mem::replace(&mut self.outcome, WaitOutcome::Cancelled);
            // receiver gone means the loop already ended
            let _ = tx.send(outcome);
        }
    }
}

/// Per-session wait primitive plus seen/timed-out bookkeeping
pub struct QuestionCoordinator {
    /// DashMap for per-key locking
    slots: DashMap<String, QuestionSlot>,
    timeout: Duration,
}

impl Default for QuestionCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_QUESTION_TIMEOUT)
    }
}

impl QuestionCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reset per-turn dedup state. Timed-out call ids are kept.
    pub fn begin_turn(&self, base_key: &str) {
        let mut slot = self.slots.entry(base_key.to_string()).or_default();
        slot.seen.clear();
    }

    /// Record an event id; `true` if it had not been seen this turn.
    pub fn mark_seen(&self, base_key: &str, id: &str) -> bool {
        let mut slot = self.slots.entry(base_key.to_string()).or_default();
        slot.seen.insert(id.to_string())
    }

    pub fn is_timed_out(&self, base_key: &str, call_id: &str) -> bool {
        self.slots
            .get(base_key)
            .map(|s| s.timed_out.contains(call_id))
            .unwrap_or(false)
    }

    pub fn pending(&self, base_key: &str) -> Option<PendingQuestion> {
        self.slots.get(base_key).and_then(|s| s.pending.clone())
    }

    /// Record a question as pending and arm the wait primitive.
    pub fn register(
        &self,
        base_key: &str,
        question: &BackendQuestion,
        backend: Arc<dyn AgentBackend>,
        turn: TurnHandle,
    ) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let now = chrono::Utc::now().timestamp_millis();
        let pending = PendingQuestion {
            base_key: base_key.to_string(),
            call_id: question.call_id.clone(),
            text: question.text.clone(),
            options: question.options.clone(),
            created_at: now,
            deadline: now + self.timeout.as_millis() as i64,
        };

        let mut slot = self.slots.entry(base_key.to_string()).or_default();
        if let Some(previous) = &slot.pending {
            tracing::warn!(
                session_key = %base_key,
                previous = %previous.call_id,
                call_id = %question.call_id,
                "Replacing pending question"
            );
        }
        slot.pending = Some(pending);
        slot.waker = Some(tx);
        slot.target = Some(AnswerTarget { backend, turn });
        tracing::info!(session_key = %base_key, call_id = %question.call_id, "Awaiting answer");

        Waiter {
            base_key: base_key.to_string(),
            call_id: question.call_id.clone(),
            rx,
        }
    }

    /// Block until the question is answered, times out, or `cancel` fires.
    pub async fn wait(&self, waiter: Waiter, cancel: &CancellationToken) -> WaitOutcome {
        let Waiter {
            base_key,
            call_id,
            mut rx,
        } = waiter;

        let raced = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.timeout, &mut rx) => Some(result),
        };

        match raced {
            None => {
                self.abandon(&base_key, &call_id);
                WaitOutcome::Cancelled
            }
            Some(Ok(Ok(outcome))) => outcome,
            // sender dropped without a verdict: slot cleared or replaced
            Some(Ok(Err(_))) => WaitOutcome::Cancelled,
            Some(Err(_)) => self.expire(&base_key, &call_id, rx).await,
        }
    }

    async fn expire(
        &self,
        base_key: &str,
        call_id: &str,
        rx: oneshot::Receiver<WaitOutcome>,
    ) -> WaitOutcome {
        let claimed_by_submission = {
            let mut slot = self.slots.entry(base_key.to_string()).or_default();
            let ours = slot.pending.as_ref().is_some_and(|p| p.call_id == call_id);
            if ours && slot.waker.is_some() {
                slot.pending = None;
                slot.waker = None;
                slot.target = None;
                slot.timed_out.insert(call_id.to_string());
                false
            } else {
                true
            }
        };

        if !claimed_by_submission {
            tracing::warn!(session_key = %base_key, call_id, "Question timed out");
            return WaitOutcome::TimedOut;
        }

        // A submission took the waker right at the deadline; its guard always
        // sends, so this resolves once the backend call returns.
        rx.await.unwrap_or(WaitOutcome::TimedOut)
    }

    fn abandon(&self, base_key: &str, call_id: &str) {
        if let Some(mut slot) = self.slots.get_mut(base_key) {
            if slot.pending.as_ref().is_some_and(|p| p.call_id == call_id) {
                slot.pending = None;
                slot.waker = None;
                slot.target = None;
            }
        }
    }

    /// Deliver an answer to the backend and wake the waiting loop.
    ///
    /// Answers for timed-out or unknown questions are ignored. On backend
    /// failure the loop is still woken (with `SubmissionFailed`) and the
    /// error is returned.
    pub async fn submit_answer(
        &self,
        base_key: &str,
        call_id: &str,
        answer: &str,
    ) -> Result<SubmitOutcome> {
        let (waker, target) = {
            let Some(mut slot) = self.slots.get_mut(base_key) else {
                return Ok(SubmitOutcome::Ignored(IgnoreReason::NotPending));
            };
            if slot.timed_out.contains(call_id) {
                tracing::debug!(session_key = %base_key, call_id, "Ignoring answer after timeout");
                return Ok(SubmitOutcome::Ignored(IgnoreReason::TimedOut));
            }
            if !slot.pending.as_ref().is_some_and(|p| p.call_id == call_id) {
                return Ok(SubmitOutcome::Ignored(IgnoreReason::NotPending));
            }
            slot.pending = None;
            (slot.waker.take(), slot.target.take())
        };

        let mut guard = WakeGuard::new(waker);
        let Some(target) = target else {
            guard.set(WaitOutcome::SubmissionFailed("no backend bound to question".into()));
            return Err(RemoteError::SubmissionFailure {
                call_id: call_id.to_string(),
                reason: "no backend bound to question".to_string(),
            });
        };

        match target.backend.submit_answer(&target.turn, call_id, answer).await {
            Ok(()) => {
                guard.set(WaitOutcome::Answered);
                tracing::info!(session_key = %base_key, call_id, "Answer delivered");
                Ok(SubmitOutcome::Delivered)
            }
            Err(e) => {
                let reason = match e {
                    RemoteError::SubmissionFailure { reason, .. } => reason,
                    other => other.to_string(),
                };
                guard.set(WaitOutcome::SubmissionFailed(reason.clone()));
                tracing::warn!(session_key = %base_key, call_id, error = %reason, "Answer submission failed");
                Err(RemoteError::SubmissionFailure {
                    call_id: call_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Drop any live question for a key, waking its loop as cancelled.
    pub fn clear(&self, base_key: &str) {
        if let Some(mut slot) = self.slots.get_mut(base_key) {
            slot.pending = None;
            slot.target = None;
            if let Some(tx) = slot.waker.take() {
                let _ = tx.send(WaitOutcome::Cancelled);
            }
        }
    }

    /// Forget everything about a key, timed-out ids included.
    pub fn forget(&self, base_key: &str) {
        self.clear(base_key);
        self.slots.remove(base_key);
    }
}
