use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::events::{EventPublisher, SessionEvent};

/// Where a session currently is in the turn state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Idle,
    Scrolling,
    Validating,
    Loading,
    Streaming,
    /// A submission was rejected by the precondition gate.
    Error,
}

impl TurnPhase {
    /// `Error` behaves like `Idle` for the next submission.
    pub fn accepts_submission(self) -> bool {
        matches!(self, TurnPhase::Idle | TurnPhase::Error)
    }
}

/// One question-to-answer cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub question: String,
    pub answer: String,
    /// Set when the answer holds a failure message rather than an agent answer.
    #[serde(default)]
    pub failed: bool,
    pub asked_at: DateTime<Utc>,
}

impl ChatTurn {
    /// A turn whose answer has not started streaming yet.
    pub fn pending(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: String::new(),
            failed: false,
            asked_at: Utc::now(),
        }
    }
}

/// The complete mutable state of one user's chat.
#[derive(Clone, Default)]
pub struct Session {
    pub question: String,
    pub error_message: String,
    pub chat_history: Vec<ChatTurn>,
    pub api_key: String,
    pub uploaded_file_path: Option<PathBuf>,
    pub upload_confirmation: String,
    pub is_answer_loading: bool,
    pub is_error_dialog_open: bool,
    pub phase: TurnPhase,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("question", &self.question)
            .field("error_message", &self.error_message)
            .field("chat_history", &self.chat_history.len())
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .field("uploaded_file_path", &self.uploaded_file_path)
            .field("upload_confirmation", &self.upload_confirmation)
            .field("is_answer_loading", &self.is_answer_loading)
            .field("is_error_dialog_open", &self.is_error_dialog_open)
            .field("phase", &self.phase)
            .finish()
    }
}

/// What the presentation layer is allowed to see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub question: String,
    pub error_message: String,
    pub chat_history: Vec<ChatTurn>,
    pub has_api_key: bool,
    pub uploaded_file_path: Option<String>,
    pub upload_confirmation: String,
    pub is_answer_loading: bool,
    pub is_error_dialog_open: bool,
    pub phase: TurnPhase,
}

/// Per-connection owner of a [`Session`].
///
/// Every mutation goes through the handle so that it can be followed by a
/// publish to subscribers. The lock is never held across an await point.
pub struct SessionHandle {
    id: String,
    created_at: DateTime<Utc>,
    state: Mutex<Session>,
    events: EventPublisher,
    turn_active: AtomicBool,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_publisher(id, EventPublisher::default())
    }

    pub fn with_event_capacity(id: impl Into<String>, capacity: usize) -> Self {
        Self::with_publisher(id, EventPublisher::new(capacity))
    }

    fn with_publisher(id: impl Into<String>, events: EventPublisher) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            state: Mutex::new(Session::default()),
            events,
            turn_active: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate without notifying subscribers.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.lock())
    }

    /// Mutate, then publish the resulting state.
    pub fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let (result, snapshot) = {
            let mut session = self.lock();
            let result = f(&mut session);
            (result, self.snapshot_of(&session))
        };
        self.events
            .publish(SessionEvent::StateChanged { state: snapshot });
        result
    }

    pub fn publish_state(&self) {
        let snapshot = self.snapshot();
        self.events
            .publish(SessionEvent::StateChanged { state: snapshot });
    }

    pub fn emit(&self, event: SessionEvent) {
        self.events.publish(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_of(&self.lock())
    }

    fn snapshot_of(&self, session: &Session) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            question: session.question.clone(),
            error_message: session.error_message.clone(),
            chat_history: session.chat_history.clone(),
            has_api_key: !session.api_key.is_empty(),
            uploaded_file_path: session
                .uploaded_file_path
                .as_ref()
                .map(|path| path.display().to_string()),
            upload_confirmation: session.upload_confirmation.clone(),
            is_answer_loading: session.is_answer_loading,
            is_error_dialog_open: session.is_error_dialog_open,
            phase: session.phase,
        }
    }

    pub fn set_question(&self, question: impl Into<String>) {
        let question = question.into();
        self.update(|s| s.question = question);
    }

    pub fn set_api_key(&self, api_key: impl Into<String>) {
        let api_key = api_key.into();
        self.update(|s| s.api_key = api_key);
    }

    pub fn toggle_error_dialog(&self) -> bool {
        self.update(|s| {
            s.is_error_dialog_open = !s.is_error_dialog_open;
            s.is_error_dialog_open
        })
    }

    pub fn is_turn_active(&self) -> bool {
        self.turn_active.load(Ordering::Acquire)
    }

    /// Claim the session for one turn. Returns `None` while another turn holds it.
    pub fn try_begin_turn(&self) -> Option<TurnPermit<'_>> {
        self.turn_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TurnPermit { handle: self })
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("turn_active", &self.is_turn_active())
            .finish()
    }
}

/// Exclusive right to run a turn; released on drop.
#[derive(Debug)]
pub struct TurnPermit<'a> {
    handle: &'a SessionHandle,
}

impl Drop for TurnPermit<'_> {
    fn drop(&mut self) {
        // A turn cut short before its answer was pending leaves a mid-turn phase behind.
        let interrupted = self.handle.mutate(|s| {
            let stuck = !s.phase.accepts_submission();
            if stuck {
                s.phase = TurnPhase::Idle;
                s.is_answer_loading = false;
            }
            stuck
        });
        if interrupted {
            self.handle.publish_state();
        }
        self.handle.turn_active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_hides_the_credential() {
        let handle = SessionHandle::new("s1");
        handle.set_api_key("sk-secret");

        let snapshot = handle.snapshot();
        assert!(snapshot.has_api_key);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(!format!("{:?}", handle.read(Clone::clone)).contains("sk-secret"));
    }

    #[test]
    fn toggle_flips_the_dialog_flag() {
        let handle = SessionHandle::new("s1");
        assert!(handle.toggle_error_dialog());
        assert!(!handle.toggle_error_dialog());
        assert!(!handle.snapshot().is_error_dialog_open);
    }

    #[test]
    fn only_one_turn_permit_at_a_time() {
        let handle = SessionHandle::new("s1");
        let permit = handle.try_begin_turn();
        assert!(permit.is_some());
        assert!(handle.try_begin_turn().is_none());

        drop(permit);
        assert!(!handle.is_turn_active());
        assert!(handle.try_begin_turn().is_some());
    }

    #[test]
    fn released_permit_resets_an_interrupted_turn() {
        let handle = SessionHandle::new("s1");
        let permit = handle.try_begin_turn().unwrap();
        handle.mutate(|s| {
            s.phase = TurnPhase::Loading;
            s.is_answer_loading = true;
        });
        let mut rx = handle.subscribe();

        drop(permit);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.phase, TurnPhase::Idle);
        assert!(!snapshot.is_answer_loading);
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::StateChanged { .. })));
    }

    #[test]
    fn released_permit_keeps_a_finished_turn() {
        let handle = SessionHandle::new("s1");
        let permit = handle.try_begin_turn().unwrap();
        handle.mutate(|s| s.phase = TurnPhase::Error);
        let mut rx = handle.subscribe();

        drop(permit);

        assert_eq!(handle.snapshot().phase, TurnPhase::Error);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn setters_publish_state_changes() {
        let handle = SessionHandle::new("s1");
        let mut rx = handle.subscribe();

        handle.set_question("how many rows?");

        match rx.recv().await.unwrap() {
            SessionEvent::StateChanged { state } => {
                assert_eq!(state.question, "how many rows?");
                assert_eq!(state.session_id, "s1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn mutate_does_not_publish() {
        let handle = SessionHandle::new("s1");
        let mut rx = handle.subscribe();
        handle.mutate(|s| s.phase = TurnPhase::Scrolling);
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.snapshot().phase, TurnPhase::Scrolling);
    }
}
