//! TurnRunner – drives one chat turn from a submitted question to a fully
//! streamed answer.
//!
//! ```text
//! IDLE -> SCROLLING -> VALIDATING -> LOADING -> STREAMING -> IDLE
//!                          |
//!                          +-> ERROR (behaves like IDLE for the next submission)
//! ```
//!
//! Every step is followed by a publish on the session's event channel and a
//! cooperative yield, so subscribers observe, in this order:
//!
//! 1. `ScrollIntoView`
//! 2. on a rejected submission: one state change carrying `error_message`
//! 3. `is_answer_loading = true`
//! 4. the pending turn `(question, "")` appended to the history
//! 5. `is_answer_loading = false` and the question input cleared
//! 6. one state change per streamed chunk of the answer
//! 7. the session back in `Idle`
//!
//! The agent call is the only slow step. It runs on its own task behind an
//! optional timeout, and the pending turn is owned by a guard: whichever way
//! the turn ends (answer, agent error, panic, or the turn future being
//! dropped) the loading flag is reset and the pending turn is finalised.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    agent::{AgentError, AgentRequest, TableAgent},
    error::{ChatError, Result},
    events::SessionEvent,
    gate::{self, PreconditionError},
    session::{ChatTurn, SessionHandle, TurnPhase},
    storage::SessionStorage,
    streaming::{AnswerChunks, StreamGranularity},
    table::{Table, TableLoadError},
};

pub const INTERRUPTED_MESSAGE: &str = "The answer was interrupted before it completed.";

#[derive(Debug, Clone)]
pub struct TurnSettings {
    /// Pause between streamed chunks; zero only yields to the scheduler.
    pub stream_delay: Duration,
    pub granularity: StreamGranularity,
    /// `None` lets the agent run for as long as it needs.
    pub agent_timeout: Option<Duration>,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            stream_delay: Duration::ZERO,
            granularity: StreamGranularity::Character,
            agent_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// How a single turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Answered { answer: String },
    /// Stopped before any history mutation; `message` is the session's `error_message`.
    Rejected { message: String },
    /// The agent failed; `message` replaced the pending turn's answer.
    Failed { message: String },
}

#[derive(Debug, Error)]
enum Rejection {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("could not read the uploaded csv file: {0}")]
    TableLoad(#[from] TableLoadError),
}

/// Runs turns against sessions held in a [`SessionStorage`].
#[derive(Clone)]
pub struct TurnRunner {
    storage: Arc<dyn SessionStorage>,
    agent: Arc<dyn TableAgent>,
    settings: TurnSettings,
}

impl TurnRunner {
    pub fn new(storage: Arc<dyn SessionStorage>, agent: Arc<dyn TableAgent>) -> Self {
        Self {
            storage,
            agent,
            settings: TurnSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: TurnSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Look the session up and run one turn on it.
    pub async fn run(&self, session_id: &str) -> Result<TurnOutcome> {
        let session = self
            .storage
            .get(session_id)
            .await?
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))?;

        self.run_turn(&session).await
    }

    /// Run one turn on the question already in the session.
    pub async fn run_turn(&self, session: &SessionHandle) -> Result<TurnOutcome> {
        self.submit(session, None).await
    }

    /// Run one turn, replacing the session's question first when `question` is
    /// given. Fails only when another turn already holds the session, in which
    /// case nothing is written; every user-facing problem is reported through
    /// the returned outcome.
    pub async fn submit(
        &self,
        session: &SessionHandle,
        question: Option<String>,
    ) -> Result<TurnOutcome> {
        let _permit = session
            .try_begin_turn()
            .ok_or_else(|| ChatError::TurnInProgress(session.id().to_string()))?;

        if let Some(question) = question {
            session.set_question(question);
        }

        let question = session.read(|s| s.question.clone());
        info!(
            session_id = %session.id(),
            question_len = question.len(),
            "starting turn"
        );

        session.mutate(|s| s.phase = TurnPhase::Scrolling);
        session.emit(SessionEvent::ScrollIntoView);
        tokio::task::yield_now().await;

        session.mutate(|s| {
            s.phase = TurnPhase::Validating;
            s.upload_confirmation.clear();
        });
        let table = match self.validate(session).await {
            Ok(table) => table,
            Err(rejection) => {
                let message = rejection.to_string();
                warn!(session_id = %session.id(), reason = %message, "turn rejected");
                session.update(|s| {
                    s.error_message = message.clone();
                    s.is_error_dialog_open = true;
                    s.phase = TurnPhase::Error;
                });
                return Ok(TurnOutcome::Rejected { message });
            }
        };

        let (api_key, history) = session.update(|s| {
            s.phase = TurnPhase::Loading;
            s.is_answer_loading = true;
            s.error_message.clear();
            let history: Vec<ChatTurn> =
                s.chat_history.iter().filter(|t| !t.failed).cloned().collect();
            (s.api_key.clone(), history)
        });
        tokio::task::yield_now().await;

        let index = session.update(|s| {
            s.chat_history.push(ChatTurn::pending(question.clone()));
            s.chat_history.len() - 1
        });
        let pending = PendingTurn::new(session, index);
        tokio::task::yield_now().await;

        let request = AgentRequest {
            api_key,
            table,
            question,
            history,
        };
        let answer = match self.invoke_agent(request).await {
            Ok(answer) => answer,
            Err(err) => {
                error!(session_id = %session.id(), error = %err, "agent invocation failed");
                let message = format!("Sorry, I could not answer that question: {err}");
                pending.fail(&message);
                return Ok(TurnOutcome::Failed { message });
            }
        };

        session.update(|s| {
            s.phase = TurnPhase::Streaming;
            s.is_answer_loading = false;
            s.question.clear();
        });
        tokio::task::yield_now().await;

        for chunk in AnswerChunks::new(&answer, self.settings.granularity) {
            session.update(|s| {
                if let Some(turn) = s.chat_history.get_mut(index) {
                    turn.answer.push_str(chunk);
                }
            });
            self.pause().await;
        }
        pending.complete();

        info!(
            session_id = %session.id(),
            answer_len = answer.len(),
            "turn completed"
        );
        Ok(TurnOutcome::Answered { answer })
    }

    async fn validate(
        &self,
        session: &SessionHandle,
    ) -> std::result::Result<Arc<Table>, Rejection> {
        let path = session.read(gate::check)?;

        let table = tokio::task::spawn_blocking(move || Table::from_path(&path))
            .await
            .unwrap_or_else(|e| Err(TableLoadError::Interrupted(e.to_string())))?;

        Ok(Arc::new(table))
    }

    async fn invoke_agent(&self, request: AgentRequest) -> std::result::Result<String, AgentError> {
        let agent = Arc::clone(&self.agent);
        let mut call = AbortOnDrop(tokio::spawn(async move { agent.answer(request).await }));

        let joined = match self.settings.agent_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut call.0).await {
                Ok(joined) => joined,
                Err(_) => return Err(AgentError::Timeout(limit)),
            },
            None => (&mut call.0).await,
        };

        joined.map_err(|e| AgentError::Aborted(e.to_string()))?
    }

    async fn pause(&self) {
        if self.settings.stream_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.settings.stream_delay).await;
        }
    }
}

/// Cancels the agent task when the turn stops waiting for it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The turn appended to the history while the agent works.
struct PendingTurn<'a> {
    session: &'a SessionHandle,
    index: usize,
    armed: bool,
}

impl<'a> PendingTurn<'a> {
    fn new(session: &'a SessionHandle, index: usize) -> Self {
        Self {
            session,
            index,
            armed: true,
        }
    }

    fn complete(mut self) {
        self.armed = false;
        self.session.update(|s| s.phase = TurnPhase::Idle);
    }

    fn fail(mut self, message: &str) {
        self.armed = false;
        self.finalize(message);
    }

    fn finalize(&self, message: &str) {
        self.session.update(|s| {
            s.is_answer_loading = false;
            s.question.clear();
            s.phase = TurnPhase::Idle;
            if let Some(turn) = s.chat_history.get_mut(self.index) {
                if turn.answer.is_empty() {
                    turn.answer = message.to_string();
                } else {
                    turn.answer.push('\n');
                    turn.answer.push_str(message);
                }
                turn.failed = true;
            }
        });
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(session_id = %self.session.id(), "turn dropped before completion");
            self.finalize(INTERRUPTED_MESSAGE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        Reply, ScriptedAgent, drain, loading_timeline, prepared_session,
        prepared_session_with_capacity,
    };
    use crate::InMemorySessionStorage;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    fn runner(agent: Arc<ScriptedAgent>) -> TurnRunner {
        TurnRunner::new(Arc::new(InMemorySessionStorage::new()), agent)
    }

    #[tokio::test]
    async fn empty_credential_is_rejected_without_touching_history() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a,b\n1,2\n");
        session.set_api_key("");
        session.set_question("how many rows?");
        let mut rx = session.subscribe();

        let agent = ScriptedAgent::answering(&["unused"]);
        let outcome = runner(agent.clone()).run_turn(&session).await.unwrap();

        assert_eq!(
            outcome,
            TurnOutcome::Rejected {
                message: "enter your openai api key".into()
            }
        );
        let snapshot = session.snapshot();
        assert_eq!(snapshot.error_message, "enter your openai api key");
        assert!(snapshot.chat_history.is_empty());
        assert!(snapshot.is_error_dialog_open);
        assert_eq!(snapshot.phase, TurnPhase::Error);
        assert_eq!(snapshot.question, "how many rows?");
        assert!(agent.requests().is_empty());

        let events = drain(&mut rx);
        assert!(matches!(events[0], SessionEvent::ScrollIntoView));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_rejected() {
        let session = SessionHandle::new("no-file");
        session.set_api_key("sk-test");

        let outcome = runner(ScriptedAgent::answering(&[]))
            .run_turn(&session)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TurnOutcome::Rejected {
                message: "ensure you upload a csv file".into()
            }
        );
        assert!(session.snapshot().chat_history.is_empty());
    }

    #[tokio::test]
    async fn malformed_table_is_recovered_into_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a,b\n1,2,3\n");

        let outcome = runner(ScriptedAgent::answering(&["unused"]))
            .run_turn(&session)
            .await
            .unwrap();

        let TurnOutcome::Rejected { message } = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert!(message.starts_with("could not read the uploaded csv file"));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.error_message, message);
        assert!(!snapshot.is_answer_loading);
        assert!(snapshot.chat_history.is_empty());
    }

    #[tokio::test]
    async fn upload_confirmation_is_cleared_on_submission() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");
        session.update(|s| s.upload_confirmation = "uploaded".into());

        runner(ScriptedAgent::answering(&["ok"]))
            .run_turn(&session)
            .await
            .unwrap();

        assert_eq!(session.snapshot().upload_confirmation, "");
    }

    #[tokio::test]
    async fn question_is_captured_at_submission() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");
        session.set_question("what is in column a?");

        let agent = ScriptedAgent::answering(&["just 1"]);
        runner(agent.clone()).run_turn(&session).await.unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.question, "");
        assert_eq!(snapshot.chat_history.len(), 1);
        assert_eq!(snapshot.chat_history[0].question, "what is in column a?");
        assert_eq!(agent.requests()[0].question, "what is in column a?");
        assert_eq!(agent.requests()[0].api_key, "sk-test");
        assert_eq!(agent.requests()[0].table.row_count(), 1);
    }

    #[tokio::test]
    async fn streamed_answer_matches_agent_answer() {
        let long = "x".repeat(2_000);
        for answer in ["", "1", "Ünïcode ✓ answer\nwith two lines", long.as_str()] {
            for granularity in [StreamGranularity::Character, StreamGranularity::Word] {
                let dir = tempfile::tempdir().unwrap();
                let chunk_events = AnswerChunks::new(answer, granularity).count();
                let session =
                    prepared_session_with_capacity(dir.path(), "a\n1\n", chunk_events + 16);
                let mut rx = session.subscribe();

                let outcome = runner(ScriptedAgent::answering(&[answer]))
                    .with_settings(TurnSettings {
                        granularity,
                        ..TurnSettings::default()
                    })
                    .run_turn(&session)
                    .await
                    .unwrap();

                assert_eq!(outcome, TurnOutcome::Answered { answer: answer.to_string() });
                let turn = &session.snapshot().chat_history[0];
                assert_eq!(turn.answer, answer);
                assert!(!turn.failed);

                // scroll, loading, append, clear, one per chunk, idle
                assert_eq!(drain(&mut rx).len(), 5 + chunk_events);
            }
        }
    }

    #[tokio::test]
    async fn loading_flag_is_set_only_while_waiting_for_the_agent() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");
        let mut rx = session.subscribe();

        runner(ScriptedAgent::answering(&["1 row"]))
            .run_turn(&session)
            .await
            .unwrap();

        let timeline = loading_timeline(&drain(&mut rx));
        assert_eq!(&timeline[..3], &[true, true, false]);
        assert!(timeline[2..].iter().all(|loading| !loading));
        assert!(!session.snapshot().is_answer_loading);
    }

    #[tokio::test]
    async fn input_clears_before_streaming_starts() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");
        session.set_question("q");
        let mut rx = session.subscribe();

        runner(ScriptedAgent::answering(&["ab"]))
            .run_turn(&session)
            .await
            .unwrap();

        let states: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged { state } => Some(state),
                SessionEvent::ScrollIntoView => None,
            })
            .collect();
        let first_text = states
            .iter()
            .position(|s| s.chat_history.last().is_some_and(|t| !t.answer.is_empty()))
            .unwrap();
        assert!(states[..first_text].iter().any(|s| s.question.is_empty()));
        assert!(states[first_text..].iter().all(|s| s.question.is_empty()));
        assert_eq!(states[first_text].chat_history[0].answer, "a");
    }

    #[tokio::test]
    async fn agent_failure_finalizes_the_pending_turn() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");

        let outcome = runner(ScriptedAgent::with_replies(vec![Reply::Fail("rate limited".into())]))
            .run_turn(&session)
            .await
            .unwrap();

        let TurnOutcome::Failed { message } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(message.contains("rate limited"));
        let snapshot = session.snapshot();
        assert!(!snapshot.is_answer_loading);
        assert_eq!(snapshot.phase, TurnPhase::Idle);
        assert_eq!(snapshot.chat_history[0].answer, message);
        assert!(snapshot.chat_history[0].failed);
        assert!(!session.is_turn_active());
    }

    #[tokio::test]
    async fn agent_panic_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");

        let outcome = runner(ScriptedAgent::with_replies(vec![Reply::Panic]))
            .run_turn(&session)
            .await
            .unwrap();

        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        assert!(!session.snapshot().is_answer_loading);
    }

    #[tokio::test]
    async fn slow_agent_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");

        let outcome = runner(ScriptedAgent::with_replies(vec![Reply::Hang]))
            .with_settings(TurnSettings {
                agent_timeout: Some(Duration::from_millis(20)),
                ..TurnSettings::default()
            })
            .run_turn(&session)
            .await
            .unwrap();

        let TurnOutcome::Failed { message } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(message.contains("did not answer"));
        assert!(!session.snapshot().is_answer_loading);
    }

    #[tokio::test]
    async fn dropped_turn_does_not_leave_loading_stuck() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");
        let runner = runner(ScriptedAgent::with_replies(vec![Reply::Hang])).with_settings(
            TurnSettings {
                agent_timeout: None,
                ..TurnSettings::default()
            },
        );

        let cut_short =
            tokio::time::timeout(Duration::from_millis(20), runner.run_turn(&session)).await;
        assert!(cut_short.is_err());

        let snapshot = session.snapshot();
        assert!(!snapshot.is_answer_loading);
        assert_eq!(snapshot.chat_history[0].answer, INTERRUPTED_MESSAGE);
        assert!(snapshot.chat_history[0].failed);
        assert!(!session.is_turn_active());
    }

    #[tokio::test]
    async fn dropped_turn_cancels_the_agent_call() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");
        let dropped = Arc::new(AtomicBool::new(false));
        let runner = runner(ScriptedAgent::with_replies(vec![Reply::HangWatched(
            dropped.clone(),
        )]))
        .with_settings(TurnSettings {
            agent_timeout: None,
            ..TurnSettings::default()
        });

        let cut_short =
            tokio::time::timeout(Duration::from_millis(20), runner.run_turn(&session)).await;
        assert!(cut_short.is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(dropped.load(AtomicOrdering::SeqCst));
    }

    #[tokio::test]
    async fn concurrent_submission_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");
        session.set_question("mine");
        let _busy = session.try_begin_turn().unwrap();

        let err = runner(ScriptedAgent::answering(&["x"]))
            .submit(&session, Some("theirs".into()))
            .await
            .unwrap_err();

        assert!(matches!(err, ChatError::TurnInProgress(_)));
        let snapshot = session.snapshot();
        assert!(snapshot.chat_history.is_empty());
        assert_eq!(snapshot.question, "mine");
    }

    #[tokio::test]
    async fn refused_submission_does_not_touch_the_running_turn() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");
        let runner = runner(ScriptedAgent::with_replies(vec![Reply::Hang])).with_settings(
            TurnSettings {
                agent_timeout: None,
                ..TurnSettings::default()
            },
        );

        let running = {
            let runner = runner.clone();
            let session = session.clone();
            tokio::spawn(async move { runner.submit(&session, Some("question A".into())).await })
        };
        while session.snapshot().chat_history.is_empty() {
            tokio::task::yield_now().await;
        }

        let err = runner
            .submit(&session, Some("question B".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::TurnInProgress(_)));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.question, "question A");
        assert_eq!(snapshot.chat_history.len(), 1);
        assert_eq!(snapshot.chat_history[0].question, "question A");
        running.abort();
    }

    #[tokio::test]
    async fn submitted_question_replaces_the_draft() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");
        session.set_question("draft");

        let agent = ScriptedAgent::answering(&["ok"]);
        runner(agent.clone())
            .submit(&session, Some("final".into()))
            .await
            .unwrap();

        assert_eq!(agent.requests()[0].question, "final");
        assert_eq!(session.snapshot().chat_history[0].question, "final");
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let err = runner(ScriptedAgent::answering(&[]))
            .run("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn failed_turns_are_not_sent_as_history() {
        let dir = tempfile::tempdir().unwrap();
        let session = prepared_session(dir.path(), "a\n1\n");
        let agent = ScriptedAgent::with_replies(vec![
            Reply::Fail("boom".into()),
            Reply::Answer("fine".into()),
            Reply::Answer("still fine".into()),
        ]);
        let runner = runner(agent.clone());

        for question in ["first", "second", "third"] {
            session.set_question(question);
            runner.run_turn(&session).await.unwrap();
        }

        let requests = agent.requests();
        assert!(requests[1].history.is_empty());
        assert_eq!(requests[2].history.len(), 1);
        assert_eq!(requests[2].history[0].question, "second");
    }
}
