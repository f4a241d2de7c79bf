//! Scripted agent and session fixtures shared by the unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::agent::{AgentError, AgentRequest, TableAgent};
use crate::events::SessionEvent;
use crate::session::SessionHandle;

pub(crate) enum Reply {
    Answer(String),
    Fail(String),
    Panic,
    Hang,
    /// Hangs like `Hang`; the flag is set once the call is dropped.
    HangWatched(Arc<AtomicBool>),
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Replies in order; answers with an empty string once the script runs out.
pub(crate) struct ScriptedAgent {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub(crate) fn with_replies(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn answering(answers: &[&str]) -> Arc<Self> {
        Self::with_replies(answers.iter().map(|a| Reply::Answer(a.to_string())).collect())
    }

    pub(crate) fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TableAgent for ScriptedAgent {
    async fn answer(&self, request: AgentRequest) -> Result<String, AgentError> {
        self.requests.lock().unwrap().push(request);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply.unwrap_or(Reply::Answer(String::new())) {
            Reply::Answer(answer) => Ok(answer),
            Reply::Fail(message) => Err(AgentError::Provider(message)),
            Reply::Panic => panic!("scripted agent panic"),
            Reply::Hang => std::future::pending().await,
            Reply::HangWatched(dropped) => {
                let _guard = SetOnDrop(dropped);
                std::future::pending().await
            }
        }
    }
}

/// A session with a credential and `csv` uploaded under `dir`.
pub(crate) fn prepared_session(dir: &Path, csv: &str) -> Arc<SessionHandle> {
    prepared_session_with_capacity(dir, csv, crate::DEFAULT_EVENT_CAPACITY)
}

pub(crate) fn prepared_session_with_capacity(
    dir: &Path,
    csv: &str,
    capacity: usize,
) -> Arc<SessionHandle> {
    let path = dir.join("data.csv");
    std::fs::write(&path, csv).unwrap();

    let session = Arc::new(SessionHandle::with_event_capacity("test-session", capacity));
    session.set_api_key("sk-test");
    session.mutate(|s| s.uploaded_file_path = Some(path));
    session
}

/// Everything published so far. Panics if the receiver fell behind.
pub(crate) fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty | TryRecvError::Closed) => return events,
            Err(TryRecvError::Lagged(skipped)) => {
                panic!("receiver lagged, {skipped} events were dropped")
            }
        }
    }
}

/// `is_answer_loading` as seen by each state change, in publish order.
pub(crate) fn loading_timeline(events: &[SessionEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged { state } => Some(state.is_answer_loading),
            SessionEvent::ScrollIntoView => None,
        })
        .collect()
}
