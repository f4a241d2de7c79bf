//! Bridge from chat-flow turns to rig::completion::Message history.

use chat_flow::ChatTurn;
use rig::completion::Message;

/// Each turn becomes a user question followed by the assistant's answer.
pub fn to_rig_messages(turns: &[ChatTurn]) -> Vec<Message> {
    turns
        .iter()
        .flat_map(|turn| {
            [
                Message::user(turn.question.clone()),
                Message::assistant(turn.answer.clone()),
            ]
        })
        .collect()
}
