use chat_flow::{SessionSnapshot, TurnOutcome};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiKeyRequest {
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
}

/// Body of `POST /sessions/{id}/answer`; an empty body asks the current question.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AnswerRequest {
    #[serde(default)]
    pub question: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_name: String,
    pub bytes: usize,
    pub session: SessionSnapshot,
}

#[derive(Debug, Serialize)]
pub struct TurnResponse {
    pub outcome: TurnOutcome,
    pub session: SessionSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDialogResponse {
    pub is_error_dialog_open: bool,
}
