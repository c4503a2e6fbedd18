use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::LearnerConfig;
use crate::error::{Result, TokiError};

/// Messages sent to the tutoring endpoint.
///
/// Wire format is one JSON object per text frame, tagged by `type`:
/// ```text
/// {"type":"audio","data":"<base64 16-bit PCM @ 16kHz>"}
/// {"type":"end_turn"}
/// {"type":"text","data":"<typed user turn>"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Audio { data: String },
    EndTurn,
    Text { data: String },
}

impl ClientMessage {
    /// Audio frames may be dropped under pressure; everything else may not.
    #[must_use]
    pub const fn is_droppable(&self) -> bool {
        matches!(self, Self::Audio { .. })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| TokiError::Protocol(format!("failed to encode message: {e}")))
    }
}

/// Messages received from the tutoring endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SetupComplete,
    Audio {
        data: String,
    },
    Text {
        data: String,
        #[serde(rename = "isUser", default)]
        is_user: bool,
    },
    UserText {
        data: String,
    },
    TurnComplete,
    Interrupted,
    Error {
        #[serde(default)]
        message: String,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| TokiError::Protocol(format!("unrecognized server message: {e}")))
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SetupComplete => "setup_complete",
            Self::Audio { .. } => "audio",
            Self::Text { .. } => "text",
            Self::UserText { .. } => "user_text",
            Self::TurnComplete => "turn_complete",
            Self::Interrupted => "interrupted",
            Self::Error { .. } => "error",
        }
    }
}

/// Build the endpoint URL with the learner profile as query parameters.
pub fn session_url(base: &str, learner: &LearnerConfig) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| TokiError::Config(format!("invalid server url '{base}': {e}")))?;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TokiError::Config(format!(
            "server url must use ws:// or wss://, got '{base}'"
        )));
    }

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("gradeLevel", &learner.grade_level.to_string());
        query.append_pair("educationLevel", &learner.education_level);
        if let Some(field) = learner.field_of_study.as_deref() {
            query.append_pair("fieldOfStudy", field);
        }
        if !learner.subjects.is_empty() {
            query.append_pair("subjects", &learner.subjects.join(","));
        }
    }

    Ok(url)
}
