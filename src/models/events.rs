use crate::models::session::{Session, Slide, SlideInfo, Summary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound frames. One variant per event name; unknown types or missing
/// fields fail deserialization and surface as an `error` frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "join-session")]
    JoinSession { code: String, name: String },

    #[serde(rename = "teacher-join")]
    TeacherJoin { code: String, name: String },

    #[serde(rename = "reconnect-session")]
    ReconnectSession {
        code: String,
        name: String,
        token: String,
    },

    /// From a student: the current draft. From the teacher: the
    /// scratchpad. The `code` field is source text here, not a session
    /// code.
    #[serde(rename = "code-update")]
    CodeUpdate { code: String },

    #[serde(rename = "update-slide")]
    UpdateSlide {
        #[serde(rename = "slideIndex")]
        slide_index: i64,
    },

    #[serde(rename = "update-slide-data")]
    UpdateSlideData {
        slides: Vec<Slide>,
        #[serde(rename = "slidesWithCode", default)]
        slides_with_code: Vec<usize>,
    },

    #[serde(rename = "execute-code")]
    ExecuteCode { code: String, language: String },
}

/// Outbound frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session-data")]
    SessionData {
        session: Session,
        #[serde(rename = "reconnectToken", skip_serializing_if = "Option::is_none")]
        reconnect_token: Option<String>,
    },

    #[serde(rename = "slide-change")]
    SlideChange {
        index: usize,
        #[serde(rename = "hasCodeEditor")]
        has_code_editor: bool,
        prompt: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "user-joined")]
    UserJoined {
        name: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "user-left")]
    UserLeft {
        name: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "student-code-update")]
    StudentCodeUpdate {
        #[serde(rename = "studentName")]
        student_name: String,
        code: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "student-summary-update")]
    StudentSummaryUpdate {
        #[serde(rename = "studentName")]
        student_name: String,
        summary: Summary,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "execution-result")]
    ExecutionResult {
        result: String,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "student-execution-result")]
    StudentExecutionResult {
        #[serde(rename = "studentName")]
        student_name: String,
        result: String,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "code-restore")]
    CodeRestore {
        code: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error { message: message.into() }
    }

    pub fn slide_change(info: &SlideInfo) -> Self {
        ServerEvent::SlideChange {
            index: info.index,
            has_code_editor: info.has_code_editor,
            prompt: info.prompt.clone(),
            timestamp: Utc::now(),
        }
    }
}
