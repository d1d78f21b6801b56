use crate::models::session::{Session, Slide, Summary};
use serde::{Deserialize, Serialize};

// Request DTOs
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub initial_code: String,
    #[serde(default)]
    pub slides: Vec<Slide>,
}

fn default_language() -> String {
    "python".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub initial_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JoinSessionRequest {
    pub name: String,
}

// Response DTOs
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub success: bool,
    pub session_code: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub success: bool,
    pub session: Session,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionResponse {
    pub success: bool,
    pub session: Session,
    pub reconnect_token: String,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub student_name: String,
    pub summary: Option<Summary>,
}

#[derive(Debug, Serialize)]
pub struct SummariesResponse {
    pub success: bool,
    pub summaries: Vec<StudentSummary>,
}

#[derive(Debug, Serialize)]
pub struct StudentSummaryResponse {
    pub success: bool,
    pub summary: Option<Summary>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
