use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Authoritative session document. One per live six-letter code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub code: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub initial_code: String,
    /// Teacher's live scratchpad. Never broadcast on write.
    #[serde(default)]
    pub current_code: String,
    #[serde(default)]
    pub slides: Vec<Slide>,
    /// Cached indices of slides that carry a coding task.
    #[serde(default)]
    pub slides_with_code: Vec<usize>,
    #[serde(default)]
    pub current_slide: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
    #[serde(default)]
    pub students: HashMap<String, Student>,
    #[serde(default)]
    pub teacher_endpoint_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slide {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub has_coding_task: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub joined_at: DateTime<Utc>,
    /// Last received draft, last-writer-wins.
    #[serde(default)]
    pub code: String,
    pub socket_endpoint_id: Option<Uuid>,
    pub last_active: DateTime<Utc>,
    /// Session-scoped reconnect nonce. Issued on join, checked on
    /// reconnect, never serialized outward.
    #[serde(skip_serializing, default)]
    pub reconnect_token: String,
    #[serde(default)]
    pub summary: Option<Summary>,
    #[serde(default)]
    pub last_execution: Option<Execution>,
    #[serde(default)]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reconnected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub progress: Progress,
    pub feedback: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Progress {
    NotStarted,
    JustStarted,
    HalfwayDone,
    AlmostDone,
    AllDone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub result: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// What the room needs to know about a slide to render it.
#[derive(Debug, Clone)]
pub struct SlideInfo {
    pub index: usize,
    pub has_code_editor: bool,
    pub prompt: String,
}

impl Session {
    pub fn new(
        code: String,
        title: String,
        description: String,
        language: String,
        initial_code: String,
        slides: Vec<Slide>,
    ) -> Self {
        let now = Utc::now();
        let slides_with_code = coding_slide_indices(&slides);
        Self {
            code,
            title,
            description,
            language,
            initial_code,
            current_code: String::new(),
            slides,
            slides_with_code,
            current_slide: 0,
            created_at: now,
            updated_at: now,
            active: true,
            students: HashMap::new(),
            teacher_endpoint_id: None,
        }
    }

    /// True when `index` addresses an existing slide, or is 0 on an
    /// empty deck.
    pub fn is_valid_slide_index(&self, index: usize) -> bool {
        index < self.slides.len() || (self.slides.is_empty() && index == 0)
    }

    /// Resolves a slide index to its room-facing description. Missing
    /// slides resolve to no editor and an empty prompt.
    pub fn slide_info(&self, index: usize) -> SlideInfo {
        match self.slides.get(index) {
            Some(slide) => SlideInfo {
                index,
                has_code_editor: slide.has_coding_task || self.slides_with_code.contains(&index),
                prompt: slide.prompt.clone(),
            },
            None => SlideInfo {
                index,
                has_code_editor: false,
                prompt: String::new(),
            },
        }
    }

    pub fn current_slide_info(&self) -> SlideInfo {
        self.slide_info(self.current_slide)
    }

    /// Replaces the deck and its coding-task cache, clamping the current
    /// slide so it stays a legal index.
    pub fn replace_slides(&mut self, slides: Vec<Slide>, slides_with_code: Vec<usize>) {
        self.slides = slides;
        self.slides_with_code = slides_with_code;
        if self.slides.is_empty() {
            self.current_slide = 0;
        } else if self.current_slide >= self.slides.len() {
            self.current_slide = self.slides.len() - 1;
        }
        self.updated_at = Utc::now();
    }
}

impl Student {
    pub fn new(endpoint_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            joined_at: now,
            code: String::new(),
            socket_endpoint_id: Some(endpoint_id),
            last_active: now,
            reconnect_token: generate_reconnect_token(),
            summary: None,
            last_execution: None,
            disconnected_at: None,
            reconnected_at: None,
        }
    }
}

impl Summary {
    /// Fallback used whenever the evaluator cannot produce a usable
    /// classification.
    pub fn default_not_started() -> Self {
        Self {
            progress: Progress::NotStarted,
            feedback: "Please start".to_string(),
        }
    }
}

fn coding_slide_indices(slides: &[Slide]) -> Vec<usize> {
    slides
        .iter()
        .enumerate()
        .filter(|(_, s)| s.has_coding_task)
        .map(|(i, _)| i)
        .collect()
}

/// Random 128-bit hex nonce.
pub fn generate_reconnect_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
