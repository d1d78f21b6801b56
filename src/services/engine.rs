use crate::error::{AppError, Result};
use crate::models::events::{ClientEvent, ServerEvent};
use crate::models::session::{Execution, Slide, SlideInfo, Student, Summary};
use crate::services::code_generator::is_valid_session_code;
use crate::services::registry::Role;
use crate::state::AppState;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Drafts of at most this many bytes never reach the evaluator.
const EVALUATION_MIN_CODE_LEN: usize = 10;

/// Event dispatcher for one realtime endpoint. The endpoint moves
/// Unbound -> Joined(role, session) -> [Disconnected(grace)] -> gone;
/// the room registry holds the Joined state, the session store holds
/// everything durable.
pub struct SessionEngine;

impl SessionEngine {
    pub async fn dispatch(
        state: &AppState,
        endpoint: Uuid,
        tx: &mpsc::UnboundedSender<ServerEvent>,
        event: ClientEvent,
    ) -> Result<()> {
        match event {
            ClientEvent::JoinSession { code, name } => {
                Self::handle_join(state, endpoint, tx, &code, &name).await
            }
            ClientEvent::TeacherJoin { code, name } => {
                Self::handle_teacher_join(state, endpoint, tx, &code, &name).await
            }
            ClientEvent::ReconnectSession { code, name, token } => {
                Self::handle_reconnect(state, endpoint, tx, &code, &name, &token).await
            }
            ClientEvent::CodeUpdate { code } => {
                Self::handle_code_update(state, endpoint, &code).await
            }
            ClientEvent::UpdateSlide { slide_index } => {
                Self::handle_update_slide(state, endpoint, slide_index).await
            }
            ClientEvent::UpdateSlideData { slides, slides_with_code } => {
                Self::handle_update_slide_data(state, endpoint, slides, slides_with_code).await
            }
            ClientEvent::ExecuteCode { code, language } => {
                Self::handle_execute_code(state, endpoint, tx, &code, &language).await
            }
        }
    }

    async fn handle_join(
        state: &AppState,
        endpoint: Uuid,
        tx: &mpsc::UnboundedSender<ServerEvent>,
        code: &str,
        name: &str,
    ) -> Result<()> {
        Self::validate_join(state, endpoint, code, name).await?;

        // Create or overwrite: a join with an in-grace name replaces the
        // old record and its token.
        let student = Student::new(endpoint);
        let token = student.reconnect_token.clone();
        let session = state
            .store
            .update(code, move |doc| {
                doc.students.insert(name.to_string(), student);
                doc.clone()
            })
            .await?;

        state
            .registry
            .attach(code, endpoint, Role::Student, name, tx.clone())
            .await;

        let slide = session.current_slide_info();
        let _ = tx.send(ServerEvent::SessionData {
            session,
            reconnect_token: Some(token),
        });
        let _ = tx.send(ServerEvent::slide_change(&slide));
        state
            .registry
            .broadcast_except(
                code,
                endpoint,
                &ServerEvent::UserJoined {
                    name: name.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await;

        info!(session_code = %code, student = %name, "student joined session");
        Ok(())
    }

    async fn handle_teacher_join(
        state: &AppState,
        endpoint: Uuid,
        tx: &mpsc::UnboundedSender<ServerEvent>,
        code: &str,
        name: &str,
    ) -> Result<()> {
        Self::validate_join(state, endpoint, code, name).await?;

        let session = state
            .store
            .update(code, move |doc| {
                doc.teacher_endpoint_id = Some(endpoint);
                doc.clone()
            })
            .await?;

        state
            .registry
            .attach(code, endpoint, Role::Teacher, name, tx.clone())
            .await;
        crate::services::scheduler::SummaryScheduler::ensure_started(state, code).await;

        let _ = tx.send(ServerEvent::SessionData {
            session,
            reconnect_token: None,
        });
        state
            .registry
            .broadcast_except(
                code,
                endpoint,
                &ServerEvent::UserJoined {
                    name: name.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await;

        info!(session_code = %code, teacher = %name, "teacher joined session");
        Ok(())
    }

    async fn validate_join(
        state: &AppState,
        endpoint: Uuid,
        code: &str,
        name: &str,
    ) -> Result<()> {
        if !is_valid_session_code(code) {
            return Err(AppError::Validation("invalid session code".to_string()));
        }
        if name.trim().is_empty() {
            return Err(AppError::Validation("name must not be empty".to_string()));
        }
        if state.registry.membership(endpoint).await.is_some() {
            return Err(AppError::Validation("endpoint already joined a session".to_string()));
        }
        let session = state.store.get(code).await?;
        if !session.active {
            return Err(AppError::Forbidden("session is no longer active".to_string()));
        }
        Ok(())
    }

    async fn handle_reconnect(
        state: &AppState,
        endpoint: Uuid,
        tx: &mpsc::UnboundedSender<ServerEvent>,
        code: &str,
        name: &str,
        token: &str,
    ) -> Result<()> {
        if !is_valid_session_code(code) {
            return Err(AppError::Validation("invalid session code".to_string()));
        }
        let session = state.store.get(code).await?;
        if !session.active {
            return Err(AppError::Forbidden("session is no longer active".to_string()));
        }
        let student = session
            .students
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("no student named {}", name)))?;
        if student.reconnect_token != token {
            return Err(AppError::Forbidden("invalid reconnect token".to_string()));
        }

        let session = state
            .store
            .update(code, move |doc| {
                if let Some(st) = doc.students.get_mut(name) {
                    st.socket_endpoint_id = Some(endpoint);
                    st.reconnected_at = Some(Utc::now());
                    st.disconnected_at = None;
                    st.last_active = Utc::now();
                }
                doc.clone()
            })
            .await?;

        state
            .registry
            .attach(code, endpoint, Role::Student, name, tx.clone())
            .await;

        let slide = session.current_slide_info();
        let draft = session
            .students
            .get(name)
            .map(|st| st.code.clone())
            .unwrap_or_default();
        let _ = tx.send(ServerEvent::SessionData {
            session,
            reconnect_token: Some(token.to_string()),
        });
        let _ = tx.send(ServerEvent::slide_change(&slide));
        if !draft.is_empty() {
            let _ = tx.send(ServerEvent::CodeRestore {
                code: draft,
                timestamp: Utc::now(),
            });
        }
        state
            .registry
            .broadcast_except(
                code,
                endpoint,
                &ServerEvent::UserJoined {
                    name: name.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await;

        info!(session_code = %code, student = %name, "student reconnected");
        Ok(())
    }

    async fn handle_code_update(state: &AppState, endpoint: Uuid, source: &str) -> Result<()> {
        let (code, role, name) = Self::require_joined(state, endpoint).await?;

        match role {
            Role::Teacher => {
                // Scratchpad write. No broadcast, no evaluation.
                state
                    .store
                    .update(&code, |doc| {
                        doc.current_code = source.to_string();
                    })
                    .await?;
                Ok(())
            }
            Role::Student => {
                // Last writer wins; ordering is whoever reaches the
                // session lock second.
                let prompt = state
                    .store
                    .update(&code, |doc| {
                        if let Some(st) = doc.students.get_mut(&name) {
                            st.code = source.to_string();
                            st.last_active = Utc::now();
                        }
                        doc.current_slide_info().prompt
                    })
                    .await?;

                state
                    .registry
                    .send_role(
                        &code,
                        Role::Teacher,
                        &ServerEvent::StudentCodeUpdate {
                            student_name: name.clone(),
                            code: source.to_string(),
                            timestamp: Utc::now(),
                        },
                    )
                    .await;

                if source.len() > EVALUATION_MIN_CODE_LEN {
                    Self::spawn_evaluation(state, code, name, prompt, source.to_string());
                }
                Ok(())
            }
        }
    }

    /// Runs the rate-limited evaluation off the endpoint's event loop so
    /// a slow model never stalls inbound frames.
    fn spawn_evaluation(
        state: &AppState,
        code: String,
        name: String,
        prompt: String,
        source: String,
    ) {
        if !state.limiter.try_acquire(&code, &name) {
            return;
        }
        let state = state.clone();
        tokio::spawn(async move {
            let summary = match state.evaluator.evaluate(&prompt, &source).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(session_code = %code, student = %name, "evaluation failed: {}", e);
                    Summary::default_not_started()
                }
            };
            Self::persist_and_emit_summary(&state, &code, &name, summary).await;
        });
    }

    /// Persists a summary unless the student vanished or disconnected
    /// while the evaluator was running, then notifies teachers.
    pub(crate) async fn persist_and_emit_summary(
        state: &AppState,
        code: &str,
        name: &str,
        summary: Summary,
    ) {
        let emitted = summary.clone();
        let persisted = match state
            .store
            .update(code, |doc| match doc.students.get_mut(name) {
                Some(st) if st.disconnected_at.is_none() => {
                    st.summary = Some(summary);
                    true
                }
                _ => false,
            })
            .await
        {
            Ok(persisted) => persisted,
            Err(_) => false, // session itself is gone
        };

        if persisted {
            state
                .registry
                .send_role(
                    code,
                    Role::Teacher,
                    &ServerEvent::StudentSummaryUpdate {
                        student_name: name.to_string(),
                        summary: emitted,
                        timestamp: Utc::now(),
                    },
                )
                .await;
        }
    }

    async fn handle_update_slide(state: &AppState, endpoint: Uuid, index: i64) -> Result<()> {
        let (code, role, _) = Self::require_joined(state, endpoint).await?;
        if role != Role::Teacher {
            return Err(AppError::Forbidden("only the teacher can change slides".to_string()));
        }
        if index < 0 {
            return Err(AppError::Validation("slide index out of range".to_string()));
        }

        let slide = Self::set_slide(state, &code, index as usize).await?;
        state
            .registry
            .broadcast(&code, &ServerEvent::slide_change(&slide))
            .await;
        Ok(())
    }

    /// Shared slide mutation for the realtime arm and the HTTP surface.
    pub async fn set_slide(state: &AppState, code: &str, index: usize) -> Result<SlideInfo> {
        state
            .store
            .update(code, |doc| {
                if !doc.is_valid_slide_index(index) {
                    return Err(AppError::Validation("slide index out of range".to_string()));
                }
                doc.current_slide = index;
                doc.updated_at = Utc::now();
                Ok(doc.slide_info(index))
            })
            .await?
    }

    async fn handle_update_slide_data(
        state: &AppState,
        endpoint: Uuid,
        slides: Vec<Slide>,
        slides_with_code: Vec<usize>,
    ) -> Result<()> {
        let (code, role, _) = Self::require_joined(state, endpoint).await?;
        if role != Role::Teacher {
            return Err(AppError::Forbidden("only the teacher can replace slides".to_string()));
        }

        state
            .store
            .update(&code, move |doc| {
                doc.replace_slides(slides, slides_with_code);
            })
            .await?;
        Ok(())
    }

    async fn handle_execute_code(
        state: &AppState,
        endpoint: Uuid,
        tx: &mpsc::UnboundedSender<ServerEvent>,
        source: &str,
        language: &str,
    ) -> Result<()> {
        let (code, role, name) = Self::require_joined(state, endpoint).await?;

        // Sandbox refusals are recovered into the result payload, never
        // surfaced as a protocol error.
        let outcome = match state.executor.execute(language, source).await {
            Ok(outcome) => outcome,
            Err(AppError::SandboxViolation(msg)) => crate::services::executor::ExecutionOutcome {
                stdout: format!("Error: {}", msg),
                stderr: String::new(),
                error: Some(msg),
            },
            Err(e) => return Err(e),
        };

        let error = outcome.error.clone().or_else(|| {
            let stderr = outcome.stderr.trim();
            (!stderr.is_empty()).then(|| stderr.to_string())
        });
        let timestamp = Utc::now();

        if role == Role::Student {
            let execution = Execution {
                result: outcome.stdout.clone(),
                error: error.clone(),
                timestamp,
            };
            state
                .store
                .update(&code, |doc| {
                    if let Some(st) = doc.students.get_mut(&name) {
                        st.last_execution = Some(execution);
                        st.last_active = timestamp;
                    }
                })
                .await?;
        }

        let _ = tx.send(ServerEvent::ExecutionResult {
            result: outcome.stdout.clone(),
            error: error.clone(),
            timestamp,
        });
        if role == Role::Student {
            state
                .registry
                .send_role(
                    &code,
                    Role::Teacher,
                    &ServerEvent::StudentExecutionResult {
                        student_name: name,
                        result: outcome.stdout,
                        error,
                        timestamp,
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Disconnect is a state transition, not a destructor: the grace
    /// removal is a timer on the engine, and the endpoint may be long
    /// gone when it fires.
    pub async fn handle_disconnect(state: &AppState, endpoint: Uuid) {
        let Some((code, role, name)) = state.registry.detach(endpoint).await else {
            return;
        };

        state
            .registry
            .broadcast(
                &code,
                &ServerEvent::UserLeft {
                    name: name.clone(),
                    timestamp: Utc::now(),
                },
            )
            .await;

        match role {
            Role::Teacher => {
                let _ = state
                    .store
                    .update(&code, |doc| {
                        if doc.teacher_endpoint_id == Some(endpoint) {
                            doc.teacher_endpoint_id = None;
                        }
                    })
                    .await;
                if state.registry.role_count(&code, Role::Teacher).await == 0 {
                    crate::services::scheduler::SummaryScheduler::stop(state, &code).await;
                }
                info!(session_code = %code, teacher = %name, "teacher disconnected");
            }
            Role::Student => {
                let marked = state
                    .store
                    .update(&code, |doc| {
                        if let Some(st) = doc.students.get_mut(&name) {
                            st.disconnected_at = Some(Utc::now());
                            st.reconnected_at = None;
                            st.socket_endpoint_id = None;
                            true
                        } else {
                            false
                        }
                    })
                    .await
                    .unwrap_or(false);

                if marked {
                    Self::schedule_grace_removal(state, code.clone(), name.clone());
                }
                info!(session_code = %code, student = %name, "student disconnected, grace window started");
            }
        }
    }

    fn schedule_grace_removal(state: &AppState, code: String, name: String) {
        let state = state.clone();
        let grace = state.config.disconnect_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let removed = state
                .store
                .update(&code, |doc| {
                    let expired = doc
                        .students
                        .get(&name)
                        .map(|st| st.disconnected_at.is_some() && st.reconnected_at.is_none())
                        .unwrap_or(false);
                    if expired {
                        doc.students.remove(&name);
                    }
                    expired
                })
                .await
                .unwrap_or(false);
            if removed {
                info!(session_code = %code, student = %name, "student removed after grace window");
            }
        });
    }

    async fn require_joined(state: &AppState, endpoint: Uuid) -> Result<(String, Role, String)> {
        state
            .registry
            .membership(endpoint)
            .await
            .ok_or_else(|| AppError::Forbidden("join a session first".to_string()))
    }

    /// Ends a session: no new joins, no more summaries. Attached
    /// endpoints stay connected for terminal notifications.
    pub async fn end_session(state: &AppState, code: &str) -> Result<()> {
        state
            .store
            .update(code, |doc| {
                doc.active = false;
                doc.updated_at = Utc::now();
            })
            .await?;
        crate::services::scheduler::SummaryScheduler::stop(state, code).await;
        info!(session_code = %code, "session ended");
        Ok(())
    }

    pub async fn delete_session(state: &AppState, code: &str) -> Result<()> {
        state.store.delete(code).await?;
        crate::services::scheduler::SummaryScheduler::stop(state, code).await;
        info!(session_code = %code, "session deleted");
        Ok(())
    }
}
