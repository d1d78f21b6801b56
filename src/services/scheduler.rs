use crate::models::session::Summary;
use crate::services::engine::SessionEngine;
use crate::services::registry::Role;
use crate::state::AppState;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Per-session background sweep: while at least one teacher is attached,
/// snapshot the active drafts every interval, push them through the
/// rate-limited evaluator in small batches, and fan the summaries out to
/// teachers. One task per session, tracked in the state so the last
/// teacher's departure (or session end) can stop it.
pub struct SummaryScheduler;

impl SummaryScheduler {
    pub async fn ensure_started(state: &AppState, code: &str) {
        let mut schedulers = state.schedulers.lock().await;
        if let Some(handle) = schedulers.get(code) {
            if !handle.is_finished() {
                return;
            }
        }
        let task_state = state.clone();
        let task_code = code.to_string();
        let handle = tokio::spawn(async move {
            Self::run(task_state, task_code).await;
        });
        schedulers.insert(code.to_string(), handle);
        info!(session_code = %code, "summary scheduler started");
    }

    pub async fn stop(state: &AppState, code: &str) {
        if let Some(handle) = state.schedulers.lock().await.remove(code) {
            handle.abort();
            info!(session_code = %code, "summary scheduler stopped");
        }
    }

    pub async fn stop_all(state: &AppState) {
        let mut schedulers = state.schedulers.lock().await;
        for (code, handle) in schedulers.drain() {
            handle.abort();
            info!(session_code = %code, "summary scheduler stopped");
        }
    }

    async fn run(state: AppState, code: String) {
        let mut ticker = interval(state.config.summary_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the sweep starts one
        // interval after the teacher arrives.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if state.registry.role_count(&code, Role::Teacher).await == 0 {
                info!(session_code = %code, "no teachers attached, scheduler exiting");
                break;
            }
            let session = match state.store.get(&code).await {
                Ok(session) if session.active => session,
                _ => {
                    info!(session_code = %code, "session gone or ended, scheduler exiting");
                    break;
                }
            };

            let prompt = session.current_slide_info().prompt;
            let candidates: Vec<(String, String)> = session
                .students
                .iter()
                .filter(|(_, st)| !st.code.is_empty() && st.disconnected_at.is_none())
                .map(|(name, st)| (name.clone(), st.code.clone()))
                .collect();

            Self::sweep(&state, &code, &prompt, candidates).await;
        }
    }

    /// Walks the snapshot in batches, pausing between batches to avoid
    /// burst-throttling the evaluator. One student's failure never aborts
    /// the pass.
    async fn sweep(state: &AppState, code: &str, prompt: &str, candidates: Vec<(String, String)>) {
        let batch_size = state.config.session.summary_batch_size.max(1);
        let pause = Duration::from_secs(state.config.session.summary_batch_pause_seconds);

        for (batch_index, batch) in candidates.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(pause).await;
            }
            for (name, draft) in batch {
                if !state.limiter.try_acquire(code, name) {
                    continue;
                }
                let summary = match state.evaluator.evaluate(prompt, draft).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        warn!(session_code = %code, student = %name, "evaluation failed: {}", e);
                        Summary::default_not_started()
                    }
                };
                SessionEngine::persist_and_emit_summary(state, code, name, summary).await;
            }
        }
    }
}
