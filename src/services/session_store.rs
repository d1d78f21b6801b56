use crate::error::{AppError, Result};
use crate::models::session::Session;
use crate::services::code_generator::CodeGenerator;
use crate::services::kv::KvAdapter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Process-wide map of session code to document. The outer lock guards
/// membership; each document carries its own lock so mutations on one
/// session never block another. Every read-modify-write goes through
/// `update`, which holds the per-session write lock for the whole
/// mutation, so writer ordering is well-defined per session.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<RwLock<Session>>>>,
    kv: Option<Arc<dyn KvAdapter>>,
    code_retry_max: u32,
}

impl SessionStore {
    pub fn new(kv: Option<Arc<dyn KvAdapter>>, code_retry_max: u32) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            kv,
            code_retry_max,
        }
    }

    /// Samples fresh six-letter codes until one misses the live map.
    pub async fn allocate_code(&self) -> Result<String> {
        let sessions = self.sessions.read().await;
        for _ in 0..self.code_retry_max {
            let code = CodeGenerator::generate();
            if !sessions.contains_key(&code) {
                return Ok(code);
            }
        }
        Err(AppError::Conflict(
            "could not allocate a session code after retries".to_string(),
        ))
    }

    pub async fn create(&self, session: Session) -> Result<()> {
        let code = session.code.clone();
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&code) {
                return Err(AppError::Conflict(format!("session {} already exists", code)));
            }
            sessions.insert(code.clone(), Arc::new(RwLock::new(session.clone())));
        }
        self.write_through(&code, &session).await;
        Ok(())
    }

    /// Point-in-time snapshot of the document.
    pub async fn get(&self, code: &str) -> Result<Session> {
        let handle = self.handle(code).await?;
        let doc = handle.read().await;
        Ok(doc.clone())
    }

    /// Applies `mutate` under the per-session write lock, then serializes
    /// the post-mutation document to the KV adapter. Adapter failure is
    /// logged and never fails the mutation.
    pub async fn update<F, T>(&self, code: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> T,
    {
        let handle = self.handle(code).await?;
        let mut doc = handle.write().await;
        let out = mutate(&mut doc);
        self.write_through(code, &doc).await;
        Ok(out)
    }

    pub async fn delete(&self, code: &str) -> Result<()> {
        let removed = self.sessions.write().await.remove(code);
        if removed.is_none() {
            return Err(AppError::NotFound(format!("session {} not found", code)));
        }
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.delete_session(code).await {
                warn!(session_code = %code, "KV delete failed: {}", e);
            }
        }
        Ok(())
    }

    async fn handle(&self, code: &str) -> Result<Arc<RwLock<Session>>> {
        self.sessions
            .read()
            .await
            .get(code)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {} not found", code)))
    }

    async fn write_through(&self, code: &str, doc: &Session) {
        let Some(kv) = &self.kv else { return };
        match serde_json::to_string(doc) {
            Ok(json) => {
                if let Err(e) = kv.put_session(code, &json).await {
                    warn!(session_code = %code, "KV write-through failed: {}", e);
                }
            }
            Err(e) => warn!(session_code = %code, "session serialization failed: {}", e),
        }
    }
}
