use crate::config::KvConfig;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use deadpool_redis::{redis::AsyncCommands, Config as RedisConfig, Pool, Runtime};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const SESSION_KEY_PREFIX: &str = "session";

/// Write-through persistence for session documents. The in-memory store
/// is authoritative; adapter failures are logged by the caller and never
/// abort a mutation.
#[async_trait]
pub trait KvAdapter: Send + Sync {
    async fn put_session(&self, code: &str, document: &str) -> Result<()>;
    async fn get_session(&self, code: &str) -> Result<Option<String>>;
    async fn delete_session(&self, code: &str) -> Result<()>;
}

/// Builds the adapter selected by `KV_BACKEND`, or `None` when
/// write-through is disabled.
pub fn from_config(config: &KvConfig) -> Result<Option<Arc<dyn KvAdapter>>> {
    match config.backend.as_str() {
        "none" => Ok(None),
        "redis" => {
            let adapter = RedisKv::connect(&config.url)?;
            info!(
                backend = "redis",
                region = %config.region,
                "KV write-through adapter attached"
            );
            Ok(Some(Arc::new(adapter)))
        }
        other => Err(AppError::Config(format!("unsupported KV backend '{}'", other))),
    }
}

fn session_key(code: &str) -> String {
    format!("{}:{}", SESSION_KEY_PREFIX, code)
}

pub struct RedisKv {
    pool: Pool,
}

impl RedisKv {
    pub fn connect(url: &str) -> Result<Self> {
        let pool = RedisConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| AppError::Config(format!("failed to create Redis pool: {}", e)))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvAdapter for RedisKv {
    async fn put_session(&self, code: &str, document: &str) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| AppError::Kv(e.to_string()))?;
        conn.set::<_, _, ()>(session_key(code), document)
            .await
            .map_err(|e| AppError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn get_session(&self, code: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await.map_err(|e| AppError::Kv(e.to_string()))?;
        let document: Option<String> = conn
            .get(session_key(code))
            .await
            .map_err(|e| AppError::Kv(e.to_string()))?;
        Ok(document)
    }

    async fn delete_session(&self, code: &str) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| AppError::Kv(e.to_string()))?;
        conn.del::<_, ()>(session_key(code))
            .await
            .map_err(|e| AppError::Kv(e.to_string()))?;
        Ok(())
    }
}

/// In-process adapter for tests.
#[derive(Default)]
pub struct MemoryKv {
    entries: std::sync::Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("memory kv lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvAdapter for MemoryKv {
    async fn put_session(&self, code: &str, document: &str) -> Result<()> {
        self.entries
            .lock()
            .expect("memory kv lock")
            .insert(session_key(code), document.to_string());
        Ok(())
    }

    async fn get_session(&self, code: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .expect("memory kv lock")
            .get(&session_key(code))
            .cloned())
    }

    async fn delete_session(&self, code: &str) -> Result<()> {
        self.entries
            .lock()
            .expect("memory kv lock")
            .remove(&session_key(code));
        Ok(())
    }
}
