use crate::config::Config;
use crate::error::Result;
use crate::services::evaluator::{Evaluate, LmEvaluator};
use crate::services::executor::CodeExecutor;
use crate::services::kv;
use crate::services::rate_limiter::EvaluationGate;
use crate::services::registry::RoomRegistry;
use crate::services::session_store::SessionStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub registry: Arc<RoomRegistry>,
    pub evaluator: Arc<dyn Evaluate>,
    pub limiter: Arc<EvaluationGate>,
    pub executor: Arc<CodeExecutor>,
    /// Live summary-scheduler tasks, keyed by session code.
    pub schedulers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let kv = kv::from_config(&config.kv)?;
        let store = Arc::new(SessionStore::new(kv, config.session.code_retry_max));
        let evaluator: Arc<dyn Evaluate> = Arc::new(LmEvaluator::new(&config.evaluator));
        let limiter = Arc::new(EvaluationGate::new(
            Duration::from_secs(config.evaluator.min_interval_seconds),
            Duration::from_secs(config.evaluator.slot_retention_seconds),
        ));
        let executor = Arc::new(CodeExecutor::new(&config.sandbox)?);

        Ok(Self {
            config: Arc::new(config),
            store,
            registry: Arc::new(RoomRegistry::new()),
            evaluator,
            limiter,
            executor,
            schedulers: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}
