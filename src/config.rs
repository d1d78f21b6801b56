use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,
    #[serde(default = "default_kv")]
    pub kv: KvConfig,
    #[serde(default = "default_evaluator")]
    pub evaluator: EvaluatorConfig,
    #[serde(default = "default_session")]
    pub session: SessionConfig,
    #[serde(default = "default_sandbox")]
    pub sandbox: SandboxConfig,
    #[serde(default = "default_cors")]
    pub cors: CorsConfig,
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: "0.0.0.0".to_string(),
        port: 3001,
        ws_path: "/ws".to_string(),
    }
}

fn default_kv() -> KvConfig {
    KvConfig {
        backend: "none".to_string(),
        url: "redis://localhost:6379".to_string(),
        region: String::new(),
    }
}

fn default_evaluator() -> EvaluatorConfig {
    EvaluatorConfig {
        api_key: String::new(),
        model: default_evaluator_model(),
        base_url: default_evaluator_base_url(),
        min_interval_seconds: default_min_interval(),
        slot_retention_seconds: default_slot_retention(),
        rate_limit_backoff_seconds: default_rate_limit_backoff(),
    }
}

fn default_evaluator_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_evaluator_base_url() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_min_interval() -> u64 {
    10
}

fn default_slot_retention() -> u64 {
    20
}

fn default_rate_limit_backoff() -> u64 {
    30
}

fn default_session() -> SessionConfig {
    SessionConfig {
        idle_timeout_seconds: default_idle_timeout(),
        summary_interval_seconds: default_summary_interval(),
        disconnect_grace_seconds: default_disconnect_grace(),
        summary_batch_size: default_summary_batch_size(),
        summary_batch_pause_seconds: default_summary_batch_pause(),
        code_retry_max: default_code_retry_max(),
    }
}

fn default_idle_timeout() -> u64 {
    1800
}

fn default_summary_interval() -> u64 {
    30
}

fn default_disconnect_grace() -> u64 {
    300
}

fn default_summary_batch_size() -> usize {
    5
}

fn default_summary_batch_pause() -> u64 {
    5
}

fn default_code_retry_max() -> u32 {
    64
}

fn default_sandbox() -> SandboxConfig {
    SandboxConfig {
        temp_dir: default_temp_dir(),
        python_timeout_seconds: default_python_timeout(),
        javascript_timeout_seconds: default_javascript_timeout(),
        max_output_bytes: default_max_output(),
        term_grace_millis: default_term_grace(),
    }
}

fn default_temp_dir() -> String {
    "/tmp/classcode-sandbox".to_string()
}

fn default_python_timeout() -> u64 {
    5
}

fn default_javascript_timeout() -> u64 {
    2
}

fn default_max_output() -> usize {
    1024 * 1024 // 1MB per stream
}

fn default_term_grace() -> u64 {
    500
}

fn default_cors() -> CorsConfig {
    CorsConfig {
        allowed_origin: default_cors_origin(),
    }
}

fn default_cors_origin() -> String {
    "http://localhost:3000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// "none" disables write-through; "redis" attaches the Redis adapter.
    #[serde(default = "default_kv_backend")]
    pub backend: String,
    #[serde(default = "default_kv_url")]
    pub url: String,
    #[serde(default)]
    pub region: String,
}

fn default_kv_backend() -> String {
    "none".to_string()
}

fn default_kv_url() -> String {
    "redis://localhost:6379".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_evaluator_model")]
    pub model: String,
    #[serde(default = "default_evaluator_base_url")]
    pub base_url: String,
    /// Minimum seconds between evaluator calls for one (session, student).
    #[serde(default = "default_min_interval")]
    pub min_interval_seconds: u64,
    /// Seconds after which an idle limiter slot is dropped.
    #[serde(default = "default_slot_retention")]
    pub slot_retention_seconds: u64,
    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit_backoff_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_summary_interval")]
    pub summary_interval_seconds: u64,
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_seconds: u64,
    #[serde(default = "default_summary_batch_size")]
    pub summary_batch_size: usize,
    #[serde(default = "default_summary_batch_pause")]
    pub summary_batch_pause_seconds: u64,
    #[serde(default = "default_code_retry_max")]
    pub code_retry_max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    #[serde(default = "default_python_timeout")]
    pub python_timeout_seconds: u64,
    #[serde(default = "default_javascript_timeout")]
    pub javascript_timeout_seconds: u64,
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
    #[serde(default = "default_term_grace")]
    pub term_grace_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_origin")]
    pub allowed_origin: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            kv: default_kv(),
            evaluator: default_evaluator(),
            session: default_session(),
            sandbox: default_sandbox(),
            cors: default_cors(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, figment::Error> {
        dotenvy::dotenv().ok();

        use figment::{providers::Env, Figment};

        // The deployment surface uses flat names; map them onto the nested
        // figment keys before extraction.
        for (flat, nested) in [
            ("PORT", "SERVER__PORT"),
            ("KV_BACKEND", "KV__BACKEND"),
            ("KV_URL", "KV__URL"),
            ("KV_REGION", "KV__REGION"),
            ("LM_API_KEY", "EVALUATOR__API_KEY"),
            ("LM_MODEL_NAME", "EVALUATOR__MODEL"),
            ("CORS_ORIGIN", "CORS__ALLOWED_ORIGIN"),
            ("TEMP_DIR", "SANDBOX__TEMP_DIR"),
            ("IDLE_TIMEOUT_SEC", "SESSION__IDLE_TIMEOUT_SECONDS"),
            ("SUMMARY_INTERVAL_SEC", "SESSION__SUMMARY_INTERVAL_SECONDS"),
            ("DISCONNECT_GRACE_SEC", "SESSION__DISCONNECT_GRACE_SECONDS"),
        ] {
            if std::env::var(nested).is_err() {
                if let Ok(value) = std::env::var(flat) {
                    std::env::set_var(nested, value);
                }
            }
        }

        let config: Config = Figment::new()
            .merge(Env::raw().split("__"))
            .extract()?;

        match config.kv.backend.as_str() {
            "none" | "redis" => {}
            other => {
                return Err(figment::Error::from(format!(
                    "unsupported KV_BACKEND '{}' (expected 'none' or 'redis')",
                    other
                )));
            }
        }

        Ok(config)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session.idle_timeout_seconds)
    }

    pub fn summary_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session.summary_interval_seconds)
    }

    pub fn disconnect_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session.disconnect_grace_seconds)
    }
}
