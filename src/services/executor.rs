use crate::config::SandboxConfig;
use crate::error::{AppError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

/// What a sandboxed run produced. `error` is set on refusal, timeout,
/// or a non-zero exit.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

/// Runs student submissions as interpreter subprocesses under a shared
/// scratch directory. Both languages follow the same discipline: unique
/// file name, command whitelist, wall-clock cap, SIGTERM then SIGKILL,
/// capped output, cleanup on every exit path.
pub struct CodeExecutor {
    scratch_dir: PathBuf,
    python_timeout: Duration,
    javascript_timeout: Duration,
    max_output: usize,
    term_grace: Duration,
}

fn file_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-f0-9-]+\.(py|js)$").expect("sandbox file name regex"))
}

fn python_command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^python3? "?[A-Za-z0-9_./-]+\.py"?$"#).expect("python command regex")
    })
}

fn node_command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^node "?[A-Za-z0-9_./-]+\.js"?$"#).expect("node command regex")
    })
}

impl CodeExecutor {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let scratch_dir = PathBuf::from(&config.temp_dir);
        std::fs::create_dir_all(&scratch_dir)
            .map_err(|e| AppError::Config(format!("cannot create sandbox dir: {}", e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&scratch_dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| AppError::Config(format!("cannot restrict sandbox dir: {}", e)))?;
        }
        Ok(Self {
            scratch_dir,
            python_timeout: Duration::from_secs(config.python_timeout_seconds),
            javascript_timeout: Duration::from_secs(config.javascript_timeout_seconds),
            max_output: config.max_output_bytes,
            term_grace: Duration::from_millis(config.term_grace_millis),
        })
    }

    pub async fn execute(&self, language: &str, source: &str) -> Result<ExecutionOutcome> {
        match language {
            "python" => self.run_python(source).await,
            "javascript" => self.run_javascript(source).await,
            other => Err(AppError::SandboxViolation(format!(
                "unsupported language: {}",
                other
            ))),
        }
    }

    async fn run_python(&self, source: &str) -> Result<ExecutionOutcome> {
        let body = format!("{}\n# ---\n{}", PYTHON_PRELUDE, source);
        let path = self.materialize("py", &body).await?;

        let command_line = format!("python3 {}", path.display());
        if !python_command_re().is_match(&command_line) {
            remove_file_with_retry(path).await;
            return Err(AppError::SandboxViolation(
                "interpreter invocation refused by whitelist".to_string(),
            ));
        }

        let mut command = Command::new("python3");
        command.arg(&path);
        let outcome = self.run_child(command, self.python_timeout).await;
        remove_file_with_retry(path).await;
        outcome
    }

    async fn run_javascript(&self, source: &str) -> Result<ExecutionOutcome> {
        let body = wrap_javascript(source);
        let path = self.materialize("js", &body).await?;

        let command_line = format!("node {}", path.display());
        if !node_command_re().is_match(&command_line) {
            remove_file_with_retry(path).await;
            return Err(AppError::SandboxViolation(
                "interpreter invocation refused by whitelist".to_string(),
            ));
        }

        let mut command = Command::new("node");
        command.arg(&path);
        // Heap cap goes through the environment so the command line stays
        // exactly "node <file>".
        command.env("NODE_OPTIONS", "--max-old-space-size=50");
        let outcome = self.run_child(command, self.javascript_timeout).await;
        remove_file_with_retry(path).await;
        outcome
    }

    /// Writes the source under a fresh uuid file name inside the scratch
    /// directory, rejecting anything that could escape it.
    async fn materialize(&self, extension: &str, body: &str) -> Result<PathBuf> {
        let file_name = format!("{}.{}", Uuid::new_v4(), extension);
        if !file_name_re().is_match(&file_name) {
            return Err(AppError::SandboxViolation(format!(
                "illegal sandbox file name: {}",
                file_name
            )));
        }
        let path = self.scratch_dir.join(&file_name);
        if path.parent() != Some(self.scratch_dir.as_path()) {
            return Err(AppError::SandboxViolation(
                "sandbox path escapes scratch directory".to_string(),
            ));
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("sandbox write failed: {}", e)))?;
        Ok(path)
    }

    async fn run_child(&self, mut command: Command, limit: Duration) -> Result<ExecutionOutcome> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("sandbox spawn failed: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max_output = self.max_output;
        let stdout_task = tokio::spawn(read_capped(stdout, max_output));
        let stderr_task = tokio::spawn(read_capped(stderr, max_output));

        let waited = timeout(limit, child.wait()).await;
        let status = match waited {
            Ok(exit) => Some(
                exit.map_err(|e| AppError::Internal(anyhow::anyhow!("sandbox wait failed: {}", e)))?,
            ),
            Err(_) => {
                if let Some(pid) = child.id() {
                    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
                tokio::time::sleep(self.term_grace).await;
                let _ = child.kill().await;
                let _ = child.wait().await;
                None
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let error = match &status {
            None => Some(format!("execution timed out after {:?}", limit)),
            Some(status) if !status.success() => Some(if stderr.trim().is_empty() {
                format!("process exited with {}", status)
            } else {
                stderr.trim_end().to_string()
            }),
            Some(_) => None,
        };

        Ok(ExecutionOutcome { stdout, stderr, error })
    }
}

async fn read_capped(
    stream: Option<impl tokio::io::AsyncRead + Unpin>,
    cap: usize,
) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut collected: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let remaining = cap.saturating_sub(collected.len());
                collected.extend_from_slice(&buf[..n.min(remaining)]);
                if collected.len() >= cap {
                    // Keep draining so the child never blocks on a full pipe.
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                    break;
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

async fn remove_file_with_retry(path: impl AsRef<Path>) {
    let path = path.as_ref().to_path_buf();
    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!(path = %path.display(), "sandbox cleanup failed, retrying in 5s: {}", e);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), "sandbox cleanup failed permanently: {}", e);
            }
        });
    }
}

/// Limits plus import/OS/open guards. Prepended before the student's
/// source in the same interpreter process.
const PYTHON_PRELUDE: &str = r#"import resource, os, builtins
resource.setrlimit(resource.RLIMIT_CPU, (2, 2))
resource.setrlimit(resource.RLIMIT_DATA, (52428800, 52428800))
resource.setrlimit(resource.RLIMIT_FSIZE, (1048576, 1048576))
_BLOCKED_MODULES = {
    'subprocess', 'socket', 'requests', 'http', 'urllib',
    'ftplib', 'telnetlib', 'smtplib', '_pickle', 'pickle',
}
_real_import = builtins.__import__
def _guarded_import(name, *args, **kwargs):
    if name.split('.')[0] in _BLOCKED_MODULES:
        raise ImportError("import of '%s' is not allowed" % name)
    return _real_import(name, *args, **kwargs)
builtins.__import__ = _guarded_import
for _name in dir(os):
    if _name.startswith(('spawn', 'exec')) or _name in ('system', 'popen', 'fork', 'unlink'):
        setattr(os, _name, None)
_real_open = builtins.open
def _guarded_open(file, mode='r', *args, **kwargs):
    if any(flag in mode for flag in ('w', 'a', 'x', '+')):
        raise PermissionError('write access is not allowed')
    return _real_open(file, mode, *args, **kwargs)
builtins.open = _guarded_open"#;

/// Wraps the source in a strict-mode scope that shadows every host
/// binding, captures console output, and prints the completion value as
/// `=> <value>`.
fn wrap_javascript(source: &str) -> String {
    let embedded = serde_json::to_string(source).expect("source is valid UTF-8");
    format!(
        r#"'use strict';
function __fmt(v) {{
    try {{
        return typeof v === 'object' && v !== null ? JSON.stringify(v) : String(v);
    }} catch (_) {{
        return String(v);
    }}
}}
const __lines = [];
const __capture = (...args) => {{ __lines.push(args.map(__fmt).join(' ')); }};
const __console = {{ log: __capture, error: __capture, warn: __capture, info: __capture, debug: __capture }};
let __result;
let __failure;
try {{
    __result = (function (console, require, module, exports, process, Buffer, fetch,
                          setTimeout, setInterval, setImmediate, queueMicrotask,
                          XMLHttpRequest, WebSocket) {{
        return eval({embedded});
    }})(__console);
}} catch (err) {{
    __failure = err;
}}
for (const line of __lines) {{
    console.log(line);
}}
if (__failure !== undefined) {{
    console.error(String(__failure && __failure.stack || __failure));
    process.exit(1);
}}
if (__result !== undefined) {{
    console.log('=> ' + __fmt(__result));
}}
"#
    )
}
