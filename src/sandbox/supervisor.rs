//! Sandbox child-process lifecycle (C11): scratch file, spawn, I/O piping,
//! wall-clock timeout, teardown. Never touches backend or broker logic —
//! only the child process and the broker shutdown sequence around it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::error::SandboxError;
use crate::model::now_secs;
use crate::observability::{Observer, ObserverEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    TypeScript,
    Python,
}

impl Language {
    fn interpreter(&self) -> &'static str {
        match self {
            Language::TypeScript => "node",
            Language::Python => "python3",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Language::TypeScript => "mjs",
            Language::Python => "py",
        }
    }

    /// A runtime flag enforcing a heap ceiling, where the interpreter
    /// supports one. Python has no equivalent CLI flag; callers fall back
    /// to advisory-only enforcement for it.
    fn heap_limit_flag(&self, mb: u64) -> Option<String> {
        match self {
            Language::TypeScript => Some(format!("--max-old-space-size={mb}")),
            Language::Python => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Permissions {
    pub read: Vec<String>,
    pub write: Vec<String>,
    pub net: Vec<String>,
}

impl Permissions {
    /// Read grants actually enforced at spawn time: the caller's grants plus
    /// the platform temp directory, which must always be reachable.
    fn effective_read(&self) -> Vec<String> {
        let mut grants = self.read.clone();
        let temp_dir = platform_temp_dir();
        if !grants.iter().any(|p| p == &temp_dir) {
            grants.push(temp_dir);
        }
        grants
    }

    /// Path grants actually enforced at spawn time: the caller's grants,
    /// plus the scratch directory and the platform temp directory, both of
    /// which must always be reachable.
    fn effective_write(&self, scratch_dir: &str) -> Vec<String> {
        let mut grants = self.write.clone();
        if !grants.iter().any(|p| p == scratch_dir) {
            grants.push(scratch_dir.to_string());
        }
        let temp_dir = platform_temp_dir();
        if !grants.iter().any(|p| p == &temp_dir) {
            grants.push(temp_dir);
        }
        grants
    }

    /// Loopback is always reachable so the brokers can be called back into,
    /// regardless of the caller's net grants.
    fn effective_net(&self) -> Vec<String> {
        let mut grants = self.net.clone();
        if !grants.iter().any(|h| h == "127.0.0.1" || h == "localhost") {
            grants.push("127.0.0.1".to_string());
        }
        grants
    }
}

fn platform_temp_dir() -> String {
    std::env::temp_dir().to_string_lossy().into_owned()
}

pub struct SandboxSpec {
    pub language: Language,
    pub code: String,
    pub preamble: String,
    pub timeout: Duration,
    pub permissions: Permissions,
    pub heap_limit_mb: u64,
    pub scratch_dir: PathBuf,
    /// Overrides the interpreter binary resolved from `language`. Exists so
    /// tests can force a spawn failure deterministically; production
    /// callers leave this `None`.
    pub interpreter_override: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: Option<String>,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
}

pub struct Supervisor {
    execution_id: String,
    audit_log: Arc<AuditLog>,
    observer: Arc<dyn Observer>,
}

impl Supervisor {
    pub fn new(execution_id: impl Into<String>, audit_log: Arc<AuditLog>, observer: Arc<dyn Observer>) -> Self {
        Self {
            execution_id: execution_id.into(),
            audit_log,
            observer,
        }
    }

    pub async fn run(&self, spec: SandboxSpec) -> Result<SandboxOutcome, SandboxError> {
        let scratch_path = spec
            .scratch_dir
            .join(format!("ptc-{}.{}", Uuid::new_v4(), spec.language.extension()));

        let mut source = spec.preamble.clone();
        source.push_str(&spec.code);
        let content_hash = hex_sha256(source.as_bytes());

        write_atomic(&scratch_path, source.as_bytes()).await?;

        self.observer.record_event(&ObserverEvent::SandboxSpawn {
            execution_id: self.execution_id.clone(),
            language: format!("{:?}", spec.language),
        });

        let result = self.spawn_and_wait(&spec, &scratch_path).await;

        let _ = tokio::fs::remove_file(&scratch_path).await;

        let outcome = result?;

        self.observer.record_event(&ObserverEvent::SandboxExit {
            execution_id: self.execution_id.clone(),
            exit_success: outcome.success,
            timed_out: outcome.timed_out,
        });

        self.audit_log.append(serde_json::json!({
            "action": "sandbox_exit",
            "executionId": self.execution_id,
            "contentHash": content_hash,
            "exitCode": outcome.exit_code,
            "timedOut": outcome.timed_out,
            "timestamp": now_secs(),
        }));

        Ok(outcome)
    }

    async fn spawn_and_wait(&self, spec: &SandboxSpec, scratch_path: &PathBuf) -> Result<SandboxOutcome, SandboxError> {
        let scratch_dir_str = spec.scratch_dir.to_string_lossy().to_string();
        let read_grants = spec.permissions.effective_read();
        let write_grants = spec.permissions.effective_write(&scratch_dir_str);
        let net_grants = spec.permissions.effective_net();
        if spec.language == Language::Python && spec.heap_limit_mb > 0 {
            tracing::warn!(
                heap_limit_mb = spec.heap_limit_mb,
                "python interpreter has no heap-limit flag; enforcement is advisory only"
            );
        }

        let interpreter = spec.interpreter_override.as_deref().unwrap_or_else(|| spec.language.interpreter());
        let mut cmd = Command::new(interpreter);
        cmd.env_clear();
        if let Some(flag) = spec.language.heap_limit_flag(spec.heap_limit_mb) {
            cmd.arg(flag);
        }
        cmd.arg(scratch_path);
        cmd.env("PTC_READ_GRANTS", read_grants.join(":"));
        cmd.env("PTC_WRITE_GRANTS", write_grants.join(":"));
        cmd.env("PTC_NET_GRANTS", net_grants.join(":"));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;

        let mut stdout_pipe = child.stdout.take().expect("piped stdout");
        let mut stderr_pipe = child.stderr.take().expect("piped stderr");

        // Pump stdout/stderr on their own tasks so a killed-on-timeout child
        // still yields whatever it had already written, independent of
        // whether `child.wait()` itself times out.
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let timed_out = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status_res) => {
                let status = status_res.map_err(|e| SandboxError::Internal(e.to_string()))?;
                Some(status)
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };

        let stdout_buf = stdout_task.await.unwrap_or_default();
        let stderr_buf = stderr_task.await.unwrap_or_default();
        let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();

        match timed_out {
            Some(status) => Ok(SandboxOutcome {
                success: status.success(),
                stdout,
                stderr: (!stderr.is_empty()).then_some(stderr),
                timed_out: false,
                exit_code: status.code(),
            }),
            None => Ok(SandboxOutcome {
                success: false,
                stdout,
                stderr: Some(format!("Execution timeout after {}ms", spec.timeout.as_millis())),
                timed_out: true,
                exit_code: None,
            }),
        }
    }
}

async fn write_atomic(path: &PathBuf, bytes: &[u8]) -> Result<(), SandboxError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!("{}.tmp", path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")));
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopObserver;

    fn supervisor(dir: &std::path::Path) -> Supervisor {
        Supervisor::new(
            "exec-1",
            Arc::new(AuditLog::new(dir.join("audit.jsonl"))),
            Arc::new(NoopObserver),
        )
    }

    #[tokio::test]
    async fn spawn_failure_reports_sandbox_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let spec = SandboxSpec {
            language: Language::TypeScript,
            code: "console.log(1)".into(),
            preamble: String::new(),
            timeout: Duration::from_millis(500),
            permissions: Permissions::default(),
            heap_limit_mb: 128,
            scratch_dir: dir.path().to_path_buf(),
            interpreter_override: Some("/nonexistent/interpreter-that-does-not-exist".into()),
        };
        let result = sup.run(spec).await;
        assert!(matches!(result, Err(SandboxError::SpawnFailed(_))));
    }

    #[test]
    fn effective_write_always_includes_scratch_dir() {
        let perms = Permissions::default();
        let grants = perms.effective_write("/tmp/scratch");
        assert!(grants.iter().any(|p| p == "/tmp/scratch"));
    }

    #[test]
    fn effective_write_always_includes_platform_temp_dir() {
        let perms = Permissions::default();
        let grants = perms.effective_write("/some/other/scratch");
        assert!(grants.iter().any(|p| p == &platform_temp_dir()));
    }

    #[test]
    fn effective_read_always_includes_platform_temp_dir() {
        let perms = Permissions::default();
        let grants = perms.effective_read();
        assert!(grants.iter().any(|p| p == &platform_temp_dir()));
    }

    #[test]
    fn effective_net_always_includes_loopback() {
        let perms = Permissions::default();
        let grants = perms.effective_net();
        assert!(grants.iter().any(|h| h == "127.0.0.1"));
    }

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(hex_sha256(b"hello"), hex_sha256(b"hello"));
        assert_ne!(hex_sha256(b"hello"), hex_sha256(b"world"));
    }
}
