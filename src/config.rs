//! Process-wide configuration, loaded once from the environment at startup.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::upstream::{BackendSpec, Transport};

/// Aggregate configuration for the broker process. Resolved once by
/// [`Config::from_env`] before any port is bound; every field is immutable
/// for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub admission: AdmissionConfig,
    pub state_dir: PathBuf,
    pub audit_log_path: PathBuf,
    pub observability_backend: String,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub discovery_timeout_ms: u64,
    pub tool_call_timeout_ms: u64,
    pub skip_dangerous_pattern_check: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let state_dir = optional_env("PTC_STATE_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir);

        let audit_log_path = optional_env("PTC_AUDIT_LOG_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("audit.log"));

        Ok(Self {
            admission: AdmissionConfig::from_env()?,
            audit_log_path,
            observability_backend: parse_optional_env("PTC_OBSERVABILITY_BACKEND", "none".to_string())?,
            llm: LlmConfig::from_env()?,
            sandbox: SandboxConfig::from_env()?,
            discovery_timeout_ms: parse_optional_env("PTC_DISCOVERY_TIMEOUT_MS", 500u64)?,
            tool_call_timeout_ms: parse_optional_env("PTC_TOOL_CALL_TIMEOUT_MS", 30_000u64)?,
            skip_dangerous_pattern_check: parse_optional_env(
                "PTC_SKIP_DANGEROUS_PATTERN_CHECK",
                false,
            )?,
            state_dir,
        })
    }
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("ptc-broker")
}

/// Admission pool sizing (C2). Bounds per §6: concurrency 1–1000, queue
/// 1–1000, queue timeout 1000–300000ms.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub queue_timeout: Duration,
}

impl AdmissionConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let max_concurrent = parse_optional_env("PTC_MAX_CONCURRENT", 100usize)?;
        if !(1..=1000).contains(&max_concurrent) {
            return Err(ConfigError::InvalidValue {
                key: "PTC_MAX_CONCURRENT".into(),
                message: format!("must be in 1..=1000, got {max_concurrent}"),
            });
        }

        let queue_size = parse_optional_env("PTC_QUEUE_SIZE", 200usize)?;
        if !(1..=1000).contains(&queue_size) {
            return Err(ConfigError::InvalidValue {
                key: "PTC_QUEUE_SIZE".into(),
                message: format!("must be in 1..=1000, got {queue_size}"),
            });
        }

        let queue_timeout_ms = parse_optional_env("PTC_QUEUE_TIMEOUT_MS", 30_000u64)?;
        if !(1_000..=300_000).contains(&queue_timeout_ms) {
            return Err(ConfigError::InvalidValue {
                key: "PTC_QUEUE_TIMEOUT_MS".into(),
                message: format!("must be in 1000..=300000, got {queue_timeout_ms}"),
            });
        }

        Ok(Self {
            max_concurrent,
            queue_size,
            queue_timeout: Duration::from_millis(queue_timeout_ms),
        })
    }
}

/// Upstream LLM provider settings for the sampling broker (C9).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model_allowlist: Vec<String>,
    pub system_prompt_allowlist: Vec<String>,
}

impl LlmConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: parse_optional_env(
                "PTC_LLM_BASE_URL",
                "https://api.anthropic.com".to_string(),
            )?,
            api_key: optional_env("PTC_LLM_API_KEY")?.map(SecretString::from),
            model_allowlist: parse_csv_env("PTC_LLM_MODEL_ALLOWLIST")?,
            system_prompt_allowlist: parse_csv_env("PTC_LLM_SYSTEM_PROMPT_ALLOWLIST")?,
        })
    }
}

/// Sandbox supervisor settings (C11).
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub heap_limit_mb: u64,
    pub backends_config_path: Option<PathBuf>,
}

impl SandboxConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            heap_limit_mb: parse_optional_env("PTC_SANDBOX_HEAP_LIMIT_MB", 128u64)?,
            backends_config_path: optional_env("PTC_BACKENDS_CONFIG_PATH")?.map(PathBuf::from),
        })
    }
}

/// One entry in the JSON file named by `PTC_BACKENDS_CONFIG_PATH`. `Transport`
/// itself carries a `SecretString` field and deliberately doesn't derive
/// `Deserialize` (secrets shouldn't be parseable from arbitrary config
/// shapes without an explicit opt-in); this mirrors that shape and converts.
#[derive(Debug, Deserialize)]
#[serde(tag = "transport", rename_all = "camelCase")]
enum BackendTransportConfig {
    LocalProcess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    HttpStream {
        #[serde(rename = "baseUrl")]
        base_url: String,
        #[serde(rename = "bearerToken", default)]
        bearer_token: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct BackendConfigEntry {
    name: String,
    #[serde(flatten)]
    transport: BackendTransportConfig,
}

/// Load the backend pool descriptor list from the JSON file at `path`, or an
/// empty pool if no path was configured. Called once at startup, same as
/// every other piece of `Config`.
pub fn load_backend_specs(path: Option<&std::path::Path>) -> Result<Vec<BackendSpec>, ConfigError> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let bytes = std::fs::read(path)?;
    let entries: Vec<BackendConfigEntry> = serde_json::from_slice(&bytes)
        .map_err(|e| ConfigError::ParseError(format!("invalid backends config at {}: {e}", path.display())))?;

    Ok(entries
        .into_iter()
        .map(|entry| BackendSpec {
            name: entry.name,
            transport: match entry.transport {
                BackendTransportConfig::LocalProcess { command, args } => Transport::LocalProcess { command, args },
                BackendTransportConfig::HttpStream { base_url, bearer_token } => Transport::HttpStream {
                    base_url,
                    bearer_token: bearer_token.map(SecretString::from),
                },
            },
        })
        .collect())
}

/// Read an optional environment variable. An empty string is treated the
/// same as unset, matching the convention used throughout this codebase for
/// env-driven optional config.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!("failed to read {key}: {e}"))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

fn parse_csv_env(key: &str) -> Result<Vec<String>, ConfigError> {
    Ok(optional_env(key)?
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes env-var-mutating tests and restores prior values on drop.
    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(k, _)| (k.to_string(), std::env::var(k).ok()))
            .collect();
        for (k, v) in vars {
            unsafe { std::env::set_var(k, v) };
        }
        f();
        for (k, v) in saved {
            match v {
                Some(v) => unsafe { std::env::set_var(&k, v) },
                None => unsafe { std::env::remove_var(&k) },
            }
        }
    }

    fn without_env_vars<F: FnOnce()>(vars: &[&str], f: F) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|k| (k.to_string(), std::env::var(k).ok()))
            .collect();
        for k in vars {
            unsafe { std::env::remove_var(k) };
        }
        f();
        for (k, v) in saved {
            if let Some(v) = v {
                unsafe { std::env::set_var(&k, v) };
            }
        }
    }

    #[test]
    fn admission_defaults() {
        without_env_vars(
            &["PTC_MAX_CONCURRENT", "PTC_QUEUE_SIZE", "PTC_QUEUE_TIMEOUT_MS"],
            || {
                let cfg = AdmissionConfig::from_env().unwrap();
                assert_eq!(cfg.max_concurrent, 100);
                assert_eq!(cfg.queue_size, 200);
                assert_eq!(cfg.queue_timeout, Duration::from_secs(30));
            },
        );
    }

    #[test]
    fn admission_rejects_out_of_range_concurrency() {
        with_env_vars(&[("PTC_MAX_CONCURRENT", "0")], || {
            let err = AdmissionConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }));
        });
        with_env_vars(&[("PTC_MAX_CONCURRENT", "1001")], || {
            let err = AdmissionConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }));
        });
    }

    #[test]
    fn admission_rejects_out_of_range_queue_timeout() {
        with_env_vars(&[("PTC_QUEUE_TIMEOUT_MS", "999")], || {
            let err = AdmissionConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }));
        });
        with_env_vars(&[("PTC_QUEUE_TIMEOUT_MS", "300001")], || {
            let err = AdmissionConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }));
        });
    }

    #[test]
    fn admission_rejects_non_numeric() {
        with_env_vars(&[("PTC_MAX_CONCURRENT", "not-a-number")], || {
            let err = AdmissionConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }));
        });
    }

    #[test]
    fn admission_honors_valid_overrides() {
        with_env_vars(
            &[
                ("PTC_MAX_CONCURRENT", "50"),
                ("PTC_QUEUE_SIZE", "10"),
                ("PTC_QUEUE_TIMEOUT_MS", "5000"),
            ],
            || {
                let cfg = AdmissionConfig::from_env().unwrap();
                assert_eq!(cfg.max_concurrent, 50);
                assert_eq!(cfg.queue_size, 10);
                assert_eq!(cfg.queue_timeout, Duration::from_secs(5));
            },
        );
    }

    #[test]
    fn llm_model_allowlist_parses_csv() {
        with_env_vars(
            &[("PTC_LLM_MODEL_ALLOWLIST", "claude-3-opus, claude-3-haiku ,")],
            || {
                let cfg = LlmConfig::from_env().unwrap();
                assert_eq!(cfg.model_allowlist, vec!["claude-3-opus", "claude-3-haiku"]);
            },
        );
    }

    #[test]
    fn llm_allowlist_empty_by_default() {
        without_env_vars(&["PTC_LLM_MODEL_ALLOWLIST"], || {
            let cfg = LlmConfig::from_env().unwrap();
            assert!(cfg.model_allowlist.is_empty());
        });
    }

    #[test]
    fn sandbox_defaults() {
        without_env_vars(&["PTC_SANDBOX_HEAP_LIMIT_MB"], || {
            let cfg = SandboxConfig::from_env().unwrap();
            assert_eq!(cfg.heap_limit_mb, 128);
        });
    }

    #[test]
    fn missing_backends_path_yields_empty_pool() {
        assert!(load_backend_specs(None).unwrap().is_empty());
    }

    #[test]
    fn backends_config_parses_both_transports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backends.json");
        std::fs::write(
            &path,
            r#"[
                {"name": "fs", "transport": "localProcess", "command": "fs-backend", "args": ["--stdio"]},
                {"name": "search", "transport": "httpStream", "baseUrl": "https://example.test", "bearerToken": "tok"}
            ]"#,
        )
        .unwrap();

        let specs = load_backend_specs(Some(&path)).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "fs");
        assert!(matches!(specs[0].transport, Transport::LocalProcess { .. }));
        assert_eq!(specs[1].name, "search");
        assert!(matches!(specs[1].transport, Transport::HttpStream { .. }));
    }

    #[test]
    fn empty_string_env_var_treated_as_unset() {
        with_env_vars(&[("PTC_LLM_BASE_URL", "")], || {
            let cfg = LlmConfig::from_env().unwrap();
            assert_eq!(cfg.base_url, "https://api.anthropic.com");
        });
    }
}
