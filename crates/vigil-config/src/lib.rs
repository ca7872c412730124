#![warn(missing_docs)]

//! # vigil-config
//!
//! Configuration loading for the Vigil audit sandbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [sandbox]
//! timeout_secs = 10
//! max_heap_mb = 64
//! max_concurrent = 8
//! max_sessions = 32
//! max_http_calls = 50
//!
//! [session]
//! prompt_timeout_secs = 300
//! execution_timeout_secs = 3600
//!
//! [ipfs]
//! gateway_url = "https://ipfs.io"
//!
//! [scripts]
//! dir = "./scripts"
//!
//! [properties]
//! rpcUrl = "https://rpc.example.org/${RPC_KEY}"
//!
//! [audit]
//! log_file = "./audit.jsonl"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level Vigil configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VigilConfig {
    /// HTTP/WebSocket front end settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Interactive session settings.
    #[serde(default)]
    pub session: SessionOverrides,

    /// Outbound HTTP settings for the `HttpClient` capability.
    #[serde(default)]
    pub http: HttpSettings,

    /// IPFS gateway settings. Without this section scripts get the no-op `Ipfs`.
    #[serde(default)]
    pub ipfs: Option<IpfsSettings>,

    /// Where stored scripts are seeded from.
    #[serde(default)]
    pub scripts: ScriptsSettings,

    /// Read-only key/value pairs exposed to scripts as `Properties`.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Evaluation audit log settings.
    #[serde(default)]
    pub audit: AuditSettings,
}

/// Front end settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSettings {
    /// Socket address to listen on (default `127.0.0.1:8080`).
    #[serde(default)]
    pub bind: Option<String>,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Execution budget in seconds. Time a session script spends waiting
    /// for an answer is not charged.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent one-shot evaluations (`vigil run` and the REST
    /// audit route). Interactive sessions do not count against it.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum concurrent interactive sessions. A session holds its slot
    /// for its whole run, prompts included.
    #[serde(default)]
    pub max_sessions: Option<usize>,

    /// Maximum script size in kilobytes.
    #[serde(default)]
    pub max_code_size_kb: Option<usize>,

    /// Maximum `HttpClient` calls per evaluation.
    #[serde(default)]
    pub max_http_calls: Option<usize>,
}

/// Interactive session overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionOverrides {
    /// How long a prompt may stay unanswered before the session fails.
    #[serde(default)]
    pub prompt_timeout_secs: Option<u64>,

    /// Execution budget of an interactive evaluation, excluding prompt waits.
    #[serde(default)]
    pub execution_timeout_secs: Option<u64>,
}

/// Outbound HTTP settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpSettings {
    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// User agent sent with every request.
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// IPFS gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IpfsSettings {
    /// Base URL of the gateway, e.g. `https://ipfs.io`.
    pub gateway_url: String,

    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Script seeding settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptsSettings {
    /// Directory holding `<uuid>.js` files to load at startup.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Audit log settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditSettings {
    /// Append one JSON line per evaluation to this file. Entries go to the
    /// tracing log when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl VigilConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: VigilConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref bind) = self.server.bind {
            if bind.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "server.bind '{}' is not a socket address",
                    bind
                )));
            }
        }
        if let Some(ref ipfs) = self.ipfs {
            let url = ipfs.gateway_url.as_str();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "ipfs.gateway_url '{}' must be an http(s) URL",
                    url
                )));
            }
        }
        let zero_checks = [
            ("sandbox.timeout_secs", self.sandbox.timeout_secs),
            ("session.prompt_timeout_secs", self.session.prompt_timeout_secs),
            (
                "session.execution_timeout_secs",
                self.session.execution_timeout_secs,
            ),
        ];
        for (name, value) in zero_checks {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        for (name, value) in [
            ("sandbox.max_concurrent", self.sandbox.max_concurrent),
            ("sandbox.max_sessions", self.sandbox.max_sessions),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `VIGIL_CONFIG` environment variable
/// 2. `./vigil.toml` in the current directory
/// 3. None (no config file found, which is not an error)
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("VIGIL_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("vigil.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Replace `${NAME}` with the value of environment variable `NAME`.
/// References to unset variables stay as written.
fn expand_env_vars(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_empty_is_valid() {
        let config = VigilConfig::from_toml("").unwrap();
        assert!(config.server.bind.is_none());
        assert!(config.ipfs.is_none());
        assert!(config.properties.is_empty());
        assert!(config.scripts.dir.is_none());
    }

    #[test]
    fn config_parses_sandbox_overrides() {
        let toml = r#"
            [sandbox]
            timeout_secs = 10
            max_heap_mb = 128
            max_concurrent = 4
            max_sessions = 12
            max_code_size_kb = 256
            max_http_calls = 20
        "#;

        let config = VigilConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.timeout_secs, Some(10));
        assert_eq!(config.sandbox.max_heap_mb, Some(128));
        assert_eq!(config.sandbox.max_concurrent, Some(4));
        assert_eq!(config.sandbox.max_sessions, Some(12));
        assert_eq!(config.sandbox.max_code_size_kb, Some(256));
        assert_eq!(config.sandbox.max_http_calls, Some(20));
    }

    #[test]
    fn config_parses_full_example() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:9000"

            [session]
            prompt_timeout_secs = 60
            execution_timeout_secs = 600

            [http]
            timeout_secs = 15
            user_agent = "vigil-test"

            [ipfs]
            gateway_url = "https://ipfs.io"
            timeout_secs = 20

            [scripts]
            dir = "/srv/scripts"

            [properties]
            network = "mainnet"
            rpcUrl = "https://rpc.example.org"

            [audit]
            log_file = "/var/log/vigil/audit.jsonl"
        "#;

        let config = VigilConfig::from_toml(toml).unwrap();
        assert_eq!(config.server.bind.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(config.session.prompt_timeout_secs, Some(60));
        assert_eq!(config.session.execution_timeout_secs, Some(600));
        assert_eq!(config.http.user_agent.as_deref(), Some("vigil-test"));
        let ipfs = config.ipfs.as_ref().unwrap();
        assert_eq!(ipfs.gateway_url, "https://ipfs.io");
        assert_eq!(ipfs.timeout_secs, Some(20));
        assert_eq!(
            config.scripts.dir.as_deref(),
            Some(Path::new("/srv/scripts"))
        );
        assert_eq!(config.properties["network"], "mainnet");
        assert_eq!(config.properties.len(), 2);
        assert_eq!(
            config.audit.log_file.as_deref(),
            Some(Path::new("/var/log/vigil/audit.jsonl"))
        );
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("VIGIL_TEST_RPC_KEY", "k3y");
        let toml = r#"
            [properties]
            rpcUrl = "https://rpc.example.org/${VIGIL_TEST_RPC_KEY}"
        "#;

        let config = VigilConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(config.properties["rpcUrl"], "https://rpc.example.org/k3y");
        std::env::remove_var("VIGIL_TEST_RPC_KEY");
    }

    #[test]
    fn config_rejects_bad_bind_address() {
        let toml = r#"
            [server]
            bind = "not-an-address"
        "#;
        let err = VigilConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("not-an-address"));
    }

    #[test]
    fn config_rejects_non_http_ipfs_gateway() {
        let toml = r#"
            [ipfs]
            gateway_url = "ipfs://local"
        "#;
        let err = VigilConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("http(s)"));
    }

    #[test]
    fn config_rejects_zero_session_pool() {
        let err = VigilConfig::from_toml("[sandbox]\nmax_sessions = 0").unwrap_err();
        assert!(err.to_string().contains("sandbox.max_sessions"));
    }

    #[test]
    fn config_rejects_zero_prompt_timeout() {
        let toml = r#"
            [session]
            prompt_timeout_secs = 0
        "#;
        let err = VigilConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("prompt_timeout_secs"));
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(
            &path,
            r#"
            [properties]
            owner = "audit-team"
        "#,
        )
        .unwrap();

        let config = VigilConfig::from_file(&path).unwrap();
        assert_eq!(config.properties["owner"], "audit-team");
    }

    #[test]
    fn unset_variables_are_left_alone() {
        assert_eq!(
            expand_env_vars("rpc ${VIGIL_SURELY_UNSET_VAR} end"),
            "rpc ${VIGIL_SURELY_UNSET_VAR} end"
        );
        assert_eq!(expand_env_vars("cost: $5 ${unclosed"), "cost: $5 ${unclosed");
        assert_eq!(expand_env_vars("plain text"), "plain text");
    }
}
