#![warn(missing_docs)]

//! # pairwise-config
//!
//! Configuration loading for the Pairwise challenge sandbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_secs = 5
//! loop_timeout_ms = 100
//! loop_abort = "report"
//! max_heap_mb = 64
//! max_concurrent = 8
//! max_code_kb = 64
//! max_output_kb = 1024
//! execution_mode = "child_process"
//! ```

use std::path::Path;

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

/// Top-level Pairwise configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairwiseConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,
}

/// Sandbox configuration overrides. Unset fields keep the sandbox defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Host ceiling per run, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Loop guard budget in milliseconds.
    #[serde(default)]
    pub loop_timeout_ms: Option<u64>,

    /// Loop guard behaviour: "throw" (default) or "report".
    #[serde(default)]
    pub loop_abort: Option<String>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent challenge runs.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum size of learner or test code, in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,

    /// Maximum captured console output per run, in kilobytes.
    #[serde(default)]
    pub max_output_kb: Option<usize>,

    /// Execution mode: "in_process" (default) or "child_process".
    #[serde(default)]
    pub execution_mode: Option<String>,
}

/// Accepted `loop_abort` values.
pub const LOOP_ABORT_MODES: &[&str] = &["throw", "report"];

/// Accepted `execution_mode` values.
pub const EXECUTION_MODES: &[&str] = &["in_process", "child_process"];

/// V8 refuses to start below this heap size.
const MIN_HEAP_MB: usize = 8;

impl PairwiseConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: PairwiseConfig = toml::from_str(toml_str)?;
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
        let sandbox = &self.sandbox;

        let positive = [
            ("timeout_secs", sandbox.timeout_secs.map(|v| v as usize)),
            ("loop_timeout_ms", sandbox.loop_timeout_ms.map(|v| v as usize)),
            ("max_concurrent", sandbox.max_concurrent),
            ("max_code_kb", sandbox.max_code_kb),
            ("max_output_kb", sandbox.max_output_kb),
        ];
        for (name, value) in positive {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{name} must be greater than zero"
                )));
            }
        }

        if let Some(mb) = sandbox.max_heap_mb {
            if mb < MIN_HEAP_MB {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.max_heap_mb must be at least {MIN_HEAP_MB}, got {mb}"
                )));
            }
        }

        check_choice("loop_abort", sandbox.loop_abort.as_deref(), LOOP_ABORT_MODES)?;
        check_choice(
            "execution_mode",
            sandbox.execution_mode.as_deref(),
            EXECUTION_MODES,
        )?;
        Ok(())
    }
}

fn check_choice(name: &str, value: Option<&str>, allowed: &[&str]) -> Result<(), ConfigError> {
    match value {
        Some(v) if !allowed.contains(&v) => Err(ConfigError::Invalid(format!(
            "sandbox.{name}: unsupported value '{v}', supported: {}",
            allowed.join(", ")
        ))),
        _ => Ok(()),
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unresolved placeholders stay as written
                Err(_) => result.push_str(&format!("${{{var_name}}}")),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_sandbox_overrides() {
        let toml = r#"
            [sandbox]
            timeout_secs = 10
            loop_timeout_ms = 250
            loop_abort = "report"
            max_heap_mb = 128
            max_concurrent = 4
            max_code_kb = 32
            max_output_kb = 512
        "#;

        let config = PairwiseConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.timeout_secs, Some(10));
        assert_eq!(config.sandbox.loop_timeout_ms, Some(250));
        assert_eq!(config.sandbox.loop_abort.as_deref(), Some("report"));
        assert_eq!(config.sandbox.max_heap_mb, Some(128));
        assert_eq!(config.sandbox.max_concurrent, Some(4));
        assert_eq!(config.sandbox.max_code_kb, Some(32));
        assert_eq!(config.sandbox.max_output_kb, Some(512));
    }

    #[test]
    fn config_empty_is_valid() {
        let config = PairwiseConfig::from_toml("").unwrap();
        assert!(config.sandbox.timeout_secs.is_none());
        assert!(config.sandbox.loop_abort.is_none());
        assert!(config.sandbox.execution_mode.is_none());
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("PAIRWISE_TEST_LOOP_MS", "75");
        let toml = r#"
            [sandbox]
            loop_timeout_ms = ${PAIRWISE_TEST_LOOP_MS}
        "#;

        let config = PairwiseConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(config.sandbox.loop_timeout_ms, Some(75));
        std::env::remove_var("PAIRWISE_TEST_LOOP_MS");
    }

    #[test]
    fn config_rejects_unknown_loop_abort() {
        let toml = r#"
            [sandbox]
            loop_abort = "ignore"
        "#;

        let msg = PairwiseConfig::from_toml(toml).unwrap_err().to_string();
        assert!(msg.contains("ignore"), "error should mention the value: {msg}");
        assert!(msg.contains("throw, report"), "error should list choices: {msg}");
    }

    #[test]
    fn config_rejects_unknown_execution_mode() {
        let toml = r#"
            [sandbox]
            execution_mode = "remote"
        "#;

        let msg = PairwiseConfig::from_toml(toml).unwrap_err().to_string();
        assert!(msg.contains("in_process"), "{msg}");
    }

    #[test]
    fn config_rejects_zero_limits() {
        for field in ["timeout_secs", "loop_timeout_ms", "max_concurrent", "max_code_kb"] {
            let toml = format!("[sandbox]\n{field} = 0\n");
            let err = PairwiseConfig::from_toml(&toml).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid(ref m) if m.contains(field)),
                "{field}: {err}"
            );
        }
    }

    #[test]
    fn config_rejects_tiny_heap() {
        let err = PairwiseConfig::from_toml("[sandbox]\nmax_heap_mb = 2\n").unwrap_err();
        assert!(err.to_string().contains("at least 8"));
    }

    #[test]
    fn config_rejects_unknown_keys() {
        let err = PairwiseConfig::from_toml("[sandbox]\nmax_tool_calls = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairwise.toml");
        std::fs::write(
            &path,
            r#"
            [sandbox]
            execution_mode = "child_process"
        "#,
        )
        .unwrap();

        let config = PairwiseConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.execution_mode.as_deref(), Some("child_process"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PairwiseConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        assert_eq!(expand_env_vars("no variables here"), "no variables here");
    }
}
