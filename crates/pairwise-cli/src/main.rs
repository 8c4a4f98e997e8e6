#![warn(missing_docs)]

//! Pairwise challenge sandbox
//!
//! Run a learner's code against a challenge's tests, instrument loops, or
//! serve sandbox requests over stdio.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pairwise_config::PairwiseConfig;
use pairwise_sandbox::{
    ChallengeBridge, ChallengeType, ExecutionMode, LoopAbort, LoopGuardConfig, SandboxConfig,
    SandboxExecutor, SandboxRequest,
};
use tracing_subscriber::EnvFilter;

/// Pairwise code-execution sandbox
#[derive(Parser, Debug)]
#[command(name = "pairwise")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $PAIRWISE_CONFIG, then ./pairwise.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a challenge and print the response as JSON
    Run {
        /// File with the learner's code
        #[arg(long)]
        code: PathBuf,
        /// File with the challenge's test code
        #[arg(long)]
        test: Option<PathBuf>,
        /// Challenge type: javascript, typescript or markup
        #[arg(long = "type", default_value = "javascript")]
        kind: ChallengeType,
        /// Correlation id echoed in the response
        #[arg(long, default_value = "cli")]
        channel: String,
    },
    /// Print a file with loop guards inserted
    Instrument {
        /// JavaScript source file
        file: PathBuf,
        /// Loop budget in milliseconds
        #[arg(long, default_value_t = 100)]
        timeout_ms: u64,
        /// Call this function with (line, column) and break instead of throwing
        #[arg(long)]
        callback: Option<String>,
        /// Parse the file as an ES module (allows import and export)
        #[arg(long)]
        module: bool,
    },
    /// Answer newline-delimited JSON requests from stdin on stdout
    Serve,
}

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &pairwise_config::SandboxOverrides) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    if let Some(timeout) = overrides.timeout_secs {
        config.timeout = Duration::from_secs(timeout);
    }
    if let Some(ms) = overrides.loop_timeout_ms {
        config.loop_timeout = Duration::from_millis(ms);
    }
    if let Some(ref abort) = overrides.loop_abort {
        config.loop_abort = match abort.as_str() {
            "report" => LoopAbort::Report,
            _ => LoopAbort::Throw,
        };
    }
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap * 1024 * 1024;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(kb) = overrides.max_code_kb {
        config.max_code_size = kb * 1024;
    }
    if let Some(kb) = overrides.max_output_kb {
        config.max_output_size = kb * 1024;
    }
    if let Some(ref mode) = overrides.execution_mode {
        config.execution_mode = match mode.as_str() {
            "child_process" => ExecutionMode::ChildProcess,
            _ => ExecutionMode::InProcess,
        };
    }
    config
}

/// Locate the config file.
///
/// Search order:
/// 1. `--config`
/// 2. `PAIRWISE_CONFIG` environment variable
/// 3. `./pairwise.toml` in the current directory
/// 4. None (no config file found, not an error)
fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("PAIRWISE_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("pairwise.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config(explicit: Option<&Path>) -> Result<PairwiseConfig> {
    match find_config_file(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            PairwiseConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using sandbox defaults");
            Ok(PairwiseConfig::default())
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run {
            code,
            test,
            kind,
            channel,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let executor = SandboxExecutor::new(build_sandbox_config(&config.sandbox));
            let bridge = ChallengeBridge::new(Arc::new(executor), 1);

            let request = SandboxRequest {
                code: read_source(&code)?,
                test_code: match test {
                    Some(path) => read_source(&path)?,
                    None => String::new(),
                },
                kind,
                channel,
            };

            let response = bridge.handle(request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(if response.result.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Instrument {
            file,
            timeout_ms,
            callback,
            module,
        } => {
            let mut guard_config = LoopGuardConfig::with_timeout(Duration::from_millis(timeout_ms));
            if let Some(name) = callback {
                guard_config = guard_config.callback(name);
            }
            if module {
                guard_config = guard_config.module();
            }
            let source = read_source(&file)?;
            let instrumented = pairwise_sandbox::instrument(&source, &guard_config)
                .with_context(|| format!("failed to instrument {}", file.display()))?;
            for site in &instrumented.loops {
                tracing::info!(kind = ?site.kind, line = site.line, column = site.column, "loop guarded");
            }
            print!("{}", instrumented.code);
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => {
            let config = load_config(cli.config.as_deref())?;
            let sandbox_config = build_sandbox_config(&config.sandbox);
            let max_in_flight = sandbox_config.max_concurrent;
            tracing::info!(
                max_concurrent = max_in_flight,
                mode = ?sandbox_config.execution_mode,
                "Pairwise sandbox serving on stdio"
            );

            let bridge = ChallengeBridge::new(Arc::new(SandboxExecutor::new(sandbox_config)), max_in_flight);
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());

            tokio::select! {
                result = bridge.serve(stdin, tokio::io::stdout()) => {
                    result.context("sandbox bridge stopped")?;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received shutdown signal, stopping");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_overridden() {
        let config = build_sandbox_config(&pairwise_config::SandboxOverrides::default());
        let defaults = SandboxConfig::default();
        assert_eq!(config.timeout, defaults.timeout);
        assert_eq!(config.loop_timeout, defaults.loop_timeout);
        assert_eq!(config.loop_abort, LoopAbort::Throw);
        assert_eq!(config.execution_mode, ExecutionMode::InProcess);
    }

    #[test]
    fn overrides_are_applied_with_units() {
        let config = PairwiseConfig::from_toml(
            r#"
            [sandbox]
            timeout_secs = 2
            loop_timeout_ms = 40
            loop_abort = "report"
            max_heap_mb = 32
            max_concurrent = 3
            max_code_kb = 16
            max_output_kb = 8
            execution_mode = "child_process"
        "#,
        )
        .unwrap();

        let sandbox = build_sandbox_config(&config.sandbox);
        assert_eq!(sandbox.timeout, Duration::from_secs(2));
        assert_eq!(sandbox.loop_timeout, Duration::from_millis(40));
        assert_eq!(sandbox.loop_abort, LoopAbort::Report);
        assert_eq!(sandbox.max_heap_size, 32 * 1024 * 1024);
        assert_eq!(sandbox.max_concurrent, 3);
        assert_eq!(sandbox.max_code_size, 16 * 1024);
        assert_eq!(sandbox.max_output_size, 8 * 1024);
        assert_eq!(sandbox.execution_mode, ExecutionMode::ChildProcess);
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = PathBuf::from("/definitely/not/here.toml");
        assert_eq!(find_config_file(Some(&path)), Some(path));
    }

    #[test]
    fn cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "pairwise", "run", "--code", "a.js", "--test", "b.js", "--type", "ts", "--channel", "7",
        ])
        .unwrap();
        match cli.command {
            Command::Run { kind, channel, test, .. } => {
                assert_eq!(kind, ChallengeType::Typescript);
                assert_eq!(channel, "7");
                assert_eq!(test, Some(PathBuf::from("b.js")));
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn cli_parses_instrument_flags() {
        let cli = Cli::try_parse_from([
            "pairwise", "instrument", "lib.mjs", "--timeout-ms", "25", "--module",
        ])
        .unwrap();
        match cli.command {
            Command::Instrument { timeout_ms, module, callback, .. } => {
                assert_eq!(timeout_ms, 25);
                assert!(module);
                assert_eq!(callback, None);
            }
            other => panic!("expected Instrument, got {other:?}"),
        }
    }

    #[test]
    fn cli_rejects_unknown_challenge_type() {
        let err = Cli::try_parse_from(["pairwise", "run", "--code", "a.js", "--type", "python"])
            .unwrap_err();
        assert!(err.to_string().contains("python"));
    }
}
