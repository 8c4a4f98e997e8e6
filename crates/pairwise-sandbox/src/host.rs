//! SandboxHost: parent-side management of isolated worker child processes.
//!
//! Spawns `pairwise-worker` as a child process with a clean environment,
//! sends it one prepared challenge over length-delimited JSON IPC
//! (stdin/stdout) and waits for the [`TestResult`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::Command;

use crate::challenge::TestResult;
use crate::error::SandboxError;
use crate::executor::PreparedChallenge;
use crate::ipc::{read_message_with_limit, write_message, ChildMessage, ParentMessage, WorkerConfig};

/// Name of the worker executable.
pub const WORKER_BIN_NAME: &str = "pairwise-worker";

/// Environment variable overriding the worker location. Must be absolute.
pub const WORKER_BIN_ENV: &str = "PAIRWISE_WORKER_BIN";

/// When set, worker stderr is inherited instead of discarded.
pub const DEBUG_ENV: &str = "PAIRWISE_DEBUG";

/// Manages spawning and communicating with sandbox worker child processes.
pub struct SandboxHost;

impl SandboxHost {
    /// Run a prepared challenge in an isolated child process.
    ///
    /// The worker performs two runs, each bounded by `config.timeout`, so the
    /// host deadline is twice that plus a grace period for process start-up.
    /// On deadline the child is killed.
    pub async fn run_in_child(
        challenge: PreparedChallenge,
        config: &crate::SandboxConfig,
    ) -> Result<TestResult, SandboxError> {
        let worker_bin = find_worker_binary()?;
        let worker_config = WorkerConfig::from(config);
        let deadline = host_deadline(config.timeout);

        let mut child = Command::new(&worker_bin)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if std::env::var(DEBUG_ENV).is_ok() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!(
                    "failed to spawn worker at {}: {}",
                    worker_bin.display(),
                    e
                ))
            })?;
        tracing::debug!(worker = %worker_bin.display(), pid = ?child.id(), "worker spawned");

        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdin on child")))?;
        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdout on child")))?;
        let mut child_stdout = BufReader::new(child_stdout);

        let execute_msg = ParentMessage::Execute {
            challenge,
            config: worker_config,
        };
        write_message(&mut child_stdin, &execute_msg)
            .await
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!("failed to send Execute: {}", e))
            })?;
        // The worker reads exactly one message.
        drop(child_stdin);

        let max_message = config.max_ipc_message_size;
        let result = tokio::time::timeout(deadline, async {
            read_message_with_limit::<ChildMessage, _>(&mut child_stdout, max_message).await
        })
        .await;

        match result {
            Ok(Ok(Some(ChildMessage::ExecutionComplete { result }))) => {
                let _ = child.wait().await;
                result.map_err(|message| {
                    SandboxError::Execution(anyhow::anyhow!("worker failed: {message}"))
                })
            }
            Ok(Ok(None)) => Err(SandboxError::Execution(anyhow::anyhow!(
                "worker exited without sending result"
            ))),
            Ok(Err(e)) => Err(SandboxError::Execution(anyhow::anyhow!(
                "IPC read error: {}",
                e
            ))),
            Err(_elapsed) => {
                let _ = child.kill().await;
                tracing::warn!(deadline_ms = deadline.as_millis() as u64, "worker killed at deadline");
                Err(SandboxError::Timeout {
                    timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

/// Host-side deadline for a worker running two isolates.
fn host_deadline(timeout: Duration) -> Duration {
    timeout.saturating_mul(2) + Duration::from_secs(2)
}

/// Find the `pairwise-worker` binary.
///
/// Search order:
/// 1. `PAIRWISE_WORKER_BIN` environment variable (must be absolute path)
/// 2. Same directory as the current executable, then its parent
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
pub fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            // Test binaries live in target/<profile>/deps/, the worker one level up.
            for candidate in [Some(dir), dir.parent()].into_iter().flatten() {
                let worker = candidate.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::Execution(anyhow::anyhow!(
        "{WORKER_BIN_NAME} binary not found. Set {WORKER_BIN_ENV} or install it alongside pairwise"
    )))
}

/// Reject world-writable worker binaries (Unix only).
fn validate_binary_permissions(_path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "cannot read metadata for {}: {}",
                _path.display(),
                e
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn deadline_covers_both_runs() {
        assert_eq!(host_deadline(Duration::from_secs(5)), Duration::from_secs(12));
        assert_eq!(host_deadline(Duration::ZERO), Duration::from_secs(2));
    }

    #[test]
    #[serial]
    fn find_worker_binary_rejects_relative_env_var() {
        std::env::set_var(WORKER_BIN_ENV, "./relative/path");
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("absolute"), "expected 'absolute' in error: {err}");
    }

    #[test]
    #[serial]
    fn missing_worker_error_names_the_override() {
        std::env::remove_var(WORKER_BIN_ENV);
        if let Err(e) = find_worker_binary() {
            let msg = e.to_string();
            assert!(!msg.contains("PATH"), "error should not mention PATH: {msg}");
            assert!(msg.contains(WORKER_BIN_ENV), "error should guide user: {msg}");
        }
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn find_worker_binary_rejects_world_writable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o777)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, bin.to_str().unwrap());
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);

        let err = result.unwrap_err().to_string();
        assert!(err.contains("insecure"), "expected 'insecure' in error: {err}");
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn find_worker_binary_accepts_secure_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, bin.to_str().unwrap());
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);

        assert_eq!(result.unwrap(), bin);
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn worker_that_exits_silently_is_an_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, bin.to_str().unwrap());
        let result = SandboxHost::run_in_child(
            PreparedChallenge {
                code: String::new(),
                test_code: String::new(),
            },
            &crate::SandboxConfig::default(),
        )
        .await;
        std::env::remove_var(WORKER_BIN_ENV);

        let err = result.unwrap_err().to_string();
        assert!(
            err.contains("without sending result") || err.contains("Execute"),
            "unexpected error: {err}"
        );
    }
}
