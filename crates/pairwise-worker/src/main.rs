//! Pairwise sandbox worker: isolated child process for V8 execution.
//!
//! This binary is spawned by [`pairwise_sandbox::host::SandboxHost`] in the
//! parent process. It receives one prepared challenge and its configuration
//! over stdin, runs the preview and test isolates, and sends the
//! [`TestResult`](pairwise_sandbox::TestResult) back over stdout.
//!
//! **Security**: This process runs with a clean environment and no inherited
//! state from the host.

use anyhow::{Context, Result};
use pairwise_sandbox::ipc::{read_message, write_message, ChildMessage, ParentMessage};
use tokio::io::{self, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Clean environment: remove all env vars for security isolation
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    // Minimal logging to stderr; the host inherits it only in debug mode
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let msg: ParentMessage = read_message(&mut stdin)
        .await
        .context("failed to read initial message from parent")?
        .context("parent closed stdin before sending Execute")?;

    let ParentMessage::Execute { challenge, config } = msg;
    let sandbox_config = config.to_sandbox_config();

    // V8 isolates are !Send: run on a dedicated thread with its own runtime
    let (tx, rx) = oneshot::channel::<Result<pairwise_sandbox::TestResult, String>>();
    let exec_handle = std::thread::spawn(move || {
        let result = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt
                .block_on(pairwise_sandbox::executor::run_prepared(
                    &sandbox_config,
                    &challenge,
                ))
                .map_err(|e| e.to_string()),
            Err(e) => Err(format!("failed to create tokio runtime: {e}")),
        };
        if tx.send(result).is_err() {
            tracing::warn!("result receiver dropped");
        }
    });

    let result = rx
        .await
        .unwrap_or_else(|_| Err("worker thread exited unexpectedly".into()));
    if let Err(e) = &result {
        tracing::warn!(error = %e, "challenge did not run");
    }

    write_message(&mut stdout, &ChildMessage::ExecutionComplete { result })
        .await
        .context("failed to write result to parent")?;
    stdout.flush().await?;

    let _ = exec_handle.join();
    Ok(())
}
