//! Message bridge between a host and the sandbox.
//!
//! Requests and responses are correlated by `channel`. The bridge never fails
//! a request: anything that stops a challenge from running comes back as a
//! failed [`TestResult`] whose stderr carries the reason.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};

use crate::challenge::{ChallengeType, SandboxRequest, SandboxResponse, TestResult};
use crate::ChallengeRunner;

/// Routes [`SandboxRequest`]s to a runner and answers on the same channel.
#[derive(Clone)]
pub struct ChallengeBridge {
    runner: Arc<dyn ChallengeRunner>,
    max_in_flight: usize,
}

impl ChallengeBridge {
    /// Create a bridge that runs at most `max_in_flight` requests at once.
    pub fn new(runner: Arc<dyn ChallengeRunner>, max_in_flight: usize) -> Self {
        Self {
            runner,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Run one request and build its response.
    pub async fn handle(&self, request: SandboxRequest) -> SandboxResponse {
        let result = match self.runner.run_challenge(&request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(channel = %request.channel, error = %e, "challenge rejected");
                TestResult::from_error(e.to_string())
            }
        };
        SandboxResponse {
            channel: request.channel,
            kind: request.kind,
            result,
        }
    }

    /// Serve newline-delimited JSON requests from `reader`, writing one
    /// response line per request to `writer` in completion order.
    ///
    /// Returns once the input is exhausted and every in-flight request has
    /// been answered. A task that panics is still answered, with a failed
    /// result. If a write fails, all in-flight requests are aborted and the
    /// write error is returned.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks: JoinSet<SandboxResponse> = JoinSet::new();
        let mut in_flight: HashMap<Id, (String, ChallengeType)> = HashMap::new();
        let mut lines = reader.lines();
        let mut input_open = true;

        loop {
            tokio::select! {
                line = lines.next_line(), if input_open => {
                    match line {
                        Ok(Some(line)) => self.dispatch(&line, &permits, &mut tasks, &mut in_flight),
                        Ok(None) => {
                            tracing::debug!(in_flight = tasks.len(), "input closed, draining");
                            input_open = false;
                        }
                        Err(e) => {
                            tasks.abort_all();
                            return Err(e);
                        }
                    }
                }
                Some(joined) = tasks.join_next_with_id() => {
                    let response = match joined {
                        Ok((id, response)) => {
                            in_flight.remove(&id);
                            response
                        }
                        Err(e) => {
                            let Some((channel, kind)) = in_flight.remove(&e.id()) else {
                                tracing::warn!(error = %e, "untracked challenge task failed");
                                continue;
                            };
                            tracing::warn!(channel = %channel, error = %e, "challenge task did not complete");
                            SandboxResponse {
                                channel,
                                kind,
                                result: TestResult::from_error(format!("challenge did not complete: {e}")),
                            }
                        }
                    };
                    if let Err(e) = write_response(&mut writer, &response).await {
                        tracing::warn!(
                            channel = %response.channel,
                            error = %e,
                            in_flight = tasks.len(),
                            "response writer failed, aborting in-flight challenges"
                        );
                        tasks.abort_all();
                        return Err(e);
                    }
                }
                else => break,
            }
        }

        Ok(())
    }

    fn dispatch(
        &self,
        line: &str,
        permits: &Arc<Semaphore>,
        tasks: &mut JoinSet<SandboxResponse>,
        in_flight: &mut HashMap<Id, (String, ChallengeType)>,
    ) {
        if line.trim().is_empty() {
            return;
        }
        let request: SandboxRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed request");
                return;
            }
        };

        let route = (request.channel.clone(), request.kind);
        let bridge = self.clone();
        let permits = permits.clone();
        let handle = tasks.spawn(async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await.ok();
            bridge.handle(request).await
        });
        in_flight.insert(handle.id(), route);
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &SandboxResponse,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
