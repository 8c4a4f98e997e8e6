#![warn(missing_docs)]

//! # pairwise-sandbox
//!
//! Code-execution sandbox for Pairwise coding challenges.
//!
//! Runs a learner's JavaScript together with the challenge's test code in a
//! deno_core isolate with no filesystem, network, or environment access.
//! TypeScript challenges have their types stripped first. The
//! guest sees four globals: `console`, `expect`, `test` and `express` (an
//! in-memory request mock). Every loop is instrumented with a time guard
//! before it runs.
//!
//! ## Security model
//!
//! - **V8 isolate**: Same process-level isolation as Chrome tabs
//! - **No ambient capabilities**: `Deno`, `eval` and the Function constructors are removed
//! - **Fresh runtime per run**: Preview and test runs never share state
//! - **Pre-execution validation**: Banned patterns caught before reaching V8
//! - **Loop guards**: Runaway loops abort after a per-loop budget
//! - **Host ceiling**: A watchdog and a heap limit stop anything the guards miss
//! - **Output size limits**: Console capture is capped per run

pub mod assert;
pub mod bridge;
pub mod challenge;
pub mod error;
pub mod executor;
pub mod host;
pub mod ipc;
pub mod loop_guard;
pub mod mock;
pub mod ops;
pub mod prelude;
pub mod transpile;
pub mod validator;

pub use bridge::ChallengeBridge;
pub use challenge::{ChallengeType, Output, SandboxRequest, SandboxResponse, TestRecord, TestResult};
pub use error::SandboxError;
pub use executor::{ExecutionMode, LoopAbort, PreparedChallenge, SandboxConfig, SandboxExecutor};
pub use loop_guard::{instrument, Instrumented, LoopGuard, LoopGuardConfig, LoopGuardError};

/// Something that can run a challenge request to completion.
///
/// [`SandboxExecutor`] is the production implementation. The bridge only
/// depends on this trait.
#[async_trait::async_trait]
pub trait ChallengeRunner: Send + Sync {
    /// Run `request` and report the aggregate result.
    ///
    /// Guest failures are part of the `Ok` result. An `Err` means the
    /// challenge could not be run at all.
    async fn run_challenge(&self, request: &SandboxRequest) -> Result<TestResult, SandboxError>;
}

#[async_trait::async_trait]
impl ChallengeRunner for SandboxExecutor {
    async fn run_challenge(&self, request: &SandboxRequest) -> Result<TestResult, SandboxError> {
        SandboxExecutor::run_challenge(self, request).await
    }
}
