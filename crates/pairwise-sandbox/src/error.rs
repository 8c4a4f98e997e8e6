//! Error types for the Pairwise sandbox.

use thiserror::Error;

use crate::loop_guard::LoopGuardError;

/// Errors that can occur while preparing or running a challenge.
///
/// Guest-level failures (uncaught exceptions, assertion failures, loop aborts,
/// timeouts) are not errors at this level: they are folded into the
/// [`Output`](crate::challenge::Output) of the run that produced them.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned code pattern was detected during validation.
    #[error("banned pattern detected: `{pattern}`. The sandbox has no runtime, filesystem or network access.")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// The challenge type has no runner in this sandbox.
    #[error("unsupported challenge type `{kind}`: only javascript and typescript challenges can be executed")]
    UnsupportedChallenge {
        /// The requested challenge type.
        kind: String,
    },

    /// TypeScript source could not be lowered to JavaScript.
    #[error("SyntaxError: {reason}")]
    Transpile {
        /// The first parser or transformer diagnostic.
        reason: String,
    },

    /// Loop instrumentation rejected the code.
    #[error(transparent)]
    LoopGuard(#[from] LoopGuardError),

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// A JavaScript error escaped the harness (e.g. the prelude failed to load).
    #[error("javascript error: {message}")]
    JsError {
        /// The error message from JavaScript.
        message: String,
    },

    /// Too many concurrent sandbox executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// The worker process did not answer within the host deadline.
    #[error("sandbox did not respond within {timeout_ms}ms")]
    Timeout {
        /// Host deadline in milliseconds.
        timeout_ms: u64,
    },
}
