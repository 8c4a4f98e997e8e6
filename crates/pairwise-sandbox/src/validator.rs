//! Pre-execution checks on challenge code.
//!
//! The isolate is the real boundary. These checks reject the few patterns
//! that would reach sandbox internals before any code is compiled.

use crate::error::SandboxError;
use crate::loop_guard::{LoopGuardError, GUARD_PREFIX};

/// Maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Patterns that are banned from challenge code.
///
/// `__pairwise` names the harness internals and the loop guard bindings.
const BANNED_PATTERNS: &[&str] = &["Deno.", "Deno[", "__pairwise"];

/// Validate learner or test code before it is instrumented.
///
/// Empty code is accepted: a challenge may start from a blank editor.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }

    if code.contains(GUARD_PREFIX) {
        return Err(LoopGuardError::AlreadyInstrumented.into());
    }

    for pattern in BANNED_PATTERNS {
        if code.contains(pattern) {
            return Err(SandboxError::BannedPattern {
                pattern: (*pattern).to_string(),
            });
        }
    }

    Ok(())
}
