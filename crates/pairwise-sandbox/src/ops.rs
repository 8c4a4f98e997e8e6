//! deno_core op definitions for the Pairwise sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
#![allow(missing_docs)]

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;

use crate::assert::{self, TestLedger};
use crate::mock::{Method, MockRegistry};

/// Marker appended once when a stream hits its size limit.
const TRUNCATION_NOTICE: &str = "\n[output truncated]\n";

/// Which console stream a write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// `console.log`, `console.info`, `console.debug`.
    Stdout,
    /// `console.warn`, `console.error` and sandbox diagnostics.
    Stderr,
}

/// Console output captured during one run, stored in OpState.
#[derive(Debug, Default)]
pub struct CapturedOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    max_size: usize,
    truncated: bool,
}

impl CapturedOutput {
    /// Create a buffer that keeps at most `max_size` bytes across both streams.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    /// Append `text` to `stream`, truncating at a char boundary once the
    /// limit is reached.
    pub fn push(&mut self, stream: Stream, text: &str) {
        if self.truncated {
            return;
        }
        let used = self.stdout.len() + self.stderr.len();
        let room = self.max_size.saturating_sub(used);
        let target = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        if text.len() <= room {
            target.push_str(text);
            return;
        }
        let mut end = room;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        target.push_str(&text[..end]);
        target.push_str(TRUNCATION_NOTICE);
        self.truncated = true;
    }

    /// Append a sandbox diagnostic to stderr, bypassing the size limit.
    pub fn diagnostic(&mut self, line: &str) {
        if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
            self.stderr.push('\n');
        }
        self.stderr.push_str(line);
        self.stderr.push('\n');
    }

    /// Whether the size limit was hit.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// How the harness finished, stored in OpState by `op_pairwise_finish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// An uncaught exception escaped the guest code.
    pub failed: bool,
}

#[op2(fast)]
pub fn op_pairwise_stdout(state: &mut OpState, #[string] text: &str) {
    state.borrow_mut::<CapturedOutput>().push(Stream::Stdout, text);
}

#[op2(fast)]
pub fn op_pairwise_stderr(state: &mut OpState, #[string] text: &str) {
    state.borrow_mut::<CapturedOutput>().push(Stream::Stderr, text);
}

/// Evaluate an assertion. Returns the failure message, or an empty string on
/// success.
#[op2]
#[string]
pub fn op_pairwise_expect(
    #[string] matcher: &str,
    #[string] received: &str,
    #[string] expected: &str,
    negated: bool,
) -> String {
    match assert::evaluate(matcher, received, expected, negated) {
        Ok(()) => String::new(),
        Err(e) => e.message().to_string(),
    }
}

#[op2(fast)]
#[smi]
pub fn op_pairwise_test_begin(state: &mut OpState, #[string] message: &str) -> u32 {
    state.borrow_mut::<TestLedger>().begin(message) as u32
}

#[op2(fast)]
pub fn op_pairwise_test_end(
    state: &mut OpState,
    #[smi] slot: u32,
    passed: bool,
    #[string] error: &str,
) {
    let outcome = if passed {
        Ok(())
    } else {
        Err(error.to_string())
    };
    if !state
        .borrow_mut::<TestLedger>()
        .finish(slot as usize, outcome)
    {
        tracing::debug!(slot, "test slot settled twice or never registered");
    }
}

#[op2(fast)]
#[smi]
pub fn op_pairwise_mock_create(state: &mut OpState) -> u32 {
    state.borrow_mut::<MockRegistry>().create()
}

/// Register a route. `handler` indexes the prelude's handler array.
#[op2(fast)]
pub fn op_pairwise_mock_route(
    state: &mut OpState,
    #[smi] server: u32,
    #[string] method: &str,
    #[string] path: &str,
    #[smi] handler: u32,
) -> Result<(), JsErrorBox> {
    let method: Method = method.parse().map_err(|e| JsErrorBox::type_error(format!("{e}")))?;
    let registry = state.borrow_mut::<MockRegistry>();
    let server = registry
        .server_mut(server)
        .map_err(|e| JsErrorBox::generic(e.to_string()))?;
    server.route(method, path, handler);
    Ok(())
}

/// Resolve a route to its handler index.
#[op2(fast)]
#[smi]
pub fn op_pairwise_mock_resolve(
    state: &mut OpState,
    #[smi] server: u32,
    #[string] method: &str,
    #[string] path: &str,
) -> Result<u32, JsErrorBox> {
    let method: Method = method.parse().map_err(|e| JsErrorBox::type_error(format!("{e}")))?;
    let registry = state.borrow::<MockRegistry>();
    registry
        .server(server)
        .and_then(|s| s.resolve(method, path).copied())
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

#[op2(fast)]
pub fn op_pairwise_mock_listen(
    state: &mut OpState,
    #[smi] server: u32,
    port: f64,
) -> Result<(), JsErrorBox> {
    if !port.is_finite() || port.fract() != 0.0 {
        return Err(JsErrorBox::range_error(format!(
            "invalid port {port}: ports must be integers between 0 and 65535"
        )));
    }
    let registry = state.borrow_mut::<MockRegistry>();
    registry
        .server_mut(server)
        .and_then(|s| s.listen(port as i64))
        .map_err(|e| JsErrorBox::range_error(e.to_string()))
}

/// `getState()` as JSON.
#[op2]
#[string]
pub fn op_pairwise_mock_state(
    state: &mut OpState,
    #[smi] server: u32,
) -> Result<String, JsErrorBox> {
    let registry = state.borrow::<MockRegistry>();
    let server_state = registry
        .server(server)
        .map_err(|e| JsErrorBox::generic(e.to_string()))?
        .state();
    serde_json::to_string(&server_state)
        .map_err(|e| JsErrorBox::generic(format!("state serialization failed: {e}")))
}

/// Loop guard callback in report mode.
#[op2(fast)]
pub fn op_pairwise_loop_abort(state: &mut OpState, #[smi] line: u32, #[smi] column: u32) {
    tracing::debug!(line, column, "loop guard fired");
    state
        .borrow_mut::<CapturedOutput>()
        .diagnostic(&format!("infinite loop detected at line {line}, column {column}"));
}

/// Mark the harness as finished. `error` describes an uncaught exception.
#[op2(fast)]
pub fn op_pairwise_finish(state: &mut OpState, failed: bool, #[string] error: &str) {
    if failed {
        state.borrow_mut::<CapturedOutput>().diagnostic(error);
    }
    state.put(Completion { failed });
}

deno_core::extension!(
    pairwise_ext,
    ops = [
        op_pairwise_stdout,
        op_pairwise_stderr,
        op_pairwise_expect,
        op_pairwise_test_begin,
        op_pairwise_test_end,
        op_pairwise_mock_create,
        op_pairwise_mock_route,
        op_pairwise_mock_resolve,
        op_pairwise_mock_listen,
        op_pairwise_mock_state,
        op_pairwise_loop_abort,
        op_pairwise_finish
    ],
);
