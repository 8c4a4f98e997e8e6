//! Sandbox executor: validates and instruments challenge code, then runs it
//! in fresh V8 isolates.
//!
//! Every run gets a brand new runtime, so nothing leaks between the preview
//! run and the test run, or between challenges.
//!
//! V8 isolates are `!Send`, so all JsRuntime operations run on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is
//! fully async and `Send`-safe.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::assert::TestLedger;
use crate::challenge::{ChallengeType, Output, SandboxRequest, TestRecord, TestResult};
use crate::error::SandboxError;
use crate::loop_guard::{LoopGuard, LoopGuardConfig};
use crate::mock::MockRegistry;
use crate::ops::{pairwise_ext, CapturedOutput, Completion};
use crate::prelude::{build_harness, build_prelude, LOOP_ABORT_CALLBACK};
use crate::transpile::strip_types;
use crate::validator::validate_code;

/// How the sandbox executes code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run V8 in-process on a dedicated thread (default, suitable for tests).
    #[default]
    InProcess,
    /// Spawn an isolated `pairwise-worker` process per challenge.
    ChildProcess,
}

/// What a loop guard does when its budget runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopAbort {
    /// Throw an `InfiniteLoopError` through the guest code.
    #[default]
    Throw,
    /// Write a diagnostic to stderr and break out of the loop.
    Report,
}

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Host ceiling per run: the isolate is terminated after this long.
    pub timeout: Duration,
    /// Budget the loop guards enforce inside guest code.
    pub loop_timeout: Duration,
    /// Loop guard behaviour.
    pub loop_abort: LoopAbort,
    /// Maximum size of learner code and of test code, in bytes.
    pub max_code_size: usize,
    /// Maximum captured console output per run, in bytes.
    pub max_output_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent challenge runs.
    pub max_concurrent: usize,
    /// Execution mode: in-process or child-process isolation.
    pub execution_mode: ExecutionMode,
    /// Maximum IPC message size in bytes.
    pub max_ipc_message_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            loop_timeout: crate::loop_guard::DEFAULT_LOOP_TIMEOUT,
            loop_abort: LoopAbort::default(),
            max_code_size: crate::validator::DEFAULT_MAX_CODE_SIZE,
            max_output_size: 1024 * 1024,    // 1 MB
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_concurrent: 8,
            execution_mode: ExecutionMode::default(),
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

impl SandboxConfig {
    /// The loop guard settings derived from this config.
    pub fn loop_guard_config(&self) -> LoopGuardConfig {
        let config = LoopGuardConfig::with_timeout(self.loop_timeout);
        match self.loop_abort {
            LoopAbort::Throw => config,
            LoopAbort::Report => config.callback(LOOP_ABORT_CALLBACK),
        }
    }
}

/// Challenge code after validation and loop instrumentation, ready to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedChallenge {
    /// Instrumented learner code.
    pub code: String,
    /// Instrumented test code.
    pub test_code: String,
}

/// The sandbox executor.
///
/// This is `Send + Sync` safe: all V8 work is dispatched to a dedicated
/// thread or a worker process. A semaphore caps concurrent challenges.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self { config, semaphore }
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Validate and instrument a request without running it.
    pub fn prepare(&self, request: &SandboxRequest) -> Result<PreparedChallenge, SandboxError> {
        if !request.kind.is_executable() {
            return Err(SandboxError::UnsupportedChallenge {
                kind: request.kind.to_string(),
            });
        }

        validate_code(&request.code, Some(self.config.max_code_size))?;
        validate_code(&request.test_code, Some(self.config.max_code_size))?;

        let (code, test_code) = match request.kind {
            ChallengeType::Typescript => (
                Cow::Owned(strip_types(&request.code)?),
                Cow::Owned(strip_types(&request.test_code)?),
            ),
            _ => (
                Cow::Borrowed(request.code.as_str()),
                Cow::Borrowed(request.test_code.as_str()),
            ),
        };

        // One guard numbering for both: they share a scope at run time.
        let mut guard = LoopGuard::new(self.config.loop_guard_config())?;
        let code = guard.instrument(&code)?;
        let test_code = guard.instrument(&test_code)?;
        tracing::debug!(
            code_loops = code.loops.len(),
            test_loops = test_code.loops.len(),
            "loops instrumented"
        );

        Ok(PreparedChallenge {
            code: code.code,
            test_code: test_code.code,
        })
    }

    /// Run a challenge: a preview run of the learner code alone, then a test
    /// run of learner code plus test code.
    ///
    /// Guest failures (uncaught exceptions, loop aborts, host timeouts, heap
    /// exhaustion) are reported inside the returned [`TestResult`]. An `Err`
    /// means the challenge could not be run at all.
    pub async fn run_challenge(&self, request: &SandboxRequest) -> Result<TestResult, SandboxError> {
        tracing::info!(
            channel = %request.channel,
            code_len = request.code.len(),
            test_len = request.test_code.len(),
            mode = ?self.config.execution_mode,
            "run_challenge: starting"
        );

        let prepared = self.prepare(request)?;

        let _permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;

        let result = match self.config.execution_mode {
            ExecutionMode::ChildProcess => {
                crate::host::SandboxHost::run_in_child(prepared, &self.config).await
            }
            ExecutionMode::InProcess => self.run_in_process(prepared).await,
        };

        match &result {
            Ok(r) => tracing::info!(
                channel = %request.channel,
                passed = r.passed,
                tests = r.tests.len(),
                "run_challenge: complete"
            ),
            Err(e) => tracing::warn!(channel = %request.channel, error = %e, "run_challenge: failed"),
        }

        result
    }

    /// In-process execution: spawn a dedicated thread with its own isolates.
    async fn run_in_process(&self, prepared: PreparedChallenge) -> Result<TestResult, SandboxError> {
        let config = self.config.clone();

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                        tracing::warn!("sandbox result receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_prepared(&config, &prepared));
            if tx.send(result).is_err() {
                tracing::warn!("sandbox result receiver dropped before result was sent");
            }
        });

        rx.await
            .map_err(|_| SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked")))?
    }
}

/// Run a prepared challenge on the current thread (must be called from a
/// dedicated thread, not the main tokio runtime).
///
/// Public for reuse in the worker binary.
pub async fn run_prepared(
    config: &SandboxConfig,
    prepared: &PreparedChallenge,
) -> Result<TestResult, SandboxError> {
    let (preview_output, _) = run_once(config, &prepared.code, "").await?;
    let (test_output, tests) = run_once(config, &prepared.code, &prepared.test_code).await?;
    Ok(TestResult::from_runs(test_output, preview_output, tests))
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB of
/// headroom so the termination can unwind.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` boxed in `run_once`, which
    // unregisters this callback before the box is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Create a fresh JsRuntime with the pairwise extension and per-run state.
pub(crate) fn create_runtime(config: &SandboxConfig) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![pairwise_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(CapturedOutput::new(config.max_output_size));
        state.put(TestLedger::default());
        state.put(MockRegistry::default());
    }

    runtime
}

/// Why a run stopped early.
#[derive(Debug)]
enum RunFault {
    HeapLimit,
    Timeout,
    Script(String),
}

/// One isolate: prelude, then the harness around `code` and `test_code`.
///
/// Sets up a CPU watchdog thread and a near-heap-limit callback before
/// running guest code. The watchdog terminates V8 when the host timeout
/// elapses, which catches busy code the loop guards cannot see.
async fn run_once(
    config: &SandboxConfig,
    code: &str,
    test_code: &str,
) -> Result<(Output, Vec<TestRecord>), SandboxError> {
    let mut runtime = create_runtime(config);

    runtime
        .execute_script("[pairwise:prelude]", build_prelude())
        .map_err(|e| SandboxError::JsError {
            message: e.to_string(),
        })?;

    // --- Heap limit callback ---
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // --- CPU watchdog ---
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = config.timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    // --- Guest code ---
    let exec_error = match runtime.execute_script("[pairwise:challenge]", build_harness(code, test_code)) {
        Ok(_) => {
            match tokio::time::timeout(
                config.timeout,
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    timed_out.store(true, Ordering::SeqCst);
                    None
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };

    // The watchdog must be gone before the isolate handle goes away.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);

    let fault = if heap_state.triggered.load(Ordering::SeqCst) {
        Some(RunFault::HeapLimit)
    } else if timed_out.load(Ordering::SeqCst) {
        Some(RunFault::Timeout)
    } else {
        exec_error.map(RunFault::Script)
    };

    let op_state = runtime.op_state();
    let mut state = op_state.borrow_mut();
    let mut output = state
        .try_take::<CapturedOutput>()
        .unwrap_or_else(|| CapturedOutput::new(config.max_output_size));
    let tests = state
        .try_take::<TestLedger>()
        .unwrap_or_default()
        .into_records();
    let completion = state.try_take::<Completion>();

    let exit_code = match fault {
        Some(RunFault::HeapLimit) => {
            output.diagnostic(&format!(
                "heap limit exceeded ({} MB)",
                config.max_heap_size / (1024 * 1024)
            ));
            1
        }
        Some(RunFault::Timeout) => {
            output.diagnostic(&format!(
                "execution timed out after {}ms",
                config.timeout.as_millis()
            ));
            1
        }
        Some(RunFault::Script(message)) => {
            output.diagnostic(&message);
            1
        }
        None => match completion {
            Some(Completion { failed }) => i32::from(failed),
            None => {
                output.diagnostic("execution did not complete: a promise never settled");
                1
            }
        },
    };

    tracing::debug!(
        exit_code,
        tests = tests.len(),
        stdout_len = output.stdout.len(),
        stderr_len = output.stderr.len(),
        "run finished"
    );

    Ok((
        Output {
            code: exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        },
        tests,
    ))
}
