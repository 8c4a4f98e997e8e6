//! Wire types exchanged between the host and the sandbox.
//!
//! Field names follow the camelCase shape the client workspace posts, so a
//! request serialized by the browser deserializes here unchanged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of challenge a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeType {
    /// Plain JavaScript, executed directly.
    Javascript,
    /// TypeScript source. Types are stripped, then it runs as JavaScript.
    Typescript,
    /// HTML/CSS challenges tested against a DOM. Not executed.
    Markup,
}

impl ChallengeType {
    /// Whether this sandbox can execute the challenge type.
    pub fn is_executable(self) -> bool {
        matches!(self, Self::Javascript | Self::Typescript)
    }

    /// The lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Javascript => "javascript",
            Self::Typescript => "typescript",
            Self::Markup => "markup",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "javascript" | "js" => Ok(Self::Javascript),
            "typescript" | "ts" => Ok(Self::Typescript),
            "markup" | "html" => Ok(Self::Markup),
            other => Err(format!(
                "unknown challenge type '{other}', expected javascript, typescript or markup"
            )),
        }
    }
}

/// Host -> sandbox: run this challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRequest {
    /// The learner's code.
    pub code: String,
    /// The challenge's test code, run after `code` in the same scope.
    pub test_code: String,
    /// Challenge type.
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    /// Correlation id echoed back in the response.
    pub channel: String,
}

/// Sandbox -> host: the result of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResponse {
    /// Correlation id copied from the request.
    pub channel: String,
    /// Challenge type copied from the request.
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    /// Aggregate result.
    pub result: TestResult,
}

/// Captured result of a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// 0 when the script ran to completion, 1 otherwise.
    pub code: i32,
    /// `console.log` / `info` / `debug` output.
    pub stdout: String,
    /// `console.warn` / `error` output plus sandbox diagnostics.
    pub stderr: String,
}

impl Output {
    /// An output that failed before any guest code ran.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    /// Whether the run completed without an uncaught error.
    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// Outcome of one `test(message, fn)` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    /// The message passed to `test`.
    pub message: String,
    /// Whether the test function completed without throwing.
    pub passed: bool,
    /// Failure description, when the test failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate result of running a challenge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// True when the test run completed and every recorded test passed.
    pub passed: bool,
    /// Output of user code + test code.
    pub test_output: Output,
    /// Output of the user code alone.
    pub preview_output: Output,
    /// Per-test outcomes, in registration order.
    #[serde(default)]
    pub tests: Vec<TestRecord>,
}

impl TestResult {
    /// Combine the two runs into a result.
    ///
    /// A challenge passes only if the test run completed, at least one test
    /// was registered, and every registered test passed.
    pub fn from_runs(test_output: Output, preview_output: Output, tests: Vec<TestRecord>) -> Self {
        let passed =
            test_output.succeeded() && !tests.is_empty() && tests.iter().all(|t| t.passed);
        Self {
            passed,
            test_output,
            preview_output,
            tests,
        }
    }

    /// A failed result carrying `message` in both outputs' stderr.
    pub fn from_error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            passed: false,
            test_output: Output::failure(message.clone()),
            preview_output: Output::failure(message),
            tests: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_output() -> Output {
        Output {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn record(passed: bool) -> TestRecord {
        TestRecord {
            message: "t".into(),
            passed,
            error: None,
        }
    }

    #[test]
    fn request_uses_client_field_names() {
        let json = r#"{
            "code": "const x = 1;",
            "testCode": "test('x', () => expect(x).toBe(1));",
            "type": "javascript",
            "channel": "challenge-42"
        }"#;
        let request: SandboxRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.kind, ChallengeType::Javascript);
        assert_eq!(request.channel, "challenge-42");
        assert!(request.test_code.starts_with("test("));
    }

    #[test]
    fn response_serializes_camel_case() {
        let response = SandboxResponse {
            channel: "c1".into(),
            kind: ChallengeType::Javascript,
            result: TestResult::from_runs(ok_output(), ok_output(), vec![record(true)]),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "javascript");
        assert_eq!(value["result"]["passed"], true);
        assert_eq!(value["result"]["testOutput"]["code"], 0);
        assert!(value["result"]["previewOutput"].is_object());
        assert!(value["result"]["tests"][0].get("error").is_none());
    }

    #[test]
    fn passed_requires_at_least_one_test() {
        let result = TestResult::from_runs(ok_output(), ok_output(), vec![]);
        assert!(!result.passed);
    }

    #[test]
    fn passed_requires_every_test() {
        let result =
            TestResult::from_runs(ok_output(), ok_output(), vec![record(true), record(false)]);
        assert!(!result.passed);

        let result =
            TestResult::from_runs(ok_output(), ok_output(), vec![record(true), record(true)]);
        assert!(result.passed);
    }

    #[test]
    fn failed_run_never_passes() {
        let result = TestResult::from_runs(
            Output::failure("ReferenceError: x is not defined"),
            ok_output(),
            vec![record(true)],
        );
        assert!(!result.passed);
    }

    #[test]
    fn challenge_type_parses_aliases() {
        assert_eq!("JS".parse::<ChallengeType>().unwrap(), ChallengeType::Javascript);
        assert_eq!("ts".parse::<ChallengeType>().unwrap(), ChallengeType::Typescript);
        assert!("rust".parse::<ChallengeType>().is_err());
        assert!(ChallengeType::Javascript.is_executable());
        assert!(ChallengeType::Typescript.is_executable());
        assert!(!ChallengeType::Markup.is_executable());
    }
}
