//! Out-of-process execution of synthesized capability sources.
//!
//! The [`ProcessSandbox`] writes the source and a small harness into a fresh
//! temporary directory and runs the harness with an isolated Python
//! interpreter. The harness loads the source, calls the named function with the
//! JSON input read from stdin, and prints a single result envelope on stdout.
//! The environment is cleared except for `PATH`, and the child is killed when
//! the wall-clock timeout expires.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Line prefix marking the harness result envelope on stdout.
pub const ENVELOPE_MARKER: &str = "__ARIA_RESULT__";

const SOURCE_FILE: &str = "capability.py";
const HARNESS_FILE: &str = "harness.py";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to start interpreter '{interpreter}': {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What happened when a function ran in the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    /// The function returned a JSON-serializable value.
    Returned(Value),
    /// The function raised a resource-not-found error.
    ResourceNotFound(String),
    /// The input did not fit the function's signature or expected keys.
    ArgumentMismatch(String),
    /// The function raised any other error.
    Raised(String),
    /// The source loaded but defines no callable with the expected name.
    MissingCallable,
    /// The source failed to load.
    LoadFailed(String),
    TimedOut(Duration),
}

/// Runs a named function from a source text against one input.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(
        &self,
        source: &str,
        function_name: &str,
        input: &Value,
    ) -> Result<SandboxOutcome, SandboxError>;
}

/// Configuration for [`ProcessSandbox`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter binary, resolved through `PATH`.
    pub interpreter: String,
    pub timeout: Duration,
    /// Stdout beyond this size is treated as a failure.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            timeout: Duration::from_secs(10),
            max_output_bytes: 4 * 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

/// Subprocess sandbox for Python capability sources.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    value: Value,
}

#[async_trait]
impl SandboxRunner for ProcessSandbox {
    async fn run(
        &self,
        source: &str,
        function_name: &str,
        input: &Value,
    ) -> Result<SandboxOutcome, SandboxError> {
        let workdir = tempfile::Builder::new().prefix("aria-sandbox-").tempdir()?;
        tokio::fs::write(workdir.path().join(SOURCE_FILE), source).await?;
        tokio::fs::write(workdir.path().join(HARNESS_FILE), harness_script(function_name)).await?;

        let mut command = Command::new(&self.config.interpreter);
        command
            .arg("-I")
            .arg("-S")
            .arg(HARNESS_FILE)
            .current_dir(workdir.path())
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }

        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            interpreter: self.config.interpreter.clone(),
            source,
        })?;

        let payload = serde_json::to_vec(input)?;
        if let Some(mut stdin) = child.stdin.take() {
            // A harness that dies early closes stdin; its stderr explains why.
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(error = %e, "Sandbox stdin closed early");
            }
            drop(stdin);
        }

        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    function = function_name,
                    timeout = ?self.config.timeout,
                    "Sandbox run timed out"
                );
                return Ok(SandboxOutcome::TimedOut(self.config.timeout));
            }
        };

        if output.stdout.len() > self.config.max_output_bytes {
            return Ok(SandboxOutcome::Raised(format!(
                "output exceeded {} bytes",
                self.config.max_output_bytes
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(parse_envelope(&stdout, &stderr))
    }
}

/// Interpret harness stdout; missing envelope means the interpreter crashed.
pub fn parse_envelope(stdout: &str, stderr: &str) -> SandboxOutcome {
    let Some(line) = stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(ENVELOPE_MARKER))
    else {
        let detail = if stderr.trim().is_empty() {
            "interpreter exited without a result".to_string()
        } else {
            crate::utils::truncate_chars(stderr.trim(), 2000).to_string()
        };
        return SandboxOutcome::LoadFailed(detail);
    };

    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => return SandboxOutcome::LoadFailed(format!("unreadable result envelope: {}", e)),
    };

    match envelope.status.as_str() {
        "ok" => SandboxOutcome::Returned(envelope.value),
        "not_found" => SandboxOutcome::ResourceNotFound(envelope.message),
        "argument_mismatch" => SandboxOutcome::ArgumentMismatch(envelope.message),
        "raised" => SandboxOutcome::Raised(envelope.message),
        "missing_callable" => SandboxOutcome::MissingCallable,
        "load_failed" => SandboxOutcome::LoadFailed(envelope.message),
        other => SandboxOutcome::LoadFailed(format!("unknown envelope status '{}'", other)),
    }
}

fn harness_script(function_name: &str) -> String {
    format!(
        r#"import json
import sys
import traceback

MARKER = {marker:?}
FUNCTION = {function:?}


def emit(envelope):
    sys.stdout.write("\n" + MARKER + json.dumps(envelope, default=str) + "\n")
    sys.stdout.flush()


def main():
    try:
        payload = json.loads(sys.stdin.read() or "null")
    except Exception as exc:
        return {{"status": "argument_mismatch", "message": "unreadable input: %s" % exc}}

    namespace = {{"__name__": "aria_capability"}}
    try:
        with open({source:?}, "r", encoding="utf-8") as handle:
            code = compile(handle.read(), {source:?}, "exec")
        exec(code, namespace)
    except BaseException:
        return {{"status": "load_failed", "message": traceback.format_exc(limit=5)}}

    function = namespace.get(FUNCTION)
    if not callable(function):
        return {{"status": "missing_callable"}}

    try:
        value = function(payload)
    except FileNotFoundError as exc:
        return {{"status": "not_found", "message": str(exc)}}
    except (TypeError, KeyError) as exc:
        return {{"status": "argument_mismatch", "message": "%s: %s" % (type(exc).__name__, exc)}}
    except BaseException as exc:
        return {{"status": "raised", "message": "%s: %s" % (type(exc).__name__, exc)}}

    try:
        json.dumps(value)
    except (TypeError, ValueError) as exc:
        return {{"status": "raised", "message": "result is not JSON-serializable: %s" % exc}}
    return {{"status": "ok", "value": value}}


emit(main())
"#,
        marker = ENVELOPE_MARKER,
        function = function_name,
        source = SOURCE_FILE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_envelope_statuses() {
        let ok = format!("noise\n{}{{\"status\": \"ok\", \"value\": {{\"rows\": []}}}}\n", ENVELOPE_MARKER);
        assert_eq!(parse_envelope(&ok, ""), SandboxOutcome::Returned(json!({"rows": []})));

        let nf = format!("{}{{\"status\": \"not_found\", \"message\": \"/x.xml\"}}", ENVELOPE_MARKER);
        assert_eq!(parse_envelope(&nf, ""), SandboxOutcome::ResourceNotFound("/x.xml".to_string()));

        let missing = format!("{}{{\"status\": \"missing_callable\"}}", ENVELOPE_MARKER);
        assert_eq!(parse_envelope(&missing, ""), SandboxOutcome::MissingCallable);
    }

    #[test]
    fn test_parse_envelope_without_marker() {
        match parse_envelope("", "Segmentation fault") {
            SandboxOutcome::LoadFailed(detail) => assert!(detail.contains("Segmentation")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_harness_embeds_function_name() {
        let script = harness_script("extract_xml");
        assert!(script.contains("FUNCTION = \"extract_xml\""));
        assert!(script.contains(ENVELOPE_MARKER));
    }

    #[tokio::test]
    #[ignore = "requires python3 on PATH"]
    async fn test_process_sandbox_round_trip() {
        let sandbox = ProcessSandbox::default();
        let source = "def extract_xml(source):\n    import os\n    if not os.path.exists(source['location']):\n        raise FileNotFoundError(source['location'])\n    return {'rows': [], 'columns': []}\n";

        let outcome = sandbox
            .run(source, "extract_xml", &json!({"location": "/nope.xml"}))
            .await
            .expect("run");
        assert!(matches!(outcome, SandboxOutcome::ResourceNotFound(_)));

        let outcome = sandbox.run(source, "extract_xml", &json!({})).await.expect("run");
        assert!(matches!(outcome, SandboxOutcome::ArgumentMismatch(_)));

        let outcome = sandbox.run("def other(x): pass\n", "extract_xml", &json!({})).await.expect("run");
        assert_eq!(outcome, SandboxOutcome::MissingCallable);

        let outcome = sandbox.run("def broken(:\n", "extract_xml", &json!({})).await.expect("run");
        assert!(matches!(outcome, SandboxOutcome::LoadFailed(_)));
    }

    #[tokio::test]
    #[ignore = "requires python3 on PATH"]
    async fn test_process_sandbox_timeout() {
        let sandbox = ProcessSandbox::new(SandboxConfig::default().with_timeout(Duration::from_millis(300)));
        let source = "def slow(x):\n    while True:\n        pass\n";
        let outcome = sandbox.run(source, "slow", &json!({})).await.expect("run");
        assert!(matches!(outcome, SandboxOutcome::TimedOut(_)));
    }
}
