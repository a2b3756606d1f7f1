//! Subprocess execution for the external translation script.
//!
//! The script is spawned with piped stdout/stderr. Both pipes are drained by
//! two independent tasks while the process runs; each line is captured and
//! echoed under the `subtrans` tracing target. The readers are joined before
//! the result is inspected, so a chatty script can never block on a full
//! pipe buffer.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::failure::{classify_output, ScriptOutcome};
use crate::error::TranslateError;

/// A fully prepared script run.
#[derive(Debug, Clone)]
pub struct ScriptInvocation {
    /// Script or executable to run.
    pub program: PathBuf,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment variables. Secrets go here, never in `args`.
    pub env: Vec<(String, String)>,
    /// Working directory for the process.
    pub working_dir: Option<PathBuf>,
    /// Hard limit for the whole run.
    pub timeout: Duration,
}

impl ScriptInvocation {
    /// Creates an invocation with no arguments and a 15 minute timeout.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            timeout: Duration::from_secs(15 * 60),
        }
    }

    /// Sets the arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Renders the command line for logs.
    pub fn command_line(&self) -> String {
        let program = self.program.display().to_string();
        std::iter::once(program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished script.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// Exit code, or -1 if the process was terminated by a signal.
    pub exit_code: i32,
    /// Whether the process exited successfully.
    pub success: bool,
    /// Everything written to stdout.
    pub stdout: String,
    /// Everything written to stderr.
    pub stderr: String,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

/// Runs the script to completion, draining both output streams concurrently.
///
/// The timeout bounds the whole run, including reading output after the
/// process exits. On expiry the process is killed, the readers are aborted
/// and [`TranslateError::Timeout`] returned.
pub async fn run_script(invocation: &ScriptInvocation) -> Result<ScriptOutput, TranslateError> {
    let start = Instant::now();

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &invocation.working_dir {
        cmd.current_dir(dir);
    }

    for (key, value) in &invocation.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| TranslateError::Spawn {
        program: invocation.program.display().to_string(),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr not captured"))?;

    let mut stdout_task = tokio::spawn(drain_stream(stdout, "stdout"));
    let mut stderr_task = tokio::spawn(drain_stream(stderr, "stderr"));

    // One deadline covers both the exit and the end of output. A background
    // grandchild can keep the pipes open after the script itself exits.
    let deadline = tokio::time::Instant::now() + invocation.timeout;
    let finished = tokio::time::timeout_at(deadline, async {
        let status = child.wait().await?;
        let (stdout, stderr) =
            tokio::join!(join_reader(&mut stdout_task), join_reader(&mut stderr_task));
        Ok::<_, TranslateError>((status, stdout?, stderr?))
    })
    .await;

    let (status, stdout, stderr) = match finished {
        Ok(result) => result?,
        Err(_) => {
            warn!(
                timeout_secs = invocation.timeout.as_secs(),
                "Translation script timed out, killing process"
            );
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Could not kill timed out script");
            }
            stdout_task.abort();
            stderr_task.abort();
            return Err(TranslateError::Timeout(invocation.timeout));
        }
    };

    Ok(ScriptOutput {
        exit_code: status.code().unwrap_or(-1),
        success: status.success(),
        stdout,
        stderr,
        duration: start.elapsed(),
    })
}

/// Runs a translation script and decides whether it really produced `output_path`.
///
/// A zero exit status is not trusted on its own: the output file must exist
/// and the captured output must not contain a known failure phrase.
pub async fn execute_translation(
    invocation: &ScriptInvocation,
    output_path: &str,
) -> Result<String, TranslateError> {
    let output = run_script(invocation).await?;
    let stdout = output.stdout.trim();
    let stderr = output.stderr.trim();

    if !output.success {
        error!(exit_code = output.exit_code, "Translation failed");
        if !stderr.is_empty() {
            error!(stderr = %stderr, "Script stderr");
        }
        return Err(TranslateError::NonZeroExit {
            code: output.exit_code,
            stderr: stderr.to_string(),
        });
    }

    if !tokio::fs::try_exists(output_path).await.unwrap_or(false) {
        error!(output = %output_path, "Output file not found after script completed");
        return Err(TranslateError::OutputMissing(output_path.to_string()));
    }

    if let ScriptOutcome::Failed { indicator } = classify_output(stdout, stderr) {
        error!(indicator = indicator, "Script failure detected");
        return Err(TranslateError::ReportedFailure(indicator.to_string()));
    }

    info!(
        output = %output_path,
        duration_secs = output.duration.as_secs(),
        "Translation completed"
    );
    Ok(output_path.to_string())
}

async fn join_reader(task: &mut JoinHandle<String>) -> Result<String, TranslateError> {
    task.await
        .map_err(|e| TranslateError::Io(std::io::Error::other(e)))
}

/// Reads `reader` line by line until EOF, echoing and capturing each line.
async fn drain_stream<R>(reader: R, stream: &'static str) -> String
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut captured = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                info!(target: "subtrans", stream, "│ {}", text);
                captured.push_str(text);
                captured.push('\n');
            }
            Err(e) => {
                debug!(stream, error = %e, "Stopped reading script output");
                break;
            }
        }
    }

    captured
}

fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if !arg.contains([' ', '\t', '\n', '"', '\'', '\\']) {
        return arg.to_string();
    }
    format!("{arg:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::SCRIPT_LOCK;

    fn sh(script: &str) -> ScriptInvocation {
        ScriptInvocation::new("/bin/sh")
            .with_args(vec!["-c".to_string(), script.to_string()])
            .with_timeout(Duration::from_secs(30))
    }

    #[test]
    fn test_command_line_quotes_arguments() {
        let invocation = ScriptInvocation::new("/opt/llm-subtrans/llm-subtrans.sh").with_args(vec![
            "/media/a b.srt".to_string(),
            "-o".to_string(),
            "".to_string(),
            "--model".to_string(),
            "vendor/model:free".to_string(),
        ]);

        assert_eq!(
            invocation.command_line(),
            "/opt/llm-subtrans/llm-subtrans.sh \"/media/a b.srt\" -o '' --model vendor/model:free"
        );
    }

    #[tokio::test]
    async fn test_drains_large_output_on_both_streams() {
        let _guard = SCRIPT_LOCK.lock().await;
        // Well beyond a 64 KiB pipe buffer on each stream.
        let invocation = sh(
            "i=0; while [ $i -lt 20000 ]; do echo \"out line $i\"; echo \"err line $i\" >&2; i=$((i+1)); done",
        );

        let output = run_script(&invocation).await.expect("script should run");

        assert!(output.success);
        assert_eq!(output.stdout.lines().count(), 20000);
        assert_eq!(output.stderr.lines().count(), 20000);
        assert!(output.stdout.ends_with("out line 19999\n"));
        assert!(output.stderr.ends_with("err line 19999\n"));
    }

    #[tokio::test]
    async fn test_reports_exit_code() {
        let _guard = SCRIPT_LOCK.lock().await;
        let output = run_script(&sh("echo nope >&2; exit 3"))
            .await
            .expect("script should run");

        assert!(!output.success);
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stderr, "nope\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let _guard = SCRIPT_LOCK.lock().await;
        let invocation = sh("sleep 10").with_timeout(Duration::from_millis(200));

        let start = Instant::now();
        let result = run_script(&invocation).await;

        assert!(matches!(result, Err(TranslateError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_covers_output_held_open_by_background_process() {
        let _guard = SCRIPT_LOCK.lock().await;
        let invocation = sh("sleep 30 & echo started").with_timeout(Duration::from_secs(1));

        let start = Instant::now();
        let result = run_script(&invocation).await;

        assert!(matches!(result, Err(TranslateError::Timeout(_))), "{result:?}");
        assert!(start.elapsed() < Duration::from_secs(5), "took {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let _guard = SCRIPT_LOCK.lock().await;
        let invocation = ScriptInvocation::new("/nonexistent/translate.sh");
        let result = run_script(&invocation).await;
        assert!(matches!(result, Err(TranslateError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_env_reaches_process() {
        let _guard = SCRIPT_LOCK.lock().await;
        let invocation = sh("echo \"key=$FUSIONN_TEST_KEY\"").with_env("FUSIONN_TEST_KEY", "s3cret");
        let output = run_script(&invocation).await.expect("script should run");
        assert_eq!(output.stdout, "key=s3cret\n");
    }

    #[tokio::test]
    async fn test_execute_translation_non_zero_exit() {
        let _guard = SCRIPT_LOCK.lock().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.srt");

        let result = execute_translation(&sh("echo broken >&2; exit 1"), &out.to_string_lossy()).await;

        match result {
            Err(TranslateError::NonZeroExit { code, stderr }) => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_translation_missing_output() {
        let _guard = SCRIPT_LOCK.lock().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.srt");

        let result = execute_translation(&sh("echo done"), &out.to_string_lossy()).await;

        assert!(matches!(result, Err(TranslateError::OutputMissing(_))));
    }

    #[tokio::test]
    async fn test_execute_translation_failure_phrase_overrides_exit_zero() {
        let _guard = SCRIPT_LOCK.lock().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.srt");
        let script = format!(
            "echo partial > '{}'; echo 'ERROR: Failed To Translate scene 4'",
            out.display()
        );

        let result = execute_translation(&sh(&script), &out.to_string_lossy()).await;

        match result {
            Err(TranslateError::ReportedFailure(indicator)) => {
                assert_eq!(indicator, "failed to translate");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_translation_success() {
        let _guard = SCRIPT_LOCK.lock().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.srt");
        let script = format!("echo '1\n00:00:01,000 --> 00:00:02,000\n你好' > '{}'", out.display());

        let result = execute_translation(&sh(&script), &out.to_string_lossy())
            .await
            .expect("translation should succeed");

        assert_eq!(result, out.to_string_lossy());
    }
}
