//! Transport that runs actions on the controller itself
//!
//! Processes are spawned with tokio and their output captured line by line.
//! Scratch directories live under the system temp dir and are removed when
//! the connection closes or is dropped.

use super::{CommandOutput, Connection, ExecRequest, Transport};
use crate::error::{FanoutError, FanoutResult, TIMEOUT_ERROR};
use crate::target::Target;
use async_trait::async_trait;
use serde_json::json;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// The `local` transport
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    tmpdir: Option<PathBuf>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create scratch directories under `dir` instead of the system temp dir
    #[must_use]
    pub fn with_tmpdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmpdir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, target: &Target) -> FanoutResult<Box<dyn Connection>> {
        let base = match target.option("tmpdir").and_then(|v| v.as_str()) {
            Some(dir) => PathBuf::from(dir),
            None => self.tmpdir.clone().unwrap_or_else(std::env::temp_dir),
        };
        Ok(Box::new(LocalConnection::new(target.name(), base)))
    }
}

/// Connection to the local host
#[derive(Debug)]
pub struct LocalConnection {
    target: String,
    base: PathBuf,
    tmpdirs: Vec<PathBuf>,
}

impl LocalConnection {
    fn new(target: &str, base: PathBuf) -> Self {
        Self {
            target: target.to_string(),
            base,
            tmpdirs: Vec::new(),
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn execute(&mut self, request: ExecRequest) -> FanoutResult<CommandOutput> {
        run_process(&self.target, request).await
    }

    async fn copy_file(&mut self, source: &Path, destination: &Path) -> FanoutResult<()> {
        debug!(
            "Copying {} to {} on {}",
            source.display(),
            destination.display(),
            self.target
        );
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, destination).await.map_err(|e| {
            FanoutError::Executor(format!(
                "Failed to copy '{}' to '{}': {e}",
                source.display(),
                destination.display()
            ))
        })?;
        Ok(())
    }

    async fn make_tmpdir(&mut self) -> FanoutResult<PathBuf> {
        let dir = self.base.join(format!("fanout-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        self.tmpdirs.push(dir.clone());
        Ok(dir)
    }

    async fn close(&mut self) -> FanoutResult<()> {
        for dir in self.tmpdirs.drain(..) {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to remove {}: {e}", dir.display());
            }
        }
        Ok(())
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        for dir in self.tmpdirs.drain(..) {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

/// Spawn a process and collect its output
///
/// # Errors
///
/// Returns an error if:
/// - The program is empty or cannot be spawned
/// - IO fails while writing stdin or reading stdout/stderr
/// - The process cannot be killed after its timeout
async fn run_process(target: &str, request: ExecRequest) -> FanoutResult<CommandOutput> {
    debug!(
        "Command on {}: {} with args: {:?}",
        target, request.program, request.args
    );

    if request.program.is_empty() {
        return Err(FanoutError::Executor("Command cannot be empty".to_string()));
    }

    let mut child = Command::new(&request.program)
        .args(&request.args)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            FanoutError::Executor(format!(
                "Failed to spawn command '{}': {}",
                request.program, e
            ))
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FanoutError::Executor("Failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| FanoutError::Executor("Failed to capture stderr".to_string()))?;

    // Read concurrently so a chatty process cannot fill a pipe while we write stdin
    let stdout_handle = tokio::spawn(read_stream(BufReader::new(stdout)));
    let stderr_handle = tokio::spawn(read_stream(BufReader::new(stderr)));

    if let Some(input) = &request.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            // A process may exit without reading its input
            let written = match stdin.write_all(input.as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => {
                    return Err(FanoutError::Executor(format!("Failed to write stdin: {e}")));
                }
                _ => {}
            }
        }
    }

    let status = match request.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                status.map_err(|e| FanoutError::Executor(format!("Process wait failed: {e}")))?
            }
            Err(_) => {
                warn!(
                    "Command on {} exceeded timeout of {:?}, killing process",
                    target, timeout
                );
                child.kill().await.map_err(|e| {
                    FanoutError::Executor(format!("Failed to kill process after timeout: {e}"))
                })?;
                child.wait().await.map_err(|e| {
                    FanoutError::Executor(format!("Failed to wait for killed process: {e}"))
                })?;
                stdout_handle.abort();
                stderr_handle.abort();
                return Err(FanoutError::Transport {
                    kind: TIMEOUT_ERROR.to_string(),
                    message: format!("Command on {target} timed out after {timeout:?}"),
                    details: json!({ "timeout": timeout.as_secs_f64() }),
                });
            }
        },
        None => child
            .wait()
            .await
            .map_err(|e| FanoutError::Executor(format!("Process wait failed: {e}")))?,
    };

    let stdout = stdout_handle
        .await
        .map_err(|e| FanoutError::Executor(format!("Failed to join stdout task: {e}")))??;
    let stderr = stderr_handle
        .await
        .map_err(|e| FanoutError::Executor(format!("Failed to join stderr task: {e}")))??;

    let exit_code = status.code().unwrap_or(-1);
    debug!(
        "Command on {} exited with {} ({} bytes stdout, {} bytes stderr)",
        target,
        exit_code,
        stdout.len(),
        stderr.len()
    );

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Read all lines from a stream
async fn read_stream<R: tokio::io::AsyncRead + Unpin>(reader: BufReader<R>) -> FanoutResult<String> {
    let mut lines = reader.lines();
    let mut output = String::new();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| FanoutError::Executor(format!("Failed to read line: {e}")))?
    {
        output.push_str(&line);
        output.push('\n');
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::transport::Options;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn local() -> Target {
        Target::new("localhost")
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let mut connection = LocalConnection::new("localhost", std::env::temp_dir());
        let output = connection
            .execute(ExecRequest::new("echo").args(["hello"]))
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_execute_with_stdin_and_env() {
        let mut connection = LocalConnection::new("localhost", std::env::temp_dir());
        let output = connection
            .execute(
                ExecRequest::new("sh")
                    .args(["-c", "cat; echo \"$PT_name\""])
                    .stdin("from stdin\n")
                    .env("PT_name", "from env"),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "from stdin\nfrom env\n");
    }

    #[tokio::test]
    async fn test_execute_timeout_kills_process() {
        let mut connection = LocalConnection::new("localhost", std::env::temp_dir());
        let err = connection
            .execute(
                ExecRequest::new("sleep")
                    .args(["5"])
                    .timeout(Some(Duration::from_millis(100))),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TIMEOUT_ERROR);
        assert_eq!(err.to_string(), "Command on localhost timed out after 100ms");
    }

    #[tokio::test]
    async fn test_execute_missing_program() {
        let mut connection = LocalConnection::new("localhost", std::env::temp_dir());
        let result = connection
            .execute(ExecRequest::new("definitely-not-a-real-program-xyz"))
            .await;
        assert!(matches!(result, Err(FanoutError::Executor(_))));
    }

    #[test]
    fn test_tmpdirs_removed_on_close() {
        let base = tempfile::tempdir().unwrap();
        let mut connection = LocalConnection::new("localhost", base.path().to_path_buf());
        tokio_test::block_on(async {
            let dir = connection.make_tmpdir().await.unwrap();
            assert!(dir.exists());
            connection.close().await.unwrap();
            assert!(!dir.exists());
        });
    }

    #[test]
    fn test_tmpdirs_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let mut connection = LocalConnection::new("localhost", base.path().to_path_buf());
        let dir = tokio_test::block_on(connection.make_tmpdir()).unwrap();
        assert!(dir.starts_with(base.path()));
        drop(connection);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_run_command_nonzero_exit() {
        let transport = LocalTransport::new();
        let result = transport
            .run_command(&local(), "echo oops >&2; exit 2", &Options::new())
            .await
            .unwrap();
        assert!(!result.ok());
        assert_eq!(result.get("exit_code"), Some(&json!(2)));
        assert_eq!(result.get("stderr").and_then(Value::as_str), Some("oops\n"));
    }

    #[tokio::test]
    async fn test_run_script_with_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("greet.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"hello $1\"\n").unwrap();

        let transport = LocalTransport::new().with_tmpdir(dir.path());
        let result = transport
            .run_script(&local(), &script, &["world".to_string()], &Options::new())
            .await
            .unwrap();
        assert!(result.ok(), "{:?}", result.value());
        assert_eq!(result.get("stdout").and_then(Value::as_str), Some("hello world\n"));
        assert_eq!(result.action(), Some("script"));
    }

    #[tokio::test]
    async fn test_run_task_parses_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let executable = dir.path().join("echo.sh");
        std::fs::write(
            &executable,
            "#!/bin/sh\necho \"{\\\"message\\\": \\\"$PT_message\\\"}\"\n",
        )
        .unwrap();

        let transport = LocalTransport::new().with_tmpdir(dir.path());
        let task = Task::new("echo", &executable);
        let parameters = json!({"message": "hi"}).as_object().cloned().unwrap();
        let result = transport
            .run_task(&local(), &task, &parameters, &Options::new())
            .await
            .unwrap();
        assert!(result.ok(), "{:?}", result.value());
        assert_eq!(result.get("message"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_upload_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        let destination = dir.path().join("nested").join("dest.txt");
        std::fs::write(&source, "payload").unwrap();

        let result = LocalTransport::new()
            .upload(&local(), &source, &destination, &Options::new())
            .await
            .unwrap();
        assert!(result.ok());
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "payload");
        assert!(result
            .message()
            .unwrap()
            .starts_with("Uploaded '"));
    }
}
