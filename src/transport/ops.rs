use super::{Connection, ConnectionOp, ExecRequest, Options, NOOP_OPTION, RUN_AS_OPTION};
use crate::error::{FanoutError, FanoutResult, FILE_ERROR};
use crate::result::TargetResult;
use crate::target::Target;
use crate::task::Task;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// User to escalate to: the executor-level value, else the target's own
fn run_as_user(target: &Target, options: &Options) -> Option<String> {
    options
        .get(RUN_AS_OPTION)
        .and_then(Value::as_str)
        .or_else(|| target.run_as())
        .map(str::to_string)
}

/// Command timeout from the target's transport options, in seconds
fn command_timeout(target: &Target) -> Option<Duration> {
    target
        .option("timeout")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "script".to_string(), |name| name.to_string_lossy().into_owned())
}

/// Copy an executable into a scratch directory and mark it executable
async fn stage_executable(
    connection: &mut dyn Connection,
    source: &Path,
) -> FanoutResult<PathBuf> {
    let dir = connection.make_tmpdir().await?;
    let remote = dir.join(file_name(source));
    connection.copy_file(source, &remote).await?;
    let output = connection
        .execute(ExecRequest::new("chmod").args(["u+x".to_string(), remote.display().to_string()]))
        .await?;
    if !output.success() {
        return Err(FanoutError::transport(
            FILE_ERROR,
            format!(
                "Could not make file '{}' executable: {}",
                remote.display(),
                output.stderr
            ),
        ));
    }
    Ok(remote)
}

/// Run a shell command
pub struct CommandOp {
    target: Target,
    command: String,
    run_as: Option<String>,
}

impl CommandOp {
    #[must_use]
    pub fn new(target: &Target, command: &str, options: &Options) -> Self {
        Self {
            target: target.clone(),
            command: command.to_string(),
            run_as: run_as_user(target, options),
        }
    }
}

#[async_trait]
impl ConnectionOp for CommandOp {
    type Output = TargetResult;

    async fn run(self, connection: &mut dyn Connection) -> FanoutResult<TargetResult> {
        debug!("Running command '{}' on {}", self.command, self.target);
        let request = ExecRequest::new("sh")
            .args(["-c", self.command.as_str()])
            .timeout(command_timeout(&self.target))
            .run_as(self.run_as.as_deref());
        let output = connection.execute(request).await?;
        Ok(TargetResult::for_command(
            self.target,
            &output.stdout,
            &output.stderr,
            output.exit_code,
            "command",
            &self.command,
        ))
    }
}

/// Upload a script and run it with arguments
pub struct ScriptOp {
    target: Target,
    script: PathBuf,
    arguments: Vec<String>,
    run_as: Option<String>,
}

impl ScriptOp {
    #[must_use]
    pub fn new(target: &Target, script: &Path, arguments: &[String], options: &Options) -> Self {
        Self {
            target: target.clone(),
            script: script.to_path_buf(),
            arguments: arguments.to_vec(),
            run_as: run_as_user(target, options),
        }
    }
}

#[async_trait]
impl ConnectionOp for ScriptOp {
    type Output = TargetResult;

    async fn run(self, connection: &mut dyn Connection) -> FanoutResult<TargetResult> {
        let remote = stage_executable(connection, &self.script).await?;
        debug!("Running script {} on {}", remote.display(), self.target);
        let request = ExecRequest::new(remote.display().to_string())
            .args(self.arguments)
            .timeout(command_timeout(&self.target))
            .run_as(self.run_as.as_deref());
        let output = connection.execute(request).await?;
        Ok(TargetResult::for_command(
            self.target,
            &output.stdout,
            &output.stderr,
            output.exit_code,
            "script",
            &self.script.display().to_string(),
        ))
    }
}

/// Upload a task executable and run it with parameters
pub struct TaskOp {
    target: Target,
    task: Task,
    parameters: Map<String, Value>,
    run_as: Option<String>,
}

impl TaskOp {
    #[must_use]
    pub fn new(
        target: &Target,
        task: &Task,
        parameters: &Map<String, Value>,
        options: &Options,
    ) -> Self {
        let mut parameters = parameters.clone();
        if let Some(noop) = options.get(NOOP_OPTION) {
            parameters.insert(NOOP_OPTION.to_string(), noop.clone());
        }
        Self {
            target: target.clone(),
            task: task.clone(),
            parameters,
            run_as: run_as_user(target, options),
        }
    }

    fn request(&self, executable: &Path) -> FanoutResult<ExecRequest> {
        let mut request = ExecRequest::new(executable.display().to_string())
            .timeout(command_timeout(&self.target));

        if self.task.input_method.uses_stdin() {
            request = request.stdin(serde_json::to_string(&self.parameters)?);
        }
        if self.task.input_method.uses_environment() {
            for (name, value) in &self.parameters {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.env(format!("PT_{name}"), value);
            }
        }
        Ok(request.run_as(self.run_as.as_deref()))
    }
}

#[async_trait]
impl ConnectionOp for TaskOp {
    type Output = TargetResult;

    async fn run(self, connection: &mut dyn Connection) -> FanoutResult<TargetResult> {
        let remote = stage_executable(connection, &self.task.executable).await?;
        debug!("Running task {} on {}", self.task.name, self.target);
        let output = connection.execute(self.request(&remote)?).await?;
        Ok(TargetResult::for_task(
            self.target,
            &output.stdout,
            &output.stderr,
            output.exit_code,
            &self.task.name,
        ))
    }
}

/// Copy a file to the target
pub struct UploadOp {
    target: Target,
    source: PathBuf,
    destination: PathBuf,
}

impl UploadOp {
    #[must_use]
    pub fn new(target: &Target, source: &Path, destination: &Path) -> Self {
        Self {
            target: target.clone(),
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        }
    }
}

#[async_trait]
impl ConnectionOp for UploadOp {
    type Output = TargetResult;

    async fn run(self, connection: &mut dyn Connection) -> FanoutResult<TargetResult> {
        debug!(
            "Uploading {} to {}:{}",
            self.source.display(),
            self.target,
            self.destination.display()
        );
        connection.copy_file(&self.source, &self.destination).await?;
        Ok(TargetResult::for_upload(
            self.target,
            &self.source.display().to_string(),
            &self.destination.display().to_string(),
        ))
    }
}
