//! Transport capability interface and registry
//!
//! A transport knows how to reach one kind of target. The engine only talks to
//! targets through [`Transport`]; connections are scoped to a single operation
//! through [`with_connection`].

// Allow module inception - this is a common Rust pattern for protocol clients
#![allow(clippy::module_name_repetitions)]

pub mod local;
mod ops;
mod registry;

pub use local::LocalTransport;
pub use ops::{CommandOp, ScriptOp, TaskOp, UploadOp};
pub use registry::TransportRegistry;

use crate::error::FanoutResult;
use crate::result::TargetResult;
use crate::target::Target;
use crate::task::Task;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Per-call options passed to a transport, e.g. `_run_as`
pub type Options = Map<String, Value>;

/// Option key carrying the executor-level run-as user
pub const RUN_AS_OPTION: &str = "_run_as";
/// Option key asking tasks to make no changes
pub const NOOP_OPTION: &str = "_noop";

/// One process to run over a connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the process's stdin, which is closed afterwards
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
    /// The process is killed once this elapses
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the request as another user through `sudo`
    #[must_use]
    pub fn run_as(self, user: Option<&str>) -> Self {
        match user {
            Some(user) => {
                let mut args = vec![
                    "-n".to_string(),
                    "-u".to_string(),
                    user.to_string(),
                    "--".to_string(),
                    self.program,
                ];
                args.extend(self.args);
                Self {
                    program: "sudo".to_string(),
                    args,
                    ..self
                }
            }
            None => self,
        }
    }
}

/// Output of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, -1 if the process was killed by a signal
    pub exit_code: i32,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live connection to one target
///
/// Implementations must release what they hold in `close`. Dropping an
/// unclosed connection must release it as well, since an operation may be
/// cancelled before it reaches `close`.
#[async_trait]
pub trait Connection: Send {
    /// Run a process on the target
    async fn execute(&mut self, request: ExecRequest) -> FanoutResult<CommandOutput>;

    /// Copy a local file to a path on the target
    async fn copy_file(&mut self, source: &Path, destination: &Path) -> FanoutResult<()>;

    /// Create a scratch directory on the target, removed on close
    async fn make_tmpdir(&mut self) -> FanoutResult<PathBuf>;

    async fn close(&mut self) -> FanoutResult<()>;
}

/// Capability set every transport provides
///
/// Only `connect` is required: the action methods default to running the
/// matching operation over a scoped connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to the target
    async fn connect(&self, target: &Target) -> FanoutResult<Box<dyn Connection>>;

    async fn run_command(
        &self,
        target: &Target,
        command: &str,
        options: &Options,
    ) -> FanoutResult<TargetResult> {
        with_connection(self, target, CommandOp::new(target, command, options)).await
    }

    async fn run_script(
        &self,
        target: &Target,
        script: &Path,
        arguments: &[String],
        options: &Options,
    ) -> FanoutResult<TargetResult> {
        with_connection(self, target, ScriptOp::new(target, script, arguments, options)).await
    }

    async fn run_task(
        &self,
        target: &Target,
        task: &Task,
        parameters: &Map<String, Value>,
        options: &Options,
    ) -> FanoutResult<TargetResult> {
        with_connection(self, target, TaskOp::new(target, task, parameters, options)).await
    }

    async fn upload(
        &self,
        target: &Target,
        source: &Path,
        destination: &Path,
        _options: &Options,
    ) -> FanoutResult<TargetResult> {
        with_connection(self, target, UploadOp::new(target, source, destination)).await
    }
}

/// Work done over a connection
#[async_trait]
pub trait ConnectionOp: Send {
    type Output: Send;

    async fn run(self, connection: &mut dyn Connection) -> FanoutResult<Self::Output>;
}

/// Run `op` over a fresh connection to `target`
///
/// The connection is closed whatever the outcome of `op`. If the returned
/// future is dropped early, the connection's own drop releases it.
///
/// # Errors
///
/// Returns the connect error or the error from `op`
pub async fn with_connection<T, O>(transport: &T, target: &Target, op: O) -> FanoutResult<O::Output>
where
    T: Transport + ?Sized,
    O: ConnectionOp,
{
    debug!("Connecting to {}", target);
    let mut connection = transport.connect(target).await?;
    let result = op.run(&mut *connection).await;
    if let Err(e) = connection.close().await {
        warn!("Failed to close connection to {}: {e}", target);
    }
    result
}
