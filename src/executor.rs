// Allow module inception - this is a common Rust pattern for protocol clients
#![allow(clippy::module_name_repetitions)]

use crate::error::{ErrorInfo, EXCEPTION_ERROR};
use crate::notifier::{Callback, Event, Notifier, NotifySender};
use crate::result::{ResultSet, TargetResult};
use crate::target::Target;
use crate::task::Task;
use crate::transport::{Options, TransportRegistry, NOOP_OPTION, RUN_AS_OPTION};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Default number of targets acted on at once
pub const DEFAULT_CONCURRENCY: usize = 100;

/// Executor settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum number of in-flight target operations
    pub concurrency: usize,
    /// User to escalate to on targets that do not set their own
    pub run_as: Option<String>,
    /// Log start/finish lines at info instead of debug
    pub plan_logging: bool,
    /// Ask tasks to make no changes
    pub noop: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            run_as: None,
            plan_logging: false,
            noop: false,
        }
    }
}

/// An action to run on every target
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Command {
        command: String,
    },
    Script {
        script: PathBuf,
        arguments: Vec<String>,
    },
    Task {
        task: Task,
        parameters: Map<String, Value>,
    },
    Upload {
        source: PathBuf,
        destination: PathBuf,
    },
}

impl Action {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Script { .. } => "script",
            Self::Task { .. } => "task",
            Self::Upload { .. } => "upload",
        }
    }

    /// Human readable description, e.g. `command 'uptime'`
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Command { command } => format!("command '{command}'"),
            Self::Script { script, .. } => format!("script {}", script.display()),
            Self::Task { task, .. } => format!("task {}", task.name),
            Self::Upload {
                source,
                destination,
            } => format!("file {} to {}", source.display(), destination.display()),
        }
    }
}

/// Runs actions across targets with bounded concurrency
///
/// Every dispatch through one executor shares its concurrency budget. Target
/// failures never escape: each becomes a failing result in the returned set.
pub struct Executor {
    config: ExecutorConfig,
    transports: Arc<TransportRegistry>,
    permits: Arc<Semaphore>,
}

impl Executor {
    /// Create an executor
    ///
    /// A concurrency of 0 is treated as 1.
    #[must_use]
    pub fn new(config: ExecutorConfig, transports: Arc<TransportRegistry>) -> Self {
        let concurrency = config.concurrency.max(1);
        info!("Executor starting with concurrency {}", concurrency);
        Self {
            config,
            transports,
            permits: Arc::new(Semaphore::new(concurrency)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[must_use]
    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    /// Run `action` on every target and collect results in target order
    ///
    /// When `callback` is given it receives a `node_start` event before and a
    /// `node_result` event after the transport call for each target. All
    /// events have been delivered when this returns.
    pub async fn dispatch(
        &self,
        targets: &[Target],
        action: Action,
        options: Options,
        callback: Option<Callback>,
    ) -> ResultSet {
        let description = action.describe();
        self.log(&format!(
            "Starting: {description} on {:?}",
            targets.iter().map(Target::uri).collect::<Vec<_>>()
        ));

        let notifier = callback.map(Notifier::start);
        let action = Arc::new(action);

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let job = TargetJob {
                target: target.clone(),
                options: self.target_options(target, &options, &action),
                action: Arc::clone(&action),
                transports: Arc::clone(&self.transports),
                sender: notifier.as_ref().map(Notifier::sender),
            };
            let permits = Arc::clone(&self.permits);

            handles.push(tokio::spawn(async move {
                match permits.acquire_owned().await {
                    Ok(_permit) => job.run().await,
                    Err(e) => TargetResult::from_error(
                        job.target,
                        &ErrorInfo::new(EXCEPTION_ERROR, format!("Executor is closed: {e}")),
                    ),
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (handle, target) in handles.into_iter().zip(targets) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!("Task for {} failed: {e}", target);
                    results.push(TargetResult::from_error(
                        target.clone(),
                        &ErrorInfo::new(EXCEPTION_ERROR, format!("Task for {target} failed: {e}")),
                    ));
                }
            }
        }

        if let Some(notifier) = notifier {
            notifier.shutdown().await;
        }

        let results = ResultSet::new(results);
        let failures = results.error_set().len();
        self.log(&format!(
            "Ran {description} on {} with {}",
            pluralize(results.len(), "target"),
            pluralize(failures, "failure")
        ));
        results
    }

    /// Run a shell command on every target
    pub async fn run_command(
        &self,
        targets: &[Target],
        command: &str,
        options: Options,
        callback: Option<Callback>,
    ) -> ResultSet {
        let action = Action::Command {
            command: command.to_string(),
        };
        self.dispatch(targets, action, options, callback).await
    }

    /// Upload and run a script on every target
    pub async fn run_script(
        &self,
        targets: &[Target],
        script: impl Into<PathBuf>,
        arguments: Vec<String>,
        options: Options,
        callback: Option<Callback>,
    ) -> ResultSet {
        let action = Action::Script {
            script: script.into(),
            arguments,
        };
        self.dispatch(targets, action, options, callback).await
    }

    /// Run a task on every target
    pub async fn run_task(
        &self,
        targets: &[Target],
        task: Task,
        parameters: Map<String, Value>,
        options: Options,
        callback: Option<Callback>,
    ) -> ResultSet {
        let action = Action::Task { task, parameters };
        self.dispatch(targets, action, options, callback).await
    }

    /// Copy a file to every target
    pub async fn upload_file(
        &self,
        targets: &[Target],
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: Options,
        callback: Option<Callback>,
    ) -> ResultSet {
        let action = Action::Upload {
            source: source.into(),
            destination: destination.into(),
        };
        self.dispatch(targets, action, options, callback).await
    }

    /// Options for one target's transport call
    fn target_options(&self, target: &Target, options: &Options, action: &Action) -> Options {
        let mut options = options.clone();
        if let Some(run_as) = &self.config.run_as {
            if target.run_as().is_none() {
                options
                    .entry(RUN_AS_OPTION)
                    .or_insert_with(|| Value::String(run_as.clone()));
            }
        }
        if self.config.noop && matches!(action, Action::Task { .. }) {
            options.insert(NOOP_OPTION.to_string(), Value::Bool(true));
        }
        options
    }

    fn log(&self, message: &str) {
        if self.config.plan_logging {
            info!("{message}");
        } else {
            debug!("{message}");
        }
    }
}

/// Everything one spawned target operation owns
struct TargetJob {
    target: Target,
    options: Options,
    action: Arc<Action>,
    transports: Arc<TransportRegistry>,
    sender: Option<NotifySender>,
}

impl TargetJob {
    async fn run(self) -> TargetResult {
        if let Some(sender) = &self.sender {
            sender.notify(Event::NodeStart {
                target: self.target.clone(),
            });
        }

        debug!("Running {} on {}", self.action.name(), self.target);
        let result = match AssertUnwindSafe(self.call_transport()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Transport panicked on {}: {}", self.target, message);
                TargetResult::from_error(
                    self.target.clone(),
                    &ErrorInfo::new(EXCEPTION_ERROR, message),
                )
            }
        };
        debug!(
            "Finished {} on {} ({})",
            self.action.name(),
            self.target,
            result.status()
        );

        if let Some(sender) = &self.sender {
            sender.notify(Event::NodeResult {
                result: result.clone(),
            });
        }
        result
    }

    async fn call_transport(&self) -> TargetResult {
        let transport = match self.transports.get(self.target.transport()) {
            Ok(transport) => transport,
            Err(e) => return TargetResult::from_exception(self.target.clone(), &e),
        };

        let target = &self.target;
        let options = &self.options;
        let outcome = match self.action.as_ref() {
            Action::Command { command } => transport.run_command(target, command, options).await,
            Action::Script { script, arguments } => {
                transport.run_script(target, script, arguments, options).await
            }
            Action::Task { task, parameters } => {
                transport.run_task(target, task, parameters, options).await
            }
            Action::Upload {
                source,
                destination,
            } => transport.upload(target, source, destination, options).await,
        };

        outcome.unwrap_or_else(|e| TargetResult::from_exception(target.clone(), &e))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Transport panicked".to_string())
}

fn pluralize(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FanoutError, FanoutResult, CONNECT_ERROR, UNKNOWN_TRANSPORT};
    use crate::target::TransportKind;
    use crate::transport::{Connection, MockTransport, Transport};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn targets(n: usize) -> Vec<Target> {
        (0..n).map(|i| Target::new(format!("node{i}"))).collect()
    }

    fn executor_with(transport: Arc<dyn Transport>, config: ExecutorConfig) -> Executor {
        let mut registry = TransportRegistry::new();
        registry.register_instance(TransportKind::Ssh, transport);
        Executor::new(config, Arc::new(registry))
    }

    /// Finishes later targets first
    struct ReverseDelayTransport;

    #[async_trait]
    impl Transport for ReverseDelayTransport {
        async fn connect(&self, target: &Target) -> FanoutResult<Box<dyn Connection>> {
            Err(FanoutError::Connection {
                target: target.name().to_string(),
                message: "not used".to_string(),
            })
        }

        async fn run_command(
            &self,
            target: &Target,
            _command: &str,
            _options: &Options,
        ) -> FanoutResult<TargetResult> {
            let index: u64 = target.name().trim_start_matches("node").parse().unwrap();
            tokio::time::sleep(Duration::from_millis(50 - index * 10)).await;
            let value = json!({"index": index}).as_object().cloned().unwrap();
            Ok(TargetResult::with_value(target.clone(), value))
        }
    }

    /// Tracks how many calls are in flight at once
    #[derive(Default)]
    struct GateTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Transport for GateTransport {
        async fn connect(&self, _target: &Target) -> FanoutResult<Box<dyn Connection>> {
            Err(FanoutError::Executor("not used".to_string()))
        }

        async fn run_command(
            &self,
            target: &Target,
            _command: &str,
            _options: &Options,
        ) -> FanoutResult<TargetResult> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(TargetResult::new(target.clone()))
        }
    }

    struct PanickingTransport;

    #[async_trait]
    impl Transport for PanickingTransport {
        async fn connect(&self, _target: &Target) -> FanoutResult<Box<dyn Connection>> {
            panic!("connection exploded");
        }
    }

    #[tokio::test]
    async fn test_results_keep_target_order() {
        let executor = executor_with(Arc::new(ReverseDelayTransport), ExecutorConfig::default());
        let targets = targets(5);
        let results = executor
            .run_command(&targets, "uptime", Options::new(), None)
            .await;

        assert_eq!(results.len(), 5);
        assert!(results.ok());
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.target(), &targets[i]);
            assert_eq!(result.get("index"), Some(&json!(i)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let transport = Arc::new(GateTransport::default());
        let config = ExecutorConfig {
            concurrency: 3,
            ..ExecutorConfig::default()
        };
        let executor = executor_with(transport.clone(), config);
        let results = executor
            .run_command(&targets(10), "uptime", Options::new(), None)
            .await;

        assert!(results.ok());
        assert_eq!(transport.peak.load(Ordering::SeqCst), 3);
        assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_as_injected_for_targets_without_their_own() {
        let mut mock = MockTransport::new();
        mock.expect_run_command()
            .withf(|target: &Target, _command: &str, options: &Options| {
                if target.name() == "own" {
                    !options.contains_key(RUN_AS_OPTION)
                } else {
                    options.get(RUN_AS_OPTION) == Some(&json!("foo"))
                }
            })
            .times(3)
            .returning(|target, _, _| Ok(TargetResult::new(target.clone())));

        let own = Target::new("own")
            .with_config(json!({"ssh": {"run-as": "bar"}}).as_object().cloned().unwrap())
            .unwrap();
        let config = ExecutorConfig {
            run_as: Some("foo".to_string()),
            ..ExecutorConfig::default()
        };
        let executor = executor_with(Arc::new(mock), config);
        let targets = vec![Target::new("a"), own, Target::new("b")];
        let results = executor
            .run_command(&targets, "whoami", Options::new(), None)
            .await;
        assert!(results.ok());
    }

    #[tokio::test]
    async fn test_no_run_as_without_executor_setting() {
        let mut mock = MockTransport::new();
        mock.expect_run_command()
            .withf(|_: &Target, _: &str, options: &Options| !options.contains_key(RUN_AS_OPTION))
            .times(2)
            .returning(|target, _, _| Ok(TargetResult::new(target.clone())));

        let executor = executor_with(Arc::new(mock), ExecutorConfig::default());
        let results = executor
            .run_command(&targets(2), "whoami", Options::new(), None)
            .await;
        assert!(results.ok());
    }

    #[tokio::test]
    async fn test_transport_errors_become_failing_results() {
        let mut mock = MockTransport::new();
        mock.expect_run_command().times(4).returning(|target, _, _| {
            Err(FanoutError::Connection {
                target: target.name().to_string(),
                message: "connection refused".to_string(),
            })
        });

        let executor = executor_with(Arc::new(mock), ExecutorConfig::default());
        let results = executor
            .run_command(&targets(4), "uptime", Options::new(), None)
            .await;

        assert_eq!(results.len(), 4);
        assert!(!results.ok());
        assert_eq!(results.error_set().len(), 4);
        for result in &results {
            let error = result.error().unwrap();
            assert_eq!(error.kind, CONNECT_ERROR);
            assert!(error.msg.contains("connection refused"));
        }
    }

    #[tokio::test]
    async fn test_panics_become_exception_errors() {
        let executor = executor_with(Arc::new(PanickingTransport), ExecutorConfig::default());
        let results = executor
            .run_command(&targets(2), "uptime", Options::new(), None)
            .await;

        assert_eq!(results.len(), 2);
        for result in &results {
            let error = result.error().unwrap();
            assert_eq!(error.kind, EXCEPTION_ERROR);
            assert_eq!(error.msg, "connection exploded");
        }
    }

    #[tokio::test]
    async fn test_unregistered_transport_fails_target() {
        let executor = Executor::new(
            ExecutorConfig::default(),
            Arc::new(TransportRegistry::new()),
        );
        let results = executor
            .run_command(&[Target::new("winrm://win1")], "dir", Options::new(), None)
            .await;
        assert_eq!(results[0].error().unwrap().kind, UNKNOWN_TRANSPORT);
    }

    #[tokio::test]
    async fn test_notifications_pair_per_target() {
        let mut mock = MockTransport::new();
        mock.expect_run_command()
            .returning(|target, _, _| Ok(TargetResult::new(target.clone())));
        let executor = executor_with(Arc::new(mock), ExecutorConfig::default());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: Callback = Arc::new(move |event: Event| {
            sink.lock()
                .unwrap()
                .push((event.kind(), event.target().name().to_string()));
        });

        let targets = targets(6);
        executor
            .run_command(&targets, "uptime", Options::new(), Some(callback))
            .await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 12);
        for target in &targets {
            let positions: Vec<(usize, &str)> = events
                .iter()
                .enumerate()
                .filter(|(_, (_, name))| name == target.name())
                .map(|(i, (kind, _))| (i, *kind))
                .collect();
            assert_eq!(positions.len(), 2);
            assert_eq!(positions[0].1, "node_start");
            assert_eq!(positions[1].1, "node_result");
        }
    }

    #[tokio::test]
    async fn test_noop_forwarded_to_tasks() {
        let mut mock = MockTransport::new();
        mock.expect_run_task()
            .withf(|_: &Target, _: &Task, _: &Map<String, Value>, options: &Options| {
                options.get(NOOP_OPTION) == Some(&Value::Bool(true))
            })
            .times(1)
            .returning(|target, _, _, _| Ok(TargetResult::new(target.clone())));

        let config = ExecutorConfig {
            noop: true,
            ..ExecutorConfig::default()
        };
        let executor = executor_with(Arc::new(mock), config);
        let results = executor
            .run_task(
                &targets(1),
                Task::new("noop", "/tasks/noop.sh"),
                Map::new(),
                Options::new(),
                None,
            )
            .await;
        assert!(results.ok());
    }

    #[test]
    fn test_action_describe() {
        let action = Action::Command {
            command: "uptime".to_string(),
        };
        assert_eq!(action.describe(), "command 'uptime'");
        assert_eq!(action.name(), "command");
        assert_eq!(pluralize(1, "target"), "1 target");
        assert_eq!(pluralize(0, "failure"), "0 failures");
    }
}
