use crate::executor::{Action, ExecutorConfig, DEFAULT_CONCURRENCY};
use crate::inventory::Inventory;
use crate::target::TransportKind;
use crate::task::{InputMethod, Task};
use crate::transport::Options;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Fanout - run commands, scripts, tasks and uploads across inventory targets
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Inventory file (YAML)
    #[arg(short = 'i', long, env = "FANOUT_INVENTORY_FILE")]
    pub inventory: Option<PathBuf>,

    /// Inline inventory YAML, used when no inventory file is given
    #[arg(long, env = "FANOUT_INVENTORY", hide_env_values = true)]
    pub inventory_yaml: Option<String>,

    /// Targets to act on: names, groups, URIs or wildcards, comma separated
    #[arg(short = 't', long)]
    pub targets: String,

    /// Maximum number of targets acted on at once
    #[arg(short = 'c', long, env = "FANOUT_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// User to run as on targets that do not set one
    #[arg(long, env = "FANOUT_RUN_AS")]
    pub run_as: Option<String>,

    /// Transport for targets that do not name one
    #[arg(long, env = "FANOUT_TRANSPORT")]
    pub transport: Option<String>,

    /// Log action start and finish at info level
    #[arg(long)]
    pub plan_logging: bool,

    /// Ask tasks to make no changes
    #[arg(long)]
    pub noop: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub action: ActionCommand,
}

/// Action to dispatch
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ActionCommand {
    /// Run a shell command
    Command { command: String },

    /// Upload and run a local script
    Script {
        script: PathBuf,
        #[arg(trailing_var_arg = true)]
        arguments: Vec<String>,
    },

    /// Run a task executable with JSON parameters
    Task {
        /// Task name, e.g. `service::restart`
        name: String,

        /// Path to the task executable
        #[arg(short = 'e', long)]
        executable: PathBuf,

        /// Parameters as a JSON object
        #[arg(short = 'p', long, default_value = "{}")]
        params: String,

        #[arg(long, value_enum, default_value_t = InputMethodArg::Both)]
        input_method: InputMethodArg,
    },

    /// Copy a local file to every target
    Upload {
        source: PathBuf,
        destination: PathBuf,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMethodArg {
    Stdin,
    Environment,
    Both,
}

impl From<InputMethodArg> for InputMethod {
    fn from(arg: InputMethodArg) -> Self {
        match arg {
            InputMethodArg::Stdin => Self::Stdin,
            InputMethodArg::Environment => Self::Environment,
            InputMethodArg::Both => Self::Both,
        }
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.targets.trim().is_empty() {
            anyhow::bail!("At least one target must be given");
        }

        if self.concurrency == 0 {
            anyhow::bail!("Concurrency must be greater than 0");
        }

        if let Some(ref user) = self.run_as {
            validate_run_as(user)?;
        }

        self.transport_kind()?;

        if let ActionCommand::Task { ref name, .. } = self.action {
            validate_task_name(name)?;
        }

        Ok(())
    }

    /// Default transport named on the command line, if any
    pub fn transport_kind(&self) -> anyhow::Result<Option<TransportKind>> {
        match self.transport {
            Some(ref name) => Ok(Some(name.parse()?)),
            None => Ok(None),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            concurrency: self.concurrency,
            run_as: self.run_as.clone(),
            plan_logging: self.plan_logging,
            noop: self.noop,
        }
    }

    /// Load the inventory from the file, the inline YAML, or neither
    pub fn load_inventory(&self) -> anyhow::Result<Inventory> {
        let inventory = match (&self.inventory, &self.inventory_yaml) {
            (Some(path), _) => Inventory::from_file(path)?,
            (None, Some(text)) => Inventory::from_yaml_str(text)?,
            (None, None) => Inventory::empty(),
        };
        inventory.validate()?;

        Ok(match self.transport_kind()? {
            Some(kind) => inventory.with_default_transport(kind),
            None => inventory,
        })
    }

    /// The action to dispatch with its options
    pub fn action(&self) -> anyhow::Result<(Action, Options)> {
        let action = match &self.action {
            ActionCommand::Command { command } => Action::Command {
                command: command.clone(),
            },
            ActionCommand::Script { script, arguments } => Action::Script {
                script: script.clone(),
                arguments: arguments.clone(),
            },
            ActionCommand::Task {
                name,
                executable,
                params,
                input_method,
            } => Action::Task {
                task: Task::new(name.as_str(), executable.clone())
                    .with_input_method((*input_method).into()),
                parameters: parse_params(params)?,
            },
            ActionCommand::Upload {
                source,
                destination,
            } => Action::Upload {
                source: source.clone(),
                destination: destination.clone(),
            },
        };
        Ok((action, Options::new()))
    }

    /// Log filter directive for the requested verbosity
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Parse task parameters, which must be a JSON object
pub fn parse_params(text: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("Task parameters must be a JSON object"),
    }
}

/// Validate a run-as user name
pub fn validate_run_as(user: &str) -> anyhow::Result<()> {
    if user.is_empty() {
        anyhow::bail!("Run-as user cannot be empty");
    }

    if user.len() > 32 {
        anyhow::bail!("Run-as user cannot exceed 32 characters");
    }

    // Check for control characters
    if user.chars().any(|c| c.is_control()) {
        anyhow::bail!("Run-as user contains invalid characters");
    }

    // Only allow alphanumeric, hyphens, dots and underscores
    if !user
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        anyhow::bail!(
            "Run-as user can only contain alphanumeric characters, hyphens, dots, and underscores"
        );
    }

    Ok(())
}

/// Validate a task name such as `package` or `service::restart`
pub fn validate_task_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        anyhow::bail!("Task name cannot be empty");
    }

    let valid_segment = |segment: &str| {
        segment.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };

    if !name.split("::").all(valid_segment) {
        anyhow::bail!("Invalid task name '{}'", name);
    }

    Ok(())
}
