use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How task parameters are handed to the task executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMethod {
    /// Parameters as a JSON document on stdin
    Stdin,
    /// Parameters as `PT_<name>` environment variables
    Environment,
    /// Both of the above
    #[default]
    Both,
}

impl InputMethod {
    #[must_use]
    pub fn uses_stdin(self) -> bool {
        matches!(self, Self::Stdin | Self::Both)
    }

    #[must_use]
    pub fn uses_environment(self) -> bool {
        matches!(self, Self::Environment | Self::Both)
    }
}

/// A task: a named executable that takes structured parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task name, e.g. `service::restart`
    pub name: String,

    /// Path of the executable on the controller
    pub executable: PathBuf,

    #[serde(default)]
    pub input_method: InputMethod,
}

impl Task {
    #[must_use]
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            input_method: InputMethod::default(),
        }
    }

    #[must_use]
    pub fn with_input_method(mut self, input_method: InputMethod) -> Self {
        self.input_method = input_method;
        self
    }
}
