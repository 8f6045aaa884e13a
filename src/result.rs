use crate::error::{ErrorInfo, FanoutError, COMMAND_ERROR, TASK_ERROR};
use crate::target::Target;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::{json, Map, Value};
use std::ops::Index;

/// Value key holding a captured error
const ERROR_KEY: &str = "_error";
/// Value key holding a plain message
const OUTPUT_KEY: &str = "_output";

/// Outcome of one action on one target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetResult {
    target: Target,
    value: Map<String, Value>,
    action: Option<String>,
    object: Option<String>,
}

impl TargetResult {
    /// A successful result with no value
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self::with_value(target, Map::new())
    }

    /// A result carrying a value map
    #[must_use]
    pub fn with_value(target: Target, value: Map<String, Value>) -> Self {
        Self {
            target,
            value,
            action: None,
            object: None,
        }
    }

    /// A failing result carrying a structured error
    #[must_use]
    pub fn from_error(target: Target, error: &ErrorInfo) -> Self {
        let mut value = Map::new();
        value.insert(
            ERROR_KEY.to_string(),
            serde_json::to_value(error).unwrap_or(Value::Null),
        );
        Self::with_value(target, value)
    }

    /// A failing result for an error raised while acting on the target
    #[must_use]
    pub fn from_exception(target: Target, error: &FanoutError) -> Self {
        Self::from_error(target, &error.to_error_info())
    }

    /// Result of a command or script run
    #[must_use]
    pub fn for_command(
        target: Target,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
        action: &str,
        command: &str,
    ) -> Self {
        let mut value = Map::new();
        value.insert("stdout".to_string(), json!(stdout));
        value.insert("stderr".to_string(), json!(stderr));
        value.insert("exit_code".to_string(), json!(exit_code));
        if exit_code != 0 {
            let error = ErrorInfo::new(
                COMMAND_ERROR,
                format!("The command failed with exit code {exit_code}"),
            )
            .with_details(json!({ "exit_code": exit_code }))
            .with_issue_code("COMMAND_ERROR");
            value.insert(
                ERROR_KEY.to_string(),
                serde_json::to_value(error).unwrap_or(Value::Null),
            );
        }
        Self::with_value(target, value).with_action(action, command)
    }

    /// Result of a task run
    ///
    /// A JSON object on stdout becomes the value; anything else is kept
    /// verbatim under `_output`.
    #[must_use]
    pub fn for_task(
        target: Target,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
        task: &str,
    ) -> Self {
        let mut value = match serde_json::from_str::<Value>(stdout) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                map.insert(OUTPUT_KEY.to_string(), json!(stdout));
                map
            }
        };

        if exit_code != 0 && !value.contains_key(ERROR_KEY) {
            let msg = if stdout.is_empty() {
                format!("The task failed with exit code {exit_code}:\n{stderr}")
            } else {
                format!("The task failed with exit code {exit_code}")
            };
            let error = ErrorInfo::new(TASK_ERROR, msg)
                .with_details(json!({ "exit_code": exit_code }))
                .with_issue_code("TASK_ERROR");
            value.insert(
                ERROR_KEY.to_string(),
                serde_json::to_value(error).unwrap_or(Value::Null),
            );
        }

        Self::with_value(target, value).with_action("task", task)
    }

    /// Result of a file upload
    #[must_use]
    pub fn for_upload(target: Target, source: &str, destination: &str) -> Self {
        let mut value = Map::new();
        value.insert(
            OUTPUT_KEY.to_string(),
            json!(format!(
                "Uploaded '{source}' to '{}:{destination}'",
                target.host()
            )),
        );
        Self::with_value(target, value).with_action("upload", source)
    }

    #[must_use]
    pub fn with_action(mut self, action: &str, object: &str) -> Self {
        self.action = Some(action.to_string());
        self.object = Some(object.to_string());
        self
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    #[must_use]
    pub fn value(&self) -> &Map<String, Value> {
        &self.value
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    #[must_use]
    pub fn object(&self) -> Option<&str> {
        self.object.as_deref()
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.value.get(OUTPUT_KEY).and_then(Value::as_str)
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        self.error_value().is_none()
    }

    #[must_use]
    pub fn status(&self) -> &'static str {
        if self.ok() {
            "success"
        } else {
            "failure"
        }
    }

    /// Raw `_error` entry
    #[must_use]
    pub fn error_value(&self) -> Option<&Value> {
        self.value.get(ERROR_KEY).filter(|v| !v.is_null())
    }

    /// Captured error, if the result failed
    #[must_use]
    pub fn error(&self) -> Option<ErrorInfo> {
        self.error_value()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The value without the reserved `_error` and `_output` keys
    #[must_use]
    pub fn generic_value(&self) -> Map<String, Value> {
        self.value
            .iter()
            .filter(|(k, _)| k.as_str() != ERROR_KEY && k.as_str() != OUTPUT_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Summary record used for output
    #[must_use]
    pub fn status_hash(&self) -> Value {
        json!({
            "target": self.target.name(),
            "action": self.action,
            "object": self.object,
            "status": self.status(),
            "value": self.value,
        })
    }
}

impl Serialize for TargetResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.status_hash().serialize(serializer)
    }
}

/// Ordered results of one dispatch, one per target in dispatch order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    results: Vec<TargetResult>,
}

impl ResultSet {
    #[must_use]
    pub fn new(results: Vec<TargetResult>) -> Self {
        Self { results }
    }

    #[must_use]
    pub fn results(&self) -> &[TargetResult] {
        &self.results
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TargetResult> {
        self.results.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Whether every result succeeded
    #[must_use]
    pub fn ok(&self) -> bool {
        self.results.iter().all(TargetResult::ok)
    }

    #[must_use]
    pub fn filter_set<F>(&self, predicate: F) -> Self
    where
        F: Fn(&TargetResult) -> bool,
    {
        self.results
            .iter()
            .filter(|r| predicate(*r))
            .cloned()
            .collect()
    }

    /// Only the failed results
    #[must_use]
    pub fn error_set(&self) -> Self {
        self.filter_set(|r| !r.ok())
    }

    /// Only the successful results
    #[must_use]
    pub fn ok_set(&self) -> Self {
        self.filter_set(TargetResult::ok)
    }

    /// Result for the target with this name
    #[must_use]
    pub fn find(&self, target_name: &str) -> Option<&TargetResult> {
        self.results
            .iter()
            .find(|r| r.target().name() == target_name)
    }

    #[must_use]
    pub fn first(&self) -> Option<&TargetResult> {
        self.results.first()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TargetResult> {
        self.results.get(index)
    }

    #[must_use]
    pub fn targets(&self) -> Vec<Target> {
        self.results.iter().map(|r| r.target().clone()).collect()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.target().name()).collect()
    }

    #[must_use]
    pub fn into_results(self) -> Vec<TargetResult> {
        self.results
    }
}

impl Index<usize> for ResultSet {
    type Output = TargetResult;

    fn index(&self, index: usize) -> &Self::Output {
        &self.results[index]
    }
}

impl FromIterator<TargetResult> for ResultSet {
    fn from_iter<I: IntoIterator<Item = TargetResult>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for ResultSet {
    type Item = TargetResult;
    type IntoIter = std::vec::IntoIter<TargetResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a TargetResult;
    type IntoIter = std::slice::Iter<'a, TargetResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

impl Serialize for ResultSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.results.len()))?;
        for result in &self.results {
            seq.serialize_element(result)?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EXCEPTION_ERROR;

    fn target(name: &str) -> Target {
        Target::new(name)
    }

    #[test]
    fn test_command_success() {
        let result = TargetResult::for_command(target("node1"), "hi\n", "", 0, "command", "echo hi");
        assert!(result.ok());
        assert_eq!(result.status(), "success");
        assert_eq!(result.get("stdout"), Some(&json!("hi\n")));
        assert_eq!(result.action(), Some("command"));
        assert_eq!(result.object(), Some("echo hi"));
        assert!(result.error().is_none());
    }

    #[test]
    fn test_command_failure_sets_error() {
        let result = TargetResult::for_command(target("node1"), "", "nope", 3, "command", "false");
        assert!(!result.ok());
        let error = result.error().unwrap();
        assert_eq!(error.kind, COMMAND_ERROR);
        assert_eq!(error.msg, "The command failed with exit code 3");
        assert_eq!(error.details["exit_code"], 3);
    }

    #[test]
    fn test_task_parses_json_object() {
        let result = TargetResult::for_task(target("node1"), r#"{"status": "up"}"#, "", 0, "svc");
        assert!(result.ok());
        assert_eq!(result.get("status"), Some(&json!("up")));
        assert!(result.message().is_none());
    }

    #[test]
    fn test_task_non_json_output() {
        let result = TargetResult::for_task(target("node1"), "[1, 2]", "", 0, "svc");
        assert_eq!(result.message(), Some("[1, 2]"));
    }

    #[test]
    fn test_task_failure_with_empty_stdout_includes_stderr() {
        let result = TargetResult::for_task(target("node1"), "", "broken", 1, "svc");
        let error = result.error().unwrap();
        assert_eq!(error.kind, TASK_ERROR);
        assert_eq!(error.msg, "The task failed with exit code 1:\nbroken");
    }

    #[test]
    fn test_task_keeps_reported_error() {
        let stdout = r#"{"_error": {"kind": "svc/down", "msg": "service down", "details": {}}}"#;
        let result = TargetResult::for_task(target("node1"), stdout, "", 1, "svc");
        assert_eq!(result.error().unwrap().kind, "svc/down");
    }

    #[test]
    fn test_from_exception() {
        let err = FanoutError::Executor("worker vanished".to_string());
        let result = TargetResult::from_exception(target("node1"), &err);
        assert!(!result.ok());
        let error = result.error().unwrap();
        assert_eq!(error.kind, EXCEPTION_ERROR);
        assert_eq!(error.msg, "Executor error: worker vanished");
    }

    #[test]
    fn test_upload_message() {
        let result = TargetResult::for_upload(target("ssh://web1:22"), "/tmp/a", "/srv/a");
        assert_eq!(result.message(), Some("Uploaded '/tmp/a' to 'web1:/srv/a'"));
        assert!(result.generic_value().is_empty());
    }

    #[test]
    fn test_result_set_predicates() {
        let set = ResultSet::new(vec![
            TargetResult::new(target("a")),
            TargetResult::for_command(target("b"), "", "", 1, "command", "false"),
            TargetResult::new(target("c")),
        ]);
        assert_eq!(set.len(), 3);
        assert!(!set.ok());
        assert_eq!(set.error_set().names(), vec!["b"]);
        assert_eq!(set.ok_set().names(), vec!["a", "c"]);
        assert_eq!(set[2].target().name(), "c");
        assert!(set.find("b").is_some());
        assert!(set.find("z").is_none());
        assert!(set.error_set().error_set().len() == 1);
    }

    #[test]
    fn test_result_set_serializes_status_hashes() {
        let set = ResultSet::new(vec![TargetResult::new(target("a"))]);
        let data = serde_json::to_value(&set).unwrap();
        assert_eq!(data[0]["target"], "a");
        assert_eq!(data[0]["status"], "success");
    }

    #[test]
    fn test_empty_result_set_is_ok() {
        let set = ResultSet::default();
        assert!(set.ok());
        assert!(set.is_empty());
        assert!(set.first().is_none());
    }
}
