use fanout::config::{validate_run_as, validate_task_name};
use fanout::error::{FanoutError, COMMAND_ERROR, UNKNOWN_TRANSPORT};
use fanout::executor::{Executor, ExecutorConfig};
use fanout::fiber::{FiberExecutor, WaitOptions};
use fanout::inventory::Inventory;
use fanout::notifier::{Callback, Event};
use fanout::target::TransportKind;
use fanout::transport::{Options, TransportRegistry};
use serde_json::{json, Value};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const INVENTORY: &str = r#"
config:
  transport: local
groups:
  - name: web
    targets:
      - web1
      - name: web2
        vars:
          role: frontend
  - name: db
    targets: [db1]
    config:
      ssh:
        port: 2222
"#;

fn executor(concurrency: usize) -> Executor {
    Executor::new(
        ExecutorConfig {
            concurrency,
            ..ExecutorConfig::default()
        },
        Arc::new(TransportRegistry::with_defaults()),
    )
}

#[tokio::test]
async fn test_command_across_inventory_group() {
    let mut inventory = Inventory::from_yaml_str(INVENTORY).unwrap();
    let targets = inventory.get_targets("web").unwrap();
    assert_eq!(targets.len(), 2);
    assert!(targets.iter().all(|t| t.transport() == TransportKind::Local));

    let results = executor(1)
        .run_command(&targets, "echo hello", Options::new(), None)
        .await;

    assert!(results.ok());
    assert_eq!(results.names(), vec!["web1", "web2"]);
    for result in &results {
        let stdout = result.get("stdout").and_then(Value::as_str).unwrap();
        assert!(stdout.contains("hello"));
        assert_eq!(result.status(), "success");
    }
}

#[tokio::test]
async fn test_failures_become_results() {
    let mut inventory = Inventory::from_yaml_str(INVENTORY).unwrap();
    // The URI scheme wins over the inventory's local transport
    let mut targets = inventory.get_targets("web1").unwrap();
    targets.extend(inventory.get_targets("ssh://db9").unwrap());

    let results = executor(4)
        .run_command(&targets, "exit 3", Options::new(), None)
        .await;

    assert!(!results.ok());
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].error().unwrap().kind, COMMAND_ERROR);
    assert_eq!(results[1].error().unwrap().kind, UNKNOWN_TRANSPORT);
    assert_eq!(results.error_set().len(), 2);
}

#[tokio::test]
async fn test_upload_with_events() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("motd");
    std::fs::write(&source, "welcome\n").unwrap();
    let destination = dir.path().join("out").join("motd");

    let mut inventory = Inventory::from_yaml_str(INVENTORY).unwrap();
    let targets = inventory.get_targets("web1").unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    let callback: Callback = Arc::new(move |event: Event| {
        seen.lock().unwrap().push(event.kind());
    });

    let results = executor(2)
        .upload_file(&targets, &source, &destination, Options::new(), Some(callback))
        .await;

    assert!(results.ok());
    assert_eq!(std::fs::read_to_string(&destination).unwrap(), "welcome\n");
    assert_eq!(*events.lock().unwrap(), vec!["node_start", "node_result"]);
}

#[test]
fn test_inventory_rejects_duplicate_groups() {
    let inventory = Inventory::from_yaml_str(
        r#"
groups:
  - name: web
    targets: [a]
  - name: web
    targets: [b]
"#,
    )
    .unwrap();
    let err = inventory.validate().unwrap_err();
    assert!(matches!(err, FanoutError::Validation { .. }));
}

#[tokio::test]
async fn test_plan_fans_out_commands_in_futures() {
    let mut inventory = Inventory::from_yaml_str(INVENTORY).unwrap();
    let targets = inventory.get_targets("web").unwrap();
    let executor = Rc::new(executor(10));

    let fibers = FiberExecutor::new();
    let plan = fibers.run_plan("deploy", move |context| async move {
        for target in targets {
            let executor = Rc::clone(&executor);
            let name = target.name().to_string();
            context.background(Some(&name), move |_| async move {
                let results = executor
                    .run_command(&[target], "echo ok", Options::new(), None)
                    .await;
                Ok(json!(results.ok()))
            });
        }
        let outcomes = context.wait(None, WaitOptions::default()).await?;
        Ok(Value::Array(outcomes.into_iter().map(|o| o.unwrap()).collect()))
    });

    fibers.run_until_complete().await;
    assert_eq!(plan.outcome(), Some(Ok(json!([true, true]))));
    let names: Vec<String> = fibers
        .futures_for_plan("deploy")
        .iter()
        .map(|f| f.name().to_string())
        .collect();
    assert_eq!(names, vec!["web1", "web2"]);
}

#[tokio::test]
async fn test_plan_wait_timeout() {
    let fibers = FiberExecutor::with_idle_interval(Duration::from_millis(10));
    let futures: Vec<_> = (0..3)
        .map(|_| {
            fibers.create_future("plan", None, |_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(Value::Null)
            })
        })
        .collect();

    let err = fibers
        .wait(futures, WaitOptions::timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Plan aborted: parallel block failed on 3 targets"
    );
}

#[test]
fn test_cli_input_validation() {
    assert!(validate_run_as("deploy").is_ok());
    assert!(validate_run_as("root;rm -rf /").is_err());
    assert!(validate_run_as("user\u{202e}x").is_err());
    assert!(validate_task_name("service::restart").is_ok());
    assert!(validate_task_name("service restart").is_err());
}
