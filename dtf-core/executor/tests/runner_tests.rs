//! 脚本执行器集成测试

use async_trait::async_trait;
use dtf_common::AttrValue;
use dtf_executor::*;
use dtf_script::parse;
use dtf_storage::{EventFilter, Storage, StorageManager};
use std::collections::BTreeMap;
use std::sync::Arc;

async fn memory_storage() -> Arc<Storage> {
    let manager = StorageManager::new_in_memory().await.unwrap();
    Arc::new(Storage::from_manager(&manager))
}

#[tokio::test]
async fn test_passing_run_is_persisted() {
    let storage = memory_storage().await;
    let script = parse(
        r#"
name: smoke
description: 冒烟测试
properties:
  build: "1.0"
actions:
  - { type: log, message: "build ${build}" }
  - { type: record_property, name: build, value: "${build}" }
  - { type: record, event: put, attributes: { size: "int:10" } }
"#,
    )
    .unwrap();

    let report = ScriptRunner::new()
        .with_storage(storage.clone())
        .run(&script)
        .await
        .unwrap();

    assert!(report.passed);
    assert_eq!(report.actions_executed, 3);
    assert_eq!(report.properties, vec![("build".to_string(), "1.0".to_string())]);

    let run_id = report.run_id.unwrap();
    let run = storage.runs().get_by_id(run_id).await.unwrap().unwrap();
    assert!(run.passed);
    assert_eq!(run.total_actions, 3);
    assert_eq!(run.description.as_deref(), Some("冒烟测试"));

    let puts = storage
        .events()
        .events(&EventFilter::for_run(run_id).named("put"))
        .await
        .unwrap();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].attr("size"), Some(&AttrValue::Int(10)));

    let props = storage.properties().list_for_run(run_id).await.unwrap();
    assert_eq!(props[0].value, "1.0");
}

#[tokio::test]
async fn test_failing_run_reports_error() {
    let script = parse(
        r#"
name: broken
actions:
  - { type: fail, label: explode, message: "boom ${reason}" }
"#,
    )
    .unwrap();

    let report = ScriptRunner::new()
        .with_properties(BTreeMap::from([("reason".to_string(), "disk".to_string())]))
        .run(&script)
        .await
        .unwrap();

    assert!(!report.passed);
    assert!(!report.stopped);
    assert_eq!(report.failed_count, 1);
    assert!(report.error.unwrap().contains("boom disk"));
}

#[tokio::test]
async fn test_overrides_win_over_script_defaults() {
    let script = parse(
        r#"
name: props
properties:
  mode: slow
actions:
  - type: if
    property: mode
    equals: fast
    then:
      - { type: record, event: picked }
"#,
    )
    .unwrap();

    let recorder = Arc::new(MemorySink::new());
    let report = ScriptRunner::new()
        .with_sink(recorder.clone())
        .with_properties(BTreeMap::from([("mode".to_string(), "fast".to_string())]))
        .run(&script)
        .await
        .unwrap();

    assert!(report.passed);
    assert_eq!(recorder.cursor(&EventQuery::named("picked")).await.len(), 1);
}

#[tokio::test]
async fn test_event_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let script = parse(
        r#"
name: file
actions:
  - { type: record, event: tick }
  - { type: record, event: tick }
"#,
    )
    .unwrap();

    ScriptRunner::new()
        .with_event_log(&path)
        .run(&script)
        .await
        .unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    // 两个 tick 事件 + 两个动作事件
    assert_eq!(content.lines().count(), 4);
}

#[tokio::test]
async fn test_archive_actions() {
    let archive = Arc::new(MemoryArchive::new());
    let script = parse(
        r#"
name: archive
actions:
  - type: store_object
    data: payload
    metadata: { kind: doc }
    property: oid
  - { type: select_unique, query: "kind=doc", property: found }
  - { type: retrieve_object, oid: "${found}", property: data }
  - { type: get_metadata, oid: "${oid}", property: meta }
  - type: if
    property: data
    equals: payload
    then:
      - { type: record, event: verified }
"#,
    )
    .unwrap();

    let sink = Arc::new(MemorySink::new());
    let report = ScriptRunner::new()
        .with_archive(archive.clone())
        .with_sink(sink.clone())
        .run(&script)
        .await
        .unwrap();

    assert!(report.passed, "{:?}", report.error);
    assert_eq!(archive.len().await, 1);
    assert_eq!(sink.cursor(&EventQuery::named("verified")).await.len(), 1);
}

#[tokio::test]
async fn test_archive_action_without_client_fails() {
    let script = parse(
        r#"
name: archive
actions:
  - { type: query, query: "kind=doc" }
"#,
    )
    .unwrap();

    let report = ScriptRunner::new().run(&script).await.unwrap();
    assert!(!report.passed);
    assert!(report.error.unwrap().contains("存储客户端"));
}

struct Doubler;

#[async_trait]
impl ActionHandler for Doubler {
    async fn execute(&self, params: &BTreeMap<String, String>) -> dtf_executor::Result<Option<String>> {
        let n: i64 = params
            .get("n")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ExecutorError::Plugin("缺少参数 n".to_string()))?;
        Ok(Some((n * 2).to_string()))
    }
}

#[tokio::test]
async fn test_custom_action_uses_plugin() {
    let plugins = Arc::new(PluginRegistry::new());
    plugins.register("double", Arc::new(Doubler)).await.unwrap();

    let script = parse(
        r#"
name: plugin
properties:
  n: "21"
actions:
  - { type: custom, label: twice, handler: double, params: { n: "${n}" } }
  - { type: custom, label: missing, handler: unknown }
"#,
    )
    .unwrap();

    let report = ScriptRunner::new()
        .with_plugins(plugins)
        .run(&script)
        .await
        .unwrap();

    assert!(!report.passed);
    assert_eq!(report.actions[0].status, dtf_common::ActionStatus::Success);
    assert_eq!(report.actions[1].action, "missing");
    assert!(report.actions[1].error.as_deref().unwrap().contains("unknown"));
}

#[tokio::test]
async fn test_stop_before_run_marks_stopped() {
    let script = parse(
        r#"
name: stopped
actions:
  - { type: log, message: never }
"#,
    )
    .unwrap();

    let runner = ScriptRunner::new();
    runner.stop_handle().stop();
    let report = runner.run(&script).await.unwrap();

    assert!(!report.passed);
    assert!(report.stopped);
    assert_eq!(report.actions_executed, 0);
}
