//! 远程执行端到端测试 (本地回环 Agent)

use dtf_agent::{AgentConfig, AgentServer, AgentService};
use dtf_common::{context_keys, ActionStatus, StateSnapshot};
use dtf_executor::{
    Dispatcher, EventQuery, ExecutorError, Recorder, ScriptRunner, ACTION_EVENT,
};
use dtf_script::{parse, Action, ActionKind, ExecutionState, StateStack, Template};
use dtf_transport::{
    AgentDirectory, AgentInfo, ReconnectConfig, StaticMembership, TransportConfig,
    TransportManager, WireMessage,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 启动一个 Agent，返回监听地址
async fn spawn_agent(name: &str, shutdown: CancellationToken) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let config = AgentConfig {
        name: name.to_string(),
        listen: addr.clone(),
        roles: Vec::new(),
    };
    let server = AgentServer::new(config, Arc::new(AgentService::new(name)));
    tokio::spawn(async move {
        server.serve(listener, shutdown).await.unwrap();
    });
    addr
}

fn transport_config() -> TransportConfig {
    TransportConfig {
        connect_timeout: 2,
        request_timeout: 10,
        max_consecutive_failures: 3,
        reconnect: ReconnectConfig {
            max_attempts: 3,
            initial_delay: 10,
            max_delay: 50,
            backoff_multiplier: 2.0,
        },
    }
}

/// 建立通信管理器和节点目录
async fn cluster(agents: &[(&str, &str, &[&str])]) -> (Arc<TransportManager>, Arc<AgentDirectory>) {
    let manager = Arc::new(TransportManager::new(transport_config()));
    let mut infos = Vec::new();
    for (name, addr, roles) in agents {
        let info = AgentInfo::new(name, addr).with_roles(roles.iter().map(|r| r.to_string()).collect());
        manager.add_agent(info.clone()).await;
        infos.push(info);
    }
    let directory = Arc::new(AgentDirectory::new(Arc::new(StaticMembership::from_agents(&infos))));
    (manager, directory)
}

#[tokio::test]
async fn test_remote_block_runs_on_master() {
    let shutdown = CancellationToken::new();
    let addr = spawn_agent("a1", shutdown.clone()).await;
    let (manager, directory) = cluster(&[("a1", &addr, &["master"])]).await;

    let script = parse(
        r#"
name: remote
properties:
  greeting: hello
actions:
  - type: remote
    label: on-master
    target: master
    actions:
      - { type: log, message: "${greeting} from agent" }
      - { type: exec, command: echo, args: ["${greeting}"] }
"#,
    )
    .unwrap();

    let report = ScriptRunner::new()
        .with_transport(manager.clone(), directory)
        .run(&script)
        .await
        .unwrap();

    assert!(report.passed, "{:?}", report.error);
    assert_eq!(report.actions.len(), 1);
    assert_eq!(report.actions[0].kind, "remote");
    assert_eq!(report.actions[0].agent.as_deref(), Some("a1"));

    shutdown.cancel();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_remote_and_local_results_match() {
    let shutdown = CancellationToken::new();
    let addr = spawn_agent("a1", shutdown.clone()).await;
    let (manager, _directory) = cluster(&[("a1", &addr, &[])]).await;

    let subtree = Action::sequence(vec![
        Action::new(ActionKind::Property {
            name: "x".to_string(),
            value: Template::new("1"),
            overwrite: false,
        }),
        Action::new(ActionKind::Fail {
            message: Template::new("boom ${x}"),
        }),
    ])
    .named("block");

    // 本地执行
    let recorder = Arc::new(Recorder::new());
    let dispatcher = Dispatcher::new(Arc::new(Default::default()), recorder);
    let mut stack = StateStack::new(ExecutionState::new("main"));
    let local = dispatcher.execute(&subtree, &mut stack).await.unwrap_err();

    // 远程执行
    let remote = manager
        .send_action("a1", &subtree, StateSnapshot::default(), None)
        .await
        .unwrap();

    assert_eq!(remote.status, ActionStatus::Failed);
    assert_eq!(remote.action, subtree.label());
    let payload = remote.error.unwrap();
    assert_eq!(payload.kind, local.error.kind());
    assert_eq!(payload.message, local.error.to_string());

    shutdown.cancel();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_remote_logs_routed_to_registered_thread() {
    let shutdown = CancellationToken::new();
    let addr = spawn_agent("a1", shutdown.clone()).await;
    let (manager, _directory) = cluster(&[("a1", &addr, &[])]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.register("a1", "main.3", Some(tx)).await.unwrap();

    let action = Action::sequence(vec![Action::new(ActionKind::Log {
        message: Template::new("progress 50%"),
        level: Some("warn".to_string()),
    })]);
    let snapshot = StateSnapshot {
        properties: BTreeMap::new(),
        global_context: BTreeMap::from([(
            context_keys::REMOTE_THREAD.to_string(),
            "main.3".to_string(),
        )]),
    };
    let result = manager.send_action("a1", &action, snapshot, None).await.unwrap();
    assert!(result.is_success());

    let record = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.agent, "a1");
    assert_eq!(record.level, "warn");
    assert_eq!(record.message, "progress 50%");

    manager.unregister("a1", "main.3").await.unwrap();
    shutdown.cancel();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_fan_out_to_all_agents() {
    let shutdown = CancellationToken::new();
    let a1 = spawn_agent("a1", shutdown.clone()).await;
    let a2 = spawn_agent("a2", shutdown.clone()).await;
    let (manager, directory) = cluster(&[("a1", &a1, &["worker"]), ("a2", &a2, &["worker"])]).await;

    let script = parse(
        r#"
name: fanout
actions:
  - type: remote
    target: "role:worker"
    actions:
      - { type: sleep, millis: 10 }
"#,
    )
    .unwrap();

    let report = ScriptRunner::new()
        .with_transport(manager.clone(), directory)
        .run(&script)
        .await
        .unwrap();

    assert!(report.passed, "{:?}", report.error);
    let agents: Vec<_> = report
        .actions
        .iter()
        .filter_map(|a| a.agent.clone())
        .collect();
    assert_eq!(agents, vec!["a1".to_string(), "a2".to_string()]);

    shutdown.cancel();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_no_available_agent() {
    let (manager, directory) = cluster(&[("a1", "127.0.0.1:1", &[])]).await;
    let script = parse(
        r#"
name: none
actions:
  - type: remote
    target: "role:db"
    actions:
      - { type: log, message: x }
"#,
    )
    .unwrap();

    let report = ScriptRunner::new()
        .with_transport(manager, directory)
        .run(&script)
        .await
        .unwrap();

    assert!(!report.passed);
    assert!(report.error.unwrap().contains("没有可用的 Agent"));
}

#[tokio::test]
async fn test_unreachable_agent_fails_after_retries() {
    // 绑定后立即释放，得到一个无人监听的端口
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let (manager, directory) = cluster(&[("ghost", &addr, &[])]).await;

    let script = parse(
        r#"
name: retry
actions:
  - type: remote
    label: R
    target: ghost
    retries: 1
    actions:
      - { type: log, message: x }
"#,
    )
    .unwrap();

    let recorder = Arc::new(Recorder::new());
    let dispatcher = Dispatcher::new(script.refs.clone(), recorder.clone())
        .with_transport(manager.clone(), directory);
    let mut stack = StateStack::new(ExecutionState::new("main"));

    let failure = dispatcher
        .execute(&script.root, &mut stack)
        .await
        .unwrap_err();
    assert!(matches!(failure.error, ExecutorError::CommFailure(_)));

    // 只记录一次失败事件
    let events = recorder.cursor(&EventQuery::named(ACTION_EVENT)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events.iter().next().unwrap().text("agent"), Some("ghost"));
}

#[tokio::test]
async fn test_undecodable_request_gets_failed_response() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let shutdown = CancellationToken::new();
    let addr = spawn_agent("a1", shutdown.clone()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    let hello = WireMessage::Hello {
        client_id: "raw".to_string(),
    };
    ws.send(hello.to_message().unwrap()).await.unwrap();

    let correlation = "6f1c2a52-3c1e-4c55-9a57-6c9d8e0b1a22";
    let bad = format!(
        r#"{{"kind":"request","correlation_id":"{}","action":{{"type":"teleport"}},"state":{{}}}}"#,
        correlation
    );
    ws.send(Message::Text(bad)).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                return WireMessage::from_text(&text).unwrap();
            }
        }
    })
    .await
    .expect("agent should answer the undecodable request");

    match reply {
        WireMessage::Response {
            correlation_id,
            result,
        } => {
            assert_eq!(correlation_id.to_string(), correlation);
            assert_eq!(result.status, ActionStatus::Failed);
            assert_eq!(result.agent.as_deref(), Some("a1"));
            assert_eq!(result.error.unwrap().kind, "protocol");
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_fan_out_honours_timeout() {
    let shutdown = CancellationToken::new();
    let a1 = spawn_agent("a1", shutdown.clone()).await;
    let a2 = spawn_agent("a2", shutdown.clone()).await;
    let (manager, directory) = cluster(&[("a1", &a1, &[]), ("a2", &a2, &[])]).await;

    let script = parse(
        r#"
name: slow
actions:
  - type: remote
    target: all
    timeout_secs: 1
    actions:
      - { type: sleep, millis: 4000 }
"#,
    )
    .unwrap();

    let clock = std::time::Instant::now();
    let report = ScriptRunner::new()
        .with_transport(manager.clone(), directory)
        .run(&script)
        .await
        .unwrap();
    let elapsed = clock.elapsed();

    assert!(!report.passed);
    assert!(elapsed < Duration::from_secs(3), "fan-out waited {:?}", elapsed);

    let failed: Vec<_> = report
        .actions
        .iter()
        .filter(|a| a.status == ActionStatus::Failed)
        .filter_map(|a| a.agent.clone())
        .collect();
    assert_eq!(failed, vec!["a1".to_string(), "a2".to_string()]);

    shutdown.cancel();
    manager.shutdown().await;
}
