//! 通信层测试 (使用本地回环的模拟 Agent)

use dtf_common::{ActionResult, RemoteLogRecord, StateSnapshot};
use dtf_script::{Action, ActionKind, Template};
use dtf_transport::*;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

/// 模拟 Agent：对 name 为 "drop" 的请求直接断开连接，对 "silent" 不回复，
/// 其余请求回复成功；收到 register 后推送一条日志。
async fn spawn_fake_agent() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut tx, mut rx) = ws.split();

                while let Some(Ok(Message::Text(text))) = rx.next().await {
                    match WireMessage::from_text(&text).unwrap() {
                        WireMessage::Request {
                            correlation_id,
                            action,
                            ..
                        } => match action.name.as_deref() {
                            Some("drop") => return,
                            Some("silent") => {}
                            _ => {
                                let result =
                                    ActionResult::success(&action.label(), chrono::Utc::now(), 1)
                                        .with_agent("fake");
                                let reply = WireMessage::Response {
                                    correlation_id,
                                    result,
                                };
                                tx.send(reply.to_message().unwrap()).await.unwrap();
                            }
                        },
                        WireMessage::Register { thread_id } => {
                            let log = WireMessage::Log {
                                record: RemoteLogRecord {
                                    thread_id,
                                    agent: "fake".to_string(),
                                    level: "info".to_string(),
                                    message: "hello from agent".to_string(),
                                    timestamp: chrono::Utc::now(),
                                },
                            };
                            tx.send(log.to_message().unwrap()).await.unwrap();
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    addr
}

fn log_action(name: &str) -> Action {
    Action::new(ActionKind::Log {
        message: Template::new("x"),
        level: None,
    })
    .named(name)
}

async fn manager_with_agent() -> TransportManager {
    let addr = spawn_fake_agent().await;
    let manager = TransportManager::new(TransportConfig {
        connect_timeout: 2,
        request_timeout: 5,
        ..Default::default()
    });
    manager.add_agent(AgentInfo::new("fake", &addr)).await;
    manager
}

#[tokio::test]
async fn test_sync_send_returns_correlated_result() {
    let manager = manager_with_agent().await;

    let result = manager
        .send_action("fake", &log_action("ping"), StateSnapshot::default(), None)
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.action, "ping");
    assert_eq!(result.agent.as_deref(), Some("fake"));
    assert_eq!(
        manager.pool().agent_state("fake").await,
        Some(ConnectionState::Ready)
    );
    assert_eq!(manager.pool().pending_count("fake").await, 0);
}

struct ToChannel(Option<oneshot::Sender<std::result::Result<ActionResult, String>>>);

impl DispatchCallback for ToChannel {
    fn succeeded(mut self: Box<Self>, result: ActionResult) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Ok(result));
        }
    }

    fn failed(mut self: Box<Self>, error: TransportError) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Err(error.to_string()));
        }
    }
}

#[tokio::test]
async fn test_async_send_invokes_callback() {
    let manager = manager_with_agent().await;
    let (tx, rx) = oneshot::channel();

    manager
        .send_action_async(
            "fake",
            &log_action("async"),
            StateSnapshot::default(),
            Box::new(ToChannel(Some(tx))),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.unwrap().action, "async");
}

#[tokio::test]
async fn test_connection_loss_fails_pending_with_comm_failure() {
    let manager = manager_with_agent().await;
    let (tx, rx) = oneshot::channel();

    manager
        .send_action_async(
            "fake",
            &log_action("drop"),
            StateSnapshot::default(),
            Box::new(ToChannel(Some(tx))),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    let message = outcome.unwrap_err();
    assert!(message.contains("通信失败"), "{}", message);

    // 下一次派发重新建立连接
    let result = manager
        .send_action("fake", &log_action("again"), StateSnapshot::default(), None)
        .await
        .unwrap();
    assert!(result.is_success());
}

#[tokio::test]
async fn test_sync_timeout() {
    let manager = manager_with_agent().await;

    let err = manager
        .send_action(
            "fake",
            &log_action("silent"),
            StateSnapshot::default(),
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Timeout(_)));
    assert!(err.is_retryable());
    assert_eq!(manager.pool().pending_count("fake").await, 0);
}

#[tokio::test]
async fn test_register_routes_remote_logs() {
    let manager = Arc::new(manager_with_agent().await);
    let (tx, mut rx) = mpsc::unbounded_channel();

    manager.register("fake", "main", Some(tx)).await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.thread_id, "main");
    assert_eq!(record.message, "hello from agent");

    manager.unregister("fake", "main").await.unwrap();
    manager.shutdown().await;
}
