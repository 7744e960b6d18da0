//! Agent 连接管理

use dtf_common::{ActionResult, RemoteLogRecord};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{AgentInfo, Result, TransportError, WireMessage};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 可用
    Ready,
}

/// 连接读任务上报的事件
#[derive(Debug)]
pub enum ConnectionEvent {
    /// 收到关联响应
    Response {
        agent: String,
        correlation_id: Uuid,
        result: ActionResult,
    },

    /// 收到远程日志
    Log(RemoteLogRecord),

    /// 连接关闭
    Closed {
        agent: String,
        connection_id: Uuid,
        reason: String,
    },
}

/// 到单个 Agent 的长连接
pub struct AgentConnection {
    /// 连接实例 ID (区分同一 Agent 的先后连接)
    id: Uuid,

    /// Agent 信息
    info: AgentInfo,

    /// 连接状态
    state: Arc<Mutex<ConnectionState>>,

    /// 写通道
    outbound: mpsc::UnboundedSender<Message>,

    /// 建立时间
    connected_at: chrono::DateTime<chrono::Utc>,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("id", &self.id)
            .field("agent", &self.info.name)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl AgentConnection {
    /// 建立连接并发送 Hello
    ///
    /// 读任务把响应、日志和关闭通知转发到 `events`。
    pub async fn connect(
        info: AgentInfo,
        client_id: &str,
        timeout: Duration,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self> {
        let url = info.url();
        info!("连接到 Agent: {} ({})", info.name, url);

        let ws_stream = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(TransportError::comm(&info.name, e.to_string())),
            Err(_) => {
                return Err(TransportError::comm(
                    &info.name,
                    format!("连接超时 ({:?})", timeout),
                ))
            }
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        let id = Uuid::new_v4();

        // 写任务
        let agent = info.name.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("向 Agent {} 写入失败: {}", agent, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // 读任务
        let agent = info.name.clone();
        let reader_state = Arc::clone(&state);
        tokio::spawn(async move {
            let reason = loop {
                match ws_receiver.next().await {
                    Some(Ok(Message::Text(text))) => match WireMessage::from_text(&text) {
                        Ok(WireMessage::Response {
                            correlation_id,
                            result,
                        }) => {
                            let _ = events.send(ConnectionEvent::Response {
                                agent: agent.clone(),
                                correlation_id,
                                result,
                            });
                        }
                        Ok(WireMessage::Log { record }) => {
                            let _ = events.send(ConnectionEvent::Log(record));
                        }
                        Ok(other) => {
                            warn!("Agent {} 发送了意外消息: {}", agent, other.kind());
                        }
                        Err(e) => {
                            warn!("解析 Agent {} 消息失败: {}", agent, e);
                        }
                    },
                    Some(Ok(Message::Close(_))) => break "对端关闭连接".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("接收 Agent {} 消息错误: {}", agent, e);
                        break e.to_string();
                    }
                    None => break "连接流结束".to_string(),
                }
            };

            *reader_state.lock().await = ConnectionState::Disconnected;
            let _ = events.send(ConnectionEvent::Closed {
                agent,
                connection_id: id,
                reason,
            });
        });

        let connection = Self {
            id,
            info,
            state,
            outbound,
            connected_at: chrono::Utc::now(),
        };

        connection.send(&WireMessage::Hello {
            client_id: client_id.to_string(),
        })?;
        {
            let mut state = connection.state.lock().await;
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Ready;
            }
        }

        info!("已连接 Agent: {}", connection.info.name);
        Ok(connection)
    }

    /// 写入一条消息
    pub fn send(&self, msg: &WireMessage) -> Result<()> {
        let frame = msg.to_message()?;
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::comm(&self.info.name, "写通道已关闭"))
    }

    /// 关闭连接
    pub async fn close(&self) {
        info!("断开 Agent 连接: {}", self.info.name);
        let _ = self.outbound.send(Message::Close(None));
        *self.state.lock().await = ConnectionState::Disconnected;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == ConnectionState::Ready
    }

    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }
}
