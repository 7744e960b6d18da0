//! WebSocket 服务器

use dtf_executor::LogForwarder;
use dtf_transport::WireMessage;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientInfo, ClientManager};
use crate::service::AgentService;
use crate::{AgentError, Result};

/// Agent 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent 名称
    #[serde(default = "default_name")]
    pub name: String,

    /// 监听地址
    #[serde(default = "default_listen")]
    pub listen: String,

    /// 角色
    #[serde(default)]
    pub roles: Vec<String>,
}

fn default_name() -> String {
    "agent".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:7700".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            listen: default_listen(),
            roles: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| AgentError::Config(format!("无效的监听地址 {}: {}", self.listen, e)))
    }
}

/// Agent 服务器
pub struct AgentServer {
    config: AgentConfig,
    client_manager: Arc<ClientManager>,
    service: Arc<AgentService>,
}

impl AgentServer {
    pub fn new(config: AgentConfig, service: Arc<AgentService>) -> Self {
        Self {
            config,
            client_manager: Arc::new(ClientManager::new()),
            service,
        }
    }

    pub fn client_manager(&self) -> &Arc<ClientManager> {
        &self.client_manager
    }

    /// 绑定配置的地址并运行，直到 `shutdown` 被取消
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// 在已绑定的监听器上运行
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Agent {} 启动: {}",
            self.config.name,
            listener.local_addr()?
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("接受连接失败: {}", e);
                            continue;
                        }
                    };
                    let client_manager = self.client_manager.clone();
                    let service = self.service.clone();
                    let shutdown = shutdown.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, peer_addr, client_manager, service, shutdown).await {
                            error!("客户端处理错误 ({}): {}", peer_addr, e);
                        }
                    });
                }

                _ = shutdown.cancelled() => {
                    info!("Agent {} 停止", self.config.name);
                    self.service.stop();
                    break;
                }
            }
        }

        Ok(())
    }
}

/// 处理调度端连接
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    client_manager: Arc<ClientManager>,
    service: Arc<AgentService>,
    shutdown: CancellationToken,
) -> Result<()> {
    debug!("调度端连接: {}", peer_addr);

    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| AgentError::Handshake(e.to_string()))?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // 第一帧必须是 Hello
    let client_id = match ws_receiver.next().await {
        Some(Ok(Message::Text(text))) => match WireMessage::from_text(&text)? {
            WireMessage::Hello { client_id } => client_id,
            other => {
                return Err(AgentError::Handshake(format!(
                    "首帧应为 hello，收到 {}",
                    other.kind()
                )))
            }
        },
        _ => {
            warn!("调度端未发送 hello: {}", peer_addr);
            return Ok(());
        }
    };

    let info = ClientInfo {
        client_id: client_id.clone(),
        connected_at: chrono::Utc::now(),
        remote_addr: Some(peer_addr.to_string()),
    };
    let mut outbound_rx = client_manager.register_client(info).await;
    let forwarder: Arc<dyn LogForwarder> = Arc::new(client_manager.forwarder(&client_id).await?);

    info!("调度端已连接: {} ({})", client_id, peer_addr);

    loop {
        tokio::select! {
            // 发往调度端的响应和日志
            Some(message) = outbound_rx.recv() => {
                let frame = message.to_message()?;
                if let Err(e) = ws_sender.send(frame).await {
                    error!("发送消息到调度端失败: {}", e);
                    break;
                }
            }

            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let message = match WireMessage::from_text(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("解析调度端消息失败: {}", e);
                                if let Some(correlation_id) = WireMessage::request_correlation_id(&text) {
                                    let reply = WireMessage::Response {
                                        correlation_id,
                                        result: service.reject(&e.to_string()),
                                    };
                                    if let Err(e) = client_manager.send(&client_id, reply).await {
                                        warn!("回复 correlation_id={} 失败: {}", correlation_id, e);
                                    }
                                }
                                continue;
                            }
                        };
                        handle_message(message, &client_id, &client_manager, &service, &forwarder).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("调度端关闭连接: {}", client_id);
                        break;
                    }
                    Some(Ok(_)) => {
                        // 忽略心跳和二进制帧
                    }
                    Some(Err(e)) => {
                        error!("接收消息错误: {}", e);
                        break;
                    }
                }
            }

            _ = shutdown.cancelled() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    client_manager.unregister_client(&client_id).await;
    info!("调度端断开: {}", client_id);

    Ok(())
}

async fn handle_message(
    message: WireMessage,
    client_id: &str,
    client_manager: &Arc<ClientManager>,
    service: &Arc<AgentService>,
    forwarder: &Arc<dyn LogForwarder>,
) {
    match message {
        WireMessage::Request {
            correlation_id,
            action,
            state,
        } => {
            debug!("收到执行请求: correlation_id={}", correlation_id);
            let client_manager = client_manager.clone();
            let service = service.clone();
            let forwarder = forwarder.clone();
            let client_id = client_id.to_string();

            // 请求并发执行，响应按完成顺序返回
            tokio::spawn(async move {
                let result = service.execute(&action, state, Some(forwarder)).await;
                let reply = WireMessage::Response {
                    correlation_id,
                    result,
                };
                if let Err(e) = client_manager.send(&client_id, reply).await {
                    warn!("回复 correlation_id={} 失败: {}", correlation_id, e);
                }
            });
        }

        WireMessage::Register { thread_id } => {
            if let Err(e) = client_manager.register_thread(client_id, &thread_id).await {
                warn!("登记线程 {} 失败: {}", thread_id, e);
            }
        }

        WireMessage::Unregister { thread_id } => {
            client_manager.unregister_thread(client_id, &thread_id).await;
        }

        other => {
            warn!("调度端发送了意外消息: {}", other.kind());
        }
    }
}
