//! 调度端连接管理

use chrono::{DateTime, Utc};
use dtf_common::RemoteLogRecord;
use dtf_executor::LogForwarder;
use dtf_transport::WireMessage;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::{AgentError, Result};

/// 调度端连接信息
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: String,
    pub connected_at: DateTime<Utc>,
    pub remote_addr: Option<String>,
}

/// 调度端会话
struct ClientSession {
    info: ClientInfo,

    /// 发往调度端的消息通道
    outbound: mpsc::UnboundedSender<WireMessage>,

    /// 已登记的调度端线程
    threads: Arc<Mutex<HashSet<String>>>,
}

/// 把 log 动作的输出推回登记了对应线程的会话
#[derive(Clone)]
pub struct SessionForwarder {
    outbound: mpsc::UnboundedSender<WireMessage>,
    threads: Arc<Mutex<HashSet<String>>>,
}

impl LogForwarder for SessionForwarder {
    fn forward(&self, record: RemoteLogRecord) {
        let registered = self
            .threads
            .lock()
            .map(|threads| threads.contains(&record.thread_id))
            .unwrap_or(false);
        if !registered {
            return;
        }
        if self.outbound.send(WireMessage::Log { record }).is_err() {
            debug!("会话已关闭，丢弃远程日志");
        }
    }
}

/// 客户端管理器
pub struct ClientManager {
    /// client_id -> 会话
    clients: Arc<RwLock<HashMap<String, ClientSession>>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 注册调度端连接，返回发往该连接的消息接收端
    pub async fn register_client(&self, info: ClientInfo) -> mpsc::UnboundedReceiver<WireMessage> {
        let client_id = info.client_id.clone();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let session = ClientSession {
            info,
            outbound,
            threads: Arc::new(Mutex::new(HashSet::new())),
        };

        let mut clients = self.clients.write().await;
        if clients.contains_key(&client_id) {
            warn!("客户端 {} 已存在，将被替换", client_id);
        }

        clients.insert(client_id.clone(), session);
        info!("注册客户端: {}", client_id);

        outbound_rx
    }

    /// 注销调度端连接 (其登记的线程一并清除)
    pub async fn unregister_client(&self, client_id: &str) {
        let mut clients = self.clients.write().await;
        if clients.remove(client_id).is_some() {
            info!("注销客户端: {}", client_id);
        }
    }

    /// 发送消息到指定调度端
    pub async fn send(&self, client_id: &str, message: WireMessage) -> Result<()> {
        let clients = self.clients.read().await;
        let session = clients
            .get(client_id)
            .ok_or_else(|| AgentError::ClientNotConnected(client_id.to_string()))?;

        session
            .outbound
            .send(message)
            .map_err(|_| AgentError::ClientNotConnected(client_id.to_string()))
    }

    /// 登记调度端线程
    pub async fn register_thread(&self, client_id: &str, thread_id: &str) -> Result<()> {
        let clients = self.clients.read().await;
        let session = clients
            .get(client_id)
            .ok_or_else(|| AgentError::ClientNotConnected(client_id.to_string()))?;

        if let Ok(mut threads) = session.threads.lock() {
            threads.insert(thread_id.to_string());
        }
        debug!("客户端 {} 登记线程: {}", client_id, thread_id);
        Ok(())
    }

    /// 注销调度端线程
    pub async fn unregister_thread(&self, client_id: &str, thread_id: &str) {
        let clients = self.clients.read().await;
        if let Some(session) = clients.get(client_id) {
            if let Ok(mut threads) = session.threads.lock() {
                threads.remove(thread_id);
            }
            debug!("客户端 {} 注销线程: {}", client_id, thread_id);
        }
    }

    /// 会话的日志转发器
    pub async fn forwarder(&self, client_id: &str) -> Result<SessionForwarder> {
        let clients = self.clients.read().await;
        let session = clients
            .get(client_id)
            .ok_or_else(|| AgentError::ClientNotConnected(client_id.to_string()))?;

        Ok(SessionForwarder {
            outbound: session.outbound.clone(),
            threads: session.threads.clone(),
        })
    }

    /// 获取客户端列表
    pub async fn get_clients(&self) -> Vec<ClientInfo> {
        let clients = self.clients.read().await;
        clients
            .values()
            .map(|session| session.info.clone())
            .collect()
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        let clients = self.clients.read().await;
        clients.contains_key(client_id)
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}
