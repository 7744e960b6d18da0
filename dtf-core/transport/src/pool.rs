//! 连接池与待决请求表
//!
//! 连接表和待决请求表由同一把锁保护，派发路径和完成回调都经过它。

use dtf_common::{ActionResult, RemoteLogRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    AgentConnection, AgentInfo, ConnectionEvent, ConnectionState, Result, TransportConfig,
    TransportError, WireMessage,
};

/// 异步派发的完成回调
///
/// 在连接池的事件处理任务上调用，可能与派发方并发执行。
pub trait DispatchCallback: Send + 'static {
    fn succeeded(self: Box<Self>, result: ActionResult);
    fn failed(self: Box<Self>, error: TransportError);
}

/// 待决请求
pub enum PendingRequest {
    /// 同步等待方
    Sync(oneshot::Sender<Result<ActionResult>>),
    /// 异步回调
    Async(Box<dyn DispatchCallback>),
}

impl PendingRequest {
    pub(crate) fn complete(self, outcome: Result<ActionResult>) {
        match (self, outcome) {
            (Self::Sync(tx), outcome) => {
                let _ = tx.send(outcome);
            }
            (Self::Async(callback), Ok(result)) => callback.succeeded(result),
            (Self::Async(callback), Err(e)) => callback.failed(e),
        }
    }
}

/// 单个 Agent 的槽位
struct AgentSlot {
    info: AgentInfo,
    state: ConnectionState,
    connection: Option<Arc<AgentConnection>>,
    pending: HashMap<Uuid, PendingRequest>,
    consecutive_failures: u32,
    unreachable: bool,
}

impl AgentSlot {
    fn new(info: AgentInfo) -> Self {
        Self {
            info,
            state: ConnectionState::Disconnected,
            connection: None,
            pending: HashMap::new(),
            consecutive_failures: 0,
            unreachable: false,
        }
    }

    /// 记录一次失败，达到阈值时拆除连接并返回被遗弃的请求
    fn note_failure(
        &mut self,
        max_failures: u32,
    ) -> Option<(Option<Arc<AgentConnection>>, Vec<PendingRequest>)> {
        self.consecutive_failures += 1;
        if self.unreachable || max_failures == 0 || self.consecutive_failures < max_failures {
            return None;
        }

        warn!(
            "Agent {} 连续失败 {} 次，标记为不可达",
            self.info.name, self.consecutive_failures
        );
        self.unreachable = true;
        self.state = ConnectionState::Disconnected;
        let pending = self.pending.drain().map(|(_, p)| p).collect();
        Some((self.connection.take(), pending))
    }
}

struct PoolInner {
    agents: HashMap<String, AgentSlot>,
    log_listeners: HashMap<String, mpsc::UnboundedSender<RemoteLogRecord>>,
}

/// 连接池
pub struct ConnectionPool {
    inner: Arc<Mutex<PoolInner>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    config: TransportConfig,
    client_id: String,
}

impl ConnectionPool {
    /// 创建连接池并启动事件处理任务
    pub fn new(config: TransportConfig, client_id: &str) -> Self {
        let inner = Arc::new(Mutex::new(PoolInner {
            agents: HashMap::new(),
            log_listeners: HashMap::new(),
        }));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        spawn_event_processor(
            Arc::clone(&inner),
            events_rx,
            config.max_consecutive_failures,
        );

        Self {
            inner,
            events_tx,
            config,
            client_id: client_id.to_string(),
        }
    }

    /// 添加 Agent (已存在时替换地址信息)
    pub async fn add_agent(&self, info: AgentInfo) {
        let name = info.name.clone();
        let mut inner = self.inner.lock().await;
        match inner.agents.get_mut(&name) {
            Some(slot) => {
                warn!("Agent {} 已存在，更新其信息", name);
                slot.info = info;
            }
            None => {
                info!("添加 Agent: {} ({})", name, info.address);
                inner.agents.insert(name, AgentSlot::new(info));
            }
        }
    }

    /// 移除 Agent，断开连接并使其待决请求失败
    pub async fn remove_agent(&self, name: &str) -> Result<()> {
        let slot = self
            .inner
            .lock()
            .await
            .agents
            .remove(name)
            .ok_or_else(|| TransportError::UnknownAgent(name.to_string()))?;

        info!("移除 Agent: {}", name);
        teardown(slot.connection, slot.pending.into_values().collect(), || {
            TransportError::Disconnected
        })
        .await;
        Ok(())
    }

    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<AgentInfo> = inner.agents.values().map(|s| s.info.clone()).collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub async fn agent_state(&self, name: &str) -> Option<ConnectionState> {
        self.inner.lock().await.agents.get(name).map(|s| s.state)
    }

    pub async fn is_unreachable(&self, name: &str) -> bool {
        self.inner
            .lock()
            .await
            .agents
            .get(name)
            .map(|s| s.unreachable)
            .unwrap_or(false)
    }

    pub async fn pending_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .await
            .agents
            .get(name)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    /// 获取连接，首次派发时建立
    pub async fn connection(&self, name: &str) -> Result<Arc<AgentConnection>> {
        let info = {
            let mut inner = self.inner.lock().await;
            let slot = inner
                .agents
                .get_mut(name)
                .ok_or_else(|| TransportError::UnknownAgent(name.to_string()))?;

            if slot.unreachable {
                return Err(TransportError::AgentUnreachable(name.to_string()));
            }
            if let Some(conn) = &slot.connection {
                if conn.is_ready().await {
                    return Ok(Arc::clone(conn));
                }
            }
            slot.state = ConnectionState::Connecting;
            slot.info.clone()
        };

        let connected = AgentConnection::connect(
            info,
            &self.client_id,
            self.config.connect_timeout(),
            self.events_tx.clone(),
        )
        .await;

        match connected {
            Ok(conn) => {
                let conn = Arc::new(conn);
                let mut inner = self.inner.lock().await;
                let Some(slot) = inner.agents.get_mut(name) else {
                    conn.close().await;
                    return Err(TransportError::UnknownAgent(name.to_string()));
                };
                if let Some(existing) = &slot.connection {
                    if existing.is_ready().await {
                        // 并发建立的连接，保留先到者
                        conn.close().await;
                        return Ok(Arc::clone(existing));
                    }
                }
                slot.connection = Some(Arc::clone(&conn));
                slot.state = ConnectionState::Ready;
                Ok(conn)
            }
            Err(e) => {
                error!("连接 Agent {} 失败: {}", name, e);
                self.record_failure(name).await;
                Err(e)
            }
        }
    }

    /// 登记待决请求并写出消息
    ///
    /// 返回 `Ok` 后请求必然以响应、连接中断或取消之一结束；返回 `Err` 时
    /// 请求未被登记，异步回调不会被调用。
    pub async fn submit(
        &self,
        name: &str,
        correlation_id: Uuid,
        message: &WireMessage,
        request: PendingRequest,
    ) -> Result<()> {
        let connection = self.connection(name).await?;

        let mut inner = self.inner.lock().await;
        let slot = inner
            .agents
            .get_mut(name)
            .ok_or_else(|| TransportError::UnknownAgent(name.to_string()))?;

        match &slot.connection {
            Some(current) if current.id() == connection.id() => {}
            _ => return Err(TransportError::comm(name, "连接在派发前中断")),
        }
        if slot.pending.contains_key(&correlation_id) {
            return Err(TransportError::Protocol(format!(
                "关联 ID {} 已存在待决请求",
                correlation_id
            )));
        }

        slot.pending.insert(correlation_id, request);
        if let Err(e) = connection.send(message) {
            slot.pending.remove(&correlation_id);
            return Err(e);
        }

        debug!("已派发请求: agent={}, correlation_id={}", name, correlation_id);
        Ok(())
    }

    /// 取消待决请求 (例如同步等待超时)
    pub async fn cancel(&self, name: &str, correlation_id: &Uuid) -> Option<PendingRequest> {
        self.inner
            .lock()
            .await
            .agents
            .get_mut(name)
            .and_then(|slot| slot.pending.remove(correlation_id))
    }

    /// 发送不需要响应的控制消息
    pub async fn send_control(&self, name: &str, message: &WireMessage) -> Result<()> {
        let connection = self.connection(name).await?;
        connection.send(message)
    }

    /// 记录一次传输失败
    pub async fn record_failure(&self, name: &str) {
        let torn_down = {
            let mut inner = self.inner.lock().await;
            match inner.agents.get_mut(name) {
                Some(slot) => {
                    slot.state = ConnectionState::Disconnected;
                    slot.note_failure(self.config.max_consecutive_failures)
                }
                None => None,
            }
        };

        if let Some((connection, pending)) = torn_down {
            let agent = name.to_string();
            teardown(connection, pending, || {
                TransportError::AgentUnreachable(agent.clone())
            })
            .await;
        }
    }

    /// 清除不可达标记和失败计数
    pub async fn reset_agent(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let slot = inner
            .agents
            .get_mut(name)
            .ok_or_else(|| TransportError::UnknownAgent(name.to_string()))?;
        slot.unreachable = false;
        slot.consecutive_failures = 0;
        info!("重置 Agent 状态: {}", name);
        Ok(())
    }

    pub async fn add_log_listener(
        &self,
        thread_id: &str,
        listener: mpsc::UnboundedSender<RemoteLogRecord>,
    ) {
        self.inner
            .lock()
            .await
            .log_listeners
            .insert(thread_id.to_string(), listener);
    }

    pub async fn remove_log_listener(&self, thread_id: &str) {
        self.inner.lock().await.log_listeners.remove(thread_id);
    }

    /// 断开所有连接
    pub async fn shutdown(&self) {
        let slots: Vec<(Option<Arc<AgentConnection>>, Vec<PendingRequest>)> = {
            let mut inner = self.inner.lock().await;
            inner.log_listeners.clear();
            inner
                .agents
                .values_mut()
                .map(|slot| {
                    slot.state = ConnectionState::Disconnected;
                    (
                        slot.connection.take(),
                        slot.pending.drain().map(|(_, p)| p).collect(),
                    )
                })
                .collect()
        };

        for (connection, pending) in slots {
            teardown(connection, pending, || TransportError::Disconnected).await;
        }
        info!("连接池已关闭");
    }
}

/// 关闭连接并让遗留请求失败 (在锁外调用)
async fn teardown(
    connection: Option<Arc<AgentConnection>>,
    pending: Vec<PendingRequest>,
    error: impl Fn() -> TransportError,
) {
    if let Some(conn) = connection {
        conn.close().await;
    }
    for request in pending {
        request.complete(Err(error()));
    }
}

/// 事件处理任务：完成待决请求、路由远程日志、处理连接中断
fn spawn_event_processor(
    inner: Arc<Mutex<PoolInner>>,
    mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    max_failures: u32,
) {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ConnectionEvent::Response {
                    agent,
                    correlation_id,
                    result,
                } => {
                    let pending = {
                        let mut guard = inner.lock().await;
                        guard.agents.get_mut(&agent).and_then(|slot| {
                            slot.consecutive_failures = 0;
                            slot.pending.remove(&correlation_id)
                        })
                    };
                    match pending {
                        Some(request) => request.complete(Ok(result)),
                        None => warn!(
                            "收到未知请求的响应: agent={}, correlation_id={}",
                            agent, correlation_id
                        ),
                    }
                }

                ConnectionEvent::Log(record) => {
                    emit_remote_log(&record);
                    let listener = inner
                        .lock()
                        .await
                        .log_listeners
                        .get(&record.thread_id)
                        .cloned();
                    if let Some(tx) = listener {
                        let _ = tx.send(record);
                    }
                }

                ConnectionEvent::Closed {
                    agent,
                    connection_id,
                    reason,
                } => {
                    let orphaned = {
                        let mut guard = inner.lock().await;
                        match guard.agents.get_mut(&agent) {
                            Some(slot)
                                if slot.connection.as_ref().map(|c| c.id())
                                    == Some(connection_id) =>
                            {
                                slot.connection = None;
                                slot.state = ConnectionState::Disconnected;
                                let pending: Vec<PendingRequest> =
                                    slot.pending.drain().map(|(_, p)| p).collect();
                                if !pending.is_empty() {
                                    let _ = slot.note_failure(max_failures);
                                }
                                pending
                            }
                            _ => Vec::new(),
                        }
                    };

                    if !orphaned.is_empty() {
                        warn!(
                            "Agent {} 连接中断 ({})，{} 个请求失败",
                            agent,
                            reason,
                            orphaned.len()
                        );
                    } else {
                        debug!("Agent {} 连接关闭: {}", agent, reason);
                    }
                    for request in orphaned {
                        request.complete(Err(TransportError::comm(
                            &agent,
                            format!("连接中断: {}", reason),
                        )));
                    }
                }
            }
        }
        debug!("连接池事件处理任务已停止");
    });
}

/// 在本地重新输出远程日志
fn emit_remote_log(record: &RemoteLogRecord) {
    match record.level.as_str() {
        "error" => error!(agent = %record.agent, thread = %record.thread_id, "[远程] {}", record.message),
        "warn" => warn!(agent = %record.agent, thread = %record.thread_id, "[远程] {}", record.message),
        "debug" => debug!(agent = %record.agent, thread = %record.thread_id, "[远程] {}", record.message),
        _ => info!(agent = %record.agent, thread = %record.thread_id, "[远程] {}", record.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> TransportConfig {
        TransportConfig {
            connect_timeout: 1,
            max_consecutive_failures: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let pool = ConnectionPool::new(config(), "test");
        pool.add_agent(AgentInfo::new("b", "127.0.0.1:1")).await;
        pool.add_agent(AgentInfo::new("a", "127.0.0.1:2")).await;

        let names: Vec<String> = pool.list_agents().await.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(pool.agent_state("a").await, Some(ConnectionState::Disconnected));

        pool.remove_agent("a").await.unwrap();
        assert!(matches!(
            pool.remove_agent("a").await,
            Err(TransportError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let pool = ConnectionPool::new(config(), "test");
        assert!(matches!(
            pool.connection("ghost").await,
            Err(TransportError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_consecutive_failures_mark_unreachable() {
        let pool = ConnectionPool::new(config(), "test");
        // 绑定后立即释放端口，保证连接被拒绝
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        pool.add_agent(AgentInfo::new("dead", &addr.to_string())).await;

        match pool.connection("dead").await {
            Err(first) => assert!(first.is_retryable()),
            Ok(conn) => panic!("connected to a closed port: {:?}", conn),
        }
        assert!(pool.connection("dead").await.is_err());
        assert!(pool.is_unreachable("dead").await);

        assert!(matches!(
            pool.connection("dead").await,
            Err(TransportError::AgentUnreachable(_))
        ));

        pool.reset_agent("dead").await.unwrap();
        assert!(!pool.is_unreachable("dead").await);
    }

    struct Counting(Arc<AtomicUsize>);

    impl DispatchCallback for Counting {
        fn succeeded(self: Box<Self>, _result: ActionResult) {}
        fn failed(self: Box<Self>, _error: TransportError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_teardown_fails_pending() {
        let failures = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        teardown(
            None,
            vec![
                PendingRequest::Async(Box::new(Counting(Arc::clone(&failures)))),
                PendingRequest::Sync(tx),
            ],
            || TransportError::Disconnected,
        )
        .await;

        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(matches!(rx.await.unwrap(), Err(TransportError::Disconnected)));
    }
}
