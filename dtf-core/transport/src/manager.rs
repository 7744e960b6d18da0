//! 通信管理器

use dtf_common::{ActionResult, RemoteLogRecord, StateSnapshot};
use dtf_script::Action;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    AgentInfo, ConnectionPool, DispatchCallback, PendingRequest, Result, TransportConfig,
    TransportError, WireMessage,
};

/// 通信管理器
///
/// 调度器持有的显式实例，负责向 Agent 派发动作子树。
pub struct TransportManager {
    /// 连接池
    pool: Arc<ConnectionPool>,

    /// 配置
    config: TransportConfig,
}

impl TransportManager {
    /// 创建新的通信管理器
    pub fn new(config: TransportConfig) -> Self {
        let client_id = format!("dtf-{}", Uuid::new_v4());
        let pool = Arc::new(ConnectionPool::new(config.clone(), &client_id));
        Self { pool, config }
    }

    /// 添加 Agent
    pub async fn add_agent(&self, info: AgentInfo) {
        self.pool.add_agent(info).await
    }

    /// 移除 Agent
    pub async fn remove_agent(&self, name: &str) -> Result<()> {
        self.pool.remove_agent(name).await
    }

    /// 列出所有 Agent
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        self.pool.list_agents().await
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// 同步派发：等待关联响应或超时
    pub async fn send_action(
        &self,
        target: &str,
        action: &Action,
        state: StateSnapshot,
        timeout: Option<Duration>,
    ) -> Result<ActionResult> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let message = WireMessage::Request {
            correlation_id,
            action: action.clone(),
            state,
        };

        debug!(
            "同步派发 {} 到 Agent {}: correlation_id={}",
            action.label(),
            target,
            correlation_id
        );
        self.pool
            .submit(target, correlation_id, &message, PendingRequest::Sync(tx))
            .await?;

        let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::comm(target, "响应通道意外关闭")),
            Err(_) => {
                warn!(
                    "等待 Agent {} 响应超时: correlation_id={}",
                    target, correlation_id
                );
                self.pool.cancel(target, &correlation_id).await;
                self.pool.record_failure(target).await;
                Err(TransportError::Timeout(target.to_string()))
            }
        }
    }

    /// 异步派发：立即返回关联 ID，结果通过回调交付
    pub async fn send_action_async(
        &self,
        target: &str,
        action: &Action,
        state: StateSnapshot,
        callback: Box<dyn DispatchCallback>,
    ) -> Result<Uuid> {
        let correlation_id = Uuid::new_v4();
        let message = WireMessage::Request {
            correlation_id,
            action: action.clone(),
            state,
        };

        debug!(
            "异步派发 {} 到 Agent {}: correlation_id={}",
            action.label(),
            target,
            correlation_id
        );
        self.pool
            .submit(
                target,
                correlation_id,
                &message,
                PendingRequest::Async(callback),
            )
            .await?;
        Ok(correlation_id)
    }

    /// 在 Agent 上登记调度端线程，接收其推送的远程日志
    pub async fn register(
        &self,
        target: &str,
        thread_id: &str,
        listener: Option<mpsc::UnboundedSender<RemoteLogRecord>>,
    ) -> Result<()> {
        if let Some(listener) = listener {
            self.pool.add_log_listener(thread_id, listener).await;
        }
        self.pool
            .send_control(
                target,
                &WireMessage::Register {
                    thread_id: thread_id.to_string(),
                },
            )
            .await
    }

    /// 注销调度端线程
    pub async fn unregister(&self, target: &str, thread_id: &str) -> Result<()> {
        self.pool.remove_log_listener(thread_id).await;
        self.pool
            .send_control(
                target,
                &WireMessage::Unregister {
                    thread_id: thread_id.to_string(),
                },
            )
            .await
    }

    /// 放弃仍在等待响应的请求，等待方收到超时错误
    ///
    /// 响应已经先到达时返回 false。
    pub async fn expire(&self, target: &str, correlation_id: &Uuid) -> bool {
        let Some(pending) = self.pool.cancel(target, correlation_id).await else {
            return false;
        };
        warn!(
            "等待 Agent {} 响应超时: correlation_id={}",
            target, correlation_id
        );
        pending.complete(Err(TransportError::Timeout(target.to_string())));
        self.pool.record_failure(target).await;
        true
    }

    /// 清除 Agent 的不可达标记
    pub async fn reset_agent(&self, name: &str) -> Result<()> {
        self.pool.reset_agent(name).await
    }

    pub async fn is_unreachable(&self, name: &str) -> bool {
        self.pool.is_unreachable(name).await
    }

    /// 断开全部连接
    pub async fn shutdown(&self) {
        info!("关闭通信管理器");
        self.pool.shutdown().await;
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtf_script::ActionKind;

    #[tokio::test]
    async fn test_transport_manager_creation() {
        let manager = TransportManager::default();
        assert!(manager.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent() {
        let manager = TransportManager::default();
        let action = Action::new(ActionKind::Ref).with_refid("x");
        let err = manager
            .send_action("ghost", &action, StateSnapshot::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownAgent(_)));
    }
}
