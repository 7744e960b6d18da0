//! 公共工具函数模块
//!
//! 各命令共享的初始化：记录数据库、插件注册表、通信层。

use anyhow::{Context, Result};
use dtf_executor::PluginRegistry;
use dtf_storage::{Storage, StorageManager};
use dtf_transport::{AgentDirectory, StaticMembership, TransportManager};
use std::sync::Arc;
use tracing::info;

use crate::config::DtfConfig;

/// 打开记录数据库
pub async fn open_storage(db_path: &str) -> Result<Storage> {
    let manager = StorageManager::new(db_path)
        .await
        .with_context(|| format!("初始化数据库失败: {}", db_path))?;
    Ok(Storage::from_manager(&manager))
}

/// 加载插件目录下的清单
pub async fn load_plugins(config: &DtfConfig) -> Result<Arc<PluginRegistry>> {
    let registry = Arc::new(PluginRegistry::new());
    if let Some(dir) = config.plugin_dir() {
        let count = registry
            .load_dir(&dir)
            .await
            .with_context(|| format!("加载插件目录失败: {:?}", dir))?;
        info!("从 {:?} 加载了 {} 个插件", dir, count);
    }
    Ok(registry)
}

/// 按配置的 Agent 列表建立通信管理器和节点目录
///
/// 没有配置 Agent 时返回 None。
pub async fn build_transport(
    config: &DtfConfig,
) -> Option<(Arc<TransportManager>, Arc<AgentDirectory>)> {
    if config.agents.is_empty() {
        return None;
    }

    let manager = Arc::new(TransportManager::new(config.transport.clone()));
    for agent in &config.agents {
        manager.add_agent(agent.clone()).await;
    }
    let membership = Arc::new(StaticMembership::from_agents(&config.agents));
    let directory = Arc::new(AgentDirectory::new(membership).with_pool(manager.pool().clone()));

    info!("已配置 {} 个 Agent", config.agents.len());
    Some((manager, directory))
}
