//! Agent 命令处理

use anyhow::{Context, Result};
use colored::Colorize;
use dtf_agent::{AgentConfig, AgentServer, AgentService};
use dtf_executor::MemoryArchive;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::common;
use crate::config::DtfConfig;

/// 命令行参数覆盖配置文件中的 `[agent]` 段
pub fn resolve_config(
    config: &DtfConfig,
    name: Option<String>,
    listen: Option<String>,
    roles: Vec<String>,
) -> AgentConfig {
    let mut agent = config.agent.clone();
    if let Some(name) = name {
        agent.name = name;
    }
    if let Some(listen) = listen {
        agent.listen = listen;
    }
    if !roles.is_empty() {
        agent.roles = roles;
    }
    agent
}

pub async fn handle(
    config_path: Option<&str>,
    name: Option<String>,
    listen: Option<String>,
    roles: Vec<String>,
) -> Result<()> {
    let config = DtfConfig::load(config_path)?;
    let agent_config = resolve_config(&config, name, listen, roles);

    let service = AgentService::new(&agent_config.name)
        .with_plugins(common::load_plugins(&config).await?)
        .with_archive(Arc::new(MemoryArchive::new()));

    println!(
        "{} 启动 Agent {} 监听 {}",
        "▶".green(),
        agent_config.name.cyan().bold(),
        agent_config.listen.yellow()
    );
    if !agent_config.roles.is_empty() {
        println!("角色: {}", agent_config.roles.join(", ").bright_black());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到中断信号，Agent 即将退出");
            signal.cancel();
        }
    });

    let server = AgentServer::new(agent_config, Arc::new(service));
    server
        .start(shutdown)
        .await
        .context("Agent 运行失败")?;

    println!("{} Agent 已停止", "✓".green());
    Ok(())
}
