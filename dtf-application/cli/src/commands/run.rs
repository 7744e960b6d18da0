//! Run 命令处理

use anyhow::{Context, Result};
use colored::Colorize;
use dtf_executor::{MemoryArchive, ScriptRunner};
use dtf_script::Script;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use super::{common, output};
use crate::config::{self, DtfConfig};

/// run 命令参数
pub struct RunOptions {
    pub file: String,
    pub defines: Vec<String>,
    pub properties: Option<String>,
    pub db: Option<String>,
    pub no_db: bool,
    pub event_log: Option<String>,
    pub output: Option<String>,
}

/// 合并属性：配置文件 < 属性文件 < -D 参数
pub fn merge_properties(
    config: &DtfConfig,
    properties_file: Option<&str>,
    defines: &[String],
) -> Result<BTreeMap<String, String>> {
    let mut merged = config.properties.clone();

    if let Some(path) = properties_file {
        merged.extend(config::load_properties_file(&config::expand(path))?);
    }

    for raw in defines {
        let (key, value) = config::parse_define(raw)?;
        merged.insert(key, value);
    }

    Ok(merged)
}

/// 执行脚本，返回是否通过
pub async fn handle(config_path: Option<&str>, options: RunOptions) -> Result<bool> {
    let config = DtfConfig::load(config_path)?;

    let spinner = output::spinner(format!("加载脚本: {}", options.file));
    let script = match Script::from_file(config::expand(&options.file)) {
        Ok(script) => script,
        Err(e) => {
            spinner.finish_and_clear();
            return Err(e).with_context(|| format!("加载脚本失败: {}", options.file));
        }
    };
    spinner.finish_with_message(format!(
        "{} 脚本加载成功: {}",
        "✓".green().bold(),
        script.name.cyan()
    ));

    if let Some(desc) = &script.description {
        println!("描述: {}", desc.bright_black());
    }
    println!("节点数: {}", script.root.node_count().to_string().yellow());

    let overrides = merge_properties(&config, options.properties.as_deref(), &options.defines)?;

    let mut runner = ScriptRunner::new()
        .with_properties(overrides)
        .with_plugins(common::load_plugins(&config).await?)
        .with_archive(Arc::new(MemoryArchive::new()));

    let transport = common::build_transport(&config).await;
    if let Some((manager, directory)) = &transport {
        runner = runner.with_transport(manager.clone(), directory.clone());
    }

    if !options.no_db {
        let db_path = options.db.clone().unwrap_or_else(|| config.database_path());
        let storage = common::open_storage(&db_path).await?;
        runner = runner.with_storage(Arc::new(storage));
    }

    let event_log = options
        .event_log
        .clone()
        .or_else(|| config.recording.event_log.clone());
    if let Some(path) = event_log {
        runner = runner.with_event_log(config::expand(&path));
    }

    // Ctrl-C 时协作停止
    let stop = runner.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在停止执行...");
            stop.stop();
        }
    });

    println!("\n{}\n", "开始执行脚本...".bold());
    let spinner = output::spinner("执行中...");
    let result = runner.run(&script).await;
    spinner.finish_and_clear();

    if let Some((manager, _)) = &transport {
        manager.shutdown().await;
    }

    let report = result.context("执行脚本失败")?;
    output::print_report(&report);

    if let Some(path) = &options.output {
        output::export(&report, path)?;
        println!("\n{} 报告已导出到: {}", "✓".green(), path.yellow());
    }

    Ok(report.passed)
}
