//! CLI 通用输出格式化模块

use anyhow::{Context, Result};
use chrono::Local;
use colored::Colorize;
use dtf_common::ActionStatus;
use dtf_executor::RunReport;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// 创建一个转圈进度提示
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

pub fn status_icon(status: ActionStatus) -> colored::ColoredString {
    match status {
        ActionStatus::Success => "✓".green(),
        ActionStatus::Failed => "✗".red(),
        ActionStatus::Skipped => "⊘".yellow(),
    }
}

pub fn format_duration(ms: u64) -> String {
    format!("{:.2}s", ms as f64 / 1000.0)
}

/// 按扩展名或显式格式序列化
pub fn render<T: Serialize>(value: &T, format: &str) -> Result<String> {
    match format {
        "json" => Ok(serde_json::to_string_pretty(value)?),
        "yaml" | "yml" => Ok(serde_yaml::to_string(value)?),
        _ => anyhow::bail!("不支持的格式: {}", format),
    }
}

/// 导出到文件，格式由扩展名决定 (默认 JSON)
pub fn export<T: Serialize>(value: &T, path: &str) -> Result<()> {
    let format = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("json");
    let content = render(value, format)?;
    std::fs::write(path, content).with_context(|| format!("写入文件失败: {}", path))?;
    Ok(())
}

/// 打印运行报告
pub fn print_report(report: &RunReport) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "执行报告".bold());
    println!("{}", "=".repeat(60));
    println!();

    println!("脚本名称: {}", report.script_name.cyan().bold());
    if let Some(desc) = &report.description {
        println!("脚本描述: {}", desc.bright_black());
    }
    let local_time = report.started_at.with_timezone(&Local);
    println!("开始时间: {}", local_time.format("%Y-%m-%d %H:%M:%S"));
    println!("执行时间: {}", format_duration(report.duration_ms).yellow());
    if let Some(run_id) = report.run_id {
        println!("运行 ID:  {}", run_id);
    }
    println!();

    println!("动作统计:");
    println!("  总数: {}", report.actions_executed.to_string().bright_blue());
    println!("  成功: {}", report.passed_count.to_string().green());
    println!("  失败: {}", report.failed_count.to_string().red());
    println!();

    if !report.actions.is_empty() {
        println!("动作详情:");
        for action in &report.actions {
            let location = match &action.agent {
                Some(agent) => format!("[{}@{}]", action.thread, agent),
                None => format!("[{}]", action.thread),
            };
            println!(
                "  {} {} {} {} {}",
                status_icon(action.status),
                action.action,
                action.kind.bright_black(),
                location.bright_black(),
                format_duration(action.duration_ms).bright_black()
            );
            if let Some(error) = &action.error {
                println!("      错误: {}", error.red());
            }
        }
        println!();
    }

    if !report.properties.is_empty() {
        println!("测试属性:");
        for (name, value) in &report.properties {
            println!("  {} = {}", name, value);
        }
        println!();
    }

    println!("{}", "=".repeat(60));
    if report.passed {
        println!("{}", "✓ 脚本执行通过".green().bold());
    } else if report.stopped {
        println!("{}", "⊘ 脚本执行被停止".yellow().bold());
    } else {
        println!("{}", "✗ 脚本执行失败".red().bold());
    }
    if let Some(error) = &report.error {
        println!("{} {}", "原因:".red(), error);
    }
    println!("{}", "=".repeat(60));
}
