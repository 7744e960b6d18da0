//! 运行记录管理命令

use anyhow::Result;
use chrono::Local;
use colored::Colorize;
use dtf_executor::{calc_stats, ActionReport, Cursor, ACTION_EVENT};
use dtf_storage::{EventFilter, RunFilter, Storage};

use super::{common, output};
use crate::config::DtfConfig;
use crate::ReportAction;

pub async fn handle(config_path: Option<&str>, action: ReportAction) -> Result<()> {
    let config = DtfConfig::load(config_path)?;
    let storage = common::open_storage(&config.database_path()).await?;

    match action {
        ReportAction::List {
            script,
            passed,
            failed,
            limit,
        } => list_runs(&storage, script, passed, failed, limit).await,
        ReportAction::Show { id } => show_run(&storage, id).await,
        ReportAction::Stats { id, event } => show_stats(&storage, id, &event).await,
        ReportAction::Rate { script, days } => show_rate(&storage, &script, days).await,
        ReportAction::Export { id, output, format } => {
            export_run(&storage, id, &output, &format).await
        }
        ReportAction::Delete { id } => delete_run(&storage, id).await,
    }
}

async fn list_runs(
    storage: &Storage,
    script: Option<String>,
    passed: bool,
    failed: bool,
    limit: i64,
) -> Result<()> {
    let mut filter = RunFilter {
        script_name: script,
        limit: Some(limit),
        ..Default::default()
    };

    if passed {
        filter.passed = Some(true);
    } else if failed {
        filter.passed = Some(false);
    }

    let runs = storage.runs().list(&filter).await?;

    if runs.is_empty() {
        println!("\n{} 没有找到运行记录", "ℹ".yellow());
        return Ok(());
    }

    println!("\n{} 找到 {} 条运行记录:\n", "✓".green(), runs.len());

    println!(
        "{:<6} {:<25} {:<20} {:<8} {:<10} {:<15}",
        "ID".bold(),
        "脚本名称".bold(),
        "执行时间".bold(),
        "结果".bold(),
        "动作".bold(),
        "耗时".bold()
    );
    println!("{}", "-".repeat(90));

    for run in runs {
        let result_str = if run.end_time.is_none() {
            "未完成".yellow()
        } else if run.passed {
            "通过".green()
        } else {
            "失败".red()
        };

        let local_time = run.start_time.with_timezone(&Local);
        let time_str = local_time.format("%Y-%m-%d %H:%M:%S").to_string();

        let actions_str = format!("{}/{}", run.success_count, run.total_actions);

        let duration_str = match run.duration_ms {
            Some(ms) => output::format_duration(ms.max(0) as u64),
            None => "N/A".to_string(),
        };

        println!(
            "{:<6} {:<25} {:<20} {:<8} {:<10} {:<15}",
            run.id, run.script_name, time_str, result_str, actions_str, duration_str
        );
    }

    Ok(())
}

async fn show_run(storage: &Storage, id: i64) -> Result<()> {
    let Some(run) = storage.runs().get_by_id(id).await? else {
        println!("\n{} 未找到运行记录 ID: {}", "✗".red(), id);
        return Ok(());
    };

    println!("\n{} 运行详情\n", "📊".cyan());
    println!("  ID: {}", run.id);
    println!("  脚本: {}", run.script_name.yellow());
    if let Some(desc) = &run.description {
        println!("  描述: {}", desc);
    }
    println!(
        "  结果: {}",
        if run.passed {
            "通过 ✓".green()
        } else {
            "失败 ✗".red()
        }
    );

    let local_time = run.start_time.with_timezone(&Local);
    println!("  开始时间: {}", local_time.format("%Y-%m-%d %H:%M:%S"));
    if let Some(ms) = run.duration_ms {
        println!("  总耗时: {}", output::format_duration(ms.max(0) as u64));
    }

    println!("\n  动作统计:");
    println!("    总数: {}", run.total_actions);
    println!("    成功: {}", run.success_count.to_string().green());
    println!("    失败: {}", run.failed_count.to_string().red());

    let events = storage
        .events()
        .events(&EventFilter::for_run(id).named(ACTION_EVENT))
        .await?;
    if !events.is_empty() {
        println!("\n  动作详情:\n");
        for event in &events {
            let action = ActionReport::from_event(event);
            let location = match &action.agent {
                Some(agent) => format!("{}@{}", action.thread, agent),
                None => action.thread.clone(),
            };
            println!(
                "    {} {} ({}, {}) {}",
                output::status_icon(action.status),
                action.action,
                action.kind,
                location,
                output::format_duration(action.duration_ms).bright_black()
            );
            if let Some(error) = &action.error {
                println!("      错误: {}", error.red());
            }
        }
    }

    let properties = storage.properties().list_for_run(id).await?;
    if !properties.is_empty() {
        println!("\n  测试属性:");
        for property in properties {
            println!("    {} = {}", property.name, property.value);
        }
    }

    Ok(())
}

async fn show_stats(storage: &Storage, id: i64, event: &str) -> Result<()> {
    let events = storage
        .events()
        .events(&EventFilter::for_run(id).named(event))
        .await?;

    let cursor = Cursor::from_events(events);
    let report = calc_stats(&cursor, &format!("{}.stats", event));

    println!("\n{} 事件统计: {} (运行 {})\n", "📈".cyan(), event.yellow(), id);
    for (name, value) in &report.event.attributes {
        println!("  {:<24} {}", name, value);
    }
    for skipped in &report.skipped {
        println!("  {} {}", "⚠".yellow(), skipped);
    }

    Ok(())
}

async fn show_rate(storage: &Storage, script: &str, days: i64) -> Result<()> {
    let rate = storage.runs().pass_rate(script, days).await?;

    println!("\n{} 脚本统计: {}\n", "📈".cyan(), script.yellow());
    println!("  时间范围: 最近 {} 天", days);
    println!("  通过率: {:.2}%", rate);

    if rate >= 90.0 {
        println!("  评级: {} 优秀", "★★★".green());
    } else if rate >= 70.0 {
        println!("  评级: {} 良好", "★★".yellow());
    } else {
        println!("  评级: {} 需要改进", "★".red());
    }

    Ok(())
}

async fn export_run(storage: &Storage, id: i64, path: &str, format: &str) -> Result<()> {
    let Some(run) = storage.runs().get_by_id(id).await? else {
        println!("\n{} 未找到运行记录 ID: {}", "✗".red(), id);
        return Ok(());
    };

    let events = storage.events().events(&EventFilter::for_run(id)).await?;
    let properties = storage.properties().list_for_run(id).await?;

    let export_data = serde_json::json!({
        "run": run,
        "events": events,
        "properties": properties,
    });

    let content = output::render(&export_data, format)?;
    std::fs::write(path, content)?;

    println!("\n{} 运行记录已导出到: {}", "✓".green(), path.yellow());

    Ok(())
}

async fn delete_run(storage: &Storage, id: i64) -> Result<()> {
    storage.runs().delete(id).await?;

    println!("\n{} 运行记录 {} 已删除", "✓".green(), id);

    Ok(())
}
