//! Validate 命令处理

use anyhow::{Context, Result};
use colored::Colorize;
use dtf_script::{ActionKind, Script};

use crate::config;

pub fn handle(file: &str, print: bool) -> Result<()> {
    let script = Script::from_file(config::expand(file))
        .with_context(|| format!("脚本校验失败: {}", file))?;

    println!("{} 脚本结构有效: {}", "✓".green().bold(), script.name.cyan());
    println!("  节点数: {}", script.root.node_count());
    println!("  可引用片段: {}", script.refs.len());

    let (remote, dangling) = summarize(&script);
    println!("  远程块: {}", remote);
    if !dangling.is_empty() {
        // 引用在执行时才解析，这里只提示
        println!(
            "  {} 未定义的引用: {}",
            "⚠".yellow(),
            dangling.join(", ").yellow()
        );
    }

    if print {
        println!("\n{}", script.to_yaml()?);
    }

    Ok(())
}

/// 统计远程块数量并找出未定义的 refid
fn summarize(script: &Script) -> (usize, Vec<String>) {
    let mut remote = 0;
    let mut dangling = Vec::new();
    let mut pending = vec![&script.root];

    while let Some(action) = pending.pop() {
        if matches!(action.kind, ActionKind::Remote { .. }) {
            remote += 1;
        }
        if let Some(refid) = &action.refid {
            if !script.refs.contains(refid) && !dangling.contains(refid) {
                dangling.push(refid.clone());
            }
        }
        pending.extend(action.kind.children());
    }

    dangling.sort();
    (remote, dangling)
}
