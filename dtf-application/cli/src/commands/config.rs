//! Config 命令处理

use anyhow::Result;
use colored::Colorize;

use crate::config::{self, DtfConfig};
use crate::ConfigAction;

pub fn handle(config_path: Option<&str>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { force } => init(config_path, force),
        ConfigAction::Show => show(config_path),
    }
}

fn init(config_path: Option<&str>, force: bool) -> Result<()> {
    let path = match config_path {
        Some(path) => config::expand(path),
        None => DtfConfig::config_path()?,
    };

    if path.exists() && !force {
        anyhow::bail!("配置文件已存在: {:?} (使用 --force 覆盖)", path);
    }

    DtfConfig::default().save_to(&path)?;
    println!("{} 已生成配置文件: {}", "✓".green(), path.display().to_string().yellow());
    Ok(())
}

fn show(config_path: Option<&str>) -> Result<()> {
    let config = DtfConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
