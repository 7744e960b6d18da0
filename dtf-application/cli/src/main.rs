//! DTF CLI 应用

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "dtf")]
#[command(about = "DTF - 分布式测试编排框架", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别 (RUST_LOG 优先)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// 配置文件路径 (默认 ~/.config/dtf/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 执行测试脚本
    Run {
        /// 脚本文件 (YAML)
        file: String,

        /// 覆盖属性 (可重复): -D key=value
        #[arg(short = 'D', long = "define", value_name = "KEY=VALUE")]
        defines: Vec<String>,

        /// key=value 格式的属性文件
        #[arg(short, long)]
        properties: Option<String>,

        /// 记录数据库路径 (覆盖配置)
        #[arg(long)]
        db: Option<String>,

        /// 不写入记录数据库
        #[arg(long, conflicts_with = "db")]
        no_db: bool,

        /// 事件日志文件 (JSON Lines)
        #[arg(long)]
        event_log: Option<String>,

        /// 把运行报告导出到文件 (.json/.yaml)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// 作为远程 Agent 运行
    Agent {
        /// Agent 名称
        #[arg(short, long)]
        name: Option<String>,

        /// 监听地址
        #[arg(short = 'L', long)]
        listen: Option<String>,

        /// 角色 (逗号分隔)
        #[arg(short, long, value_delimiter = ',')]
        roles: Vec<String>,
    },

    /// 运行记录管理
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },

    /// 校验脚本结构
    Validate {
        /// 脚本文件 (YAML)
        file: String,

        /// 打印规范化后的脚本
        #[arg(long)]
        print: bool,
    },

    /// 配置管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ReportAction {
    /// 列出运行记录
    List {
        /// 按脚本名称过滤
        #[arg(short, long)]
        script: Option<String>,

        /// 只显示通过的运行
        #[arg(long, conflicts_with = "failed")]
        passed: bool,

        /// 只显示失败的运行
        #[arg(long)]
        failed: bool,

        /// 最大条数
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// 显示运行详情
    Show {
        /// 运行 ID
        id: i64,
    },

    /// 对运行中记录的事件做统计
    Stats {
        /// 运行 ID
        id: i64,

        /// 事件名称
        #[arg(short, long, default_value = "dtf.action")]
        event: String,
    },

    /// 脚本通过率
    Rate {
        /// 脚本名称
        script: String,

        /// 最近天数
        #[arg(short, long, default_value = "7")]
        days: i64,
    },

    /// 导出运行记录
    Export {
        /// 运行 ID
        id: i64,

        /// 输出文件
        #[arg(short, long)]
        output: String,

        /// 格式 (json/yaml)
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// 删除运行记录
    Delete {
        /// 运行 ID
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// 生成默认配置文件
    Init {
        /// 覆盖已有文件
        #[arg(long)]
        force: bool,
    },

    /// 显示生效的配置
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!("DTF CLI 启动");

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run {
            file,
            defines,
            properties,
            db,
            no_db,
            event_log,
            output,
        } => {
            let options = commands::run::RunOptions {
                file,
                defines,
                properties,
                db,
                no_db,
                event_log,
                output,
            };
            let passed = commands::run::handle(config_path, options).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Agent {
            name,
            listen,
            roles,
        } => commands::agent::handle(config_path, name, listen, roles).await?,
        Commands::Report { action } => commands::report::handle(config_path, action).await?,
        Commands::Validate { file, print } => commands::validate::handle(&file, print)?,
        Commands::Config { action } => commands::config::handle(config_path, action)?,
    }

    Ok(())
}
