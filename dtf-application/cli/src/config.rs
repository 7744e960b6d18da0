//! CLI 配置管理
//!
//! **数据存储方式**: TOML 文件 (~/.config/dtf/config.toml)，可用 `--config` 覆盖

use anyhow::{Context, Result};
use dtf_agent::AgentConfig;
use dtf_transport::{AgentInfo, TransportConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// CLI 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DtfConfig {
    /// 通信层配置
    #[serde(default)]
    pub transport: TransportConfig,

    /// 已知的 Agent 列表
    #[serde(default)]
    pub agents: Vec<AgentInfo>,

    /// 结果记录
    #[serde(default)]
    pub recording: RecordingConfig,

    /// 插件
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// 初始属性
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// 本机作为 Agent 运行时的配置
    #[serde(default)]
    pub agent: AgentConfig,
}

/// 结果记录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// 记录数据库路径
    #[serde(default = "default_database")]
    pub database: String,

    /// 事件日志文件 (JSON Lines)
    pub event_log: Option<String>,
}

fn default_database() -> String {
    "~/.config/dtf/records.db".to_string()
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            event_log: None,
        }
    }
}

/// 插件配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// 插件清单目录
    pub dir: Option<String>,
}

impl DtfConfig {
    /// 获取默认配置文件路径
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("无法获取用户主目录")?;
        Ok(home.join(".config").join("dtf").join("config.toml"))
    }

    /// 加载配置，未指定路径时使用默认路径
    ///
    /// 默认路径下的文件不存在时返回默认配置；显式指定的文件必须存在。
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(&expand(path)),
            None => {
                let path = Self::config_path()?;
                if !path.exists() {
                    return Ok(Self::default());
                }
                Self::load_from(&path)
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))
    }

    /// 保存配置
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // 确保目录存在
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        fs::write(path, content).with_context(|| format!("写入配置文件失败: {:?}", path))?;

        Ok(())
    }

    pub fn database_path(&self) -> String {
        self.recording.database.clone()
    }

    pub fn plugin_dir(&self) -> Option<PathBuf> {
        self.plugins.dir.as_deref().map(expand)
    }
}

/// 展开路径中的 `~` 和环境变量
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string());
    PathBuf::from(expanded)
}

/// 读取 `key=value` 格式的属性文件
///
/// 支持 `#` 和 `!` 注释行，分隔符可以是 `=` 或 `:`。
pub fn load_properties_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("读取属性文件失败: {:?}", path))?;

    let mut properties = BTreeMap::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let split = line.find(|c: char| c == '=' || c == ':');
        let (key, value) = match split {
            Some(pos) => (line[..pos].trim(), line[pos + 1..].trim()),
            None => (line, ""),
        };
        if key.is_empty() {
            anyhow::bail!("属性文件 {:?} 第 {} 行缺少属性名", path, index + 1);
        }
        properties.insert(key.to_string(), value.to_string());
    }

    Ok(properties)
}

/// 解析 `-D key=value` 参数
pub fn parse_define(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("属性定义应为 key=value: {}", raw))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("属性名不能为空: {}", raw);
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DtfConfig::default();
        assert!(config.agents.is_empty());
        assert_eq!(config.recording.database, "~/.config/dtf/records.db");
        assert_eq!(config.transport.request_timeout, TransportConfig::default().request_timeout);
        assert!(config.plugin_dir().is_none());
    }

    #[test]
    fn test_parse_config() {
        let content = r#"
[transport]
connect_timeout = 5
request_timeout = 30

[transport.reconnect]
max_attempts = 2
initial_delay = 100

[[agents]]
name = "a1"
address = "10.0.0.1:7700"
roles = ["master"]

[[agents]]
name = "a2"
address = "10.0.0.2:7700"

[recording]
database = "/tmp/dtf.db"
event_log = "/tmp/events.jsonl"

[plugins]
dir = "/opt/dtf/plugins"

[properties]
size = "1024"

[agent]
name = "local"
listen = "127.0.0.1:7701"
"#;

        let config: DtfConfig = toml::from_str(content).unwrap();
        assert_eq!(config.transport.connect_timeout, 5);
        assert_eq!(config.transport.reconnect.max_attempts, 2);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].roles, vec!["master".to_string()]);
        assert!(config.agents[1].roles.is_empty());
        assert_eq!(config.recording.event_log.as_deref(), Some("/tmp/events.jsonl"));
        assert_eq!(config.plugin_dir(), Some(PathBuf::from("/opt/dtf/plugins")));
        assert_eq!(config.properties.get("size").map(String::as_str), Some("1024"));
        assert_eq!(config.agent.name, "local");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DtfConfig::default();
        config.agents.push(AgentInfo::new("a1", "127.0.0.1:7700"));
        config.properties.insert("k".to_string(), "v".to_string());
        config.save_to(&path).unwrap();

        let loaded = DtfConfig::load(path.to_str()).unwrap();
        assert_eq!(loaded.agents, config.agents);
        assert_eq!(loaded.properties, config.properties);
    }

    #[test]
    fn test_explicit_missing_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(DtfConfig::load(path.to_str()).is_err());
    }

    #[test]
    fn test_load_properties_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "! another comment").unwrap();
        writeln!(file, "host = example.org").unwrap();
        writeln!(file, "port:8080").unwrap();
        writeln!(file, "url=http://a/b?c=d").unwrap();
        writeln!(file, "flag").unwrap();
        writeln!(file).unwrap();

        let props = load_properties_file(file.path()).unwrap();
        assert_eq!(props.len(), 4);
        assert_eq!(props["host"], "example.org");
        assert_eq!(props["port"], "8080");
        assert_eq!(props["url"], "http://a/b?c=d");
        assert_eq!(props["flag"], "");
    }

    #[test]
    fn test_parse_define() {
        assert_eq!(
            parse_define("size=2048").unwrap(),
            ("size".to_string(), "2048".to_string())
        );
        assert_eq!(
            parse_define("expr=a=b").unwrap(),
            ("expr".to_string(), "a=b".to_string())
        );
        assert!(parse_define("novalue").is_err());
        assert!(parse_define("=x").is_err());
    }
}
