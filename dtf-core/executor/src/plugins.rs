//! 插件注册表
//!
//! `custom` 动作按 handler 名称在注册表中查找处理器。插件可以在代码中注册，
//! 也可以从目录中的 `*.toml` 清单加载为外部命令插件。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{ExecutorError, Result};

/// 插件能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCapability {
    /// 提供自定义动作
    Action,
}

/// 自定义动作处理器
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn capability(&self) -> PluginCapability {
        PluginCapability::Action
    }

    /// 执行动作，返回可选的输出
    async fn execute(&self, params: &BTreeMap<String, String>) -> Result<Option<String>>;
}

/// 插件清单
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,

    #[serde(default = "default_capability")]
    pub capability: PluginCapability,

    /// 可执行文件 (以 `./` 开头时相对清单所在目录)
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,
}

fn default_capability() -> PluginCapability {
    PluginCapability::Action
}

/// 外部命令插件
///
/// 参数以 JSON 对象写入 stdin，stdout 作为动作输出。
pub struct CommandPlugin {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandPlugin {
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn from_manifest(manifest: &PluginManifest, base_dir: &Path) -> Self {
        let command = match manifest.command.strip_prefix("./") {
            Some(relative) => base_dir.join(relative),
            None => PathBuf::from(&manifest.command),
        };
        Self::new(command, manifest.args.clone())
    }
}

#[async_trait]
impl ActionHandler for CommandPlugin {
    async fn execute(&self, params: &BTreeMap<String, String>) -> Result<Option<String>> {
        let input = serde_json::to_vec(params)
            .map_err(|e| ExecutorError::Plugin(format!("参数序列化失败: {}", e)))?;

        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ExecutorError::Plugin(format!("启动 {} 失败: {}", self.command.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ExecutorError::Plugin(format!(
                "{} 退出码 {:?}: {}",
                self.command.display(),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        Ok(if stdout.is_empty() { None } else { Some(stdout) })
    }
}

/// 插件注册表
pub struct PluginRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn ActionHandler>>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 注册插件
    pub async fn register(&self, name: &str, handler: Arc<dyn ActionHandler>) -> Result<()> {
        info!("注册插件: {}", name);

        let mut handlers = self.handlers.write().await;

        if handlers.contains_key(name) {
            return Err(ExecutorError::Plugin(format!("插件 {} 已注册", name)));
        }

        handlers.insert(name.to_string(), handler);

        Ok(())
    }

    /// 注销插件
    pub async fn unregister(&self, name: &str) -> Result<()> {
        info!("注销插件: {}", name);

        let mut handlers = self.handlers.write().await;

        handlers
            .remove(name)
            .ok_or_else(|| ExecutorError::Plugin(format!("插件 {} 不存在", name)))?;

        Ok(())
    }

    /// 获取插件
    pub async fn get(&self, name: &str) -> Result<Arc<dyn ActionHandler>> {
        debug!("获取插件: {}", name);

        let handlers = self.handlers.read().await;

        handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutorError::Plugin(format!("插件 {} 不存在", name)))
    }

    /// 列出所有已注册的插件
    pub async fn list(&self) -> Vec<String> {
        let handlers = self.handlers.read().await;
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        let handlers = self.handlers.read().await;
        handlers.contains_key(name)
    }

    /// 从目录加载插件清单，返回成功加载的数量
    ///
    /// 单个清单无效时跳过并告警。
    pub async fn load_dir(&self, dir: &Path) -> Result<usize> {
        let pattern = dir.join("*.toml");
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern)
            .map_err(|e| ExecutorError::Config(format!("无效的插件目录 {}: {}", dir.display(), e)))?;

        let mut loaded = 0;
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("读取插件目录失败: {}", e);
                    continue;
                }
            };

            let manifest = match tokio::fs::read_to_string(&path)
                .await
                .map_err(ExecutorError::from)
                .and_then(|s| {
                    toml::from_str::<PluginManifest>(&s)
                        .map_err(|e| ExecutorError::Plugin(e.to_string()))
                }) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("跳过无效的插件清单 {}: {}", path.display(), e);
                    continue;
                }
            };

            let base_dir = path.parent().unwrap_or(dir);
            let plugin = CommandPlugin::from_manifest(&manifest, base_dir);
            match self.register(&manifest.name, Arc::new(plugin)).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!("插件 {} 加载失败: {}", manifest.name, e),
            }
        }

        info!("从 {} 加载了 {} 个插件", dir.display(), loaded);
        Ok(loaded)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
