//! 脚本执行器

use chrono::Utc;
use dtf_script::{ExecutionState, Script, StateStack};
use dtf_storage::{RunRecord, Storage};
use dtf_transport::{AgentDirectory, TransportManager};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::archive::ArchiveClient;
use crate::dispatcher::{Dispatcher, StopHandle};
use crate::plugins::PluginRegistry;
use crate::recorder::{FileSink, Recorder, RecordingSink, SqliteSink};
use crate::report::RunReport;
use crate::Result;

/// 脚本执行器
///
/// 为每次运行创建独立的记录器和调度器。
pub struct ScriptRunner {
    /// 通信管理器与节点目录 (可选)
    transport: Option<(Arc<TransportManager>, Arc<AgentDirectory>)>,

    /// 插件注册表
    plugins: Arc<PluginRegistry>,

    /// 存储客户端 (可选)
    archive: Option<Arc<dyn ArchiveClient>>,

    /// 数据库存储 (可选)
    storage: Option<Arc<Storage>>,

    /// 事件日志文件 (可选)
    event_log: Option<PathBuf>,

    /// 额外的记录后端
    sinks: Vec<Arc<dyn RecordingSink>>,

    /// 覆盖脚本默认值的属性
    overrides: BTreeMap<String, String>,

    stop: StopHandle,
}

impl ScriptRunner {
    pub fn new() -> Self {
        Self {
            transport: None,
            plugins: Arc::new(PluginRegistry::new()),
            archive: None,
            storage: None,
            event_log: None,
            sinks: Vec::new(),
            overrides: BTreeMap::new(),
            stop: StopHandle::new(),
        }
    }

    /// 设置远程通信
    pub fn with_transport(
        mut self,
        transport: Arc<TransportManager>,
        directory: Arc<AgentDirectory>,
    ) -> Self {
        self.transport = Some((transport, directory));
        self
    }

    pub fn with_plugins(mut self, plugins: Arc<PluginRegistry>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveClient>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// 设置数据库存储
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// 把事件追加写入 JSON Lines 文件
    pub fn with_event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_log = Some(path.into());
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordingSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.overrides.extend(properties);
        self
    }

    pub fn with_stop(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// 执行脚本
    ///
    /// 动作失败体现在报告中，只有记录基础设施出错时才返回 Err。
    pub async fn run(&self, script: &Script) -> Result<RunReport> {
        info!("开始执行脚本: {}", script.name);
        let start_time = Instant::now();

        let mut run_record = RunRecord::started(&script.name, script.description.clone());
        let mut recorder = Recorder::new();

        if let Some(storage) = &self.storage {
            run_record.properties = serde_json::to_string(&script.properties).ok();
            run_record.id = storage.runs().create(&run_record).await?;
            recorder = recorder.with_sink(Arc::new(SqliteSink::new(storage.clone(), run_record.id)));
        }
        if let Some(path) = &self.event_log {
            recorder = recorder.with_sink(Arc::new(FileSink::open(path).await?));
        }
        for sink in &self.sinks {
            recorder = recorder.with_sink(sink.clone());
        }
        let recorder = Arc::new(recorder);

        let mut dispatcher = Dispatcher::new(script.refs.clone(), recorder.clone())
            .with_plugins(self.plugins.clone())
            .with_stop(self.stop.clone());
        if let Some((transport, directory)) = &self.transport {
            dispatcher = dispatcher.with_transport(transport.clone(), directory.clone());
        }
        if let Some(archive) = &self.archive {
            dispatcher = dispatcher.with_archive(archive.clone());
        }

        let mut defaults = script.properties.clone();
        defaults.extend(self.overrides.clone());
        let mut stack = StateStack::new(ExecutionState::with_defaults("main", defaults));

        let outcome = dispatcher.execute(&script.root, &mut stack).await;
        recorder.flush().await;

        let mut report = RunReport::new(&script.name);
        report.description = script.description.clone();
        report.started_at = run_record.start_time;
        report.collect_events(&recorder.events().await);
        report.properties = recorder.properties().await;
        report.duration_ms = start_time.elapsed().as_millis() as u64;

        if let Err(failure) = outcome {
            report.passed = false;
            report.stopped = failure.is_stopped();
            report.error = Some(failure.to_string());
        }

        if let Some(storage) = &self.storage {
            run_record.end_time = Some(Utc::now());
            run_record.duration_ms = Some(report.duration_ms as i64);
            run_record.total_actions = report.actions_executed as i64;
            run_record.success_count = report.passed_count as i64;
            run_record.failed_count = report.failed_count as i64;
            run_record.passed = report.passed;
            match storage.runs().finish(&run_record).await {
                Ok(()) => {
                    info!("运行记录已保存到数据库: run_id={}", run_record.id);
                    report.run_id = Some(run_record.id);
                }
                Err(e) => warn!("保存运行记录失败: {}", e),
            }
        }

        if report.passed {
            info!(
                "脚本 {} 执行通过: {} 个动作, 耗时 {} ms",
                script.name, report.actions_executed, report.duration_ms
            );
        } else {
            error!(
                "脚本 {} 执行失败: {}/{} 个动作失败",
                script.name, report.failed_count, report.actions_executed
            );
        }

        Ok(report)
    }
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new()
    }
}
