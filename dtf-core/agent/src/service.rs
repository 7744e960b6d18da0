//! 动作执行服务

use chrono::Utc;
use dtf_common::{ActionResult, ErrorPayload, StateSnapshot};
use dtf_executor::{
    ArchiveClient, Dispatcher, LogForwarder, PluginRegistry, Recorder, StopHandle,
};
use dtf_script::{Action, ExecutionState, ReferenceIndex, StateStack};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// 动作执行服务
///
/// 每个请求使用独立的状态栈，事件记录到 Agent 本地的记录器。
pub struct AgentService {
    name: String,
    recorder: Arc<Recorder>,
    plugins: Arc<PluginRegistry>,
    archive: Option<Arc<dyn ArchiveClient>>,
    stop: StopHandle,
}

impl AgentService {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            recorder: Arc::new(Recorder::new()),
            plugins: Arc::new(PluginRegistry::new()),
            archive: None,
            stop: StopHandle::new(),
        }
    }

    pub fn with_plugins(mut self, plugins: Arc<PluginRegistry>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveClient>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// 停止所有进行中的执行
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// 无法解码的请求直接以协议错误作答
    pub fn reject(&self, reason: &str) -> ActionResult {
        let error = ErrorPayload {
            kind: "protocol".to_string(),
            message: format!("无法解码执行请求: {}", reason),
        };
        ActionResult::failed("request", Utc::now(), 0, error).with_agent(&self.name)
    }

    /// 执行一个派发来的动作子树
    ///
    /// 失败不会以 Err 返回，而是编码进结果的异常载荷。
    pub async fn execute(
        &self,
        action: &Action,
        snapshot: StateSnapshot,
        forwarder: Option<Arc<dyn LogForwarder>>,
    ) -> ActionResult {
        let label = action.label();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!("执行远程动作: {}", label);

        let refs = match ReferenceIndex::build(action) {
            Ok(refs) => Arc::new(refs),
            Err(e) => {
                let error = dtf_executor::ExecutorError::from(e);
                return ActionResult::failed(&label, started_at, 0, error.to_payload())
                    .with_agent(&self.name);
            }
        };

        let mut dispatcher = Dispatcher::new(refs, self.recorder.clone())
            .with_plugins(self.plugins.clone())
            .with_stop(self.stop.clone())
            .with_agent_name(&self.name);
        if let Some(archive) = &self.archive {
            dispatcher = dispatcher.with_archive(archive.clone());
        }
        if let Some(forwarder) = forwarder {
            dispatcher = dispatcher.with_log_forwarder(forwarder);
        }

        let mut stack = StateStack::new(ExecutionState::new(&self.name).with_owner(&self.name));
        stack.push(ExecutionState::from_snapshot(snapshot, &self.name));

        let result = match dispatcher.execute(action, &mut stack).await {
            Ok(result) => result,
            Err(failure) => ActionResult::failed(
                &label,
                started_at,
                clock.elapsed().as_millis() as u64,
                failure.error.to_payload(),
            ),
        };

        debug!("远程动作 {} 完成: {}", label, result.status);
        result.with_agent(&self.name)
    }
}
