//! 动作调度器
//!
//! 每个动作依次经历以下阶段：
//!
//! ```text
//! Pending -> ResolvingRefs -> EvaluatingAttrs -> LocalExec | RemoteDispatch -> Recorded -> Done
//! ```
//!
//! 任一阶段出错进入 `Failed`。执行状态栈随调用显式传递，
//! 并行分支各自持有派生出的独立栈。

use chrono::{DateTime, Utc};
use dtf_common::{context_keys, ActionResult, Event, RemoteLogRecord};
use dtf_script::{Action, ActionKind, ExecutionState, ReferenceIndex, StateStack, Template};
use dtf_transport::{
    AgentDirectory, DispatchCallback, ReconnectConfig, Selector, TransportError, TransportManager,
};
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::archive::ArchiveClient;
use crate::plugins::PluginRegistry;
use crate::recorder::{parse_attr_value, EventQuery, Recorder, ACTION_EVENT};
use crate::stats::calc_stats;
use crate::{ActionFailure, ExecutorError};

/// 动作执行结果：成功 (含跳过) 或沿树向上传递的失败
pub type Outcome = std::result::Result<ActionResult, ActionFailure>;

type Step = std::result::Result<Option<String>, ActionFailure>;

/// 动作生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    ResolvingRefs,
    EvaluatingAttrs,
    LocalExec,
    RemoteDispatch,
    Recorded,
    Done,
    Failed,
}

/// 协作式停止信号
///
/// 在子动作之间、循环迭代之间以及 sleep 期间检查。
#[derive(Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// 等待停止信号
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// 远程日志转发 (Agent 端把 log 动作推回调度端)
pub trait LogForwarder: Send + Sync {
    fn forward(&self, record: RemoteLogRecord);
}

/// 求值后的叶子动作
enum LeafOp {
    Log {
        message: String,
        level: String,
    },
    Property {
        name: String,
        value: String,
        overwrite: bool,
    },
    Sleep(Duration),
    Exec {
        command: String,
        args: Vec<String>,
        property: Option<String>,
        expect_exit: i32,
    },
    Fail(String),
    Record(Event),
    RecordProperty {
        name: String,
        value: String,
    },
    Stats {
        event: String,
        output: Option<String>,
    },
    StoreObject {
        data: String,
        metadata: BTreeMap<String, String>,
        property: Option<String>,
    },
    RetrieveObject {
        oid: String,
        property: Option<String>,
    },
    Query {
        query: String,
        property: Option<String>,
    },
    SelectUnique {
        query: String,
        property: Option<String>,
    },
    GetMetadata {
        oid: String,
        property: Option<String>,
    },
    Custom {
        handler: String,
        params: BTreeMap<String, String>,
    },
}

/// 远程派发的单个 Agent 结果
type AgentOutcome = (String, std::result::Result<ActionResult, TransportError>);

/// 扇出中等待响应的请求：(Agent, 关联 ID, 截止时间)
type InFlight = (String, Uuid, TokioInstant);

/// 扇出派发的回调：把结果送回收集通道
struct FanOutCallback {
    agent: String,
    attempt: u32,
    tx: mpsc::UnboundedSender<(String, u32, std::result::Result<ActionResult, TransportError>)>,
}

impl DispatchCallback for FanOutCallback {
    fn succeeded(self: Box<Self>, result: ActionResult) {
        let _ = self.tx.send((self.agent, self.attempt, Ok(result)));
    }

    fn failed(self: Box<Self>, error: TransportError) {
        let _ = self.tx.send((self.agent, self.attempt, Err(error)));
    }
}

/// 动作调度器
///
/// 克隆开销很小，并行分支各持有一份。
#[derive(Clone)]
pub struct Dispatcher {
    refs: Arc<ReferenceIndex>,
    recorder: Arc<Recorder>,
    transport: Option<Arc<TransportManager>>,
    directory: Option<Arc<AgentDirectory>>,
    plugins: Arc<PluginRegistry>,
    archive: Option<Arc<dyn ArchiveClient>>,
    stop: StopHandle,
    backoff: ReconnectConfig,

    /// 在 Agent 上执行时为 Agent 名称
    agent_name: Option<String>,

    log_forwarder: Option<Arc<dyn LogForwarder>>,
}

impl Dispatcher {
    pub fn new(refs: Arc<ReferenceIndex>, recorder: Arc<Recorder>) -> Self {
        Self {
            refs,
            recorder,
            transport: None,
            directory: None,
            plugins: Arc::new(PluginRegistry::new()),
            archive: None,
            stop: StopHandle::new(),
            backoff: ReconnectConfig::default(),
            agent_name: None,
            log_forwarder: None,
        }
    }

    pub fn with_transport(
        mut self,
        transport: Arc<TransportManager>,
        directory: Arc<AgentDirectory>,
    ) -> Self {
        self.backoff = transport.config().reconnect.clone();
        self.transport = Some(transport);
        self.directory = Some(directory);
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

    pub fn with_stop(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_backoff(mut self, backoff: ReconnectConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_agent_name(mut self, name: &str) -> Self {
        self.agent_name = Some(name.to_string());
        self
    }

    pub fn with_log_forwarder(mut self, forwarder: Arc<dyn LogForwarder>) -> Self {
        self.log_forwarder = Some(forwarder);
        self
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    fn phase(&self, label: &str, phase: Phase) {
        trace!(action = label, phase = ?phase, "阶段迁移");
    }

    /// 执行一个动作
    ///
    /// 直接遇到的可引用片段 (带 id) 是空操作，只有通过 refid 引用时才执行。
    pub fn execute<'a>(&'a self, action: &'a Action, stack: &'a mut StateStack) -> BoxFuture<'a, Outcome> {
        async move {
            let label = action.label();
            self.phase(&label, Phase::Pending);

            if self.stop.is_stopped() {
                let mut failure = ActionFailure::silent(&label, ExecutorError::Stopped);
                failure.log_once();
                return Err(failure);
            }

            self.phase(&label, Phase::ResolvingRefs);
            let node = match &action.refid {
                Some(refid) => match self.refs.resolve(refid) {
                    Ok(target) => target,
                    Err(e) => {
                        self.phase(&label, Phase::Failed);
                        let mut failure = ActionFailure::silent(&label, e.into());
                        failure.log_once();
                        return Err(failure);
                    }
                },
                None if action.is_referencable() => {
                    trace!(action = %label, "跳过可引用片段");
                    return Ok(ActionResult::skipped(&label));
                }
                None => action,
            };

            self.run_node(node, stack).await
        }
        .boxed()
    }

    async fn run_node(&self, node: &Action, stack: &mut StateStack) -> Outcome {
        let label = node.label();
        let started_at = Utc::now();
        let clock = Instant::now();
        stack.current_mut().set_current_action(Some(label.clone()));

        let step = if node.kind.is_container() {
            self.run_container(node, &label, stack).await
        } else {
            self.phase(&label, Phase::EvaluatingAttrs);
            match self.evaluate(&node.kind, stack.current()) {
                Ok(op) => {
                    self.phase(&label, Phase::LocalExec);
                    self.run_leaf(op, stack)
                        .await
                        .map_err(|e| ActionFailure::new(&label, e))
                }
                Err(e) => Err(ActionFailure::new(&label, e)),
            }
        };

        let elapsed = clock.elapsed().as_millis() as u64;
        stack.current_mut().set_current_action(None);

        match step {
            Ok(output) => {
                let mut result = ActionResult::success(&label, started_at, elapsed).with_output(output);
                if let Some(agent) = &self.agent_name {
                    result = result.with_agent(agent);
                }
                if !node.kind.is_container() {
                    self.record_action(node, &result, stack.current()).await;
                    self.phase(&label, Phase::Recorded);
                }
                self.phase(&label, Phase::Done);
                Ok(result)
            }
            Err(mut failure) => {
                if !failure.is_recorded() {
                    let result =
                        ActionResult::failed(&label, started_at, elapsed, failure.error.to_payload());
                    self.record_action(node, &result, stack.current()).await;
                    failure.mark_recorded();
                }
                failure.log_once();
                self.phase(&label, Phase::Failed);
                Err(failure)
            }
        }
    }

    async fn record_action(&self, node: &Action, result: &ActionResult, state: &ExecutionState) {
        let mut event = Event::new(ACTION_EVENT)
            .at(result.started_at)
            .with_duration(result.duration_ms)
            .with_attr("action", result.action.clone())
            .with_attr("type", node.kind.tag())
            .with_attr("status", result.status.as_str())
            .with_attr("thread", state.thread_id());
        if let Some(agent) = result.agent.as_ref().or(self.agent_name.as_ref()) {
            event = event.with_attr("agent", agent.clone());
        }
        if let Some(error) = &result.error {
            event = event
                .with_attr("error_kind", error.kind.clone())
                .with_attr("error", error.message.clone());
        }
        self.recorder.record(event).await;
    }

    // ==================== 容器 ====================

    async fn run_container(&self, node: &Action, label: &str, stack: &mut StateStack) -> Step {
        match &node.kind {
            ActionKind::Sequence {
                actions,
                continue_on_failure,
            } => self.run_sequence(actions, *continue_on_failure, stack).await,

            ActionKind::Parallel {
                actions,
                continue_on_failure,
                max_concurrent,
            } => {
                self.run_parallel(label, actions, *continue_on_failure, *max_concurrent, stack)
                    .await
            }

            ActionKind::Loop {
                count,
                property,
                actions,
            } => {
                self.phase(label, Phase::EvaluatingAttrs);
                let count = count
                    .resolve_u64("count", stack.current())
                    .map_err(|e| ActionFailure::new(label, e.into()))?;
                for i in 0..count {
                    if let Some(property) = property {
                        stack
                            .current_mut()
                            .set_property(property, &i.to_string(), true);
                    }
                    self.run_sequence(actions, false, stack).await?;
                }
                Ok(None)
            }

            ActionKind::If {
                property,
                equals,
                then,
                otherwise,
            } => {
                self.phase(label, Phase::EvaluatingAttrs);
                let state = stack.current();
                let value = state.property(property);
                let matched = match equals {
                    Some(expected) => value == Some(expected.resolve(state).as_str()),
                    None => value.map(is_truthy).unwrap_or(false),
                };
                debug!(action = label, property = %property, matched = matched, "条件判断");
                let branch = if matched { then } else { otherwise };
                self.run_sequence(branch, false, stack).await
            }

            ActionKind::Remote {
                target,
                actions,
                continue_on_failure,
                retries,
                timeout_secs,
            } => {
                self.run_remote(
                    node,
                    label,
                    target,
                    actions,
                    *continue_on_failure,
                    retries.as_ref(),
                    timeout_secs.as_ref(),
                    stack,
                )
                .await
            }

            _ => Err(ActionFailure::new(
                label,
                ExecutorError::Config(format!("{} 不是容器", node.kind.tag())),
            )),
        }
    }

    async fn run_sequence(
        &self,
        actions: &[Action],
        continue_on_failure: bool,
        stack: &mut StateStack,
    ) -> Step {
        let mut failed = 0usize;
        for child in actions {
            match self.execute(child, stack).await {
                Ok(_) => {}
                Err(failure) if failure.is_stopped() || !continue_on_failure => {
                    return Err(failure)
                }
                Err(_) => failed += 1,
            }
        }
        Ok((failed > 0).then(|| format!("{} 个子动作失败", failed)))
    }

    /// 并行执行子动作
    ///
    /// 首个失败后尚未启动的兄弟动作被跳过，已启动的继续执行到结束。
    async fn run_parallel(
        &self,
        label: &str,
        actions: &[Action],
        continue_on_failure: bool,
        max_concurrent: Option<usize>,
        stack: &StateStack,
    ) -> Step {
        let limit = max_concurrent.unwrap_or(actions.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let aborted = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(actions.len());
        let mut skipped = 0usize;

        for (i, child) in actions.iter().enumerate() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ActionFailure::new(label, ExecutorError::ActionFailed(e.to_string())))?;

            if self.stop.is_stopped() || (!continue_on_failure && aborted.load(Ordering::SeqCst)) {
                skipped = actions.len() - i;
                break;
            }

            let dispatcher = self.clone();
            let child = child.clone();
            let mut branch = stack.branch(&i.to_string());
            let aborted = aborted.clone();

            handles.push(tokio::spawn(async move {
                let outcome = dispatcher.execute(&child, &mut branch).await;
                if outcome.is_err() {
                    aborted.store(true, Ordering::SeqCst);
                }
                drop(permit);
                outcome
            }));
        }

        if skipped > 0 {
            debug!(action = label, skipped = skipped, "并行容器跳过未启动的子动作");
        }

        let mut first_failure: Option<ActionFailure> = None;
        let mut failed = 0usize;
        for handle in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(ActionFailure::new(
                    label,
                    ExecutorError::ActionFailed(format!("并行分支异常退出: {}", e)),
                )),
            };
            if let Err(failure) = outcome {
                failed += 1;
                if first_failure.is_none() {
                    first_failure = Some(failure);
                }
            }
        }

        match first_failure {
            Some(failure) if failure.is_stopped() || !continue_on_failure => Err(failure),
            _ if self.stop.is_stopped() => Err(ActionFailure::silent(label, ExecutorError::Stopped)),
            _ => Ok((failed > 0).then(|| format!("{} 个子动作失败", failed))),
        }
    }

    // ==================== 远程派发 ====================

    #[allow(clippy::too_many_arguments)]
    async fn run_remote(
        &self,
        node: &Action,
        label: &str,
        target: &Template,
        actions: &[Action],
        continue_on_failure: bool,
        retries: Option<&Template>,
        timeout_secs: Option<&Template>,
        stack: &StateStack,
    ) -> Step {
        let fail = |e: ExecutorError| ActionFailure::new(label, e);

        let (transport, directory) = match (&self.transport, &self.directory) {
            (Some(t), Some(d)) => (t.clone(), d.clone()),
            _ => {
                return Err(fail(ExecutorError::Config(
                    "未配置远程通信，无法执行 remote 动作".to_string(),
                )))
            }
        };

        self.phase(label, Phase::EvaluatingAttrs);
        let state = stack.current();
        let selector: Selector = target
            .resolve(state)
            .parse()
            .map_err(|e: TransportError| fail(e.into()))?;
        let retries = match retries {
            Some(t) => t.resolve_u64("retries", state).map_err(|e| fail(e.into()))? as u32,
            None => 0,
        };
        let timeout = match timeout_secs {
            Some(t) => Some(Duration::from_secs(
                t.resolve_u64("timeout_secs", state)
                    .map_err(|e| fail(e.into()))?,
            )),
            None => None,
        };

        // 子树连同其引用的片段一起发送
        self.phase(label, Phase::ResolvingRefs);
        let subtree = Action::new(ActionKind::Sequence {
            actions: actions.to_vec(),
            continue_on_failure,
        })
        .named(label);
        let subtree = self
            .refs
            .expand(&subtree)
            .map_err(|e| ActionFailure::silent(label, e.into()))?;

        self.phase(label, Phase::RemoteDispatch);
        let agents = directory
            .resolve(&selector)
            .await
            .map_err(|e| fail(e.into()))?;
        info!(action = label, selector = %selector, "派发到 {} 个 Agent: {:?}", agents.len(), agents);

        let thread_id = state.thread_id().to_string();
        let mut snapshot = state.snapshot();
        snapshot
            .global_context
            .insert(context_keys::REMOTE_THREAD.to_string(), thread_id.clone());

        let started_at = Utc::now();
        let clock = Instant::now();
        let outcomes = if agents.len() == 1 {
            let agent = agents[0].clone();
            let outcome = self
                .send_with_retry(&transport, &agent, &subtree, &snapshot, &thread_id, retries, timeout)
                .await;
            vec![(agent, outcome)]
        } else {
            self.fan_out(&transport, &agents, &subtree, &snapshot, &thread_id, retries, timeout)
                .await
        };
        let elapsed = clock.elapsed().as_millis() as u64;

        let mut first_failure: Option<ActionFailure> = None;
        let mut output = None;
        for (agent, outcome) in outcomes {
            let (result, error) =
                self.settle_remote(label, &agent, outcome, started_at, elapsed);
            self.record_action(node, &result, state).await;

            match error {
                Some(error) => {
                    let mut failure = ActionFailure::new(label, error);
                    failure.mark_recorded();
                    failure.log_once();
                    if first_failure.is_none() {
                        first_failure = Some(failure);
                    }
                }
                None => {
                    if output.is_none() {
                        output = result.output.clone();
                    }
                }
            }
        }
        self.phase(label, Phase::Recorded);

        match first_failure {
            Some(failure) if !continue_on_failure => Err(failure),
            _ => Ok(output),
        }
    }

    /// 把单个 Agent 的派发结果整理为 (结果, 错误)
    fn settle_remote(
        &self,
        label: &str,
        agent: &str,
        outcome: std::result::Result<ActionResult, TransportError>,
        started_at: DateTime<Utc>,
        elapsed: u64,
    ) -> (ActionResult, Option<ExecutorError>) {
        match outcome {
            Ok(result) if result.is_success() => (result, None),
            Ok(result) => {
                let error = match &result.error {
                    Some(payload) => ExecutorError::from_remote(agent, payload),
                    None => ExecutorError::RemoteExecution {
                        agent: agent.to_string(),
                        kind: "unknown".to_string(),
                        message: format!("{} 状态为 {}", result.action, result.status),
                    },
                };
                (result, Some(error))
            }
            Err(e) => {
                let error = ExecutorError::from(e);
                let result = ActionResult::failed(label, started_at, elapsed, error.to_payload())
                    .with_agent(agent);
                (result, Some(error))
            }
        }
    }

    /// 登记线程、同步派发、注销线程
    async fn send_once(
        &self,
        transport: &TransportManager,
        agent: &str,
        action: &Action,
        snapshot: &dtf_common::StateSnapshot,
        thread_id: &str,
        timeout: Option<Duration>,
    ) -> std::result::Result<ActionResult, TransportError> {
        transport.register(agent, thread_id, None).await?;
        let outcome = transport
            .send_action(agent, action, snapshot.clone(), timeout)
            .await;
        if let Err(e) = transport.unregister(agent, thread_id).await {
            debug!("注销线程 {} 失败: {}", thread_id, e);
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_with_retry(
        &self,
        transport: &TransportManager,
        agent: &str,
        action: &Action,
        snapshot: &dtf_common::StateSnapshot,
        thread_id: &str,
        retries: u32,
        timeout: Option<Duration>,
    ) -> std::result::Result<ActionResult, TransportError> {
        let mut attempt = 0;
        loop {
            match self
                .send_once(transport, agent, action, snapshot, thread_id, timeout)
                .await
            {
                Err(e) if e.is_retryable() && attempt < retries && !self.stop.is_stopped() => {
                    let delay = self.backoff.calculate_delay(attempt);
                    warn!(
                        "派发到 Agent {} 失败: {}，{:?} 后重试 ({}/{})",
                        agent,
                        e,
                        delay,
                        attempt + 1,
                        retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// 扇出派发到多个 Agent，结果通过回调汇总
    ///
    /// 每个在途请求有独立的截止时间，到期后按超时失败处理并走重试策略。
    #[allow(clippy::too_many_arguments)]
    async fn fan_out(
        &self,
        transport: &TransportManager,
        agents: &[String],
        action: &Action,
        snapshot: &dtf_common::StateSnapshot,
        thread_id: &str,
        retries: u32,
        timeout: Option<Duration>,
    ) -> Vec<AgentOutcome> {
        let timeout = timeout.unwrap_or_else(|| transport.config().request_timeout());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut outstanding = 0usize;
        let mut in_flight: Vec<InFlight> = Vec::with_capacity(agents.len());

        for agent in agents {
            if let Some(id) = self
                .launch(transport, agent, 0, action, snapshot, thread_id, &tx)
                .await
            {
                in_flight.push((agent.clone(), id, TokioInstant::now() + timeout));
            }
            outstanding += 1;
        }

        let mut outcomes = Vec::with_capacity(agents.len());
        while outstanding > 0 {
            let next_deadline = in_flight.iter().map(|(_, _, deadline)| *deadline).min();
            let received = match next_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        // 到期的请求由 expire 经回调送回超时错误
                        let now = TokioInstant::now();
                        let (expired, alive): (Vec<_>, Vec<_>) = in_flight
                            .drain(..)
                            .partition(|(_, _, deadline)| *deadline <= now);
                        in_flight = alive;
                        for (agent, id, _) in expired {
                            transport.expire(&agent, &id).await;
                        }
                        continue;
                    }
                },
                None => rx.recv().await,
            };
            let Some((agent, attempt, outcome)) = received else {
                break;
            };
            outstanding -= 1;
            in_flight.retain(|(name, _, _)| name != &agent);

            match outcome {
                Err(e) if e.is_retryable() && attempt < retries && !self.stop.is_stopped() => {
                    let delay = self.backoff.calculate_delay(attempt);
                    warn!(
                        "派发到 Agent {} 失败: {}，{:?} 后重试 ({}/{})",
                        agent,
                        e,
                        delay,
                        attempt + 1,
                        retries
                    );
                    tokio::time::sleep(delay).await;
                    if let Some(id) = self
                        .launch(transport, &agent, attempt + 1, action, snapshot, thread_id, &tx)
                        .await
                    {
                        in_flight.push((agent.clone(), id, TokioInstant::now() + timeout));
                    }
                    outstanding += 1;
                }
                other => outcomes.push((agent, other)),
            }
        }

        for agent in agents {
            if let Err(e) = transport.unregister(agent, thread_id).await {
                debug!("注销线程 {} 失败: {}", thread_id, e);
            }
        }

        // 按目标顺序返回
        outcomes.sort_by_key(|(agent, _)| agents.iter().position(|a| a == agent));
        outcomes
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        transport: &TransportManager,
        agent: &str,
        attempt: u32,
        action: &Action,
        snapshot: &dtf_common::StateSnapshot,
        thread_id: &str,
        tx: &mpsc::UnboundedSender<(String, u32, std::result::Result<ActionResult, TransportError>)>,
    ) -> Option<Uuid> {
        let callback = Box::new(FanOutCallback {
            agent: agent.to_string(),
            attempt,
            tx: tx.clone(),
        });

        let submitted = match transport.register(agent, thread_id, None).await {
            Ok(()) => {
                transport
                    .send_action_async(agent, action, snapshot.clone(), callback)
                    .await
            }
            Err(e) => Err(e),
        };

        // 未登记成功的请求不会触发回调，由这里补发结果
        match submitted {
            Ok(id) => Some(id),
            Err(e) => {
                let _ = tx.send((agent.to_string(), attempt, Err(e)));
                None
            }
        }
    }

    // ==================== 叶子动作 ====================

    fn evaluate(&self, kind: &ActionKind, state: &ExecutionState) -> crate::Result<LeafOp> {
        let op = match kind {
            ActionKind::Log { message, level } => LeafOp::Log {
                message: message.resolve(state),
                level: level.clone().unwrap_or_else(|| "info".to_string()),
            },
            ActionKind::Property {
                name,
                value,
                overwrite,
            } => LeafOp::Property {
                name: name.clone(),
                value: value.resolve(state),
                overwrite: *overwrite,
            },
            ActionKind::Sleep { millis } => LeafOp::Sleep(millis.resolve_millis("millis", state)?),
            ActionKind::Exec {
                command,
                args,
                property,
                expect_exit,
            } => LeafOp::Exec {
                command: command.resolve(state),
                args: args.iter().map(|a| a.resolve(state)).collect(),
                property: property.clone(),
                expect_exit: expect_exit.unwrap_or(0),
            },
            ActionKind::Fail { message } => LeafOp::Fail(message.resolve(state)),
            ActionKind::Record { event, attributes } => {
                let mut record = Event::new(&event.resolve(state));
                for (key, value) in attributes {
                    let value = parse_attr_value(key, &value.resolve(state))?;
                    record.attributes.insert(key.clone(), value);
                }
                LeafOp::Record(record)
            }
            ActionKind::RecordProperty { name, value } => LeafOp::RecordProperty {
                name: name.resolve(state),
                value: value.resolve(state),
            },
            ActionKind::Stats { event, output } => LeafOp::Stats {
                event: event.resolve(state),
                output: output.clone(),
            },
            ActionKind::StoreObject {
                data,
                metadata,
                property,
            } => LeafOp::StoreObject {
                data: data.resolve(state),
                metadata: metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(state)))
                    .collect(),
                property: property.clone(),
            },
            ActionKind::RetrieveObject { oid, property } => LeafOp::RetrieveObject {
                oid: oid.resolve(state),
                property: property.clone(),
            },
            ActionKind::Query { query, property } => LeafOp::Query {
                query: query.resolve(state),
                property: property.clone(),
            },
            ActionKind::SelectUnique { query, property } => LeafOp::SelectUnique {
                query: query.resolve(state),
                property: property.clone(),
            },
            ActionKind::GetMetadata { oid, property } => LeafOp::GetMetadata {
                oid: oid.resolve(state),
                property: property.clone(),
            },
            ActionKind::Custom { handler, params } => LeafOp::Custom {
                handler: handler.clone(),
                params: params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(state)))
                    .collect(),
            },
            ActionKind::Ref => {
                return Err(ExecutorError::Reference("ref 节点缺少 refid".to_string()))
            }
            other => {
                return Err(ExecutorError::Config(format!(
                    "{} 不是叶子动作",
                    other.tag()
                )))
            }
        };
        Ok(op)
    }

    async fn run_leaf(&self, op: LeafOp, stack: &mut StateStack) -> crate::Result<Option<String>> {
        match op {
            LeafOp::Log { message, level } => {
                self.emit_log(&level, &message, stack.current());
                Ok(None)
            }

            LeafOp::Property {
                name,
                value,
                overwrite,
            } => {
                stack.current_mut().set_property(&name, &value, overwrite);
                Ok(None)
            }

            LeafOp::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(None),
                    _ = self.stop.stopped() => Err(ExecutorError::Stopped),
                }
            }

            LeafOp::Exec {
                command,
                args,
                property,
                expect_exit,
            } => {
                let output = tokio::process::Command::new(&command)
                    .args(&args)
                    .output()
                    .await?;
                let code = output.status.code().unwrap_or(-1);
                let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                if code != expect_exit {
                    return Err(ExecutorError::ActionFailed(format!(
                        "命令 {} 退出码 {} (期望 {}): {}",
                        command,
                        code,
                        expect_exit,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                self.store_output(stack, property.as_deref(), &stdout);
                Ok(Some(stdout))
            }

            LeafOp::Fail(message) => Err(ExecutorError::ActionFailed(message)),

            LeafOp::Record(event) => {
                self.recorder.record(event).await;
                Ok(None)
            }

            LeafOp::RecordProperty { name, value } => {
                self.recorder.record_property(&name, &value).await;
                Ok(None)
            }

            LeafOp::Stats { event, output } => {
                let cursor = self.recorder.cursor(&EventQuery::named(&event)).await;
                let report = calc_stats(&cursor, &format!("{}.stats", event));
                if let Some(prefix) = &output {
                    let state = stack.current_mut();
                    for (key, value) in &report.event.attributes {
                        state.set_property(&format!("{}.{}", prefix, key), &value.to_string(), true);
                    }
                }
                let summary = serde_json::to_string(&report.event.attributes).ok();
                self.recorder.record(report.event).await;
                Ok(summary)
            }

            LeafOp::StoreObject {
                data,
                metadata,
                property,
            } => {
                let oid = self.archive()?.store_object(data.as_bytes(), &metadata).await?;
                self.store_output(stack, property.as_deref(), &oid);
                Ok(Some(oid))
            }

            LeafOp::RetrieveObject { oid, property } => {
                let data = self.archive()?.retrieve_object(&oid).await?;
                let text = String::from_utf8_lossy(&data).to_string();
                self.store_output(stack, property.as_deref(), &text);
                Ok(Some(text))
            }

            LeafOp::Query { query, property } => {
                let hits = self.archive()?.query(&query).await?.join(",");
                self.store_output(stack, property.as_deref(), &hits);
                Ok(Some(hits))
            }

            LeafOp::SelectUnique { query, property } => {
                let oid = self.archive()?.select_unique(&query).await?;
                self.store_output(stack, property.as_deref(), &oid);
                Ok(Some(oid))
            }

            LeafOp::GetMetadata { oid, property } => {
                let metadata = self.archive()?.get_metadata(&oid).await?;
                let json = serde_json::to_string(&metadata)
                    .map_err(|e| ExecutorError::Archive(e.to_string()))?;
                self.store_output(stack, property.as_deref(), &json);
                Ok(Some(json))
            }

            LeafOp::Custom { handler, params } => {
                let plugin = self.plugins.get(&handler).await?;
                plugin.execute(&params).await
            }
        }
    }

    fn archive(&self) -> crate::Result<&Arc<dyn ArchiveClient>> {
        self.archive
            .as_ref()
            .ok_or_else(|| ExecutorError::Config("未配置存储客户端".to_string()))
    }

    fn store_output(&self, stack: &mut StateStack, property: Option<&str>, value: &str) {
        if let Some(property) = property {
            stack.current_mut().set_property(property, value, true);
        }
    }

    fn emit_log(&self, level: &str, message: &str, state: &ExecutionState) {
        let thread = state.thread_id();
        let agent = self.agent_name.as_deref().unwrap_or("local");
        match level {
            "error" => error!(thread = %thread, agent = %agent, "{}", message),
            "warn" => warn!(thread = %thread, agent = %agent, "{}", message),
            "debug" => debug!(thread = %thread, agent = %agent, "{}", message),
            "trace" => trace!(thread = %thread, agent = %agent, "{}", message),
            _ => info!(thread = %thread, agent = %agent, "{}", message),
        }

        if let (Some(forwarder), Some(remote_thread)) = (
            &self.log_forwarder,
            state.global_context(context_keys::REMOTE_THREAD),
        ) {
            forwarder.forward(RemoteLogRecord {
                thread_id: remote_thread.to_string(),
                agent: agent.to_string(),
                level: level.to_string(),
                message: message.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "false" | "0" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtf_common::{ActionStatus, AttrValue};
    use dtf_script::parse;

    async fn run(source: &str) -> (Outcome, Arc<Recorder>, StateStack) {
        let script = parse(source).unwrap();
        let recorder = Arc::new(Recorder::new());
        let dispatcher = Dispatcher::new(script.refs.clone(), recorder.clone());
        let mut stack = StateStack::new(ExecutionState::with_defaults(
            "main",
            script.properties.clone(),
        ));
        let outcome = dispatcher.execute(&script.root, &mut stack).await;
        (outcome, recorder, stack)
    }

    async fn action_events(recorder: &Recorder) -> Vec<Event> {
        recorder.cursor(&EventQuery::named(ACTION_EVENT)).await.into_vec()
    }

    #[tokio::test]
    async fn test_sequence_stops_at_first_failure() {
        let (outcome, recorder, _) = run(r#"
name: seq
actions:
  - { type: log, label: A, message: a }
  - { type: fail, label: B, message: boom }
  - { type: log, label: C, message: c }
"#)
        .await;

        let failure = outcome.unwrap_err();
        assert!(failure.is_logged());
        assert_eq!(failure.action, "B");

        let events = action_events(&recorder).await;
        let labels: Vec<_> = events.iter().filter_map(|e| e.text("action")).collect();
        assert_eq!(labels, vec!["A", "B"]);
        assert_eq!(events[1].text("status"), Some("failed"));
        assert_eq!(events[1].text("error_kind"), Some("action_failed"));
    }

    #[tokio::test]
    async fn test_parallel_continue_on_failure_runs_all() {
        let (outcome, recorder, _) = run(r#"
name: par
actions:
  - type: parallel
    continue_on_failure: true
    actions:
      - { type: log, label: A, message: a }
      - { type: fail, label: B, message: boom }
      - { type: log, label: C, message: c }
"#)
        .await;

        assert!(outcome.is_ok());
        let events = action_events(&recorder).await;
        assert_eq!(events.len(), 3);
        let failed = events
            .iter()
            .filter(|e| e.text("status") == Some("failed"))
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_parallel_skips_unstarted_after_failure() {
        let (outcome, recorder, _) = run(r#"
name: par
actions:
  - type: parallel
    max_concurrent: 1
    actions:
      - { type: fail, label: A, message: boom }
      - { type: log, label: B, message: b }
      - { type: log, label: C, message: c }
"#)
        .await;

        assert!(outcome.is_err());
        assert_eq!(action_events(&recorder).await.len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_branches_do_not_leak_properties() {
        let (outcome, _, stack) = run(r#"
name: par
actions:
  - type: parallel
    actions:
      - { type: property, name: p, value: "1" }
"#)
        .await;

        assert!(outcome.is_ok());
        assert_eq!(stack.current().property("p"), None);
    }

    #[tokio::test]
    async fn test_reference_executes_target_in_place() {
        let (outcome, recorder, stack) = run(r#"
name: refs
properties:
  greeting: hi
actions:
  - type: sequence
    id: frag
    actions:
      - { type: property, name: seen, value: "${greeting}" }
  - { type: ref, refid: frag }
"#)
        .await;

        assert!(outcome.is_ok());
        assert_eq!(stack.current().property("seen"), Some("hi"));
        // 片段本身被直接遇到时不产生事件
        assert_eq!(action_events(&recorder).await.len(), 1);
    }

    #[tokio::test]
    async fn test_dangling_reference_has_no_side_effects() {
        let (outcome, recorder, stack) = run(r#"
name: dangling
actions:
  - { type: ref, refid: missing }
  - { type: property, name: after, value: "x" }
"#)
        .await;

        let failure = outcome.unwrap_err();
        assert!(matches!(failure.error, ExecutorError::Reference(_)));
        assert!(action_events(&recorder).await.is_empty());
        assert_eq!(stack.current().property("after"), None);
    }

    #[tokio::test]
    async fn test_loop_sets_index_property() {
        let (outcome, recorder, stack) = run(r#"
name: loop
properties:
  n: "3"
actions:
  - type: loop
    count: "${n}"
    property: i
    actions:
      - { type: record, event: tick, attributes: { idx: "int:${i}" } }
"#)
        .await;

        assert!(outcome.is_ok());
        let ticks = recorder.cursor(&EventQuery::named("tick")).await;
        let idx: Vec<_> = ticks.iter().filter_map(|e| e.attr("idx").cloned()).collect();
        assert_eq!(idx, vec![AttrValue::Int(0), AttrValue::Int(1), AttrValue::Int(2)]);
        assert_eq!(stack.current().property("i"), Some("2"));
    }

    #[tokio::test]
    async fn test_invalid_loop_count_is_attribute_error() {
        let (outcome, recorder, _) = run(r#"
name: loop
actions:
  - type: loop
    label: L
    count: many
    actions: []
"#)
        .await;

        let failure = outcome.unwrap_err();
        assert!(matches!(failure.error, ExecutorError::Attribute { .. }));
        let events = action_events(&recorder).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text("action"), Some("L"));
    }

    #[tokio::test]
    async fn test_if_branches() {
        let (outcome, _, stack) = run(r#"
name: cond
properties:
  mode: fast
actions:
  - type: if
    property: mode
    equals: fast
    then:
      - { type: property, name: picked, value: then }
    else:
      - { type: property, name: picked, value: else }
  - type: if
    property: undefined_flag
    then:
      - { type: property, name: flag, value: set }
"#)
        .await;

        assert!(outcome.is_ok());
        assert_eq!(stack.current().property("picked"), Some("then"));
        assert_eq!(stack.current().property("flag"), None);
    }

    #[tokio::test]
    async fn test_stats_action_writes_properties() {
        let (outcome, recorder, stack) = run(r#"
name: stats
actions:
  - { type: record, event: put, attributes: { size: "int:1" } }
  - { type: record, event: put, attributes: { size: "int:2" } }
  - { type: record, event: put, attributes: { size: "int:3" } }
  - { type: record, event: put, attributes: { size: "int:4" } }
  - { type: stats, event: put, output: put }
"#)
        .await;

        assert!(outcome.is_ok());
        assert_eq!(stack.current().property("put.size.avg"), Some("2.5"));
        assert_eq!(stack.current().property("put.count"), Some("4"));
        assert_eq!(recorder.cursor(&EventQuery::named("put.stats")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_without_transport_fails() {
        let (outcome, recorder, _) = run(r#"
name: remote
actions:
  - type: remote
    label: R
    target: master
    actions:
      - { type: log, message: x }
"#)
        .await;

        let failure = outcome.unwrap_err();
        assert!(matches!(failure.error, ExecutorError::Config(_)));
        let events = action_events(&recorder).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text("status"), Some(ActionStatus::Failed.as_str()));
    }

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let script = parse(
            r#"
name: long
actions:
  - { type: sleep, millis: "60000" }
  - { type: log, message: never }
"#,
        )
        .unwrap();
        let recorder = Arc::new(Recorder::new());
        let stop = StopHandle::new();
        let dispatcher =
            Dispatcher::new(script.refs.clone(), recorder.clone()).with_stop(stop.clone());

        let handle = tokio::spawn(async move {
            let mut stack = StateStack::new(ExecutionState::new("main"));
            dispatcher.execute(&script.root, &mut stack).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.unwrap_err().is_stopped());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_captures_stdout() {
        let (outcome, _, stack) = run(r#"
name: exec
actions:
  - { type: exec, command: echo, args: [hello], property: out }
  - { type: exec, command: "false", expect_exit: 1 }
"#)
        .await;

        assert!(outcome.is_ok());
        assert_eq!(stack.current().property("out"), Some("hello"));
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy("yes"));
        assert!(is_truthy("1"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
    }
}
