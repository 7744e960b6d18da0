//! 执行状态
//!
//! 每个逻辑线程 (主脚本、并行分支、远程子执行) 持有一个 `ExecutionState`。
//! 子状态以父状态的属性为默认值，自身修改不会影响父状态。

use dtf_common::{context_keys, StateSnapshot};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::PropertyLookup;

/// 线程级执行状态
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    /// 继承自父状态的属性 (只读)
    defaults: Arc<BTreeMap<String, String>>,

    /// 本线程设置的属性
    local: BTreeMap<String, String>,

    /// 全局上下文
    global_context: BTreeMap<String, String>,

    /// 当前执行的动作标签
    current_action: Option<String>,

    /// 所属节点/Agent (用于日志)
    owner: Option<String>,
}

impl ExecutionState {
    pub fn new(thread_id: &str) -> Self {
        let mut state = Self::default();
        state.set_global_context(context_keys::THREAD_ID, thread_id);
        state
    }

    /// 以给定属性作为默认值创建
    pub fn with_defaults(thread_id: &str, defaults: BTreeMap<String, String>) -> Self {
        let mut state = Self::new(thread_id);
        state.defaults = Arc::new(defaults);
        state
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    /// 读取属性 (本线程优先)
    pub fn property(&self, name: &str) -> Option<&str> {
        self.local
            .get(name)
            .or_else(|| self.defaults.get(name))
            .map(String::as_str)
    }

    /// 设置属性
    ///
    /// 仅当属性不存在或 `overwrite` 为 true 时写入，返回写入前的值。
    pub fn set_property(&mut self, name: &str, value: &str, overwrite: bool) -> Option<String> {
        let previous = self.property(name).map(str::to_string);
        if previous.is_none() || overwrite {
            self.local.insert(name.to_string(), value.to_string());
        }
        previous
    }

    /// 合并后的属性视图
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut merged = (*self.defaults).clone();
        merged.extend(self.local.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    pub fn global_context(&self, key: &str) -> Option<&str> {
        self.global_context.get(key).map(String::as_str)
    }

    pub fn set_global_context(&mut self, key: &str, value: &str) {
        self.global_context
            .insert(key.to_string(), value.to_string());
    }

    pub fn thread_id(&self) -> &str {
        self.global_context(context_keys::THREAD_ID).unwrap_or("main")
    }

    pub fn current_action(&self) -> Option<&str> {
        self.current_action.as_deref()
    }

    pub fn set_current_action(&mut self, label: Option<String>) {
        self.current_action = label;
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// 派生子线程状态 (写时分离)
    pub fn branch(&self, suffix: &str) -> Self {
        let mut child = Self {
            defaults: Arc::new(self.properties()),
            local: BTreeMap::new(),
            global_context: self.global_context.clone(),
            current_action: None,
            owner: self.owner.clone(),
        };
        let thread_id = format!("{}.{}", self.thread_id(), suffix);
        child.set_global_context(context_keys::THREAD_ID, &thread_id);
        child
    }

    /// 远程派发所需的最小状态切片
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            properties: self.properties(),
            global_context: self.global_context.clone(),
        }
    }

    /// 从远程快照重建状态
    pub fn from_snapshot(snapshot: StateSnapshot, owner: &str) -> Self {
        Self {
            defaults: Arc::new(snapshot.properties),
            local: BTreeMap::new(),
            global_context: snapshot.global_context,
            current_action: None,
            owner: Some(owner.to_string()),
        }
    }
}

impl PropertyLookup for ExecutionState {
    fn lookup(&self, name: &str) -> Option<String> {
        self.property(name).map(str::to_string)
    }
}

/// 执行状态栈
///
/// 随逻辑任务显式传递。基础状态始终保留，`pop` 不会弹出它。
#[derive(Debug, Clone)]
pub struct StateStack {
    states: Vec<ExecutionState>,
}

impl StateStack {
    pub fn new(base: ExecutionState) -> Self {
        Self { states: vec![base] }
    }

    pub fn push(&mut self, state: ExecutionState) {
        self.states.push(state);
    }

    pub fn pop(&mut self) -> Option<ExecutionState> {
        if self.states.len() > 1 {
            self.states.pop()
        } else {
            None
        }
    }

    pub fn current(&self) -> &ExecutionState {
        // 栈底元素在构造时放入且不会被弹出
        &self.states[self.states.len() - 1]
    }

    pub fn current_mut(&mut self) -> &mut ExecutionState {
        let last = self.states.len() - 1;
        &mut self.states[last]
    }

    pub fn depth(&self) -> usize {
        self.states.len()
    }

    /// 以当前状态派生子线程的独立栈
    pub fn branch(&self, suffix: &str) -> Self {
        Self::new(self.current().branch(suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_property_overwrite_flag() {
        let mut state = ExecutionState::new("main");
        assert_eq!(state.set_property("x", "v1", false), None);
        assert_eq!(state.set_property("x", "v2", false), Some("v1".to_string()));
        assert_eq!(state.property("x"), Some("v1"));

        assert_eq!(state.set_property("x", "v2", true), Some("v1".to_string()));
        assert_eq!(state.property("x"), Some("v2"));
    }

    #[test]
    fn test_branch_is_copy_on_write() {
        let mut parent = ExecutionState::new("main");
        parent.set_property("shared", "p", false);

        let mut child = parent.branch("0");
        assert_eq!(child.property("shared"), Some("p"));
        assert_eq!(child.thread_id(), "main.0");

        child.set_property("shared", "c", true);
        child.set_property("only_child", "1", false);
        assert_eq!(child.property("shared"), Some("c"));
        assert_eq!(parent.property("shared"), Some("p"));
        assert_eq!(parent.property("only_child"), None);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut state = ExecutionState::with_defaults(
            "main",
            BTreeMap::from([("a".to_string(), "1".to_string())]),
        );
        state.set_property("b", "2", false);
        state.set_global_context(context_keys::REMOTE_THREAD, "main.r1");

        let restored = ExecutionState::from_snapshot(state.snapshot(), "agent-1");
        assert_eq!(restored.property("a"), Some("1"));
        assert_eq!(restored.property("b"), Some("2"));
        assert_eq!(
            restored.global_context(context_keys::REMOTE_THREAD),
            Some("main.r1")
        );
        assert_eq!(restored.owner(), Some("agent-1"));
    }

    #[test]
    fn test_stack_keeps_base() {
        let mut stack = StateStack::new(ExecutionState::new("main"));
        assert!(stack.pop().is_none());

        stack.push(ExecutionState::new("sub"));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.current().thread_id(), "sub");

        stack.current_mut().set_property("k", "v", false);
        let popped = stack.pop().unwrap();
        assert_eq!(popped.property("k"), Some("v"));
        assert_eq!(stack.current().thread_id(), "main");
        assert_eq!(stack.current().property("k"), None);
    }
}
