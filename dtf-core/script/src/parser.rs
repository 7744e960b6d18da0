//! 脚本解析
//!
//! 解析只做结构校验，`refid` 到目标节点的查找推迟到执行期。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::{Action, ActionKind, Result, ScriptError, Template};

/// 脚本文件的序列化形式
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScriptDocument {
    name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,

    #[serde(default)]
    properties: BTreeMap<String, Template>,

    #[serde(default)]
    actions: Vec<Action>,
}

/// 已解析的测试脚本
#[derive(Debug, Clone)]
pub struct Script {
    /// 脚本名称
    pub name: String,

    /// 描述
    pub description: Option<String>,

    /// 初始属性 (作为执行状态的默认值)
    pub properties: BTreeMap<String, String>,

    /// 根动作 (顺序容器)
    pub root: Action,

    /// 可引用节点索引
    pub refs: Arc<ReferenceIndex>,
}

impl Script {
    /// 从文件加载脚本
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        parse(&source)
    }

    /// 序列化为 YAML
    pub fn to_yaml(&self) -> Result<String> {
        let actions = match &self.root.kind {
            ActionKind::Sequence { actions, .. } => actions.clone(),
            _ => vec![self.root.clone()],
        };
        let doc = ScriptDocument {
            name: self.name.clone(),
            description: self.description.clone(),
            properties: self
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), Template::new(v)))
                .collect(),
            actions,
        };
        serde_yaml::to_string(&doc).map_err(|e| ScriptError::Parse(e.to_string()))
    }
}

/// 解析脚本源码
pub fn parse(source: &str) -> Result<Script> {
    let doc: ScriptDocument =
        serde_yaml::from_str(source).map_err(|e| ScriptError::Parse(e.to_string()))?;

    let root = Action::sequence(doc.actions).named(&doc.name);
    validate(&root)?;
    let refs = ReferenceIndex::build(&root)?;

    debug!(
        "脚本 {} 解析完成: {} 个节点, {} 个可引用片段",
        doc.name,
        root.node_count(),
        refs.len()
    );

    Ok(Script {
        name: doc.name,
        description: doc.description,
        properties: doc
            .properties
            .into_iter()
            .map(|(k, v)| (k, v.raw().to_string()))
            .collect(),
        root,
        refs: Arc::new(refs),
    })
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("id 正则无效"))
}

/// 结构校验
pub fn validate(root: &Action) -> Result<()> {
    let mut seen = HashSet::new();
    validate_node(root, &mut seen)
}

fn validate_node(action: &Action, seen: &mut HashSet<String>) -> Result<()> {
    let label = action.label();

    if let Some(id) = &action.id {
        if !id_pattern().is_match(id) {
            return Err(ScriptError::Parse(format!("{}: 无效的 id '{}'", label, id)));
        }
        if !seen.insert(id.clone()) {
            return Err(ScriptError::Parse(format!("重复的 id '{}'", id)));
        }
    }

    if let Some(refid) = &action.refid {
        if !id_pattern().is_match(refid) {
            return Err(ScriptError::Parse(format!(
                "{}: 无效的 refid '{}'",
                label, refid
            )));
        }
        if action.id.is_some() {
            return Err(ScriptError::Parse(format!(
                "{}: 不能同时声明 id 和 refid",
                label
            )));
        }
        if !action.kind.children().is_empty() {
            return Err(ScriptError::Parse(format!(
                "{}: 引用节点不能包含子动作",
                label
            )));
        }
    } else if matches!(action.kind, ActionKind::Ref) {
        return Err(ScriptError::Parse(format!("{}: ref 节点缺少 refid", label)));
    }

    if let ActionKind::Parallel {
        max_concurrent: Some(0),
        ..
    } = action.kind
    {
        return Err(ScriptError::Parse(format!(
            "{}: max_concurrent 必须大于 0",
            label
        )));
    }

    for child in action.kind.children() {
        validate_node(child, seen)?;
    }
    Ok(())
}

/// 可引用节点索引
///
/// 只收录声明了 `id` 的节点，因此指向未声明 `id` 的节点的引用
/// 同样表现为查找失败。
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    nodes: HashMap<String, Action>,
}

impl ReferenceIndex {
    /// 从动作树构建索引，并拒绝循环引用
    pub fn build(root: &Action) -> Result<Self> {
        let mut index = Self::default();
        index.collect(root);
        index.check_cycles()?;
        Ok(index)
    }

    fn collect(&mut self, action: &Action) {
        if let Some(id) = &action.id {
            self.nodes.insert(id.clone(), action.clone());
        }
        for child in action.kind.children() {
            self.collect(child);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// 查找引用目标
    pub fn resolve(&self, refid: &str) -> Result<&Action> {
        self.nodes
            .get(refid)
            .ok_or_else(|| ScriptError::Reference(format!("找不到可引用节点 '{}'", refid)))
    }

    /// 内联展开子树中的所有引用
    ///
    /// 展开后的子树不含 `refid`，直接到达的可引用片段 (空操作) 被剔除，
    /// 用于远程派发时脱离本地索引独立执行。
    pub fn expand(&self, action: &Action) -> Result<Action> {
        let mut out = match &action.refid {
            Some(refid) => {
                let mut target = self.resolve(refid)?.clone();
                target.id = None;
                if action.name.is_some() {
                    target.name = action.name.clone();
                }
                target
            }
            None => action.clone(),
        };
        self.expand_children(&mut out)?;
        Ok(out)
    }

    fn expand_children(&self, action: &mut Action) -> Result<()> {
        match &mut action.kind {
            ActionKind::Sequence { actions, .. }
            | ActionKind::Parallel { actions, .. }
            | ActionKind::Loop { actions, .. }
            | ActionKind::Remote { actions, .. } => {
                *actions = self.expand_list(actions)?;
            }
            ActionKind::If {
                then, otherwise, ..
            } => {
                *then = self.expand_list(then)?;
                *otherwise = self.expand_list(otherwise)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn expand_list(&self, actions: &[Action]) -> Result<Vec<Action>> {
        actions
            .iter()
            .filter(|a| !a.is_referencable())
            .map(|a| self.expand(a))
            .collect()
    }

    fn check_cycles(&self) -> Result<()> {
        let mut done = HashSet::new();
        for id in self.nodes.keys() {
            let mut path = Vec::new();
            self.visit(id, &mut path, &mut done)?;
        }
        Ok(())
    }

    fn visit(&self, id: &str, path: &mut Vec<String>, done: &mut HashSet<String>) -> Result<()> {
        if done.contains(id) {
            return Ok(());
        }
        if path.iter().any(|p| p == id) {
            path.push(id.to_string());
            return Err(ScriptError::Parse(format!("循环引用: {}", path.join(" -> "))));
        }
        let Some(node) = self.nodes.get(id) else {
            // 悬空引用留到执行期报错
            return Ok(());
        };

        path.push(id.to_string());
        let mut refids = Vec::new();
        collect_refids(node, &mut refids);
        for refid in refids {
            self.visit(&refid, path, done)?;
        }
        path.pop();
        done.insert(id.to_string());
        Ok(())
    }
}

fn collect_refids(action: &Action, out: &mut Vec<String>) {
    if let Some(refid) = &action.refid {
        out.push(refid.clone());
    }
    for child in action.kind.children() {
        collect_refids(child, out);
    }
}
