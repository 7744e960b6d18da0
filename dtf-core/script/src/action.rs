//! 动作树定义

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Template;

/// 动作节点
///
/// 每个节点要么是叶子操作，要么是子动作的容器。声明了 `id` 的节点是
/// 可引用片段，直接执行时为空操作，只有通过 `refid` 引用时才会执行。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// 节点名称 (用于日志和事件)，脚本中写作 `label`，
    /// 与 `property`/`record_property` 的 `name` 参数区分
    #[serde(default, rename = "label", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// 可引用 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// 引用的节点 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refid: Option<String>,

    /// 动作类型及参数
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// 动作类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    // ========================================
    // 容器
    // ========================================
    /// 顺序执行
    Sequence {
        #[serde(default)]
        actions: Vec<Action>,
        #[serde(default)]
        continue_on_failure: bool,
    },

    /// 并行执行
    Parallel {
        #[serde(default)]
        actions: Vec<Action>,
        #[serde(default)]
        continue_on_failure: bool,
        /// 最大并发数 (未设置时不限制)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrent: Option<usize>,
    },

    /// 循环
    Loop {
        count: Template,
        /// 迭代序号写入的属性名
        #[serde(default, skip_serializing_if = "Option::is_none")]
        property: Option<String>,
        #[serde(default)]
        actions: Vec<Action>,
    },

    /// 条件分支
    If {
        property: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        equals: Option<Template>,
        #[serde(default)]
        then: Vec<Action>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Action>,
    },

    /// 远程执行
    Remote {
        /// Agent 选择器
        target: Template,
        #[serde(default)]
        actions: Vec<Action>,
        #[serde(default)]
        continue_on_failure: bool,
        /// 通信失败时的重试次数
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retries: Option<Template>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<Template>,
    },

    /// 纯引用节点
    Ref,

    // ========================================
    // 叶子操作
    // ========================================
    /// 输出日志
    Log {
        message: Template,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<String>,
    },

    /// 设置属性
    Property {
        name: String,
        value: Template,
        #[serde(default)]
        overwrite: bool,
    },

    /// 等待
    Sleep { millis: Template },

    /// 执行外部命令
    Exec {
        command: Template,
        #[serde(default)]
        args: Vec<Template>,
        /// stdout 写入的属性名
        #[serde(default, skip_serializing_if = "Option::is_none")]
        property: Option<String>,
        /// 期望退出码 (默认 0)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_exit: Option<i32>,
    },

    /// 主动失败
    Fail { message: Template },

    /// 记录事件
    Record {
        event: Template,
        #[serde(default)]
        attributes: BTreeMap<String, Template>,
    },

    /// 记录测试属性
    RecordProperty { name: Template, value: Template },

    /// 事件统计
    Stats {
        event: Template,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },

    // ========================================
    // 存储集群客户端操作
    // ========================================
    /// 写入对象
    StoreObject {
        data: Template,
        #[serde(default)]
        metadata: BTreeMap<String, Template>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        property: Option<String>,
    },

    /// 读取对象
    RetrieveObject {
        oid: Template,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        property: Option<String>,
    },

    /// 元数据查询
    Query {
        query: Template,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        property: Option<String>,
    },

    /// 唯一查询
    SelectUnique {
        query: Template,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        property: Option<String>,
    },

    /// 获取元数据
    GetMetadata {
        oid: Template,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        property: Option<String>,
    },

    /// 插件动作
    Custom {
        handler: String,
        #[serde(default)]
        params: BTreeMap<String, Template>,
    },
}

impl ActionKind {
    /// 类型标签
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Sequence { .. } => "sequence",
            Self::Parallel { .. } => "parallel",
            Self::Loop { .. } => "loop",
            Self::If { .. } => "if",
            Self::Remote { .. } => "remote",
            Self::Ref => "ref",
            Self::Log { .. } => "log",
            Self::Property { .. } => "property",
            Self::Sleep { .. } => "sleep",
            Self::Exec { .. } => "exec",
            Self::Fail { .. } => "fail",
            Self::Record { .. } => "record",
            Self::RecordProperty { .. } => "record_property",
            Self::Stats { .. } => "stats",
            Self::StoreObject { .. } => "store_object",
            Self::RetrieveObject { .. } => "retrieve_object",
            Self::Query { .. } => "query",
            Self::SelectUnique { .. } => "select_unique",
            Self::GetMetadata { .. } => "get_metadata",
            Self::Custom { .. } => "custom",
        }
    }

    /// 是否为容器
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Self::Sequence { .. }
                | Self::Parallel { .. }
                | Self::Loop { .. }
                | Self::If { .. }
                | Self::Remote { .. }
        )
    }

    /// 所有子动作
    pub fn children(&self) -> Vec<&Action> {
        match self {
            Self::Sequence { actions, .. }
            | Self::Parallel { actions, .. }
            | Self::Loop { actions, .. }
            | Self::Remote { actions, .. } => actions.iter().collect(),
            Self::If {
                then, otherwise, ..
            } => then.iter().chain(otherwise.iter()).collect(),
            _ => Vec::new(),
        }
    }

    /// 所有子动作 (可变)
    pub fn children_mut(&mut self) -> Vec<&mut Action> {
        match self {
            Self::Sequence { actions, .. }
            | Self::Parallel { actions, .. }
            | Self::Loop { actions, .. }
            | Self::Remote { actions, .. } => actions.iter_mut().collect(),
            Self::If {
                then, otherwise, ..
            } => then.iter_mut().chain(otherwise.iter_mut()).collect(),
            _ => Vec::new(),
        }
    }
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            name: None,
            id: None,
            refid: None,
            kind,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_refid(mut self, refid: &str) -> Self {
        self.refid = Some(refid.to_string());
        self
    }

    /// 顺序容器
    pub fn sequence(actions: Vec<Action>) -> Self {
        Self::new(ActionKind::Sequence {
            actions,
            continue_on_failure: false,
        })
    }

    /// 引用节点
    pub fn reference(refid: &str) -> Self {
        Self::new(ActionKind::Ref).with_refid(refid)
    }

    /// 显示标签: name > type#id > type
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match (&self.id, &self.refid) {
            (Some(id), _) => format!("{}#{}", self.kind.tag(), id),
            (None, Some(refid)) => format!("{}->{}", self.kind.tag(), refid),
            (None, None) => self.kind.tag().to_string(),
        }
    }

    /// 是否为可引用片段
    pub fn is_referencable(&self) -> bool {
        self.id.is_some()
    }

    /// 节点总数 (含自身)
    pub fn node_count(&self) -> usize {
        1 + self
            .kind
            .children()
            .into_iter()
            .map(Action::node_count)
            .sum::<usize>()
    }
}
