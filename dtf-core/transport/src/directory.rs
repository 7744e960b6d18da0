//! 节点目录
//!
//! 把逻辑选择器解析为 Agent 名称。每次解析都重新读取成员信息，
//! 因此主节点切换后立即生效。

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{AgentInfo, ConnectionPool, Result, TransportError};

/// Agent 选择器
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// 指定名称
    Named(String),
    /// 当前主节点
    Master,
    /// 随机一个
    Random,
    /// 随机且在耗尽前不重复
    RandomFullDeck,
    /// 全部存活节点
    All,
    /// 指定角色的全部存活节点
    Role(String),
    /// 按成员序号
    Index(usize),
}

impl Selector {
    /// 由目录在多个候选中挑选的选择器
    fn picks_from_pool(&self) -> bool {
        matches!(
            self,
            Self::Random | Self::RandomFullDeck | Self::All | Self::Role(_)
        )
    }
}

impl FromStr for Selector {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::Protocol("选择器不能为空".to_string()));
        }
        Ok(match s {
            "master" => Self::Master,
            "random" => Self::Random,
            "random-full-deck" => Self::RandomFullDeck,
            "all" => Self::All,
            _ => {
                if let Some(role) = s.strip_prefix("role:") {
                    Self::Role(role.to_string())
                } else if let Some(index) = s.strip_prefix("index:") {
                    let index = index.parse::<usize>().map_err(|_| {
                        TransportError::Protocol(format!("无效的序号选择器: {}", s))
                    })?;
                    Self::Index(index)
                } else {
                    Self::Named(s.to_string())
                }
            }
        })
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Master => f.write_str("master"),
            Self::Random => f.write_str("random"),
            Self::RandomFullDeck => f.write_str("random-full-deck"),
            Self::All => f.write_str("all"),
            Self::Role(role) => write!(f, "role:{}", role),
            Self::Index(index) => write!(f, "index:{}", index),
        }
    }
}

/// 集群成员
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub name: String,
    pub roles: Vec<String>,
    pub alive: bool,
}

/// 成员快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Membership {
    /// 按声明顺序排列的成员
    pub members: Vec<Member>,

    /// 当前主节点
    pub master: Option<String>,
}

impl Membership {
    fn alive(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.alive)
    }

    fn is_alive(&self, name: &str) -> bool {
        self.members.iter().any(|m| m.name == name && m.alive)
    }
}

/// 成员信息来源 (外部集群成员服务)
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn membership(&self) -> Result<Membership>;
}

/// 静态成员表
///
/// 由配置构建，存活状态与主节点可在运行期修改。
#[derive(Default)]
pub struct StaticMembership {
    inner: RwLock<Membership>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由 Agent 列表构建，带 `master` 角色的第一个 Agent 作为初始主节点
    pub fn from_agents(agents: &[AgentInfo]) -> Self {
        let members = agents
            .iter()
            .map(|a| Member {
                name: a.name.clone(),
                roles: a.roles.clone(),
                alive: true,
            })
            .collect::<Vec<_>>();
        let master = agents
            .iter()
            .find(|a| a.roles.iter().any(|r| r == "master"))
            .map(|a| a.name.clone());
        Self {
            inner: RwLock::new(Membership { members, master }),
        }
    }

    pub async fn add_member(&self, name: &str, roles: Vec<String>) {
        let mut inner = self.inner.write().await;
        inner.members.retain(|m| m.name != name);
        inner.members.push(Member {
            name: name.to_string(),
            roles,
            alive: true,
        });
    }

    pub async fn set_alive(&self, name: &str, alive: bool) {
        let mut inner = self.inner.write().await;
        if let Some(member) = inner.members.iter_mut().find(|m| m.name == name) {
            member.alive = alive;
        }
    }

    pub async fn set_master(&self, name: Option<&str>) {
        self.inner.write().await.master = name.map(str::to_string);
    }
}

#[async_trait]
impl MembershipSource for StaticMembership {
    async fn membership(&self) -> Result<Membership> {
        Ok(self.inner.read().await.clone())
    }
}

/// 节点目录
pub struct AgentDirectory {
    source: Arc<dyn MembershipSource>,

    /// 连接池，用于排除已判定不可达的 Agent
    pool: Option<Arc<ConnectionPool>>,

    /// random-full-deck 剩余的牌
    deck: Mutex<Vec<String>>,
}

impl AgentDirectory {
    pub fn new(source: Arc<dyn MembershipSource>) -> Self {
        Self {
            source,
            pool: None,
            deck: Mutex::new(Vec::new()),
        }
    }

    /// 随机、全部和按角色选择时跳过连接池标记为不可达的 Agent
    ///
    /// 指定名称、主节点和序号仍解析到原目标，派发时以 `AgentUnreachable` 快速失败。
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// 解析选择器
    pub async fn resolve(&self, selector: &Selector) -> Result<Vec<String>> {
        let mut membership = self.source.membership().await?;
        if let (Some(pool), true) = (&self.pool, selector.picks_from_pool()) {
            for member in membership.members.iter_mut().filter(|m| m.alive) {
                if pool.is_unreachable(&member.name).await {
                    debug!("跳过不可达的 Agent: {}", member.name);
                    member.alive = false;
                }
            }
        }
        let none = || TransportError::NoAvailableAgent(selector.to_string());

        let resolved: Vec<String> = match selector {
            Selector::Named(name) => {
                if !membership.members.iter().any(|m| &m.name == name) {
                    return Err(TransportError::UnknownAgent(name.clone()));
                }
                if membership.is_alive(name) {
                    vec![name.clone()]
                } else {
                    Vec::new()
                }
            }
            Selector::Master => membership
                .master
                .iter()
                .filter(|m| membership.is_alive(m))
                .cloned()
                .collect(),
            Selector::Random => {
                let alive: Vec<&Member> = membership.alive().collect();
                alive
                    .choose(&mut rand::thread_rng())
                    .map(|m| vec![m.name.clone()])
                    .unwrap_or_default()
            }
            Selector::RandomFullDeck => self.draw(&membership).into_iter().collect(),
            Selector::All => membership.alive().map(|m| m.name.clone()).collect(),
            Selector::Role(role) => membership
                .alive()
                .filter(|m| m.roles.iter().any(|r| r == role))
                .map(|m| m.name.clone())
                .collect(),
            Selector::Index(index) => membership
                .members
                .get(*index)
                .filter(|m| m.alive)
                .map(|m| vec![m.name.clone()])
                .unwrap_or_default(),
        };

        if resolved.is_empty() {
            return Err(none());
        }
        debug!("选择器 {} 解析为 {:?}", selector, resolved);
        Ok(resolved)
    }

    /// 从牌堆抽一张，牌堆耗尽后按当前存活成员重新洗牌
    fn draw(&self, membership: &Membership) -> Option<String> {
        let mut deck = match self.deck.lock() {
            Ok(deck) => deck,
            Err(poisoned) => poisoned.into_inner(),
        };

        deck.retain(|name| membership.is_alive(name));
        if deck.is_empty() {
            let mut fresh: Vec<String> = membership.alive().map(|m| m.name.clone()).collect();
            fresh.shuffle(&mut rand::thread_rng());
            *deck = fresh;
        }
        deck.pop()
    }
}
