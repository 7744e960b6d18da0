//! DTF 脚本模型
//!
//! 负责把声明式测试脚本解析为动作树，并提供执行期的属性替换与
//! 线程级执行状态。

pub mod action;
pub mod parser;
pub mod state;
pub mod template;

pub use action::{Action, ActionKind};
pub use parser::{parse, validate, ReferenceIndex, Script};
pub use state::{ExecutionState, StateStack};
pub use template::{PropertyLookup, Template};

use thiserror::Error;

/// 脚本层错误
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("脚本解析失败: {0}")]
    Parse(String),

    #[error("引用解析失败: {0}")]
    Reference(String),

    #[error("属性 {attribute} 取值无效: {message}")]
    Attribute { attribute: String, message: String },

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl ScriptError {
    pub fn attribute(attribute: &str, message: impl Into<String>) -> Self {
        Self::Attribute {
            attribute: attribute.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScriptError>;
