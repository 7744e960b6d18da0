//! 属性模板
//!
//! 动作属性在解析时保持原样，`${name}` 占位符在执行时针对当前
//! 执行状态求值。`$${` 表示字面量 `${`，未定义的属性保留原样。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::{Result, ScriptError};

/// 属性查询接口
pub trait PropertyLookup {
    fn lookup(&self, name: &str) -> Option<String>;
}

impl PropertyLookup for BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl PropertyLookup for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// 带占位符的属性值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TemplateRepr", into = "String")]
pub struct Template(String);

/// 脚本中允许直接书写数字或布尔值
#[derive(Deserialize)]
#[serde(untagged)]
enum TemplateRepr {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<TemplateRepr> for Template {
    fn from(repr: TemplateRepr) -> Self {
        match repr {
            TemplateRepr::Text(s) => Template(s),
            TemplateRepr::Int(v) => Template(v.to_string()),
            TemplateRepr::Float(v) => Template(v.to_string()),
            TemplateRepr::Bool(v) => Template(v.to_string()),
        }
    }
}

impl From<Template> for String {
    fn from(template: Template) -> Self {
        template.0
    }
}

impl From<&str> for Template {
    fn from(value: &str) -> Self {
        Template(value.to_string())
    }
}

impl Template {
    pub fn new(raw: &str) -> Self {
        Template(raw.to_string())
    }

    /// 原始文本
    pub fn raw(&self) -> &str {
        &self.0
    }

    /// 模板引用的属性名
    pub fn references(&self) -> Vec<String> {
        let mut names = Vec::new();
        scan(&self.0, |name| {
            names.push(name.to_string());
            None
        });
        names
    }

    /// 替换占位符
    pub fn resolve(&self, props: &dyn PropertyLookup) -> String {
        scan(&self.0, |name| props.lookup(name))
    }

    /// 解析为无符号整数
    pub fn resolve_u64(&self, attribute: &str, props: &dyn PropertyLookup) -> Result<u64> {
        let value = self.resolve(props);
        value.trim().parse::<u64>().map_err(|_| {
            ScriptError::attribute(attribute, format!("'{}' 不是有效的非负整数", value))
        })
    }

    /// 解析为浮点数
    pub fn resolve_f64(&self, attribute: &str, props: &dyn PropertyLookup) -> Result<f64> {
        let value = self.resolve(props);
        value
            .trim()
            .parse::<f64>()
            .map_err(|_| ScriptError::attribute(attribute, format!("'{}' 不是有效的数值", value)))
    }

    /// 解析为布尔值
    pub fn resolve_bool(&self, attribute: &str, props: &dyn PropertyLookup) -> Result<bool> {
        let value = self.resolve(props);
        match value.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(ScriptError::attribute(
                attribute,
                format!("'{}' 不是有效的布尔值", value),
            )),
        }
    }

    /// 解析为毫秒时长
    pub fn resolve_millis(&self, attribute: &str, props: &dyn PropertyLookup) -> Result<Duration> {
        self.resolve_u64(attribute, props).map(Duration::from_millis)
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 扫描模板，对每个 `${name}` 调用 `replace`，返回 None 时保留原占位符
fn scan(input: &str, mut replace: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("$${") {
            out.push_str("${");
            rest = &tail[3..];
            continue;
        }

        if tail.starts_with("${") {
            if let Some(end) = tail.find('}') {
                let name = &tail[2..end];
                match replace(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
                continue;
            }
        }

        // 孤立的 `$` 或未闭合的占位符
        out.push('$');
        rest = &tail[1..];
    }

    out.push_str(rest);
    out
}
