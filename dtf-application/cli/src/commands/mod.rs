//! CLI 命令处理模块

pub mod agent;
pub mod common; // 公共工具函数
pub mod config;
pub mod output;
pub mod report;
pub mod run;
pub mod validate;
