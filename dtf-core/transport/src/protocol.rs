//! 线路协议
//!
//! WebSocket 文本帧承载 JSON 编码的 `WireMessage`。

use dtf_common::{ActionResult, RemoteLogRecord, StateSnapshot};
use dtf_script::Action;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::{Result, TransportError};

/// 线路消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    /// 调度端连接后的第一帧
    Hello { client_id: String },

    /// 执行请求
    Request {
        correlation_id: Uuid,
        action: Action,
        state: StateSnapshot,
    },

    /// 执行结果
    Response {
        correlation_id: Uuid,
        result: ActionResult,
    },

    /// 登记调度端线程 (远程日志回推)
    Register { thread_id: String },

    /// 注销调度端线程
    Unregister { thread_id: String },

    /// Agent 主动推送的日志
    Log { record: RemoteLogRecord },
}

impl WireMessage {
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }

    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    /// 从无法完整解码的请求帧中取出关联 ID
    ///
    /// 只要帧是 JSON 对象且 `kind` 为 `request`，就能据此回复失败结果。
    pub fn request_correlation_id(text: &str) -> Option<Uuid> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        if value.get("kind")?.as_str()? != "request" {
            return None;
        }
        value.get("correlation_id")?.as_str()?.parse().ok()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::Log { .. } => "log",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtf_script::{ActionKind, Template};

    #[test]
    fn test_request_wire_shape() {
        let msg = WireMessage::Request {
            correlation_id: Uuid::new_v4(),
            action: Action::new(ActionKind::Log {
                message: Template::new("hi ${who}"),
                level: None,
            }),
            state: StateSnapshot::default(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "request");
        assert_eq!(json["action"]["type"], "log");
        assert_eq!(json["action"]["message"], "hi ${who}");

        let back = WireMessage::from_text(&json.to_string()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_correlation_id_survives_bad_action() {
        let id = Uuid::new_v4();
        let text = format!(
            r#"{{"kind":"request","correlation_id":"{}","action":{{"type":"teleport"}},"state":{{}}}}"#,
            id
        );
        assert!(WireMessage::from_text(&text).is_err());
        assert_eq!(WireMessage::request_correlation_id(&text), Some(id));

        let log = format!(r#"{{"kind":"log","correlation_id":"{}"}}"#, id);
        assert_eq!(WireMessage::request_correlation_id(&log), None);
        assert_eq!(WireMessage::request_correlation_id("not json"), None);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let err = WireMessage::from_text("{\"kind\":\"bogus\"}").unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
