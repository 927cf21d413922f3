use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::id::new_id;

/// Envelope wire format shared by every channel and the comms surface.
///
/// ```ignore
/// use protocol_runtime::envelope::{Envelope, address};
/// use serde_json::json;
///
/// let req = Envelope::request("start", json!({}), address::HUB, "worker:template_1a2b");
/// let line = serde_json::to_string(&req)?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: Kind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub input: Value,
    pub sender: String,
    pub receiver: String,
    pub message_id: String,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// Discriminant of an envelope. Only `Request` expects a reply.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Request,
    Response,
    Action,
    Status,
}

/// Commands the runtime itself understands, on the hub and in every protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Builtin {
    /// Readiness signal a protocol sends once its channel is up.
    Loaded,
    Start,
    Stop,
    /// Result a protocol hands back to its mother.
    Output,
    Activate,
    Deactivate,
    List,
    Ping,
}

impl From<Builtin> for String {
    fn from(b: Builtin) -> Self {
        b.as_ref().to_owned()
    }
}

impl Envelope {
    fn new(
        kind: Kind,
        command: Option<String>,
        input: Value,
        sender: impl Into<String>,
        receiver: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            command,
            input,
            sender: sender.into(),
            receiver: receiver.into(),
            message_id: new_id(),
            extra: Map::new(),
        }
    }

    /// A call expecting exactly one response.
    pub fn request(
        command: impl Into<String>,
        input: Value,
        sender: impl Into<String>,
        receiver: impl Into<String>,
    ) -> Self {
        Self::new(Kind::Request, Some(command.into()), input, sender, receiver)
    }

    /// Fire and forget.
    pub fn action(
        command: impl Into<String>,
        input: Value,
        sender: impl Into<String>,
        receiver: impl Into<String>,
    ) -> Self {
        Self::new(Kind::Action, Some(command.into()), input, sender, receiver)
    }

    pub fn status(
        command: impl Into<String>,
        input: Value,
        sender: impl Into<String>,
        receiver: impl Into<String>,
    ) -> Self {
        Self::new(Kind::Status, Some(command.into()), input, sender, receiver)
    }

    /// Successful reply to `request`: addresses swapped, same `message_id`.
    pub fn response_to(request: &Envelope, input: Value) -> Self {
        Self {
            kind: Kind::Response,
            command: request.command.clone(),
            input,
            sender: request.receiver.clone(),
            receiver: request.sender.clone(),
            message_id: request.message_id.clone(),
            extra: Map::new(),
        }
    }

    /// Failed reply to `request`, flagged with `extra.success = false`.
    pub fn failure_to(request: &Envelope, reason: impl Into<String>) -> Self {
        let mut rsp = Self::response_to(request, json!({ "error": reason.into() }));
        rsp.extra.insert("success".into(), Value::Bool(false));
        rsp
    }

    /// Readiness signal sent by a freshly connected protocol.
    pub fn loaded(sender: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self::new(Kind::Response, Some(Builtin::Loaded.into()), Value::Null, sender, receiver)
    }

    pub fn is_failure(&self) -> bool {
        self.kind == Kind::Response
            && matches!(self.extra.get("success"), Some(Value::Bool(false)))
    }

    pub fn is_loaded(&self) -> bool {
        self.kind == Kind::Response && self.command_is(Builtin::Loaded)
    }

    pub fn command_is(&self, builtin: Builtin) -> bool {
        self.command.as_deref() == Some(builtin.as_ref())
    }

    /// Error text of a failure response.
    pub fn failure_reason(&self) -> Option<&str> {
        if !self.is_failure() {
            return None;
        }
        self.input.get("error").and_then(Value::as_str)
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Routing prefixes. The longest registered prefix wins.
pub mod address {
    pub const HUB: &str = "hub";
    pub const CLIENT: &str = "client";
    pub const WORKER_PREFIX: &str = "worker:";
    pub const TAB_PREFIX: &str = "tab:";

    pub fn worker(worker_id: &str) -> String {
        format!("{WORKER_PREFIX}{worker_id}")
    }

    /// `worker:<id>` → `<id>`
    pub fn worker_id(address: &str) -> Option<&str> {
        address.strip_prefix(WORKER_PREFIX).filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_keeps_every_field() {
        let env = Envelope::request("start", json!({"query": "hi", "n": [1, 2]}), "hub", "worker:w_1")
            .with_extra("trace", json!("abc"));
        let line = env.encode().unwrap();
        assert_eq!(Envelope::decode(&line).unwrap(), env);
    }

    #[test]
    fn wire_shape_is_flat() {
        let env = Envelope::action("end_noise", json!({}), "worker:a", "tab:gpt").with_message_id("m1");
        let v: Value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            v,
            json!({
                "kind": "action",
                "command": "end_noise",
                "input": {},
                "sender": "worker:a",
                "receiver": "tab:gpt",
                "message_id": "m1",
                "extra": {}
            })
        );
    }

    #[test]
    fn missing_optional_fields_default() {
        let env = Envelope::decode(
            r#"{"kind":"status","sender":"client","receiver":"hub","message_id":"x"}"#,
        )
        .unwrap();
        assert_eq!(env.kind, Kind::Status);
        assert!(env.command.is_none());
        assert_eq!(env.input, Value::Null);
        assert!(env.extra.is_empty());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = r#"{"kind":"message","sender":"a","receiver":"b","message_id":"x"}"#;
        assert!(Envelope::decode(raw).is_err());
    }

    #[test]
    fn response_swaps_addresses() {
        let req = Envelope::request("start", json!({}), "hub", "worker:w").with_message_id("abc");
        let rsp = Envelope::response_to(&req, json!({"status": "ok"}));
        assert_eq!(rsp.kind, Kind::Response);
        assert_eq!(rsp.message_id, "abc");
        assert_eq!(rsp.sender, "worker:w");
        assert_eq!(rsp.receiver, "hub");
        assert!(!rsp.is_failure());

        let fail = Envelope::failure_to(&req, "boom");
        assert!(fail.is_failure());
        assert_eq!(fail.failure_reason(), Some("boom"));
    }

    #[test]
    fn loaded_signal() {
        let env = Envelope::loaded(address::worker("w"), address::HUB);
        assert!(env.is_loaded());
        assert_eq!(env.command.as_deref(), Some("loaded"));
    }

    #[test]
    fn builtin_parse() {
        let b: Builtin = "deactivate".parse().unwrap();
        assert_eq!(b, Builtin::Deactivate);
        assert_eq!(Builtin::Output.as_ref(), "output");
        assert!("nope".parse::<Builtin>().is_err());
    }

    #[test]
    fn worker_addresses() {
        assert_eq!(address::worker("abc"), "worker:abc");
        assert_eq!(address::worker_id("worker:abc"), Some("abc"));
        assert_eq!(address::worker_id("worker:"), None);
        assert_eq!(address::worker_id("tab:abc"), None);
    }
}
