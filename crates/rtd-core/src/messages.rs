//! Hub wire messages: the `{Type, Content, Counter}` envelope and the
//! payloads carried in `Content`.
//!
//! Field names follow the PascalCase JSON used by existing clients. Lowercase
//! aliases are accepted on input.

use crate::error::{RtdError, RtdResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric message type tags. Unknown tags are preserved in `Other` and
/// routed to the extension handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum MessageType {
    Subscribe,
    UpdateQueue,
    Crud,
    Ping,
    /// A worker connection announcing the workflow it serves.
    RegisterWorkflow,
    SaveStore,
    ProxyOpen,
    ProxyContent,
    ProxyClose,
    Other(i32),
}

impl From<MessageType> for i32 {
    fn from(m: MessageType) -> i32 {
        match m {
            MessageType::Subscribe => 1,
            MessageType::UpdateQueue => 11,
            MessageType::Crud => 14,
            MessageType::Ping => 15,
            MessageType::RegisterWorkflow => 16,
            MessageType::SaveStore => 19,
            MessageType::ProxyOpen => 20,
            MessageType::ProxyContent => 21,
            MessageType::ProxyClose => 22,
            MessageType::Other(v) => v,
        }
    }
}

impl From<i32> for MessageType {
    fn from(v: i32) -> Self {
        match v {
            1 => Self::Subscribe,
            11 => Self::UpdateQueue,
            14 => Self::Crud,
            15 => Self::Ping,
            16 => Self::RegisterWorkflow,
            19 => Self::SaveStore,
            20 => Self::ProxyOpen,
            21 => Self::ProxyContent,
            22 => Self::ProxyClose,
            other => Self::Other(other),
        }
    }
}

impl MessageType {
    /// Short label used in log fields.
    pub fn label(&self) -> &'static str {
        match self {
            MessageType::Subscribe => "subscribe",
            MessageType::UpdateQueue => "update_queue",
            MessageType::Crud => "crud",
            MessageType::Ping => "ping",
            MessageType::RegisterWorkflow => "register_workflow",
            MessageType::SaveStore => "save_store",
            MessageType::ProxyOpen => "proxy_open",
            MessageType::ProxyContent => "proxy_content",
            MessageType::ProxyClose => "proxy_close",
            MessageType::Other(_) => "extension",
        }
    }
}

/// The outer envelope of every hub message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtdMessage {
    #[serde(rename = "Type", alias = "type")]
    pub msg_type: MessageType,
    #[serde(rename = "Content", alias = "content", default)]
    pub content: Value,
    #[serde(
        rename = "Counter",
        alias = "counter",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub counter: Option<i64>,
}

impl RtdMessage {
    pub fn new(msg_type: MessageType, content: impl Into<Value>) -> Self {
        Self {
            msg_type,
            content: content.into(),
            counter: None,
        }
    }

    /// Heartbeat reply carrying the current server time.
    pub fn ping_reply(now: DateTime<Utc>) -> Self {
        Self::new(MessageType::Ping, now.to_rfc3339())
    }

    /// Decode an envelope from raw JSON text.
    pub fn decode(raw: &str) -> RtdResult<Self> {
        serde_json::from_str(raw).map_err(|e| RtdError::EnvelopeUndecodable(e.to_string()))
    }

    pub fn encode(&self) -> RtdResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode `Content` as a typed payload.
    ///
    /// Clients send either an embedded JSON value or a string holding the
    /// JSON-encoded payload; both are accepted.
    pub fn content_as<T: DeserializeOwned>(&self) -> RtdResult<T> {
        match serde_json::from_value::<T>(self.content.clone()) {
            Ok(v) => Ok(v),
            Err(direct) => match &self.content {
                Value::String(s) => serde_json::from_str(s).map_err(|e| {
                    RtdError::HandlerFault(format!(
                        "{} content: {e}",
                        self.msg_type.label()
                    ))
                }),
                _ => Err(RtdError::HandlerFault(format!(
                    "{} content: {direct}",
                    self.msg_type.label()
                ))),
            },
        }
    }

    /// `Content` as plain text: strings verbatim, other values JSON-encoded.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// A work-queue item shared on its topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueMessage {
    #[serde(rename = "ID", alias = "id", default)]
    pub id: String,
    #[serde(rename = "TopicID", alias = "topicID", alias = "topicId")]
    pub topic_id: String,
    #[serde(default)]
    pub message: Option<RtdMessage>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub executed: bool,
    #[serde(default, with = "lenient_timestamp")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_timestamp")]
    pub execution_timestamp: Option<DateTime<Utc>>,
}

impl QueueMessage {
    pub fn new(id: impl Into<String>, topic_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic_id: topic_id.into(),
            message: None,
            comment: None,
            executed: false,
            creation_timestamp: Some(Utc::now()),
            execution_timestamp: None,
        }
    }

    pub fn mark_executed(&mut self, at: DateTime<Utc>) {
        self.executed = true;
        self.execution_timestamp = Some(at);
    }
}

/// CRUD operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum CrudType {
    Create = 1,
    Read = 2,
    Update = 3,
    Delete = 4,
}

impl From<CrudType> for i32 {
    fn from(t: CrudType) -> i32 {
        t as i32
    }
}

impl TryFrom<i32> for CrudType {
    type Error = String;
    fn try_from(v: i32) -> Result<Self, String> {
        match v {
            1 => Ok(Self::Create),
            2 => Ok(Self::Read),
            3 => Ok(Self::Update),
            4 => Ok(Self::Delete),
            other => Err(format!("unknown CRUD type: {other}")),
        }
    }
}

/// An entity mutation addressed to a store topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudMessage {
    #[serde(rename = "TopicID", alias = "topicID", alias = "topicId")]
    pub topic_id: String,
    #[serde(rename = "ID", alias = "id", default)]
    pub id: String,
    #[serde(rename = "Type", alias = "type")]
    pub crud_type: CrudType,
    #[serde(rename = "Class", alias = "class", default)]
    pub class: Option<String>,
    #[serde(rename = "Value", alias = "value", default)]
    pub value: Value,
    #[serde(rename = "ValueType", alias = "valueType", default)]
    pub value_type: Option<String>,
    #[serde(rename = "ValueAssembly", alias = "valueAssembly", default)]
    pub value_assembly: Option<String>,
}

impl CrudMessage {
    /// Whether this mutation targets the given store class.
    pub fn targets_class(&self, class: &str) -> bool {
        self.class.as_deref() == Some(class)
    }
}

/// One forwarded request header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    #[serde(rename = "Key", alias = "key")]
    pub key: String,
    #[serde(rename = "Value", alias = "value", default)]
    pub value: String,
}

/// Payload of ProxyOpen / ProxyContent / ProxyClose.
///
/// For ProxyOpen `content` is the backend base URL; for ProxyContent it is
/// the payload to forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProxyRequest {
    #[serde(rename = "Url", alias = "url")]
    pub url: String,
    #[serde(rename = "Content", alias = "content", default)]
    pub content: Option<String>,
    #[serde(rename = "Headers", alias = "headers", default)]
    pub headers: Vec<HeaderPair>,
}

impl HttpProxyRequest {
    pub fn header_tuples(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|h| (h.key.clone(), h.value.clone()))
            .collect()
    }
}

/// Timestamps written either as RFC 3339 or as offset-less local
/// date-times (read as UTC).
mod lenient_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Some(naive.and_utc()))
            .map_err(serde::de::Error::custom)
    }
}
