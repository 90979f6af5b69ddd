use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::SqlBridgeError;
use crate::results::{QueryResult, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Open,
    Exec,
    Each,
    Export,
    Close,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Open => "open",
            Action::Exec => "exec",
            Action::Each => "each",
            Action::Export => "export",
            Action::Close => "close",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        [
            Action::Open,
            Action::Exec,
            Action::Each,
            Action::Export,
            Action::Close,
        ]
        .into_iter()
        .find(|action| action.as_str() == name)
    }
}

/// A message from the controller to the worker. `id` is assigned by the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    /// A JSON array (positional) or object (named).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Request {
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            id: 0,
            action,
            buffer: None,
            sql: None,
            params: None,
        }
    }

    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: Option<JsonValue>) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_buffer(mut self, buffer: Option<Vec<u8>>) -> Self {
        self.buffer = buffer;
        self
    }

    /// Decode a request received as JSON text.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::Protocol` (`Invalid action : <name>`) for an unknown
    /// action and `SqlBridgeError::Serialization` for malformed JSON.
    pub fn from_json(text: &str) -> Result<Self, SqlBridgeError> {
        let raw: JsonValue = serde_json::from_str(text)?;
        let name = raw
            .get("action")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| raw.get("action").map_or_else(String::new, JsonValue::to_string));
        if Action::parse(&name).is_none() {
            return Err(SqlBridgeError::Protocol(format!("Invalid action : {name}")));
        }
        Ok(serde_json::from_value(raw)?)
    }
}

/// A message from the worker, correlated to its request by `id`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<QueryResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    #[must_use]
    pub fn ack(id: u32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn ready(id: u32) -> Self {
        Self {
            ready: Some(true),
            ..Self::ack(id)
        }
    }

    #[must_use]
    pub fn results(id: u32, results: Vec<QueryResult>) -> Self {
        Self {
            results: Some(results),
            ..Self::ack(id)
        }
    }

    #[must_use]
    pub fn row(id: u32, row: Row) -> Self {
        Self {
            row: Some(row),
            finished: Some(false),
            ..Self::ack(id)
        }
    }

    #[must_use]
    pub fn finished(id: u32) -> Self {
        Self {
            finished: Some(true),
            ..Self::ack(id)
        }
    }

    #[must_use]
    pub fn buffer(id: u32, buffer: Vec<u8>) -> Self {
        Self {
            buffer: Some(buffer),
            ..Self::ack(id)
        }
    }

    #[must_use]
    pub fn error(id: u32, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::ack(id)
        }
    }

    /// Whether no further response will carry this `id`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.error.is_some() || self.finished != Some(false)
    }

    /// Split off the error field.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::Remote` carrying the worker's message.
    pub fn into_result(mut self) -> Result<Self, SqlBridgeError> {
        match self.error.take() {
            Some(message) => Err(SqlBridgeError::Remote(message)),
            None => Ok(self),
        }
    }
}
