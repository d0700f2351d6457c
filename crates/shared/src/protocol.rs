//! Wire format of the hosted device store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::ApiError, paths::StorePath};

/// A single point write. Writes are independent; there are no multi-path
/// transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StoreWrite {
    Set(Value),
    Delete,
    /// Resolved by the store to its own clock, in milliseconds since the epoch.
    ServerTimestamp,
}

impl StoreWrite {
    pub fn text(value: impl Into<String>) -> Self {
        StoreWrite::Set(Value::String(value.into()))
    }

    pub fn number(value: impl Into<serde_json::Number>) -> Self {
        StoreWrite::Set(Value::Number(value.into()))
    }

    /// `null` and `{}` carry no data and behave as deletes.
    pub fn is_delete(&self) -> bool {
        match self {
            StoreWrite::Delete => true,
            StoreWrite::Set(Value::Null) => true,
            StoreWrite::Set(Value::Object(map)) => map.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub path: StorePath,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeQuery {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StoreEvent {
    ValueChanged {
        path: StorePath,
        #[serde(default)]
        value: Option<Value>,
    },
    Error(ApiError),
}
