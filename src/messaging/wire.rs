//! # Wire Messages
//!
//! Broker-neutral representation of what crosses the transport. Concrete
//! brokers map their native frames onto [`WireMessage`]; the adapter only
//! accepts byte and text bodies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property carrying the payload type name
pub const PROPERTY_PAYLOAD_TYPE: &str = "payload_type";
/// Property carrying the payload SHA-256 checksum
pub const PROPERTY_CHECKSUM: &str = "checksum";
/// Property carrying the serialized sender identity
pub const PROPERTY_SENDER: &str = "sender";

/// Message body shapes a broker may deliver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireBody {
    Bytes(Vec<u8>),
    Text(String),
    Map(BTreeMap<String, serde_json::Value>),
    Empty,
}

impl WireBody {
    /// Short shape name used in errors and logs
    pub fn shape(&self) -> &'static str {
        match self {
            WireBody::Bytes(_) => "bytes",
            WireBody::Text(_) => "text",
            WireBody::Map(_) => "map",
            WireBody::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub body: WireBody,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl WireMessage {
    pub fn bytes(payload: Vec<u8>) -> Self {
        Self {
            body: WireBody::Bytes(payload),
            properties: BTreeMap::new(),
        }
    }

    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            body: WireBody::Text(payload.into()),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}
