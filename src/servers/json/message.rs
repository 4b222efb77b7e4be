use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::controller::StateSnapshot;

/// Incoming request
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Message type, `rq` for requests
    #[serde(rename = "type")]
    pub kind: String,
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

/// Arguments of the `setScript` method
#[derive(Debug, Deserialize)]
pub struct SetScript {
    pub name: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub enum Outcome {
    #[serde(rename = "result")]
    Result(Value),
    #[serde(rename = "error")]
    Error(String),
}

/// Reply to a request
#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    kind: &'static str,
    id: i64,
    #[serde(flatten)]
    outcome: Outcome,
}

impl Response {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            kind: "rp",
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(id: i64, error: impl std::fmt::Display) -> Self {
        Self {
            kind: "rp",
            id,
            outcome: Outcome::Error(error.to_string()),
        }
    }
}

/// Notification pushed to clients
#[derive(Debug, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'static str,
    data: StateSnapshot,
}

impl Event {
    pub fn state_changed(state: StateSnapshot) -> Self {
        Self {
            kind: "ev",
            name: "stateChanged",
            data: state,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Message {
    Response(Response),
    Event(Event),
}
