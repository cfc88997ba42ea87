//! NDJSON protocol spoken with the Python bootstrap over the child's pipes.
//!
//! Host → interpreter: one command object per line, tagged by `op`.
//! Interpreter → host: one event object per line, tagged by `event`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChildCommand<'a> {
    Bind { vars: &'a Map<String, Value> },
    Unbind { names: &'a [String] },
    Exec { code: &'a str },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChildEvent {
    Ready {
        version: String,
    },
    Stdout {
        text: String,
    },
    Stderr {
        text: String,
    },
    Ack,
    Done {
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    /// The bootstrap rejected a command it could not understand.
    Fault {
        message: String,
    },
}

pub fn encode(command: &ChildCommand<'_>) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(command)?;
    line.push('\n');
    Ok(line)
}

pub fn decode(line: &str) -> Result<ChildEvent, serde_json::Error> {
    serde_json::from_str(line)
}
