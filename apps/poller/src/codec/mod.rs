//! Request codec - builds check requests and interprets responses
//!
//! Both halves are pure: they never touch a socket.
//! - `agent`: framed key strings and agent replies
//! - `http`: HTTP agent requests, status code matching and body capture
pub mod agent;
pub mod http;

use std::fmt;

use serde::Serialize;

/// Value produced by a successful check
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CheckValue {
    Unsigned(u64),
    Float(f64),
    Text(String),
}

impl fmt::Display for CheckValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckValue::Unsigned(value) => write!(f, "{value}"),
            CheckValue::Float(value) => write!(f, "{value}"),
            CheckValue::Text(value) => f.write_str(value),
        }
    }
}
