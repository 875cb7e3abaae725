//! Stream entry format.
//!
//! Every entry is the JSON array `[token, target, payload]` followed by
//! [`STREAM_SEPARATOR`]. The client concatenates all `data:` payloads it
//! has received and splits on the separator, so entries must never contain
//! it themselves.

use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Separator appended to every entry.
pub const STREAM_SEPARATOR: &str = "__concatsep__";

/// Control token of a stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    Init,
    Running,
    Done,
    Error,
}

impl ControlToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlToken::Init => "[INIT]",
            ControlToken::Running => "[RUNNING]",
            ControlToken::Done => "[DONE]",
            ControlToken::Error => "[ERROR]",
        }
    }

    /// `DONE` and `ERROR` end the channel.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControlToken::Done | ControlToken::Error)
    }
}

impl fmt::Display for ControlToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "[INIT]" => Ok(ControlToken::Init),
            "[RUNNING]" => Ok(ControlToken::Running),
            "[DONE]" => Ok(ControlToken::Done),
            "[ERROR]" => Ok(ControlToken::Error),
            other => Err(Error::MalformedEnvelope(format!(
                "unknown control token '{other}'"
            ))),
        }
    }
}

/// A decoded stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub token: ControlToken,
    pub target: Value,
    pub payload: Value,
}

impl StreamEntry {
    pub fn init() -> Self {
        Self {
            token: ControlToken::Init,
            target: Value::Null,
            payload: Value::Null,
        }
    }

    pub fn running(target: Value, props: Value) -> Self {
        Self {
            token: ControlToken::Running,
            target,
            payload: props,
        }
    }

    pub fn done() -> Self {
        Self {
            token: ControlToken::Done,
            target: Value::Null,
            payload: Value::Null,
        }
    }

    /// Terminal failure carrying `{error, handle_error, reset_props}`.
    pub fn error(message: &str, handle_error: bool, reset_props: Value) -> Self {
        Self {
            token: ControlToken::Error,
            target: Value::Null,
            payload: json!({
                "error": message,
                "handle_error": handle_error,
                "reset_props": reset_props,
            }),
        }
    }

    /// JSON array plus separator.
    pub fn encode(&self) -> String {
        let mut out = json!([self.token.as_str(), self.target, self.payload]).to_string();
        out.push_str(STREAM_SEPARATOR);
        out
    }

    /// Decode one entry (without the separator).
    pub fn decode(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::MalformedEnvelope(format!("stream entry: {e}")))?;
        let Value::Array(mut parts) = value else {
            return Err(Error::MalformedEnvelope(
                "stream entry is not an array".to_string(),
            ));
        };
        if parts.len() < 3 {
            parts.resize(3, Value::Null);
        }
        let mut parts = parts.into_iter();
        let token = match parts.next() {
            Some(Value::String(s)) => s.parse()?,
            _ => {
                return Err(Error::MalformedEnvelope(
                    "stream entry token is not a string".to_string(),
                ))
            }
        };
        Ok(Self {
            token,
            target: parts.next().unwrap_or(Value::Null),
            payload: parts.next().unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_shapes() {
        assert_eq!(
            StreamEntry::init().encode(),
            "[\"[INIT]\",null,null]__concatsep__"
        );
        assert_eq!(
            StreamEntry::running(json!("x"), json!({"v": 1})).encode(),
            "[\"[RUNNING]\",\"x\",{\"v\":1}]__concatsep__"
        );
        let err = StreamEntry::error("boom", true, json!({"a": {"value": 0}}));
        assert_eq!(err.payload["handle_error"], json!(true));
        assert_eq!(err.payload["reset_props"]["a"]["value"], json!(0));
    }

    #[test]
    fn test_decode() {
        let entry = StreamEntry::decode("[\"[RUNNING]\",{\"index\":1},{\"v\":2}]").unwrap();
        assert_eq!(entry.token, ControlToken::Running);
        assert_eq!(entry.target, json!({"index": 1}));
        assert!(StreamEntry::decode("not json").is_err());
        assert!(StreamEntry::decode("[\"[PAUSED]\",null,null]").is_err());
        assert!(StreamEntry::decode("{}").is_err());
        assert!(ControlToken::Done.is_terminal());
        assert!(!ControlToken::Running.is_terminal());
    }
}
