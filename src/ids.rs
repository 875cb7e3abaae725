use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Strongly typed request identifier backed by ULID.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct RequestId(pub ulid::Ulid);

impl RequestId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Use the inbound `x-request-id` value when it is a valid ULID,
    /// otherwise mint a fresh one.
    pub fn from_header_or_new(header_value: Option<&str>) -> Self {
        header_value
            .map(str::trim)
            .and_then(|s| s.parse::<RequestId>().ok())
            .unwrap_or_default()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RequestId(ulid::Ulid::from_string(s)?))
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<RequestId>()
            .map_err(|_| serde::de::Error::custom("invalid request id"))
    }
}

/// Identifier of a registered stream callback.
///
/// Derived deterministically from the callback identity and its declared
/// dependencies, so every process serving the same app agrees on it.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Hex SHA-256 of `identity|dep1;dep2;...` with the dependencies sorted.
    pub fn derive<S: AsRef<str>>(identity: &str, dependencies: &[S]) -> Self {
        let mut deps: Vec<&str> = dependencies.iter().map(AsRef::as_ref).collect();
        deps.sort_unstable();
        let unique = format!("{identity}|{}", deps.join(";"));
        StreamId(hex::encode(Sha256::digest(unique.as_bytes())))
    }

    /// Resolve the id carried by a request.
    ///
    /// Clients may send either the raw id or the JSON-encoded id of the
    /// stream component, in which case the `index` field holds the id.
    pub fn from_wire(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(map)) => match map.get("index") {
                Some(serde_json::Value::String(s)) => StreamId(s.clone()),
                Some(other) => StreamId(other.to_string()),
                None => StreamId(raw.to_string()),
            },
            _ => StreamId(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        StreamId(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_from_header() {
        let id = RequestId::new();
        let parsed = RequestId::from_header_or_new(Some(&id.to_string()));
        assert_eq!(parsed, id);
        let fresh = RequestId::from_header_or_new(Some("not-a-ulid"));
        assert_ne!(fresh, id);
    }

    #[test]
    fn test_stream_id_is_order_independent() {
        let a = StreamId::derive("app.progress", &["Input(a.value)", "State(b.data)"]);
        let b = StreamId::derive("app.progress", &["State(b.data)", "Input(a.value)"]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        let c = StreamId::derive("app.other", &["Input(a.value)", "State(b.data)"]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_stream_id_from_wire() {
        assert_eq!(StreamId::from_wire("abc").as_str(), "abc");
        let wrapped = r#"{"type":"backplane-event-stream","index":"abc"}"#;
        assert_eq!(StreamId::from_wire(wrapped).as_str(), "abc");
        assert_eq!(StreamId::from_wire(r#"{"type":"x"}"#).as_str(), r#"{"type":"x"}"#);
    }
}
