use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One changed input or state: `{id, property, value}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropValue {
    pub id: Value,
    pub property: String,
    #[serde(default)]
    pub value: Value,
}

impl PropValue {
    /// `"<id>.<property>"`, with dict ids rendered as compact JSON.
    pub fn prop_id(&self) -> String {
        format!("{}.{}", id_key(&self.id), self.property)
    }
}

/// An input slot: a single value, or every match of a wildcard id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSlot {
    Single(PropValue),
    Group(Vec<PropValue>),
}

impl InputSlot {
    /// Value passed to the callback for this slot.
    pub fn value(&self) -> Value {
        match self {
            InputSlot::Single(p) => p.value.clone(),
            InputSlot::Group(ps) => Value::Array(ps.iter().map(|p| p.value.clone()).collect()),
        }
    }

    pub fn props(&self) -> Vec<&PropValue> {
        match self {
            InputSlot::Single(p) => vec![p],
            InputSlot::Group(ps) => ps.iter().collect(),
        }
    }
}

/// Decoded body of a dispatch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    /// Output specification, `id.prop` or `..a.prop...b.prop..`.
    pub output: String,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default)]
    pub inputs: Vec<InputSlot>,
    #[serde(default)]
    pub state: Vec<InputSlot>,
    #[serde(default, rename = "changedPropIds")]
    pub changed_prop_ids: Vec<String>,
}

impl DispatchEnvelope {
    /// Parse a request body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(Error::MalformedEnvelope("empty body".to_string()));
        }
        serde_json::from_slice(body).map_err(|e| Error::MalformedEnvelope(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::MalformedEnvelope(e.to_string()))
    }

    /// Positional arguments: inputs first, then states.
    pub fn args(&self) -> Vec<Value> {
        self.inputs
            .iter()
            .chain(self.state.iter())
            .map(InputSlot::value)
            .collect()
    }

    /// Whether the output spec names several outputs.
    pub fn is_multi(&self) -> bool {
        is_multi_output(&self.output)
    }

    /// Split the output spec into targets.
    pub fn output_targets(&self) -> Result<Vec<OutputTarget>> {
        split_output_spec(&self.output)
    }
}

/// Whether an output spec names several outputs.
pub fn is_multi_output(spec: &str) -> bool {
    spec.starts_with("..") && spec.ends_with("..") && spec.len() > 4
}

/// Split `id.prop` or `..a.prop...b.prop..` into its targets.
pub fn split_output_spec(spec: &str) -> Result<Vec<OutputTarget>> {
    if is_multi_output(spec) {
        spec[2..spec.len() - 2]
            .split("...")
            .map(OutputTarget::parse)
            .collect()
    } else {
        Ok(vec![OutputTarget::parse(spec)?])
    }
}

/// One `id.property` output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputTarget {
    /// Component id as it appears in the response (`id_key` form).
    pub id: String,
    pub property: String,
}

impl OutputTarget {
    pub fn parse(spec: &str) -> Result<Self> {
        match spec.rsplit_once('.') {
            Some((id, prop)) if !id.is_empty() && !prop.is_empty() => Ok(Self {
                id: id.to_string(),
                property: prop.to_string(),
            }),
            _ => Err(Error::MalformedEnvelope(format!(
                "invalid output specification '{spec}'"
            ))),
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.property)
    }
}

/// Response key of a component id: strings as-is, everything else as
/// compact JSON.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal() {
        let env = DispatchEnvelope::parse(
            br#"{"output":"b.children","inputs":[{"id":"a","property":"value","value":"X"}]}"#,
        )
        .unwrap();
        assert_eq!(env.args(), vec![json!("X")]);
        assert!(!env.is_multi());
        assert_eq!(env.output_targets().unwrap()[0].to_string(), "b.children");
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            DispatchEnvelope::parse(b"{not json"),
            Err(Error::MalformedEnvelope(_))
        ));
        assert!(matches!(
            DispatchEnvelope::parse(b""),
            Err(Error::MalformedEnvelope(_))
        ));
        assert!(matches!(
            DispatchEnvelope::parse(br#"{"inputs":[]}"#),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_multi_output_and_groups() {
        let env = DispatchEnvelope::from_value(json!({
            "output": "..a.children...b.value..",
            "inputs": [
                {"id": "x", "property": "value", "value": 1},
                [{"id": {"i": 0}, "property": "value", "value": 2},
                 {"id": {"i": 1}, "property": "value", "value": 3}]
            ],
            "state": [{"id": "s", "property": "data"}]
        }))
        .unwrap();
        assert!(env.is_multi());
        let targets: Vec<String> = env
            .output_targets()
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(targets, vec!["a.children", "b.value"]);
        assert_eq!(env.args(), vec![json!(1), json!([2, 3]), Value::Null]);
    }

    #[test]
    fn test_dict_id_output() {
        let t = OutputTarget::parse(r#"{"index":1,"type":"x"}.children"#).unwrap();
        assert_eq!(t.id, r#"{"index":1,"type":"x"}"#);
        assert_eq!(t.property, "children");
        assert!(OutputTarget::parse("nodot").is_err());
    }
}
