//! Client-side reduction of a push stream.
//!
//! The client's stream component exposes the concatenation of every
//! payload received so far. On each change the reducer splits that message
//! on the separator, skips the entries it has already processed (tracked by
//! a cursor) and applies the new ones in order:
//!
//! | Token | Effect | Cursor |
//! | --- | --- | --- |
//! | `INIT` | stream marked not done | 1 |
//! | `RUNNING` | `set_props(target, payload)` | +1 |
//! | `DONE` | stream marked done, URL cleared | 0 |
//! | `ERROR` | reset props applied, optional alert, then as `DONE` | 0 |
//!
//! Any entry that fails to decode closes the stream and resets the cursor.

use super::protocol::{ControlToken, StreamEntry, STREAM_SEPARATOR};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Where the reducer writes its effects.
pub trait PropSink {
    /// Merge `props` into component `id`.
    fn set_props(&mut self, id: &Value, props: &Value);

    /// Surface an error to the user.
    fn alert(&mut self, _message: &str) {}
}

/// Reducer state for one stream component.
#[derive(Debug, Clone)]
pub struct StreamReducer {
    stream_component: Value,
    cursor: usize,
}

impl StreamReducer {
    /// `stream_component` is the id of the component holding the channel.
    pub fn new(stream_component: Value) -> Self {
        Self {
            stream_component,
            cursor: 0,
        }
    }

    /// Number of entries already processed.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Process the current message; returns the new cursor.
    pub fn reduce(&mut self, message: &str, sink: &mut dyn PropSink) -> usize {
        if message.is_empty() {
            return self.cursor;
        }
        let mut entries: Vec<&str> = message.split(STREAM_SEPARATOR).collect();
        if entries.last() == Some(&"") {
            entries.pop();
        }
        let start = self.cursor.min(entries.len());
        for raw in &entries[start..] {
            match StreamEntry::decode(raw) {
                Ok(entry) => self.apply(entry, sink),
                Err(_) => {
                    self.cursor = 0;
                    self.close(sink);
                }
            }
        }
        self.cursor
    }

    fn apply(&mut self, entry: StreamEntry, sink: &mut dyn PropSink) {
        match entry.token {
            ControlToken::Init => {
                self.cursor = 1;
                sink.set_props(&self.stream_component, &json!({"done": false}));
            }
            ControlToken::Done => {
                self.cursor = 0;
                self.close(sink);
            }
            ControlToken::Error => {
                self.cursor = 0;
                let Value::Object(payload) = &entry.payload else {
                    self.close(sink);
                    return;
                };
                if payload.get("handle_error").and_then(Value::as_bool) == Some(true) {
                    let error = match payload.get("error") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    sink.alert(&format!("Error occurred while processing stream - {error}"));
                }
                if let Some(Value::Object(reset)) = payload.get("reset_props") {
                    for (component, props) in reset {
                        sink.set_props(&Value::String(component.clone()), props);
                    }
                }
                self.close(sink);
            }
            ControlToken::Running => {
                sink.set_props(&entry.target, &entry.payload);
                self.cursor += 1;
            }
        }
    }

    fn close(&self, sink: &mut dyn PropSink) {
        sink.set_props(&self.stream_component, &json!({"done": true, "url": null}));
    }
}

/// In-memory [`PropSink`] that merges props per component.
#[derive(Debug, Default, Clone)]
pub struct PropStore {
    props: HashMap<String, serde_json::Map<String, Value>>,
    alerts: Vec<String>,
}

impl PropStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(id: &Value) -> String {
        match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Current value of `prop` on component `id`.
    pub fn get(&self, id: &Value, prop: &str) -> Option<&Value> {
        self.props.get(&Self::key(id)).and_then(|p| p.get(prop))
    }

    pub fn alerts(&self) -> &[String] {
        &self.alerts
    }
}

impl PropSink for PropStore {
    fn set_props(&mut self, id: &Value, props: &Value) {
        let entry = self.props.entry(Self::key(id)).or_default();
        if let Value::Object(map) = props {
            for (k, v) in map {
                entry.insert(k.clone(), v.clone());
            }
        }
    }

    fn alert(&mut self, message: &str) {
        self.alerts.push(message.to_string());
    }
}
