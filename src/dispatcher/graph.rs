//! The callback-graph collaborator.
//!
//! The dispatch pipeline never interprets the component tree itself. It hands
//! the decoded envelope to a [`CallbackGraph`], which returns the callable and
//! its positional arguments, and later asks the same graph to turn the
//! callable's result into a JSON patch.
//!
//! [`SimpleCallbackGraph`] is an in-memory graph keyed by output spec. It is
//! enough for applications that register callbacks by hand and is what the
//! tests and the demo binary use.

use super::envelope::{split_output_spec, DispatchEnvelope, OutputTarget};
use crate::backend::MaybeAsync;
use crate::error::{Error, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Key of the no-update sentinel object.
pub const NO_UPDATE_KEY: &str = "_no_update";

/// A callback body: positional argument values in, a result value out.
pub type CallbackFn = Arc<dyn Fn(Vec<Value>) -> MaybeAsync<Result<Value>> + Send + Sync>;

/// Wrap a synchronous closure as a [`CallbackFn`].
pub fn callback<F>(f: F) -> CallbackFn
where
    F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(move |args| MaybeAsync::Ready(f(args)))
}

/// Wrap an async closure as a [`CallbackFn`].
pub fn async_callback<F, Fut>(f: F) -> CallbackFn
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |args| MaybeAsync::pending(f(args)))
}

/// The value a callback returns for an output it leaves untouched.
pub fn no_update() -> Value {
    json!({ NO_UPDATE_KEY: true })
}

pub fn is_no_update(value: &Value) -> bool {
    value.get(NO_UPDATE_KEY).and_then(Value::as_bool) == Some(true)
}

/// A callback located for one dispatch.
#[derive(Clone)]
pub struct ResolvedCallback {
    pub name: String,
    pub callable: CallbackFn,
    pub args: Vec<Value>,
    pub outputs: Vec<OutputTarget>,
    pub multi: bool,
    pub background: bool,
}

impl fmt::Debug for ResolvedCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCallback")
            .field("name", &self.name)
            .field("args", &self.args.len())
            .field("outputs", &self.outputs)
            .field("multi", &self.multi)
            .field("background", &self.background)
            .finish()
    }
}

/// What the dispatch layer needs from the component/property tree.
pub trait CallbackGraph: Send + Sync {
    /// Locate the callable for the envelope's outputs and materialise its
    /// arguments.
    fn resolve(&self, envelope: &DispatchEnvelope) -> Result<ResolvedCallback>;

    /// Turn a callback result into the response patch. Returns
    /// [`Error::NoOp`] when nothing is to be updated.
    fn encode_patch(&self, callback: &ResolvedCallback, result: Value) -> Result<Value>;
}

struct Entry {
    name: String,
    callable: CallbackFn,
    outputs: Vec<OutputTarget>,
    background: bool,
}

/// Callbacks keyed by their output spec.
#[derive(Default)]
pub struct SimpleCallbackGraph {
    entries: HashMap<String, Entry>,
}

impl SimpleCallbackGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callable` for `output` (`id.prop` or `..a.p...b.q..`).
    pub fn register(&mut self, output: &str, name: &str, callable: CallbackFn) -> Result<()> {
        self.insert(output, name, callable, false)
    }

    /// Register a callback that runs through the job manager.
    pub fn register_background(
        &mut self,
        output: &str,
        name: &str,
        callable: CallbackFn,
    ) -> Result<()> {
        self.insert(output, name, callable, true)
    }

    fn insert(
        &mut self,
        output: &str,
        name: &str,
        callable: CallbackFn,
        background: bool,
    ) -> Result<()> {
        let outputs = split_output_spec(output)
            .map_err(|e| Error::Registration(format!("callback '{name}': {e}")))?;
        if self.entries.contains_key(output) {
            return Err(Error::Registration(format!(
                "output '{output}' already has a callback"
            )));
        }
        debug!(output = %output, name = %name, background, "Callback registered");
        self.entries.insert(
            output.to_string(),
            Entry {
                name: name.to_string(),
                callable,
                outputs,
                background,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CallbackGraph for SimpleCallbackGraph {
    fn resolve(&self, envelope: &DispatchEnvelope) -> Result<ResolvedCallback> {
        let entry = self.entries.get(&envelope.output).ok_or_else(|| {
            Error::callback(anyhow::anyhow!(
                "no callback registered for output '{}'",
                envelope.output
            ))
        })?;
        Ok(ResolvedCallback {
            name: entry.name.clone(),
            callable: Arc::clone(&entry.callable),
            args: envelope.args(),
            outputs: entry.outputs.clone(),
            multi: envelope.is_multi(),
            background: entry.background,
        })
    }

    fn encode_patch(&self, callback: &ResolvedCallback, result: Value) -> Result<Value> {
        let values = if callback.multi {
            match result {
                Value::Array(items) if items.len() == callback.outputs.len() => items,
                Value::Array(items) => {
                    return Err(Error::callback(anyhow::anyhow!(
                        "callback '{}' returned {} values for {} outputs",
                        callback.name,
                        items.len(),
                        callback.outputs.len()
                    )))
                }
                other => {
                    return Err(Error::callback(anyhow::anyhow!(
                        "callback '{}' has {} outputs but returned a single {}",
                        callback.name,
                        callback.outputs.len(),
                        json_kind(&other)
                    )))
                }
            }
        } else {
            vec![result]
        };

        let mut response: Map<String, Value> = Map::new();
        for (target, value) in callback.outputs.iter().zip(values) {
            if is_no_update(&value) {
                continue;
            }
            let props = response
                .entry(target.id.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(props) = props {
                props.insert(target.property.clone(), value);
            }
        }
        if response.is_empty() {
            return Err(Error::NoOp);
        }

        let mut patch = json!({ "response": response });
        if callback.multi {
            patch["multi"] = Value::Bool(true);
        }
        Ok(patch)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
