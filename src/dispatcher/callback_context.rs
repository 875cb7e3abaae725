//! Per-invocation callback context.
//!
//! A running callback can ask which inputs triggered it and see the full
//! input, state and output lists of its dispatch. Storage follows the same
//! two layers as [`crate::context`]: a tokio task-local for async
//! dispatches and a coroutine-local stack for blocking ones, so concurrent
//! dispatches on one worker never observe each other's context.

use super::envelope::{DispatchEnvelope, InputSlot};
use crate::error::ContextError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static TASK_CALLBACK: Arc<CallbackContext>;
}

may::coroutine_local!(
    static LOCAL_CALLBACKS: RefCell<Vec<Arc<CallbackContext>>> = RefCell::new(Vec::new())
);

/// An input that changed and caused the dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredInput {
    pub prop_id: String,
    #[serde(default)]
    pub value: Value,
}

/// What a running callback can learn about its own invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackContext {
    pub triggered_inputs: Vec<TriggeredInput>,
    pub inputs_list: Vec<Value>,
    pub states_list: Vec<Value>,
    pub outputs_list: Value,
    /// `prop_id -> value` for every input.
    pub inputs: Map<String, Value>,
    /// `prop_id -> value` for every state.
    pub states: Map<String, Value>,
}

impl CallbackContext {
    /// Build the context of a dispatch from its envelope.
    ///
    /// Without `changedPropIds` the triggered list holds the single
    /// placeholder `{"prop_id": ".", "value": null}`.
    pub fn from_envelope(envelope: &DispatchEnvelope) -> Self {
        let inputs = flatten(&envelope.inputs);
        let states = flatten(&envelope.state);
        let triggered_inputs = if envelope.changed_prop_ids.is_empty() {
            vec![TriggeredInput {
                prop_id: ".".to_string(),
                value: Value::Null,
            }]
        } else {
            envelope
                .changed_prop_ids
                .iter()
                .map(|pid| TriggeredInput {
                    prop_id: pid.clone(),
                    value: inputs.get(pid).cloned().unwrap_or(Value::Null),
                })
                .collect()
        };
        Self {
            triggered_inputs,
            inputs_list: to_values(&envelope.inputs),
            states_list: to_values(&envelope.state),
            outputs_list: envelope.outputs.clone(),
            inputs,
            states,
        }
    }

    /// Context sent along by the client (stream requests). Unknown shapes
    /// yield an empty context.
    pub fn from_client(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Component id of the first trigger, if any.
    pub fn triggered_id(&self) -> Option<String> {
        let first = self.triggered_inputs.first()?;
        let (id, _) = first.prop_id.rsplit_once('.')?;
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }
}

fn flatten(slots: &[InputSlot]) -> Map<String, Value> {
    slots
        .iter()
        .flat_map(InputSlot::props)
        .map(|p| (p.prop_id(), p.value.clone()))
        .collect()
}

fn to_values(slots: &[InputSlot]) -> Vec<Value> {
    slots
        .iter()
        .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
        .collect()
}

/// The context of the callback currently running.
pub fn current() -> Result<Arc<CallbackContext>, ContextError> {
    if let Ok(ctx) = TASK_CALLBACK.try_with(Arc::clone) {
        return Ok(ctx);
    }
    LOCAL_CALLBACKS.with(|stack| stack.borrow().last().cloned().ok_or(ContextError::Unbound))
}

struct Pop;

impl Drop for Pop {
    fn drop(&mut self) {
        LOCAL_CALLBACKS.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run `f` with `ctx` as the current callback context.
pub fn scope<R>(ctx: Arc<CallbackContext>, f: impl FnOnce() -> R) -> R {
    LOCAL_CALLBACKS.with(|stack| stack.borrow_mut().push(ctx));
    let _pop = Pop;
    f()
}

/// Run `fut` with `ctx` as the current callback context of the task.
pub async fn scope_async<F: Future>(ctx: Arc<CallbackContext>, fut: F) -> F::Output {
    TASK_CALLBACK.scope(ctx, fut).await
}
