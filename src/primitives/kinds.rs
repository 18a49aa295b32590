//! Built-in primitive state machines.
//!
//! Each state machine interprets the operation vocabulary of one
//! primitive kind. Outputs and events are JSON values; the typed client
//! wrappers in [`super::service`] own the encoding on the other side.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::error::{ConclaveError, Result};
use crate::primitives::registry::{OperationContext, PrimitiveStateMachine};

fn missing_field(op: &str, field: &str) -> ConclaveError {
    ConclaveError::Application(format!("operation '{}' requires field '{}'", op, field))
}

/// Replicated 64-bit counter.
#[derive(Debug, Default)]
pub struct CounterStateMachine {
    value: i64,
}

impl PrimitiveStateMachine for CounterStateMachine {
    fn apply(&mut self, _ctx: &mut OperationContext, op: &str, input: &Value) -> Result<Value> {
        match op {
            "get" => Ok(json!(self.value)),
            "set" => {
                let value = input
                    .get("value")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| missing_field(op, "value"))?;
                self.value = value;
                Ok(json!(self.value))
            }
            "increment" => {
                let delta = input.get("delta").and_then(Value::as_i64).unwrap_or(1);
                self.value = self.value.wrapping_add(delta);
                Ok(json!(self.value))
            }
            other => Err(ConclaveError::Application(format!(
                "counter does not support operation '{}'",
                other
            ))),
        }
    }
}

/// Replicated string-keyed map.
#[derive(Debug, Default)]
pub struct MapStateMachine {
    entries: BTreeMap<String, Value>,
}

impl MapStateMachine {
    fn key_of(op: &str, input: &Value) -> Result<String> {
        input
            .get("key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| missing_field(op, "key"))
    }
}

impl PrimitiveStateMachine for MapStateMachine {
    fn apply(&mut self, ctx: &mut OperationContext, op: &str, input: &Value) -> Result<Value> {
        match op {
            "get" => {
                let key = Self::key_of(op, input)?;
                Ok(self.entries.get(&key).cloned().unwrap_or(Value::Null))
            }
            "put" => {
                let key = Self::key_of(op, input)?;
                let value = input.get("value").cloned().unwrap_or(Value::Null);
                let previous = self.entries.insert(key.clone(), value);
                ctx.publish(json!({"event": "updated", "key": key}));
                Ok(previous.unwrap_or(Value::Null))
            }
            "remove" => {
                let key = Self::key_of(op, input)?;
                let previous = self.entries.remove(&key);
                if previous.is_some() {
                    ctx.publish(json!({"event": "removed", "key": key}));
                }
                Ok(previous.unwrap_or(Value::Null))
            }
            "size" => Ok(json!(self.entries.len())),
            "keys" => Ok(json!(self.entries.keys().collect::<Vec<_>>())),
            other => Err(ConclaveError::Application(format!(
                "map does not support operation '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;

    fn ctx() -> OperationContext {
        OperationContext::new(SessionId::new(1))
    }

    #[test]
    fn counter_increments_and_sets() {
        let mut machine = CounterStateMachine::default();
        assert_eq!(machine.apply(&mut ctx(), "get", &json!({})).unwrap(), json!(0));
        assert_eq!(
            machine
                .apply(&mut ctx(), "increment", &json!({"delta": 5}))
                .unwrap(),
            json!(5)
        );
        assert_eq!(
            machine.apply(&mut ctx(), "increment", &json!({})).unwrap(),
            json!(6)
        );
        assert_eq!(
            machine
                .apply(&mut ctx(), "set", &json!({"value": -2}))
                .unwrap(),
            json!(-2)
        );
    }

    #[test]
    fn counter_rejects_unknown_operation() {
        let mut machine = CounterStateMachine::default();
        let result = machine.apply(&mut ctx(), "cas", &json!({}));
        assert!(matches!(result, Err(ConclaveError::Application(_))));
    }

    #[test]
    fn map_put_get_remove() {
        let mut machine = MapStateMachine::default();
        let previous = machine
            .apply(&mut ctx(), "put", &json!({"key": "a", "value": 1}))
            .unwrap();
        assert_eq!(previous, Value::Null);

        let previous = machine
            .apply(&mut ctx(), "put", &json!({"key": "a", "value": 2}))
            .unwrap();
        assert_eq!(previous, json!(1));

        assert_eq!(
            machine
                .apply(&mut ctx(), "get", &json!({"key": "a"}))
                .unwrap(),
            json!(2)
        );
        assert_eq!(machine.apply(&mut ctx(), "size", &json!({})).unwrap(), json!(1));

        let removed = machine
            .apply(&mut ctx(), "remove", &json!({"key": "a"}))
            .unwrap();
        assert_eq!(removed, json!(2));
        assert_eq!(machine.apply(&mut ctx(), "size", &json!({})).unwrap(), json!(0));
    }

    #[test]
    fn map_put_publishes_update_event() {
        let mut machine = MapStateMachine::default();
        let mut context = ctx();
        machine
            .apply(&mut context, "put", &json!({"key": "k", "value": true}))
            .unwrap();
        let events = context.into_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], json!("updated"));
        assert_eq!(events[0]["key"], json!("k"));
    }

    #[test]
    fn map_remove_of_absent_key_publishes_nothing() {
        let mut machine = MapStateMachine::default();
        let mut context = ctx();
        let removed = machine
            .apply(&mut context, "remove", &json!({"key": "ghost"}))
            .unwrap();
        assert_eq!(removed, Value::Null);
        assert!(context.into_events().is_empty());
    }

    #[test]
    fn map_requires_key_field() {
        let mut machine = MapStateMachine::default();
        let result = machine.apply(&mut ctx(), "get", &json!({}));
        assert!(matches!(result, Err(ConclaveError::Application(_))));
    }
}
