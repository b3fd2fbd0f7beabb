// serde_json values to VM values

use serde_json::Value as JsonValue;

use crate::value::Value;
use crate::vm::{GlobalState, VmError, VmResult};

/// Build the VM value for `json`. The result is pushed onto the main thread,
/// which keeps it alive until the caller pops it.
pub fn from_json(g: &mut GlobalState, json: &JsonValue) -> VmResult<Value> {
    // nested tables sit in Rust locals until linked into their parent
    let was_stopped = g.gc.stopped;
    g.gc.stopped = true;
    let result = build(g, json);
    g.gc.stopped = was_stopped;
    let value = result?;
    let main = g.main_thread().gc;
    g.push_values(main, &[value])?;
    Ok(value)
}

/// Parse JSON text and build its VM value, as `from_json`
pub fn from_json_str(g: &mut GlobalState, text: &str) -> VmResult<Value> {
    let json: JsonValue = serde_json::from_str(text)
        .map_err(|e| VmError::runtime(format!("failed to parse JSON: {}", e)))?;
    from_json(g, &json)
}

fn build(g: &mut GlobalState, json: &JsonValue) -> VmResult<Value> {
    match json {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Boolean(*b)),
        JsonValue::Number(n) => n
            .as_f64()
            .map(Value::Number)
            .ok_or_else(|| VmError::runtime(format!("invalid JSON number {}", n))),
        JsonValue::String(s) => Ok(g.intern_str(s)?.into()),
        JsonValue::Array(items) => {
            let t = g.new_table(items.len())?;
            for (i, item) in items.iter().enumerate() {
                let v = build(g, item)?;
                // null elements leave a hole
                if !v.is_null() {
                    g.table_set(t, Value::Number((i + 1) as f64), v)?;
                }
            }
            Ok(t.into())
        }
        JsonValue::Object(map) => {
            let t = g.new_table(map.len())?;
            for (key, item) in map {
                let k: Value = g.intern_str(key)?.into();
                let v = build(g, item)?;
                if !v.is_null() {
                    g.table_set(t, k, v)?;
                }
            }
            Ok(t.into())
        }
    }
}
