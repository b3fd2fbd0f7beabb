// VM values to serde_json values

use ahash::AHashSet;
use serde_json::{Map, Number, Value as JsonValue};

use crate::gc::{GcRef, TableId};
use crate::value::{Table, Value, ValueType, format_number};
use crate::vm::{GlobalState, VmError, VmResult};

/// Largest magnitude below which every integer is exact in an f64
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Convert `value` to JSON. Cyclic tables are rejected.
pub fn to_json(g: &GlobalState, value: Value) -> VmResult<JsonValue> {
    let mut visiting = AHashSet::new();
    convert(g, value, &mut visiting)
}

/// Convert `value` to JSON text
pub fn to_json_string(g: &GlobalState, value: Value, pretty: bool) -> VmResult<String> {
    let json = to_json(g, value)?;
    let text = if pretty {
        serde_json::to_string_pretty(&json)
    } else {
        serde_json::to_string(&json)
    };
    text.map_err(|e| VmError::runtime(format!("failed to serialize to JSON: {}", e)))
}

fn number(n: f64) -> VmResult<JsonValue> {
    if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        return Ok(JsonValue::Number(Number::from(n as i64)));
    }
    Number::from_f64(n)
        .map(JsonValue::Number)
        .ok_or_else(|| VmError::runtime(format!("cannot serialize number {} to JSON", n)))
}

fn convert(g: &GlobalState, value: Value, visiting: &mut AHashSet<GcRef>) -> VmResult<JsonValue> {
    match value.value_type() {
        ValueType::Null => Ok(JsonValue::Null),
        ValueType::Boolean => Ok(JsonValue::Bool(value.is_truthy())),
        ValueType::Number => number(value.as_number().unwrap_or_default()),
        ValueType::String => {
            let bytes = g.value_bytes(&value).ok_or(VmError::DeadObject)?;
            Ok(JsonValue::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        ValueType::Table => {
            let t = value.as_table_id().ok_or(VmError::DeadObject)?;
            if !visiting.insert(t.gc_ref()) {
                return Err(VmError::runtime("cannot serialize a cyclic table to JSON"));
            }
            let result = table(g, t, visiting);
            visiting.remove(&t.gc_ref());
            result
        }
        ty => Err(VmError::runtime(format!(
            "cannot serialize a {} value to JSON",
            ty.name()
        ))),
    }
}

/// Keys are exactly 1..=n
fn is_sequence(t: &Table) -> bool {
    let n = t.length();
    n > 0 && t.size() == n
}

fn table(g: &GlobalState, t: TableId, visiting: &mut AHashSet<GcRef>) -> VmResult<JsonValue> {
    let tab = g.heap.try_table(t)?;
    if is_sequence(tab) {
        let items = (1..=tab.length())
            .map(|i| tab.get_int(i as i64))
            .collect::<Vec<_>>();
        let array = items
            .into_iter()
            .map(|v| convert(g, v, visiting))
            .collect::<VmResult<Vec<_>>>()?;
        return Ok(JsonValue::Array(array));
    }
    let entries = tab.iter().collect::<Vec<_>>();
    let mut object = Map::new();
    for (k, v) in entries {
        let key = match k.value_type() {
            ValueType::String => g
                .value_bytes(&k)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .ok_or(VmError::DeadObject)?,
            ValueType::Number => format_number(k.as_number().unwrap_or_default()),
            ValueType::Boolean => k.is_truthy().to_string(),
            ty => {
                return Err(VmError::runtime(format!(
                    "cannot use a {} key in a JSON object",
                    ty.name()
                )));
            }
        };
        object.insert(key, convert(g, v, visiting)?);
    }
    Ok(JsonValue::Object(object))
}
