// Base library: the global functions every state starts with
// print, type, tostring, tonumber, rawequal, rawget, rawset, rawlen,
// setmetatable, getmetatable, next, pcall, error, assert, collectgarbage

use crate::stdlib::LibraryModule;
use crate::value::{Value, ValueType};
use crate::vm::limits::MULTRET;
use crate::vm::{GlobalState, StateMut, VmError, VmResult};

const PROTECTED_FIELD: &str = "__metatable";

pub fn create_base_lib() -> LibraryModule {
    LibraryModule::new("_G")
        .with_function("print", base_print)
        .with_function("type", base_type)
        .with_function("tostring", base_tostring)
        .with_function("tonumber", base_tonumber)
        .with_function("rawequal", base_rawequal)
        .with_function("rawget", base_rawget)
        .with_function("rawset", base_rawset)
        .with_function("rawlen", base_rawlen)
        .with_function("setmetatable", base_setmetatable)
        .with_function("getmetatable", base_getmetatable)
        .with_function("next", base_next)
        .with_function("pcall", base_pcall)
        .with_function("error", base_error)
        .with_function("assert", base_assert)
        .with_function("collectgarbage", base_collectgarbage)
}

/// Register the base library in the globals of `g`
pub fn open_base(g: &mut GlobalState) -> VmResult<()> {
    create_base_lib().install(g)
}

/// print(...) - Write values, tab separated, to the log
fn base_print(s: &mut StateMut<'_>) -> VmResult<usize> {
    let line = (1..=s.arg_count())
        .filter_map(|n| s.arg(n))
        .map(|v| s.global().display_value(&v))
        .collect::<Vec<_>>()
        .join("\t");
    log::info!("{}", line);
    Ok(0)
}

/// type(v) - Name of the type of v
fn base_type(s: &mut StateMut<'_>) -> VmResult<usize> {
    let v = s.check_any(1)?;
    s.push_string(v.type_name())?;
    Ok(1)
}

/// tostring(v)
fn base_tostring(s: &mut StateMut<'_>) -> VmResult<usize> {
    let v = s.check_any(1)?;
    let text = s.global().display_value(&v);
    s.push_string(&text)?;
    Ok(1)
}

/// tonumber(v [, base]) - Number, or null when v does not convert
fn base_tonumber(s: &mut StateMut<'_>) -> VmResult<usize> {
    let v = s.check_any(1)?;
    let result = match s.arg(2) {
        None | Some(Value::Null) => s.global().to_number(&v),
        Some(_) => {
            let base = s.check_number(2)?;
            if base.fract() != 0.0 || !(2.0..=36.0).contains(&base) {
                return Err(VmError::bad_argument(2, "base out of range"));
            }
            let text = s.check_string(1)?;
            parse_in_base(&text, base as u32)
        }
    };
    match result {
        Some(n) => s.push_number(n)?,
        None => s.push_null()?,
    }
    Ok(1)
}

/// Integer digits of `text` in `base`, surrounding whitespace and a sign allowed
fn parse_in_base(text: &str, base: u32) -> Option<f64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if digits.is_empty() {
        return None;
    }
    let mut n = 0.0f64;
    for c in digits.chars() {
        n = n * base as f64 + c.to_digit(base)? as f64;
    }
    Some(if negative { -n } else { n })
}

/// rawequal(a, b)
fn base_rawequal(s: &mut StateMut<'_>) -> VmResult<usize> {
    let a = s.check_any(1)?;
    let b = s.check_any(2)?;
    s.push_boolean(a.raw_equal(&b))?;
    Ok(1)
}

/// rawget(t, k) - Read without metamethods
fn base_rawget(s: &mut StateMut<'_>) -> VmResult<usize> {
    let t = s.check_table(1)?;
    let key = s.check_any(2)?;
    let v = s.global().table_get(t, &key)?;
    s.push(v)?;
    Ok(1)
}

/// rawset(t, k, v) - Write without metamethods, returns t
fn base_rawset(s: &mut StateMut<'_>) -> VmResult<usize> {
    let t = s.check_table(1)?;
    let key = s.check_any(2)?;
    let value = s.check_any(3)?;
    s.global_mut().table_set(t, key, value)?;
    s.push_value(1)?;
    Ok(1)
}

/// rawlen(v) - Length of a table or string without metamethods
fn base_rawlen(s: &mut StateMut<'_>) -> VmResult<usize> {
    let v = s.check_any(1)?;
    let len = match v.as_table_id() {
        Some(t) => s.global().table_len(t)?,
        None => match s.global().value_bytes(&v) {
            Some(bytes) => bytes.len(),
            None => return Err(VmError::bad_argument(1, "table or string expected")),
        },
    };
    s.push_number(len as f64)?;
    Ok(1)
}

/// `__metatable` field of the metatable of `v`, null when unset
fn protected_metatable(g: &mut GlobalState, v: &Value) -> VmResult<Value> {
    let Some(mt) = g.get_metatable(v) else {
        return Ok(Value::Null);
    };
    let key = g.intern_str(PROTECTED_FIELD)?;
    g.table_get(mt, &key.into())
}

/// setmetatable(t, mt) - Returns t
fn base_setmetatable(s: &mut StateMut<'_>) -> VmResult<usize> {
    let t = s.check_table(1)?;
    let mt = match s.arg(2) {
        Some(Value::Null) => None,
        Some(v) if v.value_type() == ValueType::Table => v.as_table_id(),
        _ => return Err(VmError::bad_argument(2, "nil or table expected")),
    };
    let target: Value = t.into();
    if !protected_metatable(s.global_mut(), &target)?.is_null() {
        return Err(VmError::runtime("cannot change a protected metatable"));
    }
    s.global_mut().set_metatable(&target, mt)?;
    s.push_value(1)?;
    Ok(1)
}

/// getmetatable(v) - The `__metatable` field when present, else the metatable
fn base_getmetatable(s: &mut StateMut<'_>) -> VmResult<usize> {
    let v = s.check_any(1)?;
    let protected = protected_metatable(s.global_mut(), &v)?;
    if !protected.is_null() {
        s.push(protected)?;
        return Ok(1);
    }
    match s.global().get_metatable(&v) {
        Some(mt) => s.push(mt.into())?,
        None => s.push_null()?,
    }
    Ok(1)
}

/// next(t [, k]) - Entry after k, or null after the last one
fn base_next(s: &mut StateMut<'_>) -> VmResult<usize> {
    let t = s.check_table(1)?;
    let key = s.arg(2).unwrap_or_default();
    match s.global().table_next(t, &key)? {
        Some((k, v)) => {
            s.push(k)?;
            s.push(v)?;
            Ok(2)
        }
        None => {
            s.push_null()?;
            Ok(1)
        }
    }
}

/// pcall(f, ...) - true and the results of f, or false and the error message
fn base_pcall(s: &mut StateMut<'_>) -> VmResult<usize> {
    s.check_any(1)?;
    let nargs = s.arg_count() - 1;
    let ok = s.pcall(nargs, MULTRET)?;
    s.push_boolean(ok)?;
    s.insert(1)?;
    Ok(s.get_top())
}

/// error(message [, level]) - Raise message; the level is not used
fn base_error(s: &mut StateMut<'_>) -> VmResult<usize> {
    let v = s.arg(1).unwrap_or_default();
    Err(VmError::Runtime(s.global().display_value(&v)))
}

/// assert(v [, message, ...]) - All arguments when v is truthy
fn base_assert(s: &mut StateMut<'_>) -> VmResult<usize> {
    let v = s.check_any(1)?;
    if v.is_truthy() {
        return Ok(s.arg_count());
    }
    match s.arg(2) {
        Some(msg) => Err(VmError::Runtime(s.global().display_value(&msg))),
        None => Err(VmError::runtime("assertion failed!")),
    }
}

/// collectgarbage([opt]) - "collect" (default), "count" or "step"
fn base_collectgarbage(s: &mut StateMut<'_>) -> VmResult<usize> {
    let opt = match s.arg(1) {
        None | Some(Value::Null) => "collect".to_string(),
        Some(_) => s.check_string(1)?,
    };
    match opt.as_str() {
        "collect" => {
            s.collect_garbage();
            s.push_number(0.0)?;
        }
        "count" => {
            let kb = s.gc_count() as f64 / 1024.0;
            s.push_number(kb)?;
        }
        "step" => {
            let before = s.global().gc_stats().cycles;
            s.gc_step();
            let finished = s.global().gc_stats().cycles != before;
            s.push_boolean(finished)?;
        }
        other => {
            return Err(VmError::bad_argument(
                1,
                format!("invalid option '{}'", other),
            ));
        }
    }
    Ok(1)
}
