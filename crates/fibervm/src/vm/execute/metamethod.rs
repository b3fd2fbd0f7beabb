// Metamethod dispatch: indexing, arithmetic, comparison, concatenation, length

use crate::gc::GcRef;
use crate::value::{Value, ValueType, format_number};
use crate::vm::execute::call::call_value;
use crate::vm::limits::MAXTAGLOOP;
use crate::vm::{GlobalState, VmError, VmResult};

/// Metamethod slots, in the order their names are interned
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TmKind {
    Index = 0,
    NewIndex,
    Mode,
    Len,
    Eq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Lt,
    Le,
    Concat,
    Call,
}

impl TmKind {
    pub const COUNT: usize = 16;

    pub const ALL: [TmKind; TmKind::COUNT] = [
        TmKind::Index,
        TmKind::NewIndex,
        TmKind::Mode,
        TmKind::Len,
        TmKind::Eq,
        TmKind::Add,
        TmKind::Sub,
        TmKind::Mul,
        TmKind::Div,
        TmKind::Mod,
        TmKind::Pow,
        TmKind::Unm,
        TmKind::Lt,
        TmKind::Le,
        TmKind::Concat,
        TmKind::Call,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Mode => "__mode",
            TmKind::Len => "__len",
            TmKind::Eq => "__eq",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Div => "__div",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Unm => "__unm",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Concat => "__concat",
            TmKind::Call => "__call",
        }
    }
}

/// Call a metamethod and keep its first result
fn call_tm(g: &mut GlobalState, th: GcRef, tm: Value, args: &[Value]) -> VmResult<Value> {
    let results = call_value(g, th, tm, args, 1)?;
    Ok(results.first().copied().unwrap_or_default())
}

// ============ Indexing ============

/// `obj[key]` with `__index` chains
pub(crate) fn index(g: &mut GlobalState, th: GcRef, obj: Value, key: Value) -> VmResult<Value> {
    let mut obj = obj;
    for _ in 0..MAXTAGLOOP {
        let tm = match obj.as_table_id() {
            Some(t) => {
                let raw = g.heap.try_table(t)?.raw_get(&key);
                if !raw.is_null() {
                    return Ok(raw);
                }
                let tm = g.get_tm(&obj, TmKind::Index);
                if tm.is_null() {
                    return Ok(Value::Null);
                }
                tm
            }
            None => {
                let tm = g.get_tm(&obj, TmKind::Index);
                if tm.is_null() {
                    return Err(VmError::Index {
                        target: obj.type_name(),
                    });
                }
                tm
            }
        };
        if tm.is_function() {
            return call_tm(g, th, tm, &[obj, key]);
        }
        obj = tm;
    }
    Err(VmError::runtime("'__index' chain too long; possible loop"))
}

/// `obj[key] = value` with `__newindex` chains
pub(crate) fn new_index(
    g: &mut GlobalState,
    th: GcRef,
    obj: Value,
    key: Value,
    value: Value,
) -> VmResult<()> {
    let mut obj = obj;
    for _ in 0..MAXTAGLOOP {
        let tm = match obj.as_table_id() {
            Some(t) => {
                let present = !g.heap.try_table(t)?.raw_get(&key).is_null();
                let tm = if present {
                    Value::Null
                } else {
                    g.get_tm(&obj, TmKind::NewIndex)
                };
                if tm.is_null() {
                    return g.table_set(t, key, value);
                }
                tm
            }
            None => {
                let tm = g.get_tm(&obj, TmKind::NewIndex);
                if tm.is_null() {
                    return Err(VmError::Index {
                        target: obj.type_name(),
                    });
                }
                tm
            }
        };
        if tm.is_function() {
            call_value(g, th, tm, &[obj, key, value], 0)?;
            return Ok(());
        }
        obj = tm;
    }
    Err(VmError::runtime("'__newindex' chain too long; possible loop"))
}

// ============ Arithmetic ============

#[inline]
fn arith_raw(op: TmKind, a: f64, b: f64) -> f64 {
    match op {
        TmKind::Add => a + b,
        TmKind::Sub => a - b,
        TmKind::Mul => a * b,
        TmKind::Div => a / b,
        TmKind::Mod => a - (a / b).floor() * b,
        TmKind::Pow => a.powf(b),
        TmKind::Unm => -a,
        _ => f64::NAN,
    }
}

/// Binary (or unary, with `b == a`) arithmetic with string coercion and metamethods
pub(crate) fn arith(
    g: &mut GlobalState,
    th: GcRef,
    op: TmKind,
    a: Value,
    b: Value,
) -> VmResult<Value> {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return Ok(Value::Number(arith_raw(op, x, y)));
    }
    if let (Some(x), Some(y)) = (g.to_number(&a), g.to_number(&b)) {
        return Ok(Value::Number(arith_raw(op, x, y)));
    }
    let mut tm = g.get_tm(&a, op);
    if tm.is_null() {
        tm = g.get_tm(&b, op);
    }
    if tm.is_null() {
        let culprit = if g.to_number(&a).is_none() { a } else { b };
        return Err(VmError::Arith {
            op: "arithmetic",
            operand: culprit.type_name(),
        });
    }
    call_tm(g, th, tm, &[a, b])
}

// ============ Comparison ============

/// Equality: raw first, then `__eq` for two tables or two user data
pub(crate) fn equal(g: &mut GlobalState, th: GcRef, a: Value, b: Value) -> VmResult<bool> {
    if a.raw_equal(&b) {
        return Ok(true);
    }
    let same_kind = match (a.value_type(), b.value_type()) {
        (ValueType::Table, ValueType::Table) | (ValueType::Userdata, ValueType::Userdata) => true,
        _ => false,
    };
    if !same_kind {
        return Ok(false);
    }
    let mut tm = g.get_tm(&a, TmKind::Eq);
    if tm.is_null() {
        tm = g.get_tm(&b, TmKind::Eq);
    }
    if tm.is_null() {
        return Ok(false);
    }
    Ok(call_tm(g, th, tm, &[a, b])?.is_truthy())
}

fn compare_strings(g: &GlobalState, a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (g.value_bytes(a), g.value_bytes(b)) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn order(
    g: &mut GlobalState,
    th: GcRef,
    kind: TmKind,
    a: Value,
    b: Value,
) -> VmResult<bool> {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return Ok(if kind == TmKind::Lt { x < y } else { x <= y });
    }
    if let Some(ord) = compare_strings(g, &a, &b) {
        return Ok(if kind == TmKind::Lt {
            ord.is_lt()
        } else {
            ord.is_le()
        });
    }
    let mut tm = g.get_tm(&a, kind);
    if tm.is_null() {
        tm = g.get_tm(&b, kind);
    }
    if tm.is_null() {
        return Err(VmError::Order {
            left: a.type_name(),
            right: b.type_name(),
        });
    }
    Ok(call_tm(g, th, tm, &[a, b])?.is_truthy())
}

pub(crate) fn less_than(g: &mut GlobalState, th: GcRef, a: Value, b: Value) -> VmResult<bool> {
    order(g, th, TmKind::Lt, a, b)
}

pub(crate) fn less_equal(g: &mut GlobalState, th: GcRef, a: Value, b: Value) -> VmResult<bool> {
    order(g, th, TmKind::Le, a, b)
}

// ============ Length and concatenation ============

pub(crate) fn length(g: &mut GlobalState, th: GcRef, v: Value) -> VmResult<Value> {
    if let Some(bytes) = g.value_bytes(&v) {
        return Ok(Value::Number(bytes.len() as f64));
    }
    let tm = g.get_tm(&v, TmKind::Len);
    if !tm.is_null() {
        return call_tm(g, th, tm, &[v]);
    }
    match v.as_table_id() {
        Some(t) => Ok(Value::Number(g.heap.try_table(t)?.length() as f64)),
        None => Err(VmError::runtime(format!(
            "attempt to get length of a {} value",
            v.type_name()
        ))),
    }
}

#[inline]
fn is_concatable(v: &Value) -> bool {
    v.is_string() || v.is_number()
}

fn append_text(g: &GlobalState, buf: &mut Vec<u8>, v: &Value) {
    match v {
        Value::Number(n) => buf.extend_from_slice(format_number(*n).as_bytes()),
        _ => {
            if let Some(bytes) = g.value_bytes(v) {
                buf.extend_from_slice(bytes);
            }
        }
    }
}

/// Concatenate `values` right to left. Runs of strings and numbers are joined
/// in one allocation; anything else goes through `__concat` pairwise.
pub(crate) fn concat(g: &mut GlobalState, th: GcRef, values: &[Value]) -> VmResult<Value> {
    let Some(&last) = values.last() else {
        return Ok(Value::Null);
    };
    let mut acc = last;
    let mut end = values.len() - 1;
    while end > 0 {
        let left = values[end - 1];
        if is_concatable(&left) && is_concatable(&acc) {
            let mut start = end - 1;
            while start > 0 && is_concatable(&values[start - 1]) {
                start -= 1;
            }
            let mut buf = Vec::new();
            for v in &values[start..end] {
                append_text(g, &mut buf, v);
            }
            append_text(g, &mut buf, &acc);
            acc = g.intern(&buf)?.into();
            end = start;
        } else {
            let mut tm = g.get_tm(&left, TmKind::Concat);
            if tm.is_null() {
                tm = g.get_tm(&acc, TmKind::Concat);
            }
            if tm.is_null() {
                let culprit = if is_concatable(&left) { acc } else { left };
                return Err(VmError::Arith {
                    op: "concatenation",
                    operand: culprit.type_name(),
                });
            }
            acc = call_tm(g, th, tm, &[left, acc])?;
            end -= 1;
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_declaration_order() {
        for (i, kind) in TmKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, i);
        }
        assert_eq!(TmKind::Concat.name(), "__concat");
    }

    #[test]
    fn raw_arithmetic() {
        assert_eq!(arith_raw(TmKind::Mod, 5.5, 2.0), 1.5);
        assert_eq!(arith_raw(TmKind::Mod, -1.0, 3.0), 2.0);
        assert_eq!(arith_raw(TmKind::Pow, 2.0, 10.0), 1024.0);
        assert_eq!(arith_raw(TmKind::Unm, 3.0, 3.0), -3.0);
    }
}
