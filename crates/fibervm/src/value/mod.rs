// Tagged value representation
mod closure;
mod convert;
mod string;
mod table;
mod userdata;

pub use closure::{
    Function, FunctionKind, LocalVar, NativeFn, Prototype, Upvalue, UpvalueDesc,
};
pub use convert::{format_number, parse_number};
pub use string::ObjString;
pub use table::{Node, Table, TableKey, WeakMode};
pub use userdata::{UTAG_IDTOR, UTAG_LIMIT, Userdata, UserdataDtor};

use crate::gc::{
    FunctionId, GcRef, ObjectKind, ProtoId, StringId, TableId, UpvalueId, UserdataId,
};

/// Dynamic value: null, boolean, number or a handle to a heap object
#[derive(Clone, Copy, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Number(f64),
    Object(GcRef),
}

/// Type of a value as seen by scripts and the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null = 0,
    Boolean = 1,
    Number = 2,
    String = 3,
    Table = 4,
    Function = 5,
    Userdata = 6,
    Thread = 7,
    Prototype = 8,
    Upvalue = 9,
}

impl ValueType {
    /// Number of per-type metatable slots
    pub const COUNT: usize = 10;

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Table => "table",
            ValueType::Function => "function",
            ValueType::Userdata => "userdata",
            ValueType::Thread => "thread",
            ValueType::Prototype => "proto",
            ValueType::Upvalue => "upvalue",
        }
    }
}

impl Value {
    #[inline(always)]
    pub const fn null() -> Self {
        Value::Null
    }

    #[inline(always)]
    pub const fn boolean(b: bool) -> Self {
        Value::Boolean(b)
    }

    #[inline(always)]
    pub const fn number(n: f64) -> Self {
        Value::Number(n)
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::Object(r) => match r.kind() {
                ObjectKind::String => ValueType::String,
                ObjectKind::Table => ValueType::Table,
                ObjectKind::Function => ValueType::Function,
                ObjectKind::Userdata => ValueType::Userdata,
                ObjectKind::Thread => ValueType::Thread,
                ObjectKind::Prototype => ValueType::Prototype,
                ObjectKind::Upvalue => ValueType::Upvalue,
                // dead keys never escape a table; report them as null
                ObjectKind::DeadKey => ValueType::Null,
            },
        }
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline(always)]
    pub fn is_boolean(&self) -> bool {
        matches!(self, Value::Boolean(_))
    }

    #[inline(always)]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    #[inline(always)]
    fn is_kind(&self, kind: ObjectKind) -> bool {
        matches!(self, Value::Object(r) if r.kind() == kind)
    }

    #[inline(always)]
    pub fn is_string(&self) -> bool {
        self.is_kind(ObjectKind::String)
    }

    #[inline(always)]
    pub fn is_table(&self) -> bool {
        self.is_kind(ObjectKind::Table)
    }

    #[inline(always)]
    pub fn is_function(&self) -> bool {
        self.is_kind(ObjectKind::Function)
    }

    #[inline(always)]
    pub fn is_userdata(&self) -> bool {
        self.is_kind(ObjectKind::Userdata)
    }

    #[inline(always)]
    pub fn is_thread(&self) -> bool {
        self.is_kind(ObjectKind::Thread)
    }

    #[inline(always)]
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Only null and false are falsy
    #[inline(always)]
    pub fn is_falsy(&self) -> bool {
        matches!(self, Value::Null | Value::Boolean(false))
    }

    #[inline(always)]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    #[inline(always)]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_gc(&self) -> Option<GcRef> {
        match self {
            Value::Object(r) => Some(*r),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string_id(&self) -> Option<StringId> {
        self.as_gc().and_then(StringId::from_ref)
    }

    #[inline]
    pub fn as_table_id(&self) -> Option<TableId> {
        self.as_gc().and_then(TableId::from_ref)
    }

    #[inline]
    pub fn as_function_id(&self) -> Option<FunctionId> {
        self.as_gc().and_then(FunctionId::from_ref)
    }

    #[inline]
    pub fn as_userdata_id(&self) -> Option<UserdataId> {
        self.as_gc().and_then(UserdataId::from_ref)
    }

    #[inline]
    pub fn as_proto_id(&self) -> Option<ProtoId> {
        self.as_gc().and_then(ProtoId::from_ref)
    }

    #[inline]
    pub fn as_upvalue_id(&self) -> Option<UpvalueId> {
        self.as_gc().and_then(UpvalueId::from_ref)
    }

    /// Raw equality: numbers within an epsilon, objects by identity
    pub fn raw_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => numbers_equal(*a, *b),
            (Value::Object(a), Value::Object(b)) => a.kind() == b.kind() && a.same_object(*b),
            _ => false,
        }
    }
}

/// Epsilon comparison scaled to the operands' magnitude
#[inline]
pub fn numbers_equal(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    if a.is_nan() || b.is_nan() || a.is_infinite() || b.is_infinite() {
        return false;
    }
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= f64::EPSILON * scale
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equal(other)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<GcRef> for Value {
    fn from(r: GcRef) -> Self {
        Value::Object(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(Value::Null.is_null());
        assert!(Value::Null.is_falsy());
        assert!(Value::Boolean(false).is_falsy());
        assert!(Value::Number(0.0).is_truthy());
        let s = Value::Object(GcRef::new(0, 0, ObjectKind::String));
        assert!(s.is_string() && s.is_object() && !s.is_table());
        assert_eq!(s.type_name(), "string");
        assert!(s.as_string_id().is_some());
        assert!(s.as_table_id().is_none());
    }

    #[test]
    fn number_equality_uses_epsilon() {
        assert_eq!(Value::Number(0.1 + 0.2), Value::Number(0.3));
        assert_ne!(Value::Number(1.0), Value::Number(1.0001));
        assert_eq!(Value::Number(1e20), Value::Number(1e20 + 1.0));
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_eq!(Value::Number(f64::INFINITY), Value::Number(f64::INFINITY));
    }

    #[test]
    fn object_equality_is_identity() {
        let a = Value::Object(GcRef::new(1, 0, ObjectKind::Table));
        let b = Value::Object(GcRef::new(1, 1, ObjectKind::Table));
        assert_eq!(a, a);
        assert_ne!(a, b);
        assert_ne!(a, Value::Null);
        assert_ne!(Value::Boolean(true), Value::Number(1.0));
    }
}
