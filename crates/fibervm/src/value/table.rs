// Hash table object
//
// Nodes are kept in insertion order in `nodes`; `index` maps each live key to
// its node. Erasing a key leaves a tombstone node behind (null value, object
// keys retagged as dead keys) that is dropped by the next compaction, which
// happens only when an insertion would grow the node array. A traversal that
// erases as it goes therefore never loses its position.

use ahash::RandomState;
use std::cell::Cell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::gc::TableId;
use crate::value::{Value, format_number};
use crate::vm::{VmError, VmResult};

/// Normalized hashable key. Numbers hash on their exact bits, objects on their
/// handle identity.
#[derive(Clone, Copy, Debug)]
pub struct TableKey(Value);

impl TableKey {
    pub fn new(key: Value) -> VmResult<TableKey> {
        match key {
            Value::Null => Err(VmError::InvalidKey("table index is null")),
            Value::Number(n) if n.is_nan() => Err(VmError::InvalidKey("table index is NaN")),
            // -0.0 and 0.0 are the same key
            Value::Number(n) if n == 0.0 => Ok(TableKey(Value::Number(0.0))),
            other => Ok(TableKey(other)),
        }
    }

    #[inline(always)]
    pub fn value(self) -> Value {
        self.0
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        match (self.0, other.0) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::Object(a), Value::Object(b)) => a.kind() == b.kind() && a.same_object(b),
            (Value::Null, Value::Null) => true,
            _ => false,
        }
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.0 {
            Value::Null => 0u8.hash(state),
            Value::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Number(n) => {
                2u8.hash(state);
                n.to_bits().hash(state);
            }
            Value::Object(r) => {
                3u8.hash(state);
                r.index().hash(state);
                r.version.hash(state);
            }
        }
    }
}

/// Weak mode declared through the metatable's `__mode` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakMode {
    Strong,
    Keys,
    Values,
    Both,
}

impl WeakMode {
    pub fn from_mode(mode: &[u8]) -> WeakMode {
        match (mode.contains(&b'k'), mode.contains(&b'v')) {
            (true, true) => WeakMode::Both,
            (true, false) => WeakMode::Keys,
            (false, true) => WeakMode::Values,
            (false, false) => WeakMode::Strong,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Node {
    pub key: Value,
    pub value: Value,
}

#[derive(Default)]
pub struct Table {
    nodes: Vec<Node>,
    index: HashMap<TableKey, u32, RandomState>,
    /// t[1..=border] are known to be non-null
    border: Cell<usize>,
    pub(crate) metatable: Option<TableId>,
}

impl Table {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            index: HashMap::with_capacity_and_hasher(capacity, RandomState::new()),
            border: Cell::new(0),
            metatable: None,
        }
    }

    #[inline]
    pub fn metatable(&self) -> Option<TableId> {
        self.metatable
    }

    #[inline]
    fn find(&self, key: &Value) -> Option<usize> {
        let key = TableKey::new(*key).ok()?;
        self.index.get(&key).map(|&pos| pos as usize)
    }

    /// Read-only lookup; a missing key (or a tombstone) is an error.
    pub fn get(&self, key: &Value) -> VmResult<Value> {
        match self.find(key).map(|pos| self.nodes[pos].value) {
            Some(value) if !value.is_null() => Ok(value),
            _ => Err(VmError::KeyNotFound(describe_key(key))),
        }
    }

    /// Lookup returning null for absent keys
    #[inline]
    pub fn raw_get(&self, key: &Value) -> Value {
        self.find(key)
            .map(|pos| self.nodes[pos].value)
            .unwrap_or_default()
    }

    pub fn get_int(&self, i: i64) -> Value {
        self.raw_get(&Value::Number(i as f64))
    }

    /// Slot for `key`, created with a null value when absent.
    pub fn get_or_insert(&mut self, key: Value) -> VmResult<&mut Value> {
        let key = TableKey::new(key)?;
        let pos = match self.index.get(&key) {
            Some(&pos) => pos as usize,
            None => {
                if self.nodes.len() == self.nodes.capacity() && self.tombstones() > 0 {
                    self.compact();
                }
                let pos = self.nodes.len();
                self.nodes.push(Node {
                    key: key.value(),
                    value: Value::Null,
                });
                self.index.insert(key, pos as u32);
                pos
            }
        };
        Ok(&mut self.nodes[pos].value)
    }

    /// Assign; a null value erases the key.
    pub fn set(&mut self, key: Value, value: Value) -> VmResult<()> {
        if value.is_null() {
            TableKey::new(key)?;
            self.erase(&key);
            return Ok(());
        }
        *self.get_or_insert(key)? = value;
        Ok(())
    }

    pub fn set_int(&mut self, i: i64, value: Value) -> VmResult<()> {
        self.set(Value::Number(i as f64), value)
    }

    /// Erase a key, leaving a tombstone. Returns whether a live entry was removed.
    pub fn erase(&mut self, key: &Value) -> bool {
        match self.find(key) {
            Some(pos) => {
                let was_live = !self.nodes[pos].value.is_null();
                self.kill_node(pos);
                was_live
            }
            None => false,
        }
    }

    /// Turn a node into a tombstone
    pub(crate) fn kill_node(&mut self, pos: usize) {
        let node = &mut self.nodes[pos];
        node.value = Value::Null;
        if let Ok(key) = TableKey::new(node.key) {
            self.index.remove(&key);
        }
        if let Value::Number(k) = node.key {
            if k >= 1.0 && k <= self.border.get() as f64 && k.fract() == 0.0 {
                self.border.set(k as usize - 1);
            }
        }
        if let Value::Object(r) = node.key {
            node.key = Value::Object(r.as_dead_key());
        }
    }

    /// Number of live entries
    pub fn size(&self) -> usize {
        self.nodes.iter().filter(|n| !n.value.is_null()).count()
    }

    /// Nodes no longer reachable through the key index
    pub fn tombstones(&self) -> usize {
        self.nodes.len() - self.index.len()
    }

    /// Border of the sequence part: largest n with t[1..=n] all non-null.
    /// Probing resumes from the cached border, which erasure lowers.
    pub fn length(&self) -> usize {
        let mut n = self.border.get();
        while !self.get_int(n as i64 + 1).is_null() {
            n += 1;
        }
        self.border.set(n);
        n
    }

    /// Traversal step: the first live entry after `key` (null starts over).
    /// A key erased since the previous step is still accepted until compaction.
    pub fn next(&self, key: &Value) -> VmResult<Option<(Value, Value)>> {
        let start = if key.is_null() {
            0
        } else {
            self.position_of(key)
                .ok_or(VmError::InvalidKey("invalid key to 'next'"))?
                + 1
        };
        Ok(self.nodes[start..]
            .iter()
            .find(|n| !n.value.is_null())
            .map(|n| (n.key, n.value)))
    }

    fn position_of(&self, key: &Value) -> Option<usize> {
        if let Some(pos) = self.find(key) {
            return Some(pos);
        }
        // maybe a tombstone: compare by identity, ignoring the dead-key tag
        let wanted = TableKey::new(*key).ok()?.value();
        self.nodes.iter().position(|n| match (n.key, wanted) {
            (Value::Object(a), Value::Object(b)) => a.same_object(b),
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            _ => false,
        })
    }

    /// Live entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.nodes
            .iter()
            .filter(|n| !n.value.is_null())
            .map(|n| (n.key, n.value))
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Drop tombstones and null slots, rebuilding the key index
    pub fn compact(&mut self) {
        self.nodes.retain(|n| !n.value.is_null());
        self.index.clear();
        for (pos, node) in self.nodes.iter().enumerate() {
            if let Ok(key) = TableKey::new(node.key) {
                self.index.insert(key, pos as u32);
            }
        }
    }

    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Table>()
            + self.nodes.capacity() * std::mem::size_of::<Node>()
            + self.index.capacity() * (std::mem::size_of::<TableKey>() + 4)
    }
}

/// Short rendering of a key for error messages (no heap access)
fn describe_key(key: &Value) -> String {
    match key {
        Value::Null => "null".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::Object(r) => format!("{}: {}", r.kind().name(), r.index()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{GcRef, ObjectKind};

    fn obj(i: u32) -> Value {
        Value::Object(GcRef::new(i, 0, ObjectKind::Table))
    }

    #[test]
    fn get_missing_key_is_an_error() {
        let mut t = Table::new(0);
        t.set(Value::Number(1.0), Value::Boolean(true)).unwrap();
        assert_eq!(t.get(&Value::Number(1.0)).unwrap(), Value::Boolean(true));
        assert!(matches!(
            t.get(&Value::Number(2.0)),
            Err(VmError::KeyNotFound(_))
        ));
        assert!(t.raw_get(&Value::Number(2.0)).is_null());
    }

    #[test]
    fn rejects_null_and_nan_keys() {
        let mut t = Table::new(0);
        assert!(matches!(
            t.set(Value::Null, Value::Number(1.0)),
            Err(VmError::InvalidKey(_))
        ));
        assert!(t.get_or_insert(Value::Number(f64::NAN)).is_err());
    }

    #[test]
    fn negative_zero_is_zero() {
        let mut t = Table::new(0);
        t.set(Value::Number(-0.0), Value::Number(5.0)).unwrap();
        assert_eq!(t.raw_get(&Value::Number(0.0)), Value::Number(5.0));
    }

    #[test]
    fn erase_leaves_dead_key_tombstone() {
        let mut t = Table::new(4);
        t.set(obj(1), Value::Number(1.0)).unwrap();
        t.set(obj(2), Value::Number(2.0)).unwrap();
        assert!(t.erase(&obj(1)));
        assert_eq!(t.size(), 1);
        assert_eq!(t.tombstones(), 1);
        match t.nodes()[0].key {
            Value::Object(r) => assert_eq!(r.kind(), ObjectKind::DeadKey),
            _ => panic!("key should stay an object"),
        }
        assert!(t.get(&obj(1)).is_err());
        t.compact();
        assert_eq!(t.tombstones(), 0);
        assert_eq!(t.nodes().len(), 1);
    }

    #[test]
    fn next_skips_tombstones_and_resumes_after_erase() {
        let mut t = Table::new(0);
        for i in 1..=4 {
            t.set_int(i, Value::Number(i as f64 * 10.0)).unwrap();
        }
        t.erase(&Value::Number(2.0));
        let mut seen = Vec::new();
        let mut key = Value::Null;
        while let Some((k, v)) = t.next(&key).unwrap() {
            // erase while traversing
            if k == Value::Number(3.0) {
                t.erase(&k);
            }
            seen.push(v.as_number().unwrap());
            key = k;
        }
        assert_eq!(seen, vec![10.0, 30.0, 40.0]);
        assert!(t.next(&Value::Number(99.0)).is_err());
    }

    #[test]
    fn length_counts_sequence() {
        let mut t = Table::new(0);
        for i in 1..=5 {
            t.set_int(i, Value::Boolean(true)).unwrap();
        }
        t.set(Value::Boolean(true), Value::Number(1.0)).unwrap();
        assert_eq!(t.length(), 5);
        t.set_int(3, Value::Null).unwrap();
        assert_eq!(t.length(), 2);
    }

    #[test]
    fn length_border_follows_growth_and_erasure() {
        let mut t = Table::new(0);
        for i in 1..=100 {
            t.set_int(i, Value::Number(i as f64)).unwrap();
            assert_eq!(t.length(), i as usize);
        }
        t.set_int(40, Value::Null).unwrap();
        assert_eq!(t.length(), 39);
        // erasing above the border leaves it alone
        t.set_int(90, Value::Null).unwrap();
        assert_eq!(t.length(), 39);
        t.set_int(40, Value::Number(40.0)).unwrap();
        assert_eq!(t.length(), 89);
        t.set_int(1, Value::Null).unwrap();
        assert_eq!(t.length(), 0);
    }

    #[test]
    fn reinserting_after_erase() {
        let mut t = Table::new(1);
        t.set_int(1, Value::Number(1.0)).unwrap();
        t.erase(&Value::Number(1.0));
        t.set_int(1, Value::Number(2.0)).unwrap();
        assert_eq!(t.size(), 1);
        assert_eq!(t.get_int(1), Value::Number(2.0));
    }

    #[test]
    fn weak_mode_parsing() {
        assert_eq!(WeakMode::from_mode(b"k"), WeakMode::Keys);
        assert_eq!(WeakMode::from_mode(b"v"), WeakMode::Values);
        assert_eq!(WeakMode::from_mode(b"kv"), WeakMode::Both);
        assert_eq!(WeakMode::from_mode(b""), WeakMode::Strong);
    }
}
