// ============ Object Arena ============
// All heap objects live in one slot vector owned by the global state. The
// collector walks the slots directly during sweep; freed slots go on a free
// list and get their version bumped so old handles stop resolving.

use std::rc::Rc;

use crate::gc::{GcBox, GcHeader, GcObject, GcRef, ObjectKind};
use crate::gc::{FunctionId, ProtoId, StringId, TableId, UpvalueId, UserdataId};
use crate::value::{Function, ObjString, Prototype, Table, Upvalue, Userdata};
use crate::vm::{ThreadState, VmError, VmResult};

struct Slot {
    version: u32,
    entry: Option<GcBox>,
}

#[derive(Default)]
pub struct ObjectAllocator {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ObjectAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an object in a free slot (or a new one) and hand out its handle.
    pub fn insert(&mut self, header: GcHeader, object: GcObject) -> GcRef {
        let kind = object.kind();
        let boxed = GcBox { header, object };
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(boxed);
            GcRef::new(index, slot.version, kind)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                version: 0,
                entry: Some(boxed),
            });
            GcRef::new(index, 0, kind)
        }
    }

    /// Remove an object; its slot version is bumped so `r` goes stale.
    pub fn remove(&mut self, r: GcRef) -> Option<GcBox> {
        let slot = self.slots.get_mut(r.index as usize)?;
        if slot.version != r.version || slot.entry.is_none() {
            return None;
        }
        let boxed = slot.entry.take();
        slot.version = slot.version.wrapping_add(1);
        self.free.push(r.index);
        self.live -= 1;
        boxed
    }

    #[inline]
    pub fn get(&self, r: GcRef) -> Option<&GcBox> {
        let slot = self.slots.get(r.index as usize)?;
        if slot.version != r.version {
            return None;
        }
        slot.entry.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut GcBox> {
        let slot = self.slots.get_mut(r.index as usize)?;
        if slot.version != r.version {
            return None;
        }
        slot.entry.as_mut()
    }

    #[inline]
    pub fn contains(&self, r: GcRef) -> bool {
        self.get(r).is_some()
    }

    #[inline]
    pub fn header(&self, r: GcRef) -> Option<&GcHeader> {
        self.get(r).map(|b| &b.header)
    }

    #[inline]
    pub fn header_mut(&mut self, r: GcRef) -> Option<&mut GcHeader> {
        self.get_mut(r).map(|b| &mut b.header)
    }

    /// Number of slots, occupied or not. Sweep iterates `0..capacity()`.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live object count
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Handle for whatever currently occupies `index`
    pub fn ref_at(&self, index: usize) -> Option<GcRef> {
        let slot = self.slots.get(index)?;
        let entry = slot.entry.as_ref()?;
        Some(GcRef::new(index as u32, slot.version, entry.object.kind()))
    }

    /// Every live handle, in slot order
    pub fn refs(&self) -> impl Iterator<Item = GcRef> + '_ {
        (0..self.slots.len()).filter_map(|i| self.ref_at(i))
    }

    // ============ Typed access ============

    #[inline]
    pub fn string(&self, id: StringId) -> Option<&ObjString> {
        match &self.get(id.0)?.object {
            GcObject::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn table(&self, id: TableId) -> Option<&Table> {
        match &self.get(id.0)?.object {
            GcObject::Table(t) => Some(t),
            _ => None,
        }
    }

    #[inline]
    pub fn table_mut(&mut self, id: TableId) -> Option<&mut Table> {
        match &mut self.get_mut(id.0)?.object {
            GcObject::Table(t) => Some(t),
            _ => None,
        }
    }

    #[inline]
    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        match &self.get(id.0)?.object {
            GcObject::Function(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn function_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        match &mut self.get_mut(id.0)?.object {
            GcObject::Function(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn upvalue(&self, id: UpvalueId) -> Option<&Upvalue> {
        match &self.get(id.0)?.object {
            GcObject::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    #[inline]
    pub fn upvalue_mut(&mut self, id: UpvalueId) -> Option<&mut Upvalue> {
        match &mut self.get_mut(id.0)?.object {
            GcObject::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    #[inline]
    pub fn userdata(&self, id: UserdataId) -> Option<&Userdata> {
        match &self.get(id.0)?.object {
            GcObject::Userdata(u) => Some(u),
            _ => None,
        }
    }

    #[inline]
    pub fn userdata_mut(&mut self, id: UserdataId) -> Option<&mut Userdata> {
        match &mut self.get_mut(id.0)?.object {
            GcObject::Userdata(u) => Some(u),
            _ => None,
        }
    }

    #[inline]
    pub fn proto(&self, id: ProtoId) -> Option<&Rc<Prototype>> {
        match &self.get(id.0)?.object {
            GcObject::Prototype(p) => Some(p),
            _ => None,
        }
    }

    #[inline]
    pub fn thread(&self, r: GcRef) -> Option<&ThreadState> {
        match &self.get(r)?.object {
            GcObject::Thread(t) => Some(t),
            _ => None,
        }
    }

    #[inline]
    pub fn thread_mut(&mut self, r: GcRef) -> Option<&mut ThreadState> {
        match &mut self.get_mut(r)?.object {
            GcObject::Thread(t) => Some(t),
            _ => None,
        }
    }

    // ============ Checked access for the VM ============
    // A handle that no longer resolves means a root was missed: internal error.

    #[inline]
    pub fn try_table(&self, id: TableId) -> VmResult<&Table> {
        self.table(id).ok_or(VmError::DeadObject)
    }

    #[inline]
    pub fn try_table_mut(&mut self, id: TableId) -> VmResult<&mut Table> {
        self.table_mut(id).ok_or(VmError::DeadObject)
    }

    #[inline]
    pub fn try_string(&self, id: StringId) -> VmResult<&ObjString> {
        self.string(id).ok_or(VmError::DeadObject)
    }

    #[inline]
    pub fn try_thread(&self, r: GcRef) -> VmResult<&ThreadState> {
        self.thread(r).ok_or(VmError::DeadObject)
    }

    #[inline]
    pub fn try_thread_mut(&mut self, r: GcRef) -> VmResult<&mut ThreadState> {
        self.thread_mut(r).ok_or(VmError::DeadObject)
    }

    #[inline]
    pub fn try_function(&self, id: FunctionId) -> VmResult<&Function> {
        self.function(id).ok_or(VmError::DeadObject)
    }

    #[inline]
    pub fn try_upvalue(&self, id: UpvalueId) -> VmResult<&Upvalue> {
        self.upvalue(id).ok_or(VmError::DeadObject)
    }

    #[inline]
    pub fn try_proto(&self, id: ProtoId) -> VmResult<&Rc<Prototype>> {
        self.proto(id).ok_or(VmError::DeadObject)
    }

    /// Kind stored in the slot, if the handle is live
    pub fn kind_of(&self, r: GcRef) -> Option<ObjectKind> {
        self.get(r).map(|b| b.object.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Generation;
    use crate::value::ObjString;

    fn string_object(s: &str) -> GcObject {
        GcObject::String(ObjString::new(s.as_bytes().into(), 0))
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut arena = ObjectAllocator::new();
        let a = arena.insert(GcHeader::with_white(Generation::A, 8), string_object("a"));
        assert!(arena.contains(a));
        assert!(arena.remove(a).is_some());
        assert!(!arena.contains(a));

        // the slot is reused with a new version
        let b = arena.insert(GcHeader::with_white(Generation::A, 8), string_object("b"));
        assert_eq!(a.index(), b.index());
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn refs_lists_live_slots() {
        let mut arena = ObjectAllocator::new();
        let a = arena.insert(GcHeader::with_white(Generation::A, 8), string_object("a"));
        let b = arena.insert(GcHeader::with_white(Generation::A, 8), string_object("b"));
        arena.remove(a);
        let live: Vec<_> = arena.refs().collect();
        assert_eq!(live, vec![b]);
        assert_eq!(arena.capacity(), 2);
    }
}
