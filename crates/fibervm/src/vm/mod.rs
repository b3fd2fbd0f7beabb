// Virtual machine
// GlobalState owns everything threads share: the object heap, the string
// table, the registry and the collector. Threads are heap objects themselves.
mod api;
mod call_info;
mod error;
mod execute;
pub mod limits;
mod opcode;
mod safe_option;
mod thread;
mod upvalue;

use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::gc::{
    FunctionId, GC, GcHeader, GcHeap, GcObject, GcRef, GcStats, ObjectAllocator, ObjectKind,
    ProtoId, StringId, StringInterner, TableId, ThreadId, UserdataId,
};
use crate::value::{
    Function, NativeFn, ObjString, Prototype, Table, UTAG_LIMIT, UserdataDtor, Value, ValueType,
    format_number,
};

pub use api::{ResumeStatus, StateMut};
pub use call_info::{CallInfo, call_status};
pub use error::{VmError, VmResult};
pub use execute::TmKind;
pub use opcode::{Instruction, OpCode, OpMode};
pub use safe_option::{GcParams, SafeOption};
pub use thread::{CoStatus, ThreadState, YieldPoint};
pub(crate) use thread::{ResumePoint, Resumer};

static NEXT_STATE_ID: AtomicU32 = AtomicU32::new(1);

/// Called with the bytes of every new string; the result is stored as its atom id
pub type AtomHook = fn(&[u8]) -> i16;

/// Registry slots
pub const RIDX_MAINTHREAD: i64 = 1;
pub const RIDX_GLOBALS: i64 = 2;

pub struct GlobalState {
    /// Distinguishes handles of different states
    pub(crate) id: u32,

    pub(crate) heap: ObjectAllocator,
    pub(crate) strings: StringInterner,
    pub(crate) gc: GC,

    // Registry table: GC root for host-owned references
    pub(crate) registry: TableId,
    // Global environment of loaded chunks
    pub(crate) globals: TableId,

    /// Metatables shared by all values of a non-table, non-userdata type
    pub(crate) type_metatables: [Option<TableId>; ValueType::COUNT],
    /// Fixed metamethod names, indexed by `TmKind`
    pub(crate) tm_names: Vec<StringId>,

    pub(crate) userdata_dtors: Vec<Option<UserdataDtor>>,

    pub(crate) main_thread: ThreadId,
    /// Threads currently executing or waiting on a coroutine they resumed
    pub(crate) running: Vec<GcRef>,

    /// Native frames on the Rust stack
    pub(crate) native_depth: usize,

    pub(crate) options: SafeOption,
    pub(crate) atom_hook: Option<AtomHook>,
}

impl GlobalState {
    pub fn new(options: SafeOption) -> Self {
        let id = NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed);
        let placeholder = GcRef::new(u32::MAX, 0, ObjectKind::Table);
        let mut g = GlobalState {
            id,
            heap: ObjectAllocator::new(),
            strings: StringInterner::new(),
            gc: GC::new(options.gc),
            registry: TableId(placeholder),
            globals: TableId(placeholder),
            type_metatables: [None; ValueType::COUNT],
            tm_names: Vec::with_capacity(TmKind::COUNT),
            userdata_dtors: vec![None; UTAG_LIMIT as usize],
            main_thread: ThreadId {
                gc: GcRef::new(u32::MAX, 0, ObjectKind::Thread),
                owner: id,
            },
            running: Vec::new(),
            native_depth: 0,
            options,
            atom_hook: None,
        };

        // Initialize registry; it and everything below it are never collected
        g.registry = TableId(g.alloc_fixed(GcObject::Table(Table::new(4))));
        g.globals = TableId(g.alloc_fixed(GcObject::Table(Table::new(32))));
        let mut main = ThreadState::new(g.options.max_stack_size);
        main.status = CoStatus::Running;
        main.active = true;
        g.main_thread = ThreadId {
            gc: g.alloc_fixed(GcObject::Thread(Box::new(main))),
            owner: id,
        };

        for kind in TmKind::ALL {
            let name = g.intern_fixed(kind.name().as_bytes());
            g.tm_names.push(name);
        }
        g.gc.tm_mode = Some(g.tm_name(TmKind::Mode));

        let registry = g.registry;
        if let Some(t) = g.heap.table_mut(registry) {
            // well-known registry slots
            let main = t.set_int(RIDX_MAINTHREAD, g.main_thread.into());
            let globals = t.set_int(RIDX_GLOBALS, g.globals.into());
            debug_assert!(main.is_ok() && globals.is_ok());
        }
        let globals = g.globals;
        let key = g.intern_fixed(b"_G");
        let self_ref = g.table_set(globals, key.into(), globals.into());
        debug_assert!(self_ref.is_ok());
        g.gc.estimate = g.gc.total_bytes;
        g
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn options(&self) -> &SafeOption {
        &self.options
    }

    #[inline]
    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    #[inline]
    pub fn globals(&self) -> TableId {
        self.globals
    }

    #[inline]
    pub fn registry(&self) -> TableId {
        self.registry
    }

    /// Host view of the main thread
    pub fn main(&mut self) -> StateMut<'_> {
        let thread = self.main_thread.gc;
        StateMut { g: self, thread }
    }

    /// Host view of any thread of this state
    pub fn state(&mut self, thread: ThreadId) -> VmResult<StateMut<'_>> {
        self.check_owner(thread)?;
        self.heap.try_thread(thread.gc)?;
        Ok(StateMut {
            g: self,
            thread: thread.gc,
        })
    }

    #[inline]
    pub(crate) fn check_owner(&self, thread: ThreadId) -> VmResult<()> {
        if thread.owner != self.id {
            return Err(VmError::CrossState);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn thread_id(&self, r: GcRef) -> ThreadId {
        ThreadId {
            gc: r,
            owner: self.id,
        }
    }

    pub fn set_atom_hook(&mut self, hook: Option<AtomHook>) {
        self.atom_hook = hook;
    }

    // ============ Allocation ============

    fn alloc_fixed(&mut self, object: GcObject) -> GcRef {
        let size = object.byte_size();
        let mut header = GcHeader::with_white(self.gc.current_white, size);
        header.fixed = true;
        self.gc.total_bytes += size;
        self.heap.insert(header, object)
    }

    fn intern_fixed(&mut self, bytes: &[u8]) -> StringId {
        let hash = self.strings.hash_bytes(bytes);
        let r = self.alloc_fixed(GcObject::String(ObjString::new(bytes.into(), hash)));
        let id = StringId(r);
        self.strings.insert(hash, id);
        id
    }

    /// Create an object with the current white. Over the memory limit a full
    /// collection runs first; if that does not help the allocation fails.
    pub(crate) fn alloc(&mut self, object: GcObject) -> VmResult<GcRef> {
        let size = object.byte_size();
        if self.gc.total_bytes + size > self.options.max_memory_limit {
            if !self.gc.stopped {
                self.full_gc();
            }
            if self.gc.total_bytes + size > self.options.max_memory_limit {
                log::warn!(
                    "memory limit reached: {} bytes in use, {} requested, limit {}",
                    self.gc.total_bytes,
                    size,
                    self.options.max_memory_limit
                );
                return Err(VmError::OutOfMemory);
            }
        }
        let header = GcHeader::with_white(self.gc.current_white, size);
        self.gc.total_bytes += size;
        Ok(self.heap.insert(header, object))
    }

    /// Re-account an object whose payload changed size
    pub(crate) fn account_resize(&mut self, r: GcRef) {
        let Some(entry) = self.heap.get_mut(r) else {
            return;
        };
        let new_size = entry.object.byte_size().min(u32::MAX as usize);
        let old_size = entry.header.size as usize;
        entry.header.size = new_size as u32;
        self.gc.total_bytes = (self.gc.total_bytes + new_size).saturating_sub(old_size);
    }

    /// Interned string for `bytes`: the same content always yields the same handle
    pub fn intern(&mut self, bytes: &[u8]) -> VmResult<StringId> {
        let hash = self.strings.hash_bytes(bytes);
        if let Some(id) = self
            .strings
            .lookup(&mut self.heap, self.gc.current_white, hash, bytes)
        {
            return Ok(id);
        }
        let mut s = ObjString::new(bytes.into(), hash);
        if let Some(hook) = self.atom_hook {
            s.atom = hook(bytes);
        }
        let id = StringId(self.alloc(GcObject::String(s))?);
        self.strings.insert(hash, id);
        Ok(id)
    }

    #[inline]
    pub fn intern_str(&mut self, s: &str) -> VmResult<StringId> {
        self.intern(s.as_bytes())
    }

    pub fn new_table(&mut self, capacity: usize) -> VmResult<TableId> {
        Ok(TableId(self.alloc(GcObject::Table(Table::new(capacity)))?))
    }

    pub fn new_native(&mut self, func: NativeFn, upvalues: Vec<Value>) -> VmResult<FunctionId> {
        Ok(FunctionId(
            self.alloc(GcObject::Function(Function::native(func, upvalues)))?,
        ))
    }

    pub(crate) fn new_proto(&mut self, proto: Prototype) -> VmResult<ProtoId> {
        Ok(ProtoId(self.alloc(GcObject::Prototype(Rc::new(proto)))?))
    }

    /// New thread object; not anchored anywhere yet
    pub(crate) fn new_thread_object(&mut self) -> VmResult<ThreadId> {
        let th = ThreadState::new(self.options.max_stack_size);
        let r = self.alloc(GcObject::Thread(Box::new(th)))?;
        Ok(self.thread_id(r))
    }

    // ============ Strings ============

    pub fn string_bytes(&self, id: StringId) -> VmResult<&[u8]> {
        Ok(self.heap.try_string(id)?.as_bytes())
    }

    /// String contents of a value, if it is a string
    pub fn value_bytes(&self, v: &Value) -> Option<&[u8]> {
        v.as_string_id()
            .and_then(|id| self.heap.string(id))
            .map(ObjString::as_bytes)
    }

    pub fn value_str(&self, v: &Value) -> Option<&str> {
        v.as_string_id()
            .and_then(|id| self.heap.string(id))
            .and_then(ObjString::as_str)
    }

    #[inline]
    pub(crate) fn tm_name(&self, kind: TmKind) -> StringId {
        self.tm_names[kind as usize]
    }

    /// Numeric value, converting numeric strings
    pub fn to_number(&self, v: &Value) -> Option<f64> {
        match v {
            Value::Number(n) => Some(*n),
            _ => self
                .value_bytes(v)
                .and_then(crate::value::parse_number),
        }
    }

    /// Interned string form of a number or string; `None` for other types.
    /// Strings are returned unchanged.
    pub fn to_string_id(&mut self, v: &Value) -> VmResult<Option<StringId>> {
        match v {
            Value::Number(n) => {
                let text = format_number(*n);
                Ok(Some(self.intern(text.as_bytes())?))
            }
            _ => Ok(v.as_string_id()),
        }
    }

    /// Human-readable rendering of any value (print, tostring, messages)
    pub fn display_value(&self, v: &Value) -> String {
        match v {
            Value::Null => "null".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Object(r) => match self.value_bytes(v) {
                Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                None => format!("{}: 0x{:08x}", v.type_name(), r.index()),
            },
        }
    }

    // ============ Tables ============

    /// Raw read; null when absent
    pub fn table_get(&self, t: TableId, key: &Value) -> VmResult<Value> {
        Ok(self.heap.try_table(t)?.raw_get(key))
    }

    /// Strict read: an absent key is a `KeyNotFound` error
    pub fn table_get_strict(&self, t: TableId, key: &Value) -> VmResult<Value> {
        match self.heap.try_table(t)?.get(key) {
            Err(VmError::KeyNotFound(_)) => Err(VmError::KeyNotFound(self.display_value(key))),
            other => other,
        }
    }

    /// Raw write with the backward barrier and size accounting
    pub fn table_set(&mut self, t: TableId, key: Value, value: Value) -> VmResult<()> {
        self.heap.try_table_mut(t)?.set(key, value)?;
        self.gc.barrier_back(&mut self.heap, t.gc_ref(), key);
        self.gc.barrier_back(&mut self.heap, t.gc_ref(), value);
        self.account_resize(t.gc_ref());
        Ok(())
    }

    pub fn table_erase(&mut self, t: TableId, key: &Value) -> VmResult<bool> {
        Ok(self.heap.try_table_mut(t)?.erase(key))
    }

    pub fn table_len(&self, t: TableId) -> VmResult<usize> {
        Ok(self.heap.try_table(t)?.length())
    }

    pub fn table_next(&self, t: TableId, key: &Value) -> VmResult<Option<(Value, Value)>> {
        self.heap.try_table(t)?.next(key)
    }

    pub fn registry_get(&self, key: &Value) -> VmResult<Value> {
        self.table_get(self.registry, key)
    }

    pub fn registry_set(&mut self, key: Value, value: Value) -> VmResult<()> {
        self.table_set(self.registry, key, value)
    }

    pub fn get_global(&mut self, name: &str) -> VmResult<Value> {
        let key = self.intern_str(name)?;
        self.table_get(self.globals, &key.into())
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> VmResult<()> {
        let key = self.intern_str(name)?;
        self.table_set(self.globals, key.into(), value)
    }

    /// Register a native function as a global
    pub fn register(&mut self, name: &str, func: NativeFn) -> VmResult<()> {
        let f = self.new_native(func, Vec::new())?;
        self.set_global(name, f.into())
    }

    // ============ Metatables ============

    pub fn get_metatable(&self, v: &Value) -> Option<TableId> {
        match v.value_type() {
            ValueType::Table => v
                .as_table_id()
                .and_then(|t| self.heap.table(t))
                .and_then(Table::metatable),
            ValueType::Userdata => v
                .as_userdata_id()
                .and_then(|u| self.heap.userdata(u))
                .and_then(|u| u.metatable()),
            ty => self.type_metatables[ty as usize],
        }
    }

    pub fn set_metatable(&mut self, v: &Value, mt: Option<TableId>) -> VmResult<()> {
        match v.value_type() {
            ValueType::Table => {
                let t = v.as_table_id().ok_or(VmError::DeadObject)?;
                self.heap.try_table_mut(t)?.metatable = mt;
                if let Some(mt) = mt {
                    self.gc.barrier(&mut self.heap, t.gc_ref(), mt.into());
                }
            }
            ValueType::Userdata => {
                let u = v.as_userdata_id().ok_or(VmError::DeadObject)?;
                self.heap
                    .userdata_mut(u)
                    .ok_or(VmError::DeadObject)?
                    .metatable = mt;
                if let Some(mt) = mt {
                    self.gc.barrier(&mut self.heap, u.gc_ref(), mt.into());
                }
            }
            ty => self.type_metatables[ty as usize] = mt,
        }
        Ok(())
    }

    /// Metamethod `kind` of `v`, null when absent
    pub fn get_tm(&self, v: &Value, kind: TmKind) -> Value {
        match self.get_metatable(v) {
            Some(mt) => self
                .heap
                .table(mt)
                .map(|t| t.raw_get(&self.tm_name(kind).into()))
                .unwrap_or_default(),
            None => Value::Null,
        }
    }

    // ============ User data ============

    /// Destructor run for every freed user data carrying `tag`
    pub fn set_userdata_destructor(&mut self, tag: u8, dtor: Option<UserdataDtor>) -> VmResult<()> {
        if tag >= UTAG_LIMIT {
            return Err(VmError::bad_argument(1, "user data tag out of range"));
        }
        self.userdata_dtors[tag as usize] = dtor;
        Ok(())
    }

    pub fn userdata_tag(&self, u: UserdataId) -> VmResult<u8> {
        Ok(self.heap.userdata(u).ok_or(VmError::DeadObject)?.tag())
    }

    // ============ Threads ============

    pub fn thread_status(&self, th: ThreadId) -> VmResult<CoStatus> {
        self.check_owner(th)?;
        Ok(self.heap.try_thread(th.gc)?.status)
    }

    pub fn thread_traceback(&self, th: ThreadId) -> VmResult<Option<String>> {
        self.check_owner(th)?;
        Ok(self.heap.try_thread(th.gc)?.traceback.clone())
    }

    /// Return a finished, failed or never started thread to `Ready` with an empty stack
    pub fn reset_thread(&mut self, th: ThreadId) -> VmResult<()> {
        self.check_owner(th)?;
        let status = self.heap.try_thread(th.gc)?.status;
        if matches!(status, CoStatus::Running | CoStatus::Normal) || th == self.main_thread {
            return Err(VmError::runtime("cannot reset a running thread"));
        }
        self.close_upvalues(th.gc, 0)?;
        let state = self.heap.try_thread_mut(th.gc)?;
        state.clear();
        state.status = CoStatus::Ready;
        state.traceback = None;
        self.thread_barrier(th.gc);
        self.account_resize(th.gc);
        Ok(())
    }

    /// Move the top `n` values of `from` onto `to`
    pub fn exchange_move(&mut self, from: ThreadId, to: ThreadId, n: usize) -> VmResult<()> {
        self.check_owner(from)?;
        self.check_owner(to)?;
        if n == 0 || from == to {
            return Ok(());
        }
        let values = {
            let src = self.heap.try_thread_mut(from.gc)?;
            let available = src.top - src.frame_base();
            if n > available {
                return Err(VmError::IndexOutOfRange {
                    index: n as i64,
                    len: available,
                });
            }
            let start = src.top - n;
            let values = src.stack[start..src.top].to_vec();
            for slot in &mut src.stack[start..src.top] {
                *slot = Value::Null;
            }
            src.top = start;
            values
        };
        self.push_values(to.gc, &values)
    }

    /// Copy the value at API index `index` of `from` onto `to`
    pub fn exchange_push(&mut self, from: ThreadId, to: ThreadId, index: i32) -> VmResult<()> {
        self.check_owner(from)?;
        self.check_owner(to)?;
        let value = {
            let src = self.heap.try_thread(from.gc)?;
            let abs = api::resolve_index(src, index)?;
            src.get(abs)
        };
        self.push_values(to.gc, &[value])
    }

    pub(crate) fn push_values(&mut self, th: GcRef, values: &[Value]) -> VmResult<()> {
        self.thread_barrier(th);
        let dst = self.heap.try_thread_mut(th)?;
        dst.check_stack(values.len())?;
        for &v in values {
            dst.push(v)?;
        }
        self.account_resize(th);
        Ok(())
    }

    // ============ Garbage collection ============

    fn gc_roots(&self) -> Vec<Value> {
        let mut roots = Vec::with_capacity(8 + self.running.len() + self.tm_names.len());
        roots.push(self.registry.into());
        roots.push(self.globals.into());
        roots.push(self.main_thread.into());
        roots.extend(self.type_metatables.iter().flatten().map(|&mt| Value::from(mt)));
        roots.extend(self.running.iter().map(|&th| Value::from(th)));
        roots.extend(self.tm_names.iter().map(|&s| Value::from(s)));
        roots
    }

    /// Safe point: take a step if the allocation debt calls for one
    #[inline]
    pub fn check_gc(&mut self) {
        if self.gc.should_step() {
            self.gc_step();
        }
    }

    /// One incremental step, regardless of the debt
    pub fn gc_step(&mut self) {
        let roots = self.gc_roots();
        let mut ctx = GcHeap {
            heap: &mut self.heap,
            strings: &mut self.strings,
            dtors: &self.userdata_dtors,
        };
        self.gc.step(&roots, &mut ctx);
    }

    pub(crate) fn full_gc(&mut self) {
        let roots = self.gc_roots();
        let mut ctx = GcHeap {
            heap: &mut self.heap,
            strings: &mut self.strings,
            dtors: &self.userdata_dtors,
        };
        self.gc.full_gc(&roots, &mut ctx);
    }

    /// Full collection; returns the number of bytes freed
    pub fn collect_garbage(&mut self) -> usize {
        let before = self.gc.stats.bytes_freed;
        self.full_gc();
        self.gc.stats.bytes_freed - before
    }

    /// Accounted heap size in bytes
    pub fn gc_count(&self) -> usize {
        self.gc.total_bytes
    }

    pub fn gc_stop(&mut self) {
        self.gc.stopped = true;
    }

    pub fn gc_restart(&mut self) {
        self.gc.stopped = false;
    }

    pub fn gc_is_running(&self) -> bool {
        !self.gc.stopped
    }

    pub fn set_gc_params(&mut self, params: GcParams) {
        self.options.gc = params;
        self.gc.params = params;
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.gc.stats()
    }

    pub fn gc_state(&self) -> crate::gc::GcState {
        self.gc.state()
    }

    /// Number of live heap objects
    pub fn object_count(&self) -> usize {
        self.heap.len()
    }

    /// Whether a handle still resolves to a live object
    pub fn is_alive(&self, r: GcRef) -> bool {
        self.heap.contains(r)
    }

    #[inline]
    pub(crate) fn barrier(&mut self, owner: GcRef, v: Value) {
        self.gc.barrier(&mut self.heap, owner, v);
    }

    #[inline]
    pub(crate) fn barrier_back(&mut self, owner: GcRef, v: Value) {
        self.gc.barrier_back(&mut self.heap, owner, v);
    }

    #[inline]
    pub(crate) fn thread_barrier(&mut self, th: GcRef) {
        self.gc.thread_barrier(&mut self.heap, th);
    }

    /// Destroy the state, running the destructors of all remaining user data
    pub fn close(self) {}
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new(SafeOption::default())
    }
}

impl Drop for GlobalState {
    fn drop(&mut self) {
        let userdata: Vec<GcRef> = self
            .heap
            .refs()
            .filter(|r| r.kind() == ObjectKind::Userdata)
            .collect();
        for r in userdata {
            if let Some(ud) = UserdataId::from_ref(r).and_then(|id| self.heap.userdata_mut(id)) {
                ud.destroy(&self.userdata_dtors);
            }
        }
    }
}
