// Host API
//
// `StateMut` is a view of one thread of a `GlobalState`. Stack indices are
// 1-based from the base of the innermost frame (the first argument inside a
// native function); negative indices count down from the top, -1 being the
// topmost value. Every object a call creates is pushed before the collector
// is allowed to run.

use std::any::Any;

use crate::gc::{FunctionId, GcObject, GcRef, StringId, TableId, ThreadId, UserdataId};
use crate::value::{FunctionKind, NativeFn, Userdata, UserdataDtor, Value, ValueType};
use crate::vm::execute::{self, Entry, ExecOutcome};
use crate::vm::{GcParams, GlobalState, ThreadState, VmError, VmResult};

/// How a host-driven resume ended; the payload is the number of values
/// pushed onto the resuming thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStatus {
    Yielded(usize),
    Finished(usize),
}

/// Absolute stack position of API index `index`
pub(crate) fn resolve_index(st: &ThreadState, index: i32) -> VmResult<usize> {
    let base = st.frame_base();
    let len = st.top.saturating_sub(base);
    let abs = if index > 0 {
        let i = index as usize - 1;
        (i < len).then_some(base + i)
    } else if index < 0 {
        let n = index.unsigned_abs() as usize;
        (n <= len).then(|| st.top - n)
    } else {
        None
    };
    abs.ok_or(VmError::IndexOutOfRange {
        index: index as i64,
        len,
    })
}

pub struct StateMut<'a> {
    pub(crate) g: &'a mut GlobalState,
    pub(crate) thread: GcRef,
}

impl<'a> StateMut<'a> {
    #[inline]
    pub fn global(&self) -> &GlobalState {
        self.g
    }

    #[inline]
    pub fn global_mut(&mut self) -> &mut GlobalState {
        self.g
    }

    /// Handle of the thread this view operates on
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.g.thread_id(self.thread)
    }

    #[inline]
    fn st(&self) -> VmResult<&ThreadState> {
        self.g.heap.try_thread(self.thread)
    }

    /// Mutable thread state; the thread is re-grayed first, since the caller
    /// may store objects the collector has not seen
    #[inline]
    fn st_mut(&mut self) -> VmResult<&mut ThreadState> {
        self.g.thread_barrier(self.thread);
        self.g.heap.try_thread_mut(self.thread)
    }

    fn abs(&self, index: i32) -> VmResult<usize> {
        resolve_index(self.st()?, index)
    }

    // ============ Stack ============

    /// Positive form of `index`
    pub fn abs_index(&self, index: i32) -> VmResult<i32> {
        let st = self.st()?;
        let abs = resolve_index(st, index)?;
        Ok((abs - st.frame_base() + 1) as i32)
    }

    /// Number of values in the current frame
    pub fn get_top(&self) -> usize {
        self.st()
            .map(|st| st.top.saturating_sub(st.frame_base()))
            .unwrap_or(0)
    }

    /// Set the number of values: a non-negative `index` becomes the new
    /// count, filling with null; a negative one drops values above it.
    pub fn set_top(&mut self, index: i32) -> VmResult<()> {
        let st = self.st_mut()?;
        let base = st.frame_base();
        let new_top = if index >= 0 {
            base + index as usize
        } else {
            let drop = (index.unsigned_abs() as usize).saturating_sub(1);
            let len = st.top - base;
            if drop > len {
                return Err(VmError::IndexOutOfRange {
                    index: index as i64,
                    len,
                });
            }
            st.top - drop
        };
        st.grow_stack(new_top)?;
        if new_top > st.top {
            st.stack[st.top..new_top].fill(Value::Null);
        } else {
            st.stack[new_top..st.top].fill(Value::Null);
        }
        st.top = new_top;
        Ok(())
    }

    /// Drop `n` values
    pub fn pop(&mut self, n: usize) -> VmResult<()> {
        self.set_top(-(n as i32) - 1)
    }

    pub fn pop_value(&mut self) -> VmResult<Value> {
        self.st_mut()?
            .pop()
            .ok_or(VmError::IndexOutOfRange { index: -1, len: 0 })
    }

    /// Room for `n` more values
    pub fn check_stack(&mut self, n: usize) -> VmResult<()> {
        self.st_mut()?.check_stack(n)
    }

    /// Push an arbitrary value
    pub fn push(&mut self, value: Value) -> VmResult<()> {
        self.g.push_values(self.thread, &[value])
    }

    /// Push a copy of the value at `index`
    pub fn push_value(&mut self, index: i32) -> VmResult<()> {
        let v = self.value(index)?;
        self.push(v)
    }

    /// Remove the value at `index`, shifting the ones above down
    pub fn remove(&mut self, index: i32) -> VmResult<()> {
        let abs = self.abs(index)?;
        let st = self.st_mut()?;
        let top = st.top;
        st.stack.copy_within(abs + 1..top, abs);
        st.top -= 1;
        st.stack[st.top] = Value::Null;
        Ok(())
    }

    /// Move the top value to `index`, shifting the ones above up
    pub fn insert(&mut self, index: i32) -> VmResult<()> {
        let abs = self.abs(index)?;
        let st = self.st_mut()?;
        let top = st.top;
        let v = st.stack[top - 1];
        st.stack.copy_within(abs..top - 1, abs + 1);
        st.stack[abs] = v;
        Ok(())
    }

    /// Pop the top value into `index`
    pub fn replace(&mut self, index: i32) -> VmResult<()> {
        let abs = self.abs(index)?;
        let v = self.value(-1)?;
        self.st_mut()?.stack[abs] = v;
        self.pop(1)
    }

    pub fn value(&self, index: i32) -> VmResult<Value> {
        let st = self.st()?;
        Ok(st.get(resolve_index(st, index)?))
    }

    // ============ Arguments of a native function ============

    /// Number of arguments passed to the running native function
    #[inline]
    pub fn arg_count(&self) -> usize {
        self.get_top()
    }

    /// Argument `n` (1-based), `None` when absent
    pub fn arg(&self, n: usize) -> Option<Value> {
        if n == 0 || n > self.arg_count() {
            return None;
        }
        self.value(n as i32).ok()
    }

    pub fn check_any(&self, n: usize) -> VmResult<Value> {
        self.arg(n)
            .ok_or_else(|| VmError::bad_argument(n, "value expected"))
    }

    pub fn check_number(&self, n: usize) -> VmResult<f64> {
        let v = self.arg(n).unwrap_or_default();
        self.g
            .to_number(&v)
            .ok_or_else(|| self.type_error(n, "number", &v))
    }

    pub fn opt_number(&self, n: usize, default: f64) -> VmResult<f64> {
        match self.arg(n) {
            None | Some(Value::Null) => Ok(default),
            Some(_) => self.check_number(n),
        }
    }

    pub fn check_string(&self, n: usize) -> VmResult<String> {
        let v = self.arg(n).unwrap_or_default();
        match v {
            Value::Number(x) => Ok(crate::value::format_number(x)),
            _ => self
                .g
                .value_bytes(&v)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .ok_or_else(|| self.type_error(n, "string", &v)),
        }
    }

    pub fn check_table(&self, n: usize) -> VmResult<TableId> {
        let v = self.arg(n).unwrap_or_default();
        v.as_table_id()
            .ok_or_else(|| self.type_error(n, "table", &v))
    }

    fn type_error(&self, n: usize, expected: &str, got: &Value) -> VmError {
        let got = if self.arg(n).is_none() {
            "no value"
        } else {
            got.type_name()
        };
        VmError::bad_argument(n, format!("{} expected, got {}", expected, got))
    }

    // ============ Probes and conversions ============

    /// Number, or string convertible to one
    pub fn is_number(&self, index: i32) -> bool {
        self.value(index)
            .is_ok_and(|v| self.g.to_number(&v).is_some())
    }

    /// String, or number (always convertible to one)
    pub fn is_string(&self, index: i32) -> bool {
        self.value(index)
            .is_ok_and(|v| v.is_string() || v.is_number())
    }

    /// Type of the value at `index`; `None` for an invalid index
    pub fn get_type(&self, index: i32) -> Option<ValueType> {
        self.value(index).ok().map(|v| v.value_type())
    }

    pub fn to_boolean(&self, index: i32) -> bool {
        self.value(index).is_ok_and(|v| v.is_truthy())
    }

    pub fn to_number(&self, index: i32) -> Option<f64> {
        self.value(index).ok().and_then(|v| self.g.to_number(&v))
    }

    /// String at `index`. A number is converted in place.
    pub fn to_string(&mut self, index: i32) -> VmResult<Option<StringId>> {
        let abs = self.abs(index)?;
        let v = self.st()?.get(abs);
        let Some(s) = self.g.to_string_id(&v)? else {
            return Ok(None);
        };
        if v.is_number() {
            self.st_mut()?.stack[abs] = s.into();
        }
        Ok(Some(s))
    }

    /// Text of the string at `index` (numbers converted in place)
    pub fn to_str(&mut self, index: i32) -> VmResult<Option<String>> {
        let Some(s) = self.to_string(index)? else {
            return Ok(None);
        };
        Ok(Some(self.g.heap.try_string(s)?.to_str_lossy().into_owned()))
    }

    // ============ Pushes ============

    pub fn push_null(&mut self) -> VmResult<()> {
        self.push(Value::Null)
    }

    pub fn push_boolean(&mut self, b: bool) -> VmResult<()> {
        self.push(Value::Boolean(b))
    }

    pub fn push_number(&mut self, n: f64) -> VmResult<()> {
        self.push(Value::Number(n))
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> VmResult<StringId> {
        let s = self.g.intern(bytes)?;
        self.push(s.into())?;
        self.g.check_gc();
        Ok(s)
    }

    pub fn push_string(&mut self, s: &str) -> VmResult<StringId> {
        self.push_bytes(s.as_bytes())
    }

    /// Native closure capturing the top `n` values as upvalues, which are popped
    pub fn push_closure(&mut self, func: NativeFn, n: usize) -> VmResult<FunctionId> {
        let upvalues = {
            let st = self.st()?;
            let len = st.top - st.frame_base();
            if n > len {
                return Err(VmError::IndexOutOfRange {
                    index: n as i64,
                    len,
                });
            }
            st.stack[st.top - n..st.top].to_vec()
        };
        // upvalues stay on the stack until the closure holds them
        let f = self.g.new_native(func, upvalues)?;
        self.pop(n)?;
        self.push(f.into())?;
        self.g.check_gc();
        Ok(f)
    }

    pub fn push_function(&mut self, func: NativeFn) -> VmResult<FunctionId> {
        self.push_closure(func, 0)
    }

    fn current_native(&self) -> VmResult<FunctionId> {
        self.st()?
            .current_frame()
            .filter(|ci| ci.is_native())
            .map(|ci| ci.func)
            .ok_or_else(|| VmError::runtime("no native function is running"))
    }

    /// Upvalue `n` (1-based) of the running native closure
    pub fn native_upvalue(&self, n: usize) -> VmResult<Value> {
        let f = self.current_native()?;
        match &self.g.heap.try_function(f)?.kind {
            FunctionKind::Native { upvalues, .. } => Ok(n
                .checked_sub(1)
                .and_then(|i| upvalues.get(i))
                .copied()
                .unwrap_or_default()),
            FunctionKind::Script { .. } => Err(VmError::runtime("not a native closure")),
        }
    }

    pub fn set_native_upvalue(&mut self, n: usize, value: Value) -> VmResult<()> {
        let f = self.current_native()?;
        let Some(func) = self.g.heap.function_mut(f) else {
            return Err(VmError::DeadObject);
        };
        match &mut func.kind {
            FunctionKind::Native { upvalues, .. } => {
                let len = upvalues.len();
                let slot = n.checked_sub(1).and_then(|i| upvalues.get_mut(i)).ok_or(
                    VmError::IndexOutOfRange {
                        index: n as i64,
                        len,
                    },
                )?;
                *slot = value;
            }
            FunctionKind::Script { .. } => return Err(VmError::runtime("not a native closure")),
        }
        self.g.barrier(f.gc_ref(), value);
        Ok(())
    }

    // ============ Tables ============

    pub fn new_table(&mut self) -> VmResult<TableId> {
        self.create_table(0)
    }

    pub fn create_table(&mut self, capacity: usize) -> VmResult<TableId> {
        let t = self.g.new_table(capacity)?;
        self.push(t.into())?;
        self.g.check_gc();
        Ok(t)
    }

    /// Push `t[k]` where `t` is at `index` and `k` is the popped top value
    pub fn get_table(&mut self, index: i32) -> VmResult<ValueType> {
        let obj = self.value(index)?;
        let key = self.value(-1)?;
        let v = execute::index(self.g, self.thread, obj, key)?;
        self.pop(1)?;
        self.push(v)?;
        Ok(v.value_type())
    }

    /// `t[k] = v` where `t` is at `index`, `v` the top value and `k` the one below it; both popped
    pub fn set_table(&mut self, index: i32) -> VmResult<()> {
        let obj = self.value(index)?;
        let key = self.value(-2)?;
        let v = self.value(-1)?;
        execute::new_index(self.g, self.thread, obj, key, v)?;
        self.pop(2)
    }

    pub fn get_field(&mut self, index: i32, name: &str) -> VmResult<ValueType> {
        let obj = self.value(index)?;
        let key = self.push_string(name)?;
        let v = execute::index(self.g, self.thread, obj, key.into())?;
        self.pop(1)?;
        self.push(v)?;
        Ok(v.value_type())
    }

    /// `t[name] = v` with `v` popped from the top
    pub fn set_field(&mut self, index: i32, name: &str) -> VmResult<()> {
        let obj = self.value(index)?;
        let key = self.push_string(name)?;
        let v = self.value(-2)?;
        execute::new_index(self.g, self.thread, obj, key.into(), v)?;
        self.pop(2)
    }

    fn table_at(&self, index: i32) -> VmResult<TableId> {
        let v = self.value(index)?;
        v.as_table_id().ok_or(VmError::Index {
            target: v.type_name(),
        })
    }

    /// Like `get_table` without metamethods
    pub fn raw_get(&mut self, index: i32) -> VmResult<ValueType> {
        let t = self.table_at(index)?;
        let key = self.value(-1)?;
        let v = self.g.table_get(t, &key)?;
        self.pop(1)?;
        self.push(v)?;
        Ok(v.value_type())
    }

    /// Like `set_table` without metamethods
    pub fn raw_set(&mut self, index: i32) -> VmResult<()> {
        let t = self.table_at(index)?;
        let key = self.value(-2)?;
        let v = self.value(-1)?;
        self.g.table_set(t, key, v)?;
        self.pop(2)
    }

    pub fn get_global(&mut self, name: &str) -> VmResult<ValueType> {
        let globals = self.g.globals;
        let key = self.push_string(name)?;
        let v = execute::index(self.g, self.thread, globals.into(), key.into())?;
        self.pop(1)?;
        self.push(v)?;
        Ok(v.value_type())
    }

    /// Pop the top value into global `name`
    pub fn set_global(&mut self, name: &str) -> VmResult<()> {
        let globals = self.g.globals;
        let key = self.push_string(name)?;
        let v = self.value(-2)?;
        execute::new_index(self.g, self.thread, globals.into(), key.into(), v)?;
        self.pop(2)
    }

    /// Push the metatable of the value at `index`; nothing is pushed when it has none
    pub fn get_metatable(&mut self, index: i32) -> VmResult<bool> {
        let v = self.value(index)?;
        match self.g.get_metatable(&v) {
            Some(mt) => {
                self.push(mt.into())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pop a table (or null) and make it the metatable of the value at `index`
    pub fn set_metatable(&mut self, index: i32) -> VmResult<()> {
        let v = self.value(index)?;
        let mt = match self.value(-1)? {
            Value::Null => None,
            m => Some(m.as_table_id().ok_or_else(|| {
                VmError::runtime(format!("metatable must be a table, got {}", m.type_name()))
            })?),
        };
        self.g.set_metatable(&v, mt)?;
        self.pop(1)
    }

    /// Pop a key and push the next key and value of the table at `index`.
    /// Returns false, pushing nothing, after the last entry.
    pub fn next(&mut self, index: i32) -> VmResult<bool> {
        let t = self.table_at(index)?;
        let key = self.value(-1)?;
        let entry = self.g.table_next(t, &key)?;
        self.pop(1)?;
        match entry {
            Some((k, v)) => {
                self.push(k)?;
                self.push(v)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ============ Calls ============

    /// Call the function below the top `nargs` values; leaves `nresults`
    /// results (all of them for `MULTRET`) in its place
    pub fn call(&mut self, nargs: usize, nresults: i32) -> VmResult<()> {
        let func_index = {
            let st = self.st()?;
            let len = st.top - st.frame_base();
            if nargs + 1 > len {
                return Err(VmError::IndexOutOfRange {
                    index: -(nargs as i64) - 1,
                    len,
                });
            }
            st.top - nargs - 1
        };
        execute::call_at(self.g, self.thread, func_index, nresults)?;
        self.g.check_gc();
        Ok(())
    }

    /// `call`, catching catchable errors: on failure the message is pushed
    /// in place of the function and its arguments and false is returned
    pub fn pcall(&mut self, nargs: usize, nresults: i32) -> VmResult<bool> {
        match self.call(nargs, nresults) {
            Ok(()) => Ok(true),
            Err(e) if e.is_catchable() => {
                self.st_mut()?.error_pending = false;
                self.push_string(&e.to_string())?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Resume `co` with the top `nargs` values of this thread. Yielded or
    /// returned values are pushed onto this thread.
    pub fn resume(&mut self, co: ThreadId, nargs: usize) -> VmResult<ResumeStatus> {
        self.g.check_owner(co)?;
        if co.gc == self.thread {
            return Err(VmError::runtime("cannot resume non-suspended coroutine"));
        }
        execute::check_resumable(self.g, co.gc)?;
        let args = {
            let st = self.st_mut()?;
            let len = st.top - st.frame_base();
            if nargs > len {
                return Err(VmError::IndexOutOfRange {
                    index: nargs as i64,
                    len,
                });
            }
            let start = st.top - nargs;
            st.values_from(start)
        };
        // arguments stay anchored here until they are on the coroutine's stack
        let outcome = execute::execute(self.g, co.gc, Entry::Resume(args));
        self.pop(nargs)?;
        let (status, values) = match outcome? {
            ExecOutcome::Yielded(values) => (ResumeStatus::Yielded(values.len()), values),
            ExecOutcome::Finished(values) => (ResumeStatus::Finished(values.len()), values),
            ExecOutcome::Returned => {
                return Err(VmError::runtime("coroutine returned to a fresh frame"));
            }
        };
        self.g.push_values(self.thread, &values)?;
        self.g.check_gc();
        Ok(status)
    }

    /// New thread, pushed onto this one. Give it a body by pushing a function
    /// onto its stack before the first resume.
    pub fn new_thread(&mut self) -> VmResult<ThreadId> {
        let co = self.g.new_thread_object()?;
        self.push(co.into())?;
        self.g.check_gc();
        Ok(co)
    }

    /// Load a chunk and push its main function
    pub fn load(&mut self, bytes: &[u8], chunkname: &str) -> VmResult<FunctionId> {
        let f = crate::bytecode::load(self.g, bytes, chunkname)?;
        self.push(f.into())?;
        self.g.check_gc();
        Ok(f)
    }

    // ============ User data ============

    pub fn new_userdata<T: Any>(&mut self, tag: u8, payload: T) -> VmResult<UserdataId> {
        self.push_userdata(Userdata::new(tag, Box::new(payload)))
    }

    /// User data carrying its own destructor
    pub fn new_userdata_dtor<T: Any>(
        &mut self,
        payload: T,
        dtor: UserdataDtor,
    ) -> VmResult<UserdataId> {
        self.push_userdata(Userdata::with_dtor(Box::new(payload), dtor))
    }

    fn push_userdata(&mut self, ud: Userdata) -> VmResult<UserdataId> {
        let r = self.g.alloc(GcObject::Userdata(ud))?;
        let id = UserdataId::from_ref(r).ok_or(VmError::DeadObject)?;
        self.push(id.into())?;
        self.g.check_gc();
        Ok(id)
    }

    /// Payload at `index`, if it is user data holding a `T`
    pub fn to_userdata<T: Any>(&mut self, index: i32) -> Option<&mut T> {
        let id = self.value(index).ok()?.as_userdata_id()?;
        self.g.heap.userdata_mut(id)?.downcast_mut::<T>()
    }

    pub fn userdata_tag(&self, index: i32) -> Option<u8> {
        let id = self.value(index).ok()?.as_userdata_id()?;
        self.g.userdata_tag(id).ok()
    }

    // ============ Collector ============

    pub fn collect_garbage(&mut self) -> usize {
        self.g.collect_garbage()
    }

    pub fn gc_step(&mut self) {
        self.g.gc_step();
    }

    pub fn gc_count(&self) -> usize {
        self.g.gc_count()
    }

    pub fn gc_stop(&mut self) {
        self.g.gc_stop();
    }

    pub fn gc_restart(&mut self) {
        self.g.gc_restart();
    }

    pub fn set_gc_params(&mut self, params: GcParams) {
        self.g.set_gc_params(params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::SafeOption;

    #[test]
    fn indices_resolve_from_both_ends() {
        let mut g = GlobalState::new(SafeOption::default());
        let mut s = g.main();
        for i in 0..3 {
            s.push_number(i as f64).unwrap();
        }
        assert_eq!(s.abs_index(-1).unwrap(), 3);
        assert_eq!(s.value(1).unwrap().as_number(), Some(0.0));
        assert_eq!(s.value(-3).unwrap().as_number(), Some(0.0));
        assert!(s.value(4).is_err());
        assert!(s.value(-4).is_err());
        assert!(s.value(0).is_err());
    }

    #[test]
    fn insert_remove_replace() {
        let mut g = GlobalState::new(SafeOption::default());
        let mut s = g.main();
        for i in 1..=3 {
            s.push_number(i as f64).unwrap();
        }
        s.insert(1).unwrap(); // 3 1 2
        assert_eq!(s.to_number(1), Some(3.0));
        s.remove(2).unwrap(); // 3 2
        assert_eq!(s.get_top(), 2);
        assert_eq!(s.to_number(2), Some(2.0));
        s.push_number(9.0).unwrap();
        s.replace(1).unwrap(); // 9 2
        assert_eq!(s.get_top(), 2);
        assert_eq!(s.to_number(1), Some(9.0));
        s.set_top(4).unwrap();
        assert!(s.value(4).unwrap().is_null());
        s.set_top(-3).unwrap();
        assert_eq!(s.get_top(), 2);
    }
}
