// Open upvalue bookkeeping
//
// A thread's open upvalues are kept sorted by stack level. Closing from a
// level therefore splits the list once instead of scanning it.

use crate::gc::{GcObject, GcRef, UpvalueId};
use crate::value::Upvalue;
use crate::vm::{GlobalState, VmError, VmResult};

impl GlobalState {
    /// Upvalue aliasing `level` on `th`, reusing an existing open one.
    pub(crate) fn find_or_create_upvalue(&mut self, th: GcRef, level: usize) -> VmResult<UpvalueId> {
        let existing = self.heap.try_thread(th)?.find_open_upvalue(level);
        if let Some(uv) = existing {
            // condemned by the running sweep but about to be referenced again
            if let Some(header) = self.heap.header_mut(uv.gc_ref()) {
                if header.is_dead(self.gc.current_white) {
                    header.make_white(self.gc.current_white);
                }
            }
            return Ok(uv);
        }

        let r = self.alloc(GcObject::Upvalue(Upvalue::Open {
            thread: th,
            stack_index: level,
        }))?;
        let uv = UpvalueId::from_ref(r).ok_or(VmError::DeadObject)?;
        self.heap.try_thread_mut(th)?.insert_open_upvalue(level, uv);
        if !self.gc.twups.contains(&th) {
            self.gc.twups.push(th);
        }
        self.thread_barrier(th);
        Ok(uv)
    }

    /// Close every open upvalue of `th` at or above `level`
    pub(crate) fn close_upvalues(&mut self, th: GcRef, level: usize) -> VmResult<()> {
        let closing = {
            let state = self.heap.try_thread_mut(th)?;
            let from = state.first_open_at(level);
            if from == state.open_upvalues.len() {
                return Ok(());
            }
            let tail = state.open_upvalues.split_off(from);
            tail.into_iter()
                .map(|(idx, uv)| (uv, state.get(idx)))
                .collect::<Vec<_>>()
        };
        for (uv, value) in closing {
            let Some(upvalue) = self.heap.upvalue_mut(uv) else {
                continue;
            };
            upvalue.close(value);
            // an open upvalue is never blackened; once closed it is an
            // ordinary object and must not point to a white value
            if let Some(header) = self.heap.header_mut(uv.gc_ref()) {
                if !header.is_white() {
                    header.make_black();
                }
            }
            self.barrier(uv.gc_ref(), value);
        }
        Ok(())
    }

    /// Current value of an upvalue, reading through to the stack when open
    pub(crate) fn upvalue_get(&self, uv: UpvalueId) -> VmResult<crate::value::Value> {
        match *self.heap.try_upvalue(uv)? {
            Upvalue::Open {
                thread,
                stack_index,
            } => Ok(self.heap.try_thread(thread)?.get(stack_index)),
            Upvalue::Closed(v) => Ok(v),
        }
    }

    pub(crate) fn upvalue_set(&mut self, uv: UpvalueId, value: crate::value::Value) -> VmResult<()> {
        match *self.heap.try_upvalue(uv)? {
            Upvalue::Open {
                thread,
                stack_index,
            } => {
                self.heap.try_thread_mut(thread)?.set(stack_index, value)?;
                self.thread_barrier(thread);
            }
            Upvalue::Closed(_) => {
                if let Some(slot) = self.heap.upvalue_mut(uv) {
                    *slot = Upvalue::Closed(value);
                }
                self.barrier(uv.gc_ref(), value);
            }
        }
        Ok(())
    }
}
