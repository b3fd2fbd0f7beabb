/*----------------------------------------------------------------------
  Interpreter loop

  One loop per entry from Rust. Calls and returns between script functions
  only swap the frame context (`continue 'startfunc`); so do coroutine
  switches, which return an event to `drive`, the loop that follows the
  resumer chain. A native function calling back into scripts (`call_at`)
  starts a nested loop whose first frame is marked fresh; returning from that
  frame ends the nested loop.

  Threads live in the heap, so every stack access goes through a handle
  lookup. Nothing borrowed from the heap is held across an instruction.
----------------------------------------------------------------------*/

mod call;
mod coroutine;
mod metamethod;

use std::rc::Rc;

use crate::gc::{FunctionId, GcObject, GcRef, ObjectKind, ProtoId, TableId, UpvalueId};
use crate::value::{Function, FunctionKind, Prototype, Value};
use crate::vm::{GlobalState, OpCode, ResumePoint, Resumer, VmError, VmResult};

pub(crate) use call::{Precall, call_at, call_value, capture_traceback, precall};
pub(crate) use coroutine::check_resumable;
pub use metamethod::TmKind;
pub(crate) use metamethod::{
    arith, concat, equal, index, length, less_equal, less_than, new_index,
};

/// How a loop was entered
pub(crate) enum Entry {
    /// A fresh frame was pushed by `call_at`
    Call,
    /// The host resumes the base thread with these arguments
    Resume(Vec<Value>),
}

/// How a loop ended normally
pub(crate) enum ExecOutcome {
    /// The fresh frame returned; results are in place on the base thread
    Returned,
    /// The host-resumed base thread yielded these values
    Yielded(Vec<Value>),
    /// The host-resumed base thread's body returned these values
    Finished(Vec<Value>),
}

/// Why `run` stopped executing a thread
pub(crate) enum Event {
    Return,
    Switch(GcRef),
    ToHost(ExecOutcome),
    /// `e` raised on a thread other than the one running
    Raise(GcRef, VmError),
}

/// Run `base` until its fresh frame returns, or until it yields or finishes
/// when entered through a resume.
pub(crate) fn execute(g: &mut GlobalState, base: GcRef, entry: Entry) -> VmResult<ExecOutcome> {
    let mark = g.running.len();
    let result = drive(g, base, entry);
    g.running.truncate(mark);
    result
}

fn drive(g: &mut GlobalState, base: GcRef, entry: Entry) -> VmResult<ExecOutcome> {
    let resumed = matches!(entry, Entry::Resume(_));
    match entry {
        Entry::Call => g.running.push(base),
        Entry::Resume(args) => {
            check_resumable(g, base)?;
            match coroutine::begin_resume(g, base, Resumer::Host, args) {
                Ok(None) => {}
                Ok(Some(values)) => {
                    return match coroutine::finish(g, base, values)? {
                        Event::ToHost(outcome) => Ok(outcome),
                        _ => Err(VmError::runtime("host resume finished into a thread")),
                    };
                }
                Err(e) => {
                    coroutine::fail_thread(g, base, &e);
                    return Err(e);
                }
            }
        }
    }

    let mut cur = base;
    loop {
        let event = match run(g, cur) {
            Ok(event) => event,
            Err(e) => Event::Raise(cur, e),
        };
        match event {
            Event::Return => {
                if cur == base {
                    return Ok(ExecOutcome::Returned);
                }
                return Err(VmError::runtime("fresh frame returned on a switched thread"));
            }
            Event::Switch(next) => cur = next,
            Event::ToHost(outcome) => return Ok(outcome),
            Event::Raise(failing, e) => {
                cur = coroutine::unwind(g, base, failing, e, resumed)?;
            }
        }
    }
}

// ============ Frame helpers ============

#[inline(always)]
fn reg(g: &GlobalState, th: GcRef, index: usize) -> VmResult<Value> {
    Ok(g.heap.try_thread(th)?.get(index))
}

#[inline(always)]
fn set_reg(g: &mut GlobalState, th: GcRef, index: usize, value: Value) -> VmResult<()> {
    g.heap.try_thread_mut(th)?.set(index, value)
}

#[inline(always)]
fn top(g: &GlobalState, th: GcRef) -> VmResult<usize> {
    Ok(g.heap.try_thread(th)?.top)
}

#[inline(always)]
fn constant(proto: &Prototype, index: usize) -> VmResult<Value> {
    proto
        .constants
        .get(index)
        .copied()
        .ok_or_else(|| VmError::Malformed(format!("constant {} out of range", index)))
}

/// Move the program counter of the current frame by `offset`
fn jump(g: &mut GlobalState, th: GcRef, code_len: usize, offset: i32) -> VmResult<()> {
    let st = g.heap.try_thread_mut(th)?;
    let ci = st
        .current_frame_mut()
        .ok_or_else(|| VmError::runtime("jump without a frame"))?;
    let target = ci.pc as i64 + offset as i64;
    if target < 0 || target as usize > code_len {
        return Err(VmError::Malformed(format!("jump target {} out of range", target)));
    }
    ci.pc = target as usize;
    Ok(())
}

fn upvalue_of(g: &GlobalState, func: FunctionId, index: usize) -> VmResult<UpvalueId> {
    g.heap
        .try_function(func)?
        .upvalue_id(index)
        .ok_or_else(|| VmError::Malformed(format!("upvalue {} out of range", index)))
}

fn env_of(g: &GlobalState, func: FunctionId) -> TableId {
    g.heap
        .function(func)
        .and_then(|f| f.env)
        .unwrap_or(g.globals)
}

/// Instantiate `proto` inside the frame of `parent` (registers at `base`)
fn make_closure(
    g: &mut GlobalState,
    th: GcRef,
    proto_id: ProtoId,
    base: usize,
    parent: FunctionId,
) -> VmResult<FunctionId> {
    let proto = g.heap.try_proto(proto_id)?.clone();
    let (parent_upvalues, env) = {
        let f = g.heap.try_function(parent)?;
        let upvalues = match &f.kind {
            FunctionKind::Script { upvalues, .. } => upvalues.clone(),
            FunctionKind::Native { .. } => Vec::new(),
        };
        (upvalues, f.env)
    };
    let mut upvalues = Vec::with_capacity(proto.upvalue_descs.len());
    for desc in &proto.upvalue_descs {
        let uv = if desc.in_stack {
            g.find_or_create_upvalue(th, base + desc.index as usize)?
        } else {
            parent_upvalues
                .get(desc.index as usize)
                .copied()
                .ok_or_else(|| VmError::Malformed("enclosing upvalue out of range".into()))?
        };
        upvalues.push(uv);
    }
    let r = g.alloc(GcObject::Function(Function::script(proto_id, upvalues, env)))?;
    FunctionId::from_ref(r).ok_or(VmError::DeadObject)
}

/// Values `R[first..first+n]`, with `n` read from the top when `count` is 0
fn collect_args(g: &GlobalState, th: GcRef, first: usize, count: u32) -> VmResult<Vec<Value>> {
    let st = g.heap.try_thread(th)?;
    let end = if count != 0 {
        first + count as usize - 1
    } else {
        st.top.max(first)
    };
    Ok((first..end).map(|i| st.get(i)).collect())
}

// ============ Dispatch ============

fn run(g: &mut GlobalState, th: GcRef) -> VmResult<Event> {
    'startfunc: loop {
        // ===== LOAD FRAME CONTEXT =====
        let (proto, base, func): (Rc<Prototype>, usize, FunctionId) = {
            let st = g.heap.try_thread(th)?;
            let ci = st
                .current_frame()
                .ok_or_else(|| VmError::runtime("no frame to execute"))?;
            let proto = ci
                .proto
                .clone()
                .ok_or_else(|| VmError::runtime("native frame in the interpreter"))?;
            (proto, ci.base, ci.func)
        };
        let code_len = proto.code.len();

        loop {
            let instr = {
                let st = g.heap.try_thread_mut(th)?;
                let ci = st
                    .current_frame_mut()
                    .ok_or_else(|| VmError::runtime("no frame to execute"))?;
                let pc = ci.pc;
                ci.pc += 1;
                *proto
                    .code
                    .get(pc)
                    .ok_or_else(|| VmError::Malformed("fell off the end of the code".into()))?
            };
            let op = instr.opcode().ok_or_else(|| {
                VmError::Malformed(format!("undefined opcode {}", instr.as_u32() & 0x7f))
            })?;
            let a = instr.get_a() as usize;

            match op {
                OpCode::Move => {
                    let v = reg(g, th, base + instr.get_b() as usize)?;
                    set_reg(g, th, base + a, v)?;
                }
                OpCode::LoadK => {
                    let v = constant(&proto, instr.get_bx() as usize)?;
                    set_reg(g, th, base + a, v)?;
                }
                OpCode::LoadI => {
                    set_reg(g, th, base + a, Value::Number(instr.get_sbx() as f64))?;
                }
                OpCode::LoadBool => {
                    set_reg(g, th, base + a, Value::Boolean(instr.get_b() != 0))?;
                    if instr.get_c() != 0 {
                        jump(g, th, code_len, 1)?;
                    }
                }
                OpCode::LoadNull => {
                    for i in 0..=instr.get_b() as usize {
                        set_reg(g, th, base + a + i, Value::Null)?;
                    }
                }

                // ===== Upvalues and globals =====
                OpCode::GetUpval => {
                    let uv = upvalue_of(g, func, instr.get_b() as usize)?;
                    let v = g.upvalue_get(uv)?;
                    set_reg(g, th, base + a, v)?;
                }
                OpCode::SetUpval => {
                    let uv = upvalue_of(g, func, instr.get_b() as usize)?;
                    let v = reg(g, th, base + a)?;
                    g.upvalue_set(uv, v)?;
                }
                OpCode::GetGlobal => {
                    let key = constant(&proto, instr.get_bx() as usize)?;
                    let env = env_of(g, func);
                    let v = index(g, th, env.into(), key)?;
                    set_reg(g, th, base + a, v)?;
                }
                OpCode::SetGlobal => {
                    let key = constant(&proto, instr.get_bx() as usize)?;
                    let env = env_of(g, func);
                    let v = reg(g, th, base + a)?;
                    new_index(g, th, env.into(), key, v)?;
                }
                OpCode::GetImport => {
                    let v = constant(&proto, instr.get_bx() as usize)?;
                    set_reg(g, th, base + a, v)?;
                }

                // ===== Tables =====
                OpCode::NewTable => {
                    let t = g.new_table(instr.get_b() as usize)?;
                    set_reg(g, th, base + a, t.into())?;
                    g.check_gc();
                }
                OpCode::DupTable => {
                    let shape = constant(&proto, instr.get_bx() as usize)?;
                    let size = match shape.as_table_id() {
                        Some(t) => g.heap.try_table(t)?.size(),
                        None => 0,
                    };
                    let t = g.new_table(size)?;
                    set_reg(g, th, base + a, t.into())?;
                    g.check_gc();
                }
                OpCode::GetTable => {
                    let obj = reg(g, th, base + instr.get_b() as usize)?;
                    let key = reg(g, th, base + instr.get_c() as usize)?;
                    let v = index(g, th, obj, key)?;
                    set_reg(g, th, base + a, v)?;
                }
                OpCode::SetTable => {
                    let obj = reg(g, th, base + a)?;
                    let key = reg(g, th, base + instr.get_b() as usize)?;
                    let v = reg(g, th, base + instr.get_c() as usize)?;
                    new_index(g, th, obj, key, v)?;
                }
                OpCode::GetField => {
                    let obj = reg(g, th, base + instr.get_b() as usize)?;
                    let key = constant(&proto, instr.get_c() as usize)?;
                    let v = index(g, th, obj, key)?;
                    set_reg(g, th, base + a, v)?;
                }
                OpCode::SetField => {
                    let obj = reg(g, th, base + a)?;
                    let key = constant(&proto, instr.get_b() as usize)?;
                    let v = reg(g, th, base + instr.get_c() as usize)?;
                    new_index(g, th, obj, key, v)?;
                }

                // ===== Arithmetic =====
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Pow => {
                    let kind = match op {
                        OpCode::Add => TmKind::Add,
                        OpCode::Sub => TmKind::Sub,
                        OpCode::Mul => TmKind::Mul,
                        OpCode::Div => TmKind::Div,
                        OpCode::Mod => TmKind::Mod,
                        _ => TmKind::Pow,
                    };
                    let x = reg(g, th, base + instr.get_b() as usize)?;
                    let y = reg(g, th, base + instr.get_c() as usize)?;
                    let v = arith(g, th, kind, x, y)?;
                    set_reg(g, th, base + a, v)?;
                }
                OpCode::Unm => {
                    let x = reg(g, th, base + instr.get_b() as usize)?;
                    let v = arith(g, th, TmKind::Unm, x, x)?;
                    set_reg(g, th, base + a, v)?;
                }
                OpCode::Not => {
                    let x = reg(g, th, base + instr.get_b() as usize)?;
                    set_reg(g, th, base + a, Value::Boolean(x.is_falsy()))?;
                }
                OpCode::Len => {
                    let x = reg(g, th, base + instr.get_b() as usize)?;
                    let v = length(g, th, x)?;
                    set_reg(g, th, base + a, v)?;
                }
                OpCode::Concat => {
                    let first = base + instr.get_b() as usize;
                    let last = base + instr.get_c() as usize;
                    let values = {
                        let st = g.heap.try_thread(th)?;
                        (first..=last).map(|i| st.get(i)).collect::<Vec<_>>()
                    };
                    let v = concat(g, th, &values)?;
                    set_reg(g, th, base + a, v)?;
                    g.check_gc();
                }

                // ===== Comparison =====
                OpCode::Eq | OpCode::Lt | OpCode::Le => {
                    let x = reg(g, th, base + a)?;
                    let y = reg(g, th, base + instr.get_b() as usize)?;
                    let cond = match op {
                        OpCode::Eq => equal(g, th, x, y)?,
                        OpCode::Lt => less_than(g, th, x, y)?,
                        _ => less_equal(g, th, x, y)?,
                    };
                    if cond != instr.get_k() {
                        jump(g, th, code_len, 1)?;
                    }
                }
                OpCode::Test => {
                    let x = reg(g, th, base + a)?;
                    if x.is_truthy() != instr.get_k() {
                        jump(g, th, code_len, 1)?;
                    }
                }

                // ===== Jumps =====
                OpCode::Jmp => {
                    let offset = instr.get_sbx();
                    jump(g, th, code_len, offset)?;
                    if offset < 0 {
                        g.check_gc();
                    }
                }
                OpCode::JmpX => {
                    let offset = instr.get_sj();
                    jump(g, th, code_len, offset)?;
                    if offset < 0 {
                        g.check_gc();
                    }
                }
                OpCode::JmpIf | OpCode::JmpIfNot => {
                    let x = reg(g, th, base + a)?;
                    if x.is_truthy() == (op == OpCode::JmpIf) {
                        let offset = instr.get_sbx();
                        jump(g, th, code_len, offset)?;
                        if offset < 0 {
                            g.check_gc();
                        }
                    }
                }

                // ===== Calls =====
                OpCode::Call => {
                    let func_index = base + a;
                    let b = instr.get_b() as usize;
                    if b != 0 {
                        g.heap.try_thread_mut(th)?.top = func_index + b;
                    }
                    let nresults = instr.get_c() as i32 - 1;
                    let kind = precall(g, th, func_index, nresults)?;
                    g.check_gc();
                    if let Precall::Script = kind {
                        continue 'startfunc;
                    }
                }
                OpCode::Return => {
                    let first = base + a;
                    let b = instr.get_b() as usize;
                    let n = if b != 0 {
                        b - 1
                    } else {
                        top(g, th)?.saturating_sub(first)
                    };
                    g.close_upvalues(th, base)?;
                    let ci = call::postcall(g, th, first, n)?;
                    if ci.is_fresh() {
                        return Ok(Event::Return);
                    }
                    let st = g.heap.try_thread(th)?;
                    if st.frames.is_empty() {
                        let values = st.values_from(ci.func_index);
                        return coroutine::finish(g, th, values);
                    }
                    g.check_gc();
                    continue 'startfunc;
                }
                OpCode::VarArg => {
                    let wanted = instr.get_c() as i32 - 1;
                    let st = g.heap.try_thread_mut(th)?;
                    let varargs = st
                        .current_frame()
                        .map(|ci| ci.varargs.clone())
                        .unwrap_or_default();
                    st.place_values(base + a, wanted, &varargs)?;
                }
                OpCode::Closure => {
                    let child = proto
                        .protos
                        .get(instr.get_bx() as usize)
                        .copied()
                        .ok_or_else(|| VmError::Malformed("child function out of range".into()))?;
                    let f = make_closure(g, th, child, base, func)?;
                    set_reg(g, th, base + a, f.into())?;
                    g.check_gc();
                }
                OpCode::DupClosure => {
                    let child = constant(&proto, instr.get_bx() as usize)?
                        .as_proto_id()
                        .ok_or_else(|| VmError::Malformed("closure constant expected".into()))?;
                    let f = make_closure(g, th, child, base, func)?;
                    set_reg(g, th, base + a, f.into())?;
                    g.check_gc();
                }
                OpCode::Close => {
                    g.close_upvalues(th, base + a)?;
                }

                // ===== Coroutines =====
                OpCode::NewThread => {
                    let body = reg(g, th, base + instr.get_b() as usize)?;
                    let co = g.new_thread_object()?;
                    g.heap.try_thread_mut(co.gc)?.push(body)?;
                    set_reg(g, th, base + a, co.into())?;
                    g.check_gc();
                }
                OpCode::Resume => {
                    let target = reg(g, th, base + a)?;
                    let co = match target.as_gc() {
                        Some(r) if r.kind() == ObjectKind::Thread => r,
                        _ => {
                            return Err(VmError::runtime(format!(
                                "attempt to resume a {} value",
                                target.type_name()
                            )));
                        }
                    };
                    let args = collect_args(g, th, base + a + 1, instr.get_b())?;
                    let point = ResumePoint {
                        reg: base + a,
                        wanted: instr.get_c() as i32 - 1,
                        protected: instr.get_k(),
                    };
                    g.check_gc();
                    return coroutine::resume_from(g, th, co, point, args);
                }
                OpCode::Yield => {
                    let values = collect_args(g, th, base + a, instr.get_b())?;
                    let wanted = instr.get_c() as i32 - 1;
                    return coroutine::yield_from(g, th, base + a, wanted, values);
                }

                OpCode::Nop => {}
                OpCode::ExtraArg => {
                    return Err(VmError::Malformed("stray EXTRAARG".into()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::limits::MULTRET;

    #[test]
    fn multret_is_zero_count() {
        // C == 0 encodes "all results"
        assert_eq!(0i32 - 1, MULTRET);
    }
}
