// Call protocol
//
// Stack layout of a call: the function at `func_index`, its arguments right
// above, `top` one past the last argument. Results are moved down to
// `func_index`, adjusted to the number the caller asked for.

use crate::gc::{FunctionId, GcRef};
use crate::value::{FunctionKind, Value};
use crate::vm::execute::metamethod::TmKind;
use crate::vm::execute::{Entry, ExecOutcome, execute};
use crate::vm::limits::{EXTRA_STACK, MAX_NATIVE_DEPTH, MAXTAGLOOP, MIN_STACK, MULTRET};
use crate::vm::{CallInfo, GlobalState, StateMut, VmError, VmResult};

/// What `precall` left behind
pub(crate) enum Precall {
    /// A script frame was pushed; the interpreter continues in it
    Script,
    /// A native function already ran; its results are in place
    Native,
}

/// Replace a non-function at `func_index` by its `__call` handler, shifting
/// the arguments up. Returns the function to call.
fn resolve_callable(g: &mut GlobalState, th: GcRef, func_index: usize) -> VmResult<FunctionId> {
    for _ in 0..MAXTAGLOOP {
        let f = g.heap.try_thread(th)?.get(func_index);
        if let Some(id) = f.as_function_id() {
            return Ok(id);
        }
        let tm = g.get_tm(&f, TmKind::Call);
        if tm.is_null() {
            return Err(VmError::Call {
                target: f.type_name(),
            });
        }
        let st = g.heap.try_thread_mut(th)?;
        st.check_stack(1)?;
        let top = st.top;
        st.stack.copy_within(func_index..top, func_index + 1);
        st.stack[func_index] = tm;
        st.top = top + 1;
    }
    Err(VmError::runtime("'__call' chain too long; possible loop"))
}

/// Start a call of the value at `func_index` with the arguments up to top.
pub(crate) fn precall(
    g: &mut GlobalState,
    th: GcRef,
    func_index: usize,
    nresults: i32,
) -> VmResult<Precall> {
    let fid = resolve_callable(g, th, func_index)?;
    if g.heap.try_thread(th)?.frames.len() >= g.options.max_call_depth {
        return Err(VmError::StackOverflow(format!(
            "call depth exceeds {}",
            g.options.max_call_depth
        )));
    }

    let (native, proto_id) = match &g.heap.try_function(fid)?.kind {
        FunctionKind::Native { func, .. } => (Some(*func), None),
        FunctionKind::Script { proto, .. } => (None, Some(*proto)),
    };

    if let Some(func) = native {
        {
            let st = g.heap.try_thread_mut(th)?;
            st.check_stack(MIN_STACK)?;
            let top = st.top + MIN_STACK;
            st.frames
                .push(CallInfo::new_native(fid, func_index, top, nresults));
        }
        if g.native_depth >= MAX_NATIVE_DEPTH {
            return Err(VmError::StackOverflow("too many nested native calls".into()));
        }
        g.native_depth += 1;
        let result = func(&mut StateMut { g: &mut *g, thread: th });
        g.native_depth -= 1;
        let n = result?;
        let st = g.heap.try_thread_mut(th)?;
        let first = match st.top.checked_sub(n) {
            Some(first) if first >= st.frame_base() => first,
            _ => {
                return Err(VmError::runtime(format!(
                    "native function returned {} values but pushed fewer",
                    n
                )));
            }
        };
        postcall(g, th, first, n)?;
        return Ok(Precall::Native);
    }

    let proto = match proto_id {
        Some(id) => g.heap.try_proto(id)?.clone(),
        None => return Err(VmError::DeadObject),
    };
    let st = g.heap.try_thread_mut(th)?;
    let nargs = st.top.saturating_sub(func_index + 1);
    let nparams = proto.num_params as usize;
    let mut ci = CallInfo::new_script(fid, func_index, proto.clone(), nresults);
    st.grow_stack(ci.top + EXTRA_STACK)?;
    if proto.is_vararg && nargs > nparams {
        ci.varargs = st.stack[ci.base + nparams..ci.base + nargs].to_vec();
    }
    let first_unset = ci.base + nargs.min(nparams);
    for slot in &mut st.stack[first_unset..ci.top] {
        *slot = Value::Null;
    }
    st.top = ci.top;
    st.frames.push(ci);
    Ok(Precall::Script)
}

/// Pop the current frame and move its `n` results from `first` down to the
/// function slot, adjusted to the wanted count.
pub(crate) fn postcall(g: &mut GlobalState, th: GcRef, first: usize, n: usize) -> VmResult<CallInfo> {
    let st = g.heap.try_thread_mut(th)?;
    let ci = st
        .frames
        .pop()
        .ok_or_else(|| VmError::runtime("return without an active call"))?;
    let res = ci.func_index;
    let wanted = if ci.nresults == MULTRET {
        n
    } else {
        ci.nresults as usize
    };
    st.grow_stack(res + wanted + EXTRA_STACK)?;
    for i in 0..wanted {
        st.stack[res + i] = if i < n { st.stack[first + i] } else { Value::Null };
    }
    // values above the results are dead now
    let old_top = st.top.max(first + n);
    if old_top > res + wanted {
        for slot in &mut st.stack[res + wanted..old_top] {
            *slot = Value::Null;
        }
    }
    st.top = res + wanted;
    Ok(ci)
}

/// Call the value at `func_index` to completion, running script functions in
/// a nested interpreter loop. On failure the thread's frames, top and open
/// upvalues are restored to where they were before the call.
pub(crate) fn call_at(
    g: &mut GlobalState,
    th: GcRef,
    func_index: usize,
    nresults: i32,
) -> VmResult<()> {
    let depth = g.heap.try_thread(th)?.frames.len();
    let result = call_nested(g, th, func_index, nresults);
    if let Err(e) = &result {
        capture_traceback(g, th);
        if let Err(close_err) = g.close_upvalues(th, func_index) {
            log::warn!("closing upvalues after a failed call: {}", close_err);
        }
        if let Some(st) = g.heap.thread_mut(th) {
            st.frames.truncate(depth);
            st.top = func_index.min(st.top);
            // back at host level: the next failure gets its own traceback
            if depth == 0 {
                st.error_pending = false;
            }
        }
        log::trace!("call failed: {}", e);
    }
    result
}

fn call_nested(g: &mut GlobalState, th: GcRef, func_index: usize, nresults: i32) -> VmResult<()> {
    match precall(g, th, func_index, nresults)? {
        Precall::Native => Ok(()),
        Precall::Script => {
            if g.native_depth >= MAX_NATIVE_DEPTH {
                return Err(VmError::StackOverflow("too many nested native calls".into()));
            }
            {
                let st = g.heap.try_thread_mut(th)?;
                if let Some(ci) = st.current_frame_mut() {
                    ci.set_fresh();
                }
                st.non_yieldable += 1;
            }
            g.native_depth += 1;
            let result = execute(g, th, Entry::Call);
            g.native_depth -= 1;
            if let Some(st) = g.heap.thread_mut(th) {
                st.non_yieldable = st.non_yieldable.saturating_sub(1);
            }
            match result? {
                ExecOutcome::Returned => Ok(()),
                _ => Err(VmError::runtime("call ended in a coroutine switch")),
            }
        }
    }
}

/// Call `f(args...)` above everything live on `th` and collect its results
pub(crate) fn call_value(
    g: &mut GlobalState,
    th: GcRef,
    f: Value,
    args: &[Value],
    nresults: i32,
) -> VmResult<Vec<Value>> {
    let (func_index, old_top) = {
        let st = g.heap.try_thread_mut(th)?;
        let old_top = st.top;
        let frame_top = st.current_frame().map_or(0, |ci| ci.top);
        let func_index = old_top.max(frame_top);
        st.grow_stack(func_index + 1 + args.len() + EXTRA_STACK)?;
        st.stack[func_index] = f;
        st.stack[func_index + 1..func_index + 1 + args.len()].copy_from_slice(args);
        st.top = func_index + 1 + args.len();
        (func_index, old_top)
    };
    call_at(g, th, func_index, nresults)?;
    let st = g.heap.try_thread_mut(th)?;
    let results = st.values_from(func_index);
    let end = st.top.max(func_index);
    for slot in &mut st.stack[old_top.min(func_index)..end] {
        *slot = Value::Null;
    }
    st.top = old_top;
    Ok(results)
}

/// Record where the error pending on `th` was raised, once per error
pub(crate) fn capture_traceback(g: &mut GlobalState, th: GcRef) {
    let pending = g.heap.thread(th).is_none_or(|st| st.error_pending);
    if pending {
        return;
    }
    let text = g.traceback(th);
    if let Some(st) = g.heap.thread_mut(th) {
        st.traceback = Some(text);
        st.error_pending = true;
    }
}

impl GlobalState {
    /// Render the call frames of `th`, innermost first
    pub fn traceback(&self, th: GcRef) -> String {
        let mut out = String::from("stack traceback:");
        let Some(st) = self.heap.thread(th) else {
            return out;
        };
        for ci in st.frames.iter().rev() {
            out.push_str("\n\t");
            match &ci.proto {
                Some(proto) => {
                    let source = proto
                        .source
                        .and_then(|s| self.heap.string(s))
                        .map_or_else(|| "?".into(), |s| s.to_str_lossy().into_owned());
                    out.push_str(&source);
                    if let Some(line) = ci.current_line() {
                        out.push(':');
                        out.push_str(itoa::Buffer::new().format(line));
                    }
                    match proto.name.and_then(|n| self.heap.string(n)) {
                        Some(name) => {
                            out.push_str(": in function '");
                            out.push_str(&name.to_str_lossy());
                            out.push('\'');
                        }
                        None => out.push_str(": in main chunk"),
                    }
                }
                None => out.push_str("[native]: in function"),
            }
        }
        out
    }
}
