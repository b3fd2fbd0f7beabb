// Coroutine switching
//
// A resumed coroutine records who resumed it; the resumer records where it
// wants the results. Yield, return from the body and errors all travel along
// this link. The interpreter loop follows it without recursing.

use crate::gc::GcRef;
use crate::value::Value;
use crate::vm::execute::call::{Precall, capture_traceback, precall};
use crate::vm::execute::{Event, ExecOutcome};
use crate::vm::limits::MULTRET;
use crate::vm::{CoStatus, GlobalState, ResumePoint, Resumer, VmError, VmResult, YieldPoint};

/// Hand results to a thread waiting at a `Resume` and make it current again
fn deliver(g: &mut GlobalState, to: GcRef, ok: bool, values: Vec<Value>) -> VmResult<()> {
    g.thread_barrier(to);
    let st = g.heap.try_thread_mut(to)?;
    let point = st
        .pending_resume
        .take()
        .ok_or_else(|| VmError::runtime("resumer is not waiting on a coroutine"))?;
    let values = if point.protected {
        let mut with_flag = Vec::with_capacity(values.len() + 1);
        with_flag.push(Value::Boolean(ok));
        with_flag.extend(values);
        with_flag
    } else {
        values
    };
    st.place_values(point.reg, point.wanted, &values)?;
    st.status = CoStatus::Running;
    g.account_resize(to);
    Ok(())
}

#[inline]
fn pop_running(g: &mut GlobalState, th: GcRef) {
    if g.running.last() == Some(&th) {
        g.running.pop();
    }
}

/// Status check shared by the `Resume` instruction and the host API
pub(crate) fn check_resumable(g: &GlobalState, co: GcRef) -> VmResult<()> {
    let status = g.heap.try_thread(co)?.status;
    if status.is_resumable() {
        Ok(())
    } else {
        Err(VmError::runtime(format!(
            "cannot resume {} coroutine",
            status.name()
        )))
    }
}

/// Transfer control into `co` with `args`.
///
/// Returns `Some(results)` when the body was a native function that already
/// ran to completion, `None` when `co` has a script frame ready to run.
pub(crate) fn begin_resume(
    g: &mut GlobalState,
    co: GcRef,
    resumer: Resumer,
    args: Vec<Value>,
) -> VmResult<Option<Vec<Value>>> {
    check_resumable(g, co)?;
    g.thread_barrier(co);
    let status = {
        let st = g.heap.try_thread_mut(co)?;
        let status = st.status;
        st.status = CoStatus::Running;
        st.resumer = Some(resumer);
        status
    };
    g.running.push(co);

    match status {
        CoStatus::Suspended(point) => {
            let st = g.heap.try_thread_mut(co)?;
            st.place_values(point.reg, point.wanted, &args)?;
            g.account_resize(co);
            Ok(None)
        }
        _ => {
            let func_index = {
                let st = g.heap.try_thread_mut(co)?;
                let func_index = st
                    .top
                    .checked_sub(1)
                    .ok_or_else(|| VmError::runtime("cannot resume a coroutine without a body"))?;
                st.check_stack(args.len())?;
                for v in &args {
                    st.push(*v)?;
                }
                func_index
            };
            g.account_resize(co);
            match precall(g, co, func_index, MULTRET)? {
                Precall::Script => Ok(None),
                Precall::Native => {
                    let values = g.heap.try_thread(co)?.values_from(func_index);
                    Ok(Some(values))
                }
            }
        }
    }
}

/// `Resume` executed on `th`: switch into `co`.
pub(crate) fn resume_from(
    g: &mut GlobalState,
    th: GcRef,
    co: GcRef,
    point: ResumePoint,
    args: Vec<Value>,
) -> VmResult<Event> {
    if let Err(e) = check_resumable(g, co) {
        if point.protected {
            let msg = g.intern_str(&e.to_string())?;
            let st = g.heap.try_thread_mut(th)?;
            st.pending_resume = Some(point);
            deliver(g, th, false, vec![msg.into()])?;
            return Ok(Event::Switch(th));
        }
        return Err(e);
    }
    {
        let st = g.heap.try_thread_mut(th)?;
        st.pending_resume = Some(point);
        st.status = CoStatus::Normal;
    }
    match begin_resume(g, co, Resumer::Thread(th), args) {
        Ok(None) => Ok(Event::Switch(co)),
        Ok(Some(values)) => finish(g, co, values),
        Err(e) => Ok(Event::Raise(co, e)),
    }
}

/// `Yield` executed on `th` with `values`; resume values arrive at `reg`
pub(crate) fn yield_from(
    g: &mut GlobalState,
    th: GcRef,
    reg: usize,
    wanted: i32,
    values: Vec<Value>,
) -> VmResult<Event> {
    let resumer = {
        let st = g.heap.try_thread_mut(th)?;
        let Some(resumer) = st.resumer else {
            return Err(VmError::runtime("attempt to yield from outside a coroutine"));
        };
        if st.non_yieldable > 0 {
            return Err(VmError::runtime(
                "attempt to yield across a native call boundary",
            ));
        }
        st.status = CoStatus::Suspended(YieldPoint { reg, wanted });
        st.resumer = None;
        resumer
    };
    pop_running(g, th);
    match resumer {
        Resumer::Host => Ok(Event::ToHost(ExecOutcome::Yielded(values))),
        Resumer::Thread(to) => {
            deliver(g, to, true, values)?;
            Ok(Event::Switch(to))
        }
    }
}

/// The body of `th` returned `values`
pub(crate) fn finish(g: &mut GlobalState, th: GcRef, values: Vec<Value>) -> VmResult<Event> {
    g.close_upvalues(th, 0)?;
    let resumer = {
        let st = g.heap.try_thread_mut(th)?;
        let resumer = st.resumer.take();
        st.clear();
        st.status = CoStatus::Finished;
        resumer
    };
    pop_running(g, th);
    match resumer {
        Some(Resumer::Host) => Ok(Event::ToHost(ExecOutcome::Finished(values))),
        Some(Resumer::Thread(to)) => {
            deliver(g, to, true, values)?;
            Ok(Event::Switch(to))
        }
        None => Err(VmError::runtime("thread finished without a resumer")),
    }
}

/// Abort `th`: mark it failed, close its upvalues and drop its frames
pub(crate) fn fail_thread(g: &mut GlobalState, th: GcRef, e: &VmError) -> Option<Resumer> {
    capture_traceback(g, th);
    if let Err(close_err) = g.close_upvalues(th, 0) {
        log::warn!("closing upvalues of a failed coroutine: {}", close_err);
    }
    let resumer = g.heap.thread_mut(th).and_then(|st| {
        let resumer = st.resumer.take();
        st.clear();
        st.status = CoStatus::Failed;
        resumer
    });
    pop_running(g, th);
    if log::log_enabled!(log::Level::Debug) {
        let trace = g
            .heap
            .thread(th)
            .and_then(|st| st.traceback.clone())
            .unwrap_or_default();
        log::debug!("coroutine failed: {}\n{}", e, trace);
    }
    resumer
}

/// Propagate `e`, raised on `failing`, along the resumer chain. Returns the
/// thread that caught it and continues, or the error when it leaves the loop
/// that started at `base`. A base entered through a resume fails with it.
pub(crate) fn unwind(
    g: &mut GlobalState,
    base: GcRef,
    failing: GcRef,
    e: VmError,
    base_resumed: bool,
) -> VmResult<GcRef> {
    let mut failing = failing;
    loop {
        if failing == base {
            if base_resumed {
                fail_thread(g, failing, &e);
            } else {
                capture_traceback(g, failing);
            }
            return Err(e);
        }
        let Some(Resumer::Thread(to)) = fail_thread(g, failing, &e) else {
            return Err(e);
        };
        let protected = g
            .heap
            .thread(to)
            .and_then(|st| st.pending_resume)
            .is_some_and(|p| p.protected);
        if protected && e.is_catchable() {
            let msg = g.intern_str(&e.to_string())?;
            deliver(g, to, false, vec![msg.into()])?;
            return Ok(to);
        }
        if let Some(st) = g.heap.thread_mut(to) {
            st.pending_resume = None;
            st.status = CoStatus::Running;
        }
        failing = to;
    }
}
