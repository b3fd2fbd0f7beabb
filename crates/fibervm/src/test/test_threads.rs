// Coroutines: host resume, in-script resume, yields and failures
use super::{new_state, run, text};
use crate::bytecode::BytecodeBuilder;
use crate::gc::ThreadId;
use crate::value::Value;
use crate::vm::{CoStatus, GlobalState, OpCode, ResumeStatus, SafeOption, VmError};

/// `function(n) yield n; yield n + 1; return n + 2 end`
fn emit_generator(b: &mut BytecodeBuilder) -> u32 {
    b.begin_function(1, false).unwrap();
    b.emit_abc(OpCode::Yield, 0, 2, 1).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 1).unwrap();
    b.emit_abc(OpCode::Add, 2, 0, 1).unwrap();
    b.emit_abc(OpCode::Yield, 2, 2, 1).unwrap();
    b.emit_abc(OpCode::Add, 2, 2, 1).unwrap();
    b.emit_abc(OpCode::Return, 2, 2, 0).unwrap();
    b.end_function(3).unwrap()
}

/// Chunk returning the function `body` builds
fn body_chunk(emit: fn(&mut BytecodeBuilder) -> u32) -> BytecodeBuilder {
    let mut b = BytecodeBuilder::new();
    let body = emit(&mut b);
    b.begin_function(0, false).unwrap();
    let k = b.add_constant_closure(body).unwrap();
    b.emit_abx(OpCode::DupClosure, 0, k).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(1).unwrap();
    b
}

/// New thread anchored on the main stack, with `body` as its function
fn spawn(g: &mut GlobalState, body: Value) -> ThreadId {
    let main = g.main_thread();
    let co = {
        let mut s = g.main();
        s.push(body).unwrap();
        let co = s.new_thread().unwrap();
        // thread below the body, which then moves over
        s.insert(-2).unwrap();
        co
    };
    g.exchange_move(main, co, 1).unwrap();
    co
}

#[test]
fn test_host_resumes_generator() {
    let mut g = new_state();
    let body = run(&mut g, body_chunk(emit_generator)).unwrap()[0];
    let co = spawn(&mut g, body);
    assert_eq!(g.thread_status(co).unwrap(), CoStatus::Ready);

    let mut s = g.main();
    s.push_number(10.0).unwrap();
    assert_eq!(s.resume(co, 1).unwrap(), ResumeStatus::Yielded(1));
    assert_eq!(s.pop_value().unwrap(), Value::Number(10.0));
    assert_eq!(s.resume(co, 0).unwrap(), ResumeStatus::Yielded(1));
    assert_eq!(s.pop_value().unwrap(), Value::Number(11.0));
    assert_eq!(s.resume(co, 0).unwrap(), ResumeStatus::Finished(1));
    assert_eq!(s.pop_value().unwrap(), Value::Number(12.0));
    // only the thread itself is left on the main stack
    assert_eq!(s.get_top(), 1);

    assert_eq!(g.thread_status(co).unwrap(), CoStatus::Finished);
    let err = g.main().resume(co, 0).unwrap_err();
    assert_eq!(err.to_string(), "cannot resume dead coroutine");
}

#[test]
fn test_suspended_thread_survives_collection() {
    let mut g = new_state();
    let body = run(&mut g, body_chunk(emit_generator)).unwrap()[0];
    let co = spawn(&mut g, body);
    {
        let mut s = g.main();
        s.push_number(1.0).unwrap();
        s.resume(co, 1).unwrap();
        s.pop(1).unwrap();
    }
    g.collect_garbage();
    let mut s = g.main();
    assert_eq!(s.resume(co, 0).unwrap(), ResumeStatus::Yielded(1));
    assert_eq!(s.pop_value().unwrap(), Value::Number(2.0));
}

#[test]
fn test_script_resume_and_yield() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    // body: yield 7; return 8
    let body = b.begin_function(0, false).unwrap();
    b.emit_asbx(OpCode::LoadI, 0, 7).unwrap();
    b.emit_abc(OpCode::Yield, 0, 2, 1).unwrap();
    b.emit_asbx(OpCode::LoadI, 0, 8).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(1).unwrap();

    b.begin_function(0, false).unwrap();
    let child = b.add_child(body).unwrap();
    b.emit_abx(OpCode::Closure, 0, child).unwrap();
    b.emit_abc(OpCode::NewThread, 1, 0, 0).unwrap();
    b.emit_abc(OpCode::Move, 2, 1, 0).unwrap();
    b.emit_abc(OpCode::Resume, 2, 1, 2).unwrap();
    b.emit_abc(OpCode::Move, 3, 1, 0).unwrap();
    b.emit_abc(OpCode::Resume, 3, 1, 2).unwrap();
    b.emit_abc(OpCode::Return, 1, 4, 0).unwrap();
    b.end_function(4).unwrap();

    let results = run(&mut g, b).unwrap();
    assert_eq!(results[1], Value::Number(7.0));
    assert_eq!(results[2], Value::Number(8.0));
    let co = g.thread_id(results[0].as_gc().unwrap());
    assert_eq!(g.thread_status(co).unwrap(), CoStatus::Finished);
}

#[test]
fn test_resume_values_arrive_at_yield() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    // body(a): local x = yield a; return x * 2
    let body = b.begin_function(1, false).unwrap();
    b.emit_abc(OpCode::Yield, 0, 2, 2).unwrap();
    b.emit_abc(OpCode::Add, 0, 0, 0).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(1).unwrap();

    b.begin_function(0, false).unwrap();
    let k = b.add_constant_closure(body).unwrap();
    b.emit_abx(OpCode::DupClosure, 0, k).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(1).unwrap();

    let f = run(&mut g, b).unwrap()[0];
    let co = spawn(&mut g, f);
    let mut s = g.main();
    s.push_number(1.0).unwrap();
    assert_eq!(s.resume(co, 1).unwrap(), ResumeStatus::Yielded(1));
    s.pop(1).unwrap();
    s.push_number(21.0).unwrap();
    assert_eq!(s.resume(co, 1).unwrap(), ResumeStatus::Finished(1));
    assert_eq!(s.pop_value().unwrap(), Value::Number(42.0));
}

#[test]
fn test_protected_resume_catches_error() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    let body = b.begin_function(0, false).unwrap();
    let error = b.add_constant_string(b"error").unwrap();
    let boom = b.add_constant_string(b"boom").unwrap();
    b.emit_abx(OpCode::GetGlobal, 0, error).unwrap();
    b.emit_abx(OpCode::LoadK, 1, boom).unwrap();
    b.emit_abc(OpCode::Call, 0, 2, 1).unwrap();
    b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
    b.end_function(2).unwrap();

    b.begin_function(0, false).unwrap();
    let child = b.add_child(body).unwrap();
    b.emit_abx(OpCode::Closure, 0, child).unwrap();
    b.emit_abc(OpCode::NewThread, 1, 0, 0).unwrap();
    b.emit_abc(OpCode::Move, 2, 1, 0).unwrap();
    b.emit_abck(OpCode::Resume, 2, 1, 3, true).unwrap();
    b.emit_abc(OpCode::Return, 1, 4, 0).unwrap();
    b.end_function(4).unwrap();

    let results = run(&mut g, b).unwrap();
    assert_eq!(results[1], Value::Boolean(false));
    assert_eq!(text(&g, &results[2]), "boom");
    let co = g.thread_id(results[0].as_gc().unwrap());
    assert_eq!(g.thread_status(co).unwrap(), CoStatus::Failed);
    let trace = g.thread_traceback(co).unwrap().unwrap();
    assert!(trace.starts_with("stack traceback:"));
}

#[test]
fn test_unprotected_resume_propagates_error() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    let body = b.begin_function(0, false).unwrap();
    b.emit_abc(OpCode::LoadNull, 0, 0, 0).unwrap();
    b.emit_abc(OpCode::Call, 0, 1, 1).unwrap();
    b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
    b.end_function(1).unwrap();

    b.begin_function(0, false).unwrap();
    let child = b.add_child(body).unwrap();
    b.emit_abx(OpCode::Closure, 0, child).unwrap();
    b.emit_abc(OpCode::NewThread, 1, 0, 0).unwrap();
    b.emit_abc(OpCode::Resume, 1, 1, 1).unwrap();
    b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
    b.end_function(2).unwrap();

    let err = run(&mut g, b).unwrap_err();
    assert_eq!(err, VmError::Call { target: "null" });
    // the main thread stays usable
    let mut s = g.main();
    assert_eq!(s.get_top(), 0);
    s.push_number(1.0).unwrap();
    assert_eq!(s.get_top(), 1);
}

#[test]
fn test_yield_outside_coroutine_fails() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    b.emit_asbx(OpCode::LoadI, 0, 1).unwrap();
    b.emit_abc(OpCode::Yield, 0, 2, 1).unwrap();
    b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
    b.end_function(1).unwrap();
    let err = run(&mut g, b).unwrap_err();
    assert_eq!(err.to_string(), "attempt to yield from outside a coroutine");
}

#[test]
fn test_yield_across_native_call_fails() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    let inner = b.begin_function(0, false).unwrap();
    b.emit_asbx(OpCode::LoadI, 0, 1).unwrap();
    b.emit_abc(OpCode::Yield, 0, 2, 1).unwrap();
    b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
    b.end_function(1).unwrap();

    // body: return pcall(inner)
    let body = b.begin_function(0, false).unwrap();
    let child = b.add_child(inner).unwrap();
    let pcall = b.add_constant_string(b"pcall").unwrap();
    b.emit_abx(OpCode::GetGlobal, 0, pcall).unwrap();
    b.emit_abx(OpCode::Closure, 1, child).unwrap();
    b.emit_abc(OpCode::Call, 0, 2, 3).unwrap();
    b.emit_abc(OpCode::Return, 0, 3, 0).unwrap();
    b.end_function(2).unwrap();

    b.begin_function(0, false).unwrap();
    let child = b.add_child(body).unwrap();
    b.emit_abx(OpCode::Closure, 0, child).unwrap();
    b.emit_abc(OpCode::NewThread, 1, 0, 0).unwrap();
    b.emit_abc(OpCode::Resume, 1, 1, 3).unwrap();
    b.emit_abc(OpCode::Return, 1, 3, 0).unwrap();
    b.end_function(3).unwrap();

    let results = run(&mut g, b).unwrap();
    assert_eq!(results[0], Value::Boolean(false));
    assert_eq!(
        text(&g, &results[1]),
        "attempt to yield across a native call boundary"
    );
}

#[test]
fn test_reset_thread_allows_reuse() {
    let mut g = new_state();
    let body = run(&mut g, body_chunk(emit_generator)).unwrap()[0];
    let co = spawn(&mut g, body);
    {
        let mut s = g.main();
        s.push_number(0.0).unwrap();
        s.resume(co, 1).unwrap();
        s.pop(1).unwrap();
    }
    g.reset_thread(co).unwrap();
    assert_eq!(g.thread_status(co).unwrap(), CoStatus::Ready);
    g.main().push(body).unwrap();
    let main = g.main_thread();
    g.exchange_move(main, co, 1).unwrap();
    let mut s = g.main();
    s.push_number(5.0).unwrap();
    assert_eq!(s.resume(co, 1).unwrap(), ResumeStatus::Yielded(1));
    assert_eq!(s.pop_value().unwrap(), Value::Number(5.0));
}

#[test]
fn test_cross_state_exchange_refused() {
    let mut g1 = GlobalState::new(SafeOption::default());
    let mut g2 = GlobalState::new(SafeOption::default());
    let foreign = g2.main().new_thread().unwrap();
    let main = g1.main_thread();
    g1.main().push_number(1.0).unwrap();
    assert_eq!(
        g1.exchange_move(main, foreign, 1),
        Err(VmError::CrossState)
    );
    assert!(matches!(g1.state(foreign), Err(VmError::CrossState)));
    assert_eq!(g1.main().resume(foreign, 0), Err(VmError::CrossState));
    // the value was not moved
    assert_eq!(g1.main().get_top(), 1);
}

#[test]
fn test_exchange_between_threads_of_one_state() {
    let mut g = new_state();
    let main = g.main_thread();
    let co = g.main().new_thread().unwrap();
    {
        let mut s = g.main();
        s.push_number(1.0).unwrap();
        s.push_number(2.0).unwrap();
    }
    g.exchange_move(main, co, 2).unwrap();
    g.exchange_push(co, main, -1).unwrap();
    let s = g.state(co).unwrap();
    assert_eq!(s.get_top(), 2);
    assert_eq!(s.value(1).unwrap(), Value::Number(1.0));
    let s = g.main();
    // the thread and the copied value
    assert_eq!(s.get_top(), 2);
    assert_eq!(s.value(-1).unwrap(), Value::Number(2.0));
}
