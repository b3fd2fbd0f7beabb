// Instruction semantics, exercised through built chunks
use super::{new_state, run, text};
use crate::bytecode::BytecodeBuilder;
use crate::value::Value;
use crate::vm::OpCode;

#[test]
fn test_arithmetic() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    b.emit_asbx(OpCode::LoadI, 0, 6).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 7).unwrap();
    b.emit_abc(OpCode::Mul, 2, 0, 1).unwrap();
    b.emit_abc(OpCode::Sub, 3, 2, 0).unwrap();
    b.emit_abc(OpCode::Div, 4, 2, 0).unwrap();
    b.emit_abc(OpCode::Mod, 5, 1, 0).unwrap();
    b.emit_abc(OpCode::Pow, 6, 0, 0).unwrap();
    b.emit_abc(OpCode::Unm, 7, 1, 0).unwrap();
    b.emit_abc(OpCode::Return, 2, 7, 0).unwrap();
    b.end_function(8).unwrap();
    let results = run(&mut g, b).unwrap();
    assert_eq!(
        results,
        vec![
            Value::Number(42.0),
            Value::Number(36.0),
            Value::Number(7.0),
            Value::Number(1.0),
            Value::Number(46656.0),
            Value::Number(-7.0),
        ]
    );
}

#[test]
fn test_counting_loop() {
    // sum = 0; i = 1; while not (10 < i) do sum += i; i += 1 end
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    b.emit_asbx(OpCode::LoadI, 0, 0).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 1).unwrap();
    b.emit_asbx(OpCode::LoadI, 2, 10).unwrap();
    b.emit_asbx(OpCode::LoadI, 3, 1).unwrap();
    let head = b.emit_label().unwrap();
    b.emit_abck(OpCode::Lt, 2, 1, 0, true).unwrap();
    let exit = b.emit_jump(OpCode::Jmp, 0).unwrap();
    b.emit_abc(OpCode::Add, 0, 0, 1).unwrap();
    b.emit_abc(OpCode::Add, 1, 1, 3).unwrap();
    let back = b.emit_jump(OpCode::Jmp, 0).unwrap();
    b.patch_jump(back, head).unwrap();
    let done = b.emit_label().unwrap();
    b.patch_jump(exit, done).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(4).unwrap();
    assert_eq!(run(&mut g, b).unwrap(), vec![Value::Number(55.0)]);
}

#[test]
fn test_conditional_jumps() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    b.emit_abc(OpCode::LoadNull, 0, 0, 0).unwrap();
    let skip = b.emit_jump(OpCode::JmpIfNot, 0).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 1).unwrap();
    b.emit_abc(OpCode::Return, 1, 2, 0).unwrap();
    let target = b.emit_label().unwrap();
    b.patch_jump(skip, target).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 2).unwrap();
    b.emit_abc(OpCode::Return, 1, 2, 0).unwrap();
    b.end_function(2).unwrap();
    assert_eq!(run(&mut g, b).unwrap(), vec![Value::Number(2.0)]);
}

#[test]
fn test_load_bool_skip_and_not() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    b.emit_abc(OpCode::LoadBool, 0, 1, 1).unwrap();
    b.emit_abc(OpCode::LoadBool, 0, 0, 0).unwrap();
    b.emit_abc(OpCode::Not, 1, 0, 0).unwrap();
    b.emit_abc(OpCode::Return, 0, 3, 0).unwrap();
    b.end_function(2).unwrap();
    assert_eq!(
        run(&mut g, b).unwrap(),
        vec![Value::Boolean(true), Value::Boolean(false)]
    );
}

#[test]
fn test_equality_uses_epsilon() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    let tenth = b.add_constant_number(0.1).unwrap();
    let fifth = b.add_constant_number(0.2).unwrap();
    let sum = b.add_constant_number(0.3).unwrap();
    b.emit_abx(OpCode::LoadK, 0, tenth).unwrap();
    b.emit_abx(OpCode::LoadK, 1, fifth).unwrap();
    b.emit_abc(OpCode::Add, 0, 0, 1).unwrap();
    b.emit_abx(OpCode::LoadK, 1, sum).unwrap();
    b.emit_abc(OpCode::LoadBool, 2, 0, 0).unwrap();
    // skip the jump when equal
    b.emit_abck(OpCode::Eq, 0, 1, 0, false).unwrap();
    let out = b.emit_jump(OpCode::Jmp, 0).unwrap();
    b.emit_abc(OpCode::LoadBool, 2, 1, 0).unwrap();
    let end = b.emit_label().unwrap();
    b.patch_jump(out, end).unwrap();
    b.emit_abc(OpCode::Return, 2, 2, 0).unwrap();
    b.end_function(3).unwrap();
    assert_eq!(run(&mut g, b).unwrap(), vec![Value::Boolean(true)]);
}

#[test]
fn test_globals_and_native_call() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    let type_name = b.add_constant_string(b"type").unwrap();
    let answer = b.add_constant_string(b"answer").unwrap();
    b.emit_asbx(OpCode::LoadI, 0, 42).unwrap();
    b.emit_abx(OpCode::SetGlobal, 0, answer).unwrap();
    b.emit_abx(OpCode::GetGlobal, 0, type_name).unwrap();
    b.emit_abx(OpCode::GetGlobal, 1, answer).unwrap();
    b.emit_abc(OpCode::Call, 0, 2, 2).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(2).unwrap();
    let results = run(&mut g, b).unwrap();
    assert_eq!(text(&g, &results[0]), "number");
    assert_eq!(g.get_global("answer").unwrap(), Value::Number(42.0));
}

#[test]
fn test_table_access() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    let key = b.add_constant_string(b"k").unwrap();
    b.emit_abc(OpCode::NewTable, 0, 4, 0).unwrap();
    b.emit_abx(OpCode::LoadK, 1, key).unwrap();
    b.emit_asbx(OpCode::LoadI, 2, 5).unwrap();
    b.emit_abc(OpCode::SetTable, 0, 1, 2).unwrap();
    b.emit_abc(OpCode::GetField, 3, 0, key as u8).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 1).unwrap();
    b.emit_abc(OpCode::SetTable, 0, 1, 2).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 2).unwrap();
    b.emit_abc(OpCode::SetTable, 0, 1, 3).unwrap();
    b.emit_abc(OpCode::Len, 4, 0, 0).unwrap();
    b.emit_abc(OpCode::GetTable, 5, 0, 1).unwrap();
    b.emit_abc(OpCode::Return, 3, 4, 0).unwrap();
    b.end_function(6).unwrap();
    assert_eq!(
        run(&mut g, b).unwrap(),
        vec![Value::Number(5.0), Value::Number(2.0), Value::Number(5.0)]
    );
}

#[test]
fn test_concat_numbers_and_strings() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    let a = b.add_constant_string(b"a").unwrap();
    b.emit_abx(OpCode::LoadK, 0, a).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 1).unwrap();
    b.emit_abx(OpCode::LoadK, 2, a).unwrap();
    b.emit_abc(OpCode::Concat, 3, 0, 2).unwrap();
    b.emit_abc(OpCode::Return, 3, 2, 0).unwrap();
    b.end_function(4).unwrap();
    let results = run(&mut g, b).unwrap();
    assert_eq!(text(&g, &results[0]), "a1a");
    // concatenation yields an interned string
    let interned = g.intern(b"a1a").unwrap();
    assert_eq!(results[0], Value::from(interned));
}

#[test]
fn test_call_script_function_with_varargs() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    // function(a, ...) return ..., a end
    let callee = b.begin_function(1, true).unwrap();
    b.emit_abc(OpCode::VarArg, 1, 0, 0).unwrap();
    b.emit_abc(OpCode::Move, 3, 0, 0).unwrap();
    b.emit_abc(OpCode::Return, 1, 4, 0).unwrap();
    b.end_function(4).unwrap();

    b.begin_function(0, false).unwrap();
    let f = b.add_constant_closure(callee).unwrap();
    b.emit_abx(OpCode::DupClosure, 0, f).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 1).unwrap();
    b.emit_asbx(OpCode::LoadI, 2, 2).unwrap();
    b.emit_asbx(OpCode::LoadI, 3, 3).unwrap();
    // all results
    b.emit_abc(OpCode::Call, 0, 4, 0).unwrap();
    b.emit_abc(OpCode::Return, 0, 0, 0).unwrap();
    b.end_function(4).unwrap();
    assert_eq!(
        run(&mut g, b).unwrap(),
        vec![Value::Number(2.0), Value::Number(3.0), Value::Number(1.0)]
    );
}

#[test]
fn test_missing_results_are_null() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    let callee = b.begin_function(0, false).unwrap();
    b.emit_asbx(OpCode::LoadI, 0, 9).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(1).unwrap();

    b.begin_function(0, false).unwrap();
    let child = b.add_child(callee).unwrap();
    b.emit_abx(OpCode::Closure, 0, child).unwrap();
    b.emit_abc(OpCode::Call, 0, 1, 4).unwrap();
    b.emit_abc(OpCode::Return, 0, 4, 0).unwrap();
    b.end_function(3).unwrap();
    assert_eq!(
        run(&mut g, b).unwrap(),
        vec![Value::Number(9.0), Value::Null, Value::Null]
    );
}

#[test]
fn test_table_shape_and_import() {
    let mut g = new_state();
    let lib = g.new_table(0).unwrap();
    let pi = g.intern_str("pi").unwrap();
    g.table_set(lib, pi.into(), Value::Number(3.5)).unwrap();
    g.set_global("consts", lib.into()).unwrap();

    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    let x = b.add_constant_string(b"x").unwrap();
    let y = b.add_constant_string(b"y").unwrap();
    let shape = b.add_constant_table_shape(&[x, y]).unwrap();
    let import = b.add_constant_import(&["consts", "pi"]).unwrap();
    b.emit_abx(OpCode::DupTable, 0, shape).unwrap();
    b.emit_abx(OpCode::GetImport, 1, import).unwrap();
    b.emit_abc(OpCode::SetField, 0, x as u8, 1).unwrap();
    b.emit_abc(OpCode::GetField, 2, 0, x as u8).unwrap();
    b.emit_abc(OpCode::GetField, 3, 0, y as u8).unwrap();
    b.emit_abc(OpCode::Return, 2, 3, 0).unwrap();
    b.end_function(4).unwrap();
    assert_eq!(
        run(&mut g, b).unwrap(),
        vec![Value::Number(3.5), Value::Null]
    );
}

#[test]
fn test_import_resolved_at_load() {
    let mut g = new_state();
    g.set_global("answer", Value::Number(1.0)).unwrap();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    let import = b.add_constant_import(&["answer"]).unwrap();
    b.emit_abx(OpCode::GetImport, 0, import).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(1).unwrap();
    let bytes = b.finalize();

    let mut s = g.main();
    s.load(&bytes, "import").unwrap();
    s.global_mut()
        .set_global("answer", Value::Number(2.0))
        .unwrap();
    s.call(0, 1).unwrap();
    assert_eq!(s.value(-1).unwrap(), Value::Number(1.0));
}

#[test]
fn test_metamethod_index_and_call() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    // __index returns its key doubled
    let handler = b.begin_function(2, false).unwrap();
    b.emit_abc(OpCode::Add, 2, 1, 1).unwrap();
    b.emit_abc(OpCode::Return, 2, 2, 0).unwrap();
    b.end_function(3).unwrap();

    b.begin_function(0, false).unwrap();
    let setmt = b.add_constant_string(b"setmetatable").unwrap();
    let index = b.add_constant_string(b"__index").unwrap();
    let f = b.add_constant_closure(handler).unwrap();
    b.emit_abx(OpCode::GetGlobal, 0, setmt).unwrap();
    b.emit_abc(OpCode::NewTable, 1, 0, 0).unwrap();
    b.emit_abc(OpCode::NewTable, 2, 0, 0).unwrap();
    b.emit_abx(OpCode::DupClosure, 3, f).unwrap();
    b.emit_abc(OpCode::SetField, 2, index as u8, 3).unwrap();
    b.emit_abc(OpCode::Call, 0, 3, 2).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 21).unwrap();
    b.emit_abc(OpCode::GetTable, 2, 0, 1).unwrap();
    b.emit_abc(OpCode::Return, 2, 2, 0).unwrap();
    b.end_function(4).unwrap();
    assert_eq!(run(&mut g, b).unwrap(), vec![Value::Number(42.0)]);
}

#[test]
fn test_widened_conditional_jump_runs() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    b.emit_abc(OpCode::LoadBool, 0, 0, 0).unwrap();
    let far = b.emit_jump(OpCode::JmpIfNot, 0).unwrap();
    for _ in 0..70_000 {
        b.emit_abc(OpCode::Nop, 0, 0, 0).unwrap();
    }
    b.emit_asbx(OpCode::LoadI, 1, 1).unwrap();
    b.emit_abc(OpCode::Return, 1, 2, 0).unwrap();
    let target = b.emit_label().unwrap();
    b.patch_jump(far, target).unwrap();
    b.emit_asbx(OpCode::LoadI, 1, 2).unwrap();
    b.emit_abc(OpCode::Return, 1, 2, 0).unwrap();
    b.end_function(2).unwrap();
    assert_eq!(run(&mut g, b).unwrap(), vec![Value::Number(2.0)]);
}
