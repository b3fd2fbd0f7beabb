// Loading chunks: error chunks, validation, constants and debug data
use super::{new_state, run, text};
use crate::bytecode::{BytecodeBuilder, CompileError, Decoded, decode, disassemble, encode};
use crate::value::{FunctionKind, Value};
use crate::vm::{OpCode, VmError};

fn load_error(bytes: &[u8]) -> VmError {
    let mut g = new_state();
    let mut s = g.main();
    let err = s.load(bytes, "chunk").unwrap_err();
    assert_eq!(s.get_top(), 0);
    err
}

#[test]
fn test_single_compile_error_is_verbatim() {
    let mut b = BytecodeBuilder::new();
    b.add_error(CompileError::new(2, 14, "'end' expected"));
    let err = load_error(&b.finalize());
    assert_eq!(err, VmError::Compile("2:14: 'end' expected".to_string()));
}

#[test]
fn test_several_compile_errors_are_listed() {
    let bytes = BytecodeBuilder::finalize_error(&[
        CompileError::new(1, 1, "unexpected symbol"),
        CompileError::new(4, 2, "unfinished string"),
    ]);
    let VmError::Compile(msg) = load_error(&bytes) else {
        panic!("expected a compile error");
    };
    let lines: Vec<&str> = msg.lines().collect();
    assert_eq!(
        lines,
        vec!["2 errors", "1:1: unexpected symbol", "4:2: unfinished string"]
    );
}

#[test]
fn test_unfinished_function_fails_to_load() {
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
    assert!(matches!(load_error(&b.finalize()), VmError::Compile(_)));
}

#[test]
fn test_garbage_bytes_are_malformed() {
    assert!(matches!(load_error(b"print('hi')"), VmError::Malformed(_)));
    assert!(matches!(load_error(&[]), VmError::Malformed(_)));
}

#[test]
fn test_main_function_cannot_capture() {
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    b.add_upvalue(true, 0).unwrap();
    b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
    b.end_function(1).unwrap();
    let err = load_error(&b.finalize());
    assert_eq!(
        err,
        VmError::Malformed("main function cannot capture upvalues".to_string())
    );
}

#[test]
fn test_constants_are_shared_between_functions() {
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    let k = b.add_constant_string(b"shared").unwrap();
    b.emit_abx(OpCode::LoadK, 0, k).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    let child = b.end_function(1).unwrap();

    b.begin_function(0, false).unwrap();
    let c = b.add_child(child).unwrap();
    let k = b.add_constant_string(b"shared").unwrap();
    b.emit_abx(OpCode::LoadK, 0, k).unwrap();
    b.emit_abx(OpCode::Closure, 1, c).unwrap();
    b.emit_abc(OpCode::Call, 1, 1, 2).unwrap();
    b.emit_abc(OpCode::Eq, 0, 1, 0).unwrap();
    b.emit_asbx(OpCode::Jmp, 0, 1).unwrap();
    b.emit_abc(OpCode::LoadBool, 2, 1, 0).unwrap();
    b.emit_abc(OpCode::Return, 0, 4, 0).unwrap();
    b.end_function(3).unwrap();
    let chunk = b.build().unwrap();
    assert_eq!(chunk.constants.len(), 1);
    assert_eq!(chunk.strings.len(), 1);

    let bytes = encode(&chunk);

    let mut g = new_state();
    let mut s = g.main();
    s.load(&bytes, "shared").unwrap();
    s.call(0, 3).unwrap();
    assert_eq!(s.value(1).unwrap(), s.value(2).unwrap());
    assert_eq!(s.value(3).unwrap(), Value::Boolean(true));
    let v = s.value(1).unwrap();
    assert_eq!(text(&g, &v), "shared");
}

#[test]
fn test_builder_output_runs() {
    let mut g = new_state();
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    let k = b.add_constant_number(2.5).unwrap();
    b.emit_abx(OpCode::LoadK, 0, k).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(1).unwrap();
    assert_eq!(run(&mut g, b).unwrap(), vec![Value::Number(2.5)]);
}

#[test]
fn test_encoded_chunk_decodes_to_itself() {
    let mut b = BytecodeBuilder::new();
    b.set_source(b"return 1 + 2");
    b.begin_function(0, true).unwrap();
    b.set_line(1).unwrap();
    b.add_local("x", 0, 2).unwrap();
    let two = b.add_constant_number(2.0).unwrap();
    b.emit_asbx(OpCode::LoadI, 0, 1).unwrap();
    b.emit_abx(OpCode::LoadK, 1, two).unwrap();
    b.emit_abc(OpCode::Add, 0, 0, 1).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(2).unwrap();
    let chunk = b.build().unwrap();
    let bytes = encode(&chunk);
    let Decoded::Chunk(decoded) = decode(&bytes).unwrap() else {
        panic!("expected a chunk");
    };
    assert_eq!(decoded, chunk);
    assert_eq!(disassemble(&decoded), disassemble(&chunk));

    let mut g = new_state();
    let mut s = g.main();
    let f = s.load(&bytes, "sum").unwrap();
    // the loaded prototype carries exactly what was emitted
    let emitted = &chunk.functions[chunk.main as usize];
    let proto = match &s.global().heap.function(f).unwrap().kind {
        FunctionKind::Script { proto, .. } => *proto,
        FunctionKind::Native { .. } => panic!("expected a script function"),
    };
    let proto = s.global().heap.proto(proto).unwrap().clone();
    assert_eq!(proto.code, emitted.code);
    assert_eq!(proto.constants, vec![Value::Number(2.0)]);
    assert_eq!(proto.line_info, emitted.lines);

    s.call(0, 1).unwrap();
    assert_eq!(s.value(-1).unwrap(), Value::Number(3.0));
}

#[test]
fn test_stripped_chunk_still_runs() {
    let mut b = BytecodeBuilder::new();
    b.set_debug_info(false);
    b.begin_function(0, false).unwrap();
    b.set_line(7).unwrap();
    b.add_local("unused", 0, 1).unwrap();
    b.emit_asbx(OpCode::LoadI, 0, 5).unwrap();
    b.emit_abc(OpCode::Return, 0, 2, 0).unwrap();
    b.end_function(1).unwrap();
    let mut g = new_state();
    let chunk_bytes = b.finalize();
    let Decoded::Chunk(chunk) = decode(&chunk_bytes).unwrap() else {
        panic!("expected a chunk");
    };
    assert!(!chunk.debug);
    assert!(chunk.functions[0].lines.is_empty());
    assert!(chunk.functions[0].locals.is_empty());

    let mut s = g.main();
    s.load(&chunk_bytes, "stripped").unwrap();
    s.call(0, 1).unwrap();
    assert_eq!(s.value(-1).unwrap(), Value::Number(5.0));
}

#[test]
fn test_listing_marks_widened_jumps() {
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    let jump = b.emit_jump(OpCode::Jmp, 0).unwrap();
    for _ in 0..70_000 {
        b.emit_abc(OpCode::Nop, 0, 0, 0).unwrap();
    }
    let target = b.emit_label().unwrap();
    b.patch_jump(jump, target).unwrap();
    b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
    b.end_function(1).unwrap();
    let chunk = b.build().unwrap();
    assert_eq!(chunk.functions[0].jump_fixups, vec![0]);
    let listing = disassemble(&chunk);
    assert!(listing.contains("; widened"));
    assert!(listing.contains("JMPX"));
}

#[test]
fn test_loaded_chunks_are_independent_closures() {
    let mut b = BytecodeBuilder::new();
    b.begin_function(0, false).unwrap();
    b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
    b.end_function(1).unwrap();
    let bytes = b.finalize();

    let mut g = new_state();
    let mut s = g.main();
    let first = s.load(&bytes, "a").unwrap();
    let second = s.load(&bytes, "b").unwrap();
    assert_ne!(first, second);
    assert_eq!(s.get_top(), 2);
}
