// Text listing of a decoded chunk

use std::fmt::Write;

use crate::bytecode::format::{Chunk, Constant, FunctionInfo};
use crate::vm::{Instruction, OpMode};

fn quoted(bytes: &[u8]) -> String {
    format!("{:?}", String::from_utf8_lossy(bytes))
}

fn describe_constant(chunk: &Chunk, k: &Constant) -> String {
    let string = |s: u32| chunk.string(s).map(quoted).unwrap_or_else(|| "?".into());
    match k {
        Constant::Null => "null".into(),
        Constant::Boolean(b) => b.to_string(),
        Constant::Number(n) => crate::value::format_number(*n),
        Constant::String(s) => string(*s),
        Constant::Import(path) => {
            let names = path
                .iter()
                .map(|&s| {
                    chunk
                        .string(s)
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>();
            format!("import {}", names.join("."))
        }
        Constant::TableShape(keys) => {
            let keys = keys
                .iter()
                .map(|&key| {
                    chunk
                        .constants
                        .get(key as usize)
                        .map(|c| describe_constant(chunk, c))
                        .unwrap_or_else(|| "?".into())
                })
                .collect::<Vec<_>>();
            format!("shape {{{}}}", keys.join(", "))
        }
        Constant::Closure(f) => format!("function {}", f),
    }
}

fn operands(instr: Instruction) -> String {
    let Some(op) = instr.opcode() else {
        return format!("?? {:#010x}", instr.as_u32());
    };
    match op.get_mode() {
        OpMode::IABC => {
            let k = if instr.get_k() { " k" } else { "" };
            format!("{} {} {}{}", instr.get_a(), instr.get_b(), instr.get_c(), k)
        }
        OpMode::IABx => format!("{} {}", instr.get_a(), instr.get_bx()),
        OpMode::IAsBx => format!("{} {}", instr.get_a(), instr.get_sbx()),
        OpMode::IAx => format!("{}", instr.get_ax()),
        OpMode::IsJ => format!("{}", instr.get_sj()),
    }
}

fn function(out: &mut String, chunk: &Chunk, fid: usize, f: &FunctionInfo) {
    let name = match f.name.and_then(|n| chunk.string(n)) {
        Some(n) => String::from_utf8_lossy(n).into_owned(),
        None if fid == chunk.main as usize => "main".into(),
        None => "?".into(),
    };
    let _ = writeln!(
        out,
        "function {} <{}> params={}{} stack={} upvalues={} line={}",
        fid,
        name,
        f.num_params,
        if f.is_vararg { "+" } else { "" },
        f.max_stack,
        f.upvalues.len(),
        f.line_defined
    );
    for (pc, &instr) in f.code.iter().enumerate() {
        let line = f
            .lines
            .get(pc)
            .map_or_else(|| "-".to_string(), |l| l.to_string());
        let opname = instr.opcode().map_or("??", |op| op.name());
        let _ = write!(out, "  {:>4} [{:>4}] {:<10} {}", pc, line, opname, operands(instr));
        if f.jump_fixups.contains(&(pc as u32)) {
            out.push_str("  ; widened");
        }
        out.push('\n');
    }
    if !f.constants.is_empty() {
        let _ = writeln!(out, "  constants ({}):", f.constants.len());
        for (i, &k) in f.constants.iter().enumerate() {
            let text = chunk
                .constants
                .get(k as usize)
                .map(|c| describe_constant(chunk, c))
                .unwrap_or_else(|| "?".into());
            let _ = writeln!(out, "    {:>3} {}", i, text);
        }
    }
    if !f.children.is_empty() {
        let children = f
            .children
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>();
        let _ = writeln!(out, "  children: {}", children.join(" "));
    }
    for (i, uv) in f.upvalues.iter().enumerate() {
        let name = f
            .upvalue_names
            .get(i)
            .and_then(|&n| chunk.string(n))
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  upvalue {} {} {} {}",
            i,
            if uv.in_stack { "register" } else { "upvalue" },
            uv.index,
            name
        );
    }
    for local in &f.locals {
        let name = chunk
            .string(local.name)
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default();
        let _ = writeln!(out, "  local {} [{}, {})", name, local.start_pc, local.end_pc);
    }
}

/// Render every function of `chunk`
pub fn disassemble(chunk: &Chunk) -> String {
    let mut out = String::new();
    for (fid, f) in chunk.functions.iter().enumerate() {
        if fid > 0 {
            out.push('\n');
        }
        function(&mut out, chunk, fid, f);
    }
    out
}
