// Bytecode builder
//
// Producer side of the chunk format, driven by a compiler front-end. One
// function is open at a time: nested functions are built (and ended) before
// the function that creates them, so children always have smaller ids.

use ahash::AHashMap;

use crate::bytecode::format::{
    Chunk, Constant, FunctionInfo, LocalInfo, encode, encode_error,
};
use crate::value::UpvalueDesc;
use crate::vm::{Instruction, OpCode};

/// Largest constant index an `iABx` instruction can address
const MAX_CONSTANTS: usize = (1 << Instruction::SIZE_BX) as usize;
const MAX_UPVALUES: usize = u8::MAX as usize;
const MAX_IMPORT_PATH: usize = u8::MAX as usize;

/// A failure reported by the compiler front-end or detected while building
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Position in the code of the open function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// A jump waiting for its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jump(u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Null,
    Boolean(bool),
    Number(u64),
    String(u32),
    Import(Vec<u32>),
    TableShape(Vec<u32>),
    Closure(u32),
}

struct PendingJump {
    pos: u32,
    target: Option<u32>,
}

struct OpenFunction {
    id: u32,
    info: FunctionInfo,
    constant_map: AHashMap<u32, u32>,
    jumps: Vec<PendingJump>,
    line: u32,
}

pub struct BytecodeBuilder {
    strings: Vec<Vec<u8>>,
    string_map: AHashMap<Vec<u8>, u32>,
    constants: Vec<Constant>,
    constant_map: AHashMap<ConstKey, u32>,
    functions: Vec<FunctionInfo>,
    current: Option<OpenFunction>,
    main: Option<u32>,
    last_ended: Option<u32>,
    source: Option<Vec<u8>>,
    debug: bool,
    errors: Vec<CompileError>,
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self {
            strings: Vec::new(),
            string_map: AHashMap::new(),
            constants: Vec::new(),
            constant_map: AHashMap::new(),
            functions: Vec::new(),
            current: None,
            main: None,
            last_ended: None,
            source: None,
            debug: true,
            errors: Vec::new(),
        }
    }

    /// Keep line tables, local ranges and upvalue names (on by default)
    pub fn set_debug_info(&mut self, enabled: bool) {
        self.debug = enabled;
    }

    /// Embed the source text in the chunk
    pub fn set_source(&mut self, source: &[u8]) {
        self.source = Some(source.to_vec());
    }

    pub fn add_error(&mut self, error: CompileError) {
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    fn error_here(&self, message: impl Into<String>) -> CompileError {
        let line = self.current.as_ref().map_or(0, |f| f.line);
        CompileError::new(line, 0, message)
    }

    fn open(&mut self) -> Result<&mut OpenFunction, CompileError> {
        match self.current.as_mut() {
            Some(f) => Ok(f),
            None => Err(CompileError::new(0, 0, "no function is being built")),
        }
    }

    // ============ Functions ============

    pub fn begin_function(&mut self, num_params: u8, is_vararg: bool) -> Result<u32, CompileError> {
        if self.current.is_some() {
            return Err(self.error_here("a function is already being built"));
        }
        let id = self.functions.len() as u32;
        // placeholder until the function is ended
        self.functions.push(FunctionInfo::default());
        self.current = Some(OpenFunction {
            id,
            info: FunctionInfo {
                num_params,
                is_vararg,
                ..Default::default()
            },
            constant_map: AHashMap::new(),
            jumps: Vec::new(),
            line: 0,
        });
        Ok(id)
    }

    /// Finish the open function: resolve its jumps, widening those that do
    /// not fit, and store it under its id.
    pub fn end_function(&mut self, max_stack: u8) -> Result<u32, CompileError> {
        let Some(mut f) = self.current.take() else {
            return Err(CompileError::new(0, 0, "no function is being built"));
        };
        f.info.max_stack = max_stack;
        let line = f.line;
        let jumps = f
            .jumps
            .iter()
            .map(|j| {
                j.target.map(|t| (j.pos, t)).ok_or_else(|| {
                    CompileError::new(line, 0, format!("jump at {} was never patched", j.pos))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        resolve_jumps(&mut f.info, &jumps).map_err(|msg| CompileError::new(line, 0, msg))?;
        if !self.debug {
            f.info.lines.clear();
            f.info.locals.clear();
            f.info.upvalue_names.clear();
        }
        self.functions[f.id as usize] = f.info;
        self.last_ended = Some(f.id);
        Ok(f.id)
    }

    /// Function the loader returns; defaults to the last one ended
    pub fn set_main_function(&mut self, fid: u32) {
        self.main = Some(fid);
    }

    pub fn set_debug_name(&mut self, name: &str) -> Result<(), CompileError> {
        let s = self.add_string(name.as_bytes());
        self.open()?.info.name = Some(s);
        Ok(())
    }

    pub fn set_line_defined(&mut self, line: u32) -> Result<(), CompileError> {
        self.open()?.info.line_defined = line;
        Ok(())
    }

    /// Line attached to the instructions emitted from now on
    pub fn set_line(&mut self, line: u32) -> Result<(), CompileError> {
        self.open()?.line = line;
        Ok(())
    }

    pub fn add_local(&mut self, name: &str, start_pc: u32, end_pc: u32) -> Result<(), CompileError> {
        let s = self.add_string(name.as_bytes());
        self.open()?.info.locals.push(LocalInfo {
            name: s,
            start_pc,
            end_pc,
        });
        Ok(())
    }

    pub fn add_upvalue_name(&mut self, name: &str) -> Result<(), CompileError> {
        let s = self.add_string(name.as_bytes());
        self.open()?.info.upvalue_names.push(s);
        Ok(())
    }

    /// Capture descriptor for the open function's next upvalue
    pub fn add_upvalue(&mut self, in_stack: bool, index: u8) -> Result<u32, CompileError> {
        let err = self.error_here("too many upvalues");
        let f = self.open()?;
        if f.info.upvalues.len() >= MAX_UPVALUES {
            return Err(err);
        }
        f.info.upvalues.push(UpvalueDesc { in_stack, index });
        Ok(f.info.upvalues.len() as u32 - 1)
    }

    /// Register an already ended function as a child; returns the index
    /// `Closure` uses
    pub fn add_child(&mut self, fid: u32) -> Result<u32, CompileError> {
        let err = self.error_here(format!("function {} is not finished", fid));
        let ended = fid < self.functions.len() as u32
            && self.current.as_ref().is_none_or(|f| f.id != fid);
        if !ended {
            return Err(err);
        }
        let f = self.open()?;
        f.info.children.push(fid);
        Ok(f.info.children.len() as u32 - 1)
    }

    // ============ Constants ============

    fn add_string(&mut self, bytes: &[u8]) -> u32 {
        if let Some(&s) = self.string_map.get(bytes) {
            return s;
        }
        let s = self.strings.len() as u32;
        self.strings.push(bytes.to_vec());
        self.string_map.insert(bytes.to_vec(), s);
        s
    }

    /// Deduplicate in the pool, then in the open function's constant list
    fn add_constant(&mut self, key: ConstKey, constant: Constant) -> Result<u32, CompileError> {
        let pool_index = match self.constant_map.get(&key) {
            Some(&k) => k,
            None => {
                let k = self.constants.len() as u32;
                self.constants.push(constant);
                self.constant_map.insert(key, k);
                k
            }
        };
        let err = self.error_here("too many constants");
        let f = self.open()?;
        if let Some(&k) = f.constant_map.get(&pool_index) {
            return Ok(k);
        }
        if f.info.constants.len() >= MAX_CONSTANTS {
            return Err(err);
        }
        let k = f.info.constants.len() as u32;
        f.info.constants.push(pool_index);
        f.constant_map.insert(pool_index, k);
        Ok(k)
    }

    pub fn add_constant_null(&mut self) -> Result<u32, CompileError> {
        self.add_constant(ConstKey::Null, Constant::Null)
    }

    pub fn add_constant_boolean(&mut self, b: bool) -> Result<u32, CompileError> {
        self.add_constant(ConstKey::Boolean(b), Constant::Boolean(b))
    }

    pub fn add_constant_number(&mut self, n: f64) -> Result<u32, CompileError> {
        self.add_constant(ConstKey::Number(n.to_bits()), Constant::Number(n))
    }

    pub fn add_constant_string(&mut self, s: &[u8]) -> Result<u32, CompileError> {
        let s = self.add_string(s);
        self.add_constant(ConstKey::String(s), Constant::String(s))
    }

    /// Global path such as `math.max`, resolved once at load time
    pub fn add_constant_import(&mut self, path: &[&str]) -> Result<u32, CompileError> {
        if path.is_empty() || path.len() > MAX_IMPORT_PATH {
            return Err(self.error_here("bad import path length"));
        }
        let names = path
            .iter()
            .map(|name| self.add_string(name.as_bytes()))
            .collect::<Vec<_>>();
        self.add_constant(ConstKey::Import(names.clone()), Constant::Import(names))
    }

    /// Key set of a table constructor. `keys` are constant indices of the
    /// open function and must name strings, numbers or booleans.
    pub fn add_constant_table_shape(&mut self, keys: &[u32]) -> Result<u32, CompileError> {
        let f = self.open()?;
        let mut pool_keys = Vec::with_capacity(keys.len());
        for &k in keys {
            match f.info.constants.get(k as usize) {
                Some(&p) => pool_keys.push(p),
                None => {
                    let line = f.line;
                    return Err(CompileError::new(line, 0, format!("constant {} does not exist", k)));
                }
            }
        }
        for &p in &pool_keys {
            if !matches!(
                self.constants[p as usize],
                Constant::String(_) | Constant::Number(_) | Constant::Boolean(_)
            ) {
                return Err(self.error_here("table shape key is not a scalar constant"));
            }
        }
        self.add_constant(
            ConstKey::TableShape(pool_keys.clone()),
            Constant::TableShape(pool_keys),
        )
    }

    /// Prototype of an ended function, for `DupClosure`
    pub fn add_constant_closure(&mut self, fid: u32) -> Result<u32, CompileError> {
        let ended = fid < self.functions.len() as u32
            && self.current.as_ref().is_none_or(|f| f.id != fid);
        if !ended {
            return Err(self.error_here(format!("function {} is not finished", fid)));
        }
        self.add_constant(ConstKey::Closure(fid), Constant::Closure(fid))
    }

    // ============ Code ============

    /// Append an instruction; returns its position
    pub fn emit_instruction(&mut self, instr: Instruction) -> Result<u32, CompileError> {
        let f = self.open()?;
        let pc = f.info.code.len() as u32;
        f.info.code.push(instr);
        f.info.lines.push(f.line);
        Ok(pc)
    }

    pub fn emit_abc(&mut self, op: OpCode, a: u8, b: u8, c: u8) -> Result<u32, CompileError> {
        self.emit_instruction(Instruction::create_abc(op, a as u32, b as u32, c as u32))
    }

    pub fn emit_abck(&mut self, op: OpCode, a: u8, b: u8, c: u8, k: bool) -> Result<u32, CompileError> {
        self.emit_instruction(Instruction::create_abck(op, a as u32, b as u32, c as u32, k))
    }

    pub fn emit_abx(&mut self, op: OpCode, a: u8, bx: u32) -> Result<u32, CompileError> {
        if bx > Instruction::MAX_BX {
            return Err(self.error_here(format!("operand {} does not fit Bx", bx)));
        }
        self.emit_instruction(Instruction::create_abx(op, a as u32, bx))
    }

    pub fn emit_asbx(&mut self, op: OpCode, a: u8, sbx: i32) -> Result<u32, CompileError> {
        if !Instruction::fits_sbx(sbx as i64) {
            return Err(self.error_here(format!("operand {} does not fit sBx", sbx)));
        }
        self.emit_instruction(Instruction::create_asbx(op, a as u32, sbx))
    }

    /// Current position, as a jump target
    pub fn emit_label(&mut self) -> Result<Label, CompileError> {
        let f = self.open()?;
        Ok(Label(f.info.code.len() as u32))
    }

    /// Emit `Jmp`, `JmpIf` or `JmpIfNot` with its target left open
    pub fn emit_jump(&mut self, op: OpCode, a: u8) -> Result<Jump, CompileError> {
        if !matches!(op, OpCode::Jmp | OpCode::JmpIf | OpCode::JmpIfNot) {
            return Err(self.error_here(format!("{} is not a patchable jump", op.name())));
        }
        let pos = self.emit_instruction(Instruction::create_asbx(op, a as u32, 0))?;
        self.open()?.jumps.push(PendingJump { pos, target: None });
        Ok(Jump(pos))
    }

    pub fn patch_jump(&mut self, jump: Jump, label: Label) -> Result<(), CompileError> {
        let f = self.open()?;
        let line = f.line;
        if label.0 as usize > f.info.code.len() {
            return Err(CompileError::new(line, 0, "label is past the end of the code"));
        }
        match f.jumps.iter_mut().find(|j| j.pos == jump.0) {
            Some(j) => {
                j.target = Some(label.0);
                Ok(())
            }
            None => Err(CompileError::new(line, 0, "unknown jump")),
        }
    }

    // ============ Output ============

    /// Serialize everything built so far. Recorded errors (or a function
    /// still open) produce an error chunk instead.
    pub fn finalize(mut self) -> Vec<u8> {
        if self.current.is_some() {
            let err = self.error_here("function was never ended");
            self.errors.push(err);
        }
        if !self.errors.is_empty() {
            return Self::finalize_error(&self.errors);
        }
        match self.build() {
            Ok(chunk) => encode(&chunk),
            Err(e) => Self::finalize_error(&[e]),
        }
    }

    /// The chunk `finalize` would serialize
    pub fn build(self) -> Result<Chunk, CompileError> {
        let Some(main) = self.main.or(self.last_ended) else {
            return Err(CompileError::new(0, 0, "no function was built"));
        };
        if main as usize >= self.functions.len() {
            return Err(CompileError::new(0, 0, format!("main function {} does not exist", main)));
        }
        Ok(Chunk {
            strings: self.strings,
            constants: self.constants,
            functions: self.functions,
            main,
            debug: self.debug,
            source: self.source,
        })
    }

    /// Error-only chunk: one error verbatim, several as a count followed by
    /// one error per line
    pub fn finalize_error(errors: &[CompileError]) -> Vec<u8> {
        let message = match errors {
            [] => "compilation failed".to_string(),
            [single] => single.to_string(),
            many => {
                let mut msg = format!("{} errors", many.len());
                for e in many {
                    msg.push('\n');
                    msg.push_str(&e.to_string());
                }
                msg
            }
        };
        encode_error(&message)
    }
}

/// Width of a jump word after layout
#[derive(Clone, Copy, PartialEq, Eq)]
enum JumpForm {
    Short,
    /// `JmpX` in place of `Jmp`
    Long,
    /// inverse conditional over a `JmpX`
    LongConditional,
}

/// Lay out `info.code` with every `(pos, target)` jump resolved. Jumps whose
/// offset does not fit are widened; widening shifts code, so the layout is
/// repeated until no jump changes form.
fn resolve_jumps(info: &mut FunctionInfo, jumps: &[(u32, u32)]) -> Result<(), String> {
    let len = info.code.len();
    let mut forms = vec![JumpForm::Short; jumps.len()];
    let mut new_pos = vec![0u32; len + 1];

    loop {
        let mut size = vec![1u32; len];
        for (j, &(pos, _)) in jumps.iter().enumerate() {
            if forms[j] == JumpForm::LongConditional {
                size[pos as usize] = 2;
            }
        }
        let mut acc = 0u32;
        for (i, slot) in new_pos.iter_mut().enumerate() {
            *slot = acc;
            if i < len {
                acc += size[i];
            }
        }

        let mut changed = false;
        for (j, &(pos, target)) in jumps.iter().enumerate() {
            if forms[j] != JumpForm::Short {
                continue;
            }
            let offset = new_pos[target as usize] as i64 - (new_pos[pos as usize] as i64 + 1);
            if !Instruction::fits_sbx(offset) {
                forms[j] = match info.code[pos as usize].opcode() {
                    Some(OpCode::Jmp) => JumpForm::Long,
                    _ => JumpForm::LongConditional,
                };
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut form_at = AHashMap::with_capacity(jumps.len());
    for (j, &(pos, target)) in jumps.iter().enumerate() {
        form_at.insert(pos, (forms[j], target));
    }

    let total = new_pos[len] as usize;
    let mut code = Vec::with_capacity(total);
    let mut lines = Vec::with_capacity(if info.lines.is_empty() { 0 } else { total });
    let mut fixups = Vec::new();
    for (pos, &instr) in info.code.iter().enumerate() {
        let line = info.lines.get(pos).copied();
        let at = new_pos[pos] as i64;
        match form_at.get(&(pos as u32)) {
            None => code.push(instr),
            Some(&(form, target)) => {
                let dest = new_pos[target as usize] as i64;
                let op = instr.opcode().ok_or("jump with an undefined opcode")?;
                match form {
                    JumpForm::Short => {
                        let mut i = instr;
                        i.set_sbx((dest - (at + 1)) as i32);
                        code.push(i);
                    }
                    JumpForm::Long => {
                        let offset = dest - (at + 1);
                        if !Instruction::fits_sj(offset) {
                            return Err(format!("jump offset {} out of range", offset));
                        }
                        code.push(Instruction::create_sj(OpCode::JmpX, offset as i32));
                        fixups.push(at as u32);
                    }
                    JumpForm::LongConditional => {
                        let inverse = match op {
                            OpCode::JmpIf => OpCode::JmpIfNot,
                            _ => OpCode::JmpIf,
                        };
                        let offset = dest - (at + 2);
                        if !Instruction::fits_sj(offset) {
                            return Err(format!("jump offset {} out of range", offset));
                        }
                        code.push(Instruction::create_asbx(inverse, instr.get_a(), 1));
                        code.push(Instruction::create_sj(OpCode::JmpX, offset as i32));
                        fixups.push(at as u32);
                        if let Some(line) = line {
                            lines.push(line);
                        }
                    }
                }
            }
        }
        if let Some(line) = line {
            lines.push(line);
        }
    }

    for local in &mut info.locals {
        local.start_pc = remap(&new_pos, local.start_pc);
        local.end_pc = remap(&new_pos, local.end_pc);
    }
    info.code = code;
    info.lines = lines;
    info.jump_fixups = fixups;
    Ok(())
}

fn remap(new_pos: &[u32], pc: u32) -> u32 {
    new_pos
        .get(pc as usize)
        .copied()
        .unwrap_or_else(|| new_pos.last().copied().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::format::{Decoded, decode};

    fn single_function(build: impl FnOnce(&mut BytecodeBuilder)) -> Chunk {
        let mut b = BytecodeBuilder::new();
        b.begin_function(0, false).unwrap();
        build(&mut b);
        b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
        b.end_function(4).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn constants_are_shared() {
        let chunk = single_function(|b| {
            let k1 = b.add_constant_string(b"x").unwrap();
            let k2 = b.add_constant_number(1.0).unwrap();
            assert_eq!(b.add_constant_string(b"x").unwrap(), k1);
            assert_eq!(b.add_constant_number(1.0).unwrap(), k2);
            assert_ne!(k1, k2);
        });
        assert_eq!(chunk.constants.len(), 2);
        assert_eq!(chunk.strings.len(), 1);
    }

    #[test]
    fn short_jumps_are_patched_in_place() {
        let chunk = single_function(|b| {
            let j = b.emit_jump(OpCode::Jmp, 0).unwrap();
            b.emit_abc(OpCode::Nop, 0, 0, 0).unwrap();
            let l = b.emit_label().unwrap();
            b.patch_jump(j, l).unwrap();
        });
        let code = &chunk.functions[0].code;
        assert_eq!(code[0].opcode(), Some(OpCode::Jmp));
        assert_eq!(code[0].get_sbx(), 1);
        assert!(chunk.functions[0].jump_fixups.is_empty());
    }

    #[test]
    fn distant_jumps_are_widened() {
        let filler = Instruction::MAX_SBX as usize + 10;
        let chunk = single_function(|b| {
            let j1 = b.emit_jump(OpCode::Jmp, 0).unwrap();
            let j2 = b.emit_jump(OpCode::JmpIf, 3).unwrap();
            for _ in 0..filler {
                b.emit_abc(OpCode::Nop, 0, 0, 0).unwrap();
            }
            let l = b.emit_label().unwrap();
            b.patch_jump(j1, l).unwrap();
            b.patch_jump(j2, l).unwrap();
        });
        let f = &chunk.functions[0];
        assert_eq!(f.code[0].opcode(), Some(OpCode::JmpX));
        assert_eq!(f.code[1].opcode(), Some(OpCode::JmpIfNot));
        assert_eq!(f.code[1].get_a(), 3);
        assert_eq!(f.code[1].get_sbx(), 1);
        assert_eq!(f.code[2].opcode(), Some(OpCode::JmpX));
        // both land on the Return after the filler
        let target = 3 + filler as i32;
        assert_eq!(1 + f.code[0].get_sj(), target);
        assert_eq!(3 + f.code[2].get_sj(), target);
        assert_eq!(f.code[target as usize].opcode(), Some(OpCode::Return));
        assert_eq!(f.jump_fixups, vec![0, 1]);
        assert_eq!(f.lines.len(), f.code.len());
    }

    #[test]
    fn unpatched_jump_fails_the_function() {
        let mut b = BytecodeBuilder::new();
        b.begin_function(0, false).unwrap();
        b.emit_jump(OpCode::Jmp, 0).unwrap();
        assert!(b.end_function(1).is_err());
    }

    #[test]
    fn single_error_is_verbatim() {
        let bytes = BytecodeBuilder::finalize_error(&[CompileError::new(3, 7, "unexpected 'end'")]);
        assert_eq!(
            decode(&bytes).unwrap(),
            Decoded::Error("3:7: unexpected 'end'".into())
        );
    }

    #[test]
    fn several_errors_are_counted() {
        let mut b = BytecodeBuilder::new();
        b.add_error(CompileError::new(1, 1, "a"));
        b.add_error(CompileError::new(2, 4, "b"));
        let bytes = b.finalize();
        assert_eq!(
            decode(&bytes).unwrap(),
            Decoded::Error("2 errors\n1:1: a\n2:4: b".into())
        );
    }

    #[test]
    fn children_must_be_finished() {
        let mut b = BytecodeBuilder::new();
        let child = b.begin_function(1, false).unwrap();
        b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
        b.end_function(2).unwrap();
        let parent = b.begin_function(0, true).unwrap();
        assert_eq!(b.add_child(child).unwrap(), 0);
        assert!(b.add_child(parent).is_err());
        assert!(b.add_constant_closure(parent).is_err());
        b.emit_abc(OpCode::Return, 0, 1, 0).unwrap();
        b.end_function(2).unwrap();
        let chunk = b.build().unwrap();
        assert_eq!(chunk.main, parent);
    }
}
