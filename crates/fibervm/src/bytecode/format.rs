// Chunk encoder/decoder
//
// Binary layout, little endian:
//   magic "\x1bFVM", version byte
//   version 0: u32 length + message (a chunk that failed to compile)
//   version 1: flags, string table, constant pool, functions,
//              [debug info], main function index, [source blob]

use crate::value::UpvalueDesc;
use crate::vm::{Instruction, VmError, VmResult};

pub const FVM_MAGIC: &[u8; 4] = b"\x1bFVM";
pub const FVM_VERSION: u8 = 1;
pub const FVM_VERSION_ERROR: u8 = 0;

pub const FLAG_DEBUG: u8 = 1 << 0;
pub const FLAG_SOURCE: u8 = 1 << 1;

const TAG_NULL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_IMPORT: u8 = 5;
const TAG_TABLE_SHAPE: u8 = 6;
const TAG_CLOSURE: u8 = 7;

/// Entry of the chunk-wide constant pool
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Null,
    Boolean(bool),
    Number(f64),
    /// String table index
    String(u32),
    /// Dotted global path, as string table indices
    Import(Vec<u32>),
    /// Keys of a table constructor, as constant pool indices
    TableShape(Vec<u32>),
    /// Function table index
    Closure(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInfo {
    pub name: u32,
    pub start_pc: u32,
    pub end_pc: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionInfo {
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack: u8,
    /// String table index
    pub name: Option<u32>,
    pub line_defined: u32,
    pub code: Vec<Instruction>,
    /// Constant pool indices
    pub constants: Vec<u32>,
    /// Function table indices
    pub children: Vec<u32>,
    pub upvalues: Vec<UpvalueDesc>,
    pub jump_fixups: Vec<u32>,
    // debug section
    pub lines: Vec<u32>,
    pub locals: Vec<LocalInfo>,
    pub upvalue_names: Vec<u32>,
}

/// Decoded chunk, before any object is created
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub strings: Vec<Vec<u8>>,
    pub constants: Vec<Constant>,
    pub functions: Vec<FunctionInfo>,
    pub main: u32,
    pub debug: bool,
    pub source: Option<Vec<u8>>,
}

impl Chunk {
    pub fn string(&self, index: u32) -> Option<&[u8]> {
        self.strings.get(index as usize).map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The chunk records a compile failure instead of code
    Error(String),
    Chunk(Chunk),
}

// ============ Encoding ============

pub fn encode_error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FVM_MAGIC.len() + 5 + message.len());
    buf.extend_from_slice(FVM_MAGIC);
    buf.push(FVM_VERSION_ERROR);
    write_bytes(&mut buf, message.as_bytes());
    buf
}

pub fn encode(chunk: &Chunk) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(FVM_MAGIC);
    buf.push(FVM_VERSION);
    let mut flags = 0;
    if chunk.debug {
        flags |= FLAG_DEBUG;
    }
    if chunk.source.is_some() {
        flags |= FLAG_SOURCE;
    }
    buf.push(flags);

    write_u32(&mut buf, chunk.strings.len() as u32);
    for s in &chunk.strings {
        write_bytes(&mut buf, s);
    }

    write_u32(&mut buf, chunk.constants.len() as u32);
    for k in &chunk.constants {
        write_constant(&mut buf, k);
    }

    write_u32(&mut buf, chunk.functions.len() as u32);
    for f in &chunk.functions {
        write_function(&mut buf, f);
    }

    if chunk.debug {
        for f in &chunk.functions {
            write_u32_list(&mut buf, &f.lines);
            write_u32(&mut buf, f.locals.len() as u32);
            for local in &f.locals {
                write_u32(&mut buf, local.name);
                write_u32(&mut buf, local.start_pc);
                write_u32(&mut buf, local.end_pc);
            }
            write_u32_list(&mut buf, &f.upvalue_names);
        }
    }

    write_u32(&mut buf, chunk.main);
    if let Some(source) = &chunk.source {
        write_bytes(&mut buf, source);
    }
    buf
}

fn write_constant(buf: &mut Vec<u8>, k: &Constant) {
    match k {
        Constant::Null => buf.push(TAG_NULL),
        Constant::Boolean(false) => buf.push(TAG_FALSE),
        Constant::Boolean(true) => buf.push(TAG_TRUE),
        Constant::Number(n) => {
            buf.push(TAG_NUMBER);
            write_f64(buf, *n);
        }
        Constant::String(s) => {
            buf.push(TAG_STRING);
            write_u32(buf, *s);
        }
        Constant::Import(path) => {
            buf.push(TAG_IMPORT);
            buf.push(path.len() as u8);
            for &s in path {
                write_u32(buf, s);
            }
        }
        Constant::TableShape(keys) => {
            buf.push(TAG_TABLE_SHAPE);
            write_u32_list(buf, keys);
        }
        Constant::Closure(f) => {
            buf.push(TAG_CLOSURE);
            write_u32(buf, *f);
        }
    }
}

fn write_function(buf: &mut Vec<u8>, f: &FunctionInfo) {
    buf.push(f.num_params);
    buf.push(f.is_vararg as u8);
    buf.push(f.max_stack);
    buf.push(f.upvalues.len() as u8);
    write_u32(buf, f.name.map_or(0, |n| n + 1));
    write_u32(buf, f.line_defined);

    write_u32(buf, f.code.len() as u32);
    for instr in &f.code {
        write_u32(buf, instr.as_u32());
    }
    write_u32_list(buf, &f.constants);
    write_u32_list(buf, &f.children);
    for uv in &f.upvalues {
        buf.push(uv.in_stack as u8);
        buf.push(uv.index);
    }
    write_u32_list(buf, &f.jump_fixups);
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_f64(buf: &mut Vec<u8>, value: f64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn write_u32_list(buf: &mut Vec<u8>, values: &[u32]) {
    write_u32(buf, values.len() as u32);
    for &v in values {
        write_u32(buf, v);
    }
}

// ============ Decoding ============

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

fn malformed(what: impl Into<String>) -> VmError {
    VmError::Malformed(what.into())
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> VmResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(malformed(format!("truncated chunk reading {}", what)));
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_u8(&mut self, what: &str) -> VmResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u32(&mut self, what: &str) -> VmResult<u32> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(word))
    }

    fn read_f64(&mut self, what: &str) -> VmResult<f64> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.take(8, what)?);
        Ok(f64::from_le_bytes(word))
    }

    /// Element count of a list whose elements take at least `min_size` bytes
    fn read_count(&mut self, min_size: usize, what: &str) -> VmResult<usize> {
        let n = self.read_u32(what)? as usize;
        if n.saturating_mul(min_size) > self.remaining() {
            return Err(malformed(format!("{} count {} exceeds the chunk", what, n)));
        }
        Ok(n)
    }

    fn read_bytes(&mut self, what: &str) -> VmResult<Vec<u8>> {
        let n = self.read_count(1, what)?;
        Ok(self.take(n, what)?.to_vec())
    }

    fn read_u32_list(&mut self, what: &str) -> VmResult<Vec<u32>> {
        let n = self.read_count(4, what)?;
        (0..n).map(|_| self.read_u32(what)).collect()
    }
}

fn check_index(index: u32, len: usize, what: &str) -> VmResult<u32> {
    if (index as usize) < len {
        Ok(index)
    } else {
        Err(malformed(format!("{} index {} out of range ({})", what, index, len)))
    }
}

/// Decode and validate a chunk. Every length and index is checked; bad input
/// yields `Malformed`.
pub fn decode(data: &[u8]) -> VmResult<Decoded> {
    let mut r = Reader::new(data);
    if r.take(FVM_MAGIC.len(), "magic")? != FVM_MAGIC {
        return Err(malformed("not a bytecode chunk"));
    }
    match r.read_u8("version")? {
        FVM_VERSION_ERROR => {
            let msg = r.read_bytes("error message")?;
            return Ok(Decoded::Error(String::from_utf8_lossy(&msg).into_owned()));
        }
        FVM_VERSION => {}
        v => return Err(malformed(format!("unsupported bytecode version {}", v))),
    }
    let flags = r.read_u8("flags")?;
    if flags & !(FLAG_DEBUG | FLAG_SOURCE) != 0 {
        return Err(malformed(format!("unknown flags {:#04x}", flags)));
    }

    let nstrings = r.read_count(4, "string table")?;
    let mut strings = Vec::with_capacity(nstrings);
    for _ in 0..nstrings {
        strings.push(r.read_bytes("string")?);
    }

    let nconstants = r.read_count(1, "constant pool")?;
    let mut constants = Vec::with_capacity(nconstants);
    for _ in 0..nconstants {
        constants.push(read_constant(&mut r)?);
    }

    let nfunctions = r.read_count(20, "function table")?;
    let mut functions = Vec::with_capacity(nfunctions);
    for _ in 0..nfunctions {
        functions.push(read_function(&mut r)?);
    }

    let debug = flags & FLAG_DEBUG != 0;
    if debug {
        for f in &mut functions {
            f.lines = r.read_u32_list("line info")?;
            let nlocals = r.read_count(12, "locals")?;
            for _ in 0..nlocals {
                f.locals.push(LocalInfo {
                    name: r.read_u32("local name")?,
                    start_pc: r.read_u32("local start")?,
                    end_pc: r.read_u32("local end")?,
                });
            }
            f.upvalue_names = r.read_u32_list("upvalue names")?;
        }
    }

    let main = r.read_u32("main function")?;
    let source = if flags & FLAG_SOURCE != 0 {
        Some(r.read_bytes("source")?)
    } else {
        None
    };
    if r.remaining() != 0 {
        return Err(malformed(format!("{} trailing bytes", r.remaining())));
    }

    let chunk = Chunk {
        strings,
        constants,
        functions,
        main,
        debug,
        source,
    };
    validate(&chunk)?;
    Ok(Decoded::Chunk(chunk))
}

fn read_constant(r: &mut Reader<'_>) -> VmResult<Constant> {
    Ok(match r.read_u8("constant tag")? {
        TAG_NULL => Constant::Null,
        TAG_FALSE => Constant::Boolean(false),
        TAG_TRUE => Constant::Boolean(true),
        TAG_NUMBER => Constant::Number(r.read_f64("number constant")?),
        TAG_STRING => Constant::String(r.read_u32("string constant")?),
        TAG_IMPORT => {
            let n = r.read_u8("import length")?;
            let path = (0..n)
                .map(|_| r.read_u32("import name"))
                .collect::<VmResult<Vec<_>>>()?;
            Constant::Import(path)
        }
        TAG_TABLE_SHAPE => Constant::TableShape(r.read_u32_list("table shape")?),
        TAG_CLOSURE => Constant::Closure(r.read_u32("closure constant")?),
        tag => return Err(malformed(format!("unknown constant tag {}", tag))),
    })
}

fn read_function(r: &mut Reader<'_>) -> VmResult<FunctionInfo> {
    let num_params = r.read_u8("params")?;
    let is_vararg = match r.read_u8("vararg flag")? {
        0 => false,
        1 => true,
        v => return Err(malformed(format!("bad vararg flag {}", v))),
    };
    let max_stack = r.read_u8("max stack")?;
    let nupvalues = r.read_u8("upvalue count")?;
    let name = r.read_u32("function name")?.checked_sub(1);
    let line_defined = r.read_u32("line defined")?;

    let ncode = r.read_count(4, "code")?;
    let mut code = Vec::with_capacity(ncode);
    for _ in 0..ncode {
        code.push(Instruction::from_u32(r.read_u32("instruction")?));
    }
    let constants = r.read_u32_list("function constants")?;
    let children = r.read_u32_list("child functions")?;
    let mut upvalues = Vec::with_capacity(nupvalues as usize);
    for _ in 0..nupvalues {
        let in_stack = match r.read_u8("upvalue descriptor")? {
            0 => false,
            1 => true,
            v => return Err(malformed(format!("bad upvalue kind {}", v))),
        };
        upvalues.push(UpvalueDesc {
            in_stack,
            index: r.read_u8("upvalue index")?,
        });
    }
    let jump_fixups = r.read_u32_list("jump fixups")?;
    Ok(FunctionInfo {
        num_params,
        is_vararg,
        max_stack,
        name,
        line_defined,
        code,
        constants,
        children,
        upvalues,
        jump_fixups,
        ..Default::default()
    })
}

/// Cross-reference checks. Functions may only refer to functions defined
/// before them, so the loader can create prototypes in table order.
fn validate(chunk: &Chunk) -> VmResult<()> {
    let nstrings = chunk.strings.len();
    let nconstants = chunk.constants.len();
    let nfunctions = chunk.functions.len();

    for k in &chunk.constants {
        match k {
            Constant::String(s) => {
                check_index(*s, nstrings, "string")?;
            }
            Constant::Import(path) => {
                if path.is_empty() {
                    return Err(malformed("empty import path"));
                }
                for &s in path {
                    check_index(s, nstrings, "import name")?;
                }
            }
            Constant::TableShape(keys) => {
                for &key in keys {
                    check_index(key, nconstants, "table shape key")?;
                    if !matches!(
                        chunk.constants[key as usize],
                        Constant::String(_) | Constant::Number(_) | Constant::Boolean(_)
                    ) {
                        return Err(malformed("table shape key is not a scalar constant"));
                    }
                }
            }
            Constant::Closure(f) => {
                check_index(*f, nfunctions, "closure")?;
            }
            Constant::Null | Constant::Boolean(_) | Constant::Number(_) => {}
        }
    }

    for (fid, f) in chunk.functions.iter().enumerate() {
        if let Some(name) = f.name {
            check_index(name, nstrings, "function name")?;
        }
        for (pc, instr) in f.code.iter().enumerate() {
            if instr.opcode().is_none() {
                return Err(malformed(format!(
                    "function {}: undefined opcode at pc {}",
                    fid, pc
                )));
            }
        }
        for &k in &f.constants {
            check_index(k, nconstants, "constant")?;
            if let Constant::Closure(target) = chunk.constants[k as usize] {
                if target as usize >= fid {
                    return Err(malformed(format!(
                        "function {} refers to function {} defined after it",
                        fid, target
                    )));
                }
            }
        }
        for &child in &f.children {
            if child as usize >= fid {
                return Err(malformed(format!(
                    "function {} has child {} defined after it",
                    fid, child
                )));
            }
        }
        for &pos in &f.jump_fixups {
            check_index(pos, f.code.len(), "jump fixup")?;
        }
        if chunk.debug {
            if !f.lines.is_empty() && f.lines.len() != f.code.len() {
                return Err(malformed(format!(
                    "function {}: {} line entries for {} instructions",
                    fid,
                    f.lines.len(),
                    f.code.len()
                )));
            }
            for local in &f.locals {
                check_index(local.name, nstrings, "local name")?;
                if local.start_pc > local.end_pc || local.end_pc as usize > f.code.len() {
                    return Err(malformed(format!("function {}: bad local range", fid)));
                }
            }
            for &name in &f.upvalue_names {
                check_index(name, nstrings, "upvalue name")?;
            }
        }
    }

    check_index(chunk.main, nfunctions, "main function")?;
    if !chunk.functions[chunk.main as usize].upvalues.is_empty() {
        return Err(malformed("main function cannot capture upvalues"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::OpCode;

    fn sample() -> Chunk {
        Chunk {
            strings: vec![b"print".to_vec(), b"hi".to_vec()],
            constants: vec![
                Constant::Import(vec![0]),
                Constant::String(1),
                Constant::Number(2.5),
            ],
            functions: vec![FunctionInfo {
                max_stack: 2,
                is_vararg: true,
                code: vec![
                    Instruction::create_abx(OpCode::GetImport, 0, 0),
                    Instruction::create_abx(OpCode::LoadK, 1, 1),
                    Instruction::create_abc(OpCode::Call, 0, 2, 1),
                    Instruction::create_abc(OpCode::Return, 0, 1, 0),
                ],
                constants: vec![0, 1, 2],
                lines: vec![1, 1, 1, 2],
                ..Default::default()
            }],
            main: 0,
            debug: true,
            source: Some(b"print('hi')".to_vec()),
        }
    }

    #[test]
    fn error_chunk_carries_message() {
        let bytes = encode_error("1:5: unexpected symbol");
        assert_eq!(
            decode(&bytes).unwrap(),
            Decoded::Error("1:5: unexpected symbol".into())
        );
    }

    #[test]
    fn decode_restores_encoded_chunk() {
        let chunk = sample();
        let bytes = encode(&chunk);
        assert_eq!(decode(&bytes).unwrap(), Decoded::Chunk(chunk));
    }

    #[test]
    fn every_truncation_is_rejected() {
        let bytes = encode(&sample());
        for len in 0..bytes.len() {
            assert!(
                matches!(decode(&bytes[..len]), Err(VmError::Malformed(_))),
                "prefix of {} bytes accepted",
                len
            );
        }
    }

    #[test]
    fn bad_references_are_rejected() {
        let mut chunk = sample();
        chunk.constants.push(Constant::String(9));
        assert!(matches!(decode(&encode(&chunk)), Err(VmError::Malformed(_))));

        let mut chunk = sample();
        chunk.main = 3;
        assert!(matches!(decode(&encode(&chunk)), Err(VmError::Malformed(_))));

        let mut chunk = sample();
        chunk.functions[0].children.push(0);
        assert!(matches!(decode(&encode(&chunk)), Err(VmError::Malformed(_))));

        let mut chunk = sample();
        chunk.functions[0].code.push(Instruction::from_u32(0x7f));
        chunk.functions[0].lines.push(3);
        assert!(matches!(decode(&encode(&chunk)), Err(VmError::Malformed(_))));
    }

    #[test]
    fn huge_counts_do_not_allocate() {
        let mut bytes = FVM_MAGIC.to_vec();
        bytes.push(FVM_VERSION);
        bytes.push(0);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(VmError::Malformed(_))));
    }
}
