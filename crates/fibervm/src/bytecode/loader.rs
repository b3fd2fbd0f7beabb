// Chunk loader: turns a decoded chunk into heap objects

use smol_str::SmolStr;

use crate::bytecode::format::{Chunk, Constant, Decoded, decode};
use crate::gc::{FunctionId, GcObject, ProtoId, StringId};
use crate::value::{Function, LocalVar, Prototype, Value};
use crate::vm::{GlobalState, VmError, VmResult};

/// Load `bytes` into `g` and return the main closure, whose environment is
/// the globals table. The result is not anchored: push it before the
/// collector runs again.
pub fn load(g: &mut GlobalState, bytes: &[u8], chunkname: &str) -> VmResult<FunctionId> {
    let chunk = match decode(bytes)? {
        Decoded::Error(msg) => return Err(VmError::Compile(msg)),
        Decoded::Chunk(chunk) => chunk,
    };
    // handles below live only in Rust locals until the closure exists
    let was_stopped = g.gc.stopped;
    g.gc.stopped = true;
    let result = Loader::new(g, &chunk).and_then(|mut loader| loader.run(chunkname));
    g.gc.stopped = was_stopped;
    let f = result?;
    log::debug!(
        "loaded chunk '{}': {} functions, {} constants, {} strings",
        chunkname,
        chunk.functions.len(),
        chunk.constants.len(),
        chunk.strings.len()
    );
    Ok(f)
}

struct Loader<'a> {
    g: &'a mut GlobalState,
    chunk: &'a Chunk,
    strings: Vec<StringId>,
    constants: Vec<Option<Value>>,
    protos: Vec<ProtoId>,
}

impl<'a> Loader<'a> {
    fn new(g: &'a mut GlobalState, chunk: &'a Chunk) -> VmResult<Self> {
        let strings = chunk
            .strings
            .iter()
            .map(|s| g.intern(s))
            .collect::<VmResult<Vec<_>>>()?;
        Ok(Self {
            g,
            chunk,
            strings,
            constants: vec![None; chunk.constants.len()],
            protos: Vec::with_capacity(chunk.functions.len()),
        })
    }

    fn run(&mut self, chunkname: &str) -> VmResult<FunctionId> {
        let source = self.g.intern_str(chunkname)?;
        for fid in 0..self.chunk.functions.len() {
            let proto = self.prototype(fid, source)?;
            let id = self.g.new_proto(proto)?;
            self.protos.push(id);
        }
        let main = self.protos[self.chunk.main as usize];
        let globals = self.g.globals;
        let r = self
            .g
            .alloc(GcObject::Function(Function::script(main, Vec::new(), Some(globals))))?;
        FunctionId::from_ref(r).ok_or(VmError::DeadObject)
    }

    fn name(&self, index: u32) -> SmolStr {
        self.chunk
            .string(index)
            .map(|s| SmolStr::new(String::from_utf8_lossy(s)))
            .unwrap_or_default()
    }

    fn prototype(&mut self, fid: usize, source: StringId) -> VmResult<Prototype> {
        let chunk = self.chunk;
        let f = &chunk.functions[fid];
        let constants = f
            .constants
            .iter()
            .map(|&k| self.constant(k))
            .collect::<VmResult<Vec<_>>>()?;
        let protos = f
            .children
            .iter()
            .map(|&c| self.protos[c as usize])
            .collect();
        Ok(Prototype {
            code: f.code.clone(),
            constants,
            protos,
            upvalue_descs: f.upvalues.clone(),
            num_params: f.num_params,
            is_vararg: f.is_vararg,
            max_stack_size: f.max_stack,
            line_defined: f.line_defined,
            source: Some(source),
            name: f.name.map(|n| self.strings[n as usize]),
            line_info: f.lines.clone(),
            locals: f
                .locals
                .iter()
                .map(|l| LocalVar {
                    name: self.name(l.name),
                    start_pc: l.start_pc,
                    end_pc: l.end_pc,
                })
                .collect(),
            upvalue_names: f.upvalue_names.iter().map(|&n| self.name(n)).collect(),
            jump_fixups: f.jump_fixups.clone(),
        })
    }

    /// Value of pool constant `k`, created on first use
    fn constant(&mut self, k: u32) -> VmResult<Value> {
        if let Some(v) = self.constants[k as usize] {
            return Ok(v);
        }
        let chunk = self.chunk;
        let v = match &chunk.constants[k as usize] {
            Constant::Null => Value::Null,
            Constant::Boolean(b) => Value::Boolean(*b),
            Constant::Number(n) => Value::Number(*n),
            Constant::String(s) => self.strings[*s as usize].into(),
            Constant::Import(path) => self.resolve_import(path)?,
            Constant::TableShape(keys) => {
                let t = self.g.new_table(keys.len())?;
                for &key in keys {
                    let key = self.constant(key)?;
                    self.g.table_set(t, key, Value::Boolean(true))?;
                }
                t.into()
            }
            Constant::Closure(f) => self.protos[*f as usize].into(),
        };
        self.constants[k as usize] = Some(v);
        Ok(v)
    }

    /// `a.b.c` looked up in the globals now; a missing link yields null
    fn resolve_import(&self, path: &[u32]) -> VmResult<Value> {
        let mut v: Value = self.g.globals.into();
        for &name in path {
            let key: Value = self.strings[name as usize].into();
            v = match v.as_table_id() {
                Some(t) => self.g.table_get(t, &key)?,
                None => return Ok(Value::Null),
            };
        }
        Ok(v)
    }
}
