// Function representation: prototypes, closures and upvalues

use smol_str::SmolStr;

use crate::gc::{GcRef, ProtoId, StringId, TableId, UpvalueId};
use crate::value::Value;
use crate::vm::{Instruction, StateMut, VmResult};

/// Native function: reads its arguments from the stack, pushes its results and
/// returns how many it pushed.
pub type NativeFn = fn(&mut StateMut<'_>) -> VmResult<usize>;

/// Where a closure finds an upvalue when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    /// true: a register of the enclosing function; false: one of its upvalues
    pub in_stack: bool,
    pub index: u8,
}

/// Local variable live range, for debug output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVar {
    pub name: SmolStr,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Compiled function body. Immutable once loaded.
#[derive(Debug, Default)]
pub struct Prototype {
    pub code: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub protos: Vec<ProtoId>,
    pub upvalue_descs: Vec<UpvalueDesc>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub line_defined: u32,
    pub source: Option<StringId>,
    pub name: Option<StringId>,
    // debug info
    pub line_info: Vec<u32>,
    pub locals: Vec<LocalVar>,
    pub upvalue_names: Vec<SmolStr>,
    /// Positions of jumps that were widened to the long form
    pub jump_fixups: Vec<u32>,
}

impl Prototype {
    #[inline]
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_info.get(pc).copied()
    }

    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Prototype>()
            + self.code.len() * std::mem::size_of::<Instruction>()
            + self.constants.len() * std::mem::size_of::<Value>()
            + self.protos.len() * std::mem::size_of::<ProtoId>()
            + self.line_info.len() * 4
            + self.locals.len() * std::mem::size_of::<LocalVar>()
    }
}

pub enum FunctionKind {
    Native {
        func: NativeFn,
        upvalues: Vec<Value>,
    },
    Script {
        proto: ProtoId,
        upvalues: Vec<UpvalueId>,
    },
}

/// Closure object
pub struct Function {
    pub kind: FunctionKind,
    /// Environment consulted by global accesses
    pub env: Option<TableId>,
}

impl Function {
    pub fn native(func: NativeFn, upvalues: Vec<Value>) -> Self {
        Self {
            kind: FunctionKind::Native { func, upvalues },
            env: None,
        }
    }

    pub fn script(proto: ProtoId, upvalues: Vec<UpvalueId>, env: Option<TableId>) -> Self {
        Self {
            kind: FunctionKind::Script { proto, upvalues },
            env,
        }
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        matches!(self.kind, FunctionKind::Native { .. })
    }

    #[inline]
    pub fn proto(&self) -> Option<ProtoId> {
        match &self.kind {
            FunctionKind::Script { proto, .. } => Some(*proto),
            FunctionKind::Native { .. } => None,
        }
    }

    #[inline]
    pub fn upvalue_id(&self, index: usize) -> Option<UpvalueId> {
        match &self.kind {
            FunctionKind::Script { upvalues, .. } => upvalues.get(index).copied(),
            FunctionKind::Native { .. } => None,
        }
    }

    pub fn byte_size(&self) -> usize {
        match &self.kind {
            FunctionKind::Native { upvalues, .. } => upvalues.len() * std::mem::size_of::<Value>(),
            FunctionKind::Script { upvalues, .. } => {
                upvalues.len() * std::mem::size_of::<UpvalueId>()
            }
        }
    }
}

/// Captured variable.
///
/// Open while the variable still lives in a register of `thread`; closing
/// copies the register into the upvalue and never goes back.
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    Open { thread: GcRef, stack_index: usize },
    Closed(Value),
}

impl Upvalue {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, Upvalue::Open { .. })
    }

    #[inline]
    pub fn stack_index(&self) -> Option<usize> {
        match self {
            Upvalue::Open { stack_index, .. } => Some(*stack_index),
            Upvalue::Closed(_) => None,
        }
    }

    /// Variant transition performed by `close_upvalues`
    #[inline]
    pub fn close(&mut self, value: Value) {
        *self = Upvalue::Closed(value);
    }
}
