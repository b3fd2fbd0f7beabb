// fibervm
// Bytecode VM core: incremental tri-color collector, interned strings,
// weak tables and cooperative fibers

#[cfg(test)]
mod test;

pub mod bytecode;
pub mod gc;
pub mod stdlib;
pub mod value;
pub mod vm;

#[cfg(feature = "serde")]
pub mod serde;

pub use bytecode::{BytecodeBuilder, CompileError};
pub use gc::{FunctionId, GcRef, StringId, TableId, ThreadId, UserdataId};
pub use stdlib::open_base;
pub use value::{NativeFn, Value, ValueType};
pub use vm::{
    CoStatus, GcParams, GlobalState, Instruction, OpCode, ResumeStatus, SafeOption, StateMut,
    VmError, VmResult,
};
