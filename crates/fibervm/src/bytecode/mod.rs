// Bytecode: chunk format, builder, loader and disassembler
mod builder;
mod disasm;
mod format;
mod loader;

pub use builder::{BytecodeBuilder, CompileError, Jump, Label};
pub use disasm::disassemble;
pub use format::{
    Chunk, Constant, Decoded, FVM_MAGIC, FVM_VERSION, FunctionInfo, LocalInfo, decode, encode,
    encode_error,
};
pub use loader::load;
