// CallInfo - information about a single function call

use std::rc::Rc;

use crate::gc::FunctionId;
use crate::value::{Prototype, Value};

/// Call status flags
pub mod call_status {
    /// Script function (has bytecode)
    pub const CIST_SCRIPT: u32 = 1 << 0;
    /// Native function
    pub const CIST_NATIVE: u32 = 1 << 1;
    /// Entered from Rust: the interpreter loop that started this frame
    /// returns to its caller when the frame returns
    pub const CIST_FRESH: u32 = 1 << 2;
}

/// Information about a single function call on the call stack
#[derive(Clone)]
pub struct CallInfo {
    /// Called closure
    pub func: FunctionId,

    /// Stack index holding the function value; results are moved here on return
    pub func_index: usize,

    /// Base index in the stack for this call frame's registers
    pub base: usize,

    /// Top of stack for this frame (first slot past its registers)
    pub top: usize,

    /// Program counter (script frames only): next instruction to execute
    pub pc: usize,

    /// Number of expected results, `MULTRET` for all
    pub nresults: i32,

    /// Call status flags (CIST_*)
    pub call_status: u32,

    /// Bytecode of a script frame
    pub proto: Option<Rc<Prototype>>,

    /// Extra arguments of a vararg function
    pub varargs: Vec<Value>,
}

impl CallInfo {
    /// Create a new call frame for a script function
    pub fn new_script(
        func: FunctionId,
        func_index: usize,
        proto: Rc<Prototype>,
        nresults: i32,
    ) -> Self {
        let base = func_index + 1;
        Self {
            func,
            func_index,
            base,
            top: base + proto.max_stack_size as usize,
            pc: 0,
            nresults,
            call_status: call_status::CIST_SCRIPT,
            proto: Some(proto),
            varargs: Vec::new(),
        }
    }

    /// Create a new call frame for a native function
    pub fn new_native(func: FunctionId, func_index: usize, top: usize, nresults: i32) -> Self {
        Self {
            func,
            func_index,
            base: func_index + 1,
            top,
            pc: 0,
            nresults,
            call_status: call_status::CIST_NATIVE,
            proto: None,
            varargs: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn is_script(&self) -> bool {
        self.call_status & call_status::CIST_SCRIPT != 0
    }

    #[inline(always)]
    pub fn is_native(&self) -> bool {
        self.call_status & call_status::CIST_NATIVE != 0
    }

    #[inline(always)]
    pub fn is_fresh(&self) -> bool {
        self.call_status & call_status::CIST_FRESH != 0
    }

    #[inline(always)]
    pub fn set_fresh(&mut self) {
        self.call_status |= call_status::CIST_FRESH;
    }

    /// Line of the instruction being executed, if debug info is present
    pub fn current_line(&self) -> Option<u32> {
        let proto = self.proto.as_ref()?;
        proto.line_at(self.pc.saturating_sub(1))
    }
}
