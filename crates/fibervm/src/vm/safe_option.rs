use crate::vm::limits::{
    DEFAULT_GC_PAUSE, DEFAULT_GC_STEPMUL, DEFAULT_GC_STEPSIZE, LUAI_MAXSTACK, MAX_CALL_DEPTH,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Incremental collector tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GcParams {
    /// Percentage of the post-collection heap to reach before the next cycle
    pub pause: u32,
    /// Percentage of `step_size` worth of work per increment
    pub step_mul: u32,
    /// Bytes allocated between increments
    pub step_size: usize,
}

impl Default for GcParams {
    fn default() -> Self {
        Self {
            pause: DEFAULT_GC_PAUSE,
            step_mul: DEFAULT_GC_STEPMUL,
            step_size: DEFAULT_GC_STEPSIZE,
        }
    }
}

/// Per-state limits
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SafeOption {
    pub max_stack_size: usize,
    pub max_call_depth: usize,
    /// Maximum memory limit in bytes
    pub max_memory_limit: usize,
    pub gc: GcParams,
}

impl Default for SafeOption {
    fn default() -> Self {
        Self {
            max_stack_size: LUAI_MAXSTACK,
            max_call_depth: MAX_CALL_DEPTH,
            max_memory_limit: usize::MAX,
            gc: GcParams::default(),
        }
    }
}
