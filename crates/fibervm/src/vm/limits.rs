//! Centralized VM limits and tuning constants.
//!
//! All magic numbers that control VM behavior are collected here.

// ===== Stack =====

/// Extra stack slots above a frame's top for temporaries and metamethod calls.
pub const EXTRA_STACK: usize = 5;

/// Minimum guaranteed stack slots available to native functions.
pub const MIN_STACK: usize = 20;

/// Initial stack capacity for new threads.
pub const BASIC_STACK_SIZE: usize = 2 * MIN_STACK;

/// Default maximum stack size (number of slots).
pub const LUAI_MAXSTACK: usize = 1_000_000;

/// Default maximum call-frame nesting per thread.
pub const MAX_CALL_DEPTH: usize = 256;

/// Maximum nesting of native -> script -> native calls on the Rust stack.
pub const MAX_NATIVE_DEPTH: usize = 200;

/// Sentinel for "all results" in call and return counts.
pub const MULTRET: i32 = -1;

// ===== Metamethods =====

/// Maximum depth for __index / __newindex metamethod chains.
pub const MAXTAGLOOP: usize = 2000;

// ===== GC Defaults =====

/// Default GC pause (percentage): a new cycle starts once the heap has grown
/// to this share of its size after the previous collection.
pub const DEFAULT_GC_PAUSE: u32 = 200;

/// Default GC step multiplier (percentage): work done per increment
/// relative to the step size.
pub const DEFAULT_GC_STEPMUL: u32 = 200;

/// Default GC step size in bytes of allocation between increments.
pub const DEFAULT_GC_STEPSIZE: usize = 8 * 1024;

/// Maximum number of arena slots swept per sweep unit.
pub const GC_SWEEPMAX: usize = 100;

/// Work charged for each swept slot.
pub const GC_SWEEPCOST: usize = 16;
