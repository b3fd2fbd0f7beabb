// Execution state of one fiber
// Several threads share a GlobalState (heap, strings, registry); each owns
// its value stack, call frames and the upvalues still open on its stack.

use crate::gc::{GcRef, UpvalueId};
use crate::value::Value;
use crate::vm::limits::{BASIC_STACK_SIZE, EXTRA_STACK, MULTRET};
use crate::vm::{CallInfo, VmError, VmResult};

/// Where a suspended coroutine receives the values it is resumed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YieldPoint {
    /// Absolute stack index of the first receiving register
    pub reg: usize,
    /// Number of values wanted, `MULTRET` for all
    pub wanted: i32,
}

/// Where a thread waiting on a coroutine receives its results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResumePoint {
    pub reg: usize,
    pub wanted: i32,
    /// Errors of the resumed coroutine are delivered as `(false, message)`
    pub protected: bool,
}

/// Coroutine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    /// Created, body not started
    Ready,
    Running,
    Suspended(YieldPoint),
    /// Waiting on a coroutine it resumed
    Normal,
    Finished,
    Failed,
}

impl CoStatus {
    pub fn name(self) -> &'static str {
        match self {
            CoStatus::Ready | CoStatus::Suspended(_) => "suspended",
            CoStatus::Running => "running",
            CoStatus::Normal => "normal",
            CoStatus::Finished | CoStatus::Failed => "dead",
        }
    }

    #[inline]
    pub fn is_resumable(self) -> bool {
        matches!(self, CoStatus::Ready | CoStatus::Suspended(_))
    }
}

/// Who gets control back when a coroutine yields, finishes or fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resumer {
    Host,
    Thread(GcRef),
}

pub struct ThreadState {
    /// Data stack - registers, temporaries, call arguments.
    /// `stack.len()` is the allocated size; only `..top` plus the registers
    /// of live frames hold meaningful values.
    pub(crate) stack: Vec<Value>,

    /// First free slot
    pub(crate) top: usize,

    /// One CallInfo per active call
    pub(crate) frames: Vec<CallInfo>,

    /// Open upvalues as (stack index, upvalue), ascending by index
    pub(crate) open_upvalues: Vec<(usize, UpvalueId)>,

    pub(crate) status: CoStatus,
    pub(crate) resumer: Option<Resumer>,
    pub(crate) pending_resume: Option<ResumePoint>,

    /// Executing or touched since the collector last scanned it.
    /// Inactive threads are allowed to sleep black through a cycle.
    pub(crate) active: bool,

    /// Nested native -> script calls on this thread; a yield needs zero
    pub(crate) non_yieldable: u32,

    /// Traceback of the last failure raised on this thread
    pub(crate) traceback: Option<String>,
    /// An error is unwinding and its traceback has been captured
    pub(crate) error_pending: bool,

    max_stack: usize,
}

impl ThreadState {
    pub fn new(max_stack: usize) -> Self {
        Self {
            stack: vec![Value::Null; BASIC_STACK_SIZE],
            top: 0,
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            status: CoStatus::Ready,
            resumer: None,
            pending_resume: None,
            active: false,
            non_yieldable: 0,
            traceback: None,
            error_pending: false,
            max_stack,
        }
    }

    #[inline]
    pub fn status(&self) -> CoStatus {
        self.status
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }

    #[inline]
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// Base of the innermost frame; stack index 1 of the host API
    #[inline]
    pub fn frame_base(&self) -> usize {
        self.frames.last().map_or(0, |ci| ci.base)
    }

    #[inline(always)]
    pub fn current_frame(&self) -> Option<&CallInfo> {
        self.frames.last()
    }

    #[inline(always)]
    pub fn current_frame_mut(&mut self) -> Option<&mut CallInfo> {
        self.frames.last_mut()
    }

    /// Make `needed` slots addressable, up to the configured hard cap
    pub fn grow_stack(&mut self, needed: usize) -> VmResult<()> {
        if needed > self.max_stack {
            return Err(VmError::StackOverflow(format!(
                "{} slots requested, limit is {}",
                needed, self.max_stack
            )));
        }
        if self.stack.len() < needed {
            let new_len = needed.max(self.stack.len() * 2).min(self.max_stack);
            self.stack.resize(new_len, Value::Null);
        }
        Ok(())
    }

    /// Room for `n` more values above the top
    #[inline]
    pub fn check_stack(&mut self, n: usize) -> VmResult<()> {
        self.grow_stack(self.top + n + EXTRA_STACK)
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> Value {
        self.stack.get(index).copied().unwrap_or_default()
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: Value) -> VmResult<()> {
        match self.stack.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::runtime(format!(
                "stack slot {} outside the allocated stack",
                index
            ))),
        }
    }

    pub fn push(&mut self, value: Value) -> VmResult<()> {
        if self.top >= self.stack.len() {
            self.grow_stack(self.top + 1 + EXTRA_STACK)?;
        }
        self.stack[self.top] = value;
        self.top += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Value> {
        if self.top <= self.frame_base() {
            return None;
        }
        self.top -= 1;
        Some(std::mem::take(&mut self.stack[self.top]))
    }

    /// Values `[from, top)` copied out
    pub fn values_from(&self, from: usize) -> Vec<Value> {
        if from >= self.top {
            return Vec::new();
        }
        self.stack[from..self.top].to_vec()
    }

    /// Store `values` at `reg`, adjusted to `wanted`; with `MULTRET` all of
    /// them are stored and the top follows
    pub(crate) fn place_values(&mut self, reg: usize, wanted: i32, values: &[Value]) -> VmResult<()> {
        let count = if wanted == MULTRET {
            values.len()
        } else {
            wanted as usize
        };
        self.grow_stack(reg + count + EXTRA_STACK)?;
        for i in 0..count {
            self.stack[reg + i] = values.get(i).copied().unwrap_or_default();
        }
        if wanted == MULTRET {
            self.top = reg + count;
        }
        Ok(())
    }

    /// Highest slot the collector must scan: the top or any frame's register window
    pub fn live_top(&self) -> usize {
        let frames_top = self.frames.iter().map(|ci| ci.top).max().unwrap_or(0);
        self.top.max(frames_top).min(self.stack.len())
    }

    /// Position in `open_upvalues` of the first upvalue at or above `level`
    pub(crate) fn first_open_at(&self, level: usize) -> usize {
        self.open_upvalues.partition_point(|&(idx, _)| idx < level)
    }

    pub(crate) fn find_open_upvalue(&self, level: usize) -> Option<UpvalueId> {
        self.open_upvalues
            .binary_search_by_key(&level, |&(idx, _)| idx)
            .ok()
            .map(|pos| self.open_upvalues[pos].1)
    }

    pub(crate) fn insert_open_upvalue(&mut self, level: usize, id: UpvalueId) {
        let pos = self.first_open_at(level);
        self.open_upvalues.insert(pos, (level, id));
    }

    pub(crate) fn unlink_open_upvalue(&mut self, id: UpvalueId) {
        self.open_upvalues.retain(|&(_, uv)| uv != id);
    }

    /// Drop every frame and value; the caller closes open upvalues first
    pub(crate) fn clear(&mut self) {
        self.stack.truncate(BASIC_STACK_SIZE);
        self.stack.fill(Value::Null);
        self.top = 0;
        self.frames.clear();
        self.pending_resume = None;
        self.resumer = None;
        self.non_yieldable = 0;
        self.error_pending = false;
    }

    /// Null out the dead part of the stack (collector, atomic phase)
    pub(crate) fn clear_dead_stack(&mut self) {
        let live = self.live_top();
        for slot in &mut self.stack[live..] {
            *slot = Value::Null;
        }
    }

    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<ThreadState>()
            + self.stack.capacity() * std::mem::size_of::<Value>()
            + self.frames.capacity() * std::mem::size_of::<CallInfo>()
            + self.open_upvalues.capacity() * std::mem::size_of::<(usize, UpvalueId)>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::ObjectKind;

    fn upvalue(i: u32) -> UpvalueId {
        UpvalueId::from_ref(GcRef::new(i, 0, ObjectKind::Upvalue)).unwrap()
    }

    #[test]
    fn stack_grows_until_cap() {
        let mut th = ThreadState::new(100);
        assert!(th.grow_stack(80).is_ok());
        assert!(th.stack.len() >= 80);
        assert!(matches!(th.grow_stack(101), Err(VmError::StackOverflow(_))));
    }

    #[test]
    fn push_pop() {
        let mut th = ThreadState::new(1000);
        th.push(Value::Number(1.0)).unwrap();
        th.push(Value::Boolean(true)).unwrap();
        assert_eq!(th.top(), 2);
        assert_eq!(th.pop(), Some(Value::Boolean(true)));
        assert_eq!(th.values_from(0), vec![Value::Number(1.0)]);
    }

    #[test]
    fn open_upvalues_stay_ordered() {
        let mut th = ThreadState::new(1000);
        th.insert_open_upvalue(5, upvalue(1));
        th.insert_open_upvalue(2, upvalue(2));
        th.insert_open_upvalue(9, upvalue(3));
        let levels: Vec<usize> = th.open_upvalues.iter().map(|&(l, _)| l).collect();
        assert_eq!(levels, vec![2, 5, 9]);
        assert_eq!(th.find_open_upvalue(5), Some(upvalue(1)));
        assert_eq!(th.find_open_upvalue(4), None);
        assert_eq!(th.first_open_at(3), 1);
        th.unlink_open_upvalue(upvalue(1));
        assert_eq!(th.find_open_upvalue(5), None);
    }

    #[test]
    fn status_names() {
        assert_eq!(CoStatus::Ready.name(), "suspended");
        assert_eq!(CoStatus::Failed.name(), "dead");
        assert!(
            CoStatus::Suspended(YieldPoint {
                reg: 0,
                wanted: 1
            })
            .is_resumable()
        );
        assert!(!CoStatus::Normal.is_resumable());
    }
}
