// Incremental tri-color garbage collector
//
// Cycle: Pause -> Propagate -> PropagateAgain -> Atomic -> Sweep -> Pause
//
// - Pause: between cycles. Leaving it marks the roots gray.
// - Propagate: pop a gray object, blacken it, gray its white children.
// - PropagateAgain: the objects collected on the gray-again list (active
//   threads, tables hit by a backward barrier) are drained once more.
// - Atomic: not interruptible. Re-mark the roots, remark values behind the
//   open upvalues of unmarked threads, drain everything, clear weak tables and
//   flip the current white.
// - Sweep: walk the arena a few slots at a time. Objects still carrying the
//   previous white are freed, survivors get the current white.
//
// Tri-color invariant (Propagate .. Atomic): a black object never points to a
// white one. Mutators keep it through `barrier`, `barrier_back` and
// `thread_barrier`.

mod gc_id;
mod gc_object;
mod object_allocator;
mod string_interner;

pub use gc_id::*;
pub use gc_object::*;
pub use object_allocator::ObjectAllocator;
pub use string_interner::StringInterner;

use crate::value::{FunctionKind, Upvalue, UserdataDtor, Value, WeakMode};
use crate::vm::limits::{GC_SWEEPCOST, GC_SWEEPMAX};
use crate::vm::{CoStatus, GcParams, Resumer};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// GC state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    PropagateAgain,
    Atomic,
    Sweep,
}

impl GcState {
    /// Marking phases: black objects may not point to white ones
    #[inline]
    pub fn keep_invariant(self) -> bool {
        matches!(
            self,
            GcState::Propagate | GcState::PropagateAgain | GcState::Atomic
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GcStats {
    /// Completed cycles
    pub cycles: usize,
    pub full_collections: usize,
    /// Incremental steps taken
    pub steps: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
}

/// Heap pieces the collector works on, borrowed from the global state
pub(crate) struct GcHeap<'a> {
    pub heap: &'a mut ObjectAllocator,
    pub strings: &'a mut StringInterner,
    pub dtors: &'a [Option<UserdataDtor>],
}

/// Garbage Collector
pub struct GC {
    pub(crate) state: GcState,

    /// White given to new objects and to survivors of the current sweep
    pub(crate) current_white: Generation,

    // === Debt and memory tracking ===
    /// Accounted bytes of all live objects
    pub(crate) total_bytes: usize,
    /// A step runs once `total_bytes` reaches this
    pub(crate) threshold: usize,
    /// Live bytes after the last finished cycle
    pub(crate) estimate: usize,

    pub(crate) params: GcParams,

    /// Stopped by the host; only explicit requests collect
    pub(crate) stopped: bool,

    // === Gray lists ===
    pub(crate) gray: Vec<GcRef>,
    pub(crate) grayagain: Vec<GcRef>,

    // === Weak tables met this cycle ===
    weak_keys: Vec<TableId>,
    weak_values: Vec<TableId>,
    all_weak: Vec<TableId>,

    /// Threads that have open upvalues
    pub(crate) twups: Vec<GcRef>,

    /// Interned "__mode"
    pub(crate) tm_mode: Option<StringId>,

    /// Next arena slot to sweep
    sweep_cursor: usize,

    scratch: Vec<Value>,

    pub(crate) stats: GcStats,
}

impl GC {
    pub fn new(params: GcParams) -> Self {
        GC {
            state: GcState::Pause,
            current_white: Generation::A,
            total_bytes: 0,
            threshold: params.step_size * 4,
            estimate: 0,
            params,
            stopped: false,
            gray: Vec::with_capacity(128),
            grayagain: Vec::with_capacity(64),
            weak_keys: Vec::new(),
            weak_values: Vec::new(),
            all_weak: Vec::new(),
            twups: Vec::new(),
            tm_mode: None,
            sweep_cursor: 0,
            scratch: Vec::new(),
            stats: GcStats::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> GcState {
        self.state
    }

    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    #[inline]
    pub fn keep_invariant(&self) -> bool {
        self.state.keep_invariant()
    }

    #[inline]
    pub fn should_step(&self) -> bool {
        !self.stopped && self.total_bytes >= self.threshold
    }

    // ============ Driving ============

    /// One increment: roughly `step_size * step_mul / 100` units of work
    pub(crate) fn step(&mut self, roots: &[Value], ctx: &mut GcHeap<'_>) {
        let budget = (self.params.step_size / 100).saturating_mul(self.params.step_mul as usize);
        let budget = budget.max(1);
        let mut work = 0;
        loop {
            work += self.single_step(roots, ctx);
            if self.state == GcState::Pause {
                self.set_pause();
                break;
            }
            if work >= budget {
                self.threshold = self.total_bytes + self.params.step_size;
                break;
            }
        }
        self.stats.steps += 1;
        log::trace!(
            "gc step: {:?}, {} units, {} bytes live",
            self.state,
            work,
            self.total_bytes
        );
    }

    /// Finish the running cycle, then run a complete new one
    pub(crate) fn full_gc(&mut self, roots: &[Value], ctx: &mut GcHeap<'_>) {
        while self.state != GcState::Pause {
            self.single_step(roots, ctx);
        }
        self.single_step(roots, ctx);
        while self.state != GcState::Pause {
            self.single_step(roots, ctx);
        }
        self.set_pause();
        self.stats.full_collections += 1;
        log::debug!("gc: full collection, {} bytes live", self.total_bytes);
    }

    fn single_step(&mut self, roots: &[Value], ctx: &mut GcHeap<'_>) -> usize {
        match self.state {
            GcState::Pause => {
                self.restart_collection(roots, ctx.heap);
                self.state = GcState::Propagate;
                log::debug!("gc: cycle start, {} bytes live", self.total_bytes);
                1
            }
            GcState::Propagate => {
                if self.gray.is_empty() {
                    self.gray = std::mem::take(&mut self.grayagain);
                    self.state = GcState::PropagateAgain;
                    1
                } else {
                    self.propagate_mark(ctx.heap)
                }
            }
            GcState::PropagateAgain => {
                if self.gray.is_empty() {
                    self.state = GcState::Atomic;
                    1
                } else {
                    self.propagate_mark(ctx.heap)
                }
            }
            GcState::Atomic => {
                let work = self.atomic(roots, ctx.heap);
                self.enter_sweep();
                work
            }
            GcState::Sweep => {
                let (done, work) = self.sweep_step(ctx);
                if done {
                    self.state = GcState::Pause;
                    self.estimate = self.total_bytes;
                    self.stats.cycles += 1;
                    log::debug!("gc: cycle end, {} bytes live", self.total_bytes);
                }
                work
            }
        }
    }

    fn set_pause(&mut self) {
        let goal = (self.estimate / 100).saturating_mul(self.params.pause as usize);
        self.threshold = goal.max(self.total_bytes + self.params.step_size);
    }

    fn restart_collection(&mut self, roots: &[Value], heap: &mut ObjectAllocator) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak_keys.clear();
        self.weak_values.clear();
        self.all_weak.clear();
        for value in roots {
            self.mark_value(heap, *value);
        }
    }

    // ============ Marking ============

    #[inline]
    pub(crate) fn mark_value(&mut self, heap: &mut ObjectAllocator, value: Value) {
        if let Value::Object(r) = value {
            self.mark_object(heap, r);
        }
    }

    /// White -> gray (or straight to black for leaves)
    pub(crate) fn mark_object(&mut self, heap: &mut ObjectAllocator, r: GcRef) {
        if r.kind() == ObjectKind::DeadKey {
            return;
        }
        let Some(entry) = heap.get_mut(r) else {
            return;
        };
        if !entry.header.is_white() {
            return;
        }
        match &entry.object {
            GcObject::String(_) => entry.header.make_black(),
            // open upvalues stay gray: their value lives on a thread stack
            GcObject::Upvalue(Upvalue::Open { .. }) => entry.header.make_gray(),
            GcObject::Upvalue(Upvalue::Closed(v)) => {
                let v = *v;
                entry.header.make_black();
                self.mark_value(heap, v);
            }
            _ => {
                entry.header.make_gray();
                self.gray.push(r);
            }
        }
    }

    fn propagate_mark(&mut self, heap: &mut ObjectAllocator) -> usize {
        match self.gray.pop() {
            Some(r) => self.traverse(heap, r),
            None => 0,
        }
    }

    fn propagate_all(&mut self, heap: &mut ObjectAllocator) -> usize {
        let mut work = 0;
        while let Some(r) = self.gray.pop() {
            work += self.traverse(heap, r);
        }
        work
    }

    /// Blacken one gray object and mark its children. Returns its size.
    fn traverse(&mut self, heap: &mut ObjectAllocator, r: GcRef) -> usize {
        let Some(size) = heap.header(r).map(|h| h.size as usize) else {
            return 0;
        };
        match r.kind() {
            ObjectKind::Table => {
                if let Some(id) = TableId::from_ref(r) {
                    self.traverse_table(heap, id);
                }
                return size;
            }
            ObjectKind::Thread => {
                self.traverse_thread(heap, r);
                return size;
            }
            _ => {}
        }

        let mut children = std::mem::take(&mut self.scratch);
        children.clear();
        match heap.get(r).map(|entry| &entry.object) {
            Some(GcObject::Function(f)) => {
                if let Some(env) = f.env {
                    children.push(env.into());
                }
                match &f.kind {
                    FunctionKind::Native { upvalues, .. } => {
                        children.extend_from_slice(upvalues);
                    }
                    FunctionKind::Script { proto, upvalues } => {
                        children.push((*proto).into());
                        children.extend(upvalues.iter().map(|&uv| Value::from(uv)));
                    }
                }
            }
            Some(GcObject::Prototype(p)) => {
                children.extend_from_slice(&p.constants);
                children.extend(p.protos.iter().map(|&child| Value::from(child)));
                children.extend(p.source.map(Value::from));
                children.extend(p.name.map(Value::from));
            }
            Some(GcObject::Userdata(u)) => {
                children.extend(u.metatable.map(Value::from));
            }
            Some(GcObject::Upvalue(Upvalue::Closed(v))) => children.push(*v),
            _ => {}
        }

        if let Some(header) = heap.header_mut(r) {
            header.make_black();
        }
        for v in children.drain(..) {
            self.mark_value(heap, v);
        }
        self.scratch = children;
        size
    }

    /// Weak mode declared by a metatable's `__mode` field
    fn weak_mode(&self, heap: &ObjectAllocator, mt: Option<TableId>) -> WeakMode {
        let (Some(mt), Some(mode_key)) = (mt, self.tm_mode) else {
            return WeakMode::Strong;
        };
        let Some(mode) = heap
            .table(mt)
            .and_then(|t| t.raw_get(&mode_key.into()).as_string_id())
        else {
            return WeakMode::Strong;
        };
        heap.string(mode)
            .map_or(WeakMode::Strong, |s| WeakMode::from_mode(s.as_bytes()))
    }

    fn traverse_table(&mut self, heap: &mut ObjectAllocator, id: TableId) {
        let Some(table) = heap.table(id) else {
            return;
        };
        let mt = table.metatable;
        let mode = self.weak_mode(heap, mt);

        let mut children = std::mem::take(&mut self.scratch);
        children.clear();
        if let Some(table) = heap.table(id) {
            for node in table.nodes() {
                if node.value.is_null() {
                    continue;
                }
                match mode {
                    WeakMode::Strong => {
                        children.push(node.key);
                        children.push(node.value);
                    }
                    WeakMode::Keys => children.push(node.value),
                    WeakMode::Values => children.push(node.key),
                    WeakMode::Both => {}
                }
            }
        }
        match mode {
            WeakMode::Strong => {}
            WeakMode::Keys => self.weak_keys.push(id),
            WeakMode::Values => self.weak_values.push(id),
            WeakMode::Both => self.all_weak.push(id),
        }

        if let Some(header) = heap.header_mut(id.gc_ref()) {
            header.make_black();
        }
        if let Some(mt) = mt {
            self.mark_object(heap, mt.gc_ref());
        }
        for v in children.drain(..) {
            self.mark_value(heap, v);
        }
        self.scratch = children;
    }

    /// Mark a thread's stack, frames and open upvalues.
    ///
    /// Outside the atomic phase an active thread stays gray on the gray-again
    /// list, since it keeps changing; a sleeping one turns black. In the
    /// atomic phase the thread is blackened and the stack above its live part
    /// is cleared.
    fn traverse_thread(&mut self, heap: &mut ObjectAllocator, r: GcRef) {
        let atomic = self.state == GcState::Atomic;
        let Some(th) = heap.thread_mut(r) else {
            return;
        };
        if atomic {
            th.clear_dead_stack();
            // scanned with everything else stopped: it may sleep next cycle
            if !matches!(th.status, CoStatus::Running | CoStatus::Normal) {
                th.active = false;
            }
        }
        let mut children = std::mem::take(&mut self.scratch);
        children.clear();
        children.extend_from_slice(&th.stack[..th.live_top()]);
        for ci in &th.frames {
            children.push(ci.func.into());
            children.extend_from_slice(&ci.varargs);
        }
        children.extend(th.open_upvalues.iter().map(|&(_, uv)| Value::from(uv)));
        if let Some(Resumer::Thread(resumer)) = th.resumer {
            children.push(resumer.into());
        }
        let active = th.active;

        if let Some(header) = heap.header_mut(r) {
            if active && !atomic {
                header.make_gray();
                self.grayagain.push(r);
            } else {
                header.make_black();
            }
        }
        for v in children.drain(..) {
            self.mark_value(heap, v);
        }
        self.scratch = children;
    }

    /// Unmarked threads are not traversed, yet a marked upvalue may still
    /// alias one of their slots: mark those values. Such threads, and threads
    /// without open upvalues, leave the list.
    fn remark_upvalues(&mut self, heap: &mut ObjectAllocator) {
        let mut values = Vec::new();
        let twups = std::mem::take(&mut self.twups);
        for th_ref in twups {
            let Some(white) = heap.header(th_ref).map(|h| h.is_white()) else {
                continue;
            };
            let Some(th) = heap.thread(th_ref) else {
                continue;
            };
            if th.open_upvalues.is_empty() {
                continue;
            }
            if !white {
                self.twups.push(th_ref);
                continue;
            }
            for &(level, uv) in &th.open_upvalues {
                if heap.header(uv.gc_ref()).is_some_and(|h| !h.is_white()) {
                    values.push(th.get(level));
                }
            }
        }
        for v in values {
            self.mark_value(heap, v);
        }
    }

    fn atomic(&mut self, roots: &[Value], heap: &mut ObjectAllocator) -> usize {
        self.state = GcState::Atomic;
        let mut work = 0;

        for value in roots {
            self.mark_value(heap, *value);
        }
        work += self.propagate_all(heap);

        self.remark_upvalues(heap);
        work += self.propagate_all(heap);

        // threads re-traversed here turn black, so this terminates
        while !self.grayagain.is_empty() {
            self.gray.append(&mut self.grayagain);
            work += self.propagate_all(heap);
        }

        self.clear_weak_tables(heap);

        self.current_white = self.current_white.flip();
        work
    }

    /// Whether a weak entry referring to `v` goes away. Strings are values,
    /// not weak references: they are marked and kept.
    fn is_cleared(&mut self, heap: &mut ObjectAllocator, v: Value) -> bool {
        let Value::Object(r) = v else {
            return false;
        };
        if r.kind() == ObjectKind::String {
            self.mark_object(heap, r);
            return false;
        }
        heap.header(r).is_some_and(|h| h.is_white())
    }

    fn clear_weak_tables(&mut self, heap: &mut ObjectAllocator) {
        let by_keys: Vec<TableId> = self.weak_keys.iter().chain(&self.all_weak).copied().collect();
        let by_values: Vec<TableId> = self
            .weak_values
            .iter()
            .chain(&self.all_weak)
            .copied()
            .collect();

        for (ids, keys) in [(by_keys, true), (by_values, false)] {
            for id in ids {
                let entries: Vec<(usize, Value)> = match heap.table(id) {
                    Some(t) => t
                        .nodes()
                        .iter()
                        .enumerate()
                        .filter(|(_, n)| !n.value.is_null())
                        .map(|(pos, n)| (pos, if keys { n.key } else { n.value }))
                        .collect(),
                    None => continue,
                };
                let mut dead = Vec::new();
                for (pos, v) in entries {
                    if self.is_cleared(heap, v) {
                        dead.push(pos);
                    }
                }
                if let Some(t) = heap.table_mut(id) {
                    for pos in dead {
                        t.kill_node(pos);
                    }
                }
            }
        }
    }

    // ============ Sweeping ============

    fn enter_sweep(&mut self) {
        self.state = GcState::Sweep;
        self.sweep_cursor = 0;
    }

    /// Sweep up to `GC_SWEEPMAX` slots. Returns (finished, work done).
    fn sweep_step(&mut self, ctx: &mut GcHeap<'_>) -> (bool, usize) {
        let end = (self.sweep_cursor + GC_SWEEPMAX).min(ctx.heap.capacity());
        for index in self.sweep_cursor..end {
            let Some(r) = ctx.heap.ref_at(index) else {
                continue;
            };
            let dead = ctx
                .heap
                .header(r)
                .is_some_and(|h| h.is_dead(self.current_white));
            if dead {
                self.free_object(ctx, r);
            } else if let Some(header) = ctx.heap.header_mut(r) {
                header.make_white(self.current_white);
            }
        }
        let work = (end - self.sweep_cursor).max(1) * GC_SWEEPCOST;
        self.sweep_cursor = end;
        (self.sweep_cursor >= ctx.heap.capacity(), work)
    }

    fn free_object(&mut self, ctx: &mut GcHeap<'_>, r: GcRef) {
        match r.kind() {
            ObjectKind::String => {
                if let Some(id) = StringId::from_ref(r) {
                    if let Some(hash) = ctx.heap.string(id).map(|s| s.hash()) {
                        ctx.strings.remove(hash, id);
                    }
                }
            }
            ObjectKind::Userdata => {
                if let Some(ud) = UserdataId::from_ref(r).and_then(|id| ctx.heap.userdata_mut(id)) {
                    ud.destroy(ctx.dtors);
                }
            }
            ObjectKind::Thread => {
                self.close_dead_thread_upvalues(ctx.heap, r);
                self.twups.retain(|&t| t != r);
            }
            ObjectKind::Upvalue => {
                let owner = UpvalueId::from_ref(r).and_then(|id| match ctx.heap.upvalue(id) {
                    Some(Upvalue::Open { thread, .. }) => Some((id, *thread)),
                    _ => None,
                });
                if let Some((id, thread)) = owner {
                    if let Some(th) = ctx.heap.thread_mut(thread) {
                        th.unlink_open_upvalue(id);
                    }
                }
            }
            _ => {}
        }
        if let Some(entry) = ctx.heap.remove(r) {
            let size = entry.header.size as usize;
            self.total_bytes = self.total_bytes.saturating_sub(size);
            self.stats.bytes_freed += size;
            self.stats.objects_freed += 1;
        }
    }

    /// A dying thread may still have open upvalues that survive (held by live
    /// closures): give them their values before the stack goes away.
    fn close_dead_thread_upvalues(&mut self, heap: &mut ObjectAllocator, r: GcRef) {
        let open = match heap.thread_mut(r) {
            Some(th) => std::mem::take(&mut th.open_upvalues)
                .into_iter()
                .map(|(level, uv)| (th.get(level), uv))
                .collect::<Vec<_>>(),
            None => return,
        };
        for (value, uv) in open {
            let alive = heap
                .header(uv.gc_ref())
                .is_some_and(|h| !h.is_dead(self.current_white));
            if alive {
                if let Some(upvalue) = heap.upvalue_mut(uv) {
                    upvalue.close(value);
                }
            }
        }
    }

    // ============ Barriers ============

    /// Forward barrier: black `owner` now references `v`.
    /// While marking, `v` is marked; during sweep the owner is whitened
    /// instead so it does not trigger again.
    pub(crate) fn barrier(&mut self, heap: &mut ObjectAllocator, owner: GcRef, v: Value) {
        let Value::Object(vr) = v else {
            return;
        };
        if !heap.header(owner).is_some_and(|h| h.is_black()) {
            return;
        }
        if !heap.header(vr).is_some_and(|h| h.is_white()) {
            return;
        }
        if self.keep_invariant() {
            self.mark_object(heap, vr);
        } else if let Some(header) = heap.header_mut(owner) {
            header.make_white(self.current_white);
        }
    }

    /// Backward barrier for containers written many times: a black table
    /// that received a white value goes back to gray for re-traversal.
    pub(crate) fn barrier_back(&mut self, heap: &mut ObjectAllocator, owner: GcRef, v: Value) {
        let Value::Object(vr) = v else {
            return;
        };
        if !heap.header(vr).is_some_and(|h| h.is_white()) {
            return;
        }
        let keep = self.keep_invariant();
        let Some(header) = heap.header_mut(owner) else {
            return;
        };
        if !header.is_black() {
            return;
        }
        if keep {
            header.make_gray();
            self.grayagain.push(owner);
        } else {
            header.make_white(self.current_white);
        }
    }

    /// A thread is about to change: wake it up so it is re-scanned
    pub(crate) fn thread_barrier(&mut self, heap: &mut ObjectAllocator, th: GcRef) {
        let keep = self.keep_invariant();
        let Some(entry) = heap.get_mut(th) else {
            return;
        };
        if let GcObject::Thread(state) = &mut entry.object {
            state.active = true;
        }
        if !entry.header.is_black() {
            return;
        }
        if keep {
            entry.header.make_gray();
            self.grayagain.push(th);
        } else {
            entry.header.make_white(self.current_white);
        }
    }
}
