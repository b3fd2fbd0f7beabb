// ============ GC Header ============

use std::rc::Rc;

use crate::gc::ObjectKind;
use crate::value::{Function, ObjString, Prototype, Table, Upvalue, Userdata};
use crate::vm::ThreadState;

/// Which of the two whites an object carries.
///
/// The collector flips its current generation in the atomic phase. From then
/// until the end of sweep, objects still tagged with the previous generation
/// were not reached and are freed; everything allocated or recolored after the
/// flip carries the new generation and survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    A,
    B,
}

impl Generation {
    #[inline(always)]
    pub fn flip(self) -> Generation {
        match self {
            Generation::A => Generation::B,
            Generation::B => Generation::A,
        }
    }
}

/// Tri-color mark state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White(Generation),
    Gray,
    Black,
}

/// GC object header - embedded in every arena entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcHeader {
    pub color: Color,
    /// Fixed objects (registry, metamethod names) are never collected
    pub fixed: bool,
    /// Accounted size in bytes
    pub size: u32,
}

impl GcHeader {
    #[inline(always)]
    pub fn with_white(current: Generation, size: usize) -> Self {
        GcHeader {
            color: Color::White(current),
            fixed: false,
            size: size.min(u32::MAX as usize) as u32,
        }
    }

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        matches!(self.color, Color::White(_))
    }

    #[inline(always)]
    pub fn is_gray(&self) -> bool {
        self.color == Color::Gray
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        self.color == Color::Black
    }

    /// Dead: still carries the white of a finished marking phase.
    /// Only meaningful between the atomic flip and the end of sweep.
    #[inline(always)]
    pub fn is_dead(&self, current: Generation) -> bool {
        !self.fixed && self.color == Color::White(current.flip())
    }

    #[inline(always)]
    pub fn make_white(&mut self, current: Generation) {
        self.color = Color::White(current);
    }

    #[inline(always)]
    pub fn make_gray(&mut self) {
        self.color = Color::Gray;
    }

    #[inline(always)]
    pub fn make_black(&mut self) {
        self.color = Color::Black;
    }
}

/// Closed set of heap object kinds
pub enum GcObject {
    String(ObjString),
    Table(Table),
    Function(Function),
    Userdata(Userdata),
    Thread(Box<ThreadState>),
    Prototype(Rc<Prototype>),
    Upvalue(Upvalue),
}

impl GcObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            GcObject::String(_) => ObjectKind::String,
            GcObject::Table(_) => ObjectKind::Table,
            GcObject::Function(_) => ObjectKind::Function,
            GcObject::Userdata(_) => ObjectKind::Userdata,
            GcObject::Thread(_) => ObjectKind::Thread,
            GcObject::Prototype(_) => ObjectKind::Prototype,
            GcObject::Upvalue(_) => ObjectKind::Upvalue,
        }
    }

    /// Bytes charged to the collector's debt for this object
    pub fn byte_size(&self) -> usize {
        let payload = match self {
            GcObject::String(s) => s.len(),
            GcObject::Table(t) => t.byte_size(),
            GcObject::Function(f) => f.byte_size(),
            GcObject::Userdata(u) => u.byte_size(),
            GcObject::Thread(t) => t.byte_size(),
            GcObject::Prototype(p) => p.byte_size(),
            GcObject::Upvalue(_) => 0,
        };
        std::mem::size_of::<GcBox>() + payload
    }
}

/// One occupied arena entry
pub struct GcBox {
    pub header: GcHeader,
    pub object: GcObject,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_means_previous_white() {
        let mut header = GcHeader::with_white(Generation::A, 16);
        assert!(header.is_white());
        assert!(!header.is_dead(Generation::A));
        // after the atomic flip, A is the other white
        assert!(header.is_dead(Generation::B));
        header.make_white(Generation::B);
        assert!(!header.is_dead(Generation::B));
        header.fixed = true;
        header.make_white(Generation::A);
        assert!(!header.is_dead(Generation::B));
    }

    #[test]
    fn colors() {
        let mut header = GcHeader::with_white(Generation::B, 0);
        header.make_gray();
        assert!(header.is_gray() && !header.is_white());
        header.make_black();
        assert!(header.is_black());
    }
}
