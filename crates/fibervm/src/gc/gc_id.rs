// ============ Object Handles ============
// Every heap object is addressed by an arena index plus the version of the
// slot at allocation time. Freeing a slot bumps its version, so a handle that
// outlives its object resolves to nothing instead of aliasing a newer object.

use crate::value::Value;

/// Object type tags, as stored in handles and object headers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    String = 0,
    Table = 1,
    Function = 2,
    Userdata = 3,
    Thread = 4,
    Prototype = 5,
    Upvalue = 6,
    /// Key of an erased table node; never dereferenced, only compared by identity
    DeadKey = 7,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::String => "string",
            ObjectKind::Table => "table",
            ObjectKind::Function => "function",
            ObjectKind::Userdata => "userdata",
            ObjectKind::Thread => "thread",
            ObjectKind::Prototype => "proto",
            ObjectKind::Upvalue => "upvalue",
            ObjectKind::DeadKey => "deadkey",
        }
    }
}

/// Generation-checked reference to an arena slot
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GcRef {
    pub(crate) index: u32,
    pub(crate) version: u32,
    pub(crate) kind: ObjectKind,
}

impl GcRef {
    #[inline(always)]
    pub(crate) const fn new(index: u32, version: u32, kind: ObjectKind) -> Self {
        Self {
            index,
            version,
            kind,
        }
    }

    #[inline(always)]
    pub fn kind(self) -> ObjectKind {
        self.kind
    }

    #[inline(always)]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Same slot and same version, regardless of the kind tag.
    /// A dead key still identifies the object it was erased for.
    #[inline(always)]
    pub fn same_object(self, other: GcRef) -> bool {
        self.index == other.index && self.version == other.version
    }

    #[inline(always)]
    pub(crate) fn as_dead_key(self) -> GcRef {
        GcRef {
            kind: ObjectKind::DeadKey,
            ..self
        }
    }
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident => $kind:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        #[repr(transparent)]
        pub struct $name(pub(crate) GcRef);

        impl $name {
            #[inline(always)]
            pub fn gc_ref(self) -> GcRef {
                self.0
            }

            /// Reinterpret a handle; `None` unless it carries the matching kind tag.
            #[inline(always)]
            pub fn from_ref(r: GcRef) -> Option<Self> {
                (r.kind == ObjectKind::$kind).then_some(Self(r))
            }
        }

        impl From<$name> for Value {
            #[inline(always)]
            fn from(id: $name) -> Value {
                Value::Object(id.0)
            }
        }
    };
}

typed_id!(
    /// Interned string
    StringId => String
);
typed_id!(TableId => Table);
typed_id!(
    /// Native or script closure
    FunctionId => Function
);
typed_id!(UserdataId => Userdata);
typed_id!(ProtoId => Prototype);
typed_id!(UpvalueId => Upvalue);

/// Thread handle. Unlike the other handles it remembers which global state
/// created it, so cross-state stack exchange can be refused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId {
    pub(crate) gc: GcRef,
    pub(crate) owner: u32,
}

impl ThreadId {
    #[inline(always)]
    pub fn gc_ref(self) -> GcRef {
        self.gc
    }

    #[inline(always)]
    pub fn owner(self) -> u32 {
        self.owner
    }
}

impl From<ThreadId> for Value {
    #[inline(always)]
    fn from(id: ThreadId) -> Value {
        Value::Object(id.gc)
    }
}
