/// Errors raised by the VM, the loader and the host API.
///
/// Type errors and runtime errors can be caught by a handler (`pcall`, a
/// protected `Resume`); allocation and internal invariant failures cannot.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// Generic runtime error with a message
    Runtime(String),
    /// Bad argument to a native function (1-based position)
    BadArgument { position: usize, message: String },
    /// Wrong number of arguments
    Arity { expected: usize, got: usize },
    /// Ordering of incomparable values
    Order {
        left: &'static str,
        right: &'static str,
    },
    /// Arithmetic on a non-number
    Arith {
        op: &'static str,
        operand: &'static str,
    },
    /// Indexing a value that is not indexable
    Index { target: &'static str },
    /// Calling a value that is not callable
    Call { target: &'static str },
    /// Stack or sequence index outside the valid range
    IndexOutOfRange { index: i64, len: usize },
    /// Strict table lookup of an absent key
    KeyNotFound(String),
    /// Key that cannot be stored in a table
    InvalidKey(&'static str),
    StackOverflow(String),
    /// Two threads from different global states were mixed
    CrossState,
    /// A handle no longer resolves to a live object
    DeadObject,
    OutOfMemory,
    /// Chunk carrying a compile error instead of code
    Compile(String),
    /// Chunk bytes that do not decode
    Malformed(String),
}

pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    /// Whether a handler may intercept this error
    pub fn is_catchable(&self) -> bool {
        !matches!(
            self,
            VmError::OutOfMemory | VmError::DeadObject | VmError::CrossState
        )
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        VmError::Runtime(msg.into())
    }

    pub fn bad_argument(position: usize, msg: impl Into<String>) -> Self {
        VmError::BadArgument {
            position,
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::Runtime(msg) => write!(f, "{}", msg),
            VmError::BadArgument { position, message } => {
                write!(f, "bad argument #{} ({})", position, message)
            }
            VmError::Arity { expected, got } => {
                write!(f, "wrong number of arguments (expected {}, got {})", expected, got)
            }
            VmError::Order { left, right } => {
                if left == right {
                    write!(f, "attempt to compare two {} values", left)
                } else {
                    write!(f, "attempt to compare {} with {}", left, right)
                }
            }
            VmError::Arith { op, operand } => {
                write!(f, "attempt to perform {} on a {} value", op, operand)
            }
            VmError::Index { target } => write!(f, "attempt to index a {} value", target),
            VmError::Call { target } => write!(f, "attempt to call a {} value", target),
            VmError::IndexOutOfRange { index, len } => {
                write!(f, "index {} out of range (size {})", index, len)
            }
            VmError::KeyNotFound(key) => write!(f, "key not found: {}", key),
            VmError::InvalidKey(msg) => write!(f, "{}", msg),
            VmError::StackOverflow(msg) => write!(f, "stack overflow ({})", msg),
            VmError::CrossState => write!(f, "threads belong to different global states"),
            VmError::DeadObject => write!(f, "reference to a collected object"),
            VmError::OutOfMemory => write!(f, "not enough memory"),
            VmError::Compile(msg) => write!(f, "{}", msg),
            VmError::Malformed(msg) => write!(f, "malformed chunk: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}
