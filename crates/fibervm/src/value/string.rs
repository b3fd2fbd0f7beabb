/// Immutable interned byte string
pub struct ObjString {
    data: Box<[u8]>,
    hash: u64,
    /// Host-assigned atom id, -1 when unassigned
    pub(crate) atom: i16,
}

impl ObjString {
    pub fn new(data: Box<[u8]>, hash: u64) -> Self {
        Self {
            data,
            hash,
            atom: -1,
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Contents as UTF-8, if they are valid UTF-8
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Lossy text form, for messages and tracebacks
    pub fn to_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline(always)]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    #[inline(always)]
    pub fn atom(&self) -> i16 {
        self.atom
    }
}
