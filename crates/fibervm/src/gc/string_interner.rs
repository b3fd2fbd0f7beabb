use ahash::RandomState;
use std::collections::HashMap;

use crate::gc::{Generation, ObjectAllocator, StringId};

/// String interner - every string object of a global state is interned
/// - Same content always returns the same StringId
/// - Lookups go through a content hash bucket, then a byte comparison
/// - The collector unlinks a string here before freeing its slot
pub struct StringInterner {
    // content hash -> strings sharing it
    map: HashMap<u64, Vec<StringId>, RandomState>,

    hashbuilder: RandomState,
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            map: HashMap::with_capacity_and_hasher(256, RandomState::new()),
            // fixed seeds keep string hashes stable across states
            hashbuilder: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }

    #[inline(always)]
    pub fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        self.hashbuilder.hash_one(bytes)
    }

    /// Find an existing string with this content.
    ///
    /// A hit on a string the running sweep has condemned (it still carries the
    /// previous white) is recolored to the current white: the caller is about to
    /// hold a new reference to it, so it must not be freed.
    pub fn lookup(
        &self,
        heap: &mut ObjectAllocator,
        current: Generation,
        hash: u64,
        bytes: &[u8],
    ) -> Option<StringId> {
        let ids = self.map.get(&hash)?;
        let found = ids.iter().copied().find(|&id| {
            heap.string(id)
                .is_some_and(|s| s.len() == bytes.len() && s.as_bytes() == bytes)
        })?;
        if let Some(header) = heap.header_mut(found.0) {
            if header.is_dead(current) {
                header.make_white(current);
            }
        }
        Some(found)
    }

    pub fn insert(&mut self, hash: u64, id: StringId) {
        self.map.entry(hash).or_default().push(id);
    }

    /// Unlink a string that is about to be freed
    pub fn remove(&mut self, hash: u64, id: StringId) {
        if let Some(ids) = self.map.get_mut(&hash) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.map.remove(&hash);
            }
        }
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{GcHeader, GcObject};
    use crate::value::ObjString;

    fn add(interner: &mut StringInterner, heap: &mut ObjectAllocator, s: &str) -> StringId {
        let hash = interner.hash_bytes(s.as_bytes());
        let r = heap.insert(
            GcHeader::with_white(Generation::A, s.len()),
            GcObject::String(ObjString::new(s.as_bytes().into(), hash)),
        );
        let id = StringId::from_ref(r).unwrap();
        interner.insert(hash, id);
        id
    }

    #[test]
    fn lookup_finds_same_content() {
        let mut interner = StringInterner::new();
        let mut heap = ObjectAllocator::new();
        let id = add(&mut interner, &mut heap, "hello");
        let hash = interner.hash_bytes(b"hello");
        assert_eq!(
            interner.lookup(&mut heap, Generation::A, hash, b"hello"),
            Some(id)
        );
        let other = interner.hash_bytes(b"world");
        assert_eq!(interner.lookup(&mut heap, Generation::A, other, b"world"), None);
    }

    #[test]
    fn lookup_resurrects_condemned_string() {
        let mut interner = StringInterner::new();
        let mut heap = ObjectAllocator::new();
        let id = add(&mut interner, &mut heap, "ghost");
        let hash = interner.hash_bytes(b"ghost");
        // created with white A; after a flip to B it is condemned
        assert!(heap.header(id.0).unwrap().is_dead(Generation::B));
        interner.lookup(&mut heap, Generation::B, hash, b"ghost");
        assert!(!heap.header(id.0).unwrap().is_dead(Generation::B));
    }

    #[test]
    fn remove_unlinks() {
        let mut interner = StringInterner::new();
        let mut heap = ObjectAllocator::new();
        let id = add(&mut interner, &mut heap, "x");
        let hash = interner.hash_bytes(b"x");
        interner.remove(hash, id);
        assert!(interner.is_empty());
        assert_eq!(interner.lookup(&mut heap, Generation::A, hash, b"x"), None);
    }
}
