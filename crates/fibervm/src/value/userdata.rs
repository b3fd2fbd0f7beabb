use std::any::Any;

use crate::gc::TableId;

/// Destructor invoked just before a user data object is freed
pub type UserdataDtor = fn(&mut dyn Any);

/// Number of tags that can carry a registered destructor
pub const UTAG_LIMIT: u8 = 128;

/// Reserved tag: the destructor travels with the payload instead of being
/// looked up in the per-tag table
pub const UTAG_IDTOR: u8 = u8::MAX;

/// Host payload with an optional metatable
pub struct Userdata {
    pub(crate) tag: u8,
    pub(crate) data: Box<dyn Any>,
    pub(crate) metatable: Option<TableId>,
    pub(crate) inline_dtor: Option<UserdataDtor>,
}

impl Userdata {
    pub fn new(tag: u8, data: Box<dyn Any>) -> Self {
        Self {
            tag,
            data,
            metatable: None,
            inline_dtor: None,
        }
    }

    pub fn with_dtor(data: Box<dyn Any>, dtor: UserdataDtor) -> Self {
        Self {
            tag: UTAG_IDTOR,
            data,
            metatable: None,
            inline_dtor: Some(dtor),
        }
    }

    #[inline]
    pub fn tag(&self) -> u8 {
        self.tag
    }

    #[inline]
    pub fn metatable(&self) -> Option<TableId> {
        self.metatable
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut::<T>()
    }

    /// Run the destructor: the inline one for `UTAG_IDTOR`, otherwise the one
    /// registered for the tag (if any).
    pub(crate) fn destroy(&mut self, registered: &[Option<UserdataDtor>]) {
        let dtor = if self.tag == UTAG_IDTOR {
            self.inline_dtor.take()
        } else {
            registered.get(self.tag as usize).copied().flatten()
        };
        if let Some(dtor) = dtor {
            dtor(self.data.as_mut());
        }
    }

    pub fn byte_size(&self) -> usize {
        std::mem::size_of_val(self.data.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static DESTROYED: Cell<u32> = const { Cell::new(0) };
    }

    fn count(_: &mut dyn Any) {
        DESTROYED.with(|d| d.set(d.get() + 1));
    }

    #[test]
    fn inline_destructor_runs_once() {
        let mut ud = Userdata::with_dtor(Box::new(5u32), count);
        assert_eq!(ud.tag(), UTAG_IDTOR);
        let before = DESTROYED.with(Cell::get);
        ud.destroy(&[]);
        ud.destroy(&[]);
        assert_eq!(DESTROYED.with(Cell::get), before + 1);
    }

    #[test]
    fn tag_destructor_lookup() {
        let mut table = vec![None; UTAG_LIMIT as usize];
        table[3] = Some(count as UserdataDtor);
        let mut ud = Userdata::new(3, Box::new("payload"));
        let before = DESTROYED.with(Cell::get);
        ud.destroy(&table);
        assert_eq!(DESTROYED.with(Cell::get), before + 1);
        assert_eq!(ud.downcast_ref::<&str>(), Some(&"payload"));
    }
}
