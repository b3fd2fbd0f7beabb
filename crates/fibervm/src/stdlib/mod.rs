// Standard library registration

mod base;

pub use base::{create_base_lib, open_base};

use crate::value::NativeFn;
use crate::vm::{GlobalState, VmResult};

/// A named group of native functions installed together
pub struct LibraryModule {
    pub name: &'static str,
    pub entries: Vec<(&'static str, NativeFn)>,
}

impl LibraryModule {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    pub fn with_function(mut self, name: &'static str, func: NativeFn) -> Self {
        self.entries.push((name, func));
        self
    }

    /// Install every entry as a global
    pub fn install(&self, g: &mut GlobalState) -> VmResult<()> {
        for &(name, func) in &self.entries {
            g.register(name, func)?;
        }
        log::debug!("opened library '{}' ({} functions)", self.name, self.entries.len());
        Ok(())
    }
}
