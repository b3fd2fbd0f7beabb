pub mod test_bytecode;
pub mod test_interpreter;
pub mod test_threads;

use crate::bytecode::BytecodeBuilder;
use crate::stdlib::open_base;
use crate::value::Value;
use crate::vm::limits::MULTRET;
use crate::vm::{GlobalState, SafeOption, VmResult};

/// Fresh state with the base library open
pub(crate) fn new_state() -> GlobalState {
    let mut g = GlobalState::new(SafeOption::default());
    open_base(&mut g).unwrap();
    g
}

/// Load and call the chunk `b` builds on the main thread, returning its results
pub(crate) fn run(g: &mut GlobalState, b: BytecodeBuilder) -> VmResult<Vec<Value>> {
    let bytes = b.finalize();
    let mut s = g.main();
    let base = s.get_top();
    s.load(&bytes, "test")?;
    s.call(0, MULTRET)?;
    let n = s.get_top() - base;
    let results = (1..=n)
        .map(|i| s.value((base + i) as i32))
        .collect::<VmResult<Vec<_>>>()?;
    s.set_top(base as i32)?;
    Ok(results)
}

/// Text of a string value
pub(crate) fn text(g: &GlobalState, v: &Value) -> String {
    g.value_str(v).unwrap_or_default().to_string()
}
