//! Remapping of abstract ray-tracing operations onto the runtime library.

use crate::rt::remap::{remap_rt_op, RtImports};
use crate::runtime::RuntimeLibrary;
use crate::{LowerError, Module};

/// Replace every `RtOp` in `module` with a call to its runtime library
/// implementation (declared in `module` as needed).
pub fn remap_rt_ops(module: &mut Module, runtime: &RuntimeLibrary) -> Result<bool, LowerError> {
    let cx = module.cx();
    let imports = RtImports::import_for_module(module, runtime)?;

    let mut changed = false;
    for func in module.defined_funcs() {
        let func_decl = &mut module.funcs[func];
        let insts: Vec<_> = func_decl.body().all_data_insts().collect();
        for inst in insts {
            if let Some(call) = remap_rt_op(&cx, func_decl, inst, &imports)? {
                log::trace!("`{}`: remapped {inst:?} to {call:?}", &cx[func_decl.name]);
                changed = true;
            }
        }
    }
    Ok(changed)
}
