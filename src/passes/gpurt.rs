//! Traversal stack / pipeline state lowering.

use crate::config::LoweringConfig;
use crate::gpurt::lower::TraversalStackManager;
use crate::{LowerError, Module};

/// Lower every `GpuRtOp` in `module`, returning whether any was found.
pub fn lower_gpurt_ops(
    module: &mut Module,
    config: &LoweringConfig,
) -> Result<bool, LowerError> {
    let cx = module.cx();
    let manager = TraversalStackManager::new(module, config)?;

    let mut changed = false;
    for func in module.defined_funcs() {
        let func_decl = &mut module.funcs[func];
        let insts: Vec<_> = func_decl.body().all_data_insts().collect();
        for inst in insts {
            changed |= manager.lower_op(&cx, func_decl, inst);
        }
    }
    Ok(changed)
}
