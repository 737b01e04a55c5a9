//! Module-level continuation lowering passes.

use crate::config::LoweringConfig;
use crate::cont::{early, frame};
use crate::{LowerError, Module};

/// Fold all pipeline-state queries and rewrite enqueue/complete helpers
/// (see `cont::early::early_driver_transform`).
pub fn early_driver_transform(
    module: &mut Module,
    config: &LoweringConfig,
) -> Result<bool, LowerError> {
    let changed = early::early_driver_transform(module, config)?;
    log::debug!("early driver transform: changed = {changed}");
    Ok(changed)
}

pub fn forward_frame_stores(module: &mut Module) -> bool {
    let changed = frame::forward_frame_stores_in_module(module);
    log::debug!("continuation frame store forwarding: changed = {changed}");
    changed
}

/// Drop declarations of abstract operations and DXIL ops left without callers.
pub fn remove_unused_intrinsic_decls(module: &mut Module) -> bool {
    early::remove_unused_func_decls(module, true)
}
