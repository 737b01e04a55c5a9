//! Driver-level cleanups run before continuation lowering proper.

use crate::builder::{FuncBuilder, InsertPoint};
use crate::config::LoweringConfig;
use crate::cont::StackPointerMode;
use crate::print::type_to_string;
use crate::{
    Const, Context, DataInstKind, DeclDef, Func, FuncDecl, InternedStr, LowerError, Module,
    TypeKind, Value,
};
use smallvec::SmallVec;

/// Name prefixes of the pipeline-state queries `early_driver_transform` folds.
const STACK_IS_GLOBAL_PREFIX: &str = "_AmdContinuationStackIsGlobal";
const GET_FLAGS_PREFIX: &str = "_AmdContinuationsGetFlags";
const GET_RTIP_PREFIX: &str = "_AmdGetRtip";
const GET_UNINITIALIZED_PREFIX: &str = "_AmdGetUninitialized";

/// Continuation intrinsics replacing the runtime library's enqueue and
/// complete helpers. All of them are variadic (declared without parameters).
pub const CONTINUE: &str = "continuation.continue";
pub const WAIT_CONTINUE: &str = "continuation.waitContinue";
pub const COMPLETE: &str = "continuation.complete";

/// How calls to an enqueue/complete helper are rewritten.
#[derive(Copy, Clone)]
struct EnqueueRewrite {
    helper: Func,
    helper_name: InternedStr,
    intrinsic: Func,
    /// Argument index at which the caller's address is inserted (for
    /// `EnqueueCall`, used when traversal calls an any-hit or intersection
    /// shader, which then returns to it).
    return_addr_idx: Option<usize>,
}

/// The continuation intrinsic replacing a helper named `name`, and where
/// to insert the return address, if needed.
fn enqueue_intrinsic_for(name: &str) -> Option<(&'static str, Option<usize>)> {
    let has_wait_mask = name.contains("WaitEnqueue");
    let intrinsic = if has_wait_mask {
        WAIT_CONTINUE
    } else if name.contains("Enqueue") {
        CONTINUE
    } else if name.contains("Complete") {
        return Some((COMPLETE, None));
    } else {
        return None;
    };
    // The wait mask precedes the return address.
    let return_addr_idx = name
        .contains("EnqueueCall")
        .then_some(if has_wait_mask { 3 } else { 2 });
    Some((intrinsic, return_addr_idx))
}

fn expect_query_sig(cx: &Context, func_decl: &FuncDecl, width: u32) -> Result<(), LowerError> {
    if !func_decl.params.is_empty() || cx[func_decl.ret_type] != (TypeKind::Int { width }) {
        return Err(LowerError::RuntimeFuncSignature {
            name: cx[func_decl.name].to_string(),
            reason: format!(
                "expected `() -> i{width}`, found `-> {}` with {} parameter(s)",
                type_to_string(cx, func_decl.ret_type),
                func_decl.params.len()
            ),
        });
    }
    Ok(())
}

/// The constant replacing every call to `func_decl`, if it's one of the
/// pipeline-state queries (matched by name prefix).
fn fold_query(
    cx: &Context,
    config: &LoweringConfig,
    func_decl: &FuncDecl,
) -> Result<Option<Const>, LowerError> {
    let name = &cx[func_decl.name];
    let ct = if name.starts_with(STACK_IS_GLOBAL_PREFIX) {
        expect_query_sig(cx, func_decl, 1)?;
        cx.const_bool(config.stack_mode_or_default() == StackPointerMode::Global)
    } else if name.starts_with(GET_FLAGS_PREFIX) {
        expect_query_sig(cx, func_decl, 32)?;
        cx.const_u32(config.flags()?)
    } else if name.starts_with(GET_RTIP_PREFIX) {
        expect_query_sig(cx, func_decl, 32)?;
        cx.const_u32(config.rtip()?)
    } else if name.starts_with(GET_UNINITIALIZED_PREFIX) {
        cx.const_poison(func_decl.ret_type)
    } else {
        return Ok(None);
    };
    Ok(Some(ct))
}

/// Rewrite the runtime library's driver-facing helpers, returning whether
/// anything changed:
/// - calls to pipeline-state queries (whether the continuation stack is
///   global, the continuation flags, the RTIP version, and "uninitialized"
///   values) are replaced with constants
/// - calls to `*WaitEnqueue*`, `*Enqueue*` and `*Complete*` helpers become
///   calls to the `continuation.{waitContinue,continue,complete}` intrinsics
///
/// Declarations of the replaced functions are removed, all other
/// declarations are kept.
///
/// Fails if a query needs a configuration value that was never provided.
pub fn early_driver_transform(
    module: &mut Module,
    config: &LoweringConfig,
) -> Result<bool, LowerError> {
    let cx = module.cx();

    let mut folded: SmallVec<[(Func, Const); 4]> = SmallVec::new();
    let mut enqueue_helpers = SmallVec::<[_; 4]>::new();
    for (func, func_decl) in module.funcs.iter() {
        let name = &cx[func_decl.name];
        if let Some(ct) = fold_query(&cx, config, func_decl)? {
            log::debug!("folding calls to `{name}`");
            folded.push((func, ct));
        } else if let Some((intrinsic, return_addr_idx)) = enqueue_intrinsic_for(name) {
            if cx[func_decl.ret_type] != TypeKind::Void {
                return Err(LowerError::RuntimeFuncSignature {
                    name: name.to_string(),
                    reason: format!(
                        "expected no return value, found `{}`",
                        type_to_string(&cx, func_decl.ret_type)
                    ),
                });
            }
            log::debug!("replacing calls to `{name}` with `{intrinsic}`");
            enqueue_helpers.push((func, func_decl.name, intrinsic, return_addr_idx));
        }
    }
    if folded.is_empty() && enqueue_helpers.is_empty() {
        return Ok(false);
    }

    let rewrites: SmallVec<[EnqueueRewrite; 4]> = enqueue_helpers
        .into_iter()
        .map(|(helper, helper_name, intrinsic, return_addr_idx)| EnqueueRewrite {
            helper,
            helper_name,
            intrinsic: module.get_or_declare_func(intrinsic, cx.void_type(), []),
            return_addr_idx,
        })
        .collect();

    for func in module.defined_funcs() {
        let func_decl = &mut module.funcs[func];
        let body = func_decl.body();
        let calls: SmallVec<[_; 8]> = body
            .all_data_insts()
            .filter_map(|inst| match body.data_insts[inst].kind {
                DataInstKind::FuncCall(callee) => Some((inst, callee)),
                _ => None,
            })
            .collect();

        for (inst, callee) in calls {
            if let Some(&(_, ct)) = folded.iter().find(|&&(f, _)| f == callee) {
                let body = func_decl.body_mut();
                if body.data_insts[inst].output_type.is_some() {
                    body.replace_all_uses_with(Value::DataInstOutput(inst), Value::Const(ct));
                }
                body.erase_data_inst(inst);
            } else if let Some(rewrite) = rewrites.iter().find(|r| r.helper == callee) {
                let mut args = func_decl.body().data_insts[inst].inputs.clone();
                if let Some(idx) = rewrite.return_addr_idx {
                    if idx > args.len() {
                        return Err(LowerError::RuntimeFuncSignature {
                            name: cx[rewrite.helper_name].to_string(),
                            reason: format!(
                                "expected at least {idx} arguments before the return address, \
                                 found {}",
                                args.len()
                            ),
                        });
                    }
                    let return_addr = cx.const_func_addr(cx.int_type(64), func);
                    args.insert(idx, Value::Const(return_addr));
                }
                FuncBuilder::new(&cx, func_decl, InsertPoint::Before(inst)).call(
                    rewrite.intrinsic,
                    cx.void_type(),
                    args,
                );
                func_decl.body_mut().erase_data_inst(inst);
            }
        }
    }

    let replaced = folded.iter().map(|&(func, _)| func).chain(rewrites.iter().map(|r| r.helper));
    for func in replaced.collect::<SmallVec<[_; 8]>>() {
        if matches!(module.funcs[func].def, DeclDef::Imported) {
            log::trace!("removing replaced declaration `{}`", &cx[module.funcs[func].name]);
            module.funcs.remove(func);
        }
    }
    Ok(true)
}

/// Remove all function declarations (imports) that are never called.
///
/// With `only_intrinsics`, only ray-tracing dialect (`lgc.rt*`) and DXIL
/// (`dx.op.*`) declarations are considered.
pub fn remove_unused_func_decls(module: &mut Module, only_intrinsics: bool) -> bool {
    let cx = module.cx();

    let mut called = crate::FxIndexSet::default();
    for (_, func_decl) in module.funcs.iter() {
        let Some(body) = func_decl.def.as_present() else {
            continue;
        };
        for (_, inst_def) in body.data_insts.iter() {
            if let DataInstKind::FuncCall(callee) = inst_def.kind {
                called.insert(callee);
            }
        }
    }

    let unused: SmallVec<[Func; 8]> = module
        .funcs
        .iter()
        .filter(|&(func, func_decl)| {
            let name = &cx[func_decl.name];
            matches!(func_decl.def, DeclDef::Imported)
                && !called.contains(&func)
                && (!only_intrinsics || name.starts_with("lgc.rt") || name.starts_with("dx.op."))
        })
        .map(|(func, _)| func)
        .collect();

    for &func in &unused {
        log::trace!("removing unused declaration `{}`", &cx[module.funcs[func].name]);
        module.funcs.remove(func);
    }
    !unused.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControlInstKind, FuncDefBody, FuncParam};
    use std::rc::Rc;

    fn define_shader(module: &mut Module, calls: &[(Func, Vec<Value>)]) -> Func {
        let cx = module.cx();
        let mut func_decl = FuncDecl {
            name: cx.intern("shader"),
            ret_type: cx.void_type(),
            params: [].into_iter().collect(),
            shader_stage: None,
            def: DeclDef::Present(FuncDefBody::new(&cx)),
        };
        let entry = func_decl.body().entry_block();
        let mut outputs = vec![];
        {
            let mut b = FuncBuilder::new(&cx, &mut func_decl, InsertPoint::BlockEnd(entry));
            for (callee, args) in calls {
                let ret_type = module.funcs[*callee].ret_type;
                let call = b.call(*callee, ret_type, args.iter().copied());
                if cx[ret_type] != TypeKind::Void {
                    outputs.push(Value::DataInstOutput(call));
                }
            }
            b.terminate(entry, ControlInstKind::Return, outputs, []);
        }
        module.funcs.define(&cx, func_decl)
    }

    fn call_args(module: &Module, func: Func) -> Vec<(String, Vec<Value>)> {
        let cx = module.cx_ref();
        let body = module.funcs[func].body();
        body.all_data_insts()
            .filter_map(|inst| match body.data_insts[inst].kind {
                DataInstKind::FuncCall(callee) => Some((
                    cx[module.funcs[callee].name].to_string(),
                    body.data_insts[inst].inputs.to_vec(),
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn queries_are_folded() {
        let cx = Rc::new(Context::new());
        let mut module = Module::new(cx.clone());
        let is_global =
            module.get_or_declare_func("_AmdContinuationStackIsGlobal.v1", cx.int_type(1), []);
        let rtip = module.get_or_declare_func("_AmdGetRtip", cx.int_type(32), []);
        let uninit = module.get_or_declare_func("_AmdGetUninitializedI32", cx.int_type(32), []);
        let shader =
            define_shader(&mut module, &[(is_global, vec![]), (rtip, vec![]), (uninit, vec![])]);

        let config = LoweringConfig {
            stack_mode: Some(StackPointerMode::Global),
            rtip: Some(20),
            ..LoweringConfig::default()
        };
        assert_eq!(early_driver_transform(&mut module, &config), Ok(true));

        let body = module.funcs[shader].body();
        let entry = body.entry_block();
        assert!(body.blocks[entry].insts.is_empty());
        assert_eq!(
            body.blocks[entry].terminator.inputs[..],
            [
                Value::Const(cx.const_bool(true)),
                Value::Const(cx.const_u32(20)),
                Value::Const(cx.const_poison(cx.int_type(32))),
            ]
        );

        // The folded declarations are gone.
        assert_eq!(module.funcs.len(), 1);
        assert_eq!(early_driver_transform(&mut module, &config), Ok(false));
    }

    #[test]
    fn unrelated_decls_survive() {
        let cx = Rc::new(Context::new());
        let mut module = Module::new(cx.clone());
        let rtip = module.get_or_declare_func("_AmdGetRtip", cx.int_type(32), []);
        module.get_or_declare_func("_cont_TraceRay", cx.void_type(), []);
        module.get_or_declare_func(
            "continuation.getContinuationStackOffset",
            cx.ptr_type(crate::AddrSpace::Flat),
            [],
        );
        define_shader(&mut module, &[(rtip, vec![])]);

        let config = LoweringConfig {
            rtip: Some(20),
            ..LoweringConfig::default()
        };
        assert_eq!(early_driver_transform(&mut module, &config), Ok(true));
        assert!(module.lookup_func("_AmdGetRtip").is_none());
        assert!(module.lookup_func("_cont_TraceRay").is_some());
        assert!(module.lookup_func("continuation.getContinuationStackOffset").is_some());
    }

    #[test]
    fn enqueues_become_continuation_intrinsics() {
        let cx = Rc::new(Context::new());
        let mut module = Module::new(cx.clone());
        let (i32_type, i64_type) = (cx.int_type(32), cx.int_type(64));
        let params = |n| (0..n).map(|_| FuncParam::new(i32_type)).collect::<Vec<_>>();
        let enqueue_call = module.get_or_declare_func("_AmdEnqueueCall", cx.void_type(), params(3));
        let wait_enqueue_call =
            module.get_or_declare_func("_AmdWaitEnqueueCall", cx.void_type(), params(4));
        let enqueue = module.get_or_declare_func("_AmdEnqueueAnyHit", cx.void_type(), params(2));
        let complete = module.get_or_declare_func("_AmdComplete", cx.void_type(), []);

        let arg = |x| Value::Const(cx.const_u32(x));
        let shader = define_shader(
            &mut module,
            &[
                (enqueue_call, vec![arg(1), arg(2), arg(3)]),
                (wait_enqueue_call, vec![arg(1), arg(2), arg(3), arg(4)]),
                (enqueue, vec![arg(1), arg(2)]),
                (complete, vec![]),
            ],
        );

        assert_eq!(early_driver_transform(&mut module, &LoweringConfig::default()), Ok(true));

        let return_addr = Value::Const(cx.const_func_addr(i64_type, shader));
        assert_eq!(
            call_args(&module, shader),
            [
                (CONTINUE.to_string(), vec![arg(1), arg(2), return_addr, arg(3)]),
                (WAIT_CONTINUE.to_string(), vec![arg(1), arg(2), arg(3), return_addr, arg(4)]),
                (CONTINUE.to_string(), vec![arg(1), arg(2)]),
                (COMPLETE.to_string(), vec![]),
            ]
        );
        for helper in [
            "_AmdEnqueueCall",
            "_AmdWaitEnqueueCall",
            "_AmdEnqueueAnyHit",
            "_AmdComplete",
        ] {
            assert!(module.lookup_func(helper).is_none(), "{helper}");
        }
        assert_eq!(early_driver_transform(&mut module, &LoweringConfig::default()), Ok(false));
    }

    #[test]
    fn missing_flags_is_fatal() {
        let cx = Rc::new(Context::new());
        let mut module = Module::new(cx.clone());
        module.get_or_declare_func("_AmdContinuationsGetFlags", cx.int_type(32), []);
        assert_eq!(
            early_driver_transform(&mut module, &LoweringConfig::default()),
            Err(LowerError::MissingMetadata(crate::config::keys::FLAGS))
        );
    }

    #[test]
    fn only_intrinsic_decls_are_removed() {
        let cx = Rc::new(Context::new());
        let mut module = Module::new(cx.clone());
        module.get_or_declare_func("lgc.rt.trace.ray", cx.void_type(), []);
        module.get_or_declare_func("dx.op.traceRay", cx.void_type(), []);
        module.get_or_declare_func("_cont_TraceRay", cx.void_type(), []);
        let used = module.get_or_declare_func("dx.op.used", cx.int_type(32), []);
        define_shader(&mut module, &[(used, vec![])]);

        assert!(remove_unused_func_decls(&mut module, true));
        assert!(module.lookup_func("_cont_TraceRay").is_some());
        assert!(module.lookup_func("dx.op.used").is_some());
        assert!(module.lookup_func("lgc.rt.trace.ray").is_none());
        assert!(module.lookup_func("dx.op.traceRay").is_none());
        assert!(!remove_unused_func_decls(&mut module, true));
    }
}
