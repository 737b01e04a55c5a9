//! Typed registry of the runtime support library functions lowering calls.
//!
//! The library is a separate `Module` (sharing the `Context` of the shaders
//! being lowered), and all functions the lowering knows about have their
//! signatures checked once, when the registry is built, instead of deep inside
//! the transforms that use them.

use crate::print::type_to_string;
use crate::rt::{self, RtOp};
use crate::{Context, Func, FuncParam, FxIndexMap, LowerError, Module, Type, TypeKind};
use smallvec::SmallVec;
use std::rc::Rc;

pub const GET_CONTINUATION_STACK_GLOBAL_MEM_BASE: &str = "_cont_GetContinuationStackGlobalMemBase";
pub const GET_CANDIDATE_STATE: &str = "_cont_GetCandidateState";
pub const GET_COMMITTED_STATE: &str = "_cont_GetCommittedState";

/// Signature of one runtime library function.
#[derive(Clone, Debug)]
pub struct RuntimeFunc {
    pub name: String,
    pub ret_type: Type,
    pub params: SmallVec<[FuncParam; 2]>,
}

impl RuntimeFunc {
    /// The type pointed to by the `idx`-th (pointer) parameter, if known.
    pub fn param_pointee(&self, idx: usize) -> Option<Type> {
        self.params.get(idx).and_then(|param| param.pointee)
    }
}

/// A runtime library function, declared in the module being lowered.
#[derive(Clone, Debug)]
pub struct RuntimeImport {
    pub func: Func,
    pub sig: RuntimeFunc,
}

pub struct RuntimeLibrary {
    cx: Rc<Context>,
    funcs: FxIndexMap<String, RuntimeFunc>,
}

impl RuntimeLibrary {
    pub fn from_module(library: &Module) -> Result<Self, LowerError> {
        let cx = library.cx();
        let funcs: FxIndexMap<_, _> = library
            .funcs
            .iter()
            .map(|(_, decl)| {
                let name = cx[decl.name].to_string();
                let sig = RuntimeFunc {
                    name: name.clone(),
                    ret_type: decl.ret_type,
                    params: decl.params.clone(),
                };
                (name, sig)
            })
            .collect();

        let runtime = Self { cx, funcs };
        runtime.validate()?;
        log::debug!("runtime library: {} functions", runtime.funcs.len());
        Ok(runtime)
    }

    fn validate(&self) -> Result<(), LowerError> {
        let cx = &self.cx;
        let bad = |sig: &RuntimeFunc, reason: String| LowerError::RuntimeFuncSignature {
            name: sig.name.clone(),
            reason,
        };
        let is_struct = |ty: Type| matches!(cx[ty], TypeKind::Struct { .. });
        let struct_ptr_param = |sig: &RuntimeFunc, idx: usize| {
            let param = sig.params.get(idx);
            match param {
                Some(param) if matches!(cx[param.ty], TypeKind::Ptr(_)) => {
                    param.pointee.map_or(false, is_struct)
                }
                _ => false,
            }
        };

        if let Some(sig) = self.funcs.get(GET_CONTINUATION_STACK_GLOBAL_MEM_BASE) {
            if !sig.params.is_empty() || cx[sig.ret_type] != (TypeKind::Int { width: 64 }) {
                return Err(bad(sig, "expected `() -> i64`".into()));
            }
        }

        for name in [GET_CANDIDATE_STATE, GET_COMMITTED_STATE] {
            if let Some(sig) = self.funcs.get(name) {
                if sig.params.len() != 1 || !struct_ptr_param(sig, 0) || !is_struct(sig.ret_type) {
                    return Err(bad(
                        sig,
                        "expected a single pointer-to-struct parameter, and a struct result".into(),
                    ));
                }
            }
        }

        for op in RtOp::ALL {
            let Some(entry) = rt::gpurt_map_entry(op) else {
                continue;
            };
            let Some(sig) = self.funcs.get(&format!("{}{}", rt::IMPL_PREFIX, entry.name)) else {
                continue;
            };
            if !struct_ptr_param(sig, 0) {
                return Err(bad(
                    sig,
                    "first parameter must be a pointer to the system data".into(),
                ));
            }
            if entry.accesses_hit_data
                && !sig
                    .params
                    .get(1)
                    .map_or(false, |param| matches!(cx[param.ty], TypeKind::Ptr(_)))
            {
                return Err(bad(
                    sig,
                    format!(
                        "second parameter must be a pointer to the hit data, found {}",
                        sig.params
                            .get(1)
                            .map_or("nothing".into(), |param| type_to_string(cx, param.ty))
                    ),
                ));
            }
        }

        Ok(())
    }

    pub fn cx(&self) -> &Rc<Context> {
        &self.cx
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&RuntimeFunc, LowerError> {
        self.funcs
            .get(name)
            .ok_or_else(|| LowerError::MissingRuntimeFunc(name.to_string()))
    }

    /// Declare the runtime function `name` in `module` (reusing any existing
    /// declaration with that name).
    pub fn import_into(
        &self,
        module: &mut Module,
        name: &str,
    ) -> Result<RuntimeImport, LowerError> {
        assert!(
            Rc::ptr_eq(module.cx_ref(), &self.cx),
            "runtime library and module must share a `Context`"
        );
        let sig = self.get(name)?.clone();
        let func = module.get_or_declare_func(name, sig.ret_type, sig.params.iter().copied());
        Ok(RuntimeImport { func, sig })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddrSpace, DeclDef, FuncDecl};

    fn declare(module: &mut Module, name: &str, ret_type: Type, params: &[FuncParam]) {
        let cx = module.cx();
        module.funcs.define(
            &cx,
            FuncDecl {
                name: cx.intern(name),
                ret_type,
                params: params.iter().copied().collect(),
                shader_stage: None,
                def: DeclDef::Imported,
            },
        );
    }

    #[test]
    fn lookup_and_import() {
        let cx = Rc::new(Context::new());
        let mut library = Module::new(cx.clone());
        declare(&mut library, GET_CONTINUATION_STACK_GLOBAL_MEM_BASE, cx.int_type(64), &[]);
        let runtime = RuntimeLibrary::from_module(&library).unwrap();

        assert!(runtime.contains(GET_CONTINUATION_STACK_GLOBAL_MEM_BASE));
        assert_eq!(
            runtime.get(GET_CANDIDATE_STATE).unwrap_err(),
            LowerError::MissingRuntimeFunc(GET_CANDIDATE_STATE.into())
        );

        let mut module = Module::new(cx.clone());
        let first = runtime
            .import_into(&mut module, GET_CONTINUATION_STACK_GLOBAL_MEM_BASE)
            .unwrap();
        let second = runtime
            .import_into(&mut module, GET_CONTINUATION_STACK_GLOBAL_MEM_BASE)
            .unwrap();
        assert_eq!(first.func, second.func);
        assert_eq!(module.funcs.len(), 1);
    }

    #[test]
    fn bad_signatures_are_rejected() {
        let cx = Rc::new(Context::new());
        let mut library = Module::new(cx.clone());
        declare(&mut library, GET_CONTINUATION_STACK_GLOBAL_MEM_BASE, cx.int_type(32), &[]);
        assert!(matches!(
            RuntimeLibrary::from_module(&library),
            Err(LowerError::RuntimeFuncSignature { .. })
        ));

        let mut library = Module::new(cx.clone());
        let system_data = cx.struct_type([cx.int_type(32)]);
        declare(
            &mut library,
            "_cont_InstanceID",
            cx.int_type(32),
            &[FuncParam::ptr_to(cx.ptr_type(AddrSpace::Scratch), system_data)],
        );
        // Missing the hit data parameter.
        assert!(matches!(
            RuntimeLibrary::from_module(&library),
            Err(LowerError::RuntimeFuncSignature { .. })
        ));
    }
}
