//! Replacing `RtOp`s with calls to their runtime library implementations.

use super::{gpurt_map_entry, GpuRtMapEntry, RtOp, IMPL_PREFIX};
use crate::builder::{FuncBuilder, InsertPoint};
use crate::print::type_to_string;
use crate::runtime::{self, RuntimeImport, RuntimeLibrary};
use crate::{
    CastOp, Context, DataInst, DataInstKind, FuncDecl, FxIndexMap, LowerError, Module,
    ShaderStage, Type, TypeKind, Value,
};
use smallvec::SmallVec;

/// Address of the (possibly nested) system data struct of type `wanted`,
/// inside the system data at `system_data` (of type `system_data_type`).
///
/// System data structs nest their "base" struct as their first field, so this
/// only ever descends through field `0`.
pub fn system_data_for_type(
    b: &mut FuncBuilder<'_>,
    system_data: Value,
    system_data_type: Type,
    wanted: Type,
) -> Result<Value, LowerError> {
    let cx = b.cx();
    if !matches!(cx[wanted], TypeKind::Struct { .. }) {
        return Err(invalid_system_data(cx, system_data_type, wanted));
    }

    let mut depth = 0;
    let mut ty = system_data_type;
    while ty != wanted {
        match &cx[ty] {
            TypeKind::Struct { fields } if !fields.is_empty() => ty = fields[0],
            _ => return Err(invalid_system_data(cx, system_data_type, wanted)),
        }
        depth += 1;
    }

    if depth == 0 {
        return Ok(system_data);
    }
    let zero = Value::Const(cx.const_u32(0));
    Ok(b.gep(
        system_data_type,
        system_data,
        std::iter::repeat(zero).take(depth + 1),
    ))
}

fn invalid_system_data(cx: &Context, system_data_type: Type, wanted: Type) -> LowerError {
    LowerError::InvalidSystemData {
        system_data: type_to_string(cx, system_data_type),
        wanted: type_to_string(cx, wanted),
    }
}

/// Whether the hit data passed to runtime functions is the candidate
/// (still being evaluated) hit, as opposed to the committed one.
fn uses_candidate_hit(stage: Option<ShaderStage>) -> bool {
    matches!(stage, Some(ShaderStage::AnyHit | ShaderStage::Intersection))
}

/// The runtime library functions `RtOp`s are remapped to, declared in the
/// module being lowered.
#[derive(Default)]
pub struct RtImports {
    impls: FxIndexMap<RtOp, (GpuRtMapEntry, RuntimeImport)>,
    candidate_state: Option<RuntimeImport>,
    committed_state: Option<RuntimeImport>,
}

impl RtImports {
    /// Import everything needed to remap all `RtOp`s in `module`.
    ///
    /// Fails for ops without a runtime mapping, and mappings (or hit state
    /// accessors) missing from the runtime library.
    pub fn import_for_module(
        module: &mut Module,
        runtime: &RuntimeLibrary,
    ) -> Result<Self, LowerError> {
        let mut needed_ops: SmallVec<[RtOp; 8]> = SmallVec::new();
        let (mut needs_candidate, mut needs_committed) = (false, false);
        for func in module.defined_funcs() {
            let func_decl = &module.funcs[func];
            for (_, inst_def) in func_decl.body().data_insts.iter() {
                let DataInstKind::Rt(op) = inst_def.kind else {
                    continue;
                };
                let entry = gpurt_map_entry(op).ok_or(LowerError::UnmappedRtOp(op.name()))?;
                if entry.accesses_hit_data {
                    if uses_candidate_hit(func_decl.shader_stage) {
                        needs_candidate = true;
                    } else {
                        needs_committed = true;
                    }
                }
                if !needed_ops.contains(&op) {
                    needed_ops.push(op);
                }
            }
        }

        let mut imports = Self::default();
        for op in needed_ops {
            let entry = gpurt_map_entry(op).ok_or(LowerError::UnmappedRtOp(op.name()))?;
            let import = runtime.import_into(module, &format!("{IMPL_PREFIX}{}", entry.name))?;
            imports.impls.insert(op, (entry, import));
        }
        if needs_candidate {
            imports.candidate_state =
                Some(runtime.import_into(module, runtime::GET_CANDIDATE_STATE)?);
        }
        if needs_committed {
            imports.committed_state =
                Some(runtime.import_into(module, runtime::GET_COMMITTED_STATE)?);
        }
        Ok(imports)
    }

    fn hit_state_accessor(&self, stage: Option<ShaderStage>) -> Result<&RuntimeImport, LowerError> {
        let (accessor, name) = if uses_candidate_hit(stage) {
            (&self.candidate_state, runtime::GET_CANDIDATE_STATE)
        } else {
            (&self.committed_state, runtime::GET_COMMITTED_STATE)
        };
        accessor
            .as_ref()
            .ok_or_else(|| LowerError::MissingRuntimeFunc(name.to_string()))
    }
}

/// Replace `inst` (if it's an `RtOp`) with a call to its runtime library
/// implementation, returning that call.
///
/// The function must take a pointer to its system data (with a known
/// `pointee` type) as its first parameter, and the runtime implementation
/// must take a pointer to a (nested) system data struct as its first
/// parameter, optionally followed by a pointer to the hit data, and then
/// the op's own arguments.
pub fn remap_rt_op(
    cx: &Context,
    func_decl: &mut FuncDecl,
    inst: DataInst,
    imports: &RtImports,
) -> Result<Option<DataInst>, LowerError> {
    let inst_def = &func_decl.body().data_insts[inst];
    let DataInstKind::Rt(op) = inst_def.kind else {
        return Ok(None);
    };
    let args = inst_def.inputs.clone();
    let output_type = inst_def.output_type;
    let stage = func_decl.shader_stage;

    let (entry, impl_func) = match imports.impls.get(&op) {
        Some((entry, import)) => (*entry, import),
        None => {
            return Err(match gpurt_map_entry(op) {
                Some(entry) => {
                    LowerError::MissingRuntimeFunc(format!("{IMPL_PREFIX}{}", entry.name))
                }
                None => LowerError::UnmappedRtOp(op.name()),
            })
        }
    };
    let impl_name = &impl_func.sig.name;

    let system_data = Value::FuncParam { idx: 0 };
    let system_data_type = func_decl
        .params
        .first()
        .and_then(|param| param.pointee)
        .ok_or_else(|| LowerError::InvalidSystemData {
            system_data: "<none>".into(),
            wanted: impl_name.clone(),
        })?;

    let sig_error = |reason: String| LowerError::RuntimeFuncSignature {
        name: impl_name.clone(),
        reason,
    };
    let impl_system_data_type = impl_func
        .sig
        .param_pointee(0)
        .ok_or_else(|| sig_error("missing system data parameter".into()))?;

    let hit_data = if entry.accesses_hit_data {
        let accessor = imports.hit_state_accessor(stage)?;
        let accessor_system_data_type = accessor
            .sig
            .param_pointee(0)
            .ok_or_else(|| sig_error("hit state accessor without system data".into()))?;

        // The hit data is passed by pointer, to a copy in function-local
        // memory allocated at the start of the function.
        let entry_block = func_decl.body().entry_block();
        let mut b = FuncBuilder::new(cx, func_decl, InsertPoint::BlockStart(entry_block));
        let hit_data_ptr = b.alloca(accessor.sig.ret_type);

        b.set_insert_point(InsertPoint::Before(inst));
        let accessor_system_data =
            system_data_for_type(&mut b, system_data, system_data_type, accessor_system_data_type)?;
        let hit_data = b.call(accessor.func, accessor.sig.ret_type, [accessor_system_data]);
        b.store(hit_data_ptr, Value::DataInstOutput(hit_data));
        Some(hit_data_ptr)
    } else {
        None
    };

    let mut b = FuncBuilder::new(cx, func_decl, InsertPoint::Before(inst));
    let mut call_args: SmallVec<[Value; 4]> = SmallVec::new();
    call_args.push(system_data_for_type(
        &mut b,
        system_data,
        system_data_type,
        impl_system_data_type,
    )?);
    call_args.extend(hit_data);

    let remaining_params = &impl_func.sig.params[call_args.len()..];
    if remaining_params.len() != args.len() {
        return Err(sig_error(format!(
            "expected {} arguments for `{}`, found {}",
            remaining_params.len(),
            op.name(),
            args.len()
        )));
    }
    for (&arg, param) in args.iter().zip(remaining_params) {
        let arg_type = b.value_type(arg);
        let arg = if arg_type == param.ty {
            arg
        } else {
            match (&cx[arg_type], &cx[param.ty]) {
                (TypeKind::Int { width: from }, TypeKind::Int { width: to }) if from < to => {
                    b.cast(CastOp::ZExt, arg, param.ty)
                }
                _ => {
                    return Err(LowerError::ArgTypeMismatch {
                        from: type_to_string(cx, arg_type),
                        to: type_to_string(cx, param.ty),
                        op: entry.name.to_string(),
                    })
                }
            }
        };
        call_args.push(arg);
    }

    let call = b.call(impl_func.func, impl_func.sig.ret_type, call_args);
    let call_has_output = b.body().data_insts[call].output_type.is_some();

    let body = func_decl.body_mut();
    if output_type.is_some() {
        if !call_has_output {
            return Err(sig_error(format!("`{}` needs a result", op.name())));
        }
        body.replace_all_uses_with(Value::DataInstOutput(inst), Value::DataInstOutput(call));
    }
    body.erase_data_inst(inst);
    Ok(Some(call))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddrSpace, ControlInstKind, DataInstDef, DeclDef, FuncDefBody, FuncParam};
    use std::rc::Rc;

    #[test]
    fn system_data_descends_first_field() {
        let cx = Context::new();
        let i32_type = cx.int_type(32);
        let base = cx.struct_type([i32_type]);
        let derived = cx.struct_type([base, i32_type]);
        let mut func_decl = FuncDecl {
            name: cx.intern("f"),
            ret_type: cx.void_type(),
            params: [FuncParam::ptr_to(cx.ptr_type(AddrSpace::Scratch), derived)]
                .into_iter()
                .collect(),
            shader_stage: None,
            def: DeclDef::Present(FuncDefBody::new(&cx)),
        };
        let entry = func_decl.body().entry_block();
        let mut b = FuncBuilder::new(&cx, &mut func_decl, InsertPoint::BlockEnd(entry));
        let system_data = Value::FuncParam { idx: 0 };

        assert_eq!(system_data_for_type(&mut b, system_data, derived, derived), Ok(system_data));
        assert!(b.body().blocks[entry].insts.is_empty());

        let nested = system_data_for_type(&mut b, system_data, derived, base).unwrap();
        let Value::DataInstOutput(gep) = nested else { panic!() };
        let gep_def = &b.body().data_insts[gep];
        assert!(gep_def.kind == DataInstKind::Gep { base_type: derived });
        assert_eq!(gep_def.inputs.len(), 3);

        let unrelated = cx.struct_type([cx.int_type(64)]);
        assert!(matches!(
            system_data_for_type(&mut b, system_data, derived, unrelated),
            Err(LowerError::InvalidSystemData { .. })
        ));
    }

    struct Setup {
        cx: Rc<Context>,
        module: Module,
        runtime: RuntimeLibrary,
        shader: crate::Func,
    }

    fn setup(stage: ShaderStage, op: RtOp, args: &[Value], has_output: bool) -> Setup {
        let cx = Rc::new(Context::new());
        let i32_type = cx.int_type(32);
        let ptr_type = cx.ptr_type(AddrSpace::Scratch);
        let system_data = cx.struct_type([i32_type, i32_type]);
        let hit_data = cx.struct_type([i32_type]);
        let output_type = has_output.then_some(i32_type);

        let mut library = Module::new(cx.clone());
        for name in [runtime::GET_CANDIDATE_STATE, runtime::GET_COMMITTED_STATE] {
            library.get_or_declare_func(name, hit_data, [FuncParam::ptr_to(ptr_type, system_data)]);
        }
        library.get_or_declare_func(
            "_cont_InstanceID",
            i32_type,
            [FuncParam::ptr_to(ptr_type, system_data), FuncParam::ptr_to(ptr_type, hit_data)],
        );
        library.get_or_declare_func(
            "_cont_ReportHit",
            cx.int_type(1),
            [
                FuncParam::ptr_to(ptr_type, system_data),
                FuncParam::new(cx.intern(TypeKind::Float { width: 32 })),
                FuncParam::new(i32_type),
            ],
        );
        let runtime = RuntimeLibrary::from_module(&library).unwrap();

        let mut module = Module::new(cx.clone());
        let mut func_decl = FuncDecl {
            name: cx.intern("shader"),
            ret_type: cx.void_type(),
            params: [
                FuncParam::ptr_to(ptr_type, system_data),
                FuncParam::new(cx.int_type(8)),
                FuncParam::new(cx.intern(TypeKind::Float { width: 32 })),
            ]
            .into_iter()
            .collect(),
            shader_stage: Some(stage),
            def: DeclDef::Present(FuncDefBody::new(&cx)),
        };
        let entry = func_decl.body().entry_block();
        {
            let mut b = FuncBuilder::new(&cx, &mut func_decl, InsertPoint::BlockEnd(entry));
            let rt = b.insert(DataInstDef {
                kind: DataInstKind::Rt(op),
                output_type,
                inputs: args.iter().copied().collect(),
            });
            let ret = output_type.map(|_| Value::DataInstOutput(rt));
            b.terminate(entry, ControlInstKind::Return, ret, []);
        }
        let shader = module.funcs.define(&cx, func_decl);
        Setup {
            cx,
            module,
            runtime,
            shader,
        }
    }

    fn remap_all(setup: &mut Setup) -> Result<(), LowerError> {
        let imports = RtImports::import_for_module(&mut setup.module, &setup.runtime)?;
        let func_decl = &mut setup.module.funcs[setup.shader];
        let insts: Vec<_> = func_decl.body().all_data_insts().collect();
        for inst in insts {
            remap_rt_op(&setup.cx, func_decl, inst, &imports)?;
        }
        Ok(())
    }

    fn callees(setup: &Setup) -> Vec<String> {
        let body = setup.module.funcs[setup.shader].body();
        body.all_data_insts()
            .filter_map(|inst| match body.data_insts[inst].kind {
                DataInstKind::FuncCall(callee) => {
                    Some(setup.cx[setup.module.funcs[callee].name].to_string())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn hit_data_state_depends_on_stage() {
        let mut any_hit = setup(ShaderStage::AnyHit, RtOp::InstanceId, &[], true);
        remap_all(&mut any_hit).unwrap();
        assert_eq!(callees(&any_hit), ["_cont_GetCandidateState", "_cont_InstanceID"]);

        let mut closest_hit = setup(ShaderStage::ClosestHit, RtOp::InstanceId, &[], true);
        remap_all(&mut closest_hit).unwrap();
        assert_eq!(callees(&closest_hit), ["_cont_GetCommittedState", "_cont_InstanceID"]);

        // The hit data is allocated at the start of the function.
        let body = closest_hit.module.funcs[closest_hit.shader].body();
        let first = body.all_data_insts().next().unwrap();
        assert!(matches!(body.data_insts[first].kind, DataInstKind::Alloca(_)));
        let entry = body.entry_block();
        let Value::DataInstOutput(ret) = body.blocks[entry].terminator.inputs[0] else { panic!() };
        assert!(matches!(body.data_insts[ret].kind, DataInstKind::FuncCall(_)));
    }

    #[test]
    fn narrow_ints_are_zero_extended() {
        let f32_arg = Value::FuncParam { idx: 2 };
        let i8_arg = Value::FuncParam { idx: 1 };
        let mut s = setup(ShaderStage::Intersection, RtOp::ReportHit, &[f32_arg, i8_arg], false);
        remap_all(&mut s).unwrap();

        let body = s.module.funcs[s.shader].body();
        let insts: Vec<_> = body.all_data_insts().collect();
        assert!(body.data_insts[insts[0]].kind == DataInstKind::Cast(CastOp::ZExt));
        assert_eq!(
            body.data_insts[insts[1]].inputs[..],
            [Value::FuncParam { idx: 0 }, f32_arg, Value::DataInstOutput(insts[0])]
        );
    }

    #[test]
    fn mismatched_arg_is_fatal() {
        let f32_arg = Value::FuncParam { idx: 2 };
        let mut s = setup(ShaderStage::Intersection, RtOp::ReportHit, &[f32_arg, f32_arg], false);
        assert_eq!(
            remap_all(&mut s),
            Err(LowerError::ArgTypeMismatch {
                from: "f32".into(),
                to: "i32".into(),
                op: "ReportHit".into(),
            })
        );
    }

    #[test]
    fn unmapped_and_missing_ops() {
        let mut s = setup(ShaderStage::Miss, RtOp::ShaderIndex, &[], false);
        assert_eq!(remap_all(&mut s), Err(LowerError::UnmappedRtOp("shader.index")));

        let mut s = setup(ShaderStage::Miss, RtOp::IgnoreHit, &[], false);
        assert_eq!(
            remap_all(&mut s),
            Err(LowerError::MissingRuntimeFunc("_cont_IgnoreHit".into()))
        );
    }
}
