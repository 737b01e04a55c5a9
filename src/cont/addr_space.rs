//! Propagating an address space change through all (transitive) uses of a
//! pointer, e.g. after moving a continuation frame from scratch to global
//! memory.

use crate::builder::User;
use crate::print::FuncPrinter;
use crate::{
    AddrSpace, CastOp, Context, DataInst, DataInstKind, FuncDecl, FxIndexSet, LowerError, Type,
    TypeKind, Value,
};
use std::collections::VecDeque;

/// Change the type of `old` to the type of `new` (pointer types which only
/// differ in their address space), replace all uses of `old` with `new`, and
/// fix up the types of everything derived from those uses.
///
/// Address space casts found along the way (which become no-ops) have their
/// uses replaced, but are only collected into `to_be_removed`, as they may
/// still be referenced by the caller.
pub fn replace_all_pointer_uses(
    cx: &Context,
    func_decl: &mut FuncDecl,
    old: Value,
    new: Value,
    to_be_removed: &mut Vec<DataInst>,
) -> Result<(), LowerError> {
    let old_type = func_decl.value_type(cx, old);
    let new_type = func_decl.value_type(cx, new);
    let (old_addr_space, new_addr_space) =
        match (cx[old_type].ptr_addr_space(), cx[new_type].ptr_addr_space()) {
            (Some(old_as), Some(new_as)) => (old_as, new_as),
            _ => panic!("replace_all_pointer_uses: non-pointer values"),
        };
    assert_ne!(
        old_addr_space, new_addr_space,
        "replace_all_pointer_uses: address space doesn't change"
    );

    set_value_type(func_decl, old, new_type);

    let body = func_decl.body_mut();
    let worklist = data_inst_users(body, old);
    body.replace_all_uses_with(old, new);

    walk_uses(cx, func_decl, new_addr_space, worklist, to_be_removed)
}

/// Change the type of the pointer `value` to `new_type` (which may only differ
/// in its address space), and fix up the types of everything derived from it,
/// erasing any address space casts that become no-ops.
///
/// Rewriting a pointer which is already in the target address space is
/// allowed, and only removes lifetime markers.
pub fn rewrite_value_addr_space(
    cx: &Context,
    func_decl: &mut FuncDecl,
    value: Value,
    new_type: Type,
) -> Result<(), LowerError> {
    let old_type = func_decl.value_type(cx, value);
    assert!(
        matches!(cx[old_type], TypeKind::Ptr(_)),
        "rewrite_value_addr_space: non-pointer value"
    );
    let new_addr_space = cx[new_type]
        .ptr_addr_space()
        .expect("rewrite_value_addr_space: non-pointer target type");

    set_value_type(func_decl, value, new_type);

    let worklist = data_inst_users(func_decl.body(), value);
    let mut to_be_removed = vec![];
    walk_uses(cx, func_decl, new_addr_space, worklist, &mut to_be_removed)?;

    let body = func_decl.body_mut();
    for inst in to_be_removed {
        body.erase_data_inst(inst);
    }
    Ok(())
}

#[track_caller]
fn set_value_type(func_decl: &mut FuncDecl, v: Value, ty: Type) {
    match v {
        Value::Const(_) => panic!("set_value_type: constants can't be retyped"),
        Value::FuncParam { idx } => func_decl.params[idx as usize].ty = ty,
        Value::DataInstOutput(inst) => {
            func_decl.body_mut().data_insts[inst].output_type = Some(ty);
        }
    }
}

fn data_inst_users(body: &crate::FuncDefBody, v: Value) -> VecDeque<DataInst> {
    body.users_of(v)
        .into_iter()
        .filter_map(|u| match u.user {
            User::DataInst(inst) => Some(inst),
            // Control-flow (e.g. returning the pointer) doesn't propagate.
            User::Terminator(_) => None,
        })
        .collect()
}

fn walk_uses(
    cx: &Context,
    func_decl: &mut FuncDecl,
    new_addr_space: AddrSpace,
    mut worklist: VecDeque<DataInst>,
    to_be_removed: &mut Vec<DataInst>,
) -> Result<(), LowerError> {
    let new_ptr_type = cx.ptr_type(new_addr_space);
    let mut visited = FxIndexSet::default();

    let unsupported = |func_decl: &FuncDecl, inst: DataInst| {
        LowerError::UnsupportedPointerUse(format!(
            "`{}` in function `{}`",
            FuncPrinter::new(cx, None, func_decl).data_inst_to_string(inst),
            &cx[func_decl.name]
        ))
    };

    while let Some(inst) = worklist.pop_front() {
        let FuncDecl { params, def, .. } = &mut *func_decl;
        let body = def
            .as_present_mut()
            .expect("rewrite: function without a body");
        if !body.data_insts.contains(inst) || !visited.insert(inst) {
            continue;
        }

        let inst_def = &body.data_insts[inst];
        log::trace!(
            "visiting {}",
            crate::print::data_inst_kind_to_string(cx, &inst_def.kind)
        );
        let kind = inst_def.kind.clone();
        let output_type = inst_def.output_type;
        let first_input = inst_def.inputs.first().copied();

        // `true` means "continue with the users of the current instruction",
        // `false` means "stop here, and proceed with the rest of the worklist".
        let propagate = match kind {
            DataInstKind::Load(_) | DataInstKind::Store(_) => false,

            DataInstKind::Intrinsic(intrinsic) if intrinsic.is_lifetime_marker() => {
                // The lifetime marker is not useful anymore.
                body.erase_data_inst(inst);
                false
            }
            DataInstKind::FuncCall(_) | DataInstKind::Intrinsic(_) => {
                return Err(unsupported(func_decl, inst));
            }

            DataInstKind::BinOp(_) | DataInstKind::Cast(CastOp::PtrToInt) => true,

            DataInstKind::Cast(CastOp::BitCast) => {
                let input = first_input.expect("rewrite: bitcast without input");
                let input_type = body.value_type(cx, &params[..], input);
                assert!(
                    matches!(cx[input_type], TypeKind::Ptr(_))
                        && output_type.map_or(false, |ty| matches!(cx[ty], TypeKind::Ptr(_))),
                    "rewrite: bitcast between non-pointer types"
                );
                body.data_insts[inst].output_type = Some(new_ptr_type);
                true
            }

            DataInstKind::Cast(CastOp::AddrSpaceCast) => {
                let input = first_input.expect("rewrite: address space cast without input");
                debug_assert_eq!(
                    cx[body.value_type(cx, &params[..], input)].ptr_addr_space(),
                    Some(new_addr_space),
                    "rewrite: address space cast operand not yet rewritten"
                );

                // Enqueue the users before they're redirected to `input`.
                worklist.extend(data_inst_users(body, Value::DataInstOutput(inst)));
                body.data_insts[inst].output_type = Some(new_ptr_type);
                body.replace_all_uses_with(Value::DataInstOutput(inst), input);
                to_be_removed.push(inst);
                false
            }

            DataInstKind::Cast(CastOp::IntToPtr) | DataInstKind::Gep { .. } => {
                body.data_insts[inst].output_type = Some(new_ptr_type);
                true
            }

            DataInstKind::Select => match output_type {
                Some(ty) if matches!(cx[ty], TypeKind::Ptr(_)) && ty != new_ptr_type => {
                    body.data_insts[inst].output_type = Some(new_ptr_type);
                    true
                }
                _ => false,
            },

            DataInstKind::Alloca(_)
            | DataInstKind::Cast(_)
            | DataInstKind::ExtractValue(_)
            | DataInstKind::ReadBuiltIn(_)
            | DataInstKind::GpuRt(_)
            | DataInstKind::Rt(_) => {
                return Err(unsupported(func_decl, inst));
            }
        };

        if propagate {
            worklist.extend(data_inst_users(
                func_decl.body(),
                Value::DataInstOutput(inst),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FuncBuilder, InsertPoint};
    use crate::{BinOp, ControlInstKind, DeclDef, FuncDefBody, FuncParam, Intrinsic};

    fn func_with_ptr_param(cx: &Context, addr_space: AddrSpace) -> FuncDecl {
        FuncDecl {
            name: cx.intern("f"),
            ret_type: cx.void_type(),
            params: [FuncParam::new(cx.ptr_type(addr_space))].into_iter().collect(),
            shader_stage: None,
            def: DeclDef::Present(FuncDefBody::new(cx)),
        }
    }

    fn output_type(cx: &Context, func_decl: &FuncDecl, v: Value) -> Option<AddrSpace> {
        cx[func_decl.value_type(cx, v)].ptr_addr_space()
    }

    #[test]
    fn rewrites_derived_pointers() {
        let cx = Context::new();
        let mut func_decl = func_with_ptr_param(&cx, AddrSpace::Scratch);
        let entry = func_decl.body().entry_block();
        let i32_type = cx.int_type(32);
        let i64_type = cx.int_type(64);
        let param = Value::FuncParam { idx: 0 };

        let (gep, addr, back, cast, sel);
        {
            let mut b = FuncBuilder::new(&cx, &mut func_decl, InsertPoint::BlockEnd(entry));
            b.intrinsic(
                Intrinsic::LifetimeStart,
                None,
                [cx.const_int(i64_type, 4).into(), param],
            );
            gep = b.gep(i32_type, param, [cx.const_u32(1).into()]);
            b.store(gep, cx.const_u32(7).into());
            addr = b.cast(CastOp::PtrToInt, gep, i32_type);
            let masked = b.bin_op(BinOp::And, addr, cx.const_u32(!3).into());
            back = b.cast(CastOp::IntToPtr, masked, cx.ptr_type(AddrSpace::Scratch));
            cast = b.cast(CastOp::AddrSpaceCast, back, cx.ptr_type(AddrSpace::Flat));
            sel = b.select(cx.const_bool(true).into(), cast, cast);
            b.load(i32_type, sel);
            b.terminate(entry, ControlInstKind::Return, [], []);
        }

        rewrite_value_addr_space(&cx, &mut func_decl, param, cx.ptr_type(AddrSpace::Global))
            .unwrap();

        assert_eq!(output_type(&cx, &func_decl, param), Some(AddrSpace::Global));
        assert_eq!(output_type(&cx, &func_decl, gep), Some(AddrSpace::Global));
        assert_eq!(output_type(&cx, &func_decl, back), Some(AddrSpace::Global));
        assert_eq!(output_type(&cx, &func_decl, sel), Some(AddrSpace::Global));
        assert_eq!(output_type(&cx, &func_decl, addr), None);

        let body = func_decl.body();
        // The cast was folded away (the select now uses `back` directly).
        let Value::DataInstOutput(cast_inst) = cast else { unreachable!() };
        assert!(!body.data_insts.contains(cast_inst));
        let Value::DataInstOutput(sel_inst) = sel else { unreachable!() };
        assert_eq!(body.data_insts[sel_inst].inputs[1..], [back, back]);

        // The lifetime marker is gone.
        assert!(!body.all_data_insts().any(|inst| matches!(
            body.data_insts[inst].kind,
            DataInstKind::Intrinsic(Intrinsic::LifetimeStart)
        )));
    }

    #[test]
    fn replace_with_other_pointer() {
        let cx = Context::new();
        let mut func_decl = func_with_ptr_param(&cx, AddrSpace::Scratch);
        let entry = func_decl.body().entry_block();
        let i32_type = cx.int_type(32);

        let (old, new, gep);
        {
            let mut b = FuncBuilder::new(&cx, &mut func_decl, InsertPoint::BlockEnd(entry));
            old = b.alloca(i32_type);
            let addr = b.read_builtin(crate::BuiltIn::LocalInvocationIndex);
            new = b.cast(CastOp::IntToPtr, addr, cx.ptr_type(AddrSpace::Global));
            gep = b.gep(i32_type, old, [cx.const_u32(2).into()]);
            b.load(i32_type, gep);
            b.terminate(entry, ControlInstKind::Return, [], []);
        }

        let mut to_be_removed = vec![];
        replace_all_pointer_uses(&cx, &mut func_decl, old, new, &mut to_be_removed).unwrap();
        assert!(to_be_removed.is_empty());

        let body = func_decl.body();
        assert!(!body.has_users(old));
        let Value::DataInstOutput(gep_inst) = gep else { unreachable!() };
        assert_eq!(body.data_insts[gep_inst].inputs[0], new);
        assert_eq!(output_type(&cx, &func_decl, gep), Some(AddrSpace::Global));
    }

    #[test]
    fn calls_are_unsupported() {
        let cx = Context::new();
        let mut callees: crate::EntityDefs<crate::Func, FuncDecl> = crate::EntityDefs::new();
        let callee = callees.define(
            &cx,
            FuncDecl {
                name: cx.intern("g"),
                ret_type: cx.void_type(),
                params: [FuncParam::new(cx.ptr_type(AddrSpace::Scratch))]
                    .into_iter()
                    .collect(),
                shader_stage: None,
                def: DeclDef::Imported,
            },
        );

        let mut func_decl = func_with_ptr_param(&cx, AddrSpace::Scratch);
        let entry = func_decl.body().entry_block();
        let param = Value::FuncParam { idx: 0 };
        {
            let mut b = FuncBuilder::new(&cx, &mut func_decl, InsertPoint::BlockEnd(entry));
            b.call(callee, cx.void_type(), [param]);
            b.terminate(entry, ControlInstKind::Return, [], []);
        }

        let result =
            rewrite_value_addr_space(&cx, &mut func_decl, param, cx.ptr_type(AddrSpace::Global));
        assert!(matches!(result, Err(LowerError::UnsupportedPointerUse(_))));
    }
}
