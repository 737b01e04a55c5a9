//! Lowering `GpuRtOp`s onto the workgroup-local `LdsStack` and constants.

use super::{
    bvh_stack_offset_imm, stack_capacity, workgroup_size, GpuRtOp, LDS_STACK_NAME,
    MAX_LDS_STACK_ENTRIES, WAVE32_STACK_ENTRIES,
};
use crate::builder::{FuncBuilder, InsertPoint};
use crate::config::{LoweringConfig, PipelineKind, RtOptions};
use crate::{
    AddrSpace, BinOp, BuiltIn, CastOp, Context, DataInst, DataInstKind, DeclDef, FuncDecl,
    GlobalVar, GlobalVarDecl, GlobalVarDefBody, Intrinsic, LowerError, Module, Type, Value,
};
use crate::print::type_to_string;

/// The `LdsStack` global variable, and its (array) type.
#[derive(Copy, Clone)]
struct LdsStack {
    global_var: GlobalVar,
    ty: Type,
}

pub struct TraversalStackManager {
    workgroup_size: u32,
    thread_id: BuiltIn,
    rt_options: RtOptions,
    lds_stack: Option<LdsStack>,
}

impl TraversalStackManager {
    /// Prepare for lowering the `GpuRtOp`s in `module`, creating the
    /// `LdsStack` global variable if any of them needs it.
    ///
    /// An existing `LdsStack` is reused, but only if it has the expected type.
    pub fn new(module: &mut Module, config: &LoweringConfig) -> Result<Self, LowerError> {
        let cx = module.cx();
        let workgroup_size = workgroup_size(config);

        let mut needs_stack = false;
        let mut needs_extra_stack = false;
        for func in module.defined_funcs() {
            let body = module.funcs[func].body();
            for (_, inst_def) in body.data_insts.iter() {
                if let DataInstKind::GpuRt(op) = inst_def.kind {
                    needs_stack |= op.uses_lds_stack();
                    needs_extra_stack |= op.uses_extra_stack();
                }
            }
        }

        let lds_stack = needs_stack.then(|| {
            let ty = cx.array_type(
                cx.int_type(32),
                stack_capacity(workgroup_size, needs_extra_stack),
            );
            let global_var = match module.lookup_global_var(LDS_STACK_NAME) {
                Some(global_var) => {
                    let existing = &module.global_vars[global_var];
                    if existing.ty != ty || existing.addr_space != AddrSpace::Local {
                        return Err(LowerError::ConflictingGlobalVar {
                            name: LDS_STACK_NAME,
                            reason: format!(
                                "expected `{}` in {:?} memory, found `{}` in {:?} memory",
                                type_to_string(&cx, ty),
                                AddrSpace::Local,
                                type_to_string(&cx, existing.ty),
                                existing.addr_space,
                            ),
                        });
                    }
                    global_var
                }
                None => {
                    log::debug!(
                        "creating `{LDS_STACK_NAME}` for workgroup size {workgroup_size} \
                         (extra stack: {needs_extra_stack})"
                    );
                    module.global_vars.define(
                        &cx,
                        GlobalVarDecl {
                            name: cx.intern(LDS_STACK_NAME),
                            ty,
                            addr_space: AddrSpace::Local,
                            align: 4,
                            def: DeclDef::Present(GlobalVarDefBody { initializer: None }),
                        },
                    )
                }
            };
            Ok(LdsStack { global_var, ty })
        });
        let lds_stack = lds_stack.transpose()?;

        Ok(Self {
            workgroup_size,
            thread_id: match config.pipeline {
                PipelineKind::Graphics => BuiltIn::SubgroupLocalInvocationId,
                PipelineKind::Compute { .. } => BuiltIn::LocalInvocationIndex,
            },
            rt_options: config.rt_options,
            lds_stack,
        })
    }

    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }

    pub fn lds_stack(&self) -> Option<GlobalVar> {
        self.lds_stack.map(|stack| stack.global_var)
    }

    fn stack_size(&self) -> u32 {
        MAX_LDS_STACK_ENTRIES * self.workgroup_size
    }

    /// Replace `inst` (if it's a `GpuRtOp`) with its lowering, returning
    /// whether it was replaced.
    pub fn lower_op(&self, cx: &Context, func_decl: &mut FuncDecl, inst: DataInst) -> bool {
        let inst_def = &func_decl.body().data_insts[inst];
        let op = match inst_def.kind {
            DataInstKind::GpuRt(op) => op,
            _ => return false,
        };
        let inputs = inst_def.inputs.clone();
        let has_output = inst_def.output_type.is_some();
        assert_eq!(inputs.len(), op.arity(), "`{}`: wrong number of inputs", op.name());

        let i32_type = cx.int_type(32);
        let const_u32 = |x: u32| Value::Const(cx.const_u32(x));
        let lds_stack = || {
            let stack = self
                .lds_stack
                .expect("`LdsStack` is created for all functions using it");
            let ptr = cx.const_ptr_to_global_var(cx.ptr_type(AddrSpace::Local), stack.global_var);
            (Value::Const(ptr), stack.ty)
        };

        let mut b = FuncBuilder::new(cx, func_decl, InsertPoint::Before(inst));
        let replacement = match op {
            GpuRtOp::GetStackSize => const_u32(self.stack_size()),
            GpuRtOp::GetStackStride => const_u32(self.workgroup_size),
            GpuRtOp::GetStackBase | GpuRtOp::GetFlattenedGroupThreadId => {
                b.read_builtin(self.thread_id)
            }

            GpuRtOp::StackRead { use_extra_stack } | GpuRtOp::StackWrite { use_extra_stack } => {
                let (stack_ptr, _) = lds_stack();
                let mut index = inputs[0];
                if use_extra_stack {
                    index = b.bin_op(BinOp::Add, index, const_u32(self.stack_size()));
                }
                let entry_ptr = b.gep(i32_type, stack_ptr, [index]);
                if let GpuRtOp::StackRead { .. } = op {
                    b.load(i32_type, entry_ptr)
                } else {
                    b.store(entry_ptr, inputs[1]);
                    const_u32(0)
                }
            }

            GpuRtOp::LdsStackInit => {
                let (stack_ptr, stack_type) = lds_stack();
                let thread_id = b.read_builtin(self.thread_id);
                // Same computation as `thread_stack_base`.
                let base = if self.workgroup_size > 32 {
                    let lane = b.bin_op(BinOp::And, thread_id, const_u32(31));
                    let wave = b.bin_op(BinOp::LShr, thread_id, const_u32(5));
                    let wave_base = b.bin_op(BinOp::Mul, wave, const_u32(WAVE32_STACK_ENTRIES));
                    b.bin_op(BinOp::Add, lane, wave_base)
                } else {
                    thread_id
                };
                let base_ptr = b.gep(stack_type, stack_ptr, [const_u32(0), base]);
                let base_addr = b.cast(CastOp::PtrToInt, base_ptr, i32_type);
                b.bin_op(BinOp::Shl, base_addr, const_u32(16))
            }

            GpuRtOp::LdsStackStore => {
                let (stack_addr_ptr, last_visited, data) = (inputs[0], inputs[1], inputs[2]);
                let stack_addr = b.load(i32_type, stack_addr_ptr);
                let result_type = cx.struct_type([i32_type, i32_type]);
                let ret = Value::DataInstOutput(b.intrinsic(
                    Intrinsic::BvhStackRtn,
                    Some(result_type),
                    [stack_addr, last_visited, data, const_u32(bvh_stack_offset_imm())],
                ));
                let new_stack_addr = b.extract_value(ret, &[1]);
                b.store(stack_addr_ptr, new_stack_addr);
                b.extract_value(ret, &[0])
            }

            GpuRtOp::GetBoxSortHeuristicMode => const_u32(self.rt_options.box_sort_heuristic_mode),
            GpuRtOp::GetStaticFlags => const_u32(self.rt_options.static_pipeline_flags),
            GpuRtOp::GetTriangleCompressionMode => const_u32(self.rt_options.tri_compress_mode),
        };

        let body = func_decl.body_mut();
        if has_output {
            body.replace_all_uses_with(Value::DataInstOutput(inst), replacement);
        }
        body.erase_data_inst(inst);
        true
    }
}
