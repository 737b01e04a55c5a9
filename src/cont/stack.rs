//! Continuation stack addressing.
//!
//! The continuation stack is addressed through 32-bit logical offsets (kept in
//! a per-thread variable, see `CONTINUATION_STACK_OFFSET_ACCESSOR`), which only
//! become pointers right before each memory access, according to the
//! `StackPointerMode` of the pipeline.

use super::StackPointerMode;
use crate::builder::FuncBuilder;
use crate::config::LoweringConfig;
use crate::runtime::{self, RuntimeLibrary};
use crate::{AddrSpace, BinOp, CastOp, Func, LowerError, Module, TypeKind, Value};

/// Function returning a pointer to the current (`i32`) continuation stack
/// offset, implemented later in the pipeline.
pub const CONTINUATION_STACK_OFFSET_ACCESSOR: &str = "continuation.getContinuationStackOffset";

/// Bytes per register of the (spilled part of the) register buffer.
pub const REGISTER_BYTES: u64 = 4;

/// Return the continuation stack offset accessor, declaring it if needed.
pub fn continuation_stack_offset_accessor(module: &mut Module) -> Func {
    let cx = module.cx();
    module.get_or_declare_func(CONTINUATION_STACK_OFFSET_ACCESSOR, cx.ptr_type(AddrSpace::Flat), [])
}

/// Advance the continuation stack offset by `delta` bytes (negative to
/// shrink it), returning the offsets before and after.
pub fn move_continuation_stack_offset(
    b: &mut FuncBuilder<'_>,
    accessor: Func,
    delta: i32,
) -> (Value, Value) {
    let cx = b.cx();
    let i32_type = cx.int_type(32);

    let offset_ptr = Value::DataInstOutput(b.call(accessor, cx.ptr_type(AddrSpace::Flat), []));
    let old_offset = b.load(i32_type, offset_ptr);
    let new_offset = b.bin_op(
        BinOp::Add,
        old_offset,
        cx.const_int(i32_type, delta as u64).into(),
    );
    b.store(offset_ptr, new_offset);
    (old_offset, new_offset)
}

/// Bytes of continuation stack needed to hold `num_registers` of register
/// buffer, when `num_reserved_registers` of them live in actual registers.
pub fn needed_stack_size_for_register_buffer(
    num_registers: u64,
    num_reserved_registers: u64,
) -> u64 {
    num_registers.saturating_sub(num_reserved_registers) * REGISTER_BYTES
}

/// Turns continuation stack offsets into pointers.
pub struct StackAddrTranslator {
    mode: StackPointerMode,

    /// `_cont_GetContinuationStackGlobalMemBase`, declared in the module
    /// being lowered (only in `StackPointerMode::Global`).
    global_mem_base: Option<Func>,
}

impl StackAddrTranslator {
    /// Fails with `MissingStackAddrSpace` if the pipeline never chose a
    /// stack mode, and `MissingRuntimeFunc` if the global memory base can't be
    /// queried in `StackPointerMode::Global`.
    pub fn new(
        module: &mut Module,
        config: &LoweringConfig,
        runtime: &RuntimeLibrary,
    ) -> Result<Self, LowerError> {
        let mode = config.stack_mode.ok_or(LowerError::MissingStackAddrSpace)?;
        let global_mem_base = match mode {
            StackPointerMode::Scratch => None,
            StackPointerMode::Global => Some(
                runtime
                    .import_into(module, runtime::GET_CONTINUATION_STACK_GLOBAL_MEM_BASE)?
                    .func,
            ),
        };
        Ok(Self {
            mode,
            global_mem_base,
        })
    }

    pub fn mode(&self) -> StackPointerMode {
        self.mode
    }

    /// Compute the address of the continuation stack `offset` (an `i32`).
    pub fn offset_to_ptr(&self, b: &mut FuncBuilder<'_>, offset: Value) -> Value {
        let cx = b.cx();
        assert!(
            cx[b.value_type(offset)] == (TypeKind::Int { width: 32 }),
            "continuation stack offsets must be i32"
        );

        let ptr_type = cx.ptr_type(self.mode.addr_space());
        match (self.mode, self.global_mem_base) {
            (StackPointerMode::Scratch, _) => b.cast(CastOp::IntToPtr, offset, ptr_type),
            (StackPointerMode::Global, Some(global_mem_base)) => {
                let base_addr =
                    Value::DataInstOutput(b.call(global_mem_base, cx.int_type(64), []));
                let base_ptr = b.cast(CastOp::IntToPtr, base_addr, ptr_type);
                b.gep(cx.int_type(8), base_ptr, [offset])
            }
            (StackPointerMode::Global, None) => {
                unreachable!("StackAddrTranslator: global mode without a memory base")
            }
        }
    }
}
