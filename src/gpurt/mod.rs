//! GPU ray-tracing runtime operations: the BVH traversal stack (kept in
//! workgroup-local memory, i.e. LDS) and pipeline-state queries.
//!
//! All threads of a workgroup share one `LdsStack` array, with each thread
//! owning `MAX_LDS_STACK_ENTRIES` interleaved entries: entry `i` of a thread is
//! at `base + i * stride`, where `stride` is the workgroup size (or `32`, for
//! the hardware stack instructions, see `thread_stack_base`).

use crate::config::{LoweringConfig, PipelineKind};

pub mod lower;

/// Entries of the traversal stack, per thread.
pub const MAX_LDS_STACK_ENTRIES: u32 = 16;

// NOTE: `bvh_stack_offset_imm` encodes the stack size as `log2(size) - 3`,
// and the hardware stack layout is only known to work for 16 entries.
const _: () = assert!(MAX_LDS_STACK_ENTRIES == 16);

/// Name of the workgroup-local global variable holding all traversal stacks.
pub const LDS_STACK_NAME: &str = "LdsStack";

/// Workgroup size assumed for graphics pipelines (i.e. without any explicit one).
pub const GRAPHICS_WORKGROUP_SIZE: u32 = 64;

/// Stack entries reserved for each 32-thread group in the hardware
/// stack layout (see `thread_stack_base`).
const WAVE32_STACK_ENTRIES: u32 = MAX_LDS_STACK_ENTRIES * 32;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum GpuRtOp {
    /// Total size (in `i32` entries) of the traversal stack of all threads.
    GetStackSize,
    /// Index of the first stack entry of the current thread.
    GetStackBase,
    /// Distance (in `i32` entries) between stack entries of the same thread.
    GetStackStride,

    /// `inputs`: `[index: i32]`, with `use_extra_stack` addressing a second,
    /// equally sized, stack placed after the first one.
    StackRead { use_extra_stack: bool },
    /// `inputs`: `[index: i32, value: i32]`.
    StackWrite { use_extra_stack: bool },

    /// Initial stack address, as expected by `LdsStackStore`.
    LdsStackInit,
    /// Hardware-assisted push/pop, with `inputs`:
    /// `[stack_addr_ptr, last_visited: i32, data: <4 x i32>]`.
    LdsStackStore,

    GetBoxSortHeuristicMode,
    GetStaticFlags,
    GetTriangleCompressionMode,
    GetFlattenedGroupThreadId,
}

impl GpuRtOp {
    pub fn name(self) -> &'static str {
        match self {
            GpuRtOp::GetStackSize => "get.stack.size",
            GpuRtOp::GetStackBase => "get.stack.base",
            GpuRtOp::GetStackStride => "get.stack.stride",
            GpuRtOp::StackRead { use_extra_stack: false } => "stack.read",
            GpuRtOp::StackRead { use_extra_stack: true } => "stack.read.extra",
            GpuRtOp::StackWrite { use_extra_stack: false } => "stack.write",
            GpuRtOp::StackWrite { use_extra_stack: true } => "stack.write.extra",
            GpuRtOp::LdsStackInit => "lds.stack.init",
            GpuRtOp::LdsStackStore => "lds.stack.store",
            GpuRtOp::GetBoxSortHeuristicMode => "get.box.sort.heuristic.mode",
            GpuRtOp::GetStaticFlags => "get.static.flags",
            GpuRtOp::GetTriangleCompressionMode => "get.triangle.compression.mode",
            GpuRtOp::GetFlattenedGroupThreadId => "get.flattened.group.thread.id",
        }
    }

    /// Number of inputs (all ops produce an `i32`).
    pub fn arity(self) -> usize {
        match self {
            GpuRtOp::StackRead { .. } => 1,
            GpuRtOp::StackWrite { .. } => 2,
            GpuRtOp::LdsStackStore => 3,
            _ => 0,
        }
    }

    /// Whether lowering this op accesses the `LdsStack` global variable.
    pub fn uses_lds_stack(self) -> bool {
        matches!(
            self,
            GpuRtOp::StackRead { .. } | GpuRtOp::StackWrite { .. } | GpuRtOp::LdsStackInit
        )
    }

    pub fn uses_extra_stack(self) -> bool {
        matches!(
            self,
            GpuRtOp::StackRead { use_extra_stack: true }
                | GpuRtOp::StackWrite { use_extra_stack: true }
        )
    }
}

/// Number of threads sharing one `LdsStack`.
pub fn workgroup_size(config: &LoweringConfig) -> u32 {
    let size = match config.pipeline {
        PipelineKind::Graphics => GRAPHICS_WORKGROUP_SIZE,
        PipelineKind::Compute { workgroup_size: [x, y, z] } => x * y * z,
    };
    if config.gfx_ip_major >= 11 {
        // Waves are always fully populated on GFX11+.
        (size + 31) & !31
    } else {
        size
    }
}

/// Number of `i32` entries in the `LdsStack` array.
pub fn stack_capacity(workgroup_size: u32, needs_extra_stack: bool) -> u32 {
    let single = MAX_LDS_STACK_ENTRIES * workgroup_size;
    if needs_extra_stack {
        single * 2
    } else {
        single
    }
}

/// Whether a compute workgroup of `dims` threads can be given traversal
/// stacks (i.e. the largest `LdsStack` for it, after rounding up to full
/// waves and including the extra stack, is indexable with 32 bits).
pub fn workgroup_dims_fit_lds_stack([x, y, z]: [u32; 3]) -> bool {
    x.checked_mul(y)
        .and_then(|xy| xy.checked_mul(z))
        .and_then(|size| size.checked_add(31))
        .and_then(|size| size.checked_mul(MAX_LDS_STACK_ENTRIES * 2))
        .is_some()
}

/// Index of the first stack entry of thread `thread_id`, in the layout
/// expected by the hardware stack instructions: threads are grouped by 32,
/// each group owning `MAX_LDS_STACK_ENTRIES * 32` consecutive entries.
pub fn thread_stack_base(thread_id: u32, workgroup_size: u32) -> u32 {
    if workgroup_size > 32 {
        (thread_id & 31) + (thread_id >> 5) * WAVE32_STACK_ENTRIES
    } else {
        thread_id
    }
}

/// Immediate operand of `Intrinsic::BvhStackRtn`, encoding the stack size.
pub const fn bvh_stack_offset_imm() -> u32 {
    (MAX_LDS_STACK_ENTRIES.trailing_zeros() - 3) << 12
}
