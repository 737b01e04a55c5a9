//! Continuation lowering: frame cleanup, continuation stack addressing and
//! pointer address space fixups.

use crate::{AddrSpace, Type, Value};

pub mod addr_space;
pub mod early;
pub mod frame;
pub mod stack;

/// Memory holding every value live across a suspend point, attached to a
/// function (see `FuncDefBody::cont_frame`) when it's split into
/// continuations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContFrame {
    /// Pointer to the start of the frame.
    pub base: Value,

    /// All spilled values, as `(byte offset, type)`, ordered by offset.
    pub fields: Vec<ContFrameField>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ContFrameField {
    pub offset: u32,
    pub ty: Type,
}

impl ContFrame {
    /// Frame with an unknown layout: all constant offsets from `base` are
    /// considered part of it.
    pub fn new(base: Value) -> Self {
        Self {
            base,
            fields: vec![],
        }
    }

    pub fn with_fields(base: Value, fields: impl IntoIterator<Item = ContFrameField>) -> Self {
        let mut fields: Vec<_> = fields.into_iter().collect();
        fields.sort_by_key(|field| field.offset);
        Self { base, fields }
    }

    /// Total size of the frame, i.e. the end of its last field, or `None`
    /// if the layout is unknown.
    pub fn size(&self, cx: &crate::Context) -> Option<u32> {
        self.fields
            .iter()
            .map(|field| field.offset + crate::layout::store_size(cx, field.ty))
            .max()
    }
}

/// How logical continuation stack offsets are turned into pointers.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum StackPointerMode {
    /// The offset is directly a (per-thread) scratch memory address.
    Scratch,

    /// The offset is relative to a global memory base address, queried from
    /// the runtime library.
    Global,
}

impl StackPointerMode {
    /// Address space of the pointers produced for this mode.
    pub fn addr_space(self) -> AddrSpace {
        match self {
            StackPointerMode::Scratch => AddrSpace::Scratch,
            StackPointerMode::Global => AddrSpace::Global,
        }
    }
}
