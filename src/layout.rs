//! Memory layout of types, under a fixed AMDGPU-like data layout.
//!
//! Pointers into workgroup-local (`Local`) and private (`Scratch`) memory are
//! 32-bit, all others 64-bit. Scalars are naturally aligned (to their size,
//! rounded up to a power of two), and aggregates are laid out C-style.

use crate::{
    AddrSpace, Context, DataInst, DataInstKind, FuncDefBody, Type, TypeKind, Value,
};

// FIXME: use proper newtypes for byte sizes (and log2 for align).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MemLayout {
    /// Bytes actually written by storing a value of this type.
    pub store_size: u32,

    /// Bytes between consecutive values of this type in an array.
    pub alloc_size: u32,

    pub align: u32,
}

pub fn ptr_size(addr_space: AddrSpace) -> u32 {
    match addr_space {
        AddrSpace::Local | AddrSpace::Scratch => 4,
        AddrSpace::Flat | AddrSpace::Global | AddrSpace::Constant => 8,
    }
}

fn scalar_layout(bits: u32) -> MemLayout {
    let store_size = (bits + 7) / 8;
    let align = store_size.max(1).next_power_of_two();
    MemLayout {
        store_size,
        alloc_size: align_to(store_size, align),
        align,
    }
}

fn align_to(size: u32, align: u32) -> u32 {
    (size + align - 1) / align * align
}

pub fn mem_layout(cx: &Context, ty: Type) -> MemLayout {
    match &cx[ty] {
        TypeKind::Void => MemLayout {
            store_size: 0,
            alloc_size: 0,
            align: 1,
        },
        &TypeKind::Int { width } | &TypeKind::Float { width } => scalar_layout(width),
        &TypeKind::Ptr(addr_space) => scalar_layout(ptr_size(addr_space) * 8),
        &TypeKind::Vector { elem, len } => {
            let elem = mem_layout(cx, elem);
            let store_size = elem.store_size * len;
            let align = store_size.max(1).next_power_of_two();
            MemLayout {
                store_size,
                alloc_size: align_to(store_size, align),
                align,
            }
        }
        &TypeKind::Array { elem, len } => {
            let elem = mem_layout(cx, elem);
            let size = elem.alloc_size * len;
            MemLayout {
                store_size: size,
                alloc_size: size,
                align: elem.align,
            }
        }
        TypeKind::Struct { fields } => {
            let mut size = 0;
            let mut align = 1;
            for &field in fields {
                let field = mem_layout(cx, field);
                size = align_to(size, field.align) + field.alloc_size;
                align = align.max(field.align);
            }
            let size = align_to(size, align);
            MemLayout {
                store_size: size,
                alloc_size: size,
                align,
            }
        }
    }
}

pub fn store_size(cx: &Context, ty: Type) -> u32 {
    mem_layout(cx, ty).store_size
}

pub fn alloc_size(cx: &Context, ty: Type) -> u32 {
    mem_layout(cx, ty).alloc_size
}

/// Byte offset of field `idx` of the struct type `ty`.
#[track_caller]
pub fn field_offset(cx: &Context, ty: Type, idx: u32) -> u32 {
    let TypeKind::Struct { fields } = &cx[ty] else {
        panic!("field_offset: non-struct type");
    };
    let mut offset = 0;
    for (i, &field) in fields.iter().enumerate() {
        let field = mem_layout(cx, field);
        offset = align_to(offset, field.align);
        if i as u32 == idx {
            return offset;
        }
        offset += field.alloc_size;
    }
    panic!("field_offset: field index {idx} out of bounds")
}

/// The type of the (nested) member of `ty` reached through `indices`.
pub fn member_type(cx: &Context, ty: Type, indices: &[u32]) -> Option<Type> {
    indices.iter().try_fold(ty, |ty, &idx| match &cx[ty] {
        TypeKind::Struct { fields } => fields.get(idx as usize).copied(),
        &TypeKind::Array { elem, len } | &TypeKind::Vector { elem, len } => {
            (idx < len).then_some(elem)
        }
        _ => None,
    })
}

/// Compute the constant byte offset added by the `Gep` instruction `gep`, or
/// `None` if any of its indices is not a constant.
///
/// The first index scales by the size of the `base_type`, and later ones step
/// into struct fields, array elements or vector elements.
#[track_caller]
pub fn accumulate_constant_offset(cx: &Context, body: &FuncDefBody, gep: DataInst) -> Option<i64> {
    let gep_def = &body.data_insts[gep];
    let DataInstKind::Gep { base_type } = gep_def.kind else {
        panic!("accumulate_constant_offset: not a `Gep` instruction");
    };

    let const_index = |v: Value| match v {
        Value::Const(ct) => cx.const_as_i64(ct),
        _ => None,
    };

    let mut indices = gep_def.inputs[1..].iter().copied();
    let mut offset = 0i64;
    if let Some(first) = indices.next() {
        offset = const_index(first)?.checked_mul(alloc_size(cx, base_type).into())?;
    }

    let mut ty = base_type;
    for idx in indices {
        let idx = const_index(idx)?;
        match &cx[ty] {
            TypeKind::Struct { fields } => {
                let field_idx = u32::try_from(idx).ok()?;
                let &field_type = fields.get(field_idx as usize)?;
                offset = offset.checked_add(field_offset(cx, ty, field_idx).into())?;
                ty = field_type;
            }
            &TypeKind::Array { elem, .. } | &TypeKind::Vector { elem, .. } => {
                offset = offset.checked_add(idx.checked_mul(alloc_size(cx, elem).into())?)?;
                ty = elem;
            }
            _ => return None,
        }
    }
    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FuncBuilder, InsertPoint};

    #[test]
    fn scalar_and_aggregate_sizes() {
        let cx = Context::new();
        let i1 = cx.int_type(1);
        let i8 = cx.int_type(8);
        let i32 = cx.int_type(32);
        let i64 = cx.int_type(64);

        assert_eq!(store_size(&cx, i1), 1);
        assert_eq!(store_size(&cx, i32), 4);
        assert_eq!(alloc_size(&cx, i64), 8);
        assert_eq!(store_size(&cx, cx.ptr_type(AddrSpace::Scratch)), 4);
        assert_eq!(store_size(&cx, cx.ptr_type(AddrSpace::Global)), 8);

        let s = cx.struct_type([i8, i32, i64]);
        assert_eq!(field_offset(&cx, s, 0), 0);
        assert_eq!(field_offset(&cx, s, 1), 4);
        assert_eq!(field_offset(&cx, s, 2), 8);
        assert_eq!(mem_layout(&cx, s).alloc_size, 16);
        assert_eq!(mem_layout(&cx, s).align, 8);

        let v3 = cx.vector_type(i32, 3);
        assert_eq!(store_size(&cx, v3), 12);
        assert_eq!(alloc_size(&cx, v3), 16);

        assert_eq!(alloc_size(&cx, cx.array_type(i32, 5)), 20);
    }

    #[test]
    fn member_types() {
        let cx = Context::new();
        let i32 = cx.int_type(32);
        let arr = cx.array_type(i32, 2);
        let s = cx.struct_type([i32, arr]);
        assert_eq!(member_type(&cx, s, &[1, 1]), Some(i32));
        assert_eq!(member_type(&cx, s, &[1, 2]), None);
        assert_eq!(member_type(&cx, s, &[]), Some(s));
    }

    #[test]
    fn gep_offsets() {
        let cx = Context::new();
        let i32 = cx.int_type(32);
        let i64 = cx.int_type(64);
        let arr = cx.array_type(i64, 4);
        let s = cx.struct_type([i32, arr]);

        let mut body = FuncDefBody::new(&cx);
        let entry = body.entry_block();
        let mut b = FuncBuilder::from_parts(&cx, &[], &mut body, InsertPoint::BlockEnd(entry));
        let base = b.alloca(s);
        let constant = b.gep(
            s,
            base,
            [cx.const_u32(1).into(), cx.const_u32(1).into(), cx.const_u32(2).into()],
        );
        let dynamic = b.gep(i32, base, [base]);

        let inst = |v: Value| match v {
            Value::DataInstOutput(inst) => inst,
            _ => unreachable!(),
        };
        // 1 * sizeof(s) + offsetof(s.1) + 2 * sizeof(i64)
        assert_eq!(
            accumulate_constant_offset(&cx, &body, inst(constant)),
            Some(40 + 8 + 16)
        );
        assert_eq!(accumulate_constant_offset(&cx, &body, inst(dynamic)), None);
    }
}
