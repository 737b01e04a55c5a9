//! Store-to-load forwarding on continuation frames.
//!
//! After splitting, a continuation typically reloads values from its frame
//! which were stored earlier in the same function, and such loads can be
//! replaced by the stored value, as long as the store is the *sole and exact*
//! source of all the loaded bytes.

use crate::builder::User;
use crate::cfg::Dominance;
use crate::interval::IntervalIndexBuilder;
use crate::print::FuncPrinter;
use crate::{layout, CastOp, Context, DataInst, DataInstKind, FuncDecl, FxIndexMap, Value};
use smallvec::SmallVec;

/// Store discovered through the frame pointer, at a constant byte offset.
#[derive(Copy, Clone)]
struct OffsetStore {
    offset: i64,
    store: DataInst,
}

/// Replace loads through `frame_ptr` (at constant offsets) with the value of
/// the store that fully defines the loaded bytes, if there is exactly one,
/// it has the same type, and it dominates the load.
///
/// Any use of `frame_ptr` (or a pointer derived from it) that can't be
/// analyzed makes the whole transform a no-op. Returns whether anything
/// changed.
pub fn forward_continuation_frame_store_to_load(
    cx: &Context,
    func_decl: &mut FuncDecl,
    dom: &impl Dominance,
    frame_ptr: Value,
) -> bool {
    forward_within_frame(cx, func_decl, dom, frame_ptr, None)
}

/// Like `forward_continuation_frame_store_to_load`, but with all accesses
/// required to stay within the first `frame_size` bytes (if known).
pub fn forward_within_frame(
    cx: &Context,
    func_decl: &mut FuncDecl,
    dom: &impl Dominance,
    frame_ptr: Value,
    frame_size: Option<u32>,
) -> bool {
    let body = func_decl.body();
    let in_frame = |offset: i64, bytes: u32| {
        frame_size.map_or(true, |size| {
            offset >= 0 && offset + i64::from(bytes) <= i64::from(size)
        })
    };

    // Loads by offset, in the order they were found.
    let mut offset_loads = FxIndexMap::<i64, SmallVec<[DataInst; 2]>>::default();
    let mut store_intervals = IntervalIndexBuilder::new();
    // Interval queries can answer which stores cover both ends of a load, but
    // not whether another store lies strictly inside, hence a sorted list too.
    let mut sorted_stores = vec![];

    let mut worklist: Vec<_> = body
        .users_of(frame_ptr)
        .into_iter()
        .map(|u| (u, frame_ptr, 0i64))
        .collect();
    while let Some((u, ptr, offset)) = worklist.pop() {
        let inst = match u.user {
            User::DataInst(inst) => inst,
            User::Terminator(_) => {
                log::debug!("unhandled user of continuation frame pointer: terminator");
                return false;
            }
        };
        let inst_def = &body.data_insts[inst];
        let derived_uses = |offset| {
            body.users_of(Value::DataInstOutput(inst))
                .into_iter()
                .map(move |u| (u, Value::DataInstOutput(inst), offset))
        };
        match inst_def.kind {
            DataInstKind::Gep { .. } if u.input_idx == 0 => {
                // Give up on dynamic indices for simplicity.
                let Some(gep_offset) = layout::accumulate_constant_offset(cx, body, inst) else {
                    return false;
                };
                worklist.extend(derived_uses(offset + gep_offset));
            }
            DataInstKind::Load(access) => {
                if !access.is_simple() {
                    return false;
                }
                let load_type = inst_def.output_type.expect("load without an output type");
                if !in_frame(offset, layout::store_size(cx, load_type)) {
                    log::debug!("continuation frame load at {offset} is out of bounds");
                    return false;
                }
                offset_loads.entry(offset).or_default().push(inst);
            }
            DataInstKind::Store(access) => {
                let stored_value = inst_def.inputs[1];
                if !access.is_simple() || stored_value == ptr {
                    return false;
                }
                debug_assert_eq!(inst_def.inputs[0], ptr);

                let stored_type = body.value_type(cx, &func_decl.params, stored_value);
                let stored_bytes = layout::store_size(cx, stored_type);
                if !in_frame(offset, stored_bytes) {
                    log::debug!("continuation frame store at {offset} is out of bounds");
                    return false;
                }
                if stored_bytes == 0 {
                    continue;
                }
                sorted_stores.push(OffsetStore {
                    offset,
                    store: inst,
                });
                store_intervals.insert(offset..=offset + i64::from(stored_bytes) - 1, inst);
            }
            DataInstKind::Cast(CastOp::BitCast | CastOp::AddrSpaceCast) => {
                worklist.extend(derived_uses(offset));
            }
            _ => {
                log::debug!(
                    "unhandled user of continuation frame pointer: {}",
                    FuncPrinter::new(cx, None, func_decl).data_inst_to_string(inst)
                );
                return false;
            }
        }
    }

    // Nothing to do if there is no store.
    if store_intervals.is_empty() {
        return false;
    }
    let store_intervals = store_intervals.build();
    sorted_stores.sort_by_key(|s| s.offset);

    let mut forwarded = vec![];
    for (&offset, loads) in &offset_loads {
        let containing_left = store_intervals.query(offset);
        // Nothing to do if there is no store or more than one store.
        let &[store_record] = &containing_left[..] else {
            continue;
        };
        // The load and store are at different addresses.
        if offset != store_record.left {
            continue;
        }
        let store = store_record.payload;

        for &load in loads {
            let load_type = body.data_insts[load]
                .output_type
                .expect("load without an output type");
            let load_bytes = layout::store_size(cx, load_type);
            if load_bytes == 0 {
                continue;
            }

            // Make sure the store fully covers the loaded range, and is the
            // only one to do so.
            let containing_right = store_intervals.query(offset + i64::from(load_bytes) - 1);
            if !matches!(&containing_right[..], [r] if r.payload == store) {
                continue;
            }

            // Another store writing strictly within the loaded range.
            let first_after = sorted_stores.partition_point(|s| s.offset <= offset);
            if let Some(conflict) = sorted_stores.get(first_after) {
                if conflict.offset < store_record.right {
                    continue;
                }
            }

            let stored_value = body.data_insts[store].inputs[1];
            if body.value_type(cx, &func_decl.params, stored_value) != load_type {
                continue;
            }
            if !dom.dominates(store, load) {
                continue;
            }

            forwarded.push((load, store));
        }
    }

    if forwarded.is_empty() {
        return false;
    }

    let body = func_decl.body_mut();
    for (load, store) in forwarded {
        log::trace!("forwarding continuation frame store to load");
        // Re-read, as the stored value may itself have been a forwarded load.
        let stored_value = body.data_insts[store].inputs[1];
        let load_ptr = body.data_insts[load].inputs[0];
        body.replace_all_uses_with(Value::DataInstOutput(load), stored_value);
        body.erase_data_inst(load);

        // Erase the possibly dead instruction which defines the pointer.
        if let Value::DataInstOutput(ptr_inst) = load_ptr {
            if load_ptr != frame_ptr
                && body.data_insts.contains(ptr_inst)
                && !body.has_users(load_ptr)
            {
                body.erase_data_inst(ptr_inst);
            }
        }
    }
    true
}

/// Apply `forward_continuation_frame_store_to_load` to the continuation frame
/// of every function in `module` that has one.
pub fn forward_frame_stores_in_module(module: &mut crate::Module) -> bool {
    let cx = module.cx();
    let mut changed = false;
    for func in module.defined_funcs() {
        let func_decl = &mut module.funcs[func];
        let Some(frame) = func_decl.body().cont_frame.as_ref() else {
            continue;
        };
        let (frame_ptr, frame_size) = (frame.base, frame.size(&cx));
        let dom_tree = crate::cfg::DomTree::new(func_decl.body());
        changed |= forward_within_frame(&cx, func_decl, &dom_tree, frame_ptr, frame_size);
    }
    changed
}
