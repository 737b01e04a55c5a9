mod common;

use common::{callees, define_func, new_module};
use rtcont::config::{keys, LoweringConfig};
use rtcont::rt::RtOp;
use rtcont::runtime::{self, RuntimeLibrary};
use rtcont::{
    passes, AddrSpace, Context, ControlInstKind, DataInstDef, DataInstKind, FuncParam, LowerError,
    Module, ShaderStage, Value,
};
use std::rc::Rc;

/// A runtime library with the hit state accessors and `_cont_InstanceID`.
fn runtime_library(cx: &Rc<Context>) -> RuntimeLibrary {
    let i32_type = cx.int_type(32);
    let ptr_type = cx.ptr_type(AddrSpace::Scratch);
    let system_data = cx.struct_type([i32_type]);
    let hit_data = cx.struct_type([i32_type, i32_type]);

    let mut library = Module::new(cx.clone());
    for name in [runtime::GET_CANDIDATE_STATE, runtime::GET_COMMITTED_STATE] {
        library.get_or_declare_func(name, hit_data, [FuncParam::ptr_to(ptr_type, system_data)]);
    }
    library.get_or_declare_func(
        "_cont_InstanceID",
        i32_type,
        [
            FuncParam::ptr_to(ptr_type, system_data),
            FuncParam::ptr_to(ptr_type, hit_data),
        ],
    );
    RuntimeLibrary::from_module(&library).unwrap()
}

fn instance_id_shader(module: &mut Module, stage: ShaderStage) -> rtcont::Func {
    let cx = module.cx();
    let i32_type = cx.int_type(32);
    // The shader's system data nests the runtime's as its first field.
    let system_data = cx.struct_type([cx.struct_type([i32_type]), i32_type]);
    define_func(
        module,
        stage.name(),
        i32_type,
        [FuncParam::ptr_to(cx.ptr_type(AddrSpace::Scratch), system_data)],
        Some(stage),
        |b, entry| {
            let id = b.insert(DataInstDef {
                kind: DataInstKind::Rt(RtOp::InstanceId),
                output_type: Some(i32_type),
                inputs: Default::default(),
            });
            b.terminate(entry, ControlInstKind::Return, [Value::DataInstOutput(id)], []);
        },
    )
}

#[test]
fn hit_state_accessor_follows_stage() {
    let (cx, mut module) = new_module();
    let runtime = runtime_library(&cx);
    let intersection = instance_id_shader(&mut module, ShaderStage::Intersection);
    let closest_hit = instance_id_shader(&mut module, ShaderStage::ClosestHit);

    assert_eq!(passes::rt::remap_rt_ops(&mut module, &runtime), Ok(true));
    assert_eq!(
        callees(&module, intersection),
        [runtime::GET_CANDIDATE_STATE, "_cont_InstanceID"]
    );
    assert_eq!(
        callees(&module, closest_hit),
        [runtime::GET_COMMITTED_STATE, "_cont_InstanceID"]
    );

    // Both shaders reach the runtime's system data through a GEP.
    for func in [intersection, closest_hit] {
        let kinds = common::inst_kinds(&module, func);
        assert!(kinds.iter().any(|kind| matches!(kind, DataInstKind::Gep { .. })));
        assert!(!kinds.iter().any(|kind| matches!(kind, DataInstKind::Rt(_))));
    }

    assert_eq!(passes::rt::remap_rt_ops(&mut module, &runtime), Ok(false));
}

#[test]
fn unmapped_op_is_fatal() {
    let (cx, mut module) = new_module();
    let runtime = runtime_library(&cx);
    let i32_type = cx.int_type(32);
    define_func(
        &mut module,
        "callable",
        i32_type,
        [],
        Some(ShaderStage::Callable),
        |b, entry| {
            let index = b.insert(DataInstDef {
                kind: DataInstKind::Rt(RtOp::ShaderIndex),
                output_type: Some(i32_type),
                inputs: Default::default(),
            });
            b.terminate(entry, ControlInstKind::Return, [Value::DataInstOutput(index)], []);
        },
    );
    assert_eq!(
        passes::rt::remap_rt_ops(&mut module, &runtime),
        Err(LowerError::UnmappedRtOp(RtOp::ShaderIndex.name()))
    );
}

#[test]
fn driver_queries_fold_from_metadata() {
    let (cx, mut module) = new_module();
    module.set_metadata(keys::STACK_ADDR_SPACE, [5]);
    module.set_metadata(keys::FLAGS, [7]);
    let config = LoweringConfig::from_module_metadata(&module).unwrap();

    let bool_type = cx.int_type(1);
    let i32_type = cx.int_type(32);
    let is_global = module.get_or_declare_func("_AmdContinuationStackIsGlobal", bool_type, []);
    let flags = module.get_or_declare_func("_AmdContinuationsGetFlags", i32_type, []);
    let func = define_func(&mut module, "raygen", i32_type, [], None, |b, entry| {
        let is_global = Value::DataInstOutput(b.call(is_global, bool_type, []));
        let flags = Value::DataInstOutput(b.call(flags, i32_type, []));
        let zero = Value::Const(b.cx().const_u32(0));
        let result = b.select(is_global, zero, flags);
        b.terminate(entry, ControlInstKind::Return, [result], []);
    });

    assert_eq!(passes::cont::early_driver_transform(&mut module, &config), Ok(true));
    assert!(callees(&module, func).is_empty());
    assert_eq!(module.funcs.len(), 1);

    let body = module.funcs[func].body();
    let select = body.all_data_insts().next().unwrap();
    assert_eq!(
        body.data_insts[select].inputs[..],
        [
            Value::Const(cx.const_bool(false)),
            Value::Const(cx.const_u32(0)),
            Value::Const(cx.const_u32(7)),
        ]
    );
}

#[test]
fn missing_rtip_is_fatal() {
    let (cx, mut module) = new_module();
    module.get_or_declare_func("_AmdGetRtip", cx.int_type(32), []);
    let config = LoweringConfig::from_module_metadata(&module).unwrap();
    assert_eq!(
        passes::cont::early_driver_transform(&mut module, &config),
        Err(LowerError::MissingMetadata(keys::RTIP))
    );
}

#[test]
fn driver_transform_keeps_unrelated_decls() {
    let (cx, mut module) = new_module();
    module.set_metadata(keys::RTIP, [20]);
    let config = LoweringConfig::from_module_metadata(&module).unwrap();

    let i32_type = cx.int_type(32);
    let rtip = module.get_or_declare_func("_AmdGetRtip", i32_type, []);
    module.get_or_declare_func("_cont_TraceRay", cx.void_type(), []);
    let accessor = rtcont::cont::stack::continuation_stack_offset_accessor(&mut module);
    define_func(&mut module, "raygen", i32_type, [], None, |b, entry| {
        let rtip = b.call(rtip, i32_type, []);
        b.terminate(entry, ControlInstKind::Return, [Value::DataInstOutput(rtip)], []);
    });

    assert_eq!(passes::cont::early_driver_transform(&mut module, &config), Ok(true));
    assert!(module.lookup_func("_AmdGetRtip").is_none());
    assert!(module.lookup_func("_cont_TraceRay").is_some());
    assert!(module.funcs.contains(accessor));
}
