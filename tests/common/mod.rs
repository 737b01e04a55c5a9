// Not every test uses every helper.
#![allow(dead_code)]

use rtcont::builder::{FuncBuilder, InsertPoint};
use rtcont::print::FuncPrinter;
use rtcont::{
    Block, Context, DataInstKind, DeclDef, Func, FuncDecl, FuncDefBody, FuncParam, Module,
    ShaderStage, Type,
};
use std::rc::Rc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn new_module() -> (Rc<Context>, Module) {
    init_logging();
    let cx = Rc::new(Context::new());
    let module = Module::new(cx.clone());
    (cx, module)
}

/// Define a function with a single entry block, filled in by `build`
/// (which must also terminate it).
pub fn define_func(
    module: &mut Module,
    name: &str,
    ret_type: Type,
    params: impl IntoIterator<Item = FuncParam>,
    shader_stage: Option<ShaderStage>,
    build: impl FnOnce(&mut FuncBuilder<'_>, Block),
) -> Func {
    let cx = module.cx();
    let mut func_decl = FuncDecl {
        name: cx.intern(name),
        ret_type,
        params: params.into_iter().collect(),
        shader_stage,
        def: DeclDef::Present(FuncDefBody::new(&cx)),
    };
    let entry = func_decl.body().entry_block();
    build(
        &mut FuncBuilder::new(&cx, &mut func_decl, InsertPoint::BlockEnd(entry)),
        entry,
    );
    module.funcs.define(&cx, func_decl)
}

pub fn inst_kinds(module: &Module, func: Func) -> Vec<DataInstKind> {
    let body = module.funcs[func].body();
    body.all_data_insts()
        .map(|inst| body.data_insts[inst].kind.clone())
        .collect()
}

/// Names of all functions called by `func`, in order.
pub fn callees(module: &Module, func: Func) -> Vec<String> {
    let cx = module.cx_ref();
    inst_kinds(module, func)
        .into_iter()
        .filter_map(|kind| match kind {
            DataInstKind::FuncCall(callee) => Some(cx[module.funcs[callee].name].to_string()),
            _ => None,
        })
        .collect()
}

pub fn func_to_string(module: &Module, func: Func) -> String {
    FuncPrinter::new(module.cx_ref(), Some(module), &module.funcs[func]).func_to_string()
}
