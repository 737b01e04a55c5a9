//! Textual dumps of types, values and functions, for diagnostics and logging.
//!
//! The syntax loosely follows LLVM IR, e.g.:
//! ```text
//! func @_cont_InstanceID(ptr addrspace(5), ptr addrspace(5)) -> i32
//! func @main(i32) -> void {
//!   block0:
//!     v0 = alloca i32
//!     store v0, 1:i32
//!     return
//! }
//! ```

use crate::{
    ConstKind, Context, ControlInstKind, DataInst, DataInstKind, DeclDef, Func,
    FuncDecl, FxIndexMap, Module, Type, TypeKind, Value,
};
use itertools::Itertools;
use std::fmt::Write;

pub fn type_to_string(cx: &Context, ty: Type) -> String {
    match &cx[ty] {
        TypeKind::Void => "void".into(),
        TypeKind::Int { width } => format!("i{width}"),
        TypeKind::Float { width } => format!("f{width}"),
        TypeKind::Ptr(addr_space) => match addr_space.index() {
            0 => "ptr".into(),
            idx => format!("ptr addrspace({idx})"),
        },
        &TypeKind::Vector { elem, len } => format!("<{len} x {}>", type_to_string(cx, elem)),
        &TypeKind::Array { elem, len } => format!("[{len} x {}]", type_to_string(cx, elem)),
        TypeKind::Struct { fields } => format!(
            "{{ {} }}",
            fields.iter().map(|&field| type_to_string(cx, field)).join(", ")
        ),
    }
}

pub fn const_to_string(cx: &Context, module: Option<&Module>, ct: crate::Const) -> String {
    let ct_def = &cx[ct];
    let ty = type_to_string(cx, ct_def.ty);
    match ct_def.kind {
        ConstKind::Int(_) => format!("{}:{ty}", cx.const_as_i64(ct).unwrap_or_default()),
        ConstKind::Null => format!("null:{ty}"),
        ConstKind::Poison => format!("poison:{ty}"),
        ConstKind::PtrToGlobalVar(gv) => match module.and_then(|m| m.global_vars.get(gv)) {
            Some(gv_decl) => format!("@{}", &cx[gv_decl.name]),
            None => format!("@{gv:?}"),
        },
        ConstKind::FuncAddr(func) => match module.and_then(|m| m.funcs.get(func)) {
            Some(func_decl) => format!("addr(@{}):{ty}", &cx[func_decl.name]),
            None => format!("addr(@{func:?}):{ty}"),
        },
    }
}

/// Short description of an instruction kind (e.g. `gep`, `cast.ptrtoint`).
pub fn data_inst_kind_to_string(cx: &Context, kind: &DataInstKind) -> String {
    match kind {
        DataInstKind::FuncCall(_) => "call".into(),
        &DataInstKind::Alloca(ty) => format!("alloca {}", type_to_string(cx, ty)),
        DataInstKind::Load(access) | DataInstKind::Store(access) => {
            let name = if matches!(kind, DataInstKind::Load(_)) {
                "load"
            } else {
                "store"
            };
            let mut s = String::from(name);
            if access.volatile {
                s += ".volatile";
            }
            if access.atomic {
                s += ".atomic";
            }
            s
        }
        &DataInstKind::Gep { base_type } => format!("gep {}", type_to_string(cx, base_type)),
        DataInstKind::BinOp(op) => format!("{op:?}").to_lowercase(),
        DataInstKind::Cast(op) => format!("cast.{}", format!("{op:?}").to_lowercase()),
        DataInstKind::Select => "select".into(),
        DataInstKind::ExtractValue(indices) => {
            format!("extractvalue[{}]", indices.iter().join(", "))
        }
        DataInstKind::Intrinsic(intrinsic) => format!("intrinsic.{intrinsic:?}"),
        DataInstKind::ReadBuiltIn(builtin) => format!("builtin.{builtin:?}"),
        DataInstKind::GpuRt(op) => format!("gpurt.{}", op.name()),
        DataInstKind::Rt(op) => format!("rt.{}", op.name()),
    }
}

/// Printer for one function, naming every instruction output `v{N}` (by its
/// position in layout order).
pub struct FuncPrinter<'a> {
    cx: &'a Context,
    module: Option<&'a Module>,
    func_decl: &'a FuncDecl,
    inst_names: FxIndexMap<DataInst, usize>,
}

impl<'a> FuncPrinter<'a> {
    pub fn new(cx: &'a Context, module: Option<&'a Module>, func_decl: &'a FuncDecl) -> Self {
        let inst_names = match &func_decl.def {
            DeclDef::Imported => FxIndexMap::default(),
            DeclDef::Present(body) => body
                .all_data_insts()
                .enumerate()
                .map(|(i, inst)| (inst, i))
                .collect(),
        };
        Self {
            cx,
            module,
            func_decl,
            inst_names,
        }
    }

    pub fn value_to_string(&self, v: Value) -> String {
        match v {
            Value::Const(ct) => const_to_string(self.cx, self.module, ct),
            Value::FuncParam { idx } => format!("param{idx}"),
            Value::DataInstOutput(inst) => match self.inst_names.get(&inst) {
                Some(i) => format!("v{i}"),
                None => "<erased>".into(),
            },
        }
    }

    fn func_name(&self, func: Func) -> String {
        match self.module.and_then(|m| m.funcs.get(func)) {
            Some(decl) => format!("@{}", &self.cx[decl.name]),
            None => format!("@{func:?}"),
        }
    }

    pub fn data_inst_to_string(&self, inst: DataInst) -> String {
        let cx = self.cx;
        let inst_def = &self.func_decl.body().data_insts[inst];
        let mut s = String::new();
        if inst_def.output_type.is_some() {
            let _ = write!(s, "{} = ", self.value_to_string(Value::DataInstOutput(inst)));
        }
        s += &data_inst_kind_to_string(cx, &inst_def.kind);
        if let DataInstKind::FuncCall(callee) = inst_def.kind {
            let _ = write!(s, " {}", self.func_name(callee));
        }
        if !inst_def.inputs.is_empty() {
            let _ = write!(
                s,
                " {}",
                inst_def.inputs.iter().map(|&v| self.value_to_string(v)).join(", ")
            );
        }
        if let Some(ty) = inst_def.output_type {
            if !matches!(inst_def.kind, DataInstKind::Alloca(_)) {
                let _ = write!(s, " : {}", type_to_string(cx, ty));
            }
        }
        s
    }

    fn signature_to_string(&self) -> String {
        let cx = self.cx;
        let decl = self.func_decl;
        format!(
            "func @{}({}) -> {}",
            &cx[decl.name],
            decl.params.iter().map(|param| type_to_string(cx, param.ty)).join(", "),
            type_to_string(cx, decl.ret_type)
        )
    }

    pub fn func_to_string(&self) -> String {
        let mut s = self.signature_to_string();
        let body = match &self.func_decl.def {
            DeclDef::Imported => return s,
            DeclDef::Present(body) => body,
        };

        s += " {\n";
        for (block_idx, &block) in body.block_order.iter().enumerate() {
            let _ = writeln!(s, "  block{block_idx}:");
            let block_def = &body.blocks[block];
            for &inst in &block_def.insts {
                let _ = writeln!(s, "    {}", self.data_inst_to_string(inst));
            }

            let terminator = &block_def.terminator;
            let kind = match terminator.kind {
                ControlInstKind::Unterminated => "<unterminated>",
                ControlInstKind::Branch => "br",
                ControlInstKind::CondBranch => "condbr",
                ControlInstKind::Return => "return",
                ControlInstKind::Unreachable => "unreachable",
            };
            let operands = terminator
                .inputs
                .iter()
                .map(|&v| self.value_to_string(v))
                .chain(terminator.targets.iter().map(|target| {
                    let idx = body.block_order.iter().position(|b| b == target);
                    format!("block{}", idx.map_or("?".into(), |i| i.to_string()))
                }))
                .join(", ");
            if operands.is_empty() {
                let _ = writeln!(s, "    {kind}");
            } else {
                let _ = writeln!(s, "    {kind} {operands}");
            }
        }
        s += "}";
        s
    }
}

pub fn module_to_string(module: &Module) -> String {
    let cx = module.cx_ref();
    let mut s = String::new();
    for (key, values) in &module.metadata {
        let _ = writeln!(s, "!{key} = {{{}}}", values.iter().join(", "));
    }
    for (_, gv_decl) in module.global_vars.iter() {
        let _ = write!(
            s,
            "global @{}: {} in addrspace({}), align {}",
            &cx[gv_decl.name],
            type_to_string(cx, gv_decl.ty),
            gv_decl.addr_space.index(),
            gv_decl.align
        );
        if let DeclDef::Present(def) = &gv_decl.def {
            if let Some(init) = def.initializer {
                let _ = write!(s, " = {}", const_to_string(cx, Some(module), init));
            }
        } else {
            s += " (imported)";
        }
        s += "\n";
    }
    for (_, func_decl) in module.funcs.iter() {
        let _ = writeln!(s, "{}", FuncPrinter::new(cx, Some(module), func_decl).func_to_string());
    }
    s
}
