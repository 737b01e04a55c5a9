//! Continuation and traversal-stack lowering for ray-tracing shaders.
//!
//! Ray-tracing pipelines express shader-to-shader control-flow as implicit
//! calls and returns (`TraceRay`, `CallShader`, `ReportHit`, ...), which GPUs
//! without a native call stack can only execute once every shader has been
//! split into *continuations*, with all values live across a suspend point
//! spilled into a *continuation frame*.
//!
//! This crate contains the parts of that lowering which are not generic
//! compiler plumbing:
//! * [`interval`]: an interval index over byte ranges
//! * [`cont::addr_space`]: propagating an address space change through all
//!   (transitive) uses of a pointer
//! * [`cont::frame`]: store-to-load forwarding on continuation frames
//! * [`cont::stack`]: continuation stack offset/pointer computations
//! * [`gpurt`]: traversal stack and pipeline-state queries of the GPU
//!   ray-tracing runtime, lowered onto workgroup-local memory
//! * [`rt`]: abstract ray-tracing operations, remapped to runtime library calls
//!
//! The IR they operate on is deliberately minimal: SSA values defined by
//! instructions in basic blocks, with everything that can be deduplicated
//! (strings, types, constants) interned in a shared [`Context`].

// NOTE: the IR definitions live in this file, the transforms in the modules.

use smallvec::SmallVec;
use std::collections::BTreeMap;

mod context;
pub use context::{
    Block, Const, Context, DataInst, EntityDefs, Func, GlobalVar, InternInCx, InternedStr, Type,
};

pub mod builder;
pub mod cfg;
pub mod config;
pub mod cont;
mod error;
pub mod gpurt;
pub mod interval;
pub mod layout;
pub mod print;
pub mod rt;
pub mod runtime;

pub use error::LowerError;

pub mod passes {
    // NOTE: inline `mod` to avoid adding APIs here, it's just namespacing.

    pub mod cont;
    pub mod gpurt;
    pub mod rt;
}

// HACK: work around the lack of `FxIndex{Map,Set}` type aliases elsewhere.
#[doc(hidden)]
pub type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
#[doc(hidden)]
pub type FxIndexSet<V> = indexmap::IndexSet<V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

// HACK: this only serves to disallow modifying the `cx` field of `Module`.
mod sealed {
    use super::*;
    use std::rc::Rc;

    pub struct Module {
        /// Context used for everything interned, in this module.
        ///
        /// Notable choices made for this field:
        /// * private to disallow switching the context of a module
        /// * `Rc` sharing to allow multiple modules to use the same context
        ///   (`Context: !Sync` because of the interners so it can't be `Arc`)
        cx: Rc<Context>,

        /// Named module-level metadata, i.e. sideband configuration attached
        /// by the driver (see `config::LoweringConfig::from_module_metadata`).
        pub metadata: BTreeMap<String, SmallVec<[u32; 3]>>,

        pub global_vars: EntityDefs<GlobalVar, GlobalVarDecl>,
        pub funcs: EntityDefs<Func, FuncDecl>,
    }

    impl Module {
        pub fn new(cx: Rc<Context>) -> Self {
            Self {
                cx,

                metadata: BTreeMap::new(),

                global_vars: Default::default(),
                funcs: Default::default(),
            }
        }

        // FIXME: `cx_ref` might be the better default in situations where
        // the module doesn't need to be modified, figure out if that's common.
        pub fn cx(&self) -> Rc<Context> {
            self.cx.clone()
        }

        pub fn cx_ref(&self) -> &Rc<Context> {
            &self.cx
        }
    }
}
pub use sealed::Module;

impl Module {
    /// Find a function (definition or import) by name.
    pub fn lookup_func(&self, name: &str) -> Option<Func> {
        let cx = self.cx_ref();
        self.funcs.iter().find(|(_, decl)| &cx[decl.name] == name).map(|(func, _)| func)
    }

    /// Find a global variable by name.
    pub fn lookup_global_var(&self, name: &str) -> Option<GlobalVar> {
        let cx = self.cx_ref();
        self.global_vars
            .iter()
            .find(|(_, decl)| &cx[decl.name] == name)
            .map(|(gv, _)| gv)
    }

    /// Return the function named `name`, declaring it as an import (with the
    /// given signature) if it doesn't already exist.
    pub fn get_or_declare_func(
        &mut self,
        name: &str,
        ret_type: Type,
        params: impl IntoIterator<Item = FuncParam>,
    ) -> Func {
        if let Some(func) = self.lookup_func(name) {
            return func;
        }
        let cx = self.cx();
        self.funcs.define(
            &cx,
            FuncDecl {
                name: cx.intern(name),
                ret_type,
                params: params.into_iter().collect(),
                shader_stage: None,
                def: DeclDef::Imported,
            },
        )
    }

    pub fn metadata_u32s(&self, key: &str) -> Option<&[u32]> {
        self.metadata.get(key).map(|values| &values[..])
    }

    pub fn set_metadata(&mut self, key: &str, values: impl IntoIterator<Item = u32>) {
        self.metadata.insert(key.to_string(), values.into_iter().collect());
    }

    /// All functions with a body, in definition order.
    pub fn defined_funcs(&self) -> SmallVec<[Func; 8]> {
        self.funcs
            .iter()
            .filter(|(_, decl)| matches!(decl.def, DeclDef::Present(_)))
            .map(|(func, _)| func)
            .collect()
    }
}

/// Declarations (`GlobalVarDecl`, `FuncDecl`) can contain a full definition,
/// or only be an import of a definition (e.g. from the runtime library).
pub enum DeclDef<D> {
    Imported,
    Present(D),
}

impl<D> DeclDef<D> {
    pub fn as_present(&self) -> Option<&D> {
        match self {
            DeclDef::Imported => None,
            DeclDef::Present(d) => Some(d),
        }
    }

    pub fn as_present_mut(&mut self) -> Option<&mut D> {
        match self {
            DeclDef::Imported => None,
            DeclDef::Present(d) => Some(d),
        }
    }
}

/// Address spaces, numbered as on AMDGPU.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum AddrSpace {
    Flat,
    Global,
    /// Workgroup-local memory (LDS).
    Local,
    Constant,
    /// Per-thread private memory.
    Scratch,
}

impl AddrSpace {
    pub fn index(self) -> u32 {
        match self {
            AddrSpace::Flat => 0,
            AddrSpace::Global => 1,
            AddrSpace::Local => 3,
            AddrSpace::Constant => 4,
            AddrSpace::Scratch => 5,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Some(match index {
            0 => AddrSpace::Flat,
            1 => AddrSpace::Global,
            3 => AddrSpace::Local,
            4 => AddrSpace::Constant,
            5 => AddrSpace::Scratch,
            _ => return None,
        })
    }
}

/// Interned type definition (see `Type`).
//
// NOTE: pointers are opaque, i.e. only carry their address space.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Int { width: u32 },
    Float { width: u32 },
    Ptr(AddrSpace),
    Vector { elem: Type, len: u32 },
    Array { elem: Type, len: u32 },
    Struct { fields: SmallVec<[Type; 4]> },
}

impl TypeKind {
    pub fn ptr_addr_space(&self) -> Option<AddrSpace> {
        match *self {
            TypeKind::Ptr(addr_space) => Some(addr_space),
            _ => None,
        }
    }

    pub fn int_width(&self) -> Option<u32> {
        match *self {
            TypeKind::Int { width } => Some(width),
            _ => None,
        }
    }
}

/// Shorthands for common types and constants.
impl Context {
    pub fn void_type(&self) -> Type {
        self.intern(TypeKind::Void)
    }

    pub fn int_type(&self, width: u32) -> Type {
        self.intern(TypeKind::Int { width })
    }

    pub fn ptr_type(&self, addr_space: AddrSpace) -> Type {
        self.intern(TypeKind::Ptr(addr_space))
    }

    pub fn struct_type(&self, fields: impl IntoIterator<Item = Type>) -> Type {
        self.intern(TypeKind::Struct {
            fields: fields.into_iter().collect(),
        })
    }

    pub fn array_type(&self, elem: Type, len: u32) -> Type {
        self.intern(TypeKind::Array { elem, len })
    }

    pub fn vector_type(&self, elem: Type, len: u32) -> Type {
        self.intern(TypeKind::Vector { elem, len })
    }

    /// Integer constant of type `ty`, truncated to the bit-width of `ty`.
    #[track_caller]
    pub fn const_int(&self, ty: Type, value: u64) -> Const {
        let width = self[ty].int_width().expect("const_int: non-integer type");
        let bits = if width >= 64 { value } else { value & ((1 << width) - 1) };
        self.intern(ConstDef {
            ty,
            kind: ConstKind::Int(bits),
        })
    }

    pub fn const_u32(&self, value: u32) -> Const {
        self.const_int(self.int_type(32), value.into())
    }

    pub fn const_bool(&self, value: bool) -> Const {
        self.const_int(self.int_type(1), value.into())
    }

    pub fn const_poison(&self, ty: Type) -> Const {
        self.intern(ConstDef {
            ty,
            kind: ConstKind::Poison,
        })
    }

    pub fn const_ptr_to_global_var(&self, ty: Type, gv: GlobalVar) -> Const {
        self.intern(ConstDef {
            ty,
            kind: ConstKind::PtrToGlobalVar(gv),
        })
    }

    pub fn const_func_addr(&self, ty: Type, func: Func) -> Const {
        self.intern(ConstDef {
            ty,
            kind: ConstKind::FuncAddr(func),
        })
    }

    /// The value of an integer constant, sign-extended from its bit-width.
    pub fn const_as_i64(&self, ct: Const) -> Option<i64> {
        let ct_def = &self[ct];
        match ct_def.kind {
            ConstKind::Int(bits) => {
                let width = self[ct_def.ty].int_width()?;
                Some(if width >= 64 {
                    bits as i64
                } else {
                    let shift = 64 - width;
                    ((bits << shift) as i64) >> shift
                })
            }
            _ => None,
        }
    }
}

#[derive(PartialEq, Eq, Hash)]
pub struct ConstDef {
    pub ty: Type,
    pub kind: ConstKind,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ConstKind {
    /// Zero-extended bits of an integer constant.
    Int(u64),
    Null,
    Poison,
    PtrToGlobalVar(GlobalVar),
    /// Address of a function, as an integer (e.g. a continuation return address).
    FuncAddr(Func),
}

pub struct GlobalVarDecl {
    pub name: InternedStr,

    /// The type of the value stored in the global variable (its address is
    /// always a pointer in `addr_space`).
    pub ty: Type,

    /// The address space the global variable will be allocated into.
    pub addr_space: AddrSpace,

    pub align: u32,

    pub def: DeclDef<GlobalVarDefBody>,
}

pub struct GlobalVarDefBody {
    /// If `Some`, the global variable will start out with the specified value.
    pub initializer: Option<Const>,
}

/// Shader kinds, as seen by the ray-tracing pipeline.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ShaderStage {
    Pixel,
    Vertex,
    Geometry,
    Hull,
    Domain,
    Compute,
    Library,
    RayGeneration,
    Intersection,
    AnyHit,
    ClosestHit,
    Miss,
    Callable,
    Mesh,
    Amplification,
    Node,
}

impl ShaderStage {
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Pixel => "pixel",
            ShaderStage::Vertex => "vertex",
            ShaderStage::Geometry => "geometry",
            ShaderStage::Hull => "hull",
            ShaderStage::Domain => "domain",
            ShaderStage::Compute => "compute",
            ShaderStage::Library => "library",
            ShaderStage::RayGeneration => "raygeneration",
            ShaderStage::Intersection => "intersection",
            ShaderStage::AnyHit => "anyhit",
            ShaderStage::ClosestHit => "closesthit",
            ShaderStage::Miss => "miss",
            ShaderStage::Callable => "callable",
            ShaderStage::Mesh => "mesh",
            ShaderStage::Amplification => "amplification",
            ShaderStage::Node => "node",
        }
    }
}

pub struct FuncDecl {
    pub name: InternedStr,

    pub ret_type: Type,

    pub params: SmallVec<[FuncParam; 2]>,

    /// The ray-tracing (or graphics/compute) stage this function belongs to,
    /// if known (imports never have one).
    pub shader_stage: Option<ShaderStage>,

    pub def: DeclDef<FuncDefBody>,
}

impl FuncDecl {
    #[track_caller]
    pub fn body(&self) -> &FuncDefBody {
        self.def.as_present().expect("function declaration without a body")
    }

    #[track_caller]
    pub fn body_mut(&mut self) -> &mut FuncDefBody {
        self.def.as_present_mut().expect("function declaration without a body")
    }

    /// The type of `v`, when used inside this function.
    #[track_caller]
    pub fn value_type(&self, cx: &Context, v: Value) -> Type {
        self.body().value_type(cx, &self.params, v)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FuncParam {
    pub ty: Type,

    /// For pointer parameters, the type of the value being pointed to, if the
    /// callee relies on it (e.g. runtime functions taking "system data").
    pub pointee: Option<Type>,
}

impl FuncParam {
    pub fn new(ty: Type) -> Self {
        Self { ty, pointee: None }
    }

    pub fn ptr_to(ty: Type, pointee: Type) -> Self {
        Self {
            ty,
            pointee: Some(pointee),
        }
    }
}

pub struct FuncDefBody {
    pub data_insts: EntityDefs<DataInst, DataInstDef>,
    pub blocks: EntityDefs<Block, BlockDef>,

    /// All blocks, in layout order, starting with the entry block.
    pub block_order: Vec<Block>,

    /// The continuation frame of this function, attached when the function
    /// was split at its suspend points.
    pub cont_frame: Option<cont::ContFrame>,
}

pub struct BlockDef {
    pub insts: Vec<DataInst>,
    pub terminator: ControlInst,
}

/// Instruction ending a `Block`, transferring control to other `Block`s
/// (or out of the function).
pub struct ControlInst {
    pub kind: ControlInstKind,

    pub inputs: SmallVec<[Value; 2]>,

    pub targets: SmallVec<[Block; 2]>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ControlInstKind {
    /// Not yet terminated (only valid while a `Block` is being built).
    Unterminated,

    /// Unconditional branch to `targets[0]`.
    Branch,

    /// Branch to `targets[0]` if `inputs[0]` is `true`, `targets[1]` otherwise.
    CondBranch,

    /// Leave the function, with `inputs` (empty or a single value) returned.
    Return,

    Unreachable,
}

pub struct DataInstDef {
    pub kind: DataInstKind,

    /// The type of the value this instruction produces, if any.
    pub output_type: Option<Type>,

    // FIXME: change the inline size of this to fit most instructions.
    pub inputs: SmallVec<[Value; 2]>,
}

#[derive(Clone, PartialEq, Eq)]
pub enum DataInstKind {
    FuncCall(Func),

    /// Function-local (scratch) memory for one value of the given type.
    Alloca(Type),

    /// Read one value of type `output_type` from `inputs[0]`.
    Load(MemAccess),

    /// Write `inputs[1]` to `inputs[0]`.
    Store(MemAccess),

    /// Indexed address computation, on `inputs[0]` (interpreted as pointing
    /// to a `base_type`) with the indices `inputs[1..]` (see `layout`).
    Gep { base_type: Type },

    BinOp(BinOp),

    /// Convert `inputs[0]` to `output_type`.
    Cast(CastOp),

    /// `inputs[0] ? inputs[1] : inputs[2]`.
    Select,

    /// Extract a (nested) member from the aggregate `inputs[0]`.
    ExtractValue(SmallVec<[u32; 2]>),

    Intrinsic(Intrinsic),

    ReadBuiltIn(BuiltIn),

    /// Traversal stack / pipeline state query of the GPU ray-tracing runtime.
    GpuRt(gpurt::GpuRtOp),

    /// Abstract ray-tracing operation (e.g. `TraceRay`, `InstanceID`).
    Rt(rt::RtOp),
}

/// Access flags for `Load`/`Store` (both being unset makes the access "simple").
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct MemAccess {
    pub volatile: bool,
    pub atomic: bool,
}

impl MemAccess {
    pub const SIMPLE: Self = Self {
        volatile: false,
        atomic: false,
    };

    pub fn is_simple(self) -> bool {
        !self.volatile && !self.atomic
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CastOp {
    ZExt,
    SExt,
    Trunc,
    PtrToInt,
    IntToPtr,
    BitCast,
    AddrSpaceCast,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Intrinsic {
    /// `inputs`: `[size: i64, ptr]`.
    LifetimeStart,
    /// `inputs`: `[size: i64, ptr]`.
    LifetimeEnd,

    /// Hardware BVH traversal stack push/pop (`ds_bvh_stack_rtn`), with
    /// `inputs`: `[stack_addr: i32, last_visited: i32, data: <4 x i32>,
    /// offset: i32 (immediate)]`, producing `{ i32 result, i32 new_stack_addr }`.
    BvhStackRtn,
}

impl Intrinsic {
    pub fn is_lifetime_marker(self) -> bool {
        matches!(self, Intrinsic::LifetimeStart | Intrinsic::LifetimeEnd)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BuiltIn {
    SubgroupLocalInvocationId,
    LocalInvocationIndex,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Value {
    Const(Const),
    FuncParam { idx: u32 },
    DataInstOutput(DataInst),
}

impl From<Const> for Value {
    fn from(ct: Const) -> Self {
        Value::Const(ct)
    }
}

impl From<DataInst> for Value {
    fn from(inst: DataInst) -> Self {
        Value::DataInstOutput(inst)
    }
}
