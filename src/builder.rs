//! Instruction construction and def-use queries on function bodies.
//!
//! Uses are not stored, but recomputed from the instruction inputs when
//! needed: the transforms in this crate only ever walk the users of a handful
//! of values, and this keeps every mutation (e.g. `inputs[i] = ...`) trivially
//! consistent with the def-use view of the function.

use crate::{
    layout, AddrSpace, BinOp, Block, BlockDef, BuiltIn, CastOp, Context, ControlInst,
    ControlInstKind, DataInst, DataInstDef, DataInstKind, EntityDefs, Func, FuncDecl,
    FuncDefBody, FuncParam, Intrinsic, MemAccess, Type, TypeKind, Value,
};
use smallvec::SmallVec;

/// Instruction (or terminator) which uses some `Value` as one of its inputs.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum User {
    DataInst(DataInst),
    Terminator(Block),
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Use {
    pub user: User,
    pub input_idx: u32,
}

impl FuncDefBody {
    /// Create a body with a single (empty and unterminated) entry block.
    pub fn new(cx: &Context) -> Self {
        let mut blocks: EntityDefs<Block, BlockDef> = EntityDefs::new();
        let entry = blocks.define(cx, BlockDef::new());
        Self {
            data_insts: EntityDefs::new(),
            blocks,
            block_order: vec![entry],
            cont_frame: None,
        }
    }

    pub fn entry_block(&self) -> Block {
        self.block_order[0]
    }

    /// Append a new (empty and unterminated) block.
    pub fn new_block(&mut self, cx: &Context) -> Block {
        let block = self.blocks.define(cx, BlockDef::new());
        self.block_order.push(block);
        block
    }

    /// All instructions, in layout order.
    pub fn all_data_insts(&self) -> impl Iterator<Item = DataInst> + '_ {
        self.block_order
            .iter()
            .flat_map(move |&block| self.blocks[block].insts.iter().copied())
    }

    /// Find the block containing `inst`, and the index of `inst` within it.
    pub fn locate(&self, inst: DataInst) -> Option<(Block, usize)> {
        self.block_order.iter().find_map(|&block| {
            let idx = self.blocks[block].insts.iter().position(|&i| i == inst)?;
            Some((block, idx))
        })
    }

    #[track_caller]
    pub fn value_type(&self, cx: &Context, params: &[FuncParam], v: Value) -> Type {
        match v {
            Value::Const(ct) => cx[ct].ty,
            Value::FuncParam { idx } => params[idx as usize].ty,
            Value::DataInstOutput(inst) => self.data_insts[inst]
                .output_type
                .expect("value_type: instruction without an output used as a value"),
        }
    }

    /// All uses of `v`, in layout order.
    pub fn users_of(&self, v: Value) -> SmallVec<[Use; 4]> {
        let mut uses = SmallVec::new();
        for &block in &self.block_order {
            let block_def = &self.blocks[block];
            for &inst in &block_def.insts {
                for (input_idx, &input) in self.data_insts[inst].inputs.iter().enumerate() {
                    if input == v {
                        uses.push(Use {
                            user: User::DataInst(inst),
                            input_idx: input_idx as u32,
                        });
                    }
                }
            }
            for (input_idx, &input) in block_def.terminator.inputs.iter().enumerate() {
                if input == v {
                    uses.push(Use {
                        user: User::Terminator(block),
                        input_idx: input_idx as u32,
                    });
                }
            }
        }
        uses
    }

    pub fn has_users(&self, v: Value) -> bool {
        self.data_insts.iter().any(|(_, def)| def.inputs.contains(&v))
            || self.blocks.iter().any(|(_, def)| def.terminator.inputs.contains(&v))
    }

    /// Replace every use of `old` with `new` (types are not checked).
    pub fn replace_all_uses_with(&mut self, old: Value, new: Value) {
        if old == new {
            return;
        }
        for (_, def) in self.data_insts.iter_mut() {
            for input in &mut def.inputs {
                if *input == old {
                    *input = new;
                }
            }
        }
        for (_, def) in self.blocks.iter_mut() {
            for input in &mut def.terminator.inputs {
                if *input == old {
                    *input = new;
                }
            }
        }
    }

    /// Remove `inst` from its block, and drop its definition.
    ///
    /// The output of `inst` must no longer be used.
    #[track_caller]
    pub fn erase_data_inst(&mut self, inst: DataInst) {
        debug_assert!(
            !self.has_users(Value::DataInstOutput(inst)),
            "erase_data_inst: instruction still has users"
        );
        if let Some((block, idx)) = self.locate(inst) {
            self.blocks[block].insts.remove(idx);
        }
        self.data_insts.remove(inst);
    }
}

impl BlockDef {
    pub fn new() -> Self {
        Self {
            insts: vec![],
            terminator: ControlInst {
                kind: ControlInstKind::Unterminated,
                inputs: SmallVec::new(),
                targets: SmallVec::new(),
            },
        }
    }
}

impl Default for BlockDef {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a `FuncBuilder` places the instructions it creates.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InsertPoint {
    /// Immediately before the given instruction (every new instruction ends
    /// up right before it, i.e. in creation order).
    Before(DataInst),

    /// Immediately after the given instruction (the insert point then moves
    /// after each new instruction, to keep them in creation order).
    After(DataInst),

    /// At the start of the block (moving after each new instruction).
    BlockStart(Block),

    /// At the end of the block (before its terminator).
    BlockEnd(Block),
}

/// Instruction construction helper for one function body.
pub struct FuncBuilder<'a> {
    cx: &'a Context,
    params: &'a [FuncParam],
    body: &'a mut FuncDefBody,
    insert_point: InsertPoint,
}

impl<'a> FuncBuilder<'a> {
    #[track_caller]
    pub fn new(cx: &'a Context, func_decl: &'a mut FuncDecl, insert_point: InsertPoint) -> Self {
        let FuncDecl { params, def, .. } = func_decl;
        let body = def.as_present_mut().expect("FuncBuilder: function without a body");
        Self::from_parts(cx, params, body, insert_point)
    }

    pub fn from_parts(
        cx: &'a Context,
        params: &'a [FuncParam],
        body: &'a mut FuncDefBody,
        insert_point: InsertPoint,
    ) -> Self {
        Self {
            cx,
            params,
            body,
            insert_point,
        }
    }

    pub fn cx(&self) -> &'a Context {
        self.cx
    }

    pub fn params(&self) -> &'a [FuncParam] {
        self.params
    }

    pub fn body(&self) -> &FuncDefBody {
        self.body
    }

    pub fn body_mut(&mut self) -> &mut FuncDefBody {
        self.body
    }

    pub fn insert_point(&self) -> InsertPoint {
        self.insert_point
    }

    pub fn set_insert_point(&mut self, insert_point: InsertPoint) {
        self.insert_point = insert_point;
    }

    pub fn value_type(&self, v: Value) -> Type {
        self.body.value_type(self.cx, self.params, v)
    }

    /// Define `def` as a new instruction, placed at the current insert point.
    #[track_caller]
    pub fn insert(&mut self, def: DataInstDef) -> DataInst {
        let inst = self.body.data_insts.define(self.cx, def);
        match self.insert_point {
            InsertPoint::Before(anchor) => {
                let (block, idx) = self
                    .body
                    .locate(anchor)
                    .expect("FuncBuilder: insert point not in any block");
                self.body.blocks[block].insts.insert(idx, inst);
            }
            InsertPoint::After(anchor) => {
                let (block, idx) = self
                    .body
                    .locate(anchor)
                    .expect("FuncBuilder: insert point not in any block");
                self.body.blocks[block].insts.insert(idx + 1, inst);
                self.insert_point = InsertPoint::After(inst);
            }
            InsertPoint::BlockStart(block) => {
                self.body.blocks[block].insts.insert(0, inst);
                self.insert_point = InsertPoint::After(inst);
            }
            InsertPoint::BlockEnd(block) => {
                self.body.blocks[block].insts.push(inst);
            }
        }
        inst
    }

    fn insert_value(
        &mut self,
        kind: DataInstKind,
        output_type: Type,
        inputs: impl IntoIterator<Item = Value>,
    ) -> Value {
        Value::DataInstOutput(self.insert(DataInstDef {
            kind,
            output_type: Some(output_type),
            inputs: inputs.into_iter().collect(),
        }))
    }

    pub fn alloca(&mut self, ty: Type) -> Value {
        let ptr_type = self.cx.ptr_type(AddrSpace::Scratch);
        self.insert_value(DataInstKind::Alloca(ty), ptr_type, [])
    }

    pub fn load(&mut self, ty: Type, ptr: Value) -> Value {
        self.insert_value(DataInstKind::Load(MemAccess::SIMPLE), ty, [ptr])
    }

    pub fn store(&mut self, ptr: Value, value: Value) -> DataInst {
        self.insert(DataInstDef {
            kind: DataInstKind::Store(MemAccess::SIMPLE),
            output_type: None,
            inputs: [ptr, value].into_iter().collect(),
        })
    }

    /// Indexed address computation, producing a pointer in the same address
    /// space as `base`.
    pub fn gep(
        &mut self,
        base_type: Type,
        base: Value,
        indices: impl IntoIterator<Item = Value>,
    ) -> Value {
        let ptr_type = self.value_type(base);
        assert!(
            matches!(self.cx[ptr_type], TypeKind::Ptr(_)),
            "gep: non-pointer base"
        );
        self.insert_value(
            DataInstKind::Gep { base_type },
            ptr_type,
            [base].into_iter().chain(indices),
        )
    }

    pub fn bin_op(&mut self, op: BinOp, a: Value, b: Value) -> Value {
        let ty = self.value_type(a);
        self.insert_value(DataInstKind::BinOp(op), ty, [a, b])
    }

    pub fn cast(&mut self, op: CastOp, v: Value, to: Type) -> Value {
        self.insert_value(DataInstKind::Cast(op), to, [v])
    }

    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let ty = self.value_type(if_true);
        self.insert_value(DataInstKind::Select, ty, [cond, if_true, if_false])
    }

    #[track_caller]
    pub fn extract_value(&mut self, aggregate: Value, indices: &[u32]) -> Value {
        let aggregate_type = self.value_type(aggregate);
        let member_type = layout::member_type(self.cx, aggregate_type, indices)
            .expect("extract_value: indices out of bounds for aggregate type");
        self.insert_value(
            DataInstKind::ExtractValue(indices.iter().copied().collect()),
            member_type,
            [aggregate],
        )
    }

    /// Call `callee`, which returns `ret_type` (the call's output is only a
    /// valid `Value` if `ret_type` isn't `void`).
    pub fn call(
        &mut self,
        callee: Func,
        ret_type: Type,
        args: impl IntoIterator<Item = Value>,
    ) -> DataInst {
        let output_type = match self.cx[ret_type] {
            TypeKind::Void => None,
            _ => Some(ret_type),
        };
        self.insert(DataInstDef {
            kind: DataInstKind::FuncCall(callee),
            output_type,
            inputs: args.into_iter().collect(),
        })
    }

    pub fn intrinsic(
        &mut self,
        intrinsic: Intrinsic,
        output_type: Option<Type>,
        inputs: impl IntoIterator<Item = Value>,
    ) -> DataInst {
        self.insert(DataInstDef {
            kind: DataInstKind::Intrinsic(intrinsic),
            output_type,
            inputs: inputs.into_iter().collect(),
        })
    }

    pub fn read_builtin(&mut self, builtin: BuiltIn) -> Value {
        let i32_type = self.cx.int_type(32);
        self.insert_value(DataInstKind::ReadBuiltIn(builtin), i32_type, [])
    }

    /// Set the terminator of `block` (replacing any previous one).
    pub fn terminate(
        &mut self,
        block: Block,
        kind: ControlInstKind,
        inputs: impl IntoIterator<Item = Value>,
        targets: impl IntoIterator<Item = Block>,
    ) {
        self.body.blocks[block].terminator = ControlInst {
            kind,
            inputs: inputs.into_iter().collect(),
            targets: targets.into_iter().collect(),
        };
    }
}
