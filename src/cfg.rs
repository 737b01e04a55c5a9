//! Control-flow graph (CFG) abstractions and utilities.

use crate::{Block, DataInst, FuncDefBody, FxIndexMap, FxIndexSet};
use smallvec::SmallVec;

/// Dominance queries between instructions of one function.
pub trait Dominance {
    /// Whether every path from the function entry to `b` passes through `a`
    /// (an instruction dominates itself).
    fn dominates(&self, a: DataInst, b: DataInst) -> bool;
}

impl FuncDefBody {
    /// All blocks reachable from the entry block, in reverse post-order (RPO).
    ///
    /// RPO iteration over a CFG provides certain guarantees, most importantly
    /// that SSA definitions are visited before any of their uses.
    pub fn rev_post_order(&self) -> impl DoubleEndedIterator<Item = Block> {
        let mut post_order = SmallVec::<[_; 8]>::new();
        self.traverse(
            self.entry_block(),
            &mut FxIndexSet::default(),
            &mut |block| post_order.push(block),
        );
        post_order.into_iter().rev()
    }

    fn traverse(
        &self,
        block: Block,
        visited: &mut FxIndexSet<Block>,
        post_order_visit: &mut impl FnMut(Block),
    ) {
        if !visited.insert(block) {
            return;
        }
        for &target in &self.blocks[block].terminator.targets {
            self.traverse(target, visited, post_order_visit);
        }
        post_order_visit(block);
    }
}

/// Dominator tree of a function body, along with the position of every
/// instruction in its block (for intra-block dominance).
///
/// Computed with the "engineered" iterative algorithm from Cooper, Harvey and
/// Kennedy's "A Simple, Fast Dominance Algorithm".
pub struct DomTree {
    /// Block → index in reverse post-order.
    rpo_idx: FxIndexMap<Block, usize>,

    /// Immediate dominator of each block, indexed by RPO index (the entry
    /// block is its own immediate dominator).
    idoms: Vec<usize>,

    /// Instruction → (containing block, index within that block).
    inst_positions: FxIndexMap<DataInst, (Block, usize)>,
}

impl DomTree {
    pub fn new(func_def_body: &FuncDefBody) -> Self {
        let rpo_idx: FxIndexMap<_, _> = func_def_body
            .rev_post_order()
            .enumerate()
            .map(|(i, block)| (block, i))
            .collect();

        let mut preds = vec![SmallVec::<[usize; 4]>::new(); rpo_idx.len()];
        for (&block, &i) in &rpo_idx {
            for target in &func_def_body.blocks[block].terminator.targets {
                if let Some(&j) = rpo_idx.get(target) {
                    preds[j].push(i);
                }
            }
        }

        const UNDEFINED: usize = usize::MAX;
        let mut idoms = vec![UNDEFINED; rpo_idx.len()];
        if !idoms.is_empty() {
            idoms[0] = 0;
        }
        let mut changed = true;
        while changed {
            changed = false;
            for b in 1..idoms.len() {
                let mut new_idom = UNDEFINED;
                for &p in &preds[b] {
                    if idoms[p] == UNDEFINED {
                        continue;
                    }
                    new_idom = if new_idom == UNDEFINED {
                        p
                    } else {
                        Self::intersect(&idoms, p, new_idom)
                    };
                }
                if idoms[b] != new_idom {
                    idoms[b] = new_idom;
                    changed = true;
                }
            }
        }

        let inst_positions = func_def_body
            .block_order
            .iter()
            .flat_map(|&block| {
                func_def_body.blocks[block]
                    .insts
                    .iter()
                    .enumerate()
                    .map(move |(i, &inst)| (inst, (block, i)))
            })
            .collect();

        Self {
            rpo_idx,
            idoms,
            inst_positions,
        }
    }

    fn intersect(idoms: &[usize], mut a: usize, mut b: usize) -> usize {
        while a != b {
            while a > b {
                a = idoms[a];
            }
            while b > a {
                b = idoms[b];
            }
        }
        a
    }

    pub fn is_reachable(&self, block: Block) -> bool {
        self.rpo_idx.contains_key(&block)
    }

    /// Whether `a` dominates `b`, at block granularity.
    pub fn block_dominates(&self, a: Block, b: Block) -> bool {
        let Some(&b_idx) = self.rpo_idx.get(&b) else {
            // Unreachable code is dominated by everything.
            return true;
        };
        let Some(&a_idx) = self.rpo_idx.get(&a) else {
            return false;
        };

        let mut cur = b_idx;
        loop {
            if cur == a_idx {
                return true;
            }
            // Dominators always have a smaller RPO index.
            if cur < a_idx || cur == 0 {
                return false;
            }
            cur = self.idoms[cur];
        }
    }
}

impl Dominance for DomTree {
    #[track_caller]
    fn dominates(&self, a: DataInst, b: DataInst) -> bool {
        let (a_block, a_idx) = self.inst_positions[&a];
        let (b_block, b_idx) = self.inst_positions[&b];
        if a_block == b_block {
            a_idx <= b_idx
        } else {
            self.block_dominates(a_block, b_block)
        }
    }
}
