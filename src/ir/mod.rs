//! A small arena-based IR: functions made of operations, single-block regions, and SSA values.
//!
//! Every entity is addressed by a dense integer id into its [Function]'s arenas, so the layout
//! analysis can key side tables by id without holding references into the IR.

mod builder;
mod ops;
mod types;

pub use builder::FunctionBuilder;
pub use ops::{Arity, ArithOp, CombiningKind, ConstantValue, IndexingMap, IteratorType, OpKind};
pub use types::{MemRefType, Tile, Type, VectorType};

use crate::layout::Layout;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct OpId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct BlockId(pub u32);

/// Where an SSA value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ValueDef {
    OpResult { op: OpId, index: usize },
    BlockArg { block: BlockId, index: usize },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ValueData {
    pub ty: Type,
    pub def: ValueDef,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Region {
    pub blocks: Vec<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Block {
    pub args: Vec<ValueId>,
    /// Operations in program order. The last one is the block's terminator.
    pub ops: Vec<OpId>,
    pub parent_op: Option<OpId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Operation {
    pub kind: OpKind,
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    pub regions: Vec<Region>,
}

/// A function: an arena of operations, values, and blocks, plus a body region.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Function {
    pub name: String,
    pub body: Region,
    ops: Vec<Operation>,
    values: Vec<ValueData>,
    blocks: Vec<Block>,
}

impl Operation {
    pub fn name(&self) -> &str {
        self.kind.name()
    }
}

impl Region {
    /// The region's block if it has exactly one.
    pub fn single_block(&self) -> Option<BlockId> {
        match self.blocks.as_slice() {
            [block] => Some(*block),
            _ => None,
        }
    }
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        let mut func = Function {
            name: name.into(),
            body: Region::default(),
            ops: vec![],
            values: vec![],
            blocks: vec![],
        };
        let entry = func.create_block(&[]);
        func.body.blocks.push(entry);
        func
    }

    pub fn op(&self, op: OpId) -> &Operation {
        &self.ops[op.0 as usize]
    }

    pub fn value(&self, value: ValueId) -> &ValueData {
        &self.values[value.0 as usize]
    }

    pub fn value_type(&self, value: ValueId) -> &Type {
        &self.value(value).ty
    }

    pub fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block.0 as usize]
    }

    pub(crate) fn block_mut(&mut self, block: BlockId) -> &mut Block {
        &mut self.blocks[block.0 as usize]
    }

    /// The first block of the body region.
    pub fn entry_block(&self) -> BlockId {
        self.body.blocks[0]
    }

    pub fn arguments(&self) -> &[ValueId] {
        &self.block(self.entry_block()).args
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// All operations ids, including ones nested inside regions, in creation order.
    pub fn op_ids(&self) -> impl Iterator<Item = OpId> + '_ {
        (0..self.ops.len()).map(|i| OpId(i as u32))
    }

    /// The operation that defines `value`, if it is an operation result.
    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.value(value).def {
            ValueDef::OpResult { op, .. } => Some(op),
            ValueDef::BlockArg { .. } => None,
        }
    }

    /// Every `(op, operand index)` that reads `value`.
    pub fn uses(&self, value: ValueId) -> Vec<(OpId, usize)> {
        self.op_ids()
            .flat_map(|op| {
                self.op(op)
                    .operands
                    .iter()
                    .enumerate()
                    .filter(move |(_, v)| **v == value)
                    .map(move |(i, _)| (op, i))
            })
            .collect()
    }

    pub fn users(&self, value: ValueId) -> Vec<OpId> {
        let mut users = self.uses(value).into_iter().map(|(op, _)| op).collect::<Vec<_>>();
        users.dedup();
        users
    }

    pub fn create_block(&mut self, arg_types: &[Type]) -> BlockId {
        let block = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::default());
        let args = arg_types
            .iter()
            .enumerate()
            .map(|(index, ty)| self.new_value(ty.clone(), ValueDef::BlockArg { block, index }))
            .collect();
        self.block_mut(block).args = args;
        block
    }

    pub(crate) fn add_block_arg(&mut self, block: BlockId, ty: Type) -> ValueId {
        let index = self.block(block).args.len();
        let value = self.new_value(ty, ValueDef::BlockArg { block, index });
        self.block_mut(block).args.push(value);
        value
    }

    fn new_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let value = ValueId(self.values.len() as u32);
        self.values.push(ValueData { ty, def });
        value
    }

    /// Creates an operation without inserting it into a block.
    pub(crate) fn create_op(
        &mut self,
        kind: OpKind,
        operands: &[ValueId],
        result_types: &[Type],
        regions: Vec<Region>,
    ) -> OpId {
        let op = OpId(self.ops.len() as u32);
        let results = result_types
            .iter()
            .enumerate()
            .map(|(index, ty)| self.new_value(ty.clone(), ValueDef::OpResult { op, index }))
            .collect();
        for region in &regions {
            for &block in &region.blocks {
                self.block_mut(block).parent_op = Some(op);
            }
        }
        self.ops.push(Operation {
            kind,
            operands: operands.to_vec(),
            results,
            regions,
        });
        op
    }

    pub(crate) fn insert_op(&mut self, block: BlockId, position: usize, op: OpId) {
        self.block_mut(block).ops.insert(position, op);
    }

    /// Inserts a `tpu.assume_layout` at `position` in the argument's block and routes every
    /// other use of the argument through it. Returns the marker.
    pub fn insert_assume_layout(&mut self, arg: ValueId, layout: Layout, position: usize) -> OpId {
        let ValueDef::BlockArg { block, .. } = self.value(arg).def else {
            panic!("assume_layout markers are only placed on block arguments");
        };
        let ty = self.value_type(arg).clone();
        let marker = self.create_op(OpKind::AssumeLayout { layout }, &[arg], &[ty], vec![]);
        self.insert_op(block, position, marker);
        let replacement = self.op(marker).results[0];
        for (user, operand_idx) in self.uses(arg) {
            if user != marker {
                self.ops[user.0 as usize].operands[operand_idx] = replacement;
            }
        }
        marker
    }

    /// Follows the value back through `tpu.erase_memref_layout` to a memref that still has its
    /// tiled layout.
    pub fn memref_with_layout(&self, mut value: ValueId) -> Option<&MemRefType> {
        loop {
            match self.defining_op(value).map(|op| self.op(op)) {
                Some(op) if op.kind == OpKind::EraseLayout => value = op.operands[0],
                _ => break,
            }
        }
        self.value_type(value).as_memref()
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}
