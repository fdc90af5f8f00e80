use crate::ir::{Function, OpId, ValueId};
use crate::layout::Layout;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type LayoutList = SmallVec<[Layout; 4]>;

/// The layouts chosen for one operation's operands and results.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct OpLayouts {
    pub ins: LayoutList,
    pub outs: LayoutList,
}

/// The result of layout inference: a side table from operations to their layouts.
///
/// Entries are kept in the order operations were first annotated, which is the order the
/// analysis visited them.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct LayoutAnnotations {
    ops: IndexMap<OpId, OpLayouts>,
    /// Layouts asserted for loop-carried block arguments, with the marker that asserts each.
    arg_bindings: IndexMap<ValueId, (Layout, OpId)>,
}

impl LayoutAnnotations {
    pub fn new() -> Self {
        LayoutAnnotations::default()
    }

    pub fn get(&self, op: OpId) -> Option<&OpLayouts> {
        self.ops.get(&op)
    }

    pub fn is_annotated(&self, op: OpId) -> bool {
        self.ops.contains_key(&op)
    }

    pub fn in_layouts(&self, op: OpId) -> Option<&[Layout]> {
        self.ops.get(&op).map(|l| l.ins.as_slice())
    }

    pub fn out_layouts(&self, op: OpId) -> Option<&[Layout]> {
        self.ops.get(&op).map(|l| l.outs.as_slice())
    }

    pub fn set(&mut self, op: OpId, ins: LayoutList, outs: LayoutList) {
        self.ops.insert(op, OpLayouts { ins, outs });
    }

    /// Replaces the input layouts of `op`, keeping any output layouts.
    pub fn set_ins(&mut self, op: OpId, ins: LayoutList) {
        self.ops.entry(op).or_default().ins = ins;
    }

    pub fn set_outs(&mut self, op: OpId, outs: LayoutList) {
        self.ops.entry(op).or_default().outs = outs;
    }

    pub fn bind_arg(&mut self, arg: ValueId, layout: Layout, marker: OpId) {
        self.arg_bindings.insert(arg, (layout, marker));
    }

    /// The layout asserted for a block argument, if a marker was placed on it.
    pub fn arg_layout(&self, arg: ValueId) -> Option<Layout> {
        self.arg_bindings.get(&arg).map(|(l, _)| *l)
    }

    pub fn arg_marker(&self, arg: ValueId) -> Option<OpId> {
        self.arg_bindings.get(&arg).map(|(_, m)| *m)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OpId, &OpLayouts)> {
        self.ops.iter().map(|(op, l)| (*op, l))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The operations of `func` that lack an entry or whose layout counts disagree with their
    /// operand and result counts.
    pub fn incomplete_ops(&self, func: &Function) -> Vec<OpId> {
        func.op_ids()
            .filter(|&op| match self.get(op) {
                Some(l) => {
                    l.ins.len() != func.op(op).operands.len()
                        || l.outs.len() != func.op(op).results.len()
                }
                None => true,
            })
            .collect()
    }
}
