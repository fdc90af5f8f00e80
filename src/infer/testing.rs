//! Helpers shared by the rule tests.

use super::{infer_layouts, InferenceError};
use crate::annotations::LayoutAnnotations;
use crate::common::{DimSize, Dtype};
use crate::ir::{Function, FunctionBuilder, OpId, Tile, Type, ValueId};
use crate::layout::Layout;
use crate::target::TargetShape;

use smallvec::SmallVec;

pub(crate) fn memref_type(shape: &[DimSize], dtype: Dtype, tiles: &[&[DimSize]]) -> Type {
    Type::memref(
        SmallVec::from_slice(shape),
        dtype,
        tiles.iter().map(|t| Tile(SmallVec::from_slice(t))).collect(),
    )
}

pub(crate) fn vector_type(shape: &[DimSize], dtype: Dtype) -> Type {
    Type::vector(SmallVec::from_slice(shape), dtype)
}

pub(crate) fn infer_ok(b: FunctionBuilder) -> (Function, LayoutAnnotations) {
    let mut func = b.finish();
    match infer_layouts(&mut func, TargetShape::default()) {
        Ok(annotations) => (func, annotations),
        Err(e) => panic!("inference of {} failed: {e}", func.name),
    }
}

pub(crate) fn infer_err(b: FunctionBuilder) -> InferenceError {
    let mut func = b.finish();
    match infer_layouts(&mut func, TargetShape::default()) {
        Ok(_) => panic!("inference of {} unexpectedly succeeded", func.name),
        Err(e) => e,
    }
}

pub(crate) fn assert_complete(func: &Function, annotations: &LayoutAnnotations) {
    let incomplete = annotations.incomplete_ops(func);
    assert!(incomplete.is_empty(), "ops without complete layouts: {incomplete:?}");
}

pub(crate) fn ins(annotations: &LayoutAnnotations, op: OpId) -> Vec<Layout> {
    annotations
        .in_layouts(op)
        .unwrap_or_else(|| panic!("{op} has no layouts"))
        .to_vec()
}

pub(crate) fn outs(annotations: &LayoutAnnotations, op: OpId) -> Vec<Layout> {
    annotations
        .out_layouts(op)
        .unwrap_or_else(|| panic!("{op} has no layouts"))
        .to_vec()
}

/// The output layout of the operation that defines `value`.
pub(crate) fn layout_of(func: &Function, annotations: &LayoutAnnotations, value: ValueId) -> Layout {
    let op = func.defining_op(value).expect("value is not an op result");
    let index = func.op(op).results.iter().position(|r| *r == value).unwrap();
    outs(annotations, op)[index]
}
