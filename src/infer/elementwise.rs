use super::{LayoutInferer, Result};
use crate::annotations::LayoutList;
use crate::common::Bitwidth;
use crate::ir::{OpId, Operation, Type};
use crate::layout::{Layout, VectorLayout};
use crate::target::NATIVE_BITWIDTH;

use log::debug;
use smallvec::smallvec;

impl LayoutInferer<'_> {
    /// The generic rule for operations that apply the same function to every element.
    ///
    /// Operands that are not fully replicated vote on the result layout by joining. Replicated
    /// operands and operands that conflict with the consensus are read in the result layout.
    pub(super) fn infer_elementwise(
        &mut self,
        op: OpId,
        operation: &Operation,
        check_bitwidth: bool,
    ) -> Result<()> {
        // `None` entries are filled in with the final output layout.
        let mut in_layouts: Vec<Option<Layout>> = Vec::with_capacity(operation.operands.len());
        let mut out_layout: Option<VectorLayout> = None;
        let mut out_candidate: Option<VectorLayout> = None;
        let mut bitwidth: Option<Bitwidth> = None;
        for &operand in &operation.operands {
            match self.value_type(operand) {
                Type::Vector(ty) => {
                    let operand_bitwidth = ty.bitwidth();
                    let expected = *bitwidth.get_or_insert(operand_bitwidth);
                    check_op!(
                        self,
                        !check_bitwidth || expected == operand_bitwidth,
                        op,
                        "Generic elementwise rule only supports operands of same width"
                    );
                    let layout = self.vector_layout_of(op, operand)?;
                    if layout.is_fully_replicated() {
                        in_layouts.push(None);
                        out_candidate = Some(layout);
                        continue;
                    }
                    match out_layout {
                        None => {
                            out_layout = Some(layout);
                            in_layouts.push(Some(Some(layout)));
                        }
                        Some(current) => match layout.join(&current) {
                            Some(joined) => {
                                out_layout = Some(joined);
                                in_layouts.push(Some(Some(layout)));
                            }
                            None => {
                                // The conflicting operand may not be replicable, so the result
                                // cannot stay replicated either.
                                let concrete = current.concretized();
                                debug!(
                                    "{}: {layout} conflicts with {current}, using {concrete}",
                                    self.op_ref(op)
                                );
                                out_layout = Some(concrete);
                                in_layouts.push(None);
                            }
                        },
                    }
                }
                Type::Scalar(_) => in_layouts.push(Some(None)),
                Type::MemRef(_) => {
                    return Err(self.unsupported(op, "expected only vector and scalar operands"))
                }
            }
        }

        let result = operation.results[0];
        let final_out: Layout = match self.vector_type(result) {
            Some(out_ty) => {
                check_op!(
                    self,
                    !check_bitwidth || bitwidth == Some(out_ty.bitwidth()),
                    op,
                    "Generic elementwise rule can't change element type width"
                );
                match out_layout.or(out_candidate) {
                    Some(layout) => Some(layout),
                    None => {
                        return Err(self.unsupported(
                            op,
                            "Elementwise op has no vector operands but returns a vector?",
                        ))
                    }
                }
            }
            None => None,
        };
        let ins: LayoutList = in_layouts
            .into_iter()
            .map(|l| l.unwrap_or(final_out))
            .collect();
        self.set_layouts(op, ins, smallvec![final_out]);
        Ok(())
    }

    /// Checks that either all or none of `values` are vectors, and that vectors are 32-bit.
    fn check_vector_sides(
        &self,
        op: OpId,
        values: &[crate::ir::ValueId],
        mixed_message: &str,
        width_message: &str,
    ) -> Result<()> {
        let vectors = values
            .iter()
            .filter(|&&v| self.value_type(v).is_vector())
            .count();
        check_op!(
            self,
            vectors == 0 || vectors == values.len(),
            op,
            "{mixed_message}"
        );
        if vectors > 0 {
            check_op!(
                self,
                values.iter().all(|&v| self.bitwidth(v) == NATIVE_BITWIDTH),
                op,
                "{width_message}"
            );
        }
        Ok(())
    }

    pub(super) fn infer_select(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        self.check_vector_sides(
            op,
            &operation.operands[1..],
            "Only one side of arith is a vector?",
            "Only 32-bit select supported",
        )?;
        self.infer_elementwise(op, operation, false)
    }

    pub(super) fn infer_cmp(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        self.check_vector_sides(
            op,
            &operation.operands,
            "Only one side of cmp is a vector?",
            "Only 32-bit cmp supported",
        )?;
        self.infer_elementwise(op, operation, false)
    }

    pub(super) fn infer_extui(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let (input, output) = (operation.operands[0], operation.results[0]);
        let in_vector = self.value_type(input).is_vector();
        check_op!(
            self,
            in_vector == self.value_type(output).is_vector(),
            op,
            "Input and output are not both vectors?"
        );
        if in_vector {
            check_op!(
                self,
                self.bitwidth(input) == 1 && self.bitwidth(output) == NATIVE_BITWIDTH,
                op,
                "Only 1 bit -> 32 bit extensison supported"
            );
        }
        self.infer_elementwise(op, operation, false)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::common::Dtype;
    use crate::ir::{ArithOp, FunctionBuilder, OpKind, Type, ValueId};
    use crate::vlayout;

    fn f32_vector() -> Type {
        vector_type(&[8, 128], Dtype::Float32)
    }

    fn load_at(b: &mut FunctionBuilder, memref: ValueId, row: i64) -> ValueId {
        let r = b.constant_index(row);
        let c0 = b.constant_index(0);
        b.vector_load(memref, &[r, c0], f32_vector())
    }

    #[test]
    fn test_replicated_operands_take_the_consensus_layout() {
        let mut b = FunctionBuilder::new("add");
        let memref = b.add_argument(memref_type(&[16, 128], Dtype::Float32, &[&[8, 128]]));
        let splat = b.constant_splat(f32_vector());
        let loaded = load_at(&mut b, memref, 0);
        let sum = b.arith(ArithOp::AddF, &[splat, loaded]);
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        let add = func.defining_op(sum).unwrap();
        let expected = Some(vlayout!(32, (0, 0), (8, 128)));
        assert_eq!(ins(&annotations, add), vec![expected, expected]);
        assert_eq!(outs(&annotations, add), vec![expected]);
    }

    #[test]
    fn test_all_replicated_operands_stay_replicated() {
        let mut b = FunctionBuilder::new("add");
        let x = b.constant_splat(f32_vector());
        let y = b.constant_splat(f32_vector());
        let sum = b.arith(ArithOp::MulF, &[x, y]);
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        assert_eq!(
            layout_of(&func, &annotations, sum),
            Some(vlayout!(32, (*, *), (8, 128)))
        );
    }

    #[test]
    fn test_partially_replicated_operands_join() {
        let mut b = FunctionBuilder::new("add");
        let i32_vector = vector_type(&[8, 128], Dtype::Sint32);
        let rows = b.op1(OpKind::Iota { dimension: Some(0) }, &[], i32_vector.clone());
        let cols = b.op1(OpKind::Iota { dimension: Some(1) }, &[], i32_vector);
        let sum = b.arith(ArithOp::AddI, &[rows, cols]);
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        let add = func.defining_op(sum).unwrap();
        assert_eq!(
            ins(&annotations, add),
            vec![
                Some(vlayout!(32, (0, *), (8, 128))),
                Some(vlayout!(32, (*, 0), (8, 128)))
            ]
        );
        assert_eq!(outs(&annotations, add), vec![Some(vlayout!(32, (0, 0), (8, 128)))]);
    }

    #[test]
    fn test_conflicting_operand_is_read_in_concretized_layout() {
        let mut b = FunctionBuilder::new("add");
        let memref = b.add_argument(memref_type(&[16, 128], Dtype::Float32, &[&[8, 128]]));
        let first = load_at(&mut b, memref, 0);
        let second = load_at(&mut b, memref, 3);
        let sum = b.arith(ArithOp::AddF, &[first, second]);
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        let add = func.defining_op(sum).unwrap();
        let expected = Some(vlayout!(32, (0, 0), (8, 128)));
        assert_eq!(ins(&annotations, add), vec![expected, expected]);
        assert_eq!(outs(&annotations, add), vec![expected]);
    }

    #[test]
    fn test_scalar_operands_get_no_layout() {
        let mut b = FunctionBuilder::new("scale");
        let s = b.add_argument(Type::Scalar(Dtype::Float32));
        let v = b.constant_splat(f32_vector());
        let product = b.op1(OpKind::Arith(ArithOp::MulF), &[v, s], f32_vector());
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        let mul = func.defining_op(product).unwrap();
        let layout = Some(vlayout!(32, (*, *), (8, 128)));
        assert_eq!(ins(&annotations, mul), vec![layout, None]);
    }

    #[test]
    fn test_mixed_widths_are_rejected() {
        let mut b = FunctionBuilder::new("add");
        let x = b.constant_splat(f32_vector());
        let y = b.constant_splat(vector_type(&[8, 128], Dtype::Bfloat16));
        b.op1(OpKind::Arith(ArithOp::AddF), &[x, y], f32_vector());
        b.func_return(&[]);
        assert_eq!(
            infer_err(b).message(),
            "Generic elementwise rule only supports operands of same width"
        );
    }

    #[test]
    fn test_vector_result_needs_a_vector_operand() {
        let mut b = FunctionBuilder::new("add");
        let s = b.add_argument(Type::Scalar(Dtype::Float32));
        b.op1(OpKind::Arith(ArithOp::AddF), &[s, s], f32_vector());
        b.func_return(&[]);
        assert_eq!(
            infer_err(b).message(),
            "Elementwise op has no vector operands but returns a vector?"
        );
    }

    #[test]
    fn test_select_and_compare_checks() {
        let mut b = FunctionBuilder::new("select");
        let mask_ty = vector_type(&[8, 128], Dtype::Bool);
        let x = b.constant_splat(f32_vector());
        let y = b.constant_splat(f32_vector());
        let mask = b.op1(OpKind::CmpF, &[x, y], mask_ty);
        let picked = b.op1(OpKind::Select, &[mask, x, y], f32_vector());
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        assert_complete(&func, &annotations);
        assert_eq!(
            layout_of(&func, &annotations, picked),
            Some(vlayout!(32, (*, *), (8, 128)))
        );

        let mut b = FunctionBuilder::new("cmp");
        let x = b.constant_splat(vector_type(&[16, 128], Dtype::Bfloat16));
        b.op1(OpKind::CmpF, &[x, x], vector_type(&[16, 128], Dtype::Bool));
        b.func_return(&[]);
        assert_eq!(infer_err(b).message(), "Only 32-bit cmp supported");

        let mut b = FunctionBuilder::new("select");
        let c = b.add_argument(Type::Scalar(Dtype::Bool));
        let x = b.constant_splat(f32_vector());
        let s = b.add_argument(Type::Scalar(Dtype::Float32));
        b.op1(OpKind::Select, &[c, x, s], f32_vector());
        b.func_return(&[]);
        assert_eq!(infer_err(b).message(), "Only one side of arith is a vector?");
    }

    #[test]
    fn test_extui_requires_bool_to_i32() {
        let mut b = FunctionBuilder::new("extui");
        let mask = b.constant_splat(vector_type(&[8, 128], Dtype::Bool));
        let wide = b.op1(OpKind::ExtUI, &[mask], vector_type(&[8, 128], Dtype::Sint32));
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        assert_eq!(
            layout_of(&func, &annotations, wide),
            Some(vlayout!(1, (*, *), (256, 128)))
        );

        let mut b = FunctionBuilder::new("extui");
        let narrow = b.constant_splat(vector_type(&[16, 128], Dtype::Sint16));
        b.op1(OpKind::ExtUI, &[narrow], vector_type(&[16, 128], Dtype::Sint32));
        b.func_return(&[]);
        assert_eq!(
            infer_err(b).message(),
            "Only 1 bit -> 32 bit extensison supported"
        );
    }
}
