use super::{LayoutInferer, Result};
use crate::ir::{OpId, Operation};
use crate::layout::{ImplicitDim, VectorLayout};
use crate::target::NATIVE_BITWIDTH;

use smallvec::smallvec;

impl LayoutInferer<'_> {
    pub(super) fn infer_multi_reduction(
        &mut self,
        op: OpId,
        operation: &Operation,
        reduction_dims: &[usize],
    ) -> Result<()> {
        let Some(result) = self.vector_type(operation.results[0]).cloned() else {
            return Err(self.unsupported(op, "only reductions with vector results supported"));
        };
        let (source, acc) = (operation.operands[0], operation.operands[1]);
        let acc_layout = self.layout_of(acc)?;
        check_op!(
            self,
            acc_layout.is_some_and(|l| l.is_fully_replicated()),
            op,
            "only constant accumulators supported"
        );
        check_op!(
            self,
            self.bitwidth(source) == NATIVE_BITWIDTH,
            op,
            "only 32-bit reductions supported"
        );
        let mut layout = self.vector_layout_of(op, source)?;
        let src_rank = self.vector_type(source).map_or(0, |ty| ty.rank());
        let reduced = |dim: Option<usize>| dim.is_some_and(|d| reduction_dims.contains(&d));
        let minor = src_rank.checked_sub(1);
        let second_minor = src_rank.checked_sub(2);

        // Which of the two tiled dims (sublanes, lanes) collapse.
        let reduces = match layout.implicit_dim() {
            ImplicitDim::None => [reduced(second_minor), reduced(minor)],
            ImplicitDim::SecondMinor => [false, reduced(minor)],
            ImplicitDim::Minor => [reduced(minor), false],
        };
        if reduces.contains(&true) && !layout.has_native_tiling(&self.target) {
            layout = VectorLayout::try_new(
                NATIVE_BITWIDTH,
                layout.offsets(),
                self.target.default_tiling(),
                layout.implicit_dim(),
            )
            .map_err(|e| self.layout_error(op, e))?;
        }

        let mut out_offsets = layout.offsets();
        for (offset, &r) in out_offsets.iter_mut().zip(&reduces) {
            if r {
                *offset = None;
            }
        }
        let implicit_dim = match reduces {
            [true, true] => self.reduced_to_trailing_unit(op, &result.shape)?,
            [true, false] | [false, true] if layout.implicit_dim() != ImplicitDim::None => {
                self.reduced_to_trailing_unit(op, &result.shape)?
            }
            [true, false] => ImplicitDim::SecondMinor,
            [false, true] => ImplicitDim::Minor,
            [false, false] => layout.implicit_dim(),
        };
        let out = VectorLayout::new(layout.bitwidth(), out_offsets, layout.tiling(), implicit_dim);
        self.set_layouts(op, smallvec![Some(layout), acc_layout], smallvec![Some(out)]);
        Ok(())
    }

    /// Collapsing both tiled dims is only representable as a trailing unit dim.
    fn reduced_to_trailing_unit(&self, op: OpId, result_shape: &[u32]) -> Result<ImplicitDim> {
        if result_shape.last() != Some(&1) {
            nyi!(
                self,
                op,
                "reductions over both trailing dimensions are only supported when the resulting value has a trailing axis of size 1"
            );
        }
        Ok(ImplicitDim::SecondMinor)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::InferenceError;
    use crate::common::Dtype;
    use crate::ir::{CombiningKind, FunctionBuilder, OpKind, ValueId};
    use crate::layout::VectorLayout;
    use crate::vlayout;

    fn reduce(
        b: &mut FunctionBuilder,
        source: ValueId,
        acc: ValueId,
        dims: &[usize],
        shape: &[u32],
    ) -> ValueId {
        let kind = OpKind::MultiDimReduction {
            kind: CombiningKind::Add,
            reduction_dims: dims.to_vec(),
        };
        b.op1(kind, &[source, acc], vector_type(shape, Dtype::Float32))
    }

    fn load(b: &mut FunctionBuilder, shape: &[u32]) -> ValueId {
        let memref = b.add_argument(memref_type(&[64, 256], Dtype::Float32, &[&[8, 128]]));
        let c0 = b.constant_index(0);
        b.vector_load(memref, &[c0, c0], vector_type(shape, Dtype::Float32))
    }

    #[test]
    fn test_lane_reduction_leaves_minor_implicit_dim() {
        let mut b = FunctionBuilder::new("rowsum");
        let x = load(&mut b, &[8, 256]);
        let acc = b.constant_splat(vector_type(&[8], Dtype::Float32));
        let sum = reduce(&mut b, x, acc, &[1], &[8]);
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        let op = func.defining_op(sum).unwrap();
        assert_eq!(
            ins(&annotations, op),
            vec![
                Some(vlayout!(32, (0, 0), (8, 128))),
                Some(vlayout!(32, (*, *), (8, 128), second_minor))
            ]
        );
        assert_eq!(
            outs(&annotations, op),
            vec![Some(vlayout!(32, (0, *), (8, 128), minor))]
        );
    }

    #[test]
    fn test_sublane_reduction_leaves_second_minor_implicit_dim() {
        let mut b = FunctionBuilder::new("colsum");
        let x = load(&mut b, &[8, 256]);
        let acc = b.constant_splat(vector_type(&[256], Dtype::Float32));
        let sum = reduce(&mut b, x, acc, &[0], &[256]);
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        assert_eq!(
            layout_of(&func, &annotations, sum),
            Some(vlayout!(32, (*, 0), (8, 128), second_minor))
        );
    }

    #[test]
    fn test_major_reduction_keeps_layout() {
        let mut b = FunctionBuilder::new("batchsum");
        let x = b.constant_dense(vector_type(&[4, 8, 128], Dtype::Float32));
        let acc = b.constant_splat(vector_type(&[8, 128], Dtype::Float32));
        let sum = reduce(&mut b, x, acc, &[0], &[8, 128]);
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        assert_eq!(
            layout_of(&func, &annotations, sum),
            Some(vlayout!(32, (0, 0), (8, 128)))
        );
    }

    #[test]
    fn test_full_reduction_needs_trailing_unit_dim() {
        let mut b = FunctionBuilder::new("total");
        let x = b.constant_dense(vector_type(&[1, 8, 128], Dtype::Float32));
        let acc = b.constant_splat(vector_type(&[1], Dtype::Float32));
        let sum = reduce(&mut b, x, acc, &[1, 2], &[1]);
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        assert_eq!(
            layout_of(&func, &annotations, sum),
            Some(vlayout!(32, (*, *), (8, 128), second_minor))
        );

        let mut b = FunctionBuilder::new("total");
        let x = b.constant_dense(vector_type(&[4, 8, 128], Dtype::Float32));
        let acc = b.constant_splat(vector_type(&[4], Dtype::Float32));
        reduce(&mut b, x, acc, &[1, 2], &[4]);
        b.func_return(&[]);
        let e = infer_err(b);
        assert!(matches!(e, InferenceError::NotImplemented { .. }));
        assert!(e.to_string().contains("Not implemented: reductions over both trailing dimensions"));
    }

    #[test]
    fn test_non_native_tiling_is_retiled() {
        let mut b = FunctionBuilder::new("rowsum");
        let memref = b.add_argument(memref_type(&[1, 1024], Dtype::Float32, &[&[1, 128]]));
        let c0 = b.constant_index(0);
        let row = b.vector_load(memref, &[c0, c0], vector_type(&[1, 512], Dtype::Float32));
        let acc = b.constant_splat(vector_type(&[1], Dtype::Float32));
        let sum = reduce(&mut b, row, acc, &[1], &[1]);
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        let op = func.defining_op(sum).unwrap();
        assert_eq!(ins(&annotations, op)[0], Some(vlayout!(32, (0, 0), (8, 128))));
        assert_eq!(
            outs(&annotations, op),
            vec![Some(vlayout!(32, (0, *), (8, 128), minor))]
        );
    }

    #[test]
    fn test_reduction_rejections() {
        let mut b = FunctionBuilder::new("rowsum");
        let x = load(&mut b, &[8, 256]);
        let acc = b.constant_dense(vector_type(&[8, 1], Dtype::Float32));
        let acc = b.op1(
            OpKind::AssumeLayout {
                layout: Some(VectorLayout::new(
                    32,
                    [Some(0), None],
                    [8, 128],
                    crate::layout::ImplicitDim::None,
                )),
            },
            &[acc],
            vector_type(&[8, 1], Dtype::Float32),
        );
        reduce(&mut b, x, acc, &[1], &[8, 1]);
        b.func_return(&[]);
        assert_eq!(infer_err(b).message(), "only constant accumulators supported");

        let mut b = FunctionBuilder::new("rowsum");
        let x = b.constant_splat(vector_type(&[16, 128], Dtype::Bfloat16));
        let acc = b.constant_splat(vector_type(&[16], Dtype::Bfloat16));
        let kind = OpKind::MultiDimReduction {
            kind: CombiningKind::Add,
            reduction_dims: vec![1],
        };
        b.op1(kind, &[x, acc], vector_type(&[16], Dtype::Bfloat16));
        b.func_return(&[]);
        assert_eq!(infer_err(b).message(), "only 32-bit reductions supported");
    }
}
