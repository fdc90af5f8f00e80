use super::{LayoutInferer, Result};
use crate::ir::{OpId, OpKind, Operation, ValueId};
use crate::layout::{ImplicitDim, VectorLayout};
use crate::target::NATIVE_BITWIDTH;

use smallvec::smallvec;

impl LayoutInferer<'_> {
    /// Whether every consumer of `value` wants its operands in native tiling.
    ///
    /// Matmuls do, and so do transposes that swap the two minor dims. A value with no users
    /// trivially qualifies.
    fn all_users_require_native_tiling(&self, value: ValueId) -> bool {
        self.func.users(value).into_iter().all(|user| {
            match &self.func.op(user).kind {
                kind if kind.is_matmul_like() => true,
                OpKind::Transpose { permutation } => {
                    let rank = permutation.len();
                    rank >= 2
                        && permutation[rank - 1] == rank - 2
                        && permutation[rank - 2] == rank - 1
                }
                _ => false,
            }
        })
    }

    /// Checks the shared structure of extensions and truncations. Returns `false` if the op
    /// works on scalars, in which case it has already been annotated.
    fn check_cast_structure(&mut self, op: OpId, operation: &Operation) -> Result<bool> {
        if self.vector_type(operation.operands[0]).is_none() {
            self.set_layouts(op, smallvec![None], smallvec![None]);
            return Ok(false);
        }
        check_op!(
            self,
            self.vector_type(operation.results[0]).is_some(),
            op,
            "Input and output are not both vectors?"
        );
        Ok(true)
    }

    pub(super) fn infer_ext(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        if !self.check_cast_structure(op, operation)? {
            return Ok(());
        }
        let (src, dst) = (operation.operands[0], operation.results[0]);
        let layout = self.vector_layout_of(op, src)?;
        if operation.kind == OpKind::ExtF {
            check_op!(
                self,
                self.bitwidth(src) == 16 && self.bitwidth(dst) == NATIVE_BITWIDTH,
                op,
                "Only 16-bit to 32-bit extensions supported"
            );
        } else {
            check_op!(
                self,
                self.bitwidth(dst) == NATIVE_BITWIDTH,
                op,
                "Only extensions to 32-bit supported"
            );
        }

        let default_tiling = self.target.default_tiling();
        let (src_layout, dst_layout) = match layout.implicit_dim() {
            ImplicitDim::None => {
                // Tilings that evenly split the rows of the default tiling pass through
                // unchanged. Anything else is first retiled to the default.
                let tiling = layout.tiling();
                let src_layout =
                    if default_tiling[0] % tiling[0] == 0 && default_tiling[1] == tiling[1] {
                        layout
                    } else {
                        layout
                            .retile(default_tiling)
                            .map_err(|e| self.layout_error(op, e))?
                    };
                let dst_layout = VectorLayout::try_new(
                    NATIVE_BITWIDTH,
                    layout.offsets(),
                    src_layout.tiling(),
                    ImplicitDim::None,
                )
                .map_err(|e| self.layout_error(op, e))?;
                (src_layout, dst_layout)
            }
            ImplicitDim::SecondMinor => {
                check_op!(
                    self,
                    layout.tiling() == self.target.native_tiling(16),
                    op,
                    "unsupported tiling"
                );
                let dst_layout = VectorLayout::try_new(
                    NATIVE_BITWIDTH,
                    layout.offsets(),
                    default_tiling,
                    ImplicitDim::SecondMinor,
                )
                .map_err(|e| self.layout_error(op, e))?;
                (layout, dst_layout)
            }
            ImplicitDim::Minor => return Err(self.unsupported(op, "unsupported extension layout")),
        };
        self.set_layouts(op, smallvec![Some(src_layout)], smallvec![Some(dst_layout)]);
        Ok(())
    }

    pub(super) fn infer_trunc(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        if !self.check_cast_structure(op, operation)? {
            return Ok(());
        }
        let (src, dst) = (operation.operands[0], operation.results[0]);
        let layout = self.vector_layout_of(op, src)?;
        if operation.kind == OpKind::TruncF {
            check_op!(
                self,
                self.bitwidth(src) == NATIVE_BITWIDTH && self.bitwidth(dst) == 16,
                op,
                "Only 32-bit to 16-bit truncation supported"
            );
        } else {
            check_op!(
                self,
                self.bitwidth(src) == NATIVE_BITWIDTH,
                op,
                "Only 32-bit truncation supported"
            );
        }
        if layout.implicit_dim() != ImplicitDim::None {
            return Err(self.unsupported(op, "unsupported truncation layout"));
        }

        let dst_bitwidth = self.bitwidth(dst);
        let dst_tiling = if self.all_users_require_native_tiling(dst) {
            self.target.native_tiling(dst_bitwidth)
        } else {
            self.target.default_tiling()
        };
        let src_layout = VectorLayout::try_new(
            NATIVE_BITWIDTH,
            layout.offsets(),
            self.target.default_tiling(),
            ImplicitDim::None,
        )
        .map_err(|e| self.layout_error(op, e))?;
        let dst_layout =
            VectorLayout::try_new(dst_bitwidth, layout.offsets(), dst_tiling, ImplicitDim::None)
                .map_err(|e| self.layout_error(op, e))?;
        self.set_layouts(op, smallvec![Some(src_layout)], smallvec![Some(dst_layout)]);
        Ok(())
    }

    /// Reinterprets the bits of a vector as another element type of possibly different width.
    /// Packed rows along the second-minor dim are what absorbs a change in width.
    pub(super) fn infer_bitcast(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let (input, output) = (operation.operands[0], operation.results[0]);
        let src_layout = self.vector_layout_of(op, input)?;
        let offsets = src_layout.offsets();
        if offsets.iter().any(|o| o.unwrap_or(0) != 0) {
            nyi!(self, op, "unsupported bitcast with offsets");
        }
        if src_layout.implicit_dim() != ImplicitDim::None {
            nyi!(self, op, "unsupported bitcast with an implicit dim");
        }
        let (Some(in_ty), Some(out_ty)) = (self.vector_type(input), self.vector_type(output))
        else {
            return Err(self.unsupported(op, "Input and output have different rank"));
        };
        check_op!(
            self,
            in_ty.rank() == out_ty.rank(),
            op,
            "Input and output have different rank"
        );
        if out_ty.rank() < 2 {
            nyi!(self, op, "Support bitcast with 1D vector");
        }
        let (in_bitwidth, out_bitwidth) = (in_ty.bitwidth(), out_ty.bitwidth());
        let second_minor = in_ty.rank() - 2;
        let compatible = in_ty
            .shape
            .iter()
            .zip(&out_ty.shape)
            .enumerate()
            .all(|(i, (&in_dim, &out_dim))| {
                if i == second_minor {
                    u64::from(in_dim) * u64::from(in_bitwidth)
                        == u64::from(out_dim) * u64::from(out_bitwidth)
                } else {
                    in_dim == out_dim
                }
            });
        check_op!(self, compatible, op, "Input and output have incompatible shape");

        let in_layout = VectorLayout::new(
            in_bitwidth,
            offsets,
            self.target.native_tiling(in_bitwidth),
            ImplicitDim::None,
        );
        let out_layout = VectorLayout::new(
            out_bitwidth,
            offsets,
            self.target.native_tiling(out_bitwidth),
            ImplicitDim::None,
        );
        self.set_layouts(op, smallvec![Some(in_layout)], smallvec![Some(out_layout)]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::common::Dtype;
    use crate::ir::{FunctionBuilder, OpKind, Type, ValueId};
    use crate::layout::Layout;
    use crate::vlayout;

    fn bf16_load(b: &mut FunctionBuilder, shape: &[u32]) -> ValueId {
        let memref = b.add_argument(memref_type(shape, Dtype::Bfloat16, &[&[16, 128], &[2, 1]]));
        let c0 = b.constant_index(0);
        b.vector_load(memref, &[c0, c0], vector_type(shape, Dtype::Bfloat16))
    }

    fn single_op_layouts(b: FunctionBuilder, result: ValueId) -> (Vec<Layout>, Vec<Layout>) {
        let (func, annotations) = infer_ok(b);
        let op = func.defining_op(result).unwrap();
        (ins(&annotations, op), outs(&annotations, op))
    }

    #[test]
    fn test_extf_of_packed_tiling_retiles_to_default() {
        let mut b = FunctionBuilder::new("ext");
        let x = bf16_load(&mut b, &[32, 256]);
        let wide = b.op1(OpKind::ExtF, &[x], vector_type(&[32, 256], Dtype::Float32));
        b.func_return(&[]);
        let (ins, outs) = single_op_layouts(b, wide);
        assert_eq!(ins, vec![Some(vlayout!(16, (0, 0), (8, 128)))]);
        assert_eq!(outs, vec![Some(vlayout!(32, (0, 0), (8, 128)))]);
    }

    #[test]
    fn test_extf_of_second_minor_splat() {
        let mut b = FunctionBuilder::new("ext");
        let x = b.constant_splat(vector_type(&[128], Dtype::Bfloat16));
        let wide = b.op1(OpKind::ExtF, &[x], vector_type(&[128], Dtype::Float32));
        b.func_return(&[]);
        let (ins, outs) = single_op_layouts(b, wide);
        assert_eq!(ins, vec![Some(vlayout!(16, (*, *), (16, 128), second_minor))]);
        assert_eq!(outs, vec![Some(vlayout!(32, (*, *), (8, 128), second_minor))]);
    }

    #[test]
    fn test_extf_width_checks() {
        let mut b = FunctionBuilder::new("ext");
        let x = b.constant_splat(vector_type(&[8, 128], Dtype::Sint8));
        b.op1(OpKind::ExtF, &[x], vector_type(&[8, 128], Dtype::Float32));
        b.func_return(&[]);
        assert_eq!(
            infer_err(b).message(),
            "Only 16-bit to 32-bit extensions supported"
        );
    }

    #[test]
    fn test_scalar_ext_has_no_layout() {
        let mut b = FunctionBuilder::new("ext");
        let x = b.add_argument(Type::Scalar(Dtype::Bfloat16));
        let wide = b.op1(OpKind::ExtF, &[x], Type::Scalar(Dtype::Float32));
        let v = b.constant_splat(vector_type(&[8, 128], Dtype::Float32));
        b.arith(crate::ir::ArithOp::AddF, &[v, v]);
        b.func_return(&[]);
        let (ins, outs) = single_op_layouts(b, wide);
        assert_eq!((ins, outs), (vec![None], vec![None]));
    }

    #[test]
    fn test_truncf_picks_native_tiling_for_matmul_users() {
        let mut b = FunctionBuilder::new("trunc");
        let x = b.constant_dense(vector_type(&[16, 128], Dtype::Float32));
        let narrow_ty = vector_type(&[16, 128], Dtype::Bfloat16);
        let narrow = b.op1(OpKind::TruncF, &[x], narrow_ty.clone());
        let acc = b.constant_dense(vector_type(&[16, 128], Dtype::Float32));
        b.op1(
            OpKind::Matmul,
            &[narrow, narrow, acc],
            vector_type(&[16, 128], Dtype::Float32),
        );
        let other = b.op1(OpKind::TruncF, &[x], narrow_ty);
        b.arith(crate::ir::ArithOp::AddF, &[other, other]);
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        assert_eq!(
            layout_of(&func, &annotations, narrow),
            Some(vlayout!(16, (0, 0), (16, 128)))
        );
        assert_eq!(
            layout_of(&func, &annotations, other),
            Some(vlayout!(16, (0, 0), (8, 128)))
        );
    }

    #[test]
    fn test_truncf_checks_widths() {
        let mut b = FunctionBuilder::new("trunc");
        let x = b.constant_splat(vector_type(&[16, 128], Dtype::Bfloat16));
        b.op1(OpKind::TruncF, &[x], vector_type(&[16, 128], Dtype::Sint8));
        b.func_return(&[]);
        assert_eq!(
            infer_err(b).message(),
            "Only 32-bit to 16-bit truncation supported"
        );
    }

    #[test]
    fn test_bitcast_scales_second_minor_dim() {
        let mut b = FunctionBuilder::new("bitcast");
        let x = bf16_load(&mut b, &[16, 128]);
        let y = b.op1(OpKind::Bitcast, &[x], vector_type(&[8, 128], Dtype::Sint32));
        b.func_return(&[]);
        let (ins, outs) = single_op_layouts(b, y);
        assert_eq!(ins, vec![Some(vlayout!(16, (0, 0), (16, 128)))]);
        assert_eq!(outs, vec![Some(vlayout!(32, (0, 0), (8, 128)))]);
    }

    #[test]
    fn test_bitcast_rejections() {
        let mut b = FunctionBuilder::new("bitcast");
        let x = bf16_load(&mut b, &[16, 128]);
        b.op1(OpKind::Bitcast, &[x], vector_type(&[16, 128], Dtype::Sint32));
        b.func_return(&[]);
        assert_eq!(
            infer_err(b).message(),
            "Input and output have incompatible shape"
        );

        let mut b = FunctionBuilder::new("bitcast");
        let x = b.constant_splat(vector_type(&[256], Dtype::Bfloat16));
        b.op1(OpKind::Bitcast, &[x], vector_type(&[128], Dtype::Sint32));
        b.func_return(&[]);
        assert_eq!(infer_err(b).message(), "unsupported bitcast with an implicit dim");
    }
}
