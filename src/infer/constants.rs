use super::{LayoutInferer, Result};
use crate::common::Dtype;
use crate::ir::{ConstantValue, OpId, Operation, Type};
use crate::layout::{ImplicitDim, VectorLayout};
use crate::target::NATIVE_BITWIDTH;

use smallvec::smallvec;

impl LayoutInferer<'_> {
    pub(super) fn infer_constant(
        &mut self,
        op: OpId,
        operation: &Operation,
        value: &ConstantValue,
    ) -> Result<()> {
        let ty = match self.value_type(operation.results[0]) {
            Type::Scalar(_) => {
                self.set_layouts(op, smallvec![], smallvec![None]);
                return Ok(());
            }
            Type::Vector(ty) => ty.clone(),
            Type::MemRef(_) => return Err(self.unsupported(op, "unsupported constant type")),
        };
        check_op!(self, ty.rank() > 0, op, "rank 0 vectors unsupported");
        let bitwidth = ty.bitwidth();
        let layout = match value {
            ConstantValue::Splat => {
                // A splat is trivially relaid out, so which tiled dim holds a rank-1 splat is
                // arbitrary. Lanes it is.
                let implicit_dim = if ty.rank() == 1 {
                    ImplicitDim::SecondMinor
                } else {
                    ImplicitDim::None
                };
                VectorLayout::new(
                    bitwidth,
                    [None, None],
                    self.target.native_tiling(bitwidth),
                    implicit_dim,
                )
            }
            ConstantValue::Dense => {
                check_op!(
                    self,
                    bitwidth == NATIVE_BITWIDTH,
                    op,
                    "Only 32-bit non-splat constants supported"
                );
                if ty.rank() == 1 {
                    if ty.shape[0] <= self.target.sublanes {
                        nyi!(self, op, "small 1D constants");
                    }
                    nyi!(self, op, "large 1D constants");
                }
                VectorLayout::new(
                    NATIVE_BITWIDTH,
                    [Some(0), Some(0)],
                    self.target.default_tiling(),
                    ImplicitDim::None,
                )
            }
            ConstantValue::Int(_) | ConstantValue::Float(_) => {
                return Err(self.malformed(op, "expected vector constants to use dense elements"));
            }
        };
        self.set_layouts(op, smallvec![], smallvec![Some(layout)]);
        Ok(())
    }

    pub(super) fn infer_iota(
        &mut self,
        op: OpId,
        operation: &Operation,
        dimension: Option<usize>,
    ) -> Result<()> {
        let Some(ty) = self.vector_type(operation.results[0]).cloned() else {
            return Err(self.unsupported(op, "iota must produce a vector"));
        };
        check_op!(
            self,
            ty.dtype == Dtype::Sint32,
            op,
            "Only 32-bit integer iota supported"
        );
        check_op!(self, ty.rank() >= 2, op, "iota rank below 2D unsupported");
        // Values along the iota dimension differ, but the other tiled dim is uniform.
        let mut offsets = [Some(0), Some(0)];
        if dimension == Some(ty.rank() - 1) {
            offsets[0] = None;
        }
        if dimension == Some(ty.rank() - 2) {
            offsets[1] = None;
        }
        let layout = VectorLayout::new(
            NATIVE_BITWIDTH,
            offsets,
            self.target.default_tiling(),
            ImplicitDim::None,
        );
        self.set_layouts(op, smallvec![None; operation.operands.len()], smallvec![Some(layout)]);
        Ok(())
    }
}
