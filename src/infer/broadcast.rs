use super::{LayoutInferer, Result};
use crate::ir::{OpId, Operation, Type};
use crate::layout::{ImplicitDim, VectorLayout};
use crate::target::NATIVE_BITWIDTH;

use smallvec::smallvec;

impl LayoutInferer<'_> {
    pub(super) fn infer_broadcast(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let Some(result) = self.vector_type(operation.results[0]).cloned() else {
            return Err(self.malformed(op, "vector.broadcast must produce a vector"));
        };
        check_op!(self, result.rank() > 0, op, "rank 0 vectors unsupported");
        let source = operation.operands[0];
        match self.value_type(source).clone() {
            Type::Scalar(dtype) if dtype.bitwidth() <= NATIVE_BITWIDTH => {
                // Masks are laid out as 32-bit data.
                let bitwidth = match dtype.bitwidth() {
                    1 => NATIVE_BITWIDTH,
                    bw => bw,
                };
                let implicit_dim = if result.rank() == 1 {
                    ImplicitDim::SecondMinor
                } else {
                    ImplicitDim::None
                };
                let layout = VectorLayout::new(
                    bitwidth,
                    [None, None],
                    self.target.native_tiling(bitwidth),
                    implicit_dim,
                );
                self.set_layouts(op, smallvec![None], smallvec![Some(layout)]);
                Ok(())
            }
            Type::Vector(source_ty) => {
                check_op!(self, source_ty.rank() >= 2, op, "source rank below 2D unsupported");
                check_op!(self, result.rank() >= 2, op, "result rank below 2D unsupported");
                let mut layout = self.vector_layout_of(op, source)?;
                let (src_major, src_minor) = Self::minor_dims(&source_ty.shape);
                let (dst_major, dst_minor) = Self::minor_dims(&result.shape);

                // Sublane broadcasts are only done in the default tiling.
                if src_major != dst_major {
                    if layout.bitwidth() != NATIVE_BITWIDTH {
                        nyi!(self, op, "Only 32-bit broadcasts supported");
                    }
                    let mut offsets = layout.offsets();
                    if layout.tiling()[0] == 1 {
                        offsets[0] = None;
                    }
                    layout = VectorLayout::try_new(
                        layout.bitwidth(),
                        offsets,
                        self.target.default_tiling(),
                        layout.implicit_dim(),
                    )
                    .map_err(|e| self.layout_error(op, e))?;
                }
                if layout.implicit_dim() != ImplicitDim::None {
                    let layout_2d = layout.with_implicit_dim(ImplicitDim::None);
                    check_op!(
                        self,
                        layout_2d.equivalent_to(&layout, &source_ty.shape, &self.target),
                        op,
                        "Only 2D layouts supported"
                    );
                    layout = layout_2d;
                }

                let mut offsets = layout.offsets();
                if layout.bitwidth() == NATIVE_BITWIDTH
                    && layout.tiling() == self.target.default_tiling()
                {
                    // Broadcast dims end up replicated.
                    if src_major != dst_major {
                        offsets[0] = None;
                    }
                    if src_minor != dst_minor {
                        offsets[1] = None;
                    }
                }
                let out = layout
                    .with_offsets(offsets)
                    .map_err(|e| self.layout_error(op, e))?;
                self.set_layouts(op, smallvec![Some(layout)], smallvec![Some(out)]);
                Ok(())
            }
            _ => Err(self.unsupported(op, "unsupported broadcast source type")),
        }
    }
}
