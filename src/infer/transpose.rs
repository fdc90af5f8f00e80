use super::{LayoutInferer, Result};
use crate::ir::{OpId, Operation};
use crate::layout::{ImplicitDim, VectorLayout};

use smallvec::smallvec;

impl LayoutInferer<'_> {
    /// Only whole, unpadded tiles can be transposed, and major and minor dims cannot trade
    /// places.
    pub(super) fn infer_transpose(
        &mut self,
        op: OpId,
        operation: &Operation,
        permutation: &[usize],
    ) -> Result<()> {
        let source = operation.operands[0];
        let layout = self.vector_layout_of(op, source)?;
        let Some(ty) = self.vector_type(source).cloned() else {
            return Err(self.malformed(op, "vector.transpose must transpose a vector"));
        };
        let rank = ty.rank();
        check_op!(
            self,
            permutation.len() == rank,
            op,
            "Transpose permutation has incorrect rank"
        );
        check_op!(
            self,
            layout.implicit_dim() == ImplicitDim::None && rank >= 2,
            op,
            "Unsupported transpose"
        );
        check_op!(
            self,
            layout.offsets() == [Some(0), Some(0)],
            op,
            "Padded transposes unsupported"
        );
        let (major, minor) = Self::minor_dims(&ty.shape);
        let lanes = self.target.lanes;
        check_op!(
            self,
            major % lanes == 0 && minor % lanes == 0,
            op,
            "Padded transposes unsupported"
        );
        let (batch, tiled) = permutation.split_at(rank - 2);
        check_op!(
            self,
            batch.iter().all(|&d| d < rank - 2),
            op,
            "Unsupported transpose permutation - minor dims into major"
        );
        check_op!(
            self,
            tiled.iter().all(|&d| d >= rank - 2),
            op,
            "Unsupported transpose permutation - major dims into minor"
        );

        // Swapping the tiled dims goes through the transpose unit, which works on native tiles.
        let required = if tiled[1] == rank - 2 {
            VectorLayout::try_new(
                layout.bitwidth(),
                layout.offsets(),
                self.target.native_tiling(layout.bitwidth()),
                ImplicitDim::None,
            )
            .map_err(|e| self.layout_error(op, e))?
        } else {
            layout
        };
        self.set_layouts(op, smallvec![Some(required)], smallvec![Some(required)]);
        Ok(())
    }
}
