use super::{LayoutInferer, Result};
use crate::ir::{CombiningKind, IndexingMap, IteratorType, OpId, Operation, ValueId};
use crate::layout::{ImplicitDim, VectorLayout};
use crate::target::NATIVE_BITWIDTH;

use smallvec::smallvec;

/// `lhs[d0, d2] * rhs[d2, d1] -> out[d0, d1]`, and the same with a transposed rhs.
fn is_matmul_indexing(maps: &[IndexingMap]) -> bool {
    let plain = [
        IndexingMap::new(3, &[0, 2]),
        IndexingMap::new(3, &[2, 1]),
        IndexingMap::new(3, &[0, 1]),
    ];
    let transposed_rhs = [
        IndexingMap::new(3, &[0, 2]),
        IndexingMap::new(3, &[1, 2]),
        IndexingMap::new(3, &[0, 1]),
    ];
    maps == plain || maps == transposed_rhs
}

impl LayoutInferer<'_> {
    pub(super) fn infer_contraction(
        &mut self,
        op: OpId,
        operation: &Operation,
        kind: CombiningKind,
        iterator_types: &[IteratorType],
        indexing_maps: &[IndexingMap],
    ) -> Result<()> {
        check_op!(self, kind == CombiningKind::Add, op, "Only ADD supported");
        check_op!(
            self,
            iterator_types[..]
                == [
                    IteratorType::Parallel,
                    IteratorType::Parallel,
                    IteratorType::Reduction
                ],
            op,
            "Not a matmul"
        );
        check_op!(self, is_matmul_indexing(indexing_maps), op, "Not a matmul");
        self.infer_matmul(op, operation)
    }

    /// The layout an operand must already have to feed the matrix unit directly, retiled to
    /// the native tiling.
    ///
    /// The trailing two dims must be multiples of `major_multiple` and `minor_multiple`
    /// (defaulting to the native tiling) and the value must start at the tile origin.
    fn unpadded_layout(
        &self,
        value: ValueId,
        major_multiple: Option<u32>,
        minor_multiple: Option<u32>,
    ) -> Option<VectorLayout> {
        let layout = self.layout_of(value).ok()??;
        if layout.implicit_dim() != ImplicitDim::None {
            return None;
        }
        let ty = self.vector_type(value)?;
        if ty.rank() < 2 {
            return None;
        }
        let tiling = self.target.native_tiling(ty.bitwidth());
        let (major, minor) = Self::minor_dims(&ty.shape);
        let offsets = layout.offsets();
        if offsets.iter().any(|o| o.unwrap_or(0) != 0)
            || major % major_multiple.unwrap_or(tiling[0]) != 0
            || minor % minor_multiple.unwrap_or(tiling[1]) != 0
        {
            return None;
        }
        layout.retile(tiling).ok()
    }

    pub(super) fn infer_matmul(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let result = self.vector_type(operation.results[0]);
        check_op!(self, result.is_some(), op, "only vector results supported");
        check_op!(
            self,
            result.is_some_and(|ty| ty.bitwidth() == NATIVE_BITWIDTH),
            op,
            "only 32-bit matmul results supported"
        );
        let (lhs, rhs, acc) = (
            operation.operands[0],
            operation.operands[1],
            operation.operands[2],
        );
        // Unpacked data imposes no restriction on the major axis.
        let major_multiple = |v: ValueId| (self.bitwidth(v) == NATIVE_BITWIDTH).then_some(1);
        let ins = [
            self.unpadded_layout(lhs, major_multiple(lhs), Some(1)),
            self.unpadded_layout(rhs, major_multiple(rhs), Some(1)),
            self.unpadded_layout(acc, Some(1), Some(1)),
        ];
        if ins.iter().any(Option::is_none) {
            return Err(self.unsupported(op, "unsupported operand shapes or layouts"));
        }
        let out = VectorLayout::new(
            NATIVE_BITWIDTH,
            [Some(0), Some(0)],
            self.target.default_tiling(),
            ImplicitDim::None,
        );
        self.set_layouts(op, ins.into_iter().collect(), smallvec![Some(out)]);
        Ok(())
    }
}
