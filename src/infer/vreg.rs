use super::{LayoutInferer, Result};
use crate::common::DimSize;
use crate::ir::{OpId, Operation};
use crate::layout::{ImplicitDim, VectorLayout};
use crate::target::NATIVE_BITWIDTH;

use smallvec::{smallvec, SmallVec};

impl LayoutInferer<'_> {
    fn native_layout(&self, bitwidth: u32) -> VectorLayout {
        VectorLayout::new(
            bitwidth,
            [Some(0), Some(0)],
            self.target.native_tiling(bitwidth),
            ImplicitDim::None,
        )
    }

    pub(super) fn infer_rotate(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let Some(ty) = self.vector_type(operation.results[0]).cloned() else {
            return Err(self.malformed(op, "tpu.rotate must produce a vector"));
        };
        if ty.bitwidth() != NATIVE_BITWIDTH {
            nyi!(self, op, "Rotate with non-32-bit data");
        }
        if ty.rank() < 2 {
            nyi!(self, op, "Unsupported 1D shape");
        }
        let layout = Some(self.native_layout(ty.bitwidth()));
        let ins = operation
            .operands
            .iter()
            .map(|&v| if self.value_type(v).is_vector() { layout } else { None })
            .collect();
        self.set_layouts(op, ins, smallvec![layout]);
        Ok(())
    }

    pub(super) fn infer_concatenate(
        &mut self,
        op: OpId,
        operation: &Operation,
        dimension: usize,
    ) -> Result<()> {
        let Some(ty) = self.vector_type(operation.results[0]).cloned() else {
            return Err(self.malformed(op, "tpu.concatenate must produce a vector"));
        };
        let rank = ty.rank();
        check_op!(self, dimension < rank, op, "Expect a valid concatenate dimension");
        if rank == 1 {
            nyi!(self, op, "Support concatenation with 1D vectors");
        }
        if ty.bitwidth() != NATIVE_BITWIDTH {
            nyi!(self, op, "Support concatenation with non 32-bit data");
        }
        // Joining along a tiled dim needs every source to start on a tile boundary.
        let layout = if dimension >= rank - 2 {
            Some(self.native_layout(ty.bitwidth()))
        } else {
            self.layout_of(operation.operands[0])?
        };
        self.set_layouts(
            op,
            smallvec![layout; operation.operands.len()],
            smallvec![layout],
        );
        Ok(())
    }

    /// Gather and repeat leave the source's layout unchanged.
    pub(super) fn infer_source_passthrough(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let layout = self.layout_of(operation.operands[0])?;
        let mut ins = self.operand_layouts(&operation.operands)?;
        ins[0] = layout;
        self.set_layouts(op, ins, smallvec![layout]);
        Ok(())
    }

    pub(super) fn infer_extract(
        &mut self,
        op: OpId,
        operation: &Operation,
        position: &[Option<DimSize>],
    ) -> Result<()> {
        check_op!(
            self,
            position.iter().all(Option::is_some),
            op,
            "dynamic indices not supported"
        );
        check_op!(
            self,
            self.bitwidth(operation.operands[0]) == NATIVE_BITWIDTH,
            op,
            "Only 32-bit types supported"
        );
        if self.value_type(operation.results[0]).is_vector() {
            nyi!(self, op, "Extracting a vector from a vector");
        }
        let layout = self.vector_layout_of(op, operation.operands[0])?;
        let aligned = VectorLayout::new(
            NATIVE_BITWIDTH,
            [Some(0), Some(0)],
            layout.tiling(),
            layout.implicit_dim(),
        );
        let mut ins: SmallVec<_> = smallvec![None; operation.operands.len()];
        ins[0] = Some(aligned);
        self.set_layouts(op, ins, smallvec![None]);
        Ok(())
    }

    pub(super) fn infer_extract_strided_slice(
        &mut self,
        op: OpId,
        operation: &Operation,
        offsets: &[DimSize],
        strides: &[DimSize],
    ) -> Result<()> {
        let layout = self.vector_layout_of(op, operation.operands[0])?;
        check_op!(
            self,
            layout.implicit_dim() == ImplicitDim::None,
            op,
            "only 2D layouts supported"
        );
        check_op!(
            self,
            self.bitwidth(operation.results[0]) == NATIVE_BITWIDTH,
            op,
            "Only 32-bit types supported"
        );
        let trailing = &offsets[offsets.len().saturating_sub(2)..];
        check_op!(
            self,
            trailing.iter().all(|&o| o == 0),
            op,
            "Only zero-offset slices supported."
        );
        check_op!(
            self,
            strides.iter().all(|&s| s == 1),
            op,
            "Only trivial strides supported."
        );
        self.set_layouts(op, smallvec![Some(layout)], smallvec![Some(layout)]);
        Ok(())
    }
}
