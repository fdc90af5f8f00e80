//! Rules for operations that move vectors between memory and registers.
//!
//! A memref's tile hierarchy fixes how its elements sit in memory. Loads and stores pick the
//! register layout that lets each register be filled by contiguous tile rows, so the first
//! tile level becomes the layout's tiling and the access indices become its offsets.

use super::{LayoutInferer, Result};
use crate::annotations::LayoutList;
use crate::common::{Bitwidth, DimSize};
use crate::ir::{ConstantValue, MemRefType, OpId, OpKind, Operation, ValueId, VectorType};
use crate::layout::{ImplicitDim, Layout, VectorLayout};
use crate::target::NATIVE_BITWIDTH;

use smallvec::smallvec;

/// Whether a memory rule is reading or writing, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Load,
    Store,
}

impl Access {
    fn noun(self) -> &'static str {
        match self {
            Access::Load => "load",
            Access::Store => "store",
        }
    }
}

impl LayoutInferer<'_> {
    /// Checks that a memref's tiles describe a layout registers can be filled from, and
    /// returns the first-level tile.
    ///
    /// 32-bit data must use a single tile level. Narrower data is packed, so its last level
    /// must compress `32 / bitwidth` rows into one.
    fn verify_memory_tiling(
        &self,
        op: OpId,
        memref: &MemRefType,
        access: Access,
    ) -> Result<Vec<DimSize>> {
        let bitwidth = memref.dtype.bitwidth();
        let tiles = &memref.tiles;
        let rank = memref.shape.len();
        if bitwidth == NATIVE_BITWIDTH {
            check_op!(
                self,
                tiles.len() == 1,
                op,
                "Only one-level tiling supported for 32-bit {}s",
                access.noun()
            );
        } else if bitwidth < NATIVE_BITWIDTH {
            let rows_per_tile = if rank == 1 {
                check_op!(
                    self,
                    tiles.len() == 3,
                    op,
                    "Only three-level tiling supported for 1D memory ops narrower than 32-bit"
                );
                let (first, second) = (tiles[0].dimensions(), tiles[1].dimensions());
                check_op!(
                    self,
                    first.len() == 1 && first[0] % self.target.lanes == 0,
                    op,
                    "Invalid first-level tile in 1D memory op"
                );
                check_op!(
                    self,
                    second.len() == 1 && second[0] == self.target.lanes,
                    op,
                    "Invalid second-level tile in 1D memory op"
                );
                first[0] / self.target.lanes
            } else {
                check_op!(
                    self,
                    tiles.len() == 2,
                    op,
                    "Only two-level tiling supported for 2D+ memory ops narrower than 32-bit"
                );
                let first = tiles[0].dimensions();
                check_op!(self, !first.is_empty(), op, "Invalid first-level tile");
                first[0]
            };
            let row_compressed = tiles[tiles.len() - 1].dimensions();
            check_op!(
                self,
                row_compressed.len() == 2,
                op,
                "Expected 2D tiling for packed layout"
            );
            let packing = NATIVE_BITWIDTH / bitwidth;
            check_op!(
                self,
                row_compressed[0] == packing && row_compressed[1] == 1,
                op,
                "Expected compressed packed layout"
            );
            check_op!(
                self,
                packing <= rows_per_tile,
                op,
                "Packing cannot introduce padding"
            );
        } else {
            return Err(self.unsupported(op, "Loads of types wider than 32-bit unsupported"));
        }
        let first = tiles[0].dimensions();
        check_op!(
            self,
            !first.is_empty() && !first.contains(&0),
            op,
            "Invalid first-level tile"
        );
        Ok(first.to_vec())
    }

    /// The position of each tiled index within its tile.
    ///
    /// Constant indices are reduced modulo the tile. Any other index must be provably aligned
    /// to the tile, in which case it sits at offset 0.
    fn tile_offsets(&self, op: OpId, indices: &[ValueId], tiling: &[DimSize]) -> Result<Vec<DimSize>> {
        check_op!(
            self,
            tiling.len() <= indices.len(),
            op,
            "tiling has more dimensions than the memref"
        );
        let first_tiled = indices.len() - tiling.len();
        tiling
            .iter()
            .enumerate()
            .map(|(i, &tile)| {
                let dim = first_tiled + i;
                let index = indices[dim];
                let constant = self.func.defining_op(index).and_then(|def| {
                    match self.func.op(def).kind {
                        OpKind::Constant(ConstantValue::Int(c)) => Some(c),
                        _ => None,
                    }
                });
                match constant {
                    Some(c) => Ok(c.rem_euclid(i64::from(tile)) as DimSize),
                    None if self.oracle.is_guaranteed_divisible(&*self.func, index, tile) => Ok(0),
                    None => Err(self.unsupported(
                        op,
                        format!(
                            "cannot statically prove that index in dimension {dim} is a multiple of {tile}"
                        ),
                    )),
                }
            })
            .collect()
    }

    /// The register layout for moving `vector` to or from `memref` at `indices`.
    fn memory_access_layout(
        &self,
        op: OpId,
        memref: &MemRefType,
        vector: &VectorType,
        indices: &[ValueId],
        access: Access,
    ) -> Result<VectorLayout> {
        let noun = access.noun();
        check_op!(
            self,
            memref.shape.len() == vector.rank(),
            op,
            "memref and vector rank mismatch"
        );
        check_op!(
            self,
            indices.len() == vector.rank(),
            op,
            "expected one index per memref dimension"
        );
        let rank = vector.rank();
        let bitwidth: Bitwidth = vector.bitwidth();
        let tiling = self.verify_memory_tiling(op, memref, access)?;
        if rank == 0 {
            return Err(self.unsupported(op, "rank 0 vectors unsupported"));
        }
        if rank == 1 {
            check_op!(self, tiling.len() == 1, op, "Expected 1D tiling in 1D {noun}");
            let tile = tiling[0];
            check_op!(
                self,
                tile % self.target.lanes == 0,
                op,
                "Unsupported 1D tiling for 1D {noun}"
            );
            let offsets = self.tile_offsets(op, indices, &tiling)?;
            return VectorLayout::try_new(
                bitwidth,
                [Some(0), Some(offsets[0])],
                [1, tile],
                ImplicitDim::SecondMinor,
            )
            .map_err(|e| self.layout_error(op, e));
        }

        check_op!(self, tiling.len() == 2, op, "Expected 2D tiling in 2D+ {noun}");
        let tile_offsets = self.tile_offsets(op, indices, &tiling)?;
        let (_, memref_minor) = Self::minor_dims(&memref.shape);
        let (num_sublanes, vector_minor) = Self::minor_dims(&vector.shape);
        let lanes = self.target.lanes;
        check_op!(
            self,
            tiling[1] == lanes,
            op,
            "Unsupported tiling for 2d {noun}"
        );
        // Narrow memrefs degenerate to a plain row-major layout, and a single sublane needs no
        // row alignment.
        let single_sublane = num_sublanes == 1;
        let sublane_offset = if bitwidth == NATIVE_BITWIDTH && (memref_minor <= lanes || single_sublane)
        {
            0
        } else {
            tile_offsets[0]
        };
        let offsets = [Some(sublane_offset), Some(tile_offsets[1])];
        let layout = if single_sublane && bitwidth == NATIVE_BITWIDTH && vector_minor > lanes {
            // One row spread over many registers is read with a sublane stride.
            VectorLayout::try_new(bitwidth, offsets, [1, lanes], ImplicitDim::None)
        } else if access == Access::Load
            && single_sublane
            && bitwidth == NATIVE_BITWIDTH
            && tiling[..] == self.target.as_tiling()[..]
        {
            // A single row can be loaded replicated across sublanes.
            VectorLayout::try_new(
                bitwidth,
                [None, offsets[1]],
                [tiling[0], tiling[1]],
                ImplicitDim::None,
            )
        } else {
            VectorLayout::try_new(bitwidth, offsets, [tiling[0], tiling[1]], ImplicitDim::None)
        };
        layout.map_err(|e| self.layout_error(op, e))
    }

    fn memref_operand(&self, op: OpId, value: ValueId) -> Result<MemRefType> {
        self.func
            .memref_with_layout(value)
            .cloned()
            .ok_or_else(|| self.malformed(op, "expected a memref operand"))
    }

    pub(super) fn infer_vector_load(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        check_op!(self, !operation.operands.is_empty(), op, "expected a memref operand");
        let memref = self.memref_operand(op, operation.operands[0])?;
        let Some(vector) = self.vector_type(operation.results[0]).cloned() else {
            return Err(self.malformed(op, "vector.load must produce a vector"));
        };
        let layout =
            self.memory_access_layout(op, &memref, &vector, &operation.operands[1..], Access::Load)?;
        self.set_layouts(
            op,
            smallvec![None; operation.operands.len()],
            smallvec![Some(layout)],
        );
        Ok(())
    }

    pub(super) fn infer_vector_store(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let Some(vector) = self.vector_type(operation.operands[0]).cloned() else {
            return Err(self.malformed(op, "vector.store must store a vector"));
        };
        let memref = self.memref_operand(op, operation.operands[1])?;
        let layout =
            self.memory_access_layout(op, &memref, &vector, &operation.operands[2..], Access::Store)?;
        self.set_layouts(op, store_layouts(Some(layout), operation), smallvec![]);
        Ok(())
    }

    /// The layout of one full native register of 32-bit data.
    fn native_vreg_layout(&self) -> VectorLayout {
        VectorLayout::new(
            NATIVE_BITWIDTH,
            [Some(0), Some(0)],
            self.target.native_tiling(NATIVE_BITWIDTH),
            ImplicitDim::None,
        )
    }

    fn is_single_native_vreg(&self, ty: &VectorType) -> bool {
        ty.bitwidth() == NATIVE_BITWIDTH && ty.shape[..] == self.target.as_tiling()[..]
    }

    pub(super) fn infer_tpu_load(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let native = self
            .vector_type(operation.results[0])
            .is_some_and(|ty| self.is_single_native_vreg(ty));
        check_op!(self, native, op, "Only 32-bit loads supported");
        let layout = self.native_vreg_layout();
        self.set_layouts(
            op,
            smallvec![None; operation.operands.len()],
            smallvec![Some(layout)],
        );
        Ok(())
    }

    pub(super) fn infer_tpu_store(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let native = operation
            .operands
            .first()
            .and_then(|&v| self.vector_type(v))
            .is_some_and(|ty| self.is_single_native_vreg(ty));
        check_op!(self, native, op, "Only 32-bit stores supported");
        let layout = self.native_vreg_layout();
        self.set_layouts(op, store_layouts(Some(layout), operation), smallvec![]);
        Ok(())
    }

    fn check_strided_access(&self, op: OpId, ty: Option<&VectorType>, access: Access) -> Result<()> {
        let noun = access.noun();
        let Some(ty) = ty else {
            return Err(self.malformed(op, format!("strided {noun} needs a vector")));
        };
        if ty.bitwidth() != NATIVE_BITWIDTH {
            nyi!(self, op, "Strided {noun} with non 32-bit data");
        }
        if ty.rank() < 2 {
            nyi!(self, op, "Strided {noun} with 1D vector");
        }
        Ok(())
    }

    pub(super) fn infer_strided_load(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        self.check_strided_access(op, self.vector_type(operation.results[0]), Access::Load)?;
        let layout = self.native_vreg_layout();
        self.set_layouts(
            op,
            smallvec![None; operation.operands.len()],
            smallvec![Some(layout)],
        );
        Ok(())
    }

    pub(super) fn infer_strided_store(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let ty = operation.operands.first().and_then(|&v| self.vector_type(v));
        self.check_strided_access(op, ty, Access::Store)?;
        let layout = self.native_vreg_layout();
        self.set_layouts(op, store_layouts(Some(layout), operation), smallvec![]);
        Ok(())
    }

    pub(super) fn infer_memref_load(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let scalar = operation.results.len() == 1 && self.value_type(operation.results[0]).is_scalar();
        check_op!(self, scalar, op, "memref.load with non-scalar result");
        self.set_layouts(op, smallvec![None; operation.operands.len()], smallvec![None]);
        Ok(())
    }

    pub(super) fn infer_erase_layout(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        self.set_layouts(
            op,
            smallvec![None; operation.operands.len()],
            smallvec![None; operation.results.len()],
        );
        Ok(())
    }
}

/// Input layouts of a store: the stored value's layout, then nothing for the memref and
/// indices.
fn store_layouts(value_layout: Layout, operation: &Operation) -> LayoutList {
    let mut ins: LayoutList = smallvec![value_layout];
    ins.extend(std::iter::repeat(None).take(operation.operands.len() - 1));
    ins
}
