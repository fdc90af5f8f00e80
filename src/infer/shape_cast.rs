//! `vector.shape_cast` is free only when the reshaped value keeps its position in registers.
//!
//! The rule recognizes a closed set of such reshapes. Each picks layouts for the source and the
//! result that make the cast a no-op; anything else is rejected.

use super::{LayoutInferer, Result};
use crate::common::DimSize;
use crate::ir::{OpId, Operation};
use crate::layout::{ImplicitDim, VectorLayout};
use crate::target::NATIVE_BITWIDTH;

use smallvec::smallvec;

type CastLayouts = (VectorLayout, VectorLayout);

fn trailing<const N: usize>(shape: &[DimSize]) -> Option<&[DimSize]> {
    shape.len().checked_sub(N).map(|start| &shape[start..])
}

impl LayoutInferer<'_> {
    pub(super) fn infer_shape_cast(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let source = operation.operands[0];
        let (Some(src), Some(res)) = (
            self.vector_type(source).cloned(),
            self.vector_type(operation.results[0]).cloned(),
        ) else {
            return Err(self.malformed(op, "vector.shape_cast must map a vector to a vector"));
        };
        let layout = self.vector_layout_of(op, source)?;
        let cast = if layout.implicit_dim() == ImplicitDim::None {
            self.shape_cast_2d(op, layout, &src.shape, &res.shape, src.bitwidth())?
        } else {
            self.shape_cast_implicit(op, layout, &src.shape, &res.shape, src.bitwidth())?
        };
        let Some((input, output)) = cast else {
            return Err(self.unsupported(op, "unsupported shape cast"));
        };
        self.set_layouts(op, smallvec![Some(input)], smallvec![Some(output)]);
        Ok(())
    }

    fn shape_cast_2d(
        &self,
        op: OpId,
        mut layout: VectorLayout,
        src: &[DimSize],
        res: &[DimSize],
        bitwidth: u32,
    ) -> Result<Option<CastLayouts>> {
        let lanes = self.target.lanes;
        let [rows, tile_lanes] = layout.tiling();
        let (Some(&src_minor), Some(&res_minor)) = (src.last(), res.last()) else {
            return Ok(None);
        };

        if res.len() >= 2 && trailing::<2>(src) == trailing::<2>(res) {
            return Ok(Some((layout, layout)));
        }
        if let (Some(&[src_major, _]), Some(&[res_major, _])) =
            (trailing::<2>(src), trailing::<2>(res))
        {
            if tile_lanes == lanes
                && src_minor == res_minor
                && src_major % rows == 0
                && res_major % rows == 0
            {
                let aligned = layout
                    .with_offsets([Some(0), Some(0)])
                    .map_err(|e| self.layout_error(op, e))?;
                return Ok(Some((aligned, aligned)));
            }
        }
        if tile_lanes == lanes
            && src_minor != res_minor
            && src_minor % tile_lanes == 0
            && res_minor % tile_lanes == 0
        {
            if bitwidth != NATIVE_BITWIDTH {
                nyi!(self, op, "Shapecast along lane dimension when bitwidth is not 32");
            }
            return Ok(self.lane_shape_cast(layout, src, res));
        }

        let native = self.target.native_tiling(bitwidth);
        if layout.tiling() != native {
            layout = VectorLayout::try_new(bitwidth, layout.offsets(), native, layout.implicit_dim())
                .map_err(|e| self.layout_error(op, e))?;
        }
        let Some(&[src_major, src_minor]) = trailing::<2>(src) else {
            return Err(self.unsupported(op, "expected 2D+ operand with 2D layout"));
        };
        let src_batch = &src[..src.len() - 2];
        if res.len() >= 2 {
            // Squeeze out the sublane dim.
            if src_major == 1 && res[..res.len() - 1] == *src_batch && res_minor == src_minor {
                let out = layout.with_implicit_dim(ImplicitDim::SecondMinor);
                return Ok(Some((layout, out)));
            }
            // Add a unit lane dim; the old lanes move to sublanes.
            if bitwidth == NATIVE_BITWIDTH && src_minor == res[res.len() - 2] && res_minor == 1 {
                let out = VectorLayout::new(
                    NATIVE_BITWIDTH,
                    [Some(0), None],
                    self.target.default_tiling(),
                    ImplicitDim::None,
                );
                return Ok(Some((layout, out)));
            }
        } else if res.len() == 1 && src_batch.iter().all(|&d| d == 1) {
            if src_major == 1 && res_minor == src_minor {
                let out = layout.with_implicit_dim(ImplicitDim::SecondMinor);
                return Ok(Some((layout, out)));
            }
            if src_minor == 1 && res_minor == src_major {
                check_op!(
                    self,
                    bitwidth == NATIVE_BITWIDTH,
                    op,
                    "only 32-bit shape casts supported"
                );
                let out = VectorLayout::new(
                    NATIVE_BITWIDTH,
                    layout.offsets(),
                    layout.tiling(),
                    ImplicitDim::Minor,
                );
                return Ok(Some((layout, out)));
            }
        }
        Ok(None)
    }

    /// Reshapes that fold `m` registers' worth of lanes into rows, or the reverse. A row of
    /// `(1, lanes)` tiles holds the same elements in the same order as `(sublanes, lanes)`
    /// tiles of the folded shape.
    fn lane_shape_cast(
        &self,
        layout: VectorLayout,
        src: &[DimSize],
        res: &[DimSize],
    ) -> Option<CastLayouts> {
        let (sublanes, lanes) = (self.target.sublanes, self.target.lanes);
        let (&[src_major, src_minor], &[res_major, res_minor]) =
            (trailing::<2>(src)?, trailing::<2>(res)?)
        else {
            return None;
        };
        let dense = VectorLayout::new(
            layout.bitwidth(),
            [Some(0), Some(0)],
            [1, lanes],
            ImplicitDim::None,
        );
        let native = VectorLayout::new(
            layout.bitwidth(),
            [Some(0), Some(0)],
            self.target.default_tiling(),
            ImplicitDim::None,
        );
        let folds = |wide_major: DimSize,
                     wide_minor: DimSize,
                     narrow_major: DimSize,
                     narrow_minor: DimSize| {
            narrow_minor == lanes
                && narrow_major % sublanes == 0
                && wide_minor % (sublanes * lanes) == 0
                && (wide_major == 1 || wide_major % sublanes == 0)
        };
        if folds(src_major, src_minor, res_major, res_minor) {
            Some((dense, native))
        } else if folds(res_major, res_minor, src_major, src_minor) {
            Some((native, dense))
        } else {
            None
        }
    }

    fn shape_cast_implicit(
        &self,
        op: OpId,
        layout: VectorLayout,
        src: &[DimSize],
        res: &[DimSize],
        bitwidth: u32,
    ) -> Result<Option<CastLayouts>> {
        if !res.is_empty() && src.last() == res.last() {
            return Ok(Some((layout, layout)));
        }
        check_op!(
            self,
            bitwidth == NATIVE_BITWIDTH,
            op,
            "only 32-bit shape casts supported"
        );
        let adds_unit_minor = res.len() == src.len() + 1
            && src.last() == res.len().checked_sub(2).and_then(|i| res.get(i))
            && res.last() == Some(&1);
        if !adds_unit_minor {
            return Ok(None);
        }
        let offsets = match layout.implicit_dim() {
            ImplicitDim::Minor => layout.offsets(),
            ImplicitDim::SecondMinor => [Some(0), None],
            ImplicitDim::None => {
                return Err(self.unsupported(op, "unexpected implicit dim value"));
            }
        };
        let out = VectorLayout::try_new(
            NATIVE_BITWIDTH,
            offsets,
            self.target.default_tiling(),
            ImplicitDim::None,
        )
        .map_err(|e| self.layout_error(op, e))?;
        Ok(Some((layout, out)))
    }
}
