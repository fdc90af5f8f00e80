use crate::common::{Bitwidth, DimSize, Shape};
use crate::target::{TargetShape, Tiling};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display};

/// A dimension of size one that is part of the register layout but not of the value's shape.
///
/// Small vectors (rank 1, or rank 2 where one dimension is reduced away) are laid out as if they
/// had an extra unit dimension in one of the two tiled positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ImplicitDim {
    None,
    /// A unit dimension is inserted before the minor-most dimension.
    SecondMinor,
    /// A unit dimension is appended after the minor-most dimension.
    Minor,
}

/// The position of the first element of a value within its first tile, or `None` if the value
/// is replicated along that dimension and may be read at any offset.
pub type LayoutOffset = Option<DimSize>;
pub type LayoutOffsets = [LayoutOffset; 2];

/// How a vector value is distributed over vector registers.
///
/// Values are split into tiles of `tiling` elements of the two minor-most (possibly implicit)
/// dimensions, padded at the front by `offsets`. Each register holds one or more whole tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct VectorLayout {
    bitwidth: Bitwidth,
    offsets: LayoutOffsets,
    tiling: Tiling,
    implicit_dim: ImplicitDim,
}

/// The layout assigned to one operand or result. `None` marks a value that has no register
/// layout at all (scalars, memrefs, indices).
pub type Layout = Option<VectorLayout>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum LayoutError {
    #[error("Tiling {0:?} has a zero dimension")]
    EmptyTiling(Tiling),
    #[error("Offset {offset} in dimension {dim} does not fit in tiling {tiling:?}")]
    OffsetOutsideTile {
        dim: usize,
        offset: DimSize,
        tiling: Tiling,
    },
    #[error("Shape {shape:?} has too few dimensions for implicit dim {implicit_dim:?}")]
    RankTooSmall {
        shape: Shape,
        implicit_dim: ImplicitDim,
    },
}

impl VectorLayout {
    /// Builds a layout, panicking if an offset falls outside its tile.
    ///
    /// Use [VectorLayout::try_new] or [VectorLayout::retile] when the offsets are not known to
    /// fit the tiling.
    pub fn new(
        bitwidth: Bitwidth,
        offsets: LayoutOffsets,
        tiling: Tiling,
        implicit_dim: ImplicitDim,
    ) -> Self {
        match Self::try_new(bitwidth, offsets, tiling, implicit_dim) {
            Ok(layout) => layout,
            Err(e) => panic!("invalid vector layout: {e}"),
        }
    }

    pub fn try_new(
        bitwidth: Bitwidth,
        offsets: LayoutOffsets,
        tiling: Tiling,
        implicit_dim: ImplicitDim,
    ) -> Result<Self, LayoutError> {
        debug_assert!(bitwidth > 0);
        if tiling.contains(&0) {
            return Err(LayoutError::EmptyTiling(tiling));
        }
        for (dim, (offset, tile)) in offsets.iter().zip(tiling).enumerate() {
            if let Some(offset) = *offset {
                if offset >= tile {
                    return Err(LayoutError::OffsetOutsideTile {
                        dim,
                        offset,
                        tiling,
                    });
                }
            }
        }
        Ok(VectorLayout {
            bitwidth,
            offsets,
            tiling,
            implicit_dim,
        })
    }

    pub fn bitwidth(&self) -> Bitwidth {
        self.bitwidth
    }

    pub fn offsets(&self) -> LayoutOffsets {
        self.offsets
    }

    pub fn tiling(&self) -> Tiling {
        self.tiling
    }

    pub fn implicit_dim(&self) -> ImplicitDim {
        self.implicit_dim
    }

    /// Returns this layout with a different tiling, keeping offsets and implicit dim.
    pub fn retile(&self, tiling: Tiling) -> Result<Self, LayoutError> {
        Self::try_new(self.bitwidth, self.offsets, tiling, self.implicit_dim)
    }

    pub fn with_offsets(&self, offsets: LayoutOffsets) -> Result<Self, LayoutError> {
        Self::try_new(self.bitwidth, offsets, self.tiling, self.implicit_dim)
    }

    pub fn with_implicit_dim(&self, implicit_dim: ImplicitDim) -> Self {
        VectorLayout {
            implicit_dim,
            ..*self
        }
    }

    pub fn is_fully_replicated(&self) -> bool {
        self.offsets.iter().all(Option::is_none)
    }

    pub fn has_native_tiling(&self, target: &TargetShape) -> bool {
        self.tiling == target.native_tiling(self.bitwidth)
    }

    /// Replaces every replicated offset with zero.
    pub fn concretized(&self) -> Self {
        VectorLayout {
            offsets: self.offsets.map(|o| Some(o.unwrap_or(0))),
            ..*self
        }
    }

    /// The least layout compatible with both `self` and `other`, if one exists.
    ///
    /// Bit-width, tiling, and implicit dim must agree exactly. A replicated offset is compatible
    /// with any concrete offset, since a replicated value can be read at any position.
    pub fn join(&self, other: &VectorLayout) -> Option<VectorLayout> {
        if self.bitwidth != other.bitwidth
            || self.tiling != other.tiling
            || self.implicit_dim != other.implicit_dim
        {
            return None;
        }
        let mut offsets = self.offsets;
        for (joined, theirs) in offsets.iter_mut().zip(other.offsets) {
            match (*joined, theirs) {
                (_, None) => {}
                (None, Some(o)) => *joined = Some(o),
                (Some(a), Some(b)) if a == b => {}
                (Some(_), Some(_)) => return None,
            }
        }
        Some(VectorLayout { offsets, ..*self })
    }

    /// The number of the two tiled dimensions that come from the value's shape.
    pub fn layout_rank(&self) -> usize {
        match self.implicit_dim {
            ImplicitDim::None => 2,
            ImplicitDim::SecondMinor | ImplicitDim::Minor => 1,
        }
    }

    /// The value's shape with the implicit dimension (if any) materialized as a unit dim.
    pub fn implicit_shape(&self, shape: &[DimSize]) -> Result<Shape, LayoutError> {
        if shape.len() < self.layout_rank() {
            return Err(LayoutError::RankTooSmall {
                shape: SmallVec::from_slice(shape),
                implicit_dim: self.implicit_dim,
            });
        }
        let mut implicit: Shape = SmallVec::from_slice(shape);
        match self.implicit_dim {
            ImplicitDim::None => {}
            ImplicitDim::SecondMinor => implicit.insert(shape.len() - 1, 1),
            ImplicitDim::Minor => implicit.push(1),
        }
        Ok(implicit)
    }

    /// The sizes of the two tiled dimensions of a value of the given shape.
    pub fn tiled_dims(&self, shape: &[DimSize]) -> Result<[DimSize; 2], LayoutError> {
        let implicit = self.implicit_shape(shape)?;
        let rank = implicit.len();
        Ok([implicit[rank - 2], implicit[rank - 1]])
    }

    /// Returns `true` if any value of `shape` laid out with `other` is also laid out correctly
    /// according to `self`.
    pub fn generalizes(&self, other: &VectorLayout, shape: &[DimSize], target: &TargetShape) -> bool {
        if self.bitwidth != other.bitwidth {
            return false;
        }
        for (mine, theirs) in self.offsets.iter().zip(other.offsets) {
            if mine.is_some() && *mine != theirs {
                return false;
            }
        }
        let (Ok(tiled), Ok(other_tiled)) = (self.tiled_dims(shape), other.tiled_dims(shape)) else {
            return false;
        };
        if self.implicit_dim != other.implicit_dim && tiled != other_tiled {
            return false;
        }
        if self.tiling != other.tiling {
            // Different tilings only agree when the whole value fits in a single tile of each.
            if self.tiling[1] != other.tiling[1] || self.tiling[1] != target.lanes {
                return false;
            }
            let rows = tiled[0] + other.offsets[0].unwrap_or(0);
            let cols = tiled[1] + other.offsets[1].unwrap_or(0);
            if rows > self.tiling[0].min(other.tiling[0]) || cols > self.tiling[1] {
                return false;
            }
        }
        true
    }

    pub fn equivalent_to(&self, other: &VectorLayout, shape: &[DimSize], target: &TargetShape) -> bool {
        self.generalizes(other, shape, target) && other.generalizes(self, shape, target)
    }
}

impl Display for VectorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let offset_str = |o: LayoutOffset| match o {
            Some(o) => o.to_string(),
            None => "*".to_owned(),
        };
        write!(
            f,
            "{},{{{},{}}},({},{})",
            self.bitwidth,
            offset_str(self.offsets[0]),
            offset_str(self.offsets[1]),
            self.tiling[0],
            self.tiling[1]
        )?;
        match self.implicit_dim {
            ImplicitDim::None => Ok(()),
            ImplicitDim::SecondMinor => write!(f, ",-2"),
            ImplicitDim::Minor => write!(f, ",-1"),
        }
    }
}

/// Wraps a [Layout] for display; absent layouts print as `none`.
pub struct DisplayLayout<'a>(pub &'a Layout);

impl Display for DisplayLayout<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(layout) => write!(f, "{layout}"),
            None => write!(f, "none"),
        }
    }
}

pub mod macros {
    /// Builds a [VectorLayout](crate::layout::VectorLayout).
    ///
    /// Offsets are written as integers or `*` (replicated), and an optional trailing
    /// `second_minor` or `minor` selects the implicit dim.
    ///
    /// ```
    /// # use tilelayout::vlayout;
    /// let l = vlayout!(32, (0, *), (8, 128));
    /// assert_eq!(l.to_string(), "32,{0,*},(8,128)");
    /// let l = vlayout!(16, (*, *), (16, 128), second_minor);
    /// assert_eq!(l.to_string(), "16,{*,*},(16,128),-2");
    /// ```
    #[macro_export]
    macro_rules! vlayout {
        (@off *) => { None };
        (@off $o:tt) => { Some($o) };
        (@imp second_minor) => { $crate::layout::ImplicitDim::SecondMinor };
        (@imp minor) => { $crate::layout::ImplicitDim::Minor };
        ($bw:expr, ($o0:tt, $o1:tt), ($t0:expr, $t1:expr)) => {
            $crate::layout::VectorLayout::new(
                $bw,
                [$crate::vlayout!(@off $o0), $crate::vlayout!(@off $o1)],
                [$t0, $t1],
                $crate::layout::ImplicitDim::None,
            )
        };
        ($bw:expr, ($o0:tt, $o1:tt), ($t0:expr, $t1:expr), $imp:ident) => {
            $crate::layout::VectorLayout::new(
                $bw,
                [$crate::vlayout!(@off $o0), $crate::vlayout!(@off $o1)],
                [$t0, $t1],
                $crate::vlayout!(@imp $imp),
            )
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vlayout;
    use proptest::prelude::*;

    fn arb_vector_layout() -> impl Strategy<Value = VectorLayout> {
        (
            prop::sample::select(vec![8u32, 16, 32]),
            prop::sample::select(vec![[1u32, 128u32], [8, 128], [16, 128]]),
            any::<ImplicitDim>(),
        )
            .prop_flat_map(|(bw, tiling, implicit_dim)| {
                (
                    prop::option::of(0..tiling[0]),
                    prop::option::of(0..tiling[1]),
                )
                    .prop_map(move |(o0, o1)| {
                        VectorLayout::new(bw, [o0, o1], tiling, implicit_dim)
                    })
            })
    }

    #[test]
    fn test_join_fills_replicated_offsets() {
        let replicated = vlayout!(32, (*, *), (8, 128));
        let lane_zero = vlayout!(32, (*, 0), (8, 128));
        assert_eq!(replicated.join(&lane_zero), Some(lane_zero));
        assert_eq!(lane_zero.join(&replicated), Some(lane_zero));
    }

    #[test]
    fn test_join_rejects_conflicting_offsets() {
        let a = vlayout!(32, (0, 0), (8, 128));
        let b = vlayout!(32, (1, 0), (8, 128));
        assert_eq!(a.join(&b), None);
    }

    #[test]
    fn test_join_rejects_mismatched_tiling_and_implicit_dim() {
        let a = vlayout!(32, (0, 0), (8, 128));
        assert_eq!(a.join(&vlayout!(32, (0, 0), (1, 128))), None);
        assert_eq!(a.join(&vlayout!(32, (0, 0), (8, 128), second_minor)), None);
        assert_eq!(vlayout!(16, (0, 0), (8, 128)).join(&a), None);
    }

    #[test]
    fn test_concretized_replaces_only_replicated_offsets() {
        let l = vlayout!(32, (*, 3), (8, 128));
        assert_eq!(l.concretized(), vlayout!(32, (0, 3), (8, 128)));
    }

    #[test]
    fn test_retile_reports_offsets_outside_tile() {
        let l = vlayout!(16, (12, 0), (16, 128));
        assert_eq!(
            l.retile([8, 128]),
            Err(LayoutError::OffsetOutsideTile {
                dim: 0,
                offset: 12,
                tiling: [8, 128]
            })
        );
        assert!(l.retile([32, 128]).is_ok());
    }

    #[test]
    fn test_implicit_shape() {
        let shape = [4, 128];
        assert_eq!(
            vlayout!(32, (0, 0), (8, 128)).implicit_shape(&shape).unwrap().as_slice(),
            &[4, 128]
        );
        assert_eq!(
            vlayout!(32, (0, 0), (8, 128), second_minor)
                .implicit_shape(&shape)
                .unwrap()
                .as_slice(),
            &[4, 1, 128]
        );
        assert_eq!(
            vlayout!(32, (0, 0), (8, 128), minor)
                .tiled_dims(&shape)
                .unwrap(),
            [128, 1]
        );
        assert!(vlayout!(32, (0, 0), (8, 128)).implicit_shape(&[128]).is_err());
    }

    #[test]
    fn test_second_minor_equivalent_to_2d_only_for_single_row() {
        let target = TargetShape::default();
        let two_d = vlayout!(32, (0, 0), (8, 128));
        let implicit = vlayout!(32, (0, 0), (8, 128), second_minor);
        assert!(implicit.equivalent_to(&two_d, &[4, 1, 128], &target));
        assert!(!implicit.equivalent_to(&two_d, &[4, 2, 128], &target));
    }

    #[test]
    fn test_replicated_layout_generalizes_concrete_one() {
        let target = TargetShape::default();
        let replicated = vlayout!(32, (*, *), (8, 128));
        let concrete = vlayout!(32, (2, 5), (8, 128));
        assert!(replicated.generalizes(&concrete, &[16, 256], &target));
        assert!(!concrete.generalizes(&replicated, &[16, 256], &target));
    }

    #[test]
    fn test_single_tile_values_ignore_tiling_rows() {
        let target = TargetShape::default();
        let strided = vlayout!(32, (0, 0), (1, 128));
        let default = vlayout!(32, (0, 0), (8, 128));
        assert!(strided.equivalent_to(&default, &[1, 128], &target));
        assert!(!strided.equivalent_to(&default, &[2, 128], &target));
    }

    #[test]
    fn test_display() {
        assert_eq!(vlayout!(32, (0, *), (8, 128)).to_string(), "32,{0,*},(8,128)");
        assert_eq!(
            vlayout!(32, (0, 0), (8, 128), minor).to_string(),
            "32,{0,0},(8,128),-1"
        );
        assert_eq!(DisplayLayout(&None).to_string(), "none");
    }

    proptest! {
        #[test]
        fn test_join_is_commutative(a in arb_vector_layout(), b in arb_vector_layout()) {
            prop_assert_eq!(a.join(&b), b.join(&a));
        }

        #[test]
        fn test_join_offsets_are_shared_or_replicated(
            a in arb_vector_layout(), b in arb_vector_layout()
        ) {
            if let Some(joined) = a.join(&b) {
                for i in 0..2 {
                    match joined.offsets()[i] {
                        None => {
                            prop_assert_eq!(a.offsets()[i], None);
                            prop_assert_eq!(b.offsets()[i], None);
                        }
                        Some(o) => {
                            prop_assert!(a.offsets()[i].map_or(true, |x| x == o));
                            prop_assert!(b.offsets()[i].map_or(true, |x| x == o));
                        }
                    }
                }
            }
        }

        #[test]
        fn test_join_is_idempotent(a in arb_vector_layout()) {
            prop_assert_eq!(a.join(&a), Some(a));
        }

        #[test]
        fn test_concretized_joins_with_original(a in arb_vector_layout()) {
            let c = a.concretized();
            prop_assert!(!c.offsets().contains(&None));
            prop_assert_eq!(a.join(&c), Some(c));
        }
    }
}
