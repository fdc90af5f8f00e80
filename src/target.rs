use crate::common::{Bitwidth, DimSize};

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// The bit-width of one register element. Narrower types are packed along sublanes.
pub const NATIVE_BITWIDTH: Bitwidth = 32;

pub type Tiling = [DimSize; 2];

/// The shape of one vector register: `sublanes` rows of `lanes` 32-bit elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TargetShape {
    pub sublanes: DimSize,
    pub lanes: DimSize,
}

impl TargetShape {
    pub fn new(sublanes: DimSize, lanes: DimSize) -> Self {
        assert!(sublanes > 0 && lanes > 0, "target shape must be positive");
        TargetShape { sublanes, lanes }
    }

    /// The tiling that fills one register with elements of the given bit-width.
    ///
    /// Narrow types pack `32 / bitwidth` values into each 32-bit slot, so the row count grows
    /// accordingly: for an 8x128 target, 16-bit data tiles as 16x128 and 8-bit data as 32x128.
    pub fn native_tiling(&self, bitwidth: Bitwidth) -> Tiling {
        debug_assert!(bitwidth > 0);
        [self.sublanes * NATIVE_BITWIDTH / bitwidth, self.lanes]
    }

    /// The native tiling of 32-bit data, which is also the register shape.
    pub fn default_tiling(&self) -> Tiling {
        self.native_tiling(NATIVE_BITWIDTH)
    }

    pub fn as_tiling(&self) -> Tiling {
        [self.sublanes, self.lanes]
    }
}

impl Default for TargetShape {
    fn default() -> Self {
        TargetShape::new(8, 128)
    }
}

impl Display for TargetShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.sublanes, self.lanes)
    }
}
