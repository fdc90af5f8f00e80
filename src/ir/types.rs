use crate::common::{Bitwidth, DimSize, Dtype, Shape};
use crate::utils::join_into_string;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display};

/// One level of a memref's tile hierarchy, e.g. `(8, 128)` or `(2, 1)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Tile(pub SmallVec<[DimSize; 2]>);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct VectorType {
    pub shape: Shape,
    pub dtype: Dtype,
}

/// A buffer in memory. `tiles` lists the tiled layout from outermost to innermost level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MemRefType {
    pub shape: Shape,
    pub dtype: Dtype,
    pub tiles: Vec<Tile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Type {
    Scalar(Dtype),
    Vector(VectorType),
    MemRef(MemRefType),
}

impl Type {
    pub fn vector(shape: Shape, dtype: Dtype) -> Self {
        Type::Vector(VectorType { shape, dtype })
    }

    pub fn memref(shape: Shape, dtype: Dtype, tiles: Vec<Tile>) -> Self {
        Type::MemRef(MemRefType {
            shape,
            dtype,
            tiles,
        })
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Type::Vector(_))
    }

    pub fn as_vector(&self) -> Option<&VectorType> {
        match self {
            Type::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_memref(&self) -> Option<&MemRefType> {
        match self {
            Type::MemRef(m) => Some(m),
            _ => None,
        }
    }

    /// Whether this is a scalar integer, index, or float.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Scalar(_))
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            Type::Scalar(dtype) => *dtype,
            Type::Vector(v) => v.dtype,
            Type::MemRef(m) => m.dtype,
        }
    }
}

impl VectorType {
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn bitwidth(&self) -> Bitwidth {
        self.dtype.bitwidth()
    }
}

impl Tile {
    pub fn dimensions(&self) -> &[DimSize] {
        &self.0
    }
}

/// Builds a [Tile] from its dimensions: `tile![8, 128]`.
#[macro_export]
macro_rules! tile {
    ($($dim:expr),*$(,)*) => {
        $crate::ir::Tile($crate::smallvec::smallvec![ $( $dim ),* ])
    };
}

impl Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", join_into_string(&self.0, ","))
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(dtype) => write!(f, "{dtype}"),
            Type::Vector(v) => {
                write!(f, "vector<")?;
                for d in &v.shape {
                    write!(f, "{d}x")?;
                }
                write!(f, "{}>", v.dtype)
            }
            Type::MemRef(m) => {
                write!(f, "memref<")?;
                for d in &m.shape {
                    write!(f, "{d}x")?;
                }
                write!(f, "{}", m.dtype)?;
                if !m.tiles.is_empty() {
                    write!(f, ", #tiled<{}>", join_into_string(&m.tiles, ""))?;
                }
                write!(f, ">")
            }
        }
    }
}
