use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Display;

pub type DimSize = u32;
pub type Shape = SmallVec<[DimSize; 5]>;
pub type Bitwidth = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Bool,
    Sint8,
    Sint16,
    Sint32,
    Index,
    Bfloat16,
    Float16,
    Float32,
}

impl Dtype {
    /// The number of bits used to store a value of this [Dtype] in a vector register.
    pub fn bitwidth(&self) -> Bitwidth {
        match self {
            Dtype::Bool => 1,
            Dtype::Sint8 => 8,
            Dtype::Sint16 | Dtype::Bfloat16 | Dtype::Float16 => 16,
            Dtype::Sint32 | Dtype::Float32 => 32,
            Dtype::Index => 64,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Dtype::Bfloat16 | Dtype::Float16 | Dtype::Float32)
    }

    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Bool => write!(f, "i1"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Sint16 => write!(f, "i16"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Index => write!(f, "index"),
            Dtype::Bfloat16 => write!(f, "bf16"),
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Float32 => write!(f, "f32"),
        }
    }
}

pub mod macros {
    #[macro_export]
    macro_rules! shape {
        ($dim:expr; $n:expr) => {{
            // Bind to a variable with an explicit type to help out type inference.
            let sv: $crate::common::Shape = $crate::smallvec::smallvec![ $dim; $n ];
            sv
        }};
        ($($dim:expr),*$(,)*) => {{
            // Bind to a variable with an explicit type to help out type inference.
            let sv: $crate::common::Shape = $crate::smallvec::smallvec![ $( $dim ),* ];
            sv
        }};
    }
}
