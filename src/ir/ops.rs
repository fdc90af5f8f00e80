use crate::common::DimSize;
use crate::layout::Layout;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Element-wise arithmetic and math operations. They all share one layout rule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::IntoStaticStr, strum::EnumIter,
)]
pub enum ArithOp {
    #[strum(serialize = "arith.addi")]
    AddI,
    #[strum(serialize = "arith.addf")]
    AddF,
    #[strum(serialize = "arith.subi")]
    SubI,
    #[strum(serialize = "arith.subf")]
    SubF,
    #[strum(serialize = "arith.muli")]
    MulI,
    #[strum(serialize = "arith.mulf")]
    MulF,
    #[strum(serialize = "arith.divf")]
    DivF,
    #[strum(serialize = "arith.divsi")]
    DivSI,
    #[strum(serialize = "arith.remsi")]
    RemSI,
    #[strum(serialize = "arith.maximumf")]
    MaximumF,
    #[strum(serialize = "arith.minimumf")]
    MinimumF,
    #[strum(serialize = "arith.andi")]
    AndI,
    #[strum(serialize = "arith.ori")]
    OrI,
    #[strum(serialize = "arith.xori")]
    XOrI,
    #[strum(serialize = "arith.negf")]
    NegF,
    #[strum(serialize = "math.exp")]
    Exp,
    #[strum(serialize = "math.log")]
    Log,
    #[strum(serialize = "math.tanh")]
    Tanh,
    #[strum(serialize = "math.rsqrt")]
    Rsqrt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantValue {
    Int(i64),
    Float(f64),
    /// A vector with every element equal.
    Splat,
    /// A vector with arbitrary elements.
    Dense,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CombiningKind {
    Add,
    Mul,
    MaxF,
    MinF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IteratorType {
    Parallel,
    Reduction,
}

/// An affine map that projects its input dimensions, e.g. `(d0, d1, d2) -> (d0, d2)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexingMap {
    pub num_dims: usize,
    pub results: SmallVec<[usize; 3]>,
}

impl IndexingMap {
    pub fn new(num_dims: usize, results: &[usize]) -> Self {
        debug_assert!(results.iter().all(|&r| r < num_dims));
        IndexingMap {
            num_dims,
            results: SmallVec::from_slice(results),
        }
    }
}

/// The closed set of operations the layout analysis understands.
///
/// Anything else is represented as [OpKind::Unknown] and is rejected unless it has no vector
/// operands or results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum OpKind {
    #[strum(serialize = "arith.constant")]
    Constant(ConstantValue),
    #[strum(serialize = "arith")]
    Arith(ArithOp),
    #[strum(serialize = "arith.extf")]
    ExtF,
    #[strum(serialize = "arith.extsi")]
    ExtSI,
    #[strum(serialize = "arith.extui")]
    ExtUI,
    #[strum(serialize = "arith.truncf")]
    TruncF,
    #[strum(serialize = "arith.trunci")]
    TruncI,
    #[strum(serialize = "arith.select")]
    Select,
    #[strum(serialize = "arith.cmpi")]
    CmpI,
    #[strum(serialize = "arith.cmpf")]
    CmpF,
    #[strum(serialize = "cf.assert")]
    Assert,
    #[strum(serialize = "func.return")]
    Return,
    #[strum(serialize = "memref.load")]
    MemRefLoad,
    #[strum(serialize = "scf.if")]
    If,
    #[strum(serialize = "scf.for")]
    For,
    #[strum(serialize = "scf.while")]
    While,
    #[strum(serialize = "scf.condition")]
    Condition,
    #[strum(serialize = "scf.yield")]
    Yield,
    #[strum(serialize = "tpu.rotate")]
    Rotate { amount: u32, dimension: usize },
    #[strum(serialize = "tpu.concatenate")]
    Concatenate { dimension: usize },
    #[strum(serialize = "tpu.load")]
    TpuLoad,
    #[strum(serialize = "tpu.store")]
    TpuStore,
    #[strum(serialize = "tpu.strided_load")]
    StridedLoad { strides: Vec<i32> },
    #[strum(serialize = "tpu.strided_store")]
    StridedStore { strides: Vec<i32> },
    #[strum(serialize = "tpu.matmul")]
    Matmul,
    #[strum(serialize = "tpu.erase_memref_layout")]
    EraseLayout,
    #[strum(serialize = "tpu.iota")]
    Iota { dimension: Option<usize> },
    #[strum(serialize = "tpu.gather")]
    Gather {
        indices: Vec<i32>,
        dimension: usize,
    },
    #[strum(serialize = "tpu.bitcast")]
    Bitcast,
    #[strum(serialize = "tpu.repeat")]
    Repeat { dimension: usize, times: u32 },
    #[strum(serialize = "tpu.trace")]
    Trace { message: String, level: u32 },
    #[strum(serialize = "tpu.region")]
    RegionOp,
    #[strum(serialize = "tpu.yield")]
    TpuYield,
    #[strum(serialize = "tpu.assume_multiple")]
    AssumeMultiple { multiple: u32 },
    /// Asserts that its operand is laid out as `layout` and forwards it unchanged.
    #[strum(serialize = "tpu.assume_layout")]
    AssumeLayout { layout: Layout },
    #[strum(serialize = "vector.broadcast")]
    Broadcast,
    #[strum(serialize = "vector.contract")]
    Contraction {
        kind: CombiningKind,
        iterator_types: Vec<IteratorType>,
        indexing_maps: Vec<IndexingMap>,
    },
    /// Extracts a scalar or sub-vector. `None` positions are dynamic.
    #[strum(serialize = "vector.extract")]
    Extract { position: Vec<Option<DimSize>> },
    #[strum(serialize = "vector.load")]
    VectorLoad,
    #[strum(serialize = "vector.extract_strided_slice")]
    ExtractStridedSlice {
        offsets: Vec<DimSize>,
        sizes: Vec<DimSize>,
        strides: Vec<DimSize>,
    },
    #[strum(serialize = "vector.multi_reduction")]
    MultiDimReduction {
        kind: CombiningKind,
        reduction_dims: Vec<usize>,
    },
    #[strum(serialize = "vector.shape_cast")]
    ShapeCast,
    #[strum(serialize = "vector.store")]
    VectorStore,
    #[strum(serialize = "vector.transpose")]
    Transpose { permutation: Vec<usize> },
    #[strum(serialize = "unknown")]
    Unknown(String),
}

impl OpKind {
    /// The printed name of this operation, e.g. `vector.load`.
    pub fn name(&self) -> &str {
        match self {
            OpKind::Arith(op) => {
                let name: &'static str = op.into();
                name
            }
            OpKind::Unknown(name) => name.as_str(),
            _ => {
                let name: &'static str = self.into();
                name
            }
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            OpKind::Return | OpKind::Yield | OpKind::Condition | OpKind::TpuYield
        )
    }

    /// Operations whose tiling is fixed by the matrix unit, and so prefer narrow operands in
    /// their native tiling.
    pub fn is_matmul_like(&self) -> bool {
        matches!(self, OpKind::Matmul | OpKind::Contraction { .. })
    }

    /// The operand and result counts every well-formed instance of this operation has.
    ///
    /// `None` for variadic operations and for those whose structure is checked alongside their
    /// regions.
    pub fn arity(&self) -> Option<Arity> {
        use Arity::{AtLeast, Exactly};
        let arity = match self {
            OpKind::Constant(_) | OpKind::Iota { .. } => Exactly(0, 1),
            OpKind::ExtF
            | OpKind::ExtSI
            | OpKind::ExtUI
            | OpKind::TruncF
            | OpKind::TruncI
            | OpKind::Bitcast
            | OpKind::Broadcast
            | OpKind::ShapeCast
            | OpKind::Transpose { .. }
            | OpKind::ExtractStridedSlice { .. }
            | OpKind::EraseLayout
            | OpKind::AssumeLayout { .. } => Exactly(1, 1),
            OpKind::CmpI | OpKind::CmpF | OpKind::MultiDimReduction { .. } => Exactly(2, 1),
            OpKind::Select | OpKind::Matmul | OpKind::Contraction { .. } => Exactly(3, 1),
            OpKind::Arith(_)
            | OpKind::Rotate { .. }
            | OpKind::Concatenate { .. }
            | OpKind::Gather { .. }
            | OpKind::Repeat { .. }
            | OpKind::Extract { .. }
            | OpKind::VectorLoad
            | OpKind::TpuLoad
            | OpKind::StridedLoad { .. } => AtLeast(1, 1),
            OpKind::VectorStore | OpKind::TpuStore | OpKind::StridedStore { .. } => AtLeast(2, 0),
            OpKind::Assert
            | OpKind::Return
            | OpKind::MemRefLoad
            | OpKind::If
            | OpKind::For
            | OpKind::While
            | OpKind::Condition
            | OpKind::Yield
            | OpKind::Trace { .. }
            | OpKind::RegionOp
            | OpKind::TpuYield
            | OpKind::AssumeMultiple { .. }
            | OpKind::Unknown(_) => return None,
        };
        Some(arity)
    }
}

/// Operand and result counts, as `(operands, results)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize, usize),
    /// At least this many operands, and exactly this many results.
    AtLeast(usize, usize),
}

impl Arity {
    pub fn admits(self, operands: usize, results: usize) -> bool {
        match self {
            Arity::Exactly(o, r) => operands == o && results == r,
            Arity::AtLeast(o, r) => operands >= o && results == r,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(o, r) => write!(f, "{o} operand(s) and {r} result(s)"),
            Arity::AtLeast(o, r) => write!(f, "at least {o} operand(s) and {r} result(s)"),
        }
    }
}
