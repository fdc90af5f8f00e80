//! Vector layout inference.
//!
//! Walks a [Function] in program order and assigns every operand and result a [Layout]. Each
//! operation kind has a rule that derives its layouts from the layouts of its operands (which
//! were assigned when their producers were visited). Structured control flow recurses into its
//! regions and reconciles the layouts flowing out of them.

use crate::annotations::{LayoutAnnotations, LayoutList};
use crate::common::Bitwidth;
use crate::divisibility::{ArithDivisibility, DivisibilityOracle};
use crate::ir::{BlockId, Function, OpId, OpKind, Type, ValueDef, ValueId, VectorType};
use crate::layout::{DisplayLayout, Layout, LayoutError, VectorLayout};
use crate::target::TargetShape;
use crate::utils::join_into_string;

use log::{debug, trace};
use rayon::prelude::*;
use smallvec::smallvec;

/// Returns [InferenceError::Unsupported] from the enclosing rule unless `cond` holds.
macro_rules! check_op {
    ($self:ident, $cond:expr, $op:expr, $($msg:tt)+) => {
        if !$cond {
            return Err($self.unsupported($op, format!($($msg)+)));
        }
    };
}

/// Returns [InferenceError::NotImplemented] from the enclosing rule.
macro_rules! nyi {
    ($self:ident, $op:expr, $($msg:tt)+) => {
        return Err($self.not_implemented($op, format!($($msg)+)))
    };
}

mod broadcast;
mod casts;
mod constants;
mod control_flow;
mod elementwise;
mod error;
mod matmul;
mod memory;
mod reduction;
mod shape_cast;
#[cfg(test)]
mod testing;
mod transpose;
mod vreg;

pub use error::{InferenceError, OpRef};

pub type Result<T> = std::result::Result<T, InferenceError>;

/// Infers layouts for every operation of `func`.
///
/// `func` is mutated only to insert `tpu.assume_layout` markers on loop-carried block
/// arguments. On failure no annotations are returned.
pub fn infer_layouts(func: &mut Function, target: TargetShape) -> Result<LayoutAnnotations> {
    infer_layouts_with(func, target, &ArithDivisibility)
}

pub fn infer_layouts_with(
    func: &mut Function,
    target: TargetShape,
    oracle: &dyn DivisibilityOracle,
) -> Result<LayoutAnnotations> {
    let mut inferer = LayoutInferer::new(func, target, oracle);
    inferer.infer_function()?;
    Ok(inferer.annotations)
}

/// Infers layouts for independent functions in parallel. Results are in `funcs` order.
pub fn infer_module(funcs: &mut [Function], target: TargetShape) -> Vec<Result<LayoutAnnotations>> {
    funcs
        .par_iter_mut()
        .map(|func| infer_layouts(func, target))
        .collect()
}

/// The terminator a block must end with, chosen by the operation that owns the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminator {
    Return,
    Yield,
    Condition,
    TpuYield,
}

impl Terminator {
    fn matches(&self, kind: &OpKind) -> bool {
        matches!(
            (self, kind),
            (Terminator::Return, OpKind::Return)
                | (Terminator::Yield, OpKind::Yield)
                | (Terminator::Condition, OpKind::Condition)
                | (Terminator::TpuYield, OpKind::TpuYield)
        )
    }
}

pub(crate) struct LayoutInferer<'a> {
    func: &'a mut Function,
    target: TargetShape,
    oracle: &'a dyn DivisibilityOracle,
    annotations: LayoutAnnotations,
}

impl<'a> LayoutInferer<'a> {
    pub(crate) fn new(
        func: &'a mut Function,
        target: TargetShape,
        oracle: &'a dyn DivisibilityOracle,
    ) -> Self {
        LayoutInferer {
            func,
            target,
            oracle,
            annotations: LayoutAnnotations::new(),
        }
    }

    fn infer_function(&mut self) -> Result<()> {
        let Some(block) = self.func.body.single_block() else {
            return Err(InferenceError::InvalidFunction {
                function: self.func.name.clone(),
                message: "Only one block functions supported".to_owned(),
            });
        };
        debug!("Inferring layouts for {} on a {} target", self.func.name, self.target);
        self.infer_block(block, Terminator::Return)
    }

    /// Infers every operation of `block` except the terminator, then checks the terminator.
    ///
    /// Return and `tpu.yield` terminators are annotated here. `scf.yield` and `scf.condition`
    /// are annotated by the owning operation once it has reconciled its regions.
    pub(crate) fn infer_block(&mut self, block: BlockId, terminator: Terminator) -> Result<()> {
        let ops = self.func.block(block).ops.clone();
        let Some((&last, body)) = ops.split_last() else {
            return Err(match self.func.block(block).parent_op {
                Some(parent) => self.malformed(parent, "block has no terminator"),
                None => InferenceError::InvalidFunction {
                    function: self.func.name.clone(),
                    message: "function body has no terminator".to_owned(),
                },
            });
        };
        for &op in body {
            self.infer_op(op)?;
            debug_assert!(
                self.annotations.is_annotated(op),
                "rule for {} left it unannotated",
                self.op_ref(op)
            );
        }
        self.check_terminator(last, terminator)
    }

    fn check_terminator(&mut self, op: OpId, expected: Terminator) -> Result<()> {
        let operation = self.func.op(op).clone();
        if !expected.matches(&operation.kind) {
            let message = match expected {
                Terminator::Return => "Expected func.return terminator",
                Terminator::Yield => "expected yield terminator",
                Terminator::Condition => "expected condition terminator",
                Terminator::TpuYield => "expected tpu.yield terminator",
            };
            return Err(self.malformed(op, message));
        }
        match expected {
            Terminator::Return | Terminator::TpuYield => {
                for &operand in &operation.operands {
                    check_op!(
                        self,
                        !self.func.value_type(operand).is_vector(),
                        op,
                        "vector returns unsupported"
                    );
                }
                self.set_in_layouts(op, smallvec![None; operation.operands.len()]);
            }
            Terminator::Yield | Terminator::Condition => {}
        }
        Ok(())
    }

    fn infer_op(&mut self, op: OpId) -> Result<()> {
        let operation = self.func.op(op).clone();
        trace!("Inferring {}", self.op_ref(op));

        if self.annotations.is_annotated(op) {
            if matches!(operation.kind, OpKind::AssumeLayout { .. }) {
                return Ok(());
            }
            return Err(self.malformed(op, "layout attributes already attached"));
        }

        let has_vector_io = operation
            .operands
            .iter()
            .chain(&operation.results)
            .any(|v| self.func.value_type(*v).is_vector());
        if !has_vector_io && operation.regions.is_empty() {
            if operation.results.len() > 1 {
                return Err(self.malformed(op, "Multi-result ops not supported"));
            }
            self.set_layouts(
                op,
                smallvec![None; operation.operands.len()],
                smallvec![None; operation.results.len()],
            );
            return Ok(());
        }

        if let Some(arity) = operation.kind.arity() {
            if !arity.admits(operation.operands.len(), operation.results.len()) {
                return Err(self.malformed(op, format!("expected {arity}")));
            }
        }

        match &operation.kind {
            OpKind::Constant(value) => self.infer_constant(op, &operation, value),
            OpKind::Arith(_) => self.infer_elementwise(op, &operation, true),
            OpKind::ExtF | OpKind::ExtSI => self.infer_ext(op, &operation),
            OpKind::ExtUI => self.infer_extui(op, &operation),
            OpKind::TruncF | OpKind::TruncI => self.infer_trunc(op, &operation),
            OpKind::Select => self.infer_select(op, &operation),
            OpKind::CmpI | OpKind::CmpF => self.infer_cmp(op, &operation),
            OpKind::Assert => self.infer_assert(op, &operation),
            OpKind::MemRefLoad => self.infer_memref_load(op, &operation),
            OpKind::If => self.infer_if(op, &operation),
            OpKind::For => self.infer_for(op, &operation),
            OpKind::While => self.infer_while(op, &operation),
            OpKind::Condition => self.infer_condition(op, &operation),
            OpKind::Rotate { .. } => self.infer_rotate(op, &operation),
            OpKind::Concatenate { dimension } => self.infer_concatenate(op, &operation, *dimension),
            OpKind::TpuLoad => self.infer_tpu_load(op, &operation),
            OpKind::TpuStore => self.infer_tpu_store(op, &operation),
            OpKind::StridedLoad { .. } => self.infer_strided_load(op, &operation),
            OpKind::StridedStore { .. } => self.infer_strided_store(op, &operation),
            OpKind::Matmul => self.infer_matmul(op, &operation),
            OpKind::EraseLayout => self.infer_erase_layout(op, &operation),
            OpKind::Iota { dimension } => self.infer_iota(op, &operation, *dimension),
            OpKind::Gather { .. } | OpKind::Repeat { .. } => {
                self.infer_source_passthrough(op, &operation)
            }
            OpKind::Bitcast => self.infer_bitcast(op, &operation),
            OpKind::Trace { .. } | OpKind::RegionOp => self.infer_wrapper_region(op, &operation),
            OpKind::AssumeLayout { layout } => {
                self.set_layouts(op, smallvec![*layout], smallvec![*layout]);
                Ok(())
            }
            OpKind::Broadcast => self.infer_broadcast(op, &operation),
            OpKind::Contraction {
                kind,
                iterator_types,
                indexing_maps,
            } => self.infer_contraction(op, &operation, *kind, iterator_types, indexing_maps),
            OpKind::Extract { position } => self.infer_extract(op, &operation, position),
            OpKind::VectorLoad => self.infer_vector_load(op, &operation),
            OpKind::VectorStore => self.infer_vector_store(op, &operation),
            OpKind::ExtractStridedSlice {
                offsets, strides, ..
            } => self.infer_extract_strided_slice(op, &operation, offsets, strides),
            OpKind::MultiDimReduction { reduction_dims, .. } => {
                self.infer_multi_reduction(op, &operation, reduction_dims)
            }
            OpKind::ShapeCast => self.infer_shape_cast(op, &operation),
            OpKind::Transpose { permutation } => self.infer_transpose(op, &operation, permutation),
            OpKind::AssumeMultiple { .. }
            | OpKind::Return
            | OpKind::Yield
            | OpKind::TpuYield
            | OpKind::Unknown(_) => {
                Err(self.unsupported(op, "unsupported in vector layout inference"))
            }
        }
    }

    /// The layout of a value, as assigned when its producer was visited.
    pub(crate) fn layout_of(&self, value: ValueId) -> Result<Layout> {
        match self.func.value(value).def {
            ValueDef::OpResult { op, index } => match self.annotations.out_layouts(op) {
                Some(outs) => Ok(outs[index]),
                None => Err(self.malformed(op, format!("result {value} used before it has a layout"))),
            },
            ValueDef::BlockArg { block, .. } => match self.annotations.arg_layout(value) {
                Some(layout) => Ok(layout),
                None if !self.func.value_type(value).is_vector() => Ok(None),
                None => {
                    let message = format!("vector block argument {value} has no layout");
                    Err(match self.func.block(block).parent_op {
                        Some(parent) => self.malformed(parent, message),
                        None => InferenceError::InvalidFunction {
                            function: self.func.name.clone(),
                            message,
                        },
                    })
                }
            },
        }
    }

    /// The layout of a vector operand, or an error naming `op` if there is none.
    pub(crate) fn vector_layout_of(&self, op: OpId, value: ValueId) -> Result<VectorLayout> {
        match self.layout_of(value)? {
            Some(layout) => Ok(layout),
            None => Err(self.malformed(op, "missing vector layout")),
        }
    }

    /// Vector operands' layouts, with [None] for every other operand.
    pub(crate) fn operand_layouts(&self, operands: &[ValueId]) -> Result<LayoutList> {
        operands
            .iter()
            .map(|&v| {
                if self.func.value_type(v).is_vector() {
                    self.layout_of(v)
                } else {
                    Ok(None)
                }
            })
            .collect()
    }

    pub(crate) fn set_layouts(&mut self, op: OpId, ins: LayoutList, outs: LayoutList) {
        let operation = self.func.op(op);
        assert_eq!(ins.len(), operation.operands.len(), "input layouts of {op}");
        assert_eq!(outs.len(), operation.results.len(), "output layouts of {op}");
        trace!(
            "{}: in [{}] out [{}]",
            operation.name(),
            join_into_string(ins.iter().map(DisplayLayout), ", "),
            join_into_string(outs.iter().map(DisplayLayout), ", ")
        );
        self.annotations.set(op, ins, outs);
    }

    pub(crate) fn set_in_layouts(&mut self, op: OpId, ins: LayoutList) {
        assert_eq!(ins.len(), self.func.op(op).operands.len(), "input layouts of {op}");
        self.annotations.set_ins(op, ins);
    }

    pub(crate) fn vector_type(&self, value: ValueId) -> Option<&VectorType> {
        self.func.value_type(value).as_vector()
    }

    pub(crate) fn bitwidth(&self, value: ValueId) -> Bitwidth {
        self.func.value_type(value).dtype().bitwidth()
    }

    pub(crate) fn value_type(&self, value: ValueId) -> &Type {
        self.func.value_type(value)
    }

    pub(crate) fn op_ref(&self, op: OpId) -> OpRef {
        OpRef {
            id: op,
            name: self.func.op(op).name().to_owned(),
        }
    }

    pub(crate) fn unsupported(&self, op: OpId, message: impl Into<String>) -> InferenceError {
        InferenceError::Unsupported {
            op: self.op_ref(op),
            message: message.into(),
        }
    }

    pub(crate) fn not_implemented(&self, op: OpId, message: impl Into<String>) -> InferenceError {
        InferenceError::NotImplemented {
            op: self.op_ref(op),
            message: message.into(),
        }
    }

    pub(crate) fn malformed(&self, op: OpId, message: impl Into<String>) -> InferenceError {
        InferenceError::Malformed {
            op: self.op_ref(op),
            message: message.into(),
        }
    }

    /// Converts a lattice error raised while deriving `op`'s layouts.
    pub(crate) fn layout_error(&self, op: OpId, e: LayoutError) -> InferenceError {
        self.not_implemented(op, e.to_string())
    }

    /// The two minor-most dims of a shape of rank at least 2.
    pub(crate) fn minor_dims(shape: &[u32]) -> (u32, u32) {
        debug_assert!(shape.len() >= 2);
        (shape[shape.len() - 2], shape[shape.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::common::Dtype;
    use crate::ir::{ArithOp, CombiningKind, ConstantValue, FunctionBuilder, Region};
    use crate::{shape, vlayout};
    use proptest::prelude::*;

    #[test]
    fn test_scalar_ops_get_no_layout() {
        let mut b = FunctionBuilder::new("scalars");
        let x = b.add_argument(Type::Scalar(Dtype::Sint32));
        let c = b.constant_scalar(ConstantValue::Int(3), Dtype::Sint32);
        let sum = b.arith(ArithOp::AddI, &[x, c]);
        b.func_return(&[sum]);
        let (func, annotations) = infer_ok(b);
        assert_complete(&func, &annotations);
        for (_, layouts) in annotations.iter() {
            assert!(layouts.ins.iter().chain(&layouts.outs).all(Option::is_none));
        }
    }

    #[test]
    fn test_ops_with_the_wrong_arity_are_rejected() {
        let v = || Type::vector(shape![8, 128], Dtype::Float32);
        let cases: Vec<(OpKind, usize, Vec<Type>)> = vec![
            (OpKind::Broadcast, 0, vec![v()]),
            (OpKind::ShapeCast, 0, vec![v()]),
            (OpKind::Bitcast, 0, vec![v()]),
            (OpKind::ExtF, 2, vec![v()]),
            (OpKind::Transpose { permutation: vec![1, 0] }, 0, vec![v()]),
            (
                OpKind::MultiDimReduction {
                    kind: CombiningKind::Add,
                    reduction_dims: vec![1],
                },
                1,
                vec![v()],
            ),
            (OpKind::Rotate { amount: 1, dimension: 1 }, 0, vec![v()]),
            (OpKind::Concatenate { dimension: 0 }, 0, vec![v()]),
            (OpKind::Extract { position: vec![Some(0), Some(0)] }, 0, vec![v()]),
            (
                OpKind::ExtractStridedSlice {
                    offsets: vec![0, 0],
                    sizes: vec![8, 128],
                    strides: vec![1, 1],
                },
                1,
                vec![],
            ),
            (OpKind::Select, 2, vec![v()]),
            (OpKind::CmpF, 1, vec![v()]),
            (OpKind::Arith(ArithOp::AddF), 2, vec![v(), v()]),
            (OpKind::Matmul, 2, vec![v()]),
            (OpKind::VectorLoad, 0, vec![v()]),
            (OpKind::VectorStore, 1, vec![]),
            (OpKind::TpuStore, 1, vec![]),
            (OpKind::Iota { dimension: Some(0) }, 1, vec![v()]),
            (OpKind::AssumeLayout { layout: None }, 1, vec![v(), v()]),
        ];
        for (kind, num_operands, result_types) in cases {
            let mut b = FunctionBuilder::new("arity");
            let x = b.constant_splat(v());
            let name = kind.name().to_owned();
            let arity = kind.arity().unwrap();
            b.op(kind, &vec![x; num_operands], &result_types);
            b.func_return(&[]);
            let e = infer_err(b);
            assert!(matches!(e, InferenceError::Malformed { .. }), "{name}: {e}");
            assert_eq!(e.message(), format!("expected {arity}"), "{name}");
        }
    }

    #[test]
    fn test_multi_result_scalar_op_is_rejected() {
        let mut b = FunctionBuilder::new("multi");
        let i = Type::Scalar(Dtype::Sint32);
        b.op(OpKind::Unknown("test.pair".to_owned()), &[], &[i.clone(), i]);
        b.func_return(&[]);
        let e = infer_err(b);
        assert!(matches!(e, InferenceError::Malformed { .. }));
        assert_eq!(e.message(), "Multi-result ops not supported");
    }

    #[test]
    fn test_unknown_vector_op_is_rejected() {
        let mut b = FunctionBuilder::new("unknown");
        let v = b.constant_splat(Type::vector(shape![8, 128], Dtype::Float32));
        b.op1(
            OpKind::Unknown("test.mystery".to_owned()),
            &[v],
            Type::vector(shape![8, 128], Dtype::Float32),
        );
        b.func_return(&[]);
        let e = infer_err(b);
        assert_eq!(e.message(), "unsupported in vector layout inference");
        assert_eq!(e.op().map(|op| op.name.as_str()), Some("test.mystery"));
    }

    #[test]
    fn test_vector_return_is_rejected() {
        let mut b = FunctionBuilder::new("ret");
        let v = b.constant_splat(Type::vector(shape![8, 128], Dtype::Float32));
        b.func_return(&[v]);
        let e = infer_err(b);
        assert_eq!(e.message(), "vector returns unsupported");
    }

    #[test]
    fn test_missing_return_is_rejected() {
        let mut b = FunctionBuilder::new("noreturn");
        b.constant_index(0);
        let e = infer_err(b);
        assert_eq!(e.message(), "Expected func.return terminator");
    }

    #[test]
    fn test_multi_block_function_is_rejected() {
        let mut b = FunctionBuilder::new("blocks");
        b.func_return(&[]);
        let mut func = b.finish();
        let extra = func.create_block(&[]);
        func.body.blocks.push(extra);
        let e = infer_layouts(&mut func, TargetShape::default()).unwrap_err();
        assert!(matches!(e, InferenceError::InvalidFunction { .. }));
        assert_eq!(e.message(), "Only one block functions supported");
    }

    #[test]
    fn test_inference_rejects_reannotation() {
        let mut b = FunctionBuilder::new("twice");
        b.constant_splat(Type::vector(shape![8, 128], Dtype::Float32));
        b.func_return(&[]);
        let mut func = b.finish();
        let oracle = ArithDivisibility;
        let mut inferer = LayoutInferer::new(&mut func, TargetShape::default(), &oracle);
        inferer.infer_function().unwrap();
        let e = inferer.infer_function().unwrap_err();
        assert_eq!(e.message(), "layout attributes already attached");
    }

    #[test]
    fn test_infer_module_keeps_function_order() {
        let mut funcs = (0..4)
            .map(|i| {
                let mut b = FunctionBuilder::new(format!("f{i}"));
                if i % 2 == 1 {
                    b.constant_dense(Type::vector(shape![128], Dtype::Float32));
                }
                b.func_return(&[]);
                b.finish()
            })
            .collect::<Vec<_>>();
        let results = infer_module(&mut funcs, TargetShape::default());
        assert_eq!(results.len(), 4);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.is_ok(), i % 2 == 0, "function {i}");
        }
    }

    #[test]
    fn test_empty_else_region_is_allowed_without_results() {
        let mut b = FunctionBuilder::new("if");
        let cond = b.add_argument(Type::Scalar(Dtype::Bool));
        let if_op = b.if_then(cond, |b| {
            b.constant_splat(Type::vector(shape![8, 128], Dtype::Float32));
        });
        b.func_return(&[]);
        let (func, annotations) = infer_ok(b);
        assert_complete(&func, &annotations);
        assert_eq!(func.op(if_op).regions[1], Region::default());
    }

    fn elementwise_chain(ops: &[ArithOp]) -> FunctionBuilder {
        let mut b = FunctionBuilder::new("chain");
        let ty = Type::vector(shape![16, 256], Dtype::Float32);
        let memref = b.add_argument(memref_type(&[16, 256], Dtype::Float32, &[&[8, 128]]));
        let c0 = b.constant_index(0);
        let mut acc = b.vector_load(memref, &[c0, c0], ty.clone());
        let splat = b.constant_splat(ty);
        for op in ops {
            let next = b.arith(*op, &[acc, splat]);
            acc = next;
        }
        b.vector_store(acc, memref, &[c0, c0]);
        b.func_return(&[]);
        b
    }

    proptest! {
        #[test]
        fn test_elementwise_chains_are_fully_annotated(
            ops in prop::collection::vec(
                prop::sample::select(vec![ArithOp::AddF, ArithOp::MulF, ArithOp::SubF, ArithOp::MaximumF]),
                0..8,
            )
        ) {
            let (func, annotations) = infer_ok(elementwise_chain(&ops));
            prop_assert!(annotations.incomplete_ops(&func).is_empty());
            let expected = Some(vlayout!(32, (0, 0), (8, 128)));
            for (op, layouts) in annotations.iter() {
                if matches!(func.op(op).kind, OpKind::Arith(_)) {
                    prop_assert_eq!(layouts.outs.as_slice(), &[expected][..]);
                }
            }
        }
    }
}
