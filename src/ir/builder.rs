use super::{
    ArithOp, BlockId, ConstantValue, Function, OpId, OpKind, Region, Type, ValueId,
};
use crate::common::Dtype;

/// Appends operations to a [Function], one block at a time.
///
/// Region-carrying operations take closures that build the nested block; the closure's return
/// value becomes the operands of the block's terminator.
pub struct FunctionBuilder {
    func: Function,
    insertion: Vec<BlockId>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let func = Function::new(name);
        let entry = func.entry_block();
        FunctionBuilder {
            func,
            insertion: vec![entry],
        }
    }

    pub fn finish(self) -> Function {
        self.func
    }

    pub fn func(&self) -> &Function {
        &self.func
    }

    pub fn add_argument(&mut self, ty: Type) -> ValueId {
        let entry = self.func.entry_block();
        self.func.add_block_arg(entry, ty)
    }

    pub fn value_type(&self, value: ValueId) -> &Type {
        self.func.value_type(value)
    }

    pub fn result(&self, op: OpId, index: usize) -> ValueId {
        self.func.op(op).results[index]
    }

    fn current_block(&self) -> BlockId {
        *self
            .insertion
            .last()
            .unwrap_or_else(|| unreachable!("builder has no insertion block"))
    }

    pub fn op_with_regions(
        &mut self,
        kind: OpKind,
        operands: &[ValueId],
        result_types: &[Type],
        regions: Vec<Region>,
    ) -> OpId {
        let op = self.func.create_op(kind, operands, result_types, regions);
        let block = self.current_block();
        let position = self.func.block(block).ops.len();
        self.func.insert_op(block, position, op);
        op
    }

    pub fn op(&mut self, kind: OpKind, operands: &[ValueId], result_types: &[Type]) -> OpId {
        self.op_with_regions(kind, operands, result_types, vec![])
    }

    /// Appends a single-result operation and returns its result.
    pub fn op1(&mut self, kind: OpKind, operands: &[ValueId], ty: Type) -> ValueId {
        let op = self.op(kind, operands, &[ty]);
        self.result(op, 0)
    }

    pub fn constant_index(&mut self, value: i64) -> ValueId {
        self.op1(
            OpKind::Constant(ConstantValue::Int(value)),
            &[],
            Type::Scalar(Dtype::Index),
        )
    }

    pub fn constant_scalar(&mut self, value: ConstantValue, dtype: Dtype) -> ValueId {
        self.op1(OpKind::Constant(value), &[], Type::Scalar(dtype))
    }

    pub fn constant_splat(&mut self, ty: Type) -> ValueId {
        self.op1(OpKind::Constant(ConstantValue::Splat), &[], ty)
    }

    pub fn constant_dense(&mut self, ty: Type) -> ValueId {
        self.op1(OpKind::Constant(ConstantValue::Dense), &[], ty)
    }

    /// An element-wise operation whose result has the type of its first operand.
    pub fn arith(&mut self, op: ArithOp, operands: &[ValueId]) -> ValueId {
        let ty = self.value_type(operands[0]).clone();
        self.op1(OpKind::Arith(op), operands, ty)
    }

    pub fn vector_load(&mut self, memref: ValueId, indices: &[ValueId], ty: Type) -> ValueId {
        let mut operands = vec![memref];
        operands.extend_from_slice(indices);
        self.op1(OpKind::VectorLoad, &operands, ty)
    }

    pub fn vector_store(&mut self, value: ValueId, memref: ValueId, indices: &[ValueId]) -> OpId {
        let mut operands = vec![value, memref];
        operands.extend_from_slice(indices);
        self.op(OpKind::VectorStore, &operands, &[])
    }

    pub fn func_return(&mut self, values: &[ValueId]) -> OpId {
        self.op(OpKind::Return, values, &[])
    }

    pub(crate) fn build_block(
        &mut self,
        arg_types: &[Type],
        body: impl FnOnce(&mut Self, &[ValueId]),
    ) -> Region {
        let block = self.func.create_block(arg_types);
        let args = self.func.block(block).args.clone();
        self.insertion.push(block);
        body(self, &args);
        self.insertion.pop();
        Region {
            blocks: vec![block],
        }
    }

    /// An `scf.if` with both branches. Each closure returns the values its branch yields.
    pub fn if_then_else(
        &mut self,
        condition: ValueId,
        result_types: &[Type],
        then_body: impl FnOnce(&mut Self) -> Vec<ValueId>,
        else_body: impl FnOnce(&mut Self) -> Vec<ValueId>,
    ) -> OpId {
        let then_region = self.build_block(&[], |b, _| {
            let yielded = then_body(b);
            b.op(OpKind::Yield, &yielded, &[]);
        });
        let else_region = self.build_block(&[], |b, _| {
            let yielded = else_body(b);
            b.op(OpKind::Yield, &yielded, &[]);
        });
        self.op_with_regions(
            OpKind::If,
            &[condition],
            result_types,
            vec![then_region, else_region],
        )
    }

    /// An `scf.if` with no results and an empty else region.
    pub fn if_then(&mut self, condition: ValueId, then_body: impl FnOnce(&mut Self)) -> OpId {
        let then_region = self.build_block(&[], |b, _| {
            then_body(b);
            b.op(OpKind::Yield, &[], &[]);
        });
        self.op_with_regions(
            OpKind::If,
            &[condition],
            &[],
            vec![then_region, Region::default()],
        )
    }

    /// An `scf.for` carrying `inits`. The body receives the induction variable and the
    /// iteration arguments and returns the values to carry into the next iteration.
    pub fn for_op(
        &mut self,
        lower: ValueId,
        upper: ValueId,
        step: ValueId,
        inits: &[ValueId],
        body: impl FnOnce(&mut Self, ValueId, &[ValueId]) -> Vec<ValueId>,
    ) -> OpId {
        let carried_types = inits
            .iter()
            .map(|v| self.value_type(*v).clone())
            .collect::<Vec<_>>();
        let mut arg_types = vec![Type::Scalar(Dtype::Index)];
        arg_types.extend(carried_types.iter().cloned());
        let region = self.build_block(&arg_types, |b, args| {
            let yielded = body(b, args[0], &args[1..]);
            b.op(OpKind::Yield, &yielded, &[]);
        });
        let mut operands = vec![lower, upper, step];
        operands.extend_from_slice(inits);
        self.op_with_regions(OpKind::For, &operands, &carried_types, vec![region])
    }

    /// An `scf.while` whose results have the types of `inits`.
    ///
    /// `before` returns the loop condition and the values forwarded to `after` (and out of the
    /// loop); `after` returns the values for the next iteration.
    pub fn while_op(
        &mut self,
        inits: &[ValueId],
        before: impl FnOnce(&mut Self, &[ValueId]) -> (ValueId, Vec<ValueId>),
        after: impl FnOnce(&mut Self, &[ValueId]) -> Vec<ValueId>,
    ) -> OpId {
        let types = inits
            .iter()
            .map(|v| self.value_type(*v).clone())
            .collect::<Vec<_>>();
        let before_region = self.build_block(&types, |b, args| {
            let (condition, forwarded) = before(b, args);
            let mut operands = vec![condition];
            operands.extend(forwarded);
            b.op(OpKind::Condition, &operands, &[]);
        });
        let after_region = self.build_block(&types, |b, args| {
            let yielded = after(b, args);
            b.op(OpKind::Yield, &yielded, &[]);
        });
        self.op_with_regions(
            OpKind::While,
            inits,
            &types,
            vec![before_region, after_region],
        )
    }

    /// A `tpu.trace` region wrapping `body`.
    pub fn trace(&mut self, message: &str, level: u32, body: impl FnOnce(&mut Self)) -> OpId {
        let region = self.build_block(&[], |b, _| {
            body(b);
            b.op(OpKind::TpuYield, &[], &[]);
        });
        let kind = OpKind::Trace {
            message: message.to_owned(),
            level,
        };
        self.op_with_regions(kind, &[], &[], vec![region])
    }

    /// A `tpu.region` wrapping `body`.
    pub fn region_op(&mut self, body: impl FnOnce(&mut Self)) -> OpId {
        let region = self.build_block(&[], |b, _| {
            body(b);
            b.op(OpKind::TpuYield, &[], &[]);
        });
        self.op_with_regions(OpKind::RegionOp, &[], &[], vec![region])
    }
}
