//! Small TPU kernels used to exercise layout inference from the command line.

use crate::common::{DimSize, Dtype};
use crate::ir::{
    ArithOp, CombiningKind, ConstantValue, Function, FunctionBuilder, IndexingMap, IteratorType,
    OpKind, Tile, Type, ValueId,
};
use crate::target::{TargetShape, NATIVE_BITWIDTH};

use smallvec::SmallVec;

/// The tile hierarchy a compiler would give a memref of `dtype` with `rank` dims.
pub fn default_tiles(target: &TargetShape, dtype: Dtype, rank: usize) -> Vec<Tile> {
    let bitwidth = dtype.bitwidth();
    let packing = NATIVE_BITWIDTH / bitwidth;
    let native = target.native_tiling(bitwidth);
    match (rank, packing) {
        (1, 1) => vec![crate::tile![target.lanes]],
        (1, _) => vec![
            crate::tile![target.lanes * packing],
            crate::tile![target.lanes],
            crate::tile![packing, 1],
        ],
        (_, 1) => vec![crate::tile![native[0], native[1]]],
        _ => vec![crate::tile![native[0], native[1]], crate::tile![packing, 1]],
    }
}

fn memref(target: &TargetShape, shape: &[DimSize], dtype: Dtype) -> Type {
    Type::memref(
        SmallVec::from_slice(shape),
        dtype,
        default_tiles(target, dtype, shape.len()),
    )
}

fn vector(shape: &[DimSize], dtype: Dtype) -> Type {
    Type::vector(SmallVec::from_slice(shape), dtype)
}

fn load_whole(b: &mut FunctionBuilder, memref: ValueId, ty: Type) -> ValueId {
    let rank = ty.as_vector().map_or(0, |v| v.rank());
    let c0 = b.constant_index(0);
    b.vector_load(memref, &vec![c0; rank], ty)
}

fn store_whole(b: &mut FunctionBuilder, value: ValueId, memref: ValueId) {
    let rank = b.value_type(value).as_vector().map_or(0, |v| v.rank());
    let c0 = b.constant_index(0);
    b.vector_store(value, memref, &vec![c0; rank]);
}

/// `out[m, n] = lhs[m, k] @ rhs[k, n]` with an f32 result.
pub fn matmul(target: &TargetShape, m: DimSize, k: DimSize, n: DimSize, dtype: Dtype) -> Function {
    let mut b = FunctionBuilder::new("matmul");
    let lhs_ref = b.add_argument(memref(target, &[m, k], dtype));
    let rhs_ref = b.add_argument(memref(target, &[k, n], dtype));
    let out_ref = b.add_argument(memref(target, &[m, n], Dtype::Float32));
    let lhs = load_whole(&mut b, lhs_ref, vector(&[m, k], dtype));
    let rhs = load_whole(&mut b, rhs_ref, vector(&[k, n], dtype));
    let acc = b.constant_splat(vector(&[m, n], Dtype::Float32));
    let kind = OpKind::Contraction {
        kind: CombiningKind::Add,
        iterator_types: vec![
            IteratorType::Parallel,
            IteratorType::Parallel,
            IteratorType::Reduction,
        ],
        indexing_maps: vec![
            IndexingMap::new(3, &[0, 2]),
            IndexingMap::new(3, &[2, 1]),
            IndexingMap::new(3, &[0, 1]),
        ],
    };
    let out = b.op1(kind, &[lhs, rhs, acc], vector(&[m, n], Dtype::Float32));
    store_whole(&mut b, out, out_ref);
    b.func_return(&[]);
    b.finish()
}

/// Reduces every row of `x` with `kind` and broadcasts the result back across the row.
fn row_reduce_broadcast(
    b: &mut FunctionBuilder,
    x: ValueId,
    kind: CombiningKind,
    rows: DimSize,
    cols: DimSize,
) -> ValueId {
    let acc = b.constant_splat(vector(&[rows], Dtype::Float32));
    let reduction = OpKind::MultiDimReduction {
        kind,
        reduction_dims: vec![1],
    };
    let reduced = b.op1(reduction, &[x, acc], vector(&[rows], Dtype::Float32));
    let column = b.op1(OpKind::ShapeCast, &[reduced], vector(&[rows, 1], Dtype::Float32));
    b.op1(OpKind::Broadcast, &[column], vector(&[rows, cols], Dtype::Float32))
}

/// A numerically stable row-wise softmax.
pub fn softmax(target: &TargetShape, rows: DimSize, cols: DimSize) -> Function {
    let mut b = FunctionBuilder::new("softmax");
    let x_ref = b.add_argument(memref(target, &[rows, cols], Dtype::Float32));
    let out_ref = b.add_argument(memref(target, &[rows, cols], Dtype::Float32));
    let x = load_whole(&mut b, x_ref, vector(&[rows, cols], Dtype::Float32));
    let max = row_reduce_broadcast(&mut b, x, CombiningKind::MaxF, rows, cols);
    let shifted = b.arith(ArithOp::SubF, &[x, max]);
    let exp = b.arith(ArithOp::Exp, &[shifted]);
    let sum = row_reduce_broadcast(&mut b, exp, CombiningKind::Add, rows, cols);
    let out = b.arith(ArithOp::DivF, &[exp, sum]);
    store_whole(&mut b, out, out_ref);
    b.func_return(&[]);
    b.finish()
}

/// Column sums of `x`, counting only the first `limit` columns.
pub fn masked_sum(target: &TargetShape, rows: DimSize, cols: DimSize, limit: i64) -> Function {
    let mut b = FunctionBuilder::new("masked_sum");
    let x_ref = b.add_argument(memref(target, &[rows, cols], Dtype::Float32));
    let out_ref = b.add_argument(memref(target, &[cols], Dtype::Float32));
    let column = b.op1(
        OpKind::Iota { dimension: Some(1) },
        &[],
        vector(&[rows, cols], Dtype::Sint32),
    );
    let limit = b.constant_scalar(ConstantValue::Int(limit), Dtype::Sint32);
    let limit = b.op1(OpKind::Broadcast, &[limit], vector(&[rows, cols], Dtype::Sint32));
    let mask = b.op1(OpKind::CmpI, &[column, limit], vector(&[rows, cols], Dtype::Bool));
    let x = load_whole(&mut b, x_ref, vector(&[rows, cols], Dtype::Float32));
    let zeros = b.constant_splat(vector(&[rows, cols], Dtype::Float32));
    let masked = b.op1(
        OpKind::Select,
        &[mask, x, zeros],
        vector(&[rows, cols], Dtype::Float32),
    );
    let acc = b.constant_splat(vector(&[cols], Dtype::Float32));
    let reduction = OpKind::MultiDimReduction {
        kind: CombiningKind::Add,
        reduction_dims: vec![0],
    };
    let total = b.op1(reduction, &[masked, acc], vector(&[cols], Dtype::Float32));
    store_whole(&mut b, total, out_ref);
    b.func_return(&[]);
    b.finish()
}

/// Sums `trips` consecutive `rows x cols` blocks of `x` in a loop.
pub fn row_loop(target: &TargetShape, rows: DimSize, cols: DimSize, trips: DimSize) -> Function {
    let mut b = FunctionBuilder::new("row_loop");
    let x_ref = b.add_argument(memref(target, &[rows * trips, cols], Dtype::Float32));
    let out_ref = b.add_argument(memref(target, &[rows, cols], Dtype::Float32));
    let init = b.constant_splat(vector(&[rows, cols], Dtype::Float32));
    let lb = b.constant_index(0);
    let ub = b.constant_index(i64::from(trips));
    let step = b.constant_index(1);
    let for_op = b.for_op(lb, ub, step, &[init], |b, iv, carried| {
        let block_rows = b.constant_index(i64::from(rows));
        let row = b.arith(ArithOp::MulI, &[iv, block_rows]);
        let c0 = b.constant_index(0);
        let x = b.vector_load(x_ref, &[row, c0], vector(&[rows, cols], Dtype::Float32));
        vec![b.arith(ArithOp::AddF, &[carried[0], x])]
    });
    let total = b.result(for_op, 0);
    store_whole(&mut b, total, out_ref);
    b.func_return(&[]);
    b.finish()
}

/// Scales a packed 16-bit buffer in f32 and stores it back.
pub fn packed_load(target: &TargetShape, rows: DimSize, cols: DimSize) -> Function {
    let mut b = FunctionBuilder::new("packed_load");
    let x_ref = b.add_argument(memref(target, &[rows, cols], Dtype::Bfloat16));
    let x = load_whole(&mut b, x_ref, vector(&[rows, cols], Dtype::Bfloat16));
    let wide = b.op1(OpKind::ExtF, &[x], vector(&[rows, cols], Dtype::Float32));
    let scale = b.constant_splat(vector(&[rows, cols], Dtype::Float32));
    let scaled = b.arith(ArithOp::MulF, &[wide, scale]);
    let narrow = b.op1(OpKind::TruncF, &[scaled], vector(&[rows, cols], Dtype::Bfloat16));
    store_whole(&mut b, narrow, x_ref);
    b.func_return(&[]);
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::LayoutAnnotations;
    use crate::infer::infer_layouts;
    use crate::layout::Layout;
    use crate::vlayout;

    fn infer(mut func: Function) -> (Function, LayoutAnnotations) {
        let annotations = infer_layouts(&mut func, TargetShape::default())
            .unwrap_or_else(|e| panic!("{}: {e}", func.name));
        assert!(annotations.incomplete_ops(&func).is_empty());
        (func, annotations)
    }

    fn stored_layout(func: &Function, annotations: &LayoutAnnotations) -> Layout {
        let store = func
            .op_ids()
            .find(|&op| func.op(op).kind == OpKind::VectorStore)
            .unwrap();
        annotations.in_layouts(store).unwrap()[0]
    }

    #[test]
    fn test_default_tiles() {
        let target = TargetShape::default();
        assert_eq!(
            default_tiles(&target, Dtype::Float32, 2),
            vec![crate::tile![8, 128]]
        );
        assert_eq!(
            default_tiles(&target, Dtype::Bfloat16, 2),
            vec![crate::tile![16, 128], crate::tile![2, 1]]
        );
        assert_eq!(
            default_tiles(&target, Dtype::Bfloat16, 1),
            vec![crate::tile![256], crate::tile![128], crate::tile![2, 1]]
        );
    }

    #[test]
    fn test_matmul_kernels() {
        let target = TargetShape::default();
        for dtype in [Dtype::Float32, Dtype::Bfloat16] {
            let (func, annotations) = infer(matmul(&target, 128, 256, 128, dtype));
            assert_eq!(
                stored_layout(&func, &annotations),
                Some(vlayout!(32, (0, 0), (8, 128)))
            );
        }
    }

    #[test]
    fn test_softmax_kernel() {
        let (func, annotations) = infer(softmax(&TargetShape::default(), 16, 256));
        assert_eq!(
            stored_layout(&func, &annotations),
            Some(vlayout!(32, (0, 0), (8, 128)))
        );
        let broadcast = func
            .op_ids()
            .find(|&op| func.op(op).kind == OpKind::Broadcast)
            .unwrap();
        assert_eq!(
            annotations.out_layouts(broadcast).unwrap(),
            &[Some(vlayout!(32, (0, *), (8, 128)))]
        );
    }

    #[test]
    fn test_masked_sum_kernel() {
        let (func, annotations) = infer(masked_sum(&TargetShape::default(), 8, 256, 100));
        assert_eq!(
            stored_layout(&func, &annotations),
            Some(vlayout!(32, (0, 0), (1, 128), second_minor))
        );
    }

    #[test]
    fn test_row_loop_kernel() {
        let (func, annotations) = infer(row_loop(&TargetShape::default(), 8, 128, 4));
        assert_eq!(
            stored_layout(&func, &annotations),
            Some(vlayout!(32, (0, 0), (8, 128)))
        );
    }

    #[test]
    fn test_packed_load_kernel() {
        let (func, annotations) = infer(packed_load(&TargetShape::default(), 32, 256));
        assert_eq!(
            stored_layout(&func, &annotations),
            Some(vlayout!(16, (0, 0), (16, 128)))
        );
    }
}
