use crate::ir::{ArithOp, ConstantValue, Function, OpKind, ValueId};

use log::trace;

/// Decides whether an index value is provably a multiple of some divisor.
///
/// Memory access rules use this to pick a zero offset for non-constant indices.
pub trait DivisibilityOracle: Sync {
    fn is_guaranteed_divisible(&self, func: &Function, value: ValueId, divisor: u32) -> bool;
}

/// Proves divisibility from constants, `tpu.assume_multiple`, and integer arithmetic on those.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArithDivisibility;

impl ArithDivisibility {
    /// The largest multiple known to divide `value`, or `None` if nothing useful is known.
    fn known_multiple(&self, func: &Function, value: ValueId, depth: u32) -> Option<u64> {
        // Index arithmetic in kernels is shallow; give up on long chains.
        if depth > 16 {
            return None;
        }
        let op = func.op(func.defining_op(value)?);
        match &op.kind {
            OpKind::Constant(ConstantValue::Int(c)) => Some(c.unsigned_abs()),
            OpKind::AssumeMultiple { multiple } => Some(u64::from(*multiple)),
            OpKind::Arith(ArithOp::MulI) => {
                let [lhs, rhs] = op.operands[..] else {
                    return None;
                };
                let lhs = self.known_multiple(func, lhs, depth + 1).unwrap_or(1);
                let rhs = self.known_multiple(func, rhs, depth + 1).unwrap_or(1);
                // An overflowing product says nothing about divisibility.
                lhs.checked_mul(rhs)
            }
            OpKind::Arith(ArithOp::AddI | ArithOp::SubI) => {
                let [lhs, rhs] = op.operands[..] else {
                    return None;
                };
                let lhs = self.known_multiple(func, lhs, depth + 1)?;
                let rhs = self.known_multiple(func, rhs, depth + 1)?;
                Some(gcd(lhs, rhs))
            }
            _ => None,
        }
    }
}

impl DivisibilityOracle for ArithDivisibility {
    fn is_guaranteed_divisible(&self, func: &Function, value: ValueId, divisor: u32) -> bool {
        let divisor = u64::from(divisor);
        if divisor <= 1 {
            return true;
        }
        let result = match self.known_multiple(func, value, 0) {
            // Zero is a multiple of everything.
            Some(0) => true,
            Some(m) => m % divisor == 0,
            None => false,
        };
        trace!("{value} divisible by {divisor}: {result}");
        result
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}
