use super::{InferenceError, LayoutInferer, Result, Terminator};
use crate::annotations::LayoutList;
use crate::ir::{BlockId, OpId, Operation, Region, Type, ValueId};
use crate::layout::{Layout, VectorLayout};

use log::debug;
use smallvec::smallvec;

/// Pairs each vector block argument with the layout asserted for it.
///
/// `args` and `layouts` are matched positionally; arguments without a vector layout are left
/// alone.
pub(crate) fn carried_arg_bindings(
    args: &[ValueId],
    arg_types: &[&Type],
    layouts: &[Layout],
) -> Vec<(ValueId, VectorLayout)> {
    args.iter()
        .zip(arg_types)
        .zip(layouts)
        .filter_map(|((&arg, ty), layout)| match layout {
            Some(layout) if ty.is_vector() => Some((arg, *layout)),
            _ => None,
        })
        .collect()
}

impl LayoutInferer<'_> {
    /// Places a `tpu.assume_layout` marker at the top of `block` for each binding.
    fn materialize_arg_bindings(&mut self, block: BlockId, bindings: &[(ValueId, VectorLayout)]) {
        for (position, &(arg, layout)) in bindings.iter().enumerate() {
            let marker = self.func.insert_assume_layout(arg, Some(layout), position);
            debug!("Assuming layout {layout} for block argument {arg} via {marker}");
            self.set_layouts(marker, smallvec![Some(layout)], smallvec![Some(layout)]);
            self.annotations.bind_arg(arg, Some(layout), marker);
        }
    }

    /// Asserts `layouts` for the arguments of `block`, starting at argument `skip`.
    fn assume_block_arg_layouts(&mut self, block: BlockId, skip: usize, layouts: &[Layout]) {
        let args = self.func.block(block).args.get(skip..).unwrap_or_default().to_vec();
        let types = args.iter().map(|&a| self.func.value_type(a)).collect::<Vec<_>>();
        let bindings = carried_arg_bindings(&args, &types, layouts);
        self.materialize_arg_bindings(block, &bindings);
    }

    fn region_block(&self, op: OpId, region: &Region, message: &str) -> Result<BlockId> {
        region
            .single_block()
            .ok_or_else(|| self.malformed(op, message))
    }

    /// The terminator of a block that [LayoutInferer::infer_block] has already checked.
    fn terminator(&self, block: BlockId) -> OpId {
        *self
            .func
            .block(block)
            .ops
            .last()
            .unwrap_or_else(|| unreachable!("inferred block has a terminator"))
    }

    fn infer_branch(&mut self, op: OpId, block: BlockId, region: &'static str) -> Result<()> {
        self.infer_block(block, Terminator::Yield)
            .map_err(|e| InferenceError::InRegion {
                op: self.op_ref(op),
                region,
                source: Box::new(e),
            })
    }

    /// Layouts of values yielded out of a region: vectors keep theirs, scalars get none.
    fn yielded_layouts(&self, op: OpId, values: &[ValueId]) -> Result<LayoutList> {
        values
            .iter()
            .map(|&v| match self.func.value_type(v) {
                Type::Scalar(_) => Ok(None),
                Type::Vector(_) => self.layout_of(v),
                Type::MemRef(_) => Err(self.unsupported(op, "unsupported scf.yield type")),
            })
            .collect()
    }

    /// Layouts of the values a loop starts with.
    fn init_layouts(&self, op: OpId, inits: &[ValueId], loop_name: &str) -> Result<LayoutList> {
        inits
            .iter()
            .map(|&v| match self.func.value_type(v) {
                Type::Scalar(_) => Ok(None),
                Type::Vector(_) => self.layout_of(v),
                ty @ Type::MemRef(_) => {
                    Err(self.unsupported(op, format!("unsupported arg type {ty} in {loop_name}")))
                }
            })
            .collect()
    }

    fn result_types_match(&self, operation: &Operation, values: &[ValueId]) -> bool {
        values.len() == operation.results.len()
            && values
                .iter()
                .zip(&operation.results)
                .all(|(&v, &r)| self.func.value_type(v) == self.func.value_type(r))
    }

    pub(super) fn infer_if(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        check_op!(self, operation.operands.len() == 1, op, "expected one operand");
        check_op!(self, operation.regions.len() == 2, op, "expected then and else regions");
        self.set_in_layouts(op, smallvec![None]);

        let then_block = self.region_block(op, &operation.regions[0], "expected one block for then branch")?;
        self.infer_branch(op, then_block, "then branch")?;
        let then_yield = self.terminator(then_block);
        let then_values = self.func.op(then_yield).operands.clone();
        check_op!(
            self,
            self.result_types_match(operation, &then_values),
            op,
            "scf if results and then branch yield operands do not match"
        );
        let mut result_layouts = self.yielded_layouts(op, &then_values)?;

        let else_block = if operation.regions[1].blocks.is_empty() {
            None
        } else {
            let block = self.region_block(op, &operation.regions[1], "expected one block for else branch")?;
            self.infer_branch(op, block, "else branch")?;
            Some(block)
        };

        if operation.results.is_empty() {
            self.set_in_layouts(then_yield, smallvec![]);
            if let Some(block) = else_block {
                let else_yield = self.terminator(block);
                self.set_in_layouts(else_yield, smallvec![]);
            }
            self.annotations.set_outs(op, smallvec![]);
            return Ok(());
        }

        let Some(else_block) = else_block else {
            return Err(self.malformed(op, "scf if with results requires an else branch"));
        };
        let else_yield = self.terminator(else_block);
        let else_values = self.func.op(else_yield).operands.clone();
        check_op!(
            self,
            self.result_types_match(operation, &else_values),
            op,
            "scf if results and else branch yield operands do not match"
        );
        // A branch yielding a replicated offset adapts to the other branch's concrete one.
        for (index, &value) in else_values.iter().enumerate() {
            if !self.func.value_type(value).is_vector() {
                continue;
            }
            let else_layout = self.vector_layout_of(op, value)?;
            let Some(then_layout) = result_layouts[index] else {
                return Err(self.malformed(op, "missing vector layout"));
            };
            match then_layout.join(&else_layout) {
                Some(joined) => result_layouts[index] = Some(joined),
                None => {
                    return Err(InferenceError::Unification {
                        op: self.op_ref(op),
                        index,
                    })
                }
            }
        }
        self.set_in_layouts(then_yield, result_layouts.clone());
        self.set_in_layouts(else_yield, result_layouts.clone());
        self.set_layouts(op, smallvec![None], result_layouts);
        Ok(())
    }

    pub(super) fn infer_for(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        check_op!(
            self,
            operation.regions.len() == 1 && operation.regions[0].blocks.len() == 1,
            op,
            "expected one block for scf.for"
        );
        let body = operation.regions[0].blocks[0];
        check_op!(
            self,
            !self.func.block(body).args.is_empty(),
            op,
            "expected induction variable in scf.for"
        );
        let num_iter_args = self.func.block(body).args.len() - 1;
        check_op!(
            self,
            num_iter_args == operation.results.len(),
            op,
            "expected num_region_iter_args is equal to num_results in scf.for"
        );
        check_op!(
            self,
            operation.operands.len() == 3 + operation.results.len(),
            op,
            "expected num_operands is equal to 3 + num_results in scf.for"
        );

        let mut in_layouts: LayoutList = smallvec![None; 3];
        in_layouts.extend(self.init_layouts(op, &operation.operands[3..], "scf::for")?);
        let out_layouts = LayoutList::from_slice(&in_layouts[3..]);

        // The induction variable is a scalar; only the carried values need markers.
        self.assume_block_arg_layouts(body, 1, &out_layouts);
        self.infer_block(body, Terminator::Yield)?;
        let yield_op = self.terminator(body);
        check_op!(
            self,
            self.func.op(yield_op).operands.len() == out_layouts.len(),
            op,
            "expected yield operands to match scf.for results"
        );
        self.set_in_layouts(yield_op, out_layouts.clone());
        self.set_layouts(op, in_layouts, out_layouts);
        Ok(())
    }

    pub(super) fn infer_while(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        check_op!(
            self,
            operation.regions.len() == 2
                && operation.regions.iter().all(|r| r.blocks.len() == 1),
            op,
            "expected two blocks for scf.while"
        );
        // Results mirror the inits, so loops that reshape their carried values are out of reach.
        if operation.results.len() != operation.operands.len() {
            nyi!(self, op, "scf.while with results that differ from its inits");
        }
        let before = operation.regions[0].blocks[0];
        let after = operation.regions[1].blocks[0];

        let in_layouts = self.init_layouts(op, &operation.operands, "scf::while")?;
        let out_layouts = in_layouts.clone();

        self.assume_block_arg_layouts(before, 0, &in_layouts);
        self.infer_block(before, Terminator::Condition)?;
        self.assume_block_arg_layouts(after, 0, &out_layouts);
        self.infer_block(after, Terminator::Yield)?;

        let condition = self.terminator(before);
        let yield_op = self.terminator(after);
        check_op!(
            self,
            self.func.op(condition).operands.len() == out_layouts.len() + 1,
            op,
            "expected scf.condition to forward every result"
        );
        check_op!(
            self,
            self.func.op(yield_op).operands.len() == in_layouts.len(),
            op,
            "expected yield operands to match scf.while inits"
        );
        let mut condition_layouts: LayoutList = smallvec![None];
        condition_layouts.extend(out_layouts.iter().copied());
        self.set_in_layouts(condition, condition_layouts);
        self.set_in_layouts(yield_op, in_layouts.clone());
        self.set_layouts(op, in_layouts, out_layouts);
        Ok(())
    }

    /// `scf.condition` has no results, so only its operands are annotated.
    pub(super) fn infer_condition(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        let ins = operation
            .operands
            .iter()
            .map(|&v| match self.func.value_type(v) {
                Type::Scalar(_) => Ok(None),
                Type::Vector(_) => self.layout_of(v),
                Type::MemRef(_) => Err(self.unsupported(op, "unsupported arg type")),
            })
            .collect::<Result<LayoutList>>()?;
        self.set_layouts(op, ins, smallvec![]);
        Ok(())
    }

    /// `tpu.trace` and `tpu.region`: operand- and result-free wrappers around one block.
    pub(super) fn infer_wrapper_region(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        check_op!(self, operation.operands.is_empty(), op, "expected no operands");
        check_op!(self, operation.results.is_empty(), op, "results unsupported");
        let [region] = operation.regions.as_slice() else {
            return Err(self.malformed(op, "expected a single region"));
        };
        let block = self.region_block(op, region, "expected a single block")?;
        self.infer_block(block, Terminator::TpuYield)?;
        self.set_layouts(op, smallvec![], smallvec![]);
        Ok(())
    }

    pub(super) fn infer_assert(&mut self, op: OpId, operation: &Operation) -> Result<()> {
        for &operand in &operation.operands {
            check_op!(
                self,
                self.func.value_type(operand).is_scalar(),
                op,
                "assertions on vectors unsupported"
            );
        }
        self.set_layouts(op, smallvec![None; operation.operands.len()], smallvec![]);
        Ok(())
    }
}
