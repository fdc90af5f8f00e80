use crate::annotations::LayoutAnnotations;
use crate::ir::{BlockId, Function, OpId};
use crate::layout::DisplayLayout;
use crate::utils::{indent, join_into_string, LinePrefixWrite};

use clap::ValueEnum;
use prettytable::{self, format, row};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PrintMode {
    /// One row per operation with its input and output layouts in aligned columns.
    Table,
    /// Indented IR with layouts attached to each operation.
    Plain,
}

/// Pretty-print an annotated [Function] to stdout.
pub fn pprint(func: &Function, annotations: &LayoutAnnotations, mode: PrintMode) {
    print!("{}", pprint_string(func, annotations, mode));
}

pub fn pprint_string(func: &Function, annotations: &LayoutAnnotations, mode: PrintMode) -> String {
    match mode {
        PrintMode::Table => pprint_table(func, annotations).to_string(),
        PrintMode::Plain => {
            let mut out = String::new();
            // Writing to a String cannot fail.
            let _ = pprint_plain(&mut out, func, annotations);
            out
        }
    }
}

/// Writes `func` as indented text, one operation per line.
pub fn pprint_plain(
    out: &mut dyn fmt::Write,
    func: &Function,
    annotations: &LayoutAnnotations,
) -> fmt::Result {
    let params = func
        .arguments()
        .iter()
        .map(|&a| format!("{a}: {}", func.value_type(a)));
    writeln!(out, "func @{}({}) {{", func.name, join_into_string(params, ", "))?;
    let prefix = indent(1);
    let mut body = LinePrefixWrite::new(&mut *out, &prefix);
    write_block(&mut body, func, annotations, func.entry_block(), false)?;
    writeln!(out, "}}")
}

fn write_block(
    out: &mut dyn fmt::Write,
    func: &Function,
    annotations: &LayoutAnnotations,
    block: BlockId,
    with_header: bool,
) -> fmt::Result {
    let args = &func.block(block).args;
    if with_header && !args.is_empty() {
        let args = args
            .iter()
            .map(|&a| format!("{a}: {}", func.value_type(a)));
        writeln!(out, "^({}):", join_into_string(args, ", "))?;
    }
    for &op in &func.block(block).ops {
        write!(out, "{}", op_line(func, op))?;
        if let Some(layouts) = annotations.get(op) {
            write!(
                out,
                " {{in = [{}], out = [{}]}}",
                join_into_string(layouts.ins.iter().map(DisplayLayout), ", "),
                join_into_string(layouts.outs.iter().map(DisplayLayout), ", ")
            )?;
        }
        let regions = &func.op(op).regions;
        if regions.is_empty() {
            writeln!(out)?;
            continue;
        }
        writeln!(out, " {{")?;
        for (i, region) in regions.iter().enumerate() {
            if i > 0 {
                writeln!(out, "}} {{")?;
            }
            let prefix = indent(1);
            let mut nested = LinePrefixWrite::new(&mut *out, &prefix);
            for &nested_block in &region.blocks {
                write_block(&mut nested, func, annotations, nested_block, true)?;
            }
        }
        writeln!(out, "}}")?;
    }
    Ok(())
}

/// `%3, %4 = scf.for %0, %1, %2`
fn op_line(func: &Function, op: OpId) -> String {
    let operation = func.op(op);
    let mut line = String::new();
    if !operation.results.is_empty() {
        line.push_str(&join_into_string(&operation.results, ", "));
        line.push_str(" = ");
    }
    line.push_str(operation.name());
    if !operation.operands.is_empty() {
        line.push(' ');
        line.push_str(&join_into_string(&operation.operands, ", "));
    }
    if let [result] = operation.results.as_slice() {
        line.push_str(&format!(" : {}", func.value_type(*result)));
    }
    line
}

fn pprint_table(func: &Function, annotations: &LayoutAnnotations) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["Op", "In", "Out"]);
    add_block_rows(&mut table, func, annotations, func.entry_block(), 0);

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

fn add_block_rows(
    table: &mut prettytable::Table,
    func: &Function,
    annotations: &LayoutAnnotations,
    block: BlockId,
    depth: usize,
) {
    for &op in &func.block(block).ops {
        let main_str = format!("{}{}", indent(depth), op_line(func, op));
        let r = match annotations.get(op) {
            Some(layouts) => row![
                main_str,
                join_into_string(layouts.ins.iter().map(DisplayLayout), ", "),
                join_into_string(layouts.outs.iter().map(DisplayLayout), ", ")
            ],
            None => row![main_str, "-", "-"],
        };
        table.add_row(r);
        for region in &func.op(op).regions {
            for &nested in &region.blocks {
                add_block_rows(table, func, annotations, nested, depth + 1);
            }
        }
    }
}
