use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use tilelayout::common::{DimSize, Dtype};
use tilelayout::infer::infer_module;
use tilelayout::ir::Function;
use tilelayout::kernels;
use tilelayout::pprint::{pprint, PrintMode};
use tilelayout::target::TargetShape;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Sublanes per vector register
    #[arg(long, default_value_t = 8)]
    sublanes: DimSize,

    /// Lanes per vector register
    #[arg(long, default_value_t = 128)]
    lanes: DimSize,

    /// Output format
    #[arg(long, value_enum, default_value_t = PrintMode::Table)]
    format: PrintMode,

    /// Number of threads used to analyse kernels
    #[arg(long)]
    jobs: Option<usize>,

    #[command(subcommand)]
    kernel: Kernel,
}

#[derive(clap::Subcommand)]
enum Kernel {
    #[command(about = "Infer layouts for a matrix multiplication")]
    Matmul {
        #[arg(long, default_value = "128")]
        m: DimSize,
        #[arg(long, default_value = "256")]
        k: DimSize,
        #[arg(long, default_value = "128")]
        n: DimSize,
        /// Use bf16 operands instead of f32
        #[arg(long)]
        bf16: bool,
    },
    #[command(about = "Infer layouts for a row-wise softmax")]
    Softmax {
        #[arg(long, default_value = "16")]
        rows: DimSize,
        #[arg(long, default_value = "256")]
        cols: DimSize,
    },
    #[command(about = "Infer layouts for a masked column sum")]
    MaskedSum {
        #[arg(long, default_value = "8")]
        rows: DimSize,
        #[arg(long, default_value = "256")]
        cols: DimSize,
        #[arg(long, default_value = "100")]
        limit: i64,
    },
    #[command(about = "Infer layouts for a loop accumulating row blocks")]
    RowLoop {
        #[arg(long, default_value = "8")]
        rows: DimSize,
        #[arg(long, default_value = "128")]
        cols: DimSize,
        #[arg(long, default_value = "4")]
        trips: DimSize,
    },
    #[command(about = "Infer layouts for a bf16 load, scale, and store")]
    PackedLoad {
        #[arg(long, default_value = "32")]
        rows: DimSize,
        #[arg(long, default_value = "256")]
        cols: DimSize,
    },
    #[command(about = "Infer layouts for every demo kernel, sized for the target")]
    All,
}

fn build_kernels(kernel: &Kernel, target: &TargetShape) -> Vec<Function> {
    match kernel {
        Kernel::Matmul { m, k, n, bf16 } => {
            let dtype = if *bf16 { Dtype::Bfloat16 } else { Dtype::Float32 };
            vec![kernels::matmul(target, *m, *k, *n, dtype)]
        }
        Kernel::Softmax { rows, cols } => vec![kernels::softmax(target, *rows, *cols)],
        Kernel::MaskedSum { rows, cols, limit } => {
            vec![kernels::masked_sum(target, *rows, *cols, *limit)]
        }
        Kernel::RowLoop { rows, cols, trips } => {
            vec![kernels::row_loop(target, *rows, *cols, *trips)]
        }
        Kernel::PackedLoad { rows, cols } => vec![kernels::packed_load(target, *rows, *cols)],
        Kernel::All => {
            let (sublanes, lanes) = (target.sublanes, target.lanes);
            vec![
                kernels::matmul(target, 16 * sublanes, 2 * lanes, lanes, Dtype::Float32),
                kernels::matmul(target, 16 * sublanes, 2 * lanes, lanes, Dtype::Bfloat16),
                kernels::softmax(target, 2 * sublanes, 2 * lanes),
                kernels::masked_sum(target, sublanes, 2 * lanes, 100),
                kernels::row_loop(target, sublanes, lanes, 4),
                kernels::packed_load(target, 4 * sublanes, 2 * lanes),
            ]
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.sublanes == 0 || args.lanes == 0 {
        bail!("--sublanes and --lanes must be positive");
    }
    if let Some(jobs) = args.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()?;
    }
    let target = TargetShape::new(args.sublanes, args.lanes);

    let mut funcs = build_kernels(&args.kernel, &target);
    let start_time = std::time::Instant::now();
    let results = infer_module(&mut funcs, target);
    info!(
        "inferred layouts for {} function(s) on a {target} target in {:?}",
        funcs.len(),
        start_time.elapsed()
    );

    let mut failures = 0;
    for (func, result) in funcs.iter().zip(results) {
        match result {
            Ok(annotations) => {
                println!("@{}", func.name);
                pprint(func, &annotations, args.format);
                println!();
            }
            Err(e) => {
                eprintln!("@{}: {e}", func.name);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("layout inference failed for {failures} function(s)");
    }
    Ok(())
}
