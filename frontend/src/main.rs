#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;
use textplots::{Chart, Plot, Shape};

use std::{fs, io, path};

use bnsched::baseline::NdarrayBatchNorm;
use bnsched::batchnorm::{batch_norm, BatchNormInputs};
use bnsched::bench::{self, BenchConfig, DEFAULT_REPEATS};
use bnsched::codegen::{emit_c, emit_cuda, EmitFormat};
use bnsched::color::{self, ColorMode};
use bnsched::common::ProblemSize;
use bnsched::lower::lower;
use bnsched::plot::{log_log_points, write_svg};
use bnsched::pprint::{pprint, pprint_lowered, PlanPrintStyle};
use bnsched::scheduling::ScheduleVariant;
use bnsched::target::{
    ClangTarget, Program, SimGpuTarget, Target, TargetCaps, TargetId,
    DEFAULT_MAX_THREADS_PER_BLOCK,
};
use bnsched::utils::ToWriteFmt;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Color mode
    #[arg(long, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,

    /// Execution target
    #[arg(long, value_enum, hide_default_value = true, default_value_t = TargetId::default())]
    target: TargetId,

    /// Maximum number of threads in one block
    #[arg(long, default_value_t = DEFAULT_MAX_THREADS_PER_BLOCK)]
    max_threads: u32,

    #[command(subcommand)]
    subcmd: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Print a scheduled kernel
    Emit(EmitCmd),

    /// Build and run a scheduled kernel once
    Run(RunCmd),

    /// Build and benchmark a scheduled kernel
    Bench(BenchCmd),

    /// Benchmark every variant and the baseline across channel counts
    Sweep(SweepCmd),
}

#[derive(clap::Args)]
struct KernelQuery {
    #[arg(value_enum)]
    variant: ScheduleVariant,

    /// Problem size, as <channels>x<spatial>
    size: ProblemSize,
}

#[derive(clap::Args)]
struct EmitCmd {
    #[command(flatten)]
    query: KernelQuery,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = EmitFormat::C)]
    format: EmitFormat,

    /// Include the lowered loop nest as a comment in generated C
    #[arg(long, default_value_t = false)]
    include_lowered: bool,

    /// Plan style
    #[arg(long, value_enum, default_value_t = PlanPrintStyle::Full)]
    plan_style: PlanPrintStyle,
}

#[derive(clap::Args)]
struct RunCmd {
    #[command(flatten)]
    query: KernelQuery,

    /// Disable verification
    #[cfg(feature = "verification")]
    #[arg(long, default_value_t = false)]
    skip_check: bool,
}

#[derive(clap::Args)]
struct BenchCmd {
    #[command(flatten)]
    query: KernelQuery,

    /// Number of kernel launches per sample
    #[arg(long, short)]
    inner_loop_iters: Option<u32>,

    /// Number of samples
    #[arg(long, default_value_t = DEFAULT_REPEATS)]
    repeats: usize,
}

#[derive(clap::Args)]
struct SweepCmd {
    /// Channel counts to sweep
    #[arg(long, value_delimiter = ',', default_values_t = [8u32, 16, 32, 64, 128, 256])]
    channels: Vec<u32>,

    /// Spatial extent, shared by every size
    #[arg(long, default_value_t = 28)]
    spatial: u32,

    /// Schedule variants to time
    #[arg(
        long,
        value_enum,
        value_delimiter = ',',
        default_values_t = [ScheduleVariant::AxisBinding, ScheduleVariant::FusedSplit]
    )]
    variants: Vec<ScheduleVariant>,

    /// Number of kernel launches per sample
    #[arg(long, short)]
    inner_loop_iters: Option<u32>,

    /// Number of samples
    #[arg(long, default_value_t = DEFAULT_REPEATS)]
    repeats: usize,

    /// Write results to this CSV file
    #[arg(long)]
    csv: Option<path::PathBuf>,

    /// Write a log-log plot to this SVG file
    #[arg(long)]
    svg: Option<path::PathBuf>,

    /// Draw a log-log chart in the terminal
    #[arg(long, default_value_t = false)]
    chart: bool,

    /// Disable verification
    #[cfg(feature = "verification")]
    #[arg(long, default_value_t = false)]
    skip_check: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    color::set_color_mode(args.color);
    let caps = TargetCaps {
        max_threads_per_block: args.max_threads,
    };
    match &args.target {
        TargetId::Sim => main_per_target(&args, &SimGpuTarget::new(caps)),
        TargetId::Clang => main_per_target(&args, &ClangTarget::from_env(caps)),
    }
}

fn main_per_target<Tgt: Target>(args: &Args, target: &Tgt) -> Result<()> {
    match &args.subcmd {
        Subcommand::Emit(cmd) => emit_main(cmd, target),
        Subcommand::Run(cmd) => run_main(cmd, target),
        Subcommand::Bench(cmd) => bench_main(cmd, target),
        Subcommand::Sweep(cmd) => sweep_main(cmd, target),
    }
}

fn emit_main<Tgt: Target>(cmd: &EmitCmd, target: &Tgt) -> Result<()> {
    let kernel = batch_norm(cmd.query.size);
    let plan = cmd.query.variant.schedule(&kernel.graph, target.caps())?;
    match cmd.format {
        EmitFormat::Plan => pprint(&plan, cmd.plan_style),
        EmitFormat::Lowered => pprint_lowered(&lower(&plan)),
        EmitFormat::C => emit_c(
            &lower(&plan),
            cmd.include_lowered,
            &mut ToWriteFmt(io::stdout()),
        )?,
        EmitFormat::Cuda => emit_cuda(&lower(&plan), &mut ToWriteFmt(io::stdout()))?,
    }
    Ok(())
}

fn run_main<Tgt: Target>(cmd: &RunCmd, target: &Tgt) -> Result<()> {
    target.probe()?;
    let kernel = batch_norm(cmd.query.size);
    let plan = cmd.query.variant.schedule(&kernel.graph, target.caps())?;
    let program = target.build(&lower(&plan))?;
    let inputs = BatchNormInputs::random(kernel.size, 0);
    let output = program.run(&inputs.to_args(&kernel))?;
    println!("Output:\n{output:.4}");

    #[cfg(feature = "verification")]
    if !cmd.skip_check {
        let outcome = bnsched::verification::check_correctness(&program, &kernel, &inputs)?;
        if !outcome.passed {
            bail!(
                "Generated code returned incorrect output (max abs. difference {})",
                outcome.max_abs_diff
            );
        }
        info!("Output matches the baseline");
    }
    Ok(())
}

fn bench_main<Tgt: Target>(cmd: &BenchCmd, target: &Tgt) -> Result<()> {
    target.probe()?;
    let kernel = batch_norm(cmd.query.size);
    let plan = cmd.query.variant.schedule(&kernel.graph, target.caps())?;
    let program = target.build(&lower(&plan))?;
    let args = BatchNormInputs::random(kernel.size, 0).to_args(&kernel);

    let measure = |iters: u32| program.measure_time(&args, iters);
    // We need an exact number of samples when benchmarking.
    let inner_loop_iters = match cmd.inner_loop_iters {
        Some(s) => s,
        None => bench::estimate_optimal_iters(measure)?,
    };
    let result = bench::bench_samples(inner_loop_iters, cmd.repeats, measure)?;
    let inner_loop_runtime = result.best_inner_loop_runtime();
    println!("\nkernel runtime: {:.8}s", result.best_mean().as_secs_f32());
    println!("loop runtime: {}ns", inner_loop_runtime.as_nanos());
    Ok(())
}

fn sweep_main<Tgt: Target>(cmd: &SweepCmd, target: &Tgt) -> Result<()> {
    let sizes = cmd
        .channels
        .iter()
        .map(|&c| ProblemSize::new(i64::from(c), i64::from(cmd.spatial)))
        .collect::<Result<Vec<_>, _>>()?;
    if sizes.is_empty() {
        bail!("no channel counts given");
    }
    let config = BenchConfig {
        repeats: cmd.repeats,
        inner_loop_iters: cmd.inner_loop_iters,
        #[cfg(feature = "verification")]
        check: !cmd.skip_check,
        #[cfg(not(feature = "verification"))]
        check: false,
        ..BenchConfig::default()
    };
    let report = bench::sweep(
        &sizes,
        &cmd.variants,
        target,
        &NdarrayBatchNorm::default(),
        &config,
    )?;
    let table = report.to_table();
    if color::do_color() {
        table.print_tty(true)?;
    } else {
        print!("{table}");
    }

    if let Some(csv_path) = &cmd.csv {
        report.write_csv(fs::File::create(csv_path)?)?;
        info!("Wrote {}", csv_path.display());
    }
    if let Some(svg_path) = &cmd.svg {
        let mut svg = String::new();
        let title = format!(
            "batch norm, {}x{} spatial, {}",
            cmd.spatial,
            cmd.spatial,
            target.target_id()
        );
        write_svg(&report, &title, &mut svg)?;
        fs::write(svg_path, svg)?;
        info!("Wrote {}", svg_path.display());
    }
    if cmd.chart {
        print_chart(&report);
    }
    Ok(())
}

fn print_chart(report: &bench::BenchReport) {
    let lines = log_log_points(report);
    let (x_lo, x_hi) = lines
        .values()
        .flatten()
        .map(|&(x, _)| x)
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), x| {
            (lo.min(x), hi.max(x))
        });
    if !x_lo.is_finite() {
        return;
    }
    let shapes = lines
        .values()
        .map(|points| Shape::Lines(points))
        .collect::<Vec<_>>();
    let legend = lines
        .keys()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    println!("\nlog10(seconds) vs. log10(channels): {legend}");
    let mut chart = Chart::new(120, 60, x_lo - 0.1, x_hi + 0.1);
    let mut chart = &mut chart;
    for shape in &shapes {
        chart = chart.lineplot(shape);
    }
    chart.nice();
}
