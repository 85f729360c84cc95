use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use std::hint::black_box;

use bnsched::batchnorm::{batch_norm, BatchNormInputs};
use bnsched::common::ProblemSize;
use bnsched::lower::lower;
use bnsched::scheduling::ScheduleVariant;
use bnsched::target::{Program, SimGpuTarget, Target};

fn size() -> ProblemSize {
    ProblemSize::new(32, 28).unwrap()
}

#[library_benchmark]
fn schedule_and_lower_fused_split() {
    let kernel = batch_norm(size());
    let target = SimGpuTarget::default();
    let plan = ScheduleVariant::FusedSplit
        .schedule(&kernel.graph, target.caps())
        .unwrap();
    black_box(lower(&plan));
}

#[library_benchmark]
fn simulate_axis_binding_launch() {
    let kernel = batch_norm(size());
    let target = SimGpuTarget::default();
    let plan = ScheduleVariant::AxisBinding
        .schedule(&kernel.graph, target.caps())
        .unwrap();
    let program = target.build(&lower(&plan)).unwrap();
    let args = BatchNormInputs::random(kernel.size, 0).to_args(&kernel);
    black_box(program.run(&args).unwrap());
}

library_benchmark_group!(
    name = launch_group;
    benchmarks = schedule_and_lower_fused_split, simulate_axis_binding_launch
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                    "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64",
                ]);
    library_benchmark_groups = launch_group
);
