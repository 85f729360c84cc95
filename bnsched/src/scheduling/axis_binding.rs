use crate::graph::Graph;
use crate::scheduling::{Schedule, ScheduleError, SchedulePlan, ScheduleVariant, ThreadAxis};
use crate::target::TargetCaps;

use std::sync::Arc;

/// Bind channels to `blockIdx.x` and rows to `threadIdx.x`. Each thread walks its row's
/// columns sequentially.
///
/// Fails with [ScheduleError::UnschedulableAxis] when a row has more elements than a block may
/// have threads.
pub fn schedule(graph: &Arc<Graph>, caps: &TargetCaps) -> Result<SchedulePlan, ScheduleError> {
    let s = Schedule::new(Arc::clone(graph))?;
    let [c, h, _w] = s.root_array::<3>()?;
    let s = s.bind(c, ThreadAxis::BlockX)?.bind(h, ThreadAxis::ThreadX)?;
    SchedulePlan::new(ScheduleVariant::AxisBinding, s, caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchnorm::{batch_norm, BatchNormInputs};
    use crate::common::tests::arb_problem_size;
    use crate::common::ProblemSize;
    use crate::lower::lower;
    use crate::scheduling::UnschedulableReason;
    use crate::target::{SimGpuTarget, Target};
    use proptest::prelude::*;

    fn assert_writes_each_element_once(size: ProblemSize) {
        let kernel = batch_norm(size);
        let target = SimGpuTarget::default();
        let plan = schedule(&kernel.graph, target.caps()).unwrap();
        let program = target.build(&lower(&plan)).unwrap();
        let args = BatchNormInputs::random(size, 3).to_args(&kernel);
        let (out, trace) = program.run_traced(&args).unwrap();
        assert_eq!(trace.writes.len() as u64, size.volume());
        assert!(trace.writes.iter().all(|&w| w == 1), "{size}");
        assert_eq!(trace.guarded, 0);
        assert_eq!(out, kernel.graph.evaluate(&args).unwrap());
    }

    #[test]
    fn test_grid_shape() {
        let kernel = batch_norm(ProblemSize::new(32, 28).unwrap());
        let plan = schedule(&kernel.graph, &TargetCaps::default()).unwrap();
        let grid = plan.launch_grid();
        assert_eq!(grid.blocks, [32, 1, 1]);
        assert_eq!(grid.threads, [28, 1, 1]);
        let serial = plan.serial_axes().map(|l| l.name.as_str()).collect::<Vec<_>>();
        assert_eq!(serial, ["w"]);
        assert!(plan.schedule().root_bindings().predicates.is_empty());
    }

    #[test]
    fn test_rows_wider_than_block_are_unschedulable() {
        let kernel = batch_norm(ProblemSize::new(2, 64).unwrap());
        let caps = TargetCaps {
            max_threads_per_block: 32,
        };
        assert_eq!(
            schedule(&kernel.graph, &caps).unwrap_err(),
            ScheduleError::UnschedulableAxis(UnschedulableReason::TooManyThreads {
                threads: 64,
                limit: 32
            })
        );
    }

    #[test]
    fn test_writes_each_element_once() {
        for (c, s) in [(1, 1), (3, 5), (32, 28), (1, 1024)] {
            assert_writes_each_element_once(ProblemSize::new(c, s).unwrap());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_arbitrary_sizes_write_each_element_once(size in arb_problem_size(12, 12)) {
            assert_writes_each_element_once(size);
        }
    }
}
