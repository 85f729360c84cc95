use crate::graph::Graph;
use crate::scheduling::{Schedule, ScheduleError, SchedulePlan, ScheduleVariant, ThreadAxis};
use crate::target::TargetCaps;

use log::debug;
use std::sync::Arc;

/// Fuse every output axis and split the result into blocks of the target's maximum width.
///
/// Per-channel statistics are read straight from global memory. The operator is
/// memory-bound, so staging them in shared memory would not pay for itself.
pub fn schedule(graph: &Arc<Graph>, caps: &TargetCaps) -> Result<SchedulePlan, ScheduleError> {
    schedule_with_width(graph, caps.max_threads_per_block, caps)
}

/// Like [schedule], but splits by `width` rather than the target's maximum.
///
/// A `width` larger than the whole output is clamped to the output's size. The last block is
/// guarded when `width` does not divide the output's size.
pub fn schedule_with_width(
    graph: &Arc<Graph>,
    width: u32,
    caps: &TargetCaps,
) -> Result<SchedulePlan, ScheduleError> {
    let s = Schedule::new(Arc::clone(graph))?;
    let [c, h, w] = s.root_array::<3>()?;
    let (s, ch) = s.fuse(c, h)?;
    let (s, chw) = s.fuse(ch, w)?;

    let extent = s.axis(chw)?.extent.get();
    let width = if width > extent {
        debug!("Clamping block width {width} to fused extent {extent}");
        extent
    } else {
        width
    };

    let (s, outer, inner) = s.split(chw, width)?;
    let s = s
        .bind(outer, ThreadAxis::BlockX)?
        .bind(inner, ThreadAxis::ThreadX)?;
    SchedulePlan::new(ScheduleVariant::FusedSplit, s, caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchnorm::batch_norm;
    use crate::common::ProblemSize;
    use crate::scheduling::UnschedulableReason;

    #[test]
    fn test_non_divisible_size_is_guarded() {
        let kernel = batch_norm(ProblemSize::new(32, 28).unwrap());
        let plan = schedule(&kernel.graph, &TargetCaps::default()).unwrap();
        let grid = plan.launch_grid();
        // 25088 = 24 * 1024 + 512
        assert_eq!(grid.blocks, [25, 1, 1]);
        assert_eq!(grid.threads, [1024, 1, 1]);
        assert_eq!(plan.serial_axes().count(), 0);
        let preds = plan.schedule().root_bindings().predicates;
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].bound, 25088);
    }

    #[test]
    fn test_divisible_size_is_unguarded() {
        let kernel = batch_norm(ProblemSize::new(64, 16).unwrap());
        let plan = schedule(&kernel.graph, &TargetCaps::default()).unwrap();
        assert_eq!(plan.launch_grid().blocks, [16, 1, 1]);
        assert!(plan.schedule().root_bindings().predicates.is_empty());
    }

    #[test]
    fn test_width_clamped_to_output() {
        let kernel = batch_norm(ProblemSize::new(1, 1).unwrap());
        let plan = schedule(&kernel.graph, &TargetCaps::default()).unwrap();
        assert_eq!(plan.launch_grid().blocks, [1, 1, 1]);
        assert_eq!(plan.launch_grid().threads, [1, 1, 1]);
    }

    #[test]
    fn test_zero_width_is_unschedulable() {
        let kernel = batch_norm(ProblemSize::new(4, 4).unwrap());
        assert_eq!(
            schedule_with_width(&kernel.graph, 0, &TargetCaps::default()).unwrap_err(),
            ScheduleError::UnschedulableAxis(UnschedulableReason::ZeroWidth)
        );
        let no_threads = TargetCaps {
            max_threads_per_block: 0,
        };
        assert!(schedule(&kernel.graph, &no_threads).is_err());
    }
}
