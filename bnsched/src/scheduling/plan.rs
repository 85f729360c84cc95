use crate::common::volume;
use crate::graph::Graph;
use crate::scheduling::{
    unschedulable, IterVar, Schedule, ScheduleError, ScheduleVariant, ThreadAxis,
    UnschedulableReason,
};
use crate::target::TargetCaps;

use std::fmt::{self, Display};
use std::sync::Arc;

/// Extents of the block grid and of each block, in x, y, z order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchGrid {
    pub blocks: [u32; 3],
    pub threads: [u32; 3],
}

/// A [Schedule] checked against a target's capabilities and ready for lowering.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    variant: ScheduleVariant,
    schedule: Schedule,
    grid: LaunchGrid,
}

impl SchedulePlan {
    pub fn new(
        variant: ScheduleVariant,
        schedule: Schedule,
        caps: &TargetCaps,
    ) -> Result<Self, ScheduleError> {
        let grid = LaunchGrid::from_schedule(&schedule);
        let threads = grid.threads_per_block();
        if threads > u64::from(caps.max_threads_per_block) {
            return Err(unschedulable(UnschedulableReason::TooManyThreads {
                threads,
                limit: caps.max_threads_per_block,
            }));
        }

        let graph = schedule.graph();
        let out_volume = volume(&graph.tensor(graph.output()).shape);
        let leaf_volume = schedule
            .leaves()
            .map(|l| u64::from(l.extent.get()))
            .product::<u64>();
        debug_assert!(
            leaf_volume >= out_volume,
            "leaves cover {leaf_volume} points but the output has {out_volume}"
        );

        Ok(SchedulePlan {
            variant,
            schedule,
            grid,
        })
    }

    pub fn variant(&self) -> ScheduleVariant {
        self.variant
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn graph(&self) -> &Arc<Graph> {
        self.schedule.graph()
    }

    pub fn launch_grid(&self) -> LaunchGrid {
        self.grid
    }

    /// Leaf axes left to loop sequentially within each thread, outermost first.
    pub fn serial_axes(&self) -> impl Iterator<Item = &IterVar> + '_ {
        self.schedule.leaves().filter(|l| l.binding.is_none())
    }

    pub fn bound_axes(&self) -> impl Iterator<Item = (&IterVar, ThreadAxis)> + '_ {
        self.schedule
            .leaves()
            .filter_map(|l| l.binding.map(|b| (l, b)))
    }
}

impl LaunchGrid {
    fn from_schedule(schedule: &Schedule) -> Self {
        let mut grid = LaunchGrid {
            blocks: [1; 3],
            threads: [1; 3],
        };
        for leaf in schedule.leaves() {
            if let Some(axis) = leaf.binding {
                let dims = if axis.is_block() {
                    &mut grid.blocks
                } else {
                    &mut grid.threads
                };
                dims[axis.dim()] = leaf.extent.get();
            }
        }
        grid
    }

    pub fn block_count(&self) -> u64 {
        self.blocks.iter().map(|&b| u64::from(b)).product()
    }

    pub fn threads_per_block(&self) -> u64 {
        self.threads.iter().map(|&t| u64::from(t)).product()
    }
}

impl Display for LaunchGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [bx, by, bz] = self.blocks;
        let [tx, ty, tz] = self.threads;
        write!(f, "grid({bx}, {by}, {bz}) block({tx}, {ty}, {tz})")
    }
}
