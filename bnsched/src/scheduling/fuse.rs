use crate::expr::Var;
use crate::scheduling::{
    unschedulable, PrimitiveT, Relation, Schedule, ScheduleError, UnschedulableReason,
};

use serde::{Deserialize, Serialize};

/// Fuse two adjacent leaf axes, `outer` immediately enclosing `inner`.
///
/// The fused axis iterates `outer.extent * inner.extent` times; the original axes are
/// recovered by division and remainder by `inner.extent`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Deserialize, Serialize)]
pub struct FuseAxes {
    pub outer: Var,
    pub inner: Var,
}

impl PrimitiveT for FuseAxes {
    fn apply(&self, schedule: &Schedule) -> Result<Schedule, ScheduleError> {
        let outer_pos = schedule.leaf_position(self.outer)?;
        let inner_pos = schedule.leaf_position(self.inner)?;
        let outer = schedule.axis(self.outer)?;
        let inner = schedule.axis(self.inner)?;
        if inner_pos != outer_pos + 1 {
            return Err(unschedulable(UnschedulableReason::NotAdjacent {
                outer: outer.name.clone(),
                inner: inner.name.clone(),
            }));
        }
        for iv in [outer, inner] {
            if iv.binding.is_some() {
                return Err(unschedulable(UnschedulableReason::BoundAxisTransformed(
                    iv.name.clone(),
                )));
            }
        }

        let name = format!("{}.{}.fused", unfused(&outer.name), unfused(&inner.name));
        let extent = outer
            .extent
            .checked_mul(inner.extent)
            .ok_or_else(|| unschedulable(UnschedulableReason::ExtentOverflow(name.clone())))?;

        let mut result = schedule.clone();
        let fused = result.fresh(name, extent);
        result.replace_leaves(outer_pos..=inner_pos, &[fused]);
        result.push_relation(
            Relation::Fuse {
                outer: self.outer,
                inner: self.inner,
                fused,
            },
            self.clone().into(),
        );
        Ok(result)
    }
}

fn unfused(name: &str) -> &str {
    name.strip_suffix(".fused").unwrap_or(name)
}
