use crate::common::DimSize;
use crate::expr::Var;
use crate::scheduling::{
    unschedulable, PrimitiveT, Relation, Schedule, ScheduleError, UnschedulableReason,
};

use serde::{Deserialize, Serialize};

/// Split a leaf axis into `outer` and `inner` axes with `inner.extent == factor`.
///
/// When `factor` does not divide the axis, the outer axis is rounded up and the schedule
/// gains a boundary predicate (see [Schedule::root_bindings]).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Deserialize, Serialize)]
pub struct SplitAxis {
    pub axis: Var,
    pub factor: u32,
}

impl PrimitiveT for SplitAxis {
    fn apply(&self, schedule: &Schedule) -> Result<Schedule, ScheduleError> {
        let Some(factor) = DimSize::new(self.factor) else {
            return Err(unschedulable(UnschedulableReason::ZeroWidth));
        };
        let pos = schedule.leaf_position(self.axis)?;
        let iv = schedule.axis(self.axis)?;
        if iv.binding.is_some() {
            return Err(unschedulable(UnschedulableReason::BoundAxisTransformed(
                iv.name.clone(),
            )));
        }

        let outer_extent = DimSize::new(iv.extent.get().div_ceil(factor.get()))
            .expect("ceiling division of positive values is positive");
        let outer_name = format!("{}.outer", iv.name);
        let inner_name = format!("{}.inner", iv.name);

        let mut result = schedule.clone();
        let outer = result.fresh(outer_name, outer_extent);
        let inner = result.fresh(inner_name, factor);
        result.replace_leaves(pos..=pos, &[outer, inner]);
        result.push_relation(
            Relation::Split {
                parent: self.axis,
                outer,
                inner,
                factor,
            },
            self.clone().into(),
        );
        Ok(result)
    }
}
