use crate::expr::Var;
use crate::scheduling::{
    unschedulable, PrimitiveT, Schedule, ScheduleError, ThreadAxis, UnschedulableReason,
};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Hash, Eq, PartialEq, Deserialize, Serialize)]
pub struct BindAxis {
    pub axis: Var,
    pub to: ThreadAxis,
}

impl PrimitiveT for BindAxis {
    fn apply(&self, schedule: &Schedule) -> Result<Schedule, ScheduleError> {
        schedule.leaf_position(self.axis)?;
        let iv = schedule.axis(self.axis)?;
        if let Some(existing) = iv.binding {
            return Err(unschedulable(UnschedulableReason::AlreadyBound {
                axis: iv.name.clone(),
                to: existing,
            }));
        }
        if let Some(other) = schedule.leaves().find(|l| l.binding == Some(self.to)) {
            return Err(unschedulable(UnschedulableReason::ThreadAxisTaken {
                to: self.to,
                axis: other.name.clone(),
            }));
        }

        let mut result = schedule.clone();
        result.set_binding(self.axis, self.to);
        result.push_history(self.clone().into());
        Ok(result)
    }
}
