use crate::common::DimSize;
use crate::expr::{IndexExpr, Predicate, Var};
use crate::graph::{Graph, TensorOp};
use crate::target::TargetCaps;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub use bind::BindAxis;
pub use fuse::FuseAxes;
pub use plan::{LaunchGrid, SchedulePlan};
pub use split::SplitAxis;

pub mod axis_binding;
pub mod bind;
pub mod fuse;
pub mod fused_split;
pub mod plan;
pub mod split;

#[enum_dispatch]
pub trait PrimitiveT {
    /// Apply to `schedule`, returning the transformed schedule. `schedule` is left untouched.
    fn apply(&self, schedule: &Schedule) -> Result<Schedule, ScheduleError>;
}

/// A loop transformation applied to a [Schedule].
///
/// Primitives name axes by [Var], so a primitive only makes sense for the schedule (or a
/// descendant of the schedule) whose axes it was built from.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Deserialize, Serialize)]
#[enum_dispatch(PrimitiveT)]
pub enum Primitive {
    /// Bind a leaf axis to a block or thread index.
    BindAxis(BindAxis),
    /// Fuse two adjacent leaf axes into one.
    FuseAxes(FuseAxes),
    /// Split a leaf axis into an outer and an inner axis.
    SplitAxis(SplitAxis),
}

/// A dimension of the hardware's execution grid.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum ThreadAxis {
    #[strum(serialize = "blockIdx.x")]
    BlockX,
    #[strum(serialize = "blockIdx.y")]
    BlockY,
    #[strum(serialize = "blockIdx.z")]
    BlockZ,
    #[strum(serialize = "threadIdx.x")]
    ThreadX,
    #[strum(serialize = "threadIdx.y")]
    ThreadY,
    #[strum(serialize = "threadIdx.z")]
    ThreadZ,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterVar {
    pub var: Var,
    pub name: String,
    pub extent: DimSize,
    pub binding: Option<ThreadAxis>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    Split {
        parent: Var,
        outer: Var,
        inner: Var,
        factor: DimSize,
    },
    Fuse {
        outer: Var,
        inner: Var,
        fused: Var,
    },
}

/// The loop structure of a graph's output stage.
///
/// A [Schedule] is immutable; [Primitive]s produce new schedules.
#[derive(Debug, Clone)]
pub struct Schedule {
    graph: Arc<Graph>,
    roots: Vec<Var>,
    iter_vars: BTreeMap<Var, IterVar>,
    leaves: Vec<Var>,
    relations: Vec<Relation>,
    history: Vec<Primitive>,
    next_var: u32,
}

/// The output axes expressed in terms of leaf axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBindings {
    /// One expression per output axis.
    pub exprs: Vec<IndexExpr>,
    /// Boundary conditions introduced by splits which don't evenly divide their axis.
    pub predicates: Vec<Predicate>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("output tensor {0:?} is a placeholder and has no loop nest to schedule")]
    OutputNotComputed(String),
    #[error("unschedulable axis: {0}")]
    UnschedulableAxis(UnschedulableReason),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UnschedulableReason {
    #[error("split width must be positive")]
    ZeroWidth,
    #[error("no axis {0}")]
    UnknownAxis(Var),
    #[error("{0} is not a leaf axis")]
    NotALeaf(String),
    #[error("{outer} does not immediately enclose {inner}")]
    NotAdjacent { outer: String, inner: String },
    #[error("{axis} is already bound to {to}")]
    AlreadyBound { axis: String, to: ThreadAxis },
    #[error("{to} is already bound to {axis}")]
    ThreadAxisTaken { to: ThreadAxis, axis: String },
    #[error("{0} is bound and can no longer be split or fused")]
    BoundAxisTransformed(String),
    #[error("fused extent of {0} overflows")]
    ExtentOverflow(String),
    #[error("expected {expected} output axes, found {found}")]
    RankMismatch { expected: usize, found: usize },
    #[error("{threads} threads per block exceeds the target limit of {limit}")]
    TooManyThreads { threads: u64, limit: u32 },
}

/// The two ways of mapping batch normalization onto the execution grid.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumIter,
)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum ScheduleVariant {
    /// Channels to blocks, rows to threads, columns serial.
    #[strum(serialize = "axis_binding")]
    #[cfg_attr(feature = "clap", value(name = "axis_binding"))]
    AxisBinding,
    /// All axes fused, then split by the maximum block width.
    #[strum(serialize = "fused_split")]
    #[cfg_attr(feature = "clap", value(name = "fused_split"))]
    FusedSplit,
}

impl ThreadAxis {
    pub fn is_block(self) -> bool {
        matches!(
            self,
            ThreadAxis::BlockX | ThreadAxis::BlockY | ThreadAxis::BlockZ
        )
    }

    /// 0, 1, and 2 for x, y, and z.
    pub fn dim(self) -> usize {
        match self {
            ThreadAxis::BlockX | ThreadAxis::ThreadX => 0,
            ThreadAxis::BlockY | ThreadAxis::ThreadY => 1,
            ThreadAxis::BlockZ | ThreadAxis::ThreadZ => 2,
        }
    }
}

impl ScheduleVariant {
    pub fn schedule(
        &self,
        graph: &Arc<Graph>,
        caps: &TargetCaps,
    ) -> Result<SchedulePlan, ScheduleError> {
        match self {
            ScheduleVariant::AxisBinding => axis_binding::schedule(graph, caps),
            ScheduleVariant::FusedSplit => fused_split::schedule(graph, caps),
        }
    }
}

impl Schedule {
    /// Start from the output stage's own axes, all serial.
    pub fn new(graph: Arc<Graph>) -> Result<Self, ScheduleError> {
        let output = graph.tensor(graph.output());
        let TensorOp::Compute { axes, .. } = &output.op else {
            return Err(ScheduleError::OutputNotComputed(output.name.clone()));
        };
        let iter_vars = axes
            .iter()
            .map(|a| {
                (
                    a.var,
                    IterVar {
                        var: a.var,
                        name: a.name.clone(),
                        extent: a.extent,
                        binding: None,
                    },
                )
            })
            .collect();
        let roots = axes.iter().map(|a| a.var).collect::<Vec<_>>();
        let next_var = graph.var_count();
        Ok(Schedule {
            graph,
            leaves: roots.clone(),
            roots,
            iter_vars,
            relations: vec![],
            history: vec![],
            next_var,
        })
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn roots(&self) -> &[Var] {
        &self.roots
    }

    /// Leaf axes, outermost first.
    pub fn leaves(&self) -> impl Iterator<Item = &IterVar> + '_ {
        self.leaves.iter().map(|v| &self.iter_vars[v])
    }

    pub fn iter_var(&self, var: Var) -> Option<&IterVar> {
        self.iter_vars.get(&var)
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn history(&self) -> &[Primitive] {
        &self.history
    }

    /// One past the largest [Var] used by this schedule or its graph.
    pub fn var_count(&self) -> u32 {
        self.next_var
    }

    pub fn apply(&self, primitive: &Primitive) -> Result<Schedule, ScheduleError> {
        primitive.apply(self)
    }

    pub fn bind(&self, axis: Var, to: ThreadAxis) -> Result<Schedule, ScheduleError> {
        self.apply(&BindAxis { axis, to }.into())
    }

    /// Fuse `outer` and `inner`, returning the new schedule and the fused axis.
    pub fn fuse(&self, outer: Var, inner: Var) -> Result<(Schedule, Var), ScheduleError> {
        let fused = Var(self.next_var);
        Ok((self.apply(&FuseAxes { outer, inner }.into())?, fused))
    }

    /// Split `axis` by `factor`, returning the new schedule and the outer and inner axes.
    pub fn split(&self, axis: Var, factor: u32) -> Result<(Schedule, Var, Var), ScheduleError> {
        let outer = Var(self.next_var);
        let inner = Var(self.next_var + 1);
        Ok((
            self.apply(&SplitAxis { axis, factor }.into())?,
            outer,
            inner,
        ))
    }

    /// Express each output axis in terms of the leaf axes.
    pub fn root_bindings(&self) -> RootBindings {
        let mut exprs = self
            .leaves
            .iter()
            .map(|&v| (v, IndexExpr::Var(v)))
            .collect::<HashMap<_, _>>();
        let mut predicates = vec![];
        for relation in self.relations.iter().rev() {
            match relation {
                Relation::Split {
                    parent,
                    outer,
                    inner,
                    factor,
                } => {
                    let e = exprs[outer].clone() * i64::from(factor.get()) + exprs[inner].clone();
                    let parent_extent = self.iter_vars[parent].extent.get();
                    if parent_extent % factor.get() != 0 {
                        predicates.push(Predicate {
                            lhs: e.clone(),
                            bound: i64::from(parent_extent),
                        });
                    }
                    exprs.insert(*parent, e);
                }
                Relation::Fuse {
                    outer,
                    inner,
                    fused,
                } => {
                    let inner_extent = i64::from(self.iter_vars[inner].extent.get());
                    let f = exprs[fused].clone();
                    exprs.insert(*outer, f.clone().floor_div(inner_extent));
                    exprs.insert(*inner, f.modulo(inner_extent));
                }
            }
        }
        RootBindings {
            exprs: self.roots.iter().map(|r| exprs[r].clone()).collect(),
            predicates,
        }
    }

    /// The output axes as a fixed-size array, for schedules which expect a particular rank.
    pub fn root_array<const N: usize>(&self) -> Result<[Var; N], ScheduleError> {
        self.roots.as_slice().try_into().map_err(|_| {
            ScheduleError::UnschedulableAxis(UnschedulableReason::RankMismatch {
                expected: N,
                found: self.roots.len(),
            })
        })
    }

    pub(crate) fn axis(&self, var: Var) -> Result<&IterVar, ScheduleError> {
        self.iter_vars
            .get(&var)
            .ok_or(ScheduleError::UnschedulableAxis(
                UnschedulableReason::UnknownAxis(var),
            ))
    }

    pub(crate) fn leaf_position(&self, var: Var) -> Result<usize, ScheduleError> {
        let iv = self.axis(var)?;
        self.leaves.iter().position(|&l| l == var).ok_or_else(|| {
            ScheduleError::UnschedulableAxis(UnschedulableReason::NotALeaf(iv.name.clone()))
        })
    }

    pub(crate) fn fresh(&mut self, name: String, extent: DimSize) -> Var {
        let var = Var(self.next_var);
        self.next_var += 1;
        self.iter_vars.insert(
            var,
            IterVar {
                var,
                name,
                extent,
                binding: None,
            },
        );
        var
    }

    pub(crate) fn set_binding(&mut self, var: Var, to: ThreadAxis) {
        if let Some(iv) = self.iter_vars.get_mut(&var) {
            iv.binding = Some(to);
        }
    }

    pub(crate) fn replace_leaves(&mut self, range: std::ops::RangeInclusive<usize>, with: &[Var]) {
        self.leaves.splice(range, with.iter().copied());
    }

    pub(crate) fn push_relation(&mut self, relation: Relation, primitive: Primitive) {
        self.relations.push(relation);
        self.history.push(primitive);
    }

    pub(crate) fn push_history(&mut self, primitive: Primitive) {
        self.history.push(primitive);
    }
}

impl Primitive {
    /// A one-line description, naming axes as they are named in `schedule`.
    pub fn describe(&self, schedule: &Schedule) -> String {
        let name = |v: &Var| {
            schedule
                .iter_var(*v)
                .map(|iv| iv.name.clone())
                .unwrap_or_else(|| v.to_string())
        };
        match self {
            Primitive::BindAxis(BindAxis { axis, to }) => format!("bind({}, {to})", name(axis)),
            Primitive::FuseAxes(FuseAxes { outer, inner }) => {
                format!("fuse({}, {})", name(outer), name(inner))
            }
            Primitive::SplitAxis(SplitAxis { axis, factor }) => {
                format!("split({}, factor={factor})", name(axis))
            }
        }
    }
}

pub(crate) fn unschedulable(reason: UnschedulableReason) -> ScheduleError {
    ScheduleError::UnschedulableAxis(reason)
}
