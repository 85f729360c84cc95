//! Lowering a [SchedulePlan] to a launchable kernel.

use crate::common::shape_to_usize;
use crate::expr::{Expr, IndexExpr, Predicate, Var};
use crate::graph::TensorId;
use crate::scheduling::{LaunchGrid, SchedulePlan, ScheduleVariant, ThreadAxis};
use crate::utils::indent;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};

/// A kernel body. Grid-bound variables are free in the body; each thread executes it once.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    For {
        var: Var,
        extent: u32,
        body: Box<Stmt>,
    },
    /// Run `body` only if every predicate holds.
    Guard {
        predicates: Vec<Predicate>,
        body: Box<Stmt>,
    },
    Store {
        tensor: TensorId,
        indices: Vec<IndexExpr>,
        value: Expr,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelParam {
    pub tensor: TensorId,
    pub name: String,
    pub shape: Vec<usize>,
    pub is_output: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredKernel {
    pub name: String,
    pub variant: ScheduleVariant,
    pub grid: LaunchGrid,
    /// Variables set from the block and thread indices.
    pub bindings: Vec<(Var, ThreadAxis)>,
    /// Inputs in declaration order, then the output.
    pub params: Vec<KernelParam>,
    pub body: Stmt,
    /// Size of the variable environment needed to evaluate the body.
    pub var_count: u32,
    var_names: BTreeMap<Var, String>,
}

/// Lower `plan` to a single kernel.
///
/// The output stage's producers are inlined into its body, output axes are replaced by their
/// expressions over leaf axes, serial leaves become loops (outermost first), and any boundary
/// predicates guard the store.
pub fn lower(plan: &SchedulePlan) -> LoweredKernel {
    let schedule = plan.schedule();
    let graph = plan.graph();
    let (axes, body) = graph
        .inline_output()
        .expect("a schedule's output is always a compute stage");
    let root_bindings = schedule.root_bindings();
    let substitutions = axes
        .iter()
        .map(|a| a.var)
        .zip(root_bindings.exprs.iter().cloned())
        .collect::<HashMap<_, _>>();

    let mut stmt = Stmt::Store {
        tensor: graph.output(),
        indices: root_bindings.exprs.clone(),
        value: body.substitute(&substitutions),
    };
    if !root_bindings.predicates.is_empty() {
        stmt = Stmt::Guard {
            predicates: root_bindings.predicates,
            body: Box::new(stmt),
        };
    }
    let serial = plan.serial_axes().collect::<Vec<_>>();
    for leaf in serial.into_iter().rev() {
        stmt = Stmt::For {
            var: leaf.var,
            extent: leaf.extent.get(),
            body: Box::new(stmt),
        };
    }

    let params = graph
        .inputs()
        .chain(std::iter::once((graph.output(), graph.tensor(graph.output()))))
        .map(|(id, decl)| KernelParam {
            tensor: id,
            name: decl.name.clone(),
            shape: shape_to_usize(&decl.shape),
            is_output: id == graph.output(),
        })
        .collect();

    let var_names = schedule
        .leaves()
        .map(|l| (l.var, l.name.clone()))
        .collect();

    LoweredKernel {
        name: format!("{}_{}", graph.tensor(graph.output()).name, plan.variant()),
        variant: plan.variant(),
        grid: plan.launch_grid(),
        bindings: plan.bound_axes().map(|(l, b)| (l.var, b)).collect(),
        params,
        body: stmt,
        var_count: schedule.var_count(),
        var_names,
    }
}

impl LoweredKernel {
    pub fn output(&self) -> &KernelParam {
        self.params
            .iter()
            .find(|p| p.is_output)
            .expect("every kernel has an output parameter")
    }

    pub fn inputs(&self) -> impl Iterator<Item = &KernelParam> + '_ {
        self.params.iter().filter(|p| !p.is_output)
    }

    pub fn param(&self, tensor: TensorId) -> Option<&KernelParam> {
        self.params.iter().find(|p| p.tensor == tensor)
    }

    /// The name of a loop or grid variable, as it was named in the schedule.
    pub fn var_name(&self, var: Var) -> String {
        self.var_names
            .get(&var)
            .cloned()
            .unwrap_or_else(|| var.to_string())
    }

    /// True if the body contains a boundary guard.
    pub fn is_guarded(&self) -> bool {
        fn visit(stmt: &Stmt) -> bool {
            match stmt {
                Stmt::For { body, .. } => visit(body),
                Stmt::Guard { .. } => true,
                Stmt::Store { .. } => false,
            }
        }
        visit(&self.body)
    }

    fn fmt_stmt(&self, f: &mut fmt::Formatter<'_>, stmt: &Stmt, depth: usize) -> fmt::Result {
        let name = |v: Var| self.var_name(v);
        match stmt {
            Stmt::For { var, extent, body } => {
                writeln!(f, "{}for {} in 0..{}:", indent(depth), name(*var), extent)?;
                self.fmt_stmt(f, body, depth + 1)
            }
            Stmt::Guard { predicates, body } => {
                let conds = predicates
                    .iter()
                    .map(|p| p.render(&name))
                    .collect::<Vec<_>>();
                writeln!(f, "{}if {}:", indent(depth), conds.join(" && "))?;
                self.fmt_stmt(f, body, depth + 1)
            }
            Stmt::Store {
                tensor,
                indices,
                value,
            } => {
                let access = |t: TensorId, idx: &[IndexExpr]| {
                    let param_name = self
                        .param(t)
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| format!("{t:?}"));
                    let idx = idx.iter().map(|i| i.render(&name)).collect::<Vec<_>>();
                    format!("{}[{}]", param_name, idx.join(", "))
                };
                writeln!(
                    f,
                    "{}{} = {}",
                    indent(depth),
                    access(*tensor, indices.as_slice()),
                    value.render(&access)
                )
            }
        }
    }
}

impl Display for LoweredKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "kernel {} {}", self.name, self.grid)?;
        for (var, axis) in &self.bindings {
            writeln!(f, "{}{} = {}", indent(1), self.var_name(*var), axis)?;
        }
        self.fmt_stmt(f, &self.body, 1)
    }
}
