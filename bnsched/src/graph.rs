//! Unscheduled tensor computation graphs.
//!
//! A [Graph] is built once with a [GraphBuilder] and never mutated afterwards. Each tensor is
//! either a placeholder (a named input) or a compute stage whose body is a scalar [Expr] over
//! the stage's axis variables. Bodies may only load tensors declared before them, so every
//! [Graph] is acyclic by construction.

use crate::common::{shape_to_usize, DimSize, Shape};
use crate::expr::{Expr, IndexExpr, Var, MAX_RANK};

use log::debug;
use ndarray::{ArrayD, Dimension, IxDyn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u16);

#[derive(Debug, Clone)]
pub struct TensorDecl {
    pub name: String,
    pub shape: Shape,
    pub op: TensorOp,
}

#[derive(Debug, Clone)]
pub enum TensorOp {
    Placeholder,
    Compute {
        axes: Vec<Axis>,
        body: Expr,
    },
}

/// A named iteration axis of a compute stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Axis {
    pub var: Var,
    pub name: String,
    pub extent: DimSize,
}

#[derive(Debug, Clone)]
pub struct Graph {
    tensors: Vec<TensorDecl>,
    output: TensorId,
    var_count: u32,
}

#[derive(Default)]
pub struct GraphBuilder {
    tensors: Vec<TensorDecl>,
    next_var: u32,
}

/// Tensor values bound to a graph's placeholders (and, after a launch, its output).
#[derive(Debug, Clone, Default)]
pub struct KernelArgs {
    buffers: BTreeMap<TensorId, ArrayD<f32>>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    #[error("no value bound to input {0:?}")]
    Missing(String),
    #[error("input {name:?} has shape {actual:?} but {expected:?} was expected")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn placeholder(&mut self, name: impl Into<String>, shape: Shape) -> TensorId {
        assert!(shape.len() <= MAX_RANK, "rank {} is too large", shape.len());
        self.push(TensorDecl {
            name: name.into(),
            shape,
            op: TensorOp::Placeholder,
        })
    }

    /// Declare a compute stage of the given shape.
    ///
    /// `body` receives one [IndexExpr] per axis, in the order of `axis_names`, and returns the
    /// value of the stage at that coordinate.
    pub fn compute<F>(
        &mut self,
        name: impl Into<String>,
        shape: Shape,
        axis_names: &[&str],
        body: F,
    ) -> TensorId
    where
        F: FnOnce(&[IndexExpr]) -> Expr,
    {
        assert_eq!(shape.len(), axis_names.len());
        assert!(shape.len() <= MAX_RANK, "rank {} is too large", shape.len());
        let axes = shape
            .iter()
            .zip(axis_names)
            .map(|(&extent, &axis_name)| {
                let var = Var(self.next_var);
                self.next_var += 1;
                Axis {
                    var,
                    name: axis_name.to_owned(),
                    extent,
                }
            })
            .collect::<Vec<_>>();
        let axis_exprs = axes.iter().map(|a| IndexExpr::Var(a.var)).collect::<Vec<_>>();
        let body = body(&axis_exprs);

        let next_id = self.tensors.len();
        body.visit_loads(&mut |tensor, indices| {
            let t = usize::from(tensor.0);
            assert!(t < next_id, "stage may only load earlier tensors");
            assert_eq!(indices.len(), self.tensors[t].shape.len());
        });

        self.push(TensorDecl {
            name: name.into(),
            shape,
            op: TensorOp::Compute { axes, body },
        })
    }

    pub fn build(self, output: TensorId) -> Graph {
        assert!(usize::from(output.0) < self.tensors.len());
        Graph {
            tensors: self.tensors,
            output,
            var_count: self.next_var,
        }
    }

    fn push(&mut self, decl: TensorDecl) -> TensorId {
        let id = TensorId(
            self.tensors
                .len()
                .try_into()
                .expect("graph has too many tensors"),
        );
        self.tensors.push(decl);
        id
    }
}

impl Graph {
    pub fn tensor(&self, id: TensorId) -> &TensorDecl {
        &self.tensors[usize::from(id.0)]
    }

    pub fn tensors(&self) -> impl Iterator<Item = (TensorId, &TensorDecl)> + '_ {
        self.tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (TensorId(i as u16), t))
    }

    pub fn output(&self) -> TensorId {
        self.output
    }

    /// The placeholders, in declaration order.
    pub fn inputs(&self) -> impl Iterator<Item = (TensorId, &TensorDecl)> + '_ {
        self.tensors()
            .filter(|(_, t)| matches!(t.op, TensorOp::Placeholder))
    }

    /// Number of axis variables allocated by the graph. Schedules number their own variables
    /// after these.
    pub fn var_count(&self) -> u32 {
        self.var_count
    }

    /// Returns the output stage's axes and body with every producer compute stage substituted
    /// in, leaving only placeholder loads.
    ///
    /// Returns `None` if the output is a placeholder.
    pub fn inline_output(&self) -> Option<(Vec<Axis>, Expr)> {
        let TensorOp::Compute { axes, body } = &self.tensor(self.output).op else {
            return None;
        };
        Some((axes.clone(), self.inline_expr(body)))
    }

    fn inline_expr(&self, expr: &Expr) -> Expr {
        expr.map_loads(&mut |tensor, indices| match &self.tensor(tensor).op {
            TensorOp::Placeholder => Expr::load(tensor, indices.to_vec()),
            TensorOp::Compute { axes, body } => {
                let bindings = axes
                    .iter()
                    .map(|a| a.var)
                    .zip(indices.iter().cloned())
                    .collect::<HashMap<_, _>>();
                self.inline_expr(&body.substitute(&bindings))
            }
        })
    }

    /// Evaluate the graph directly, materializing every stage in declaration order.
    pub fn evaluate(&self, args: &KernelArgs) -> Result<ArrayD<f32>, ArgsError> {
        args.check(self)?;
        let mut values: Vec<Option<ArrayD<f32>>> = vec![None; self.tensors.len()];
        let mut env = vec![0i64; self.var_count as usize];
        for (id, decl) in self.tensors() {
            let TensorOp::Compute { axes, body } = &decl.op else {
                continue;
            };
            let shape = shape_to_usize(&decl.shape);
            debug!("Evaluating stage {} with shape {:?}", decl.name, shape);
            let mut result = ArrayD::<f32>::zeros(IxDyn(&shape));
            for (coord, slot) in result.indexed_iter_mut() {
                for (axis, &c) in axes.iter().zip(coord.slice()) {
                    env[axis.var.index()] = c as i64;
                }
                *slot = body
                    .try_eval(&env, &mut |tensor, coords| {
                        let source = match &self.tensor(tensor).op {
                            TensorOp::Placeholder => args.get(tensor),
                            TensorOp::Compute { .. } => values[usize::from(tensor.0)].as_ref(),
                        };
                        let idx = coords.iter().map(|&c| c as usize).collect::<Vec<_>>();
                        source
                            .and_then(|a| a.get(idx.as_slice()))
                            .copied()
                            .ok_or(())
                    })
                    .expect("direct evaluation stays in bounds");
            }
            values[usize::from(id.0)] = Some(result);
        }
        Ok(values[usize::from(self.output.0)]
            .take()
            .expect("output is a compute stage"))
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (_, decl) in self.tensors() {
            let shape = decl.shape.iter().map(|d| d.to_string()).collect::<Vec<_>>();
            match &decl.op {
                TensorOp::Placeholder => {
                    writeln!(f, "{}: placeholder[{}]", decl.name, shape.join(", "))?;
                }
                TensorOp::Compute { axes, body } => {
                    let names = axes
                        .iter()
                        .map(|a| (a.var, a.name.clone()))
                        .collect::<HashMap<_, _>>();
                    let name_of = |v: Var| names.get(&v).cloned().unwrap_or_else(|| v.to_string());
                    let rendered = body.render(&|tensor, indices| {
                        let idx = indices
                            .iter()
                            .map(|i| i.render(&name_of))
                            .collect::<Vec<_>>();
                        format!("{}[{}]", self.tensor(tensor).name, idx.join(", "))
                    });
                    let axis_names = axes.iter().map(|a| a.name.as_str()).collect::<Vec<_>>();
                    writeln!(
                        f,
                        "{}[{}] = {}  for {} in [{}]",
                        decl.name,
                        axis_names.join(", "),
                        rendered,
                        axis_names.join(", "),
                        shape.join(", ")
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tensor: TensorId, value: ArrayD<f32>) {
        self.buffers.insert(tensor, value);
    }

    pub fn get(&self, tensor: TensorId) -> Option<&ArrayD<f32>> {
        self.buffers.get(&tensor)
    }

    /// Check that every placeholder of `graph` is bound to a value of the right shape.
    pub fn check(&self, graph: &Graph) -> Result<(), ArgsError> {
        for (id, decl) in graph.inputs() {
            let Some(value) = self.get(id) else {
                return Err(ArgsError::Missing(decl.name.clone()));
            };
            let expected = shape_to_usize(&decl.shape);
            if value.shape() != expected.as_slice() {
                return Err(ArgsError::ShapeMismatch {
                    name: decl.name.clone(),
                    expected,
                    actual: value.shape().to_vec(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonzero::nonzero as nz;

    fn doubled_plus_one() -> (Graph, TensorId) {
        let mut b = GraphBuilder::new();
        let a = b.placeholder("a", vec![nz!(2u32), nz!(3u32)]);
        let twice = b.compute("twice", vec![nz!(2u32), nz!(3u32)], &["i", "j"], |ax| {
            Expr::load(a, ax.to_vec()) * Expr::Const(2.0)
        });
        let out = b.compute("out", vec![nz!(2u32), nz!(3u32)], &["i", "j"], |ax| {
            Expr::load(twice, ax.to_vec()) + Expr::Const(1.0)
        });
        (b.build(out), a)
    }

    #[test]
    fn test_evaluate_materializes_stages() {
        let (graph, a) = doubled_plus_one();
        let mut args = KernelArgs::new();
        args.insert(
            a,
            ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![0., 1., 2., 3., 4., 5.]).unwrap(),
        );
        let out = graph.evaluate(&args).unwrap();
        assert_eq!(out.as_slice().unwrap(), &[1., 3., 5., 7., 9., 11.]);
    }

    #[test]
    fn test_inline_output_leaves_only_placeholder_loads() {
        let (graph, a) = doubled_plus_one();
        let (axes, body) = graph.inline_output().unwrap();
        assert_eq!(axes.len(), 2);
        let mut loaded = vec![];
        body.visit_loads(&mut |t, _| loaded.push(t));
        assert_eq!(loaded, vec![a]);
    }

    #[test]
    fn test_check_reports_missing_and_mismatched_inputs() {
        let (graph, a) = doubled_plus_one();
        assert_eq!(
            KernelArgs::new().check(&graph),
            Err(ArgsError::Missing("a".to_owned()))
        );
        let mut args = KernelArgs::new();
        args.insert(a, ArrayD::zeros(IxDyn(&[3, 2])));
        assert!(matches!(
            args.check(&graph),
            Err(ArgsError::ShapeMismatch { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "stage may only load earlier tensors")]
    fn test_compute_rejects_forward_references() {
        let mut b = GraphBuilder::new();
        b.compute("bad", vec![nz!(1u32)], &["i"], |ax| {
            Expr::load(TensorId(5), ax.to_vec())
        });
    }
}
