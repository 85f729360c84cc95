//! Index and scalar expressions.
//!
//! [IndexExpr]s compute tensor coordinates from loop variables. [Expr]s compute the `f32`
//! value stored at a coordinate from loads of other tensors.

use crate::graph::TensorId;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::ops;

/// Tensors never have more dimensions than this.
pub const MAX_RANK: usize = 4;

/// A loop or axis variable. Variables index into a flat environment at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct Var(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexExpr {
    Var(Var),
    Const(i64),
    Add(Box<IndexExpr>, Box<IndexExpr>),
    Mul(Box<IndexExpr>, Box<IndexExpr>),
    FloorDiv(Box<IndexExpr>, Box<IndexExpr>),
    Mod(Box<IndexExpr>, Box<IndexExpr>),
}

/// `lhs < bound`. Stores are only performed when every guarding predicate holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Predicate {
    pub lhs: IndexExpr,
    pub bound: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f32),
    Load {
        tensor: TensorId,
        indices: Vec<IndexExpr>,
    },
    Sqrt(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Var {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl IndexExpr {
    pub fn as_const(&self) -> Option<i64> {
        match self {
            IndexExpr::Const(c) => Some(*c),
            _ => None,
        }
    }

    pub fn floor_div(self, rhs: impl Into<IndexExpr>) -> IndexExpr {
        let rhs = rhs.into();
        match (self.as_const(), rhs.as_const()) {
            (_, Some(1)) => self,
            (Some(a), Some(b)) if b != 0 => IndexExpr::Const(a.div_euclid(b)),
            _ => IndexExpr::FloorDiv(Box::new(self), Box::new(rhs)),
        }
    }

    pub fn modulo(self, rhs: impl Into<IndexExpr>) -> IndexExpr {
        let rhs = rhs.into();
        match (self.as_const(), rhs.as_const()) {
            (_, Some(1)) => IndexExpr::Const(0),
            (Some(a), Some(b)) if b != 0 => IndexExpr::Const(a.rem_euclid(b)),
            _ => IndexExpr::Mod(Box::new(self), Box::new(rhs)),
        }
    }

    /// Evaluate with variable values taken from `env`, indexed by [Var::index].
    ///
    /// Panics if a variable is outside `env` or a divisor is zero.
    pub fn eval(&self, env: &[i64]) -> i64 {
        match self {
            IndexExpr::Var(v) => env[v.index()],
            IndexExpr::Const(c) => *c,
            IndexExpr::Add(a, b) => a.eval(env) + b.eval(env),
            IndexExpr::Mul(a, b) => a.eval(env) * b.eval(env),
            IndexExpr::FloorDiv(a, b) => a.eval(env).div_euclid(b.eval(env)),
            IndexExpr::Mod(a, b) => a.eval(env).rem_euclid(b.eval(env)),
        }
    }

    #[must_use]
    pub fn substitute(&self, bindings: &HashMap<Var, IndexExpr>) -> IndexExpr {
        match self {
            IndexExpr::Var(v) => bindings.get(v).cloned().unwrap_or(IndexExpr::Var(*v)),
            IndexExpr::Const(c) => IndexExpr::Const(*c),
            IndexExpr::Add(a, b) => a.substitute(bindings) + b.substitute(bindings),
            IndexExpr::Mul(a, b) => a.substitute(bindings) * b.substitute(bindings),
            IndexExpr::FloorDiv(a, b) => a.substitute(bindings).floor_div(b.substitute(bindings)),
            IndexExpr::Mod(a, b) => a.substitute(bindings).modulo(b.substitute(bindings)),
        }
    }

    /// Render in C syntax, naming variables with `name`.
    ///
    /// Integer division in C truncates, which agrees with floor division because every index
    /// expression here is non-negative.
    pub fn render<F>(&self, name: &F) -> String
    where
        F: Fn(Var) -> String,
    {
        match self {
            IndexExpr::Var(v) => name(*v),
            IndexExpr::Const(c) => c.to_string(),
            IndexExpr::Add(a, b) => format!("({} + {})", a.render(name), b.render(name)),
            IndexExpr::Mul(a, b) => {
                format!("{} * {}", a.render_operand(name), b.render_operand(name))
            }
            IndexExpr::FloorDiv(a, b) => {
                format!("({} / {})", a.render(name), b.render(name))
            }
            IndexExpr::Mod(a, b) => format!("({} % {})", a.render(name), b.render(name)),
        }
    }

    fn render_operand<F>(&self, name: &F) -> String
    where
        F: Fn(Var) -> String,
    {
        match self {
            IndexExpr::Mul(..) => format!("({})", self.render(name)),
            _ => self.render(name),
        }
    }
}

impl From<i64> for IndexExpr {
    fn from(value: i64) -> Self {
        IndexExpr::Const(value)
    }
}

impl From<Var> for IndexExpr {
    fn from(value: Var) -> Self {
        IndexExpr::Var(value)
    }
}

impl<T: Into<IndexExpr>> ops::Add<T> for IndexExpr {
    type Output = IndexExpr;

    fn add(self, rhs: T) -> IndexExpr {
        let rhs = rhs.into();
        match (self.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => IndexExpr::Const(a + b),
            (Some(0), _) => rhs,
            (_, Some(0)) => self,
            _ => IndexExpr::Add(Box::new(self), Box::new(rhs)),
        }
    }
}

impl<T: Into<IndexExpr>> ops::Mul<T> for IndexExpr {
    type Output = IndexExpr;

    fn mul(self, rhs: T) -> IndexExpr {
        let rhs = rhs.into();
        match (self.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => IndexExpr::Const(a * b),
            (Some(0), _) | (_, Some(0)) => IndexExpr::Const(0),
            (Some(1), _) => rhs,
            (_, Some(1)) => self,
            _ => IndexExpr::Mul(Box::new(self), Box::new(rhs)),
        }
    }
}

impl Display for IndexExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&|v: Var| v.to_string()))
    }
}

impl Predicate {
    pub fn holds(&self, env: &[i64]) -> bool {
        self.lhs.eval(env) < self.bound
    }

    pub fn render<F>(&self, name: &F) -> String
    where
        F: Fn(Var) -> String,
    {
        format!("{} < {}", self.lhs.render(name), self.bound)
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} < {}", self.lhs, self.bound)
    }
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }

    pub fn apply(&self, lhs: f32, rhs: f32) -> f32 {
        match self {
            BinOp::Add => lhs + rhs,
            BinOp::Sub => lhs - rhs,
            BinOp::Mul => lhs * rhs,
            BinOp::Div => lhs / rhs,
        }
    }
}

impl Expr {
    pub fn load(tensor: TensorId, indices: Vec<IndexExpr>) -> Self {
        Expr::Load { tensor, indices }
    }

    #[must_use]
    pub fn sqrt(self) -> Self {
        Expr::Sqrt(Box::new(self))
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// Rebuild this expression, replacing every load with the result of `f`.
    #[must_use]
    pub fn map_loads<F>(&self, f: &mut F) -> Expr
    where
        F: FnMut(TensorId, &[IndexExpr]) -> Expr,
    {
        match self {
            Expr::Const(c) => Expr::Const(*c),
            Expr::Load { tensor, indices } => f(*tensor, indices),
            Expr::Sqrt(inner) => inner.map_loads(f).sqrt(),
            Expr::Binary(op, a, b) => Expr::binary(*op, a.map_loads(f), b.map_loads(f)),
        }
    }

    #[must_use]
    pub fn substitute(&self, bindings: &HashMap<Var, IndexExpr>) -> Expr {
        self.map_loads(&mut |tensor, indices| {
            Expr::load(
                tensor,
                indices.iter().map(|i| i.substitute(bindings)).collect(),
            )
        })
    }

    /// Visit every load in evaluation order.
    pub fn visit_loads<F>(&self, f: &mut F)
    where
        F: FnMut(TensorId, &[IndexExpr]),
    {
        match self {
            Expr::Const(_) => {}
            Expr::Load { tensor, indices } => f(*tensor, indices),
            Expr::Sqrt(inner) => inner.visit_loads(f),
            Expr::Binary(_, a, b) => {
                a.visit_loads(f);
                b.visit_loads(f);
            }
        }
    }

    /// Evaluate, resolving each load's coordinates through `env` and reading values with `load`.
    pub fn try_eval<E, F>(&self, env: &[i64], load: &mut F) -> Result<f32, E>
    where
        F: FnMut(TensorId, &[i64]) -> Result<f32, E>,
    {
        match self {
            Expr::Const(c) => Ok(*c),
            Expr::Load { tensor, indices } => {
                debug_assert!(indices.len() <= MAX_RANK);
                let mut coords = [0i64; MAX_RANK];
                for (dst, idx) in coords.iter_mut().zip(indices) {
                    *dst = idx.eval(env);
                }
                load(*tensor, &coords[..indices.len()])
            }
            Expr::Sqrt(inner) => Ok(inner.try_eval(env, load)?.sqrt()),
            Expr::Binary(op, a, b) => {
                let lhs = a.try_eval(env, load)?;
                let rhs = b.try_eval(env, load)?;
                Ok(op.apply(lhs, rhs))
            }
        }
    }

    /// Render in C syntax. `load` renders a single tensor access.
    pub fn render<F>(&self, load: &F) -> String
    where
        F: Fn(TensorId, &[IndexExpr]) -> String,
    {
        match self {
            Expr::Const(c) => format!("{c:e}f"),
            Expr::Load { tensor, indices } => load(*tensor, indices),
            Expr::Sqrt(inner) => format!("sqrtf({})", inner.render(load)),
            Expr::Binary(op, a, b) => {
                format!("({} {} {})", a.render(load), op.symbol(), b.render(load))
            }
        }
    }
}

macro_rules! expr_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl ops::$trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }
    };
}

expr_binop!(Add, add, BinOp::Add);
expr_binop!(Sub, sub, BinOp::Sub);
expr_binop!(Mul, mul, BinOp::Mul);
expr_binop!(Div, div, BinOp::Div);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(i: u32) -> IndexExpr {
        IndexExpr::Var(Var(i))
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(v(0) * 1, v(0));
        assert_eq!(v(0) + 0, v(0));
        assert_eq!(v(0) * 0, IndexExpr::Const(0));
        assert_eq!(v(0).floor_div(1), v(0));
        assert_eq!(v(0).modulo(1), IndexExpr::Const(0));
        assert_eq!(IndexExpr::Const(7).floor_div(2), IndexExpr::Const(3));
        assert_eq!(IndexExpr::Const(7).modulo(2), IndexExpr::Const(1));
    }

    #[test]
    fn test_render_c() {
        let e = (v(0) * 1024 + v(1)).floor_div(784);
        let name = |var: Var| ["outer", "inner"][var.index()].to_owned();
        assert_eq!(e.render(&name), "((outer * 1024 + inner) / 784)");
    }

    #[test]
    fn test_substitute_then_eval() {
        let fused = v(2);
        let c = fused.clone().floor_div(6);
        let rest = fused.modulo(6);
        let mut bindings = HashMap::new();
        bindings.insert(Var(2), v(0) * 4 + v(1));
        let env = [2, 3, 0];
        // fused = 2 * 4 + 3 = 11
        assert_eq!(c.substitute(&bindings).eval(&env), 1);
        assert_eq!(rest.substitute(&bindings).eval(&env), 5);
    }

    #[test]
    fn test_expr_eval_loads() {
        let t = TensorId(0);
        let e = (Expr::load(t, vec![v(0)]) - Expr::Const(1.0)).sqrt();
        let got: Result<f32, ()> = e.try_eval(&[1], &mut |_, idx| Ok([5.0, 10.0][idx[0] as usize]));
        assert_eq!(got, Ok(3.0));
    }

    proptest! {
        #[test]
        fn test_split_fuse_roundtrip_indices(
            extent in 1i64..500, factor in 1i64..64, i in 0i64..500
        ) {
            prop_assume!(i < extent);
            let outer = v(0);
            let inner = v(1);
            let recomposed = outer * factor + inner;
            let env = [i / factor, i % factor];
            prop_assert_eq!(recomposed.eval(&env), i);
        }
    }
}
