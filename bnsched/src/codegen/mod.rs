//! Source emission for lowered kernels.
//!
//! C source is what the clang target compiles. CUDA source is emitted for inspection only.

mod c;
mod cuda;

pub use c::emit_c;
pub use cuda::emit_cuda;

use crate::common::row_major_strides;
use crate::expr::{IndexExpr, Var};
use crate::graph::TensorId;
use crate::lower::{LoweredKernel, Stmt};
use crate::scheduling::ThreadAxis;
use crate::target::TargetError;
use crate::utils::indent;

use std::fmt::{self, Write};
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum EmitFormat {
    /// The schedule's axes, relations, and launch grid.
    Plan,
    /// The lowered loop nest.
    Lowered,
    #[default]
    C,
    Cuda,
}

/// Writes the statements of a [LoweredKernel] in C syntax.
pub(crate) struct BodyEmitter<'a> {
    kernel: &'a LoweredKernel,
}

impl<'a> BodyEmitter<'a> {
    pub(crate) fn new(kernel: &'a LoweredKernel) -> Self {
        BodyEmitter { kernel }
    }

    pub(crate) fn var(&self, var: Var) -> String {
        c_ident(&self.kernel.var_name(var))
    }

    fn access(&self, tensor: TensorId, indices: &[IndexExpr]) -> String {
        let Some(param) = self.kernel.param(tensor) else {
            return format!("/* unknown {tensor:?} */ 0");
        };
        let strides = row_major_strides(&param.shape);
        let flat = indices
            .iter()
            .zip(strides)
            .fold(IndexExpr::Const(0), |acc, (idx, stride)| {
                acc + idx.clone() * (stride as i64)
            });
        format!(
            "{}[{}]",
            c_ident(&param.name),
            flat.render(&|v| self.var(v))
        )
    }

    /// Declare one `const float *` parameter per input and a writable output pointer.
    pub(crate) fn emit_params<W: Write>(&self, out: &mut W) -> fmt::Result {
        let count = self.kernel.params.len();
        for (i, param) in self.kernel.params.iter().enumerate() {
            writeln!(
                out,
                "{}{}float *__restrict__ {}{}",
                indent(1),
                if param.is_output { "" } else { "const " },
                c_ident(&param.name),
                if i + 1 < count { "," } else { "" }
            )?;
        }
        Ok(())
    }

    pub(crate) fn emit_stmt<W: Write>(
        &self,
        stmt: &Stmt,
        depth: usize,
        out: &mut W,
    ) -> fmt::Result {
        match stmt {
            Stmt::For { var, extent, body } => {
                let v = self.var(*var);
                writeln!(
                    out,
                    "{}for (int {v} = 0; {v} < {extent}; {v}++) {{",
                    indent(depth)
                )?;
                self.emit_stmt(body, depth + 1, out)?;
                writeln!(out, "{}}}", indent(depth))
            }
            Stmt::Guard { predicates, body } => {
                let conds = predicates
                    .iter()
                    .map(|p| format!("{} < {}", p.lhs.render(&|v| self.var(v)), p.bound))
                    .collect::<Vec<_>>();
                writeln!(out, "{}if ({}) {{", indent(depth), conds.join(" && "))?;
                self.emit_stmt(body, depth + 1, out)?;
                writeln!(out, "{}}}", indent(depth))
            }
            Stmt::Store {
                tensor,
                indices,
                value,
            } => writeln!(
                out,
                "{}{} = {};",
                indent(depth),
                self.access(*tensor, indices),
                value.render(&|t, idx| self.access(t, idx))
            ),
        }
    }

    /// Grid-bound variables in launch order: block axes z to x, then thread axes z to x.
    pub(crate) fn bindings_outermost_first(&self) -> Vec<(Var, ThreadAxis)> {
        let mut bindings = self.kernel.bindings.clone();
        bindings.sort_by_key(|(_, axis)| (!axis.is_block(), std::cmp::Reverse(axis.dim())));
        bindings
    }
}

/// Turn an axis or tensor name into a C identifier.
pub fn c_ident(name: &str) -> String {
    let mut ident = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect::<String>();
    if ident.is_empty() || ident.starts_with(|ch: char| ch.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

/// Parse the `cpu: <secs>s <nanos>ns` line printed by benchmarking binaries.
pub(crate) fn parse_benchmark_output(output: &str) -> Result<Duration, TargetError> {
    let bad = |msg: &str| TargetError::Execution(msg.to_owned());
    let mut outs = output.split_whitespace();
    if outs.next() != Some("cpu:") {
        return Err(bad("expected \"cpu:\" prefix in benchmark output"));
    }

    let s_str = outs.next().ok_or_else(|| bad("invalid output format"))?;
    let ns_str = outs.next().ok_or_else(|| bad("invalid output format"))?;
    if !s_str.ends_with('s') || !ns_str.ends_with("ns") {
        return Err(bad("invalid time unit"));
    }

    let s = s_str.trim_end_matches('s');
    let ns = ns_str.trim_end_matches("ns");
    let parse_err = |e: std::num::ParseIntError| bad(&e.to_string());
    Ok(Duration::new(
        s.parse::<u64>().map_err(parse_err)?,
        ns.parse::<u32>().map_err(parse_err)?,
    ))
}
