use super::{c_ident, BodyEmitter};
use crate::lower::LoweredKernel;
use crate::utils::indent;

use std::fmt::{self, Write};

/// Emit `kernel` as a CUDA `__global__` function.
pub fn emit_cuda<W: Write>(kernel: &LoweredKernel, out: &mut W) -> fmt::Result {
    let emitter = BodyEmitter::new(kernel);
    let name = c_ident(&kernel.name);
    let [bx, by, bz] = kernel.grid.blocks;
    let [tx, ty, tz] = kernel.grid.threads;
    let args = kernel
        .params
        .iter()
        .map(|p| c_ident(&p.name))
        .collect::<Vec<_>>();
    writeln!(
        out,
        "// Launch as {name}<<<dim3({bx}, {by}, {bz}), dim3({tx}, {ty}, {tz})>>>({});",
        args.join(", ")
    )?;
    writeln!(
        out,
        "extern \"C\" __global__ void __launch_bounds__({})\n{name}(",
        kernel.grid.threads_per_block()
    )?;
    emitter.emit_params(out)?;
    writeln!(out, ") {{")?;
    for (var, axis) in emitter.bindings_outermost_first() {
        writeln!(out, "{}const int {} = {};", indent(1), emitter.var(var), axis)?;
    }
    emitter.emit_stmt(&kernel.body, 1, out)?;
    writeln!(out, "}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchnorm::batch_norm;
    use crate::common::ProblemSize;
    use crate::lower::lower;
    use crate::scheduling::ScheduleVariant;
    use crate::target::TargetCaps;

    #[test]
    fn test_fused_split_reads_thread_indices() {
        let kernel = batch_norm(ProblemSize::new(32, 28).unwrap());
        let plan = ScheduleVariant::FusedSplit
            .schedule(&kernel.graph, &TargetCaps::default())
            .unwrap();
        let mut source = String::new();
        emit_cuda(&lower(&plan), &mut source).unwrap();
        assert!(source.contains("<<<dim3(25, 1, 1), dim3(1024, 1, 1)>>>"));
        assert!(source.contains("__launch_bounds__(1024)"));
        assert!(source.contains("const int c_h_w_fused_outer = blockIdx.x;"));
        assert!(source.contains("const int c_h_w_fused_inner = threadIdx.x;"));
        assert!(source.contains("sqrtf("));
        assert!(!source.contains("for ("));
    }
}
