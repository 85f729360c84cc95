use super::{c_ident, BodyEmitter};
use crate::lower::LoweredKernel;
use crate::utils::{indent, LinePrefixWrite};

use std::fmt::{self, Write};

/// Emit a standalone C program for `kernel`.
///
/// The grid is emulated with loops over the bound axes; block loops are collapsed into one
/// OpenMP parallel loop. The program's `main` takes a mode followed by one raw `f32` file per
/// input. `run` writes the output to stdout as raw `f32`s; `bench <iters>` runs the kernel that
/// many times and prints the elapsed time.
pub fn emit_c<W: Write>(kernel: &LoweredKernel, include_lowered: bool, out: &mut W) -> fmt::Result {
    out.write_str(include_str!("partials/std.c"))?;
    out.write_char('\n')?;
    out.write_str(include_str!("partials/benchmarking.c"))?;
    out.write_char('\n')?;
    out.write_str(include_str!("partials/io.c"))?;
    out.write_char('\n')?;

    if include_lowered {
        write!(LinePrefixWrite::new(&mut *out, "// "), "{kernel}")?;
        writeln!(out)?;
    }

    emit_kernel(kernel, out)?;
    writeln!(out)?;
    emit_main(kernel, out)
}

fn emit_kernel<W: Write>(kernel: &LoweredKernel, out: &mut W) -> fmt::Result {
    let emitter = BodyEmitter::new(kernel);
    writeln!(out, "__attribute__((noinline))\nvoid {}(", c_ident(&kernel.name))?;
    emitter.emit_params(out)?;
    writeln!(out, ") {{")?;

    let bindings = emitter.bindings_outermost_first();
    let block_loops = bindings.iter().filter(|(_, a)| a.is_block()).count();
    if block_loops > 0 {
        // Preprocessor directives are not indented.
        writeln!(
            out,
            "#pragma omp parallel for collapse({block_loops}) schedule(static)"
        )?;
    }
    let mut depth = 1;
    for (var, axis) in &bindings {
        let dims = if axis.is_block() {
            kernel.grid.blocks
        } else {
            kernel.grid.threads
        };
        let v = emitter.var(*var);
        writeln!(
            out,
            "{}for (int {v} = 0; {v} < {}; {v}++) {{  // {axis}",
            indent(depth),
            dims[axis.dim()]
        )?;
        depth += 1;
    }
    emitter.emit_stmt(&kernel.body, depth, out)?;
    for _ in &bindings {
        depth -= 1;
        writeln!(out, "{}}}", indent(depth))?;
    }
    writeln!(out, "}}")
}

fn emit_main<W: Write>(kernel: &LoweredKernel, out: &mut W) -> fmt::Result {
    let input_count = kernel.inputs().count();
    let buffers = kernel
        .params
        .iter()
        .map(|p| (c_ident(&p.name), p.shape.iter().product::<usize>()))
        .collect::<Vec<_>>();
    let call = format!(
        "{}({});",
        c_ident(&kernel.name),
        buffers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let d1 = indent(1);
    let d2 = indent(2);
    writeln!(out, "int main(int argc, char *argv[]) {{")?;
    writeln!(
        out,
        "{d1}const int bench = argc > 1 && strcmp(argv[1], \"bench\") == 0;"
    )?;
    writeln!(out, "{d1}const int first_input = bench ? 3 : 2;")?;
    writeln!(out, "{d1}if (argc != first_input + {input_count}) {{")?;
    writeln!(
        out,
        "{d2}fprintf(stderr, \"usage: %s run|bench [iters] <{input_count} input files>\\n\", \
         argv[0]);"
    )?;
    writeln!(out, "{d2}return 2;")?;
    writeln!(out, "{d1}}}\n")?;

    for (name, len) in &buffers {
        writeln!(out, "{d1}float *{name} = calloc({len}, sizeof(float));")?;
    }
    for (i, (name, len)) in buffers.iter().take(input_count).enumerate() {
        writeln!(
            out,
            "{d1}if (read_tensor(argv[first_input + {i}], {name}, {len})) return 1;"
        )?;
    }
    writeln!(out)?;

    let (out_name, out_len) = &buffers[buffers.len() - 1];
    writeln!(out, "{d1}if (bench) {{")?;
    writeln!(out, "{d2}const long long bench_samples = atoll(argv[2]);")?;
    writeln!(out, "{d2}// Warm-up.")?;
    writeln!(out, "{d2}{call}")?;
    writeln!(out, "{d2}struct timespec start, end;")?;
    writeln!(out, "{d2}clock_gettime(CLOCK_MONOTONIC, &start);")?;
    writeln!(out, "#pragma clang loop unroll(disable)")?;
    writeln!(
        out,
        "{d2}for (long long bench_itr = 0; bench_itr < bench_samples; ++bench_itr) {{"
    )?;
    writeln!(out, "{}{call}", indent(3))?;
    writeln!(out, "{d2}}}")?;
    writeln!(out, "{d2}clock_gettime(CLOCK_MONOTONIC, &end);")?;
    writeln!(out, "{d2}struct timespec delta = ts_diff(start, end);")?;
    writeln!(
        out,
        "{d2}printf(\"cpu: %llds %lldns\\n\", (long long)delta.tv_sec, (long long)delta.tv_nsec);"
    )?;
    writeln!(out, "{d1}}} else {{")?;
    writeln!(out, "{d2}{call}")?;
    writeln!(out, "{d2}if (write_tensor({out_name}, {out_len})) return 1;")?;
    writeln!(out, "{d1}}}\n")?;

    for (name, _) in &buffers {
        writeln!(out, "{d1}free({name});")?;
    }
    writeln!(out, "{d1}return 0;")?;
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

    fn emitted(variant: ScheduleVariant, include_lowered: bool) -> String {
        let kernel = batch_norm(ProblemSize::new(32, 28).unwrap());
        let plan = variant
            .schedule(&kernel.graph, &TargetCaps::default())
            .unwrap();
        let mut source = String::new();
        emit_c(&lower(&plan), include_lowered, &mut source).unwrap();
        source
    }

    #[test]
    fn test_axis_binding_emits_collapsed_grid_loops() {
        let source = emitted(ScheduleVariant::AxisBinding, false);
        assert!(source.contains("void batch_norm_axis_binding("));
        assert!(source.contains("#pragma omp parallel for collapse(1) schedule(static)"));
        assert!(source.contains("for (int c = 0; c < 32; c++) {  // blockIdx.x"));
        assert!(source.contains("for (int h = 0; h < 28; h++) {  // threadIdx.x"));
        assert!(source.contains("for (int w = 0; w < 28; w++) {"));
        let kernel_start = source.find("void batch_norm_axis_binding(").unwrap();
        let kernel_end = source.find("int main(").unwrap();
        assert!(kernel_start < kernel_end);
        assert!(!source[kernel_start..kernel_end].contains("if ("));
    }

    #[test]
    fn test_fused_split_emits_guard() {
        let source = emitted(ScheduleVariant::FusedSplit, false);
        assert!(source
            .contains("if ((c_h_w_fused_outer * 1024 + c_h_w_fused_inner) < 25088) {"));
        assert!(source.contains("const float *__restrict__ data,"));
        assert!(source.contains("float *__restrict__ batch_norm\n"));
    }

    #[test]
    fn test_include_lowered_is_commented() {
        let source = emitted(ScheduleVariant::FusedSplit, true);
        assert!(source
            .contains("// kernel batch_norm_fused_split grid(25, 1, 1) block(1024, 1, 1)"));
    }

    #[test]
    fn test_main_reads_every_input() {
        let source = emitted(ScheduleVariant::AxisBinding, false);
        assert!(source.contains("if (argc != first_input + 5) {"));
        assert!(source.contains("read_tensor(argv[first_input + 4], beta, 32)"));
        assert!(source.contains("write_tensor(batch_norm, 25088)"));
    }
}
