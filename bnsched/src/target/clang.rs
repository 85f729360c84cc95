//! Runs kernels as C programs compiled with clang.
//!
//! The compiler is found through the `CLANG` environment variable. When it is unset the target
//! reports itself unavailable rather than guessing.

use crate::codegen::{emit_c, parse_benchmark_output};
use crate::color::do_color_stderr;
use crate::graph::{ArgsError, KernelArgs};
use crate::lower::LoweredKernel;
use crate::target::{check_grid, Program, Target, TargetCaps, TargetError, TargetId};
use crate::utils::ToWriteFmt;

use log::{debug, warn};
use ndarray::{ArrayD, IxDyn};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;
use tempfile::TempDir;

const CLI_FLAGS: [&str; 4] = ["-std=gnu99", "-O3", "-fopenmp", "-o"];

#[derive(Debug, Clone, Default)]
pub struct ClangTarget {
    caps: TargetCaps,
    compiler: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ClangProgram {
    kernel: LoweredKernel,
    binary_path: PathBuf,
    dir: TempDir,
}

pub fn clang_path() -> Option<PathBuf> {
    std::env::var_os("CLANG").map(PathBuf::from)
}

impl ClangTarget {
    /// A target using the compiler named by the `CLANG` environment variable, if any.
    pub fn from_env(caps: TargetCaps) -> Self {
        Self::with_compiler(caps, clang_path())
    }

    pub fn with_compiler(caps: TargetCaps, compiler: Option<PathBuf>) -> Self {
        ClangTarget { caps, compiler }
    }

    fn compiler(&self) -> Result<&Path, TargetError> {
        self.compiler
            .as_deref()
            .ok_or_else(|| TargetError::Unavailable {
                target: TargetId::Clang,
                reason: "the CLANG environment variable is not set".to_owned(),
            })
    }
}

impl Target for ClangTarget {
    type Program = ClangProgram;

    fn target_id(&self) -> TargetId {
        TargetId::Clang
    }

    fn caps(&self) -> &TargetCaps {
        &self.caps
    }

    fn probe(&self) -> Result<(), TargetError> {
        let compiler = self.compiler()?;
        let unavailable = |reason: String| TargetError::Unavailable {
            target: TargetId::Clang,
            reason,
        };
        let output = Command::new(compiler)
            .arg("--version")
            .output()
            .map_err(|e| unavailable(format!("could not run {}: {e}", compiler.display())))?;
        if !output.status.success() {
            return Err(unavailable(format!(
                "{} --version exited with {}",
                compiler.display(),
                output.status
            )));
        }
        debug!(
            "Using {}",
            String::from_utf8_lossy(&output.stdout).lines().next().unwrap_or("clang")
        );
        Ok(())
    }

    fn build(&self, kernel: &LoweredKernel) -> Result<ClangProgram, TargetError> {
        check_grid(kernel, &self.caps)?;
        let compiler = self.compiler()?;
        let dir = tempfile::tempdir()?;
        let source_path = dir.path().join("main.c");
        let binary_path = dir.path().join("a.out");

        let source_file = std::fs::File::create(&source_path)?;
        emit_c(kernel, false, &mut ToWriteFmt(source_file))
            .map_err(|_| TargetError::Build("could not write the C source".to_owned()))?;

        let mut clang_cmd = Command::new(compiler);
        if do_color_stderr() {
            clang_cmd.arg("-fcolor-diagnostics");
        }
        let clang_proc = clang_cmd
            .args(CLI_FLAGS)
            .arg(&binary_path)
            .arg(&source_path)
            .arg("-lm")
            .output()?;

        if !clang_proc.status.success() {
            return Err(TargetError::Build(format!(
                "clang exited with {}\n{}",
                clang_proc.status,
                String::from_utf8_lossy(&clang_proc.stderr)
            )));
        } else if !clang_proc.stderr.is_empty() {
            // Still show warnings.
            warn!("{}", String::from_utf8_lossy(&clang_proc.stderr));
        }
        debug!("Compiled {} to {}", kernel.name, binary_path.display());

        Ok(ClangProgram {
            kernel: kernel.clone(),
            binary_path,
            dir,
        })
    }
}

impl ClangProgram {
    /// Write each input to a raw `f32` file in the build directory, in parameter order.
    fn write_inputs(&self, args: &KernelArgs) -> Result<Vec<PathBuf>, TargetError> {
        let mut paths = vec![];
        for (i, param) in self.kernel.inputs().enumerate() {
            let Some(value) = args.get(param.tensor) else {
                return Err(ArgsError::Missing(param.name.clone()).into());
            };
            if value.shape() != param.shape.as_slice() {
                return Err(ArgsError::ShapeMismatch {
                    name: param.name.clone(),
                    expected: param.shape.clone(),
                    actual: value.shape().to_vec(),
                }
                .into());
            }
            let path = self.dir.path().join(format!("input{i}.bin"));
            let mut file = io::BufWriter::new(std::fs::File::create(&path)?);
            // Logical (row-major) order regardless of the array's memory layout.
            for v in value.iter() {
                file.write_all(&v.to_ne_bytes())?;
            }
            file.flush()?;
            paths.push(path);
        }
        Ok(paths)
    }

    fn execute(&self, mode_args: &[String], inputs: &[PathBuf]) -> Result<Output, TargetError> {
        let output = Command::new(&self.binary_path)
            .args(mode_args)
            .args(inputs)
            .output()?;
        if !output.status.success() {
            return Err(TargetError::Execution(format!(
                "{} exited with {}\n{}",
                self.kernel.name,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output)
    }
}

impl Program for ClangProgram {
    fn kernel(&self) -> &LoweredKernel {
        &self.kernel
    }

    fn run(&self, args: &KernelArgs) -> Result<ArrayD<f32>, TargetError> {
        let inputs = self.write_inputs(args)?;
        let output = self.execute(&["run".to_owned()], &inputs)?;
        let out_shape = &self.kernel.output().shape;
        let expected_len = out_shape.iter().product::<usize>() * std::mem::size_of::<f32>();
        if output.stdout.len() != expected_len {
            return Err(TargetError::Execution(format!(
                "expected {expected_len} bytes of output but got {}",
                output.stdout.len()
            )));
        }
        let values = output
            .stdout
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect::<Vec<_>>();
        ArrayD::from_shape_vec(IxDyn(out_shape), values)
            .map_err(|e| TargetError::Execution(e.to_string()))
    }

    /// Executes the compiled kernel `iters` times and returns the total runtime of the loop.
    fn measure_time(&self, args: &KernelArgs, iters: u32) -> Result<Duration, TargetError> {
        let inputs = self.write_inputs(args)?;
        let output = self.execute(&["bench".to_owned(), iters.to_string()], &inputs)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().unwrap_or_default();
        parse_benchmark_output(first_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchnorm::{batch_norm, BatchNormInputs};
    use crate::common::ProblemSize;
    use crate::lower::lower;
    use crate::scheduling::ScheduleVariant;

    fn lowered(variant: ScheduleVariant) -> LoweredKernel {
        let kernel = batch_norm(ProblemSize::new(8, 4).unwrap());
        let plan = variant
            .schedule(&kernel.graph, &TargetCaps::default())
            .unwrap();
        lower(&plan)
    }

    #[test]
    fn test_without_compiler_is_unavailable() {
        let target = ClangTarget::with_compiler(TargetCaps::default(), None);
        assert!(target.probe().unwrap_err().is_unavailable());
        assert!(target
            .build(&lowered(ScheduleVariant::AxisBinding))
            .unwrap_err()
            .is_unavailable());
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let target = ClangTarget::with_compiler(
            TargetCaps::default(),
            Some(PathBuf::from("/nonexistent/bin/clang")),
        );
        assert!(target.probe().unwrap_err().is_unavailable());
    }

    #[test]
    #[ignore = "needs a C compiler named by CLANG"]
    fn test_compiled_output_matches_graph() {
        let target = ClangTarget::from_env(TargetCaps::default());
        target.probe().unwrap();
        for variant in [ScheduleVariant::AxisBinding, ScheduleVariant::FusedSplit] {
            let kernel = batch_norm(ProblemSize::new(8, 4).unwrap());
            let plan = variant
                .schedule(&kernel.graph, target.caps())
                .unwrap();
            let program = target.build(&lower(&plan)).unwrap();
            let args = BatchNormInputs::random(kernel.size, 3).to_args(&kernel);
            let expected = kernel.graph.evaluate(&args).unwrap();
            let got = program.run(&args).unwrap();
            assert_eq!(got.shape(), expected.shape());
            for (a, b) in got.iter().zip(expected.iter()) {
                assert!((a - b).abs() <= 1e-4 * b.abs().max(1.0), "{a} != {b}");
            }
            program.measure_time(&args, 2).unwrap();
        }
    }
}
