//! An in-process GPU grid simulator.
//!
//! Blocks run in parallel on the rayon pool; the threads of a block run one after another.
//! Every load and store is bounds-checked, so a kernel that would read or write outside a
//! buffer on a real device fails with [TargetError::OutOfBounds] instead.

use crate::common::row_major_strides;
use crate::expr::MAX_RANK;
use crate::graph::{ArgsError, KernelArgs, TensorId};
use crate::lower::{LoweredKernel, Stmt};
use crate::target::{check_grid, Program, Target, TargetCaps, TargetError, TargetId};

use log::{debug, trace};
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct SimGpuTarget {
    caps: TargetCaps,
}

#[derive(Debug, Clone)]
pub struct SimGpuProgram {
    kernel: LoweredKernel,
    out_shape: Vec<usize>,
    out_strides: Vec<usize>,
}

/// Per-launch bookkeeping returned by [SimGpuProgram::run_traced].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTrace {
    /// Number of stores to each output element, in row-major order.
    pub writes: Vec<u32>,
    /// Number of thread iterations skipped by a boundary guard.
    pub guarded: usize,
}

struct BlockResult {
    stores: Vec<(usize, f32)>,
    guarded: usize,
}

impl SimGpuTarget {
    pub fn new(caps: TargetCaps) -> Self {
        SimGpuTarget { caps }
    }
}

impl Target for SimGpuTarget {
    type Program = SimGpuProgram;

    fn target_id(&self) -> TargetId {
        TargetId::Sim
    }

    fn caps(&self) -> &TargetCaps {
        &self.caps
    }

    fn probe(&self) -> Result<(), TargetError> {
        Ok(())
    }

    fn build(&self, kernel: &LoweredKernel) -> Result<SimGpuProgram, TargetError> {
        check_grid(kernel, &self.caps)?;
        let out_shape = kernel.output().shape.clone();
        let out_strides = row_major_strides(&out_shape);
        debug!("Built simulated kernel {} with {}", kernel.name, kernel.grid);
        Ok(SimGpuProgram {
            kernel: kernel.clone(),
            out_shape,
            out_strides,
        })
    }
}

impl SimGpuProgram {
    /// Launch once, also returning how often each output element was written.
    pub fn run_traced(&self, args: &KernelArgs) -> Result<(ArrayD<f32>, LaunchTrace), TargetError> {
        let blocks = self.launch(args)?;
        let len = self.out_shape.iter().product::<usize>();
        let mut out = vec![0f32; len];
        let mut writes = vec![0u32; len];
        let mut guarded = 0;
        for block in blocks {
            guarded += block.guarded;
            for (flat, value) in block.stores {
                out[flat] = value;
                writes[flat] += 1;
            }
        }
        let out = ArrayD::from_shape_vec(IxDyn(&self.out_shape), out)
            .map_err(|e| TargetError::Execution(e.to_string()))?;
        Ok((out, LaunchTrace { writes, guarded }))
    }

    fn check_args(&self, args: &KernelArgs) -> Result<(), ArgsError> {
        for param in self.kernel.inputs() {
            let Some(value) = args.get(param.tensor) else {
                return Err(ArgsError::Missing(param.name.clone()));
            };
            if value.shape() != param.shape.as_slice() {
                return Err(ArgsError::ShapeMismatch {
                    name: param.name.clone(),
                    expected: param.shape.clone(),
                    actual: value.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    fn launch(&self, args: &KernelArgs) -> Result<Vec<BlockResult>, TargetError> {
        self.check_args(args)?;
        let grid = self.kernel.grid;
        let threads = grid.threads_per_block();
        trace!("Launching {} with {}", self.kernel.name, grid);
        (0..grid.block_count())
            .into_par_iter()
            .map(|block| {
                let block_idx = unflatten(block, grid.blocks);
                let mut result = BlockResult {
                    stores: vec![],
                    guarded: 0,
                };
                let mut env = vec![0i64; self.kernel.var_count as usize];
                for thread in 0..threads {
                    let thread_idx = unflatten(thread, grid.threads);
                    for (var, axis) in &self.kernel.bindings {
                        let idx = if axis.is_block() {
                            block_idx
                        } else {
                            thread_idx
                        };
                        env[var.index()] = idx[axis.dim()];
                    }
                    self.exec(&self.kernel.body, &mut env, args, &mut result)?;
                }
                Ok(result)
            })
            .collect()
    }

    fn exec(
        &self,
        stmt: &Stmt,
        env: &mut [i64],
        args: &KernelArgs,
        result: &mut BlockResult,
    ) -> Result<(), TargetError> {
        match stmt {
            Stmt::For { var, extent, body } => {
                for i in 0..*extent {
                    env[var.index()] = i64::from(i);
                    self.exec(body, env, args, result)?;
                }
                Ok(())
            }
            Stmt::Guard { predicates, body } => {
                if predicates.iter().all(|p| p.holds(env)) {
                    self.exec(body, env, args, result)
                } else {
                    result.guarded += 1;
                    Ok(())
                }
            }
            Stmt::Store {
                tensor,
                indices,
                value,
            } => {
                let coords = indices.iter().map(|i| i.eval(env)).collect::<Vec<_>>();
                let flat = flat_index(&coords, &self.out_shape, &self.out_strides)
                    .ok_or_else(|| self.out_of_bounds(*tensor, &coords))?;
                let v = value.try_eval(env, &mut |t, c| self.load(args, t, c))?;
                result.stores.push((flat, v));
                Ok(())
            }
        }
    }

    fn load(
        &self,
        args: &KernelArgs,
        tensor: TensorId,
        coords: &[i64],
    ) -> Result<f32, TargetError> {
        let mut idx = [0usize; MAX_RANK];
        for (dst, &c) in idx.iter_mut().zip(coords) {
            *dst = usize::try_from(c).map_err(|_| self.out_of_bounds(tensor, coords))?;
        }
        args.get(tensor)
            .and_then(|a| a.get(&idx[..coords.len()]))
            .copied()
            .ok_or_else(|| self.out_of_bounds(tensor, coords))
    }

    fn out_of_bounds(&self, tensor: TensorId, coords: &[i64]) -> TargetError {
        TargetError::OutOfBounds {
            tensor: self
                .kernel
                .param(tensor)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| format!("{tensor:?}")),
            coords: coords.to_vec(),
        }
    }
}

impl Program for SimGpuProgram {
    fn kernel(&self) -> &LoweredKernel {
        &self.kernel
    }

    fn run(&self, args: &KernelArgs) -> Result<ArrayD<f32>, TargetError> {
        self.run_traced(args).map(|(out, _)| out)
    }

    fn measure_time(&self, args: &KernelArgs, iters: u32) -> Result<Duration, TargetError> {
        // Warm-up.
        self.launch(args)?;
        let start = Instant::now();
        for _ in 0..iters {
            self.launch(args)?;
        }
        Ok(start.elapsed())
    }
}

/// Split a linear block or thread number into x, y, z indices.
fn unflatten(linear: u64, dims: [u32; 3]) -> [i64; 3] {
    let x = linear % u64::from(dims[0]);
    let rest = linear / u64::from(dims[0]);
    let y = rest % u64::from(dims[1]);
    let z = rest / u64::from(dims[1]);
    [x as i64, y as i64, z as i64]
}

fn flat_index(coords: &[i64], shape: &[usize], strides: &[usize]) -> Option<usize> {
    if coords.len() != shape.len() {
        return None;
    }
    let mut flat = 0;
    for ((&c, &extent), &stride) in coords.iter().zip(shape).zip(strides) {
        let c = usize::try_from(c).ok().filter(|&c| c < extent)?;
        flat += c * stride;
    }
    Some(flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchnorm::{batch_norm, BatchNormInputs};
    use crate::common::ProblemSize;
    use crate::lower::lower;
    use crate::scheduling::ScheduleVariant;

    fn build_program(variant: ScheduleVariant, c: i64, s: i64) -> (SimGpuProgram, KernelArgs) {
        let kernel = batch_norm(ProblemSize::new(c, s).unwrap());
        let target = SimGpuTarget::default();
        let plan = variant.schedule(&kernel.graph, target.caps()).unwrap();
        let args = BatchNormInputs::random(kernel.size, 0).to_args(&kernel);
        (target.build(&lower(&plan)).unwrap(), args)
    }

    #[test]
    fn test_unflatten() {
        assert_eq!(unflatten(0, [4, 3, 2]), [0, 0, 0]);
        assert_eq!(unflatten(5, [4, 3, 2]), [1, 1, 0]);
        assert_eq!(unflatten(23, [4, 3, 2]), [3, 2, 1]);
    }

    #[test]
    fn test_flat_index_rejects_out_of_bounds() {
        let shape = [2, 3];
        let strides = row_major_strides(&shape);
        assert_eq!(flat_index(&[1, 2], &shape, &strides), Some(5));
        assert_eq!(flat_index(&[2, 0], &shape, &strides), None);
        assert_eq!(flat_index(&[0, -1], &shape, &strides), None);
    }

    #[test]
    fn test_missing_input_is_reported() {
        let (program, _) = build_program(ScheduleVariant::AxisBinding, 2, 2);
        assert!(matches!(
            program.run(&KernelArgs::new()),
            Err(TargetError::Args(ArgsError::Missing(_)))
        ));
    }

    #[test]
    fn test_guarded_threads_are_counted() {
        // 2 * 3 * 3 = 18 points covered by one 1024-wide block.
        let (program, args) = build_program(ScheduleVariant::FusedSplit, 2, 3);
        let (_, trace) = program.run_traced(&args).unwrap();
        assert_eq!(trace.guarded, 0);
        assert!(trace.writes.iter().all(|&w| w == 1));

        let (program, args) = build_program(ScheduleVariant::FusedSplit, 32, 28);
        let (_, trace) = program.run_traced(&args).unwrap();
        assert_eq!(trace.guarded, 25 * 1024 - 25088);
    }

    #[test]
    fn test_build_rejects_oversized_blocks() {
        let (program, _) = build_program(ScheduleVariant::FusedSplit, 32, 28);
        let small = SimGpuTarget::new(TargetCaps {
            max_threads_per_block: 256,
        });
        assert!(matches!(
            small.build(program.kernel()),
            Err(TargetError::TooManyThreads {
                threads: 1024,
                limit: 256
            })
        ));
    }
}
