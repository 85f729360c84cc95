mod clang;
mod sim;

pub use clang::{ClangProgram, ClangTarget};
pub use sim::{LaunchTrace, SimGpuProgram, SimGpuTarget};

use crate::graph::{ArgsError, KernelArgs};
use crate::lower::LoweredKernel;

use ndarray::ArrayD;
use std::fmt::Debug;
use std::io;
use std::time::Duration;

/// Block width available on most current GPUs.
pub const DEFAULT_MAX_THREADS_PER_BLOCK: u32 = 1024;

/// What an execution target can run. Passed explicitly to schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetCaps {
    pub max_threads_per_block: u32,
}

/// A backend which turns [LoweredKernel]s into runnable [Program]s.
pub trait Target: Debug {
    type Program: Program;

    fn target_id(&self) -> TargetId;

    fn caps(&self) -> &TargetCaps;

    /// Check that the target can build and run programs at all.
    fn probe(&self) -> Result<(), TargetError>;

    fn build(&self, kernel: &LoweredKernel) -> Result<Self::Program, TargetError>;
}

pub trait Program {
    fn kernel(&self) -> &LoweredKernel;

    /// Launch once and return the output tensor.
    fn run(&self, args: &KernelArgs) -> Result<ArrayD<f32>, TargetError>;

    /// Launch `iters` times back to back and return the total time taken.
    fn measure_time(&self, args: &KernelArgs, iters: u32) -> Result<Duration, TargetError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, strum::Display)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TargetId {
    /// The in-process grid simulator.
    #[default]
    #[strum(serialize = "sim")]
    Sim,
    /// C compiled with clang, the grid emulated by OpenMP loops.
    #[strum(serialize = "clang")]
    Clang,
}

#[derive(thiserror::Error, Debug)]
pub enum TargetError {
    #[error("target {target} is unavailable: {reason}")]
    Unavailable { target: TargetId, reason: String },
    #[error("{threads} threads per block exceeds the target limit of {limit}")]
    TooManyThreads { threads: u64, limit: u32 },
    #[error("access to {tensor}{coords:?} is out of bounds")]
    OutOfBounds { tensor: String, coords: Vec<i64> },
    #[error(transparent)]
    Args(#[from] ArgsError),
    #[error("build failed: {0}")]
    Build(String),
    #[error("kernel execution failed: {0}")]
    Execution(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Default for TargetCaps {
    fn default() -> Self {
        TargetCaps {
            max_threads_per_block: DEFAULT_MAX_THREADS_PER_BLOCK,
        }
    }
}

impl TargetError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TargetError::Unavailable { .. })
    }
}

/// Reject kernels whose blocks are larger than `caps` allows.
pub(crate) fn check_grid(kernel: &LoweredKernel, caps: &TargetCaps) -> Result<(), TargetError> {
    let threads = kernel.grid.threads_per_block();
    if threads > u64::from(caps.max_threads_per_block) {
        return Err(TargetError::TooManyThreads {
            threads,
            limit: caps.max_threads_per_block,
        });
    }
    Ok(())
}
