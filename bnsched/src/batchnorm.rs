//! The batch normalization kernel builder.

use crate::common::{ProblemSize, SizeError, EPSILON};
use crate::expr::Expr;
use crate::graph::{Graph, GraphBuilder, KernelArgs, TensorId};

use ndarray::{Array1, Array3};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

/// An unscheduled batch normalization graph and handles to its tensors.
#[derive(Debug, Clone)]
pub struct BatchNormKernel {
    pub size: ProblemSize,
    pub graph: Arc<Graph>,
    pub data: TensorId,
    pub mean: TensorId,
    pub variance: TensorId,
    pub gamma: TensorId,
    pub beta: TensorId,
    pub output: TensorId,
}

/// Concrete values for a [BatchNormKernel]'s inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormInputs {
    pub size: ProblemSize,
    pub data: Array3<f32>,
    pub mean: Array1<f32>,
    pub variance: Array1<f32>,
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
}

/// Build the batch normalization graph for `size`.
///
/// `out[c, h, w] = (data[c, h, w] - mean[c]) / sqrt(variance[c] + EPSILON) * gamma[c] + beta[c]`
pub fn batch_norm(size: ProblemSize) -> BatchNormKernel {
    let shape = size.shape();
    let channel_shape = size.channel_shape();
    let chw = ["c", "h", "w"];

    let mut b = GraphBuilder::new();
    let data = b.placeholder("data", shape.clone());
    let mean = b.placeholder("mean", channel_shape.clone());
    let variance = b.placeholder("variance", channel_shape.clone());
    let gamma = b.placeholder("gamma", channel_shape.clone());
    let beta = b.placeholder("beta", channel_shape.clone());

    let centered = b.compute("centered", shape.clone(), &chw, |ax| {
        Expr::load(data, ax.to_vec()) - Expr::load(mean, vec![ax[0].clone()])
    });
    let std = b.compute("std", channel_shape, &["c"], |ax| {
        (Expr::load(variance, ax.to_vec()) + Expr::Const(EPSILON)).sqrt()
    });
    let normalized = b.compute("normalized", shape.clone(), &chw, |ax| {
        Expr::load(centered, ax.to_vec()) / Expr::load(std, vec![ax[0].clone()])
    });
    let scaled = b.compute("scaled", shape.clone(), &chw, |ax| {
        Expr::load(normalized, ax.to_vec()) * Expr::load(gamma, vec![ax[0].clone()])
    });
    let output = b.compute("batch_norm", shape, &chw, |ax| {
        Expr::load(scaled, ax.to_vec()) + Expr::load(beta, vec![ax[0].clone()])
    });

    BatchNormKernel {
        size,
        graph: Arc::new(b.build(output)),
        data,
        mean,
        variance,
        gamma,
        beta,
        output,
    }
}

/// Like [batch_norm], but from raw dimensions.
pub fn batch_norm_dims(channels: i64, spatial: i64) -> Result<BatchNormKernel, SizeError> {
    Ok(batch_norm(ProblemSize::new(channels, spatial)?))
}

impl BatchNormInputs {
    /// Deterministically generate inputs from `seed`. Variances are strictly positive.
    pub fn random(size: ProblemSize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let c = size.channels.get() as usize;
        let s = size.spatial.get() as usize;
        let normal_ish = Uniform::new_inclusive(-2.0f32, 2.0);
        let positive = Uniform::new(0.25f32, 4.0);
        let mut sample = |dist: &Uniform<f32>, n: usize| {
            (0..n).map(|_| dist.sample(&mut rng)).collect::<Vec<_>>()
        };
        let data = Array3::from_shape_vec((c, s, s), sample(&normal_ish, c * s * s))
            .expect("shape matches the sample count");
        BatchNormInputs {
            size,
            data,
            mean: Array1::from(sample(&normal_ish, c)),
            variance: Array1::from(sample(&positive, c)),
            gamma: Array1::from(sample(&positive, c)),
            beta: Array1::from(sample(&normal_ish, c)),
        }
    }

    /// Bind these values to `kernel`'s placeholders.
    pub fn to_args(&self, kernel: &BatchNormKernel) -> KernelArgs {
        debug_assert_eq!(self.size, kernel.size);
        let mut args = KernelArgs::new();
        args.insert(kernel.data, self.data.clone().into_dyn());
        args.insert(kernel.mean, self.mean.clone().into_dyn());
        args.insert(kernel.variance, self.variance.clone().into_dyn());
        args.insert(kernel.gamma, self.gamma.clone().into_dyn());
        args.insert(kernel.beta, self.beta.clone().into_dyn());
        args
    }
}
