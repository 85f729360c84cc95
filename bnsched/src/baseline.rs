//! Reference batch normalization, computed with whole-array `ndarray` operations.

use crate::batchnorm::BatchNormInputs;
use crate::common::EPSILON;

use log::debug;
use ndarray::{Array1, ArrayD, ArrayView3, Axis};
use std::time::{Duration, Instant};

/// An opaque batch normalization implementation timed alongside the scheduled kernels.
pub trait Baseline: Sync {
    fn name(&self) -> &str;

    fn run(&self, inputs: &BatchNormInputs) -> ArrayD<f32>;

    /// Run `iters` times back to back and return the total time taken.
    fn measure_time(&self, inputs: &BatchNormInputs, iters: u32) -> Duration {
        // Warm-up.
        std::hint::black_box(self.run(inputs));
        let start = Instant::now();
        for _ in 0..iters {
            std::hint::black_box(self.run(inputs));
        }
        let elapsed = start.elapsed();
        debug!("{} ran {iters} times in {:?}", self.name(), elapsed);
        elapsed
    }
}

/// Inference-mode batch normalization with per-channel statistics broadcast over the spatial
/// axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NdarrayBatchNorm {
    pub epsilon: f32,
}

impl Default for NdarrayBatchNorm {
    fn default() -> Self {
        NdarrayBatchNorm { epsilon: EPSILON }
    }
}

impl NdarrayBatchNorm {
    fn broadcastable(per_channel: &Array1<f32>) -> ArrayView3<'_, f32> {
        per_channel.view().insert_axis(Axis(1)).insert_axis(Axis(2))
    }
}

impl Baseline for NdarrayBatchNorm {
    fn name(&self) -> &str {
        "ndarray"
    }

    fn run(&self, inputs: &BatchNormInputs) -> ArrayD<f32> {
        let std = (&inputs.variance + self.epsilon).mapv(f32::sqrt);
        let centered = &inputs.data - &Self::broadcastable(&inputs.mean);
        let normalized = centered / &Self::broadcastable(&std);
        let scaled = normalized * &Self::broadcastable(&inputs.gamma);
        (scaled + &Self::broadcastable(&inputs.beta)).into_dyn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchnorm::batch_norm;
    use crate::common::tests::arb_problem_size;
    use crate::common::ProblemSize;
    use proptest::prelude::*;

    #[test]
    fn test_identity_statistics_pass_data_through() {
        let size = ProblemSize::new(3, 2).unwrap();
        let mut inputs = BatchNormInputs::random(size, 11);
        inputs.mean.fill(0.0);
        inputs.variance.fill(1.0 - EPSILON);
        inputs.gamma.fill(1.0);
        inputs.beta.fill(0.0);
        let out = NdarrayBatchNorm::default().run(&inputs);
        for (a, b) in out.iter().zip(inputs.data.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_measure_time_is_positive() {
        let inputs = BatchNormInputs::random(ProblemSize::new(4, 4).unwrap(), 0);
        assert!(NdarrayBatchNorm::default().measure_time(&inputs, 3) > Duration::ZERO);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_matches_graph_evaluation_exactly(
            size in arb_problem_size(16, 9),
            seed in any::<u64>(),
        ) {
            let kernel = batch_norm(size);
            let inputs = BatchNormInputs::random(size, seed);
            let expected = kernel.graph.evaluate(&inputs.to_args(&kernel)).unwrap();
            prop_assert_eq!(NdarrayBatchNorm::default().run(&inputs), expected);
        }
    }
}
