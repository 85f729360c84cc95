//! Checks that programs built from scheduled kernels compute batch normalization.

use crate::baseline::{Baseline, NdarrayBatchNorm};
use crate::batchnorm::{BatchNormInputs, BatchNormKernel};
use crate::target::{Program, TargetError};

use ndarray::{ArrayBase, Data, Dimension};
use num_traits::Float;

/// Elements `a` and `e` are close when `|a - e| <= abs + rel * |e|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance<A> {
    pub abs: A,
    pub rel: A,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub max_abs_diff: f32,
}

impl Default for Tolerance<f32> {
    fn default() -> Self {
        Tolerance {
            abs: 1e-5,
            rel: 1e-5,
        }
    }
}

/// Returns `true` if the arrays have the same shape and every pair of elements is close.
/// NaNs are never close to anything.
pub fn all_close<A, S1, S2, D>(
    actual: &ArrayBase<S1, D>,
    expected: &ArrayBase<S2, D>,
    tol: Tolerance<A>,
) -> bool
where
    A: Float,
    S1: Data<Elem = A>,
    S2: Data<Elem = A>,
    D: Dimension,
{
    actual.shape() == expected.shape()
        && actual
            .iter()
            .zip(expected.iter())
            .all(|(&a, &e)| (a - e).abs() <= tol.abs + tol.rel * e.abs())
}

/// The largest elementwise absolute difference, or `None` if the shapes differ. NaN if any
/// pair contains a NaN.
pub fn max_abs_diff<A, S1, S2, D>(a: &ArrayBase<S1, D>, b: &ArrayBase<S2, D>) -> Option<A>
where
    A: Float,
    S1: Data<Elem = A>,
    S2: Data<Elem = A>,
    D: Dimension,
{
    if a.shape() != b.shape() {
        return None;
    }
    Some(a.iter().zip(b.iter()).fold(A::zero(), |acc, (&x, &y)| {
        let d = (x - y).abs();
        if d.is_nan() || acc.is_nan() {
            A::nan()
        } else {
            acc.max(d)
        }
    }))
}

/// Run `program` on `inputs` and compare against [NdarrayBatchNorm].
pub fn check_correctness<P: Program>(
    program: &P,
    kernel: &BatchNormKernel,
    inputs: &BatchNormInputs,
) -> Result<CheckOutcome, TargetError> {
    let actual = program.run(&inputs.to_args(kernel))?;
    let expected = NdarrayBatchNorm::default().run(inputs);
    let passed = all_close(&actual, &expected, Tolerance::default());
    let max_abs_diff = max_abs_diff(&actual, &expected).unwrap_or(f32::INFINITY);
    if passed {
        log::debug!("{} passed correctness check", program.kernel().name);
    } else {
        log::debug!(
            "{} failed correctness check; max abs. difference {max_abs_diff}",
            program.kernel().name
        );
    }
    Ok(CheckOutcome {
        passed,
        max_abs_diff,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchnorm::batch_norm;
    use crate::common::tests::arb_problem_size;
    use crate::common::{ProblemSize, EPSILON};
    use crate::lower::{lower, LoweredKernel, Stmt};
    use crate::scheduling::{fused_split, ScheduleVariant};
    use crate::target::{SimGpuProgram, SimGpuTarget, Target, TargetCaps};
    use ndarray::{arr1, ArrayD, IxDyn};
    use proptest::prelude::*;

    fn build(kernel: &BatchNormKernel, variant: ScheduleVariant) -> SimGpuProgram {
        let target = SimGpuTarget::default();
        let plan = variant.schedule(&kernel.graph, target.caps()).unwrap();
        target.build(&lower(&plan)).unwrap()
    }

    #[test]
    fn test_all_close_respects_tolerances() {
        let tol = Tolerance {
            abs: 0.1,
            rel: 0.0,
        };
        assert!(all_close(&arr1(&[1.0f32, 2.0]), &arr1(&[1.05, 2.0]), tol));
        assert!(!all_close(&arr1(&[1.0f32, 2.0]), &arr1(&[1.2, 2.0]), tol));
        assert!(!all_close(&arr1(&[1.0f32]), &arr1(&[1.0, 1.0]), tol));
        assert!(!all_close(&arr1(&[f32::NAN]), &arr1(&[f32::NAN]), tol));
    }

    #[test]
    fn test_max_abs_diff() {
        assert_eq!(
            max_abs_diff(&arr1(&[1.0f32, 5.0]), &arr1(&[1.5, 3.0])),
            Some(2.0)
        );
        assert_eq!(max_abs_diff(&arr1(&[1.0f32]), &arr1(&[1.0, 2.0])), None);
        assert!(max_abs_diff(&arr1(&[f32::NAN]), &arr1(&[0.0]))
            .unwrap()
            .is_nan());
    }

    #[test]
    fn test_uneven_fused_split_takes_guard_path_and_matches() {
        let size = ProblemSize::new(32, 28).unwrap();
        let kernel = batch_norm(size);
        let program = build(&kernel, ScheduleVariant::FusedSplit);
        assert!(program.kernel().is_guarded());

        let inputs = BatchNormInputs::random(size, 5);
        let (out, trace) = program.run_traced(&inputs.to_args(&kernel)).unwrap();
        assert_eq!(trace.writes.len(), 25088);
        assert!(trace.writes.iter().all(|&w| w == 1));
        assert!(trace.guarded > 0);
        assert_eq!(out, NdarrayBatchNorm::default().run(&inputs));
        assert!(check_correctness(&program, &kernel, &inputs).unwrap().passed);
    }

    #[test]
    fn test_scalar_problem_matches_formula_exactly() {
        let size = ProblemSize::new(1, 1).unwrap();
        let kernel = batch_norm(size);
        let inputs = BatchNormInputs::random(size, 9);
        let expected = (inputs.data[[0, 0, 0]] - inputs.mean[0])
            / (inputs.variance[0] + EPSILON).sqrt()
            * inputs.gamma[0]
            + inputs.beta[0];
        for variant in [ScheduleVariant::AxisBinding, ScheduleVariant::FusedSplit] {
            let out = build(&kernel, variant)
                .run(&inputs.to_args(&kernel))
                .unwrap();
            assert_eq!(out, ArrayD::from_elem(IxDyn(&[1, 1, 1]), expected));
        }
    }

    #[test]
    fn test_removing_the_guard_goes_out_of_bounds() {
        let size = ProblemSize::new(32, 28).unwrap();
        let kernel = batch_norm(size);
        let guarded = build(&kernel, ScheduleVariant::FusedSplit);
        let mut unguarded: LoweredKernel = guarded.kernel().clone();
        let Stmt::Guard { body, .. } = unguarded.body else {
            panic!("expected the store to be guarded");
        };
        unguarded.body = *body;
        let program = SimGpuTarget::default().build(&unguarded).unwrap();
        let inputs = BatchNormInputs::random(size, 0);
        assert!(matches!(
            program.run(&inputs.to_args(&kernel)),
            Err(TargetError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_mismatch_is_reported() {
        let size = ProblemSize::new(2, 2).unwrap();
        let kernel = batch_norm(size);
        let program = build(&kernel, ScheduleVariant::AxisBinding);
        let inputs = BatchNormInputs::random(size, 1);
        // Run the kernel on one set of inputs but compare against another.
        let mut shifted = inputs.clone();
        shifted.beta.mapv_inplace(|b| b + 1.0);
        let actual = program.run(&inputs.to_args(&kernel)).unwrap();
        let expected = NdarrayBatchNorm::default().run(&shifted);
        assert!(!all_close(&actual, &expected, Tolerance::default()));
        assert!((max_abs_diff(&actual, &expected).unwrap() - 1.0).abs() < 1e-5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_variants_match_reference(
            size in arb_problem_size(24, 12),
            variant in any::<ScheduleVariant>(),
            seed in any::<u64>(),
        ) {
            let kernel = batch_norm(size);
            let program = build(&kernel, variant);
            let inputs = BatchNormInputs::random(size, seed);
            let outcome = check_correctness(&program, &kernel, &inputs).unwrap();
            prop_assert!(outcome.passed, "max abs. difference {}", outcome.max_abs_diff);
        }

        #[test]
        fn test_every_width_writes_each_element_once(
            size in arb_problem_size(8, 8),
            width in 1u32..=96,
        ) {
            let kernel = batch_norm(size);
            let target = SimGpuTarget::default();
            let plan =
                fused_split::schedule_with_width(&kernel.graph, width, target.caps()).unwrap();
            let program = target.build(&lower(&plan)).unwrap();
            let inputs = BatchNormInputs::random(size, 0);
            let (out, trace) = program.run_traced(&inputs.to_args(&kernel)).unwrap();
            prop_assert!(trace.writes.iter().all(|&w| w == 1));
            prop_assert_eq!(out, kernel.graph.evaluate(&inputs.to_args(&kernel)).unwrap());
        }

        #[test]
        fn test_repeated_runs_are_identical(
            size in arb_problem_size(16, 8),
            variant in any::<ScheduleVariant>(),
        ) {
            let kernel = batch_norm(size);
            let program = build(&kernel, variant);
            let args = BatchNormInputs::random(size, 2).to_args(&kernel);
            prop_assert_eq!(program.run(&args).unwrap(), program.run(&args).unwrap());
        }
    }

    #[test]
    fn test_small_targets_reject_wide_blocks() {
        let kernel = batch_norm(ProblemSize::new(4, 64).unwrap());
        let caps = TargetCaps {
            max_threads_per_block: 32,
        };
        assert!(ScheduleVariant::AxisBinding
            .schedule(&kernel.graph, &caps)
            .is_err());
        assert!(ScheduleVariant::FusedSplit
            .schedule(&kernel.graph, &caps)
            .is_ok());
    }
}
