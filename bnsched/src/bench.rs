//! The benchmark driver: times each schedule variant and a baseline across problem sizes.

use crate::baseline::Baseline;
use crate::batchnorm::{batch_norm, BatchNormInputs};
use crate::common::ProblemSize;
use crate::lower::lower;
use crate::scheduling::{ScheduleError, ScheduleVariant};
use crate::target::{Program, Target, TargetError};

use log::{debug, info, warn};
use prettytable::{row, Cell, Row, Table};
use serde::{Deserialize, Serialize};
use std::cmp::max;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt::{self, Display};
use std::time::Duration;

pub const MIN_SAMPLES: u32 = 3;
pub const MIN_TRIAL_TIME_SECS: f32 = 2.5;
pub const DEFAULT_REPEATS: usize = 10;

/// Reported times are never shorter than this.
const MIN_ELAPSED: Duration = Duration::from_nanos(1);

/// A line in a benchmark report: one schedule variant, or the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Series {
    Scheduled(ScheduleVariant),
    Baseline,
}

/// The best mean time of one kernel launch for a `(series, size)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingResult {
    pub series: Series,
    pub size: ProblemSize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    /// Number of samples taken; the fastest is reported.
    pub repeats: usize,
    /// Kernel launches per sample. Estimated from a rough sample if `None`.
    pub inner_loop_iters: Option<u32>,
    /// Check each program's output against the baseline before timing it.
    pub check: bool,
    /// Seed for the generated inputs.
    pub seed: u64,
}

pub struct RobustTimingResult {
    pub inner_loop_runtimes: Vec<Duration>,
    pub inner_loop_iterations: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchReport {
    results: Vec<TimingResult>,
}

/// A sweep failure and the point in the sweep at which it happened.
#[derive(thiserror::Error, Debug)]
#[error("sweep failed for {series} at {size}")]
pub struct SweepError {
    pub size: ProblemSize,
    pub series: Series,
    #[source]
    pub kind: SweepErrorKind,
}

#[derive(thiserror::Error, Debug)]
pub enum SweepErrorKind {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("output differs from the baseline by up to {0}")]
    Mismatch(f32),
}

impl Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Series::Scheduled(variant) => write!(f, "{variant}"),
            Series::Baseline => f.write_str("baseline"),
        }
    }
}

impl TimingResult {
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            repeats: DEFAULT_REPEATS,
            inner_loop_iters: None,
            check: true,
            seed: 0,
        }
    }
}

impl RobustTimingResult {
    pub fn best_inner_loop_runtime(&self) -> Duration {
        self.inner_loop_runtimes
            .iter()
            .copied()
            .min()
            .unwrap_or_default()
    }

    pub fn best_mean(&self) -> Duration {
        self.best_inner_loop_runtime() / max(self.inner_loop_iterations, 1)
    }
}

impl SweepError {
    pub fn is_target_unavailable(&self) -> bool {
        matches!(&self.kind, SweepErrorKind::Target(e) if e.is_unavailable())
    }
}

/// Estimate a good number of inner loop iterations from a single rough sample.
pub fn estimate_optimal_iters<E, F>(mut measure: F) -> Result<u32, E>
where
    F: FnMut(u32) -> Result<Duration, E>,
{
    let rough_secs = measure(1)?.as_secs_f32().max(1e-9);
    Ok(max(
        MIN_SAMPLES,
        (MIN_TRIAL_TIME_SECS / rough_secs).ceil() as u32,
    ))
}

/// Take `repeat` samples of `inner_loop_iters` launches each.
pub fn bench_samples<E, F>(
    inner_loop_iters: u32,
    repeat: usize,
    mut measure: F,
) -> Result<RobustTimingResult, E>
where
    F: FnMut(u32) -> Result<Duration, E>,
{
    debug!("Goal iterations: {inner_loop_iters}");
    let mut inner_loop_runtimes = Vec::with_capacity(repeat);
    for _ in 0..repeat {
        let time = measure(inner_loop_iters)?;
        debug!("Sample runtime result {}s", time.as_secs_f32());
        inner_loop_runtimes.push(time);
    }
    Ok(RobustTimingResult {
        inner_loop_runtimes,
        inner_loop_iterations: inner_loop_iters,
    })
}

/// Time every variant and `baseline` at every size on `target`.
///
/// Runs one launch at a time. The first failure ends the sweep; no partial report is returned.
/// The target is probed before anything runs and an unavailable target is reported against the
/// first size and variant.
pub fn sweep<Tgt: Target>(
    sizes: &[ProblemSize],
    variants: &[ScheduleVariant],
    target: &Tgt,
    baseline: &dyn Baseline,
    config: &BenchConfig,
) -> Result<BenchReport, SweepError> {
    let Some(&first_size) = sizes.first() else {
        return Ok(BenchReport::default());
    };
    let first_series = variants
        .first()
        .map_or(Series::Baseline, |&v| Series::Scheduled(v));
    if !variants.is_empty() {
        target.probe().map_err(|e| SweepError {
            size: first_size,
            series: first_series,
            kind: e.into(),
        })?;
    }

    let mut report = BenchReport::default();
    for &size in sizes {
        info!("Benchmarking {size} on {}", target.target_id());
        let kernel = batch_norm(size);
        let inputs = BatchNormInputs::random(size, config.seed);
        let args = inputs.to_args(&kernel);

        for &variant in variants {
            let series = Series::Scheduled(variant);
            let fail = |kind: SweepErrorKind| SweepError { size, series, kind };
            let plan = variant
                .schedule(&kernel.graph, target.caps())
                .map_err(|e| fail(e.into()))?;
            let program = target.build(&lower(&plan)).map_err(|e| fail(e.into()))?;

            #[cfg(feature = "verification")]
            if config.check {
                let outcome = crate::verification::check_correctness(&program, &kernel, &inputs)
                    .map_err(|e| fail(e.into()))?;
                if !outcome.passed {
                    return Err(fail(SweepErrorKind::Mismatch(outcome.max_abs_diff)));
                }
            }

            let measure = |iters: u32| program.measure_time(&args, iters);
            let iters = match config.inner_loop_iters {
                Some(iters) => iters,
                None => estimate_optimal_iters(measure).map_err(|e| fail(e.into()))?,
            };
            let samples =
                bench_samples(iters, config.repeats, measure).map_err(|e| fail(e.into()))?;
            report.push(series, size, samples.best_mean());
        }

        let measure = |iters: u32| Ok::<_, Infallible>(baseline.measure_time(&inputs, iters));
        let iters = match config.inner_loop_iters {
            Some(iters) => iters,
            None => estimate_optimal_iters(measure).unwrap_or_else(|e| match e {}),
        };
        let samples =
            bench_samples(iters, config.repeats, measure).unwrap_or_else(|e| match e {});
        report.push(Series::Baseline, size, samples.best_mean());
    }
    Ok(report)
}

impl FromIterator<TimingResult> for BenchReport {
    fn from_iter<I: IntoIterator<Item = TimingResult>>(iter: I) -> Self {
        BenchReport {
            results: iter.into_iter().collect(),
        }
    }
}

impl BenchReport {
    fn push(&mut self, series: Series, size: ProblemSize, elapsed: Duration) {
        let elapsed = if elapsed < MIN_ELAPSED {
            warn!("{series} at {size} ran faster than the clock resolution");
            MIN_ELAPSED
        } else {
            elapsed
        };
        info!("{series} at {size}: {:.3e}s", elapsed.as_secs_f64());
        self.results.push(TimingResult {
            series,
            size,
            elapsed,
        });
    }

    pub fn results(&self) -> &[TimingResult] {
        &self.results
    }

    pub fn get(&self, series: Series, size: ProblemSize) -> Option<&TimingResult> {
        self.results
            .iter()
            .find(|r| r.series == series && r.size == size)
    }

    /// Results grouped by series, each group ordered by problem size.
    pub fn by_series(&self) -> BTreeMap<Series, Vec<TimingResult>> {
        let mut groups = BTreeMap::<_, Vec<_>>::new();
        for r in &self.results {
            groups.entry(r.series).or_default().push(*r);
        }
        for group in groups.values_mut() {
            group.sort_by_key(|r| r.size);
        }
        groups
    }

    /// Distinct problem sizes, in ascending order.
    pub fn sizes(&self) -> Vec<ProblemSize> {
        let mut sizes = self.results.iter().map(|r| r.size).collect::<Vec<_>>();
        sizes.sort();
        sizes.dedup();
        sizes
    }

    /// One row per size, one column of seconds per series.
    pub fn to_table(&self) -> Table {
        let groups = self.by_series();
        let mut table = Table::new();
        table.set_format(*prettytable::format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
        let mut titles = row![b->"Size"];
        for series in groups.keys() {
            titles.add_cell(Cell::new(&format!("{series} (s)")).style_spec("b"));
        }
        table.set_titles(titles);
        for size in self.sizes() {
            let mut row = Row::new(vec![Cell::new(&size.to_string())]);
            for &series in groups.keys() {
                let text = self
                    .get(series, size)
                    .map(|r| format!("{:.3e}", r.elapsed_secs()))
                    .unwrap_or_default();
                row.add_cell(Cell::new(&text));
            }
            table.add_row(row);
        }
        table
    }

    /// Write one `series,channels,spatial,seconds` record per result.
    #[cfg(feature = "csv")]
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        #[derive(Serialize)]
        struct Record {
            series: String,
            channels: u32,
            spatial: u32,
            seconds: f64,
        }

        let mut writer = csv::Writer::from_writer(writer);
        for r in &self.results {
            writer.serialize(Record {
                series: r.series.to_string(),
                channels: r.size.channels.get(),
                spatial: r.size.spatial.get(),
                seconds: r.elapsed_secs(),
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}
