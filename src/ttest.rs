//! Welch's t-test leakage detection.
//!
//! Compares a "fixed" population (traces recorded with a constant input)
//! against a "random" population sample by sample. A sample whose absolute
//! t-statistic exceeds the critical value (4.5 for TVLA) shows a data
//! dependent difference in the device's power consumption.
//!
//! `WelchTTest` works on complete trace sets; `IncrementalTTest` keeps
//! running statistics so the test can be evaluated while traces are still
//! being captured.

use crate::config::DEFAULT_CRITICAL_VALUE;
use crate::error::{AnalysisError, Result};
use crate::trace::TraceSet;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Statistical moment compared by the test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TTestOrder {
    /// Compare the per-sample means
    #[default]
    First,
    /// Compare the squares of the per-sample means
    Second,
}

/// Result of a batch Welch's t-test between a fixed and a random set.
#[derive(Clone, Debug)]
pub struct WelchTTest {
    order: TTestOrder,
    n_fixed: usize,
    n_random: usize,
    mean_fixed: Array1<f64>,
    mean_random: Array1<f64>,
    var_fixed: Array1<f64>,
    var_random: Array1<f64>,
    t: Array1<f64>,
}

/// Pass/fail summary of a t-trace against a critical value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TTestVerdict {
    /// True if no sample reached the critical value
    pub passed: bool,

    /// Largest t-statistic
    #[serde(with = "t_value")]
    pub max_t: f64,

    /// Smallest t-statistic
    #[serde(with = "t_value")]
    pub min_t: f64,

    /// Critical value the trace was evaluated against
    pub threshold: f64,

    /// Indices of samples with `|t| >= threshold`
    pub leaking_samples: Vec<usize>,
}

impl WelchTTest {
    /// Run the test on two trace sets of equal trace length.
    pub fn new(fixed: &TraceSet, random: &TraceSet, order: TTestOrder) -> Result<Self> {
        let fixed = fixed.traces_as_2d()?;
        let random = random.traces_as_2d()?;
        Self::from_matrices(fixed.view(), random.view(), order)
    }

    /// Run the test on dense `traces x samples` matrices.
    pub fn from_matrices(
        fixed: ArrayView2<f32>,
        random: ArrayView2<f32>,
        order: TTestOrder,
    ) -> Result<Self> {
        let (n_fixed, len) = fixed.dim();
        let (n_random, random_len) = random.dim();

        if n_fixed == 0 || n_random == 0 {
            return Err(AnalysisError::InsufficientData(format!(
                "t-test needs traces in both sets, got {} fixed and {} random",
                n_fixed, n_random
            )));
        }
        if len != random_len {
            return Err(AnalysisError::shape("random trace length", len, random_len));
        }

        let fixed = fixed.mapv(f64::from);
        let random = random.mapv(f64::from);

        let (mean_fixed, mean_random) = match (fixed.mean_axis(Axis(0)), random.mean_axis(Axis(0))) {
            (Some(f), Some(r)) => (f, r),
            _ => {
                return Err(AnalysisError::InsufficientData(
                    "t-test sets have no traces".to_string(),
                ))
            }
        };
        let var_fixed = fixed.var_axis(Axis(0), 0.0);
        let var_random = random.var_axis(Axis(0), 0.0);

        let t = welch_statistic(
            order,
            mean_fixed.view(),
            var_fixed.view(),
            n_fixed,
            mean_random.view(),
            var_random.view(),
            n_random,
        );

        log::debug!(
            "t-test over {} samples ({} fixed, {} random traces)",
            len,
            n_fixed,
            n_random
        );

        Ok(Self {
            order,
            n_fixed,
            n_random,
            mean_fixed,
            mean_random,
            var_fixed,
            var_random,
            t,
        })
    }

    pub fn order(&self) -> TTestOrder {
        self.order
    }

    /// Signed t-statistic per sample.
    pub fn ttrace(&self) -> &Array1<f64> {
        &self.t
    }

    /// Absolute t-statistic per sample.
    pub fn abs_ttrace(&self) -> Array1<f64> {
        self.t.mapv(f64::abs)
    }

    /// Largest absolute t-statistic over all samples.
    pub fn max_abs_t(&self) -> f64 {
        self.t.iter().fold(0.0f64, |acc, t| acc.max(t.abs()))
    }

    pub fn mean_fixed(&self) -> &Array1<f64> {
        &self.mean_fixed
    }

    pub fn mean_random(&self) -> &Array1<f64> {
        &self.mean_random
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.n_fixed, self.n_random)
    }

    /// Welch–Satterthwaite degrees of freedom per sample. Samples where the
    /// approximation is undefined fall back to `n_fixed + n_random - 2`.
    pub fn degrees_of_freedom(&self) -> Array1<f64> {
        let nf = self.n_fixed as f64;
        let nr = self.n_random as f64;
        let pooled = (self.n_fixed + self.n_random).saturating_sub(2) as f64;

        Zip::from(&self.var_fixed)
            .and(&self.var_random)
            .map_collect(|&vf, &vr| {
                if self.n_fixed < 2 || self.n_random < 2 || vf <= 0.0 || vr <= 0.0 {
                    return pooled;
                }
                let a = vf / nf;
                let b = vr / nr;
                (a + b).powi(2) / (a.powi(2) / (nf - 1.0) + b.powi(2) / (nr - 1.0))
            })
    }

    /// Compare the t-trace against `threshold`.
    pub fn evaluate(&self, threshold: f64) -> TTestVerdict {
        evaluate_ttrace(self.t.view(), threshold)
    }

    /// Compare the t-trace against the TVLA critical value.
    pub fn evaluate_default(&self) -> TTestVerdict {
        self.evaluate(DEFAULT_CRITICAL_VALUE)
    }
}

/// Evaluate any t-trace against a critical value. The test passes when
/// `max_t < threshold` and `min_t > -threshold`.
pub fn evaluate_ttrace(t: ArrayView1<f64>, threshold: f64) -> TTestVerdict {
    let max_t = t.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min_t = t.iter().copied().fold(f64::INFINITY, f64::min);

    let leaking_samples: Vec<usize> = t
        .iter()
        .enumerate()
        .filter(|(_, v)| v.abs() >= threshold)
        .map(|(i, _)| i)
        .collect();

    TTestVerdict {
        passed: leaking_samples.is_empty() && max_t < threshold && min_t > -threshold,
        max_t,
        min_t,
        threshold,
        leaking_samples,
    }
}

/// Serde adapter for a single t-statistic. Noise free samples give
/// infinite statistics, which JSON numbers cannot hold, so non-finite
/// values are written as the strings `"inf"`, `"-inf"` and `"NaN"`.
pub mod t_value {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum Repr {
        Number(f64),
        Text(String),
    }

    impl Repr {
        pub(super) fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
            match self {
                Repr::Number(v) => Ok(v),
                Repr::Text(text) => text
                    .parse()
                    .map_err(|_| E::custom(format!("invalid t-statistic {:?}", text))),
            }
        }
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(&value.to_string())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Repr::deserialize(deserializer)?.into_f64()
    }
}

/// Serde adapter for a whole t-trace, with the encoding of [`t_value`].
pub mod t_values {
    use super::t_value::Repr;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            if value.is_finite() {
                seq.serialize_element(value)?;
            } else {
                seq.serialize_element(&value.to_string())?;
            }
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Repr>::deserialize(deserializer)?
            .into_iter()
            .map(Repr::into_f64)
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
fn welch_statistic(
    order: TTestOrder,
    mean_fixed: ArrayView1<f64>,
    var_fixed: ArrayView1<f64>,
    n_fixed: usize,
    mean_random: ArrayView1<f64>,
    var_random: ArrayView1<f64>,
    n_random: usize,
) -> Array1<f64> {
    let nf = n_fixed as f64;
    let nr = n_random as f64;

    let numerator = match order {
        TTestOrder::First => &mean_fixed - &mean_random,
        TTestOrder::Second => mean_fixed.mapv(|m| m * m) - mean_random.mapv(|m| m * m),
    };

    Zip::from(&numerator)
        .and(&var_fixed)
        .and(&var_random)
        .map_collect(|&num, &vf, &vr| {
            let denominator = (vf / nf + vr / nr).sqrt();
            if denominator == 0.0 {
                // Noise free sample: any difference is certain leakage.
                if num == 0.0 {
                    0.0
                } else {
                    num.signum() * f64::INFINITY
                }
            } else {
                num / denominator
            }
        })
}

/// Running per-sample mean and variance (Welford's algorithm).
#[derive(Clone, Debug)]
struct RunningStats {
    n: usize,
    mean: Array1<f64>,
    m2: Array1<f64>,
}

impl RunningStats {
    fn new(len: usize) -> Self {
        Self {
            n: 0,
            mean: Array1::zeros(len),
            m2: Array1::zeros(len),
        }
    }

    fn update(&mut self, trace: &[f32]) {
        self.n += 1;
        let n = self.n as f64;

        Zip::from(&mut self.mean)
            .and(&mut self.m2)
            .and(ArrayView1::from(trace))
            .for_each(|mean, m2, &x| {
                let x = f64::from(x);
                let delta = x - *mean;
                *mean += delta / n;
                *m2 += delta * (x - *mean);
            });
    }

    /// Population variance.
    fn variance(&self) -> Array1<f64> {
        if self.n == 0 {
            return Array1::zeros(self.m2.len());
        }
        &self.m2 / self.n as f64
    }
}

/// Welch's t-test over traces that arrive one at a time.
///
/// After every update that leaves both populations non-empty, the maximum
/// absolute t-statistic and the total trace count are appended to a history,
/// so the growth of the leakage with the number of traces can be plotted.
#[derive(Clone, Debug)]
pub struct IncrementalTTest {
    order: TTestOrder,
    fixed: Option<RunningStats>,
    random: Option<RunningStats>,
    trace_length: Option<usize>,
    t_over_time: Vec<f64>,
    n_over_time: Vec<usize>,
}

impl Default for IncrementalTTest {
    fn default() -> Self {
        Self::new(TTestOrder::First)
    }
}

impl IncrementalTTest {
    pub fn new(order: TTestOrder) -> Self {
        Self {
            order,
            fixed: None,
            random: None,
            trace_length: None,
            t_over_time: Vec::new(),
            n_over_time: Vec::new(),
        }
    }

    pub fn add_fixed(&mut self, trace: &[f32]) -> Result<()> {
        let len = self.check_length(trace)?;
        self.fixed
            .get_or_insert_with(|| RunningStats::new(len))
            .update(trace);
        self.record()
    }

    pub fn add_random(&mut self, trace: &[f32]) -> Result<()> {
        let len = self.check_length(trace)?;
        self.random
            .get_or_insert_with(|| RunningStats::new(len))
            .update(trace);
        self.record()
    }

    /// Trace counts of the fixed and random populations.
    pub fn counts(&self) -> (usize, usize) {
        (
            self.fixed.as_ref().map_or(0, |s| s.n),
            self.random.as_ref().map_or(0, |s| s.n),
        )
    }

    /// Current t-trace.
    pub fn ttrace(&self) -> Result<Array1<f64>> {
        match (&self.fixed, &self.random) {
            (Some(fixed), Some(random)) => Ok(welch_statistic(
                self.order,
                fixed.mean.view(),
                fixed.variance().view(),
                fixed.n,
                random.mean.view(),
                random.variance().view(),
                random.n,
            )),
            _ => Err(AnalysisError::InsufficientData(
                "incremental t-test needs at least one fixed and one random trace".to_string(),
            )),
        }
    }

    /// Maximum absolute t-statistic after each recorded update.
    pub fn t_over_time(&self) -> &[f64] {
        &self.t_over_time
    }

    /// Total trace count at each recorded update.
    pub fn n_over_time(&self) -> &[usize] {
        &self.n_over_time
    }

    pub fn evaluate(&self, threshold: f64) -> Result<TTestVerdict> {
        Ok(evaluate_ttrace(self.ttrace()?.view(), threshold))
    }

    fn check_length(&mut self, trace: &[f32]) -> Result<usize> {
        match self.trace_length {
            Some(len) if len != trace.len() => {
                Err(AnalysisError::shape("incremental t-test trace length", len, trace.len()))
            }
            Some(len) => Ok(len),
            None => {
                self.trace_length = Some(trace.len());
                Ok(trace.len())
            }
        }
    }

    fn record(&mut self) -> Result<()> {
        if self.fixed.is_none() || self.random.is_none() {
            return Ok(());
        }

        let t = self.ttrace()?;
        let max_abs = t.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
        let (nf, nr) = self.counts();

        self.t_over_time.push(max_abs);
        self.n_over_time.push(nf + nr);
        Ok(())
    }
}
