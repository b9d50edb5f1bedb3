//! In-memory trace set.
//!
//! A trace set owns an ordered list of traces together with optional
//! auxiliary bytes per trace. It offers pure reductions (mean, standard
//! deviation, extrema) over the dense trace matrix, and destructive
//! pre-processing transforms (trimming, convolution, subsampling) which
//! replace every trace in the set at once. Transforms take `&mut self`,
//! so a transform can never run while an analysis engine holds a shared
//! borrow of the same set. Callers that need the original samples after a
//! transform must `clone()` the set first.

use crate::codec::stream::StreamReader;
use crate::error::{AnalysisError, Result};
use crate::trace::transform::{convolve_same, resample_linear};
use crate::trace::{AuxData, Trace};
use ndarray::{Array1, Array2, Axis};
use std::io::Read;

/// Description given to sets created without one.
pub const DEFAULT_DESCRIPTION: &str = "No Description";

/// Ordered collection of traces and their auxiliary data.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceSet {
    /// Trace sample vectors, in capture order
    traces: Vec<Trace>,

    /// Auxiliary data, one entry per trace; presence is uniform
    aux_data: Vec<Option<AuxData>>,

    /// Free-text description persisted with the set
    description: String,
}

impl Default for TraceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceSet {
    /// Create a new empty trace set.
    pub fn new() -> Self {
        Self {
            traces: Vec::new(),
            aux_data: Vec::new(),
            description: DEFAULT_DESCRIPTION.to_string(),
        }
    }

    pub fn with_description(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::new()
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    /// Add a new trace and its auxiliary data to the set.
    ///
    /// When `trim_pad` is set and the set is not empty, the trace is
    /// truncated at the end, or zero padded at the end, to the length of
    /// the zeroth trace. Otherwise its length is kept as is, and length
    /// sensitive operations will reject the set until it is uniform.
    ///
    /// Auxiliary data must be present for every trace or for none. An empty
    /// buffer counts as absent and is stored as `None`.
    pub fn add_trace(&mut self, mut trace: Trace, aux: Option<AuxData>, trim_pad: bool) -> Result<()> {
        let aux = aux.filter(|a| !a.is_empty());
        if let Some(first) = self.aux_data.first() {
            if first.is_some() != aux.is_some() {
                return Err(AnalysisError::shape(
                    "auxiliary data presence",
                    first.as_ref().map_or(0, |a| a.len()),
                    aux.as_ref().map_or(0, |a| a.len()),
                ));
            }
        }

        if trim_pad {
            if let Some(t0len) = self.trace_length() {
                trace.resize(t0len, 0.0);
            }
        }

        self.traces.push(trace);
        self.aux_data.push(aux);
        Ok(())
    }

    /// Number of traces in the set.
    pub fn num_traces(&self) -> usize {
        self.traces.len()
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Length of the zeroth trace, or `None` for an empty set.
    pub fn trace_length(&self) -> Option<usize> {
        self.traces.first().map(|t| t.len())
    }

    /// Length of the longest trace in the set.
    pub fn longest_trace(&self) -> usize {
        self.traces.iter().map(|t| t.len()).max().unwrap_or(0)
    }

    /// True if every trace has the same number of samples.
    pub fn is_uniform_length(&self) -> bool {
        match self.trace_length() {
            Some(len) => self.traces.iter().all(|t| t.len() == len),
            None => true,
        }
    }

    /// True if the traces carry auxiliary data.
    pub fn has_aux_data(&self) -> bool {
        matches!(self.aux_data.first(), Some(Some(_)))
    }

    /// Auxiliary data length of the zeroth trace (0 when absent).
    pub fn aux_length(&self) -> usize {
        match self.aux_data.first() {
            Some(Some(aux)) => aux.len(),
            _ => 0,
        }
    }

    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    pub fn aux_data(&self) -> &[Option<AuxData>] {
        &self.aux_data
    }

    pub fn trace(&self, index: usize) -> Option<&Trace> {
        self.traces.get(index)
    }

    /// Iterate over `(trace, aux data)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&Trace, Option<&AuxData>)> + '_ {
        self.traces
            .iter()
            .zip(self.aux_data.iter())
            .map(|(t, a)| (t, a.as_ref()))
    }

    /// Remove every trace. The description is kept.
    pub fn clear(&mut self) {
        self.traces.clear();
        self.aux_data.clear();
    }

    /// Destructively truncate every trace to `min(n, trace_length)`
    /// samples, keeping the first samples.
    pub fn trim_traces(&mut self, n: usize) {
        let len = match self.trace_length() {
            Some(len) => n.min(len),
            None => return,
        };

        for trace in &mut self.traces {
            trace.truncate(len);
        }
    }

    /// Dense `D x L` matrix of all traces, one trace per row.
    pub fn traces_as_2d(&self) -> Result<Array2<f32>> {
        let len = self.require_uniform()?;

        let mut matrix = Array2::<f32>::zeros((self.traces.len(), len));
        for (mut row, trace) in matrix.axis_iter_mut(Axis(0)).zip(self.traces.iter()) {
            row.assign(&ndarray::ArrayView1::from(trace.as_slice()));
        }
        Ok(matrix)
    }

    /// Dense `D x A` matrix of the auxiliary data, one entry per row.
    pub fn aux_as_2d(&self) -> Result<Array2<u8>> {
        if self.is_empty() {
            return Err(AnalysisError::InsufficientData(
                "trace set is empty".to_string(),
            ));
        }

        let width = self.aux_length();
        let mut matrix = Array2::<u8>::zeros((self.aux_data.len(), width));

        for (mut row, aux) in matrix.axis_iter_mut(Axis(0)).zip(self.aux_data.iter()) {
            let aux = aux.as_deref().unwrap_or(&[]);
            if aux.len() != width {
                return Err(AnalysisError::shape("auxiliary data length", width, aux.len()));
            }
            row.assign(&ndarray::ArrayView1::from(aux));
        }
        Ok(matrix)
    }

    /// Elementwise mean across all traces.
    pub fn average_trace(&self) -> Result<Array1<f64>> {
        let matrix = self.as_f64_matrix()?;
        matrix
            .mean_axis(Axis(0))
            .ok_or_else(|| AnalysisError::InsufficientData("trace set is empty".to_string()))
    }

    /// Elementwise population standard deviation across all traces.
    pub fn standard_deviation(&self) -> Result<Array1<f64>> {
        let matrix = self.as_f64_matrix()?;
        Ok(matrix.std_axis(Axis(0), 0.0))
    }

    /// Elementwise minimum across all traces.
    pub fn min_trace(&self) -> Result<Array1<f64>> {
        let matrix = self.as_f64_matrix()?;
        Ok(matrix.fold_axis(Axis(0), f64::INFINITY, |acc, &x| acc.min(x)))
    }

    /// Elementwise maximum across all traces.
    pub fn max_trace(&self) -> Result<Array1<f64>> {
        let matrix = self.as_f64_matrix()?;
        Ok(matrix.fold_axis(Axis(0), f64::NEG_INFINITY, |acc, &x| acc.max(x)))
    }

    /// Elementwise `max - min` across all traces.
    pub fn range_trace(&self) -> Result<Array1<f64>> {
        Ok(self.max_trace()? - self.min_trace()?)
    }

    /// Destructively convolve every trace with `weights`, keeping each
    /// trace's length.
    pub fn convolve_traces(&mut self, weights: &[f32]) -> Result<()> {
        if weights.is_empty() {
            return Err(AnalysisError::InvalidParameter(
                "convolution kernel is empty".to_string(),
            ));
        }

        for trace in &mut self.traces {
            *trace = convolve_same(trace, weights);
        }
        Ok(())
    }

    /// Destructively convolve every trace with a kernel of `window` ones.
    pub fn convolve_traces_uniform(&mut self, window: usize) -> Result<()> {
        self.convolve_traces(&vec![1.0; window])
    }

    /// Destructively resample every trace to `floor(trace_length / factor)`
    /// points using linear interpolation.
    pub fn subsample_traces(&mut self, factor: f64) -> Result<()> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(AnalysisError::InvalidParameter(format!(
                "subsample factor must be positive, got {}",
                factor
            )));
        }

        let len = match self.trace_length() {
            Some(len) => len,
            None => return Ok(()),
        };

        let target = (len as f64 / factor).floor() as usize;
        if target == 0 {
            return Err(AnalysisError::InvalidParameter(format!(
                "subsampling {} samples by {} leaves no samples",
                len, factor
            )));
        }

        for trace in &mut self.traces {
            *trace = resample_linear(trace, target);
        }
        Ok(())
    }

    /// Split the set by a per-trace mask: traces whose mask entry is
    /// `true` go to the first set, the others to the second. Used to
    /// separate fixed and random captures recorded into one stream.
    pub fn partition(&self, mask: &[bool]) -> Result<(TraceSet, TraceSet)> {
        self.check_mask(mask)?;

        let mut selected = TraceSet::with_description(self.description.clone());
        let mut rest = TraceSet::with_description(self.description.clone());

        for ((trace, aux), &flag) in self.traces.iter().zip(&self.aux_data).zip(mask) {
            let target = if flag { &mut selected } else { &mut rest };
            target.traces.push(trace.clone());
            target.aux_data.push(aux.clone());
        }

        Ok((selected, rest))
    }

    /// Copy of the set without the traces whose mask entry is `true`.
    pub fn filter_out(&self, mask: &[bool]) -> Result<TraceSet> {
        let (_, kept) = self.partition(mask)?;
        Ok(kept)
    }

    /// Copy of the set restricted to samples `start..end` of every trace.
    pub fn window(&self, start: usize, end: usize) -> Result<TraceSet> {
        if start >= end {
            return Err(AnalysisError::InvalidParameter(format!(
                "empty sample window [{}, {})",
                start, end
            )));
        }

        let mut windowed = TraceSet::with_description(self.description.clone());
        for (trace, aux) in self.traces.iter().zip(&self.aux_data) {
            if trace.len() < end {
                return Err(AnalysisError::shape("sample window end", end, trace.len()));
            }
            windowed.traces.push(trace[start..end].to_vec());
            windowed.aux_data.push(aux.clone());
        }
        Ok(windowed)
    }

    /// Read up to `limit` traces (all remaining if `None`) from a streaming
    /// reader and append them to the set. Returns the number added.
    pub fn load_from_reader<R: Read>(
        &mut self,
        reader: &mut StreamReader<R>,
        limit: Option<usize>,
    ) -> Result<usize> {
        let mut added = 0;

        while limit.map_or(true, |n| added < n) {
            match reader.next_record()? {
                Some((trace, aux)) => {
                    self.add_trace(trace, aux, false)?;
                    added += 1;
                }
                None => break,
            }
        }

        log::debug!("Loaded {} traces from stream", added);
        Ok(added)
    }

    fn require_uniform(&self) -> Result<usize> {
        let len = self.trace_length().ok_or_else(|| {
            AnalysisError::InsufficientData("trace set is empty".to_string())
        })?;

        if let Some(bad) = self.traces.iter().find(|t| t.len() != len) {
            return Err(AnalysisError::shape("trace length", len, bad.len()));
        }

        Ok(len)
    }

    fn as_f64_matrix(&self) -> Result<Array2<f64>> {
        Ok(self.traces_as_2d()?.mapv(f64::from))
    }

    fn check_mask(&self, mask: &[bool]) -> Result<()> {
        if mask.len() != self.traces.len() {
            return Err(AnalysisError::shape("trace mask", self.traces.len(), mask.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_set() -> TraceSet {
        let mut set = TraceSet::new();
        set.add_trace(vec![1.0, 2.0, 3.0, 4.0], Some(vec![0, 1]), false).unwrap();
        set.add_trace(vec![5.0, 6.0, 7.0, 8.0], Some(vec![0, 2]), false).unwrap();
        set.add_trace(vec![9.0, 10.0, 11.0, 12.0], Some(vec![0, 3]), false).unwrap();
        set
    }

    #[test]
    fn test_new_set_is_empty() {
        let set = TraceSet::new();
        assert!(set.is_empty());
        assert_eq!(set.trace_length(), None);
        assert_eq!(set.description(), DEFAULT_DESCRIPTION);
        assert!(set.is_uniform_length());
    }

    #[test]
    fn test_average_trace() {
        let set = sample_set();
        let avg = set.average_trace().unwrap();
        assert_eq!(avg.to_vec(), vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_standard_deviation_is_population() {
        let set = sample_set();
        let std = set.standard_deviation().unwrap();
        let expected = (32.0f64 / 3.0).sqrt();
        for value in std.iter() {
            assert!((value - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reductions_are_repeatable() {
        let set = sample_set();
        assert_eq!(set.average_trace().unwrap(), set.average_trace().unwrap());
        assert_eq!(set.standard_deviation().unwrap(), set.standard_deviation().unwrap());
    }

    #[test]
    fn test_min_max_range() {
        let set = sample_set();
        assert_eq!(set.min_trace().unwrap().to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(set.max_trace().unwrap().to_vec(), vec![9.0, 10.0, 11.0, 12.0]);
        assert_eq!(set.range_trace().unwrap().to_vec(), vec![8.0; 4]);
    }

    #[test]
    fn test_trim_pad_on_add() {
        let mut set = TraceSet::new();
        set.add_trace(vec![1.0, 2.0, 3.0], None, true).unwrap();
        set.add_trace(vec![1.0, 2.0, 3.0, 4.0, 5.0], None, true).unwrap();
        set.add_trace(vec![7.0], None, true).unwrap();

        assert_eq!(set.traces()[1], vec![1.0, 2.0, 3.0]);
        assert_eq!(set.traces()[2], vec![7.0, 0.0, 0.0]);
        assert!(set.is_uniform_length());
    }

    #[test]
    fn test_ragged_set_rejected_by_matrix_operations() {
        let mut set = TraceSet::new();
        set.add_trace(vec![1.0, 2.0, 3.0], None, false).unwrap();
        set.add_trace(vec![1.0, 2.0], None, false).unwrap();

        assert!(!set.is_uniform_length());
        assert_eq!(set.longest_trace(), 3);
        match set.traces_as_2d() {
            Err(AnalysisError::Shape { expected, got, .. }) => {
                assert_eq!(expected, 3);
                assert_eq!(got, 2);
            }
            other => panic!("expected shape error, got {:?}", other),
        }
        assert!(set.average_trace().is_err());
    }

    #[test]
    fn test_empty_set_has_no_statistics() {
        let set = TraceSet::new();
        assert!(matches!(set.average_trace(), Err(AnalysisError::InsufficientData(_))));
        assert!(matches!(set.aux_as_2d(), Err(AnalysisError::InsufficientData(_))));
    }

    #[test]
    fn test_mixed_aux_presence_rejected() {
        let mut set = TraceSet::new();
        set.add_trace(vec![1.0], Some(vec![1]), false).unwrap();
        assert!(set.add_trace(vec![2.0], None, false).is_err());
        assert_eq!(set.num_traces(), 1);
    }

    #[test]
    fn test_aux_as_2d() {
        let set = sample_set();
        let aux = set.aux_as_2d().unwrap();
        assert_eq!(aux.shape(), &[3, 2]);
        assert_eq!(aux.column(1).to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_trim_traces() {
        let mut set = sample_set();
        set.trim_traces(2);
        assert_eq!(set.trace_length(), Some(2));
        assert_eq!(set.traces()[2], vec![9.0, 10.0]);

        set.trim_traces(10);
        assert_eq!(set.trace_length(), Some(2));
    }

    #[test]
    fn test_convolve_uniform() {
        let mut set = TraceSet::new();
        set.add_trace(vec![1.0, 2.0, 3.0, 4.0], None, false).unwrap();
        set.convolve_traces_uniform(3).unwrap();
        assert_eq!(set.traces()[0], vec![3.0, 6.0, 9.0, 7.0]);
        assert!(set.convolve_traces(&[]).is_err());
    }

    #[test]
    fn test_subsample() {
        let mut set = TraceSet::new();
        set.add_trace((0..10).map(|x| x as f32).collect(), None, false).unwrap();
        set.subsample_traces(2.0).unwrap();
        assert_eq!(set.trace_length(), Some(5));
        assert_eq!(set.traces()[0][0], 0.0);
        assert_eq!(set.traces()[0][4], 9.0);

        assert!(set.subsample_traces(0.0).is_err());
        assert!(set.subsample_traces(100.0).is_err());
    }

    #[test]
    fn test_partition_and_filter() {
        let set = sample_set();
        let (fixed, random) = set.partition(&[true, false, true]).unwrap();
        assert_eq!(fixed.num_traces(), 2);
        assert_eq!(random.num_traces(), 1);
        assert_eq!(random.traces()[0], vec![5.0, 6.0, 7.0, 8.0]);
        assert_eq!(random.aux_data()[0], Some(vec![0, 2]));

        let kept = set.filter_out(&[false, true, false]).unwrap();
        assert_eq!(kept.num_traces(), 2);
        assert_eq!(kept.traces()[1], vec![9.0, 10.0, 11.0, 12.0]);

        assert!(set.partition(&[true]).is_err());
    }

    #[test]
    fn test_window() {
        let set = sample_set();
        let windowed = set.window(1, 3).unwrap();
        assert_eq!(windowed.traces()[0], vec![2.0, 3.0]);
        assert!(set.window(2, 2).is_err());
        assert!(set.window(0, 5).is_err());
    }

    #[test]
    fn test_clear_keeps_description() {
        let mut set = sample_set();
        set.set_description("fixed key");
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.description(), "fixed key");
    }

    proptest! {
        #[test]
        fn test_trim_is_idempotent(
            lengths in prop::collection::vec(1usize..64, 1..8),
            n in 0usize..80,
        ) {
            let mut set = TraceSet::new();
            for len in &lengths {
                set.add_trace(vec![1.0; *len], None, true).unwrap();
            }

            set.trim_traces(n);
            let once = set.clone();
            set.trim_traces(n);

            prop_assert_eq!(once, set);
        }
    }
}
