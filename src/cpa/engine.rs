//! Correlation power analysis engine.
//!
//! For every key byte the engine builds the matrix of intermediate values
//! V = sbox[plaintext ^ guess] (traces x hypotheses), maps it through the
//! power model to H, and correlates every column of H with every sample of
//! the trace matrix T. The hypothesis with the highest absolute correlation
//! is the recovered key byte.
//!
//! T is centred once at construction and shared read-only by all workers.
//! Key bytes are attacked in parallel on a dedicated rayon pool; the
//! hypotheses of one byte are correlated by a nested parallel iterator on
//! the same pool.

use crate::config::CpaConfig;
use crate::cpa::model::LeakageTable;
use crate::cpa::result::{ByteGuess, CpaAttack};
use crate::cpa::sbox::SBox;
use crate::error::{AnalysisError, Result};
use crate::progress::{CancelToken, ProgressSink};
use crate::trace::TraceSet;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// CPA attack state for one trace set.
pub struct CpaEngine {
    config: CpaConfig,
    sbox: SBox,
    table: LeakageTable,

    /// Mean-centred traces, D x L
    traces: Array2<f64>,

    /// Sum of squared deviations of every sample
    ss_traces: Array1<f64>,

    /// Plaintext bytes, D x message_bytes
    plaintexts: Array2<u8>,

    /// Index of the first sample of the analysed window
    sample_offset: usize,

    pool: rayon::ThreadPool,
}

impl CpaEngine {
    /// Prepare an attack on `set` using the S-box named in `config`.
    pub fn new(set: &TraceSet, config: CpaConfig) -> Result<Self> {
        let sbox = SBox::from(config.sbox);
        Self::with_sbox(set, config, sbox)
    }

    /// Prepare an attack with a custom S-box.
    pub fn with_sbox(set: &TraceSet, config: CpaConfig, sbox: SBox) -> Result<Self> {
        config.validate()?;

        if set.is_empty() {
            return Err(AnalysisError::InsufficientData(
                "CPA needs at least one trace".to_string(),
            ));
        }

        let required = config.required_aux_len();
        if !set.has_aux_data() {
            return Err(AnalysisError::shape("trace aux data length", required, 0));
        }

        let traces = set.traces_as_2d()?;
        let aux = set.aux_as_2d()?;
        if aux.ncols() < required {
            return Err(AnalysisError::shape("trace aux data length", required, aux.ncols()));
        }

        let rows = config
            .max_traces
            .map_or(traces.nrows(), |n| n.min(traces.nrows()));
        let (start, end) = config.sample_window.unwrap_or((0, traces.ncols()));
        if end > traces.ncols() {
            return Err(AnalysisError::shape("sample window end", traces.ncols(), end));
        }
        if start >= end {
            return Err(AnalysisError::InsufficientData(
                "traces have no samples to correlate".to_string(),
            ));
        }

        let window = traces.slice(s![..rows, start..end]).mapv(f64::from);
        let (centred, ss_traces) = centre_columns(window.view());
        let plaintexts = aux
            .slice(s![..rows, config.plaintext_offset..required])
            .to_owned();

        let table = LeakageTable::new(config.model, &sbox);
        let pool = build_pool(config.threads)?;

        log::info!(
            "CPA over {} traces x {} samples ({} key bytes, {} hypotheses, {} threads)",
            rows,
            end - start,
            config.key_bytes,
            config.key_hypotheses,
            pool.current_num_threads()
        );

        Ok(Self {
            config,
            sbox,
            table,
            traces: centred,
            ss_traces,
            plaintexts,
            sample_offset: start,
            pool,
        })
    }

    pub fn config(&self) -> &CpaConfig {
        &self.config
    }

    /// Number of traces used by the attack.
    pub fn num_traces(&self) -> usize {
        self.traces.nrows()
    }

    /// Number of samples per trace in the analysed window.
    pub fn num_samples(&self) -> usize {
        self.traces.ncols()
    }

    /// Intermediate values `V[d, k] = sbox[plaintext[d][msg_byte] ^ k]`.
    pub fn compute_v(&self, msg_byte: usize) -> Result<Array2<u8>> {
        self.check_message_byte(msg_byte)?;

        let plaintexts = self.plaintexts.column(msg_byte);
        Ok(Array2::from_shape_fn(
            (self.num_traces(), self.config.key_hypotheses),
            |(d, k)| self.sbox.apply(plaintexts[d] ^ k as u8),
        ))
    }

    /// Apply the configured power model to intermediate values computed
    /// for message byte `msg_byte`. The byte selects the plaintext column a
    /// Hamming distance model compares against.
    pub fn compute_h(&self, v: ArrayView2<u8>, msg_byte: usize) -> Result<Array2<f64>> {
        self.check_message_byte(msg_byte)?;
        if v.nrows() != self.num_traces() {
            return Err(AnalysisError::shape("intermediate rows", self.num_traces(), v.nrows()));
        }

        let plaintexts = self.plaintexts.column(msg_byte);
        let model = self.config.model;
        Ok(Array2::from_shape_fn(v.dim(), |(d, k)| {
            model.leakage(v[[d, k]], plaintexts[d]) as f64
        }))
    }

    /// Hypothetical leakage of every trace under every key guess, looked up
    /// in the precomputed leakage table. Equal to
    /// `compute_h(compute_v(msg_byte), msg_byte)`.
    pub fn hypotheses(&self, msg_byte: usize) -> Result<Array2<f64>> {
        self.check_message_byte(msg_byte)?;

        let plaintexts = self.plaintexts.column(msg_byte);
        Ok(Array2::from_shape_fn(
            (self.num_traces(), self.config.key_hypotheses),
            |(d, k)| self.table.get(plaintexts[d], k as u8) as f64,
        ))
    }

    /// Absolute Pearson correlation of every hypothesis column of `h`
    /// with every trace sample: `R[k, j] = |cov| / sqrt(ssH * ssT)`.
    /// A zero denominator yields 0.
    pub fn compute_r(&self, h: ArrayView2<f64>) -> Result<Array2<f64>> {
        if h.nrows() != self.num_traces() {
            return Err(AnalysisError::shape("hypothesis rows", self.num_traces(), h.nrows()));
        }

        let traces = self.traces.view();
        let ss_traces = self.ss_traces.view();

        let rows: Vec<Array1<f64>> = self.pool.install(|| {
            (0..h.ncols())
                .into_par_iter()
                .map(|k| correlate_column(traces, ss_traces, h.column(k)))
                .collect()
        });

        let mut r = Array2::zeros((h.ncols(), self.num_samples()));
        for (mut row, values) in r.axis_iter_mut(Axis(0)).zip(rows.iter()) {
            row.assign(values);
        }
        Ok(r)
    }

    /// Attack one key byte.
    pub fn attack_byte(&self, byte_index: usize) -> Result<ByteGuess> {
        self.pool.install(|| self.attack_byte_in_pool(byte_index))
    }

    /// Attack every configured key byte in parallel.
    ///
    /// Cancellation is checked before each byte starts: bytes already
    /// running finish, no new byte is started, and the call fails with
    /// [`AnalysisError::Cancelled`].
    pub fn attack(&self, progress: &dyn ProgressSink, cancel: &CancelToken) -> Result<CpaAttack> {
        let total = self.config.key_bytes;
        let done = AtomicUsize::new(0);

        log::info!("Attacking {} key bytes", total);

        let results: Vec<Option<Result<ByteGuess>>> = self.pool.install(|| {
            (0..total)
                .into_par_iter()
                .map(|byte_index| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let guess = self.attack_byte_in_pool(byte_index);
                    let completed = done.fetch_add(1, Ordering::SeqCst) + 1;
                    progress.update("attacking key bytes", completed, total);
                    Some(guess)
                })
                .collect()
        });

        let completed = results.iter().filter(|r| r.is_some()).count();
        if completed < total {
            log::warn!("CPA cancelled after {} of {} key bytes", completed, total);
            return Err(AnalysisError::Cancelled { completed, total });
        }

        let guesses = results
            .into_iter()
            .flatten()
            .collect::<Result<Vec<ByteGuess>>>()?;

        Ok(CpaAttack {
            guesses,
            traces_used: self.num_traces(),
        })
    }

    fn attack_byte_in_pool(&self, byte_index: usize) -> Result<ByteGuess> {
        if byte_index >= self.config.key_bytes {
            return Err(AnalysisError::InvalidParameter(format!(
                "key byte {} out of range (attacking {})",
                byte_index, self.config.key_bytes
            )));
        }

        let h = self.hypotheses(byte_index)?;
        let r = self.compute_r(h.view())?;
        let (best, sample, peak) = best_guess(r.view());

        let peaks: Vec<f64> = r
            .axis_iter(Axis(0))
            .map(|row| row.iter().copied().fold(0.0, f64::max))
            .collect();
        let runner_up = peaks
            .iter()
            .enumerate()
            .filter(|&(k, _)| k != best)
            .map(|(_, &p)| p)
            .fold(0.0, f64::max);

        log::debug!(
            "Key byte {}: 0x{:02x} (|r| = {:.4} at sample {})",
            byte_index,
            best,
            peak,
            sample + self.sample_offset
        );

        Ok(ByteGuess {
            byte_index,
            value: best as u8,
            peak,
            sample: sample + self.sample_offset,
            confidence: peak - runner_up,
            peaks,
            correlation: if self.config.keep_correlation { Some(r) } else { None },
        })
    }

    fn check_message_byte(&self, msg_byte: usize) -> Result<()> {
        if msg_byte >= self.plaintexts.ncols() {
            return Err(AnalysisError::InvalidParameter(format!(
                "message byte {} out of range ({} message bytes)",
                msg_byte,
                self.plaintexts.ncols()
            )));
        }
        Ok(())
    }
}

/// Position and value of the largest entry of a correlation matrix, as
/// `(hypothesis, sample, value)`. The first maximum wins; NaN entries are
/// skipped. An empty matrix gives `(0, 0, 0.0)`.
pub fn best_guess(r: ArrayView2<f64>) -> (usize, usize, f64) {
    let mut best = (0, 0, f64::NEG_INFINITY);
    for ((k, j), &value) in r.indexed_iter() {
        if value > best.2 {
            best = (k, j, value);
        }
    }
    if best.2 == f64::NEG_INFINITY {
        (0, 0, 0.0)
    } else {
        best
    }
}

fn build_pool(threads: Option<usize>) -> Result<rayon::ThreadPool> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    builder
        .build()
        .map_err(|e| AnalysisError::InvalidParameter(format!("cannot start worker pool: {}", e)))
}

/// Subtract the mean of a vector. Constant vectors become exactly zero so
/// that their correlation is 0 rather than rounding noise.
pub(crate) fn centre(values: ArrayView1<f64>) -> Array1<f64> {
    let first = match values.first() {
        Some(&first) => first,
        None => return Array1::zeros(0),
    };
    if values.iter().all(|&v| v == first) {
        return Array1::zeros(values.len());
    }

    let mean = values.sum() / values.len() as f64;
    values.mapv(|v| v - mean)
}

/// Centre every column of `matrix` and return it with the per-column sum
/// of squared deviations.
pub(crate) fn centre_columns(matrix: ArrayView2<f64>) -> (Array2<f64>, Array1<f64>) {
    let mut centred = Array2::zeros(matrix.dim());
    for (mut out, column) in centred
        .axis_iter_mut(Axis(1))
        .zip(matrix.axis_iter(Axis(1)))
    {
        out.assign(&centre(column));
    }

    let ss = centred.map_axis(Axis(0), |column| column.dot(&column));
    (centred, ss)
}

/// Absolute correlation of one hypothesis vector with every column of the
/// centred trace matrix.
pub(crate) fn correlate_column(
    centred: ArrayView2<f64>,
    ss_traces: ArrayView1<f64>,
    hypothesis: ArrayView1<f64>,
) -> Array1<f64> {
    let h = centre(hypothesis);
    let ss_h = h.dot(&h);
    let cov = centred.t().dot(&h);

    Zip::from(&cov).and(ss_traces).map_collect(|&c, &ss_t| {
        let denominator = (ss_h * ss_t).sqrt();
        if denominator == 0.0 {
            0.0
        } else {
            c.abs() / denominator
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpa::model::{HdReference, PowerModel};
    use crate::cpa::sbox::hamming_weight;
    use ndarray::array;

    /// Noise free traces whose sample 2 is the Hamming weight of
    /// `sbox[p ^ key]` for plaintext byte 0.
    fn noise_free_set(key: u8, traces: usize) -> TraceSet {
        let sbox = SBox::aes();
        let mut set = TraceSet::new();
        for d in 0..traces {
            let p0 = (d * 37 + 11) as u8;
            let p1 = (d * 91 + 5) as u8;
            let leak = hamming_weight(sbox.apply(p0 ^ key)) as f32;
            let trace = vec![1.0, (d % 7) as f32, leak, 0.5];
            set.add_trace(trace, Some(vec![p0, p1]), false).unwrap();
        }
        set
    }

    #[test]
    fn test_recovers_byte_and_peak_sample() {
        let set = noise_free_set(0x2b, 256);
        let engine = CpaEngine::new(&set, CpaConfig::new(1, 2).with_threads(2)).unwrap();

        let guess = engine.attack_byte(0).unwrap();
        assert_eq!(guess.value, 0x2b);
        assert_eq!(guess.sample, 2);
        assert!((guess.peak - 1.0).abs() < 1e-9);
        assert!(guess.confidence > 0.0);
        assert_eq!(guess.rank_of(0x2b), 0);
        assert_eq!(guess.peaks.len(), 256);
    }

    #[test]
    fn test_constant_sample_has_zero_correlation() {
        let set = noise_free_set(0x10, 64);
        let engine = CpaEngine::new(&set, CpaConfig::new(1, 2)).unwrap();
        let r = engine.compute_r(engine.hypotheses(0).unwrap().view()).unwrap();
        assert!(r.column(0).iter().all(|&v| v == 0.0));
        assert!(r.column(3).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_table_lookup_matches_v_and_h() {
        let set = noise_free_set(0x00, 32);
        let config = CpaConfig::new(2, 2).with_model(PowerModel::HammingDistance {
            reference: HdReference::Plaintext,
        });
        let engine = CpaEngine::new(&set, config).unwrap();

        for byte in 0..2 {
            let v = engine.compute_v(byte).unwrap();
            let h = engine.compute_h(v.view(), byte).unwrap();
            assert_eq!(h, engine.hypotheses(byte).unwrap());
        }

        let v = engine.compute_v(0).unwrap();
        assert_eq!(v.dim(), (32, 256));
        assert!(engine.compute_h(v.view(), 2).is_err());
        assert!(engine.compute_h(v.slice(s![..4, ..]), 0).is_err());
    }

    #[test]
    fn test_compute_h_follows_configured_model() {
        let set = noise_free_set(0x00, 32);
        let v = CpaEngine::new(&set, CpaConfig::new(1, 2)).unwrap().compute_v(0).unwrap();
        let weights = v.mapv(|x| hamming_weight(x) as f64);

        let hw = CpaEngine::new(&set, CpaConfig::new(1, 2)).unwrap();
        assert_eq!(hw.compute_h(v.view(), 0).unwrap(), weights);

        let hd = CpaEngine::new(
            &set,
            CpaConfig::new(1, 2).with_model(PowerModel::HammingDistance {
                reference: HdReference::Plaintext,
            }),
        )
        .unwrap();
        let distances = hd.compute_h(v.view(), 0).unwrap();
        assert_ne!(distances, weights);
        // plaintext byte 0 of trace 0 is 11
        assert_eq!(distances[[0, 0]], hamming_weight(v[[0, 0]] ^ 11) as f64);
    }

    #[test]
    fn test_best_guess() {
        let r = array![[0.1, 0.2], [0.9, 0.3], [0.9, 0.4]];
        assert_eq!(best_guess(r.view()), (1, 0, 0.9));
        let empty = Array2::<f64>::zeros((0, 0));
        assert_eq!(best_guess(empty.view()), (0, 0, 0.0));
    }

    #[test]
    fn test_sample_window_offsets_peak() {
        let set = noise_free_set(0x7f, 200);
        let mut config = CpaConfig::new(1, 2);
        config.sample_window = Some((1, 4));
        config.max_traces = Some(150);
        let engine = CpaEngine::new(&set, config).unwrap();
        assert_eq!(engine.num_samples(), 3);
        assert_eq!(engine.num_traces(), 150);

        let guess = engine.attack_byte(0).unwrap();
        assert_eq!(guess.value, 0x7f);
        assert_eq!(guess.sample, 2);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            CpaEngine::new(&TraceSet::new(), CpaConfig::new(1, 1)),
            Err(AnalysisError::InsufficientData(_))
        ));

        let mut no_aux = TraceSet::new();
        no_aux.add_trace(vec![1.0], None, false).unwrap();
        assert!(matches!(
            CpaEngine::new(&no_aux, CpaConfig::new(1, 1)),
            Err(AnalysisError::Shape { .. })
        ));

        let set = noise_free_set(0, 8);
        assert!(matches!(
            CpaEngine::new(&set, CpaConfig::new(4, 4)),
            Err(AnalysisError::Shape { .. })
        ));
        assert!(matches!(
            CpaEngine::new(&set, CpaConfig::new(3, 2)),
            Err(AnalysisError::InvalidParameter(_))
        ));

        let mut config = CpaConfig::new(1, 2);
        config.sample_window = Some((0, 10));
        assert!(CpaEngine::new(&set, config).is_err());

        let engine = CpaEngine::new(&set, CpaConfig::new(1, 2)).unwrap();
        assert!(engine.compute_v(2).is_err());
        assert!(engine.attack_byte(1).is_err());
        let wrong_rows = Array2::<f64>::zeros((3, 256));
        assert!(engine.compute_r(wrong_rows.view()).is_err());
    }

    #[test]
    fn test_cancelled_before_start() {
        let set = noise_free_set(0x01, 16);
        let engine = CpaEngine::new(&set, CpaConfig::new(2, 2)).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        match engine.attack(&crate::progress::NoProgress, &cancel) {
            Err(AnalysisError::Cancelled { completed, total }) => {
                assert_eq!(completed, 0);
                assert_eq!(total, 2);
            }
            other => panic!("expected cancellation, got {:?}", other.map(|a| a.hex())),
        }
    }

    #[test]
    fn test_keep_correlation_matrix() {
        let set = noise_free_set(0x01, 16);
        let mut config = CpaConfig::new(1, 2);
        config.keep_correlation = true;
        config.key_hypotheses = 16;
        let engine = CpaEngine::new(&set, config).unwrap();
        let guess = engine.attack_byte(0).unwrap();
        let r = guess.correlation.unwrap();
        assert_eq!(r.dim(), (16, 4));
        assert_eq!(guess.peaks.len(), 16);
    }
}
