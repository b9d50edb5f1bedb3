//! Outcome of a CPA attack: per-byte guesses, ranking and scoring against a
//! known key.

use crate::cpa::sbox::hamming_distance;
use crate::error::{AnalysisError, Result};
use ndarray::Array2;
use serde::Serialize;

/// Best key hypothesis for one key byte.
#[derive(Clone, Debug, Serialize)]
pub struct ByteGuess {
    /// Index of the attacked key byte
    pub byte_index: usize,

    /// Hypothesis with the highest absolute correlation
    pub value: u8,

    /// Highest absolute correlation over all hypotheses and samples
    pub peak: f64,

    /// Sample index (in the original trace) at which the peak occurs
    pub sample: usize,

    /// Margin between the best and the second best hypothesis peak
    pub confidence: f64,

    /// Highest absolute correlation of each hypothesis
    pub peaks: Vec<f64>,

    /// Full hypotheses x samples correlation matrix, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation: Option<Array2<f64>>,
}

impl ByteGuess {
    /// Rank of hypothesis `value`: 0 for the best guess, 1 for the runner
    /// up and so on. Hypotheses that were not evaluated rank last.
    pub fn rank_of(&self, value: u8) -> usize {
        match self.peaks.get(value as usize) {
            Some(&peak) => self.peaks.iter().filter(|&&p| p > peak).count(),
            None => self.peaks.len(),
        }
    }
}

/// Guesses for all attacked key bytes, ordered by byte index.
#[derive(Clone, Debug, Serialize)]
pub struct CpaAttack {
    pub guesses: Vec<ByteGuess>,

    /// Number of traces the correlation was computed over
    pub traces_used: usize,
}

impl CpaAttack {
    /// The recovered key bytes.
    pub fn key(&self) -> Vec<u8> {
        self.guesses.iter().map(|g| g.value).collect()
    }

    /// Lowercase hex string of the recovered key.
    pub fn hex(&self) -> String {
        hex::encode(self.key())
    }

    /// Percentage of key bits recovered correctly:
    /// `100 * (1 - hamming_distance(key, expected) / (8 * n))`.
    pub fn score(&self, expected: &[u8]) -> Result<f64> {
        if expected.len() != self.guesses.len() {
            return Err(AnalysisError::shape(
                "expected key length",
                self.guesses.len(),
                expected.len(),
            ));
        }
        if expected.is_empty() {
            return Ok(100.0);
        }

        let wrong_bits: usize = self
            .key()
            .iter()
            .zip(expected)
            .map(|(&a, &b)| hamming_distance(a, b) as usize)
            .sum();

        Ok(100.0 * (1.0 - wrong_bits as f64 / (8 * expected.len()) as f64))
    }

    /// Rank of every expected key byte among its byte's hypotheses.
    pub fn ranks(&self, expected: &[u8]) -> Vec<usize> {
        self.guesses
            .iter()
            .zip(expected)
            .map(|(guess, &byte)| guess.rank_of(byte))
            .collect()
    }
}
