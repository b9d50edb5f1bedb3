//! Known-input correlation.
//!
//! When the inputs processed by the device are known, there is no key to
//! guess: a single hypothesis column is built from the per-trace input
//! values (optionally combined with a second input) and correlated against
//! every sample. Peaks show where, and how strongly, the device leaks the
//! Hamming weight of a value or the Hamming distance between two values.

use crate::cpa::engine::{centre_columns, correlate_column};
use crate::cpa::sbox::hamming_weight;
use crate::error::{AnalysisError, Result};
use crate::trace::TraceSet;
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Operation combining two input bytes before taking the Hamming weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputOperation {
    /// The first input alone
    Value,
    /// `a ^ b`; the Hamming weight of the result is the Hamming distance
    Xor,
    And,
    Or,
    /// Wrapping addition
    Add,
    /// Wrapping subtraction
    Sub,
    /// Bitwise complement of the first input
    Not,
}

impl InputOperation {
    pub fn apply(&self, a: u8, b: u8) -> u8 {
        match self {
            InputOperation::Value => a,
            InputOperation::Xor => a ^ b,
            InputOperation::And => a & b,
            InputOperation::Or => a | b,
            InputOperation::Add => a.wrapping_add(b),
            InputOperation::Sub => a.wrapping_sub(b),
            InputOperation::Not => !a,
        }
    }

    /// True if the operation takes a second input.
    pub fn is_binary(&self) -> bool {
        !matches!(self, InputOperation::Value | InputOperation::Not)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "value" | "hw" => InputOperation::Value,
            "xor" | "hd" => InputOperation::Xor,
            "and" => InputOperation::And,
            "or" => InputOperation::Or,
            "add" => InputOperation::Add,
            "sub" => InputOperation::Sub,
            "not" => InputOperation::Not,
            _ => return None,
        })
    }
}

/// Absolute Pearson correlation of one hypothesis value per trace with
/// every sample of `traces` (traces x samples). Constant samples, or a
/// constant hypothesis, give 0.
pub fn input_correlation(traces: ArrayView2<f32>, hypothesis: ArrayView1<f64>) -> Result<Array1<f64>> {
    if traces.nrows() == 0 {
        return Err(AnalysisError::InsufficientData(
            "correlation needs at least one trace".to_string(),
        ));
    }
    if traces.nrows() != hypothesis.len() {
        return Err(AnalysisError::shape("hypothesis length", traces.nrows(), hypothesis.len()));
    }

    let (centred, ss) = centre_columns(traces.mapv(f64::from).view());
    Ok(correlate_column(centred.view(), ss.view(), hypothesis))
}

/// Hypothesis built from input bytes stored in each trace's aux data:
/// the sum over byte positions of `HW(op(aux[lhs], aux[rhs]))`.
///
/// `rhs` is required by binary operations and must span as many bytes as
/// `lhs`.
pub fn operation_hypothesis(
    set: &TraceSet,
    lhs: Range<usize>,
    rhs: Option<Range<usize>>,
    op: InputOperation,
) -> Result<Array1<f64>> {
    let rhs = match (op.is_binary(), rhs) {
        (true, None) => {
            return Err(AnalysisError::InvalidParameter(format!(
                "{:?} needs a second input",
                op
            )))
        }
        (true, Some(rhs)) => {
            if rhs.len() != lhs.len() {
                return Err(AnalysisError::shape("second input length", lhs.len(), rhs.len()));
            }
            Some(rhs)
        }
        (false, _) => None,
    };

    let needed = lhs.end.max(rhs.as_ref().map_or(0, |r| r.end));
    let aux = set.aux_as_2d()?;
    if aux.ncols() < needed {
        return Err(AnalysisError::shape("trace aux data length", needed, aux.ncols()));
    }

    Ok(aux
        .rows()
        .into_iter()
        .map(|row| {
            lhs.clone()
                .enumerate()
                .map(|(i, a)| {
                    let b = rhs.as_ref().map_or(0, |r| row[r.start + i]);
                    hamming_weight(op.apply(row[a], b)) as f64
                })
                .sum::<f64>()
        })
        .collect())
}

/// Correlate the traces of `set` with an input-operation hypothesis.
pub fn known_input_correlation(
    set: &TraceSet,
    lhs: Range<usize>,
    rhs: Option<Range<usize>>,
    op: InputOperation,
) -> Result<Array1<f64>> {
    let hypothesis = operation_hypothesis(set, lhs, rhs, op)?;
    let traces = set.traces_as_2d()?;
    input_correlation(traces.view(), hypothesis.view())
}
