pub mod codec;
pub mod config;
pub mod cpa;
pub mod error;
pub mod progress;
pub mod synthetic;
pub mod trace;
pub mod ttest;

pub use codec::{
    read_trs_file, read_trs_header_file, write_trs, write_trs_file, RecordLayout, Sample,
    SampleType, StreamReader, StreamWriter, TrsHeader, TrsReader,
};
pub use config::{AnalysisConfig, CpaConfig, TTestConfig, DEFAULT_CRITICAL_VALUE};
pub use cpa::{
    best_guess, input_correlation, known_input_correlation, ByteGuess, CpaAttack, CpaEngine,
    HdReference, InputOperation, PowerModel, SBox, SBoxKind,
};
pub use error::{AnalysisError, Result};
pub use progress::{progress_bar, CancelToken, NoProgress, ProgressSink};
pub use trace::{AuxData, Trace, TraceSet};
pub use ttest::{IncrementalTTest, TTestOrder, TTestVerdict, WelchTTest};

use ndarray::Array1;

/// Run Welch's t-test between two trace sets and return the signed
/// t-trace.
pub fn welch_ttest(fixed: &TraceSet, random: &TraceSet, order: TTestOrder) -> Result<Array1<f64>> {
    Ok(WelchTTest::new(fixed, random, order)?.ttrace().clone())
}

/// Run Welch's t-test and evaluate it against the configured critical
/// value.
pub fn assess_leakage(
    fixed: &TraceSet,
    random: &TraceSet,
    config: &TTestConfig,
) -> Result<TTestVerdict> {
    config.validate()?;
    let test = WelchTTest::new(fixed, random, config.order)?;
    let verdict = test.evaluate(config.critical_value);

    if verdict.passed {
        log::info!(
            "No leakage detected (|t| < {} over {} samples)",
            config.critical_value,
            test.ttrace().len()
        );
    } else {
        log::info!(
            "Leakage detected at {} samples (max t = {:.2}, min t = {:.2})",
            verdict.leaking_samples.len(),
            verdict.max_t,
            verdict.min_t
        );
    }

    Ok(verdict)
}

/// Recover a key from a trace set with a CPA attack, running every key
/// byte to completion.
pub fn recover_key(set: &TraceSet, config: CpaConfig) -> Result<CpaAttack> {
    let engine = CpaEngine::new(set, config)?;
    engine.attack(&NoProgress, &CancelToken::new())
}

#[cfg(test)]
mod tests;
