//! Analysis configuration for the powertrace toolkit.
//! Every engine reads its tunables from these plain structures. They carry
//! sensible defaults (the TVLA critical value, a full AES-128 byte-wise
//! attack) and can be loaded from a JSON file so that command-line runs
//! are reproducible.

use crate::cpa::{PowerModel, SBoxKind};
use crate::error::{AnalysisError, Result};
use crate::ttest::TTestOrder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Critical value commonly used for TVLA leakage assessment.
pub const DEFAULT_CRITICAL_VALUE: f64 = 4.5;

/// Top level configuration grouping the settings of both engines.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Settings for Welch's t-test leakage detection
    pub ttest: TTestConfig,

    /// Settings for correlation power analysis
    pub cpa: CpaConfig,
}

impl AnalysisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file. Missing fields take their
    /// default values; the result is validated before it is returned.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| AnalysisError::file_io(path, e))?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        log::debug!("Loaded analysis configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.ttest.validate()?;
        self.cpa.validate()
    }
}

/// Welch's t-test parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TTestConfig {
    /// Absolute t-statistic above which a sample is reported as leaking
    pub critical_value: f64,

    /// First order compares means, second order compares squared means
    pub order: TTestOrder,
}

impl Default for TTestConfig {
    fn default() -> Self {
        Self {
            critical_value: DEFAULT_CRITICAL_VALUE,
            order: TTestOrder::First,
        }
    }
}

impl TTestConfig {
    pub fn second_order() -> Self {
        Self {
            order: TTestOrder::Second,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.critical_value.is_finite() || self.critical_value <= 0.0 {
            return Err(AnalysisError::InvalidParameter(format!(
                "critical value must be a positive number, got {}",
                self.critical_value
            )));
        }
        Ok(())
    }
}

/// Correlation power analysis parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpaConfig {
    /// Number of key hypotheses per byte (at most 256)
    pub key_hypotheses: usize,

    /// Number of key bytes to recover, starting at message byte 0
    pub key_bytes: usize,

    /// Number of plaintext bytes stored with each trace
    pub message_bytes: usize,

    /// Offset of the plaintext inside each trace's auxiliary data
    pub plaintext_offset: usize,

    /// Substitution applied to `plaintext ^ guess`
    pub sbox: SBoxKind,

    /// Hypothesised power consumption of the intermediate value
    pub model: PowerModel,

    /// Half-open `[start, end)` sample window to correlate against
    pub sample_window: Option<(usize, usize)>,

    /// Use at most this many traces, taken from the front of the set
    pub max_traces: Option<usize>,

    /// Worker threads for the attack pool; `None` uses rayon's default
    pub threads: Option<usize>,

    /// Keep the full K x L correlation matrix of every byte in the result
    pub keep_correlation: bool,
}

impl Default for CpaConfig {
    fn default() -> Self {
        Self {
            key_hypotheses: 256,
            key_bytes: 16,
            message_bytes: 16,
            plaintext_offset: 0,
            sbox: SBoxKind::Aes,
            model: PowerModel::HammingWeight,
            sample_window: None,
            max_traces: None,
            threads: None,
            keep_correlation: false,
        }
    }
}

impl CpaConfig {
    /// Configuration for recovering `key_bytes` key bytes from traces
    /// whose auxiliary data holds a `message_bytes` plaintext.
    pub fn new(key_bytes: usize, message_bytes: usize) -> Self {
        Self {
            key_bytes,
            message_bytes,
            ..Self::default()
        }
    }

    /// Aux data layout where the key precedes the plaintext, as written by
    /// capture flows that store `key || plaintext` with every trace.
    pub fn key_then_plaintext(key_bytes: usize, message_bytes: usize) -> Self {
        Self {
            plaintext_offset: key_bytes,
            ..Self::new(key_bytes, message_bytes)
        }
    }

    pub fn with_model(mut self, model: PowerModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Minimum auxiliary data length each trace must provide.
    pub fn required_aux_len(&self) -> usize {
        self.plaintext_offset + self.message_bytes
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_hypotheses == 0 || self.key_hypotheses > 256 {
            return Err(AnalysisError::InvalidParameter(format!(
                "key hypotheses must be in 1..=256, got {}",
                self.key_hypotheses
            )));
        }

        if self.key_bytes == 0 {
            return Err(AnalysisError::InvalidParameter(
                "at least one key byte must be attacked".to_string(),
            ));
        }

        if self.key_bytes > self.message_bytes {
            return Err(AnalysisError::InvalidParameter(format!(
                "cannot attack {} key bytes with {} message bytes",
                self.key_bytes, self.message_bytes
            )));
        }

        if let Some((start, end)) = self.sample_window {
            if start >= end {
                return Err(AnalysisError::InvalidParameter(format!(
                    "empty sample window [{}, {})",
                    start, end
                )));
            }
        }

        if self.max_traces == Some(0) {
            return Err(AnalysisError::InvalidParameter(
                "max_traces must be at least 1".to_string(),
            ));
        }

        if self.threads == Some(0) {
            return Err(AnalysisError::InvalidParameter(
                "thread count must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpa::HdReference;
    use std::io::Write;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ttest.critical_value, 4.5);
        assert_eq!(config.cpa.key_hypotheses, 256);
        assert_eq!(config.cpa.required_aux_len(), 16);
    }

    #[test]
    fn test_key_then_plaintext_layout() {
        let config = CpaConfig::key_then_plaintext(16, 16);
        assert_eq!(config.plaintext_offset, 16);
        assert_eq!(config.required_aux_len(), 32);
    }

    #[test]
    fn test_invalid_cpa_parameters_rejected() {
        let mut config = CpaConfig::default();
        config.key_hypotheses = 257;
        assert!(matches!(config.validate(), Err(AnalysisError::InvalidParameter(_))));

        let mut config = CpaConfig::new(4, 2);
        assert!(config.validate().is_err());
        config.message_bytes = 4;
        assert!(config.validate().is_ok());

        config.sample_window = Some((10, 10));
        assert!(config.validate().is_err());

        let config = CpaConfig::default().with_threads(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_critical_value_rejected() {
        let mut config = TTestConfig::default();
        config.critical_value = -1.0;
        assert!(config.validate().is_err());
        config.critical_value = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "ttest": {{ "critical_value": 5.0 }}, "cpa": {{ "key_bytes": 2, "model": {{ "HammingDistance": {{ "reference": "Plaintext" }} }} }} }}"#
        )
        .unwrap();

        let config = AnalysisConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.ttest.critical_value, 5.0);
        assert_eq!(config.ttest.order, TTestOrder::First);
        assert_eq!(config.cpa.key_bytes, 2);
        assert_eq!(config.cpa.message_bytes, 16);
        assert_eq!(
            config.cpa.model,
            PowerModel::HammingDistance {
                reference: HdReference::Plaintext
            }
        );
    }

    #[test]
    fn test_missing_config_file_reports_path() {
        let err = AnalysisConfig::from_json_file("/nonexistent/powertrace.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/powertrace.json"));
    }
}
