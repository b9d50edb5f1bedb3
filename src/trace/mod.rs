//! Trace data model: individual traces, their auxiliary data, and the
//! trace set that groups them for bulk processing and analysis.

pub mod set;
pub mod transform;

pub use set::{TraceSet, DEFAULT_DESCRIPTION};
pub use transform::{convolve_same, resample_linear};

/// One measurement window of power or EM samples.
pub type Trace = Vec<f32>;

/// Bytes associated with a trace, typically the plaintext or key that was
/// processed while it was recorded.
pub type AuxData = Vec<u8>;
