//! Trace persistence.
//!
//! Two on-disk formats are supported:
//! - `trs`: the tagged-header container used by common trace acquisition
//!   tools, with a fixed number of equally sized f32 traces.
//! - `stream`: an append-only record stream for captures of unknown length,
//!   written one trace at a time while the acquisition is running.

pub mod stream;
pub mod trs;

pub use stream::{RecordLayout, Sample, SampleType, StreamReader, StreamWriter};
pub use trs::{
    read_trs_file, read_trs_header_file, write_trs, write_trs_file, TrsHeader, TrsReader,
    CODING_F32,
};
