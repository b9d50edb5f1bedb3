//! Cross-module test suites for powertrace.
//!
//! Test Organization:
//! - Codec round trips through files and in-memory buffers
//! - CPA key recovery on synthetic captures
//! - T-test leakage assessment workflows

mod cpa_tests;
mod ttest_tests;
