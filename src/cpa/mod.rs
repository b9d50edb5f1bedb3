//! Correlation power analysis.
//!
//! - `sbox`: substitution tables and Hamming weight/distance helpers
//! - `model`: power models and the precomputed leakage table
//! - `engine`: the per-byte parallel attack
//! - `result`: guesses, ranks and key scoring
//! - `known_input`: single-hypothesis correlation for known input values

pub mod engine;
pub mod known_input;
pub mod model;
pub mod result;
pub mod sbox;

pub use engine::{best_guess, CpaEngine};
pub use known_input::{input_correlation, known_input_correlation, operation_hypothesis, InputOperation};
pub use model::{HdReference, LeakageTable, PowerModel};
pub use result::{ByteGuess, CpaAttack};
pub use sbox::{hamming_distance, hamming_weight, SBox, SBoxKind, AES_SBOX, HAMMING_WEIGHT};
