//! Power models mapping an intermediate value to a hypothetical power
//! consumption.

use crate::cpa::sbox::{hamming_distance, hamming_weight, SBox};
use serde::{Deserialize, Serialize};

/// Value the intermediate is compared against under the Hamming distance
/// model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HdReference {
    /// The plaintext byte the S-box input was derived from
    Plaintext,
    /// A fixed register value
    Constant(u8),
}

impl HdReference {
    #[inline]
    fn value(&self, plaintext: u8) -> u8 {
        match self {
            HdReference::Plaintext => plaintext,
            HdReference::Constant(c) => *c,
        }
    }
}

/// Hypothesised leakage of `V = sbox[plaintext ^ guess]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerModel {
    /// Number of set bits of V
    #[default]
    HammingWeight,
    /// Number of bits flipped between the reference and V
    HammingDistance { reference: HdReference },
}

impl PowerModel {
    /// Leakage of an already substituted intermediate `value`.
    #[inline]
    pub fn leakage(&self, value: u8, plaintext: u8) -> u8 {
        match self {
            PowerModel::HammingWeight => hamming_weight(value),
            PowerModel::HammingDistance { reference } => {
                hamming_distance(value, reference.value(plaintext))
            }
        }
    }

    /// Leakage of the intermediate for one plaintext byte and key guess.
    #[inline]
    pub fn estimate(&self, plaintext: u8, guess: u8, sbox: &SBox) -> u8 {
        self.leakage(sbox.apply(plaintext ^ guess), plaintext)
    }
}

/// Precomputed `estimate(plaintext, guess)` for every byte pair.
///
/// Built once per engine and shared read-only by all attack workers.
#[derive(Clone, Debug)]
pub struct LeakageTable {
    table: Vec<u8>,
}

impl LeakageTable {
    pub fn new(model: PowerModel, sbox: &SBox) -> Self {
        let mut table = Vec::with_capacity(256 * 256);
        for plaintext in 0..=255u8 {
            for guess in 0..=255u8 {
                table.push(model.estimate(plaintext, guess, sbox));
            }
        }
        Self { table }
    }

    #[inline]
    pub fn get(&self, plaintext: u8, guess: u8) -> u8 {
        self.table[((plaintext as usize) << 8) | guess as usize]
    }

    /// Leakage of every guess for one plaintext byte.
    pub fn row(&self, plaintext: u8) -> &[u8] {
        let start = (plaintext as usize) << 8;
        &self.table[start..start + 256]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_weight_model() {
        let sbox = SBox::aes();
        // sbox[0x00] = 0x63 has four bits set
        assert_eq!(PowerModel::HammingWeight.estimate(0x12, 0x12, &sbox), 4);
    }

    #[test]
    fn test_hamming_distance_model() {
        let sbox = SBox::identity();
        let model = PowerModel::HammingDistance {
            reference: HdReference::Plaintext,
        };
        // V = p ^ k, so HD(V, p) = HW(k)
        assert_eq!(model.estimate(0xa5, 0x0f, &sbox), 4);

        let model = PowerModel::HammingDistance {
            reference: HdReference::Constant(0xff),
        };
        assert_eq!(model.estimate(0x00, 0x00, &sbox), 8);
    }

    #[test]
    fn test_table_matches_model() {
        let sbox = SBox::aes();
        let model = PowerModel::HammingDistance {
            reference: HdReference::Plaintext,
        };
        let table = LeakageTable::new(model, &sbox);
        for &(p, k) in &[(0u8, 0u8), (0x3c, 0xa1), (0xff, 0x01), (0x80, 0xfe)] {
            assert_eq!(table.get(p, k), model.estimate(p, k, &sbox));
            assert_eq!(table.row(p)[k as usize], table.get(p, k));
        }
    }
}
