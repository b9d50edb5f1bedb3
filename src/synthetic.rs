//! Seeded synthetic trace generators.
//!
//! Produce trace sets with a known leakage so the engines can be checked
//! end to end without a capture setup: a CPA set leaking the Hamming weight
//! of the first-round AES S-box output, and fixed/random t-test sets with an
//! optional data dependent offset. The same seed always yields the same set.

use crate::cpa::sbox::{hamming_weight, SBox};
use crate::error::{AnalysisError, Result};
use crate::trace::TraceSet;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// AES-128 key from the FIPS-197 example vectors.
pub const EXAMPLE_KEY: [u8; 16] = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];

/// Parameters of a synthetic CPA capture.
#[derive(Clone, Debug)]
pub struct SyntheticCpaConfig {
    pub num_traces: usize,
    pub num_samples: usize,

    /// Key processed by the simulated device
    pub key: Vec<u8>,

    /// Sample at which key byte 0 leaks
    pub leak_sample: usize,

    /// Distance in samples between the leaks of consecutive key bytes
    pub leak_stride: usize,

    /// Standard deviation of the Gaussian noise added to every sample
    pub noise_std: f32,

    /// Store `key || plaintext` in the aux data instead of the plaintext alone
    pub key_in_aux: bool,

    pub seed: u64,
}

impl Default for SyntheticCpaConfig {
    fn default() -> Self {
        Self {
            num_traces: 1000,
            num_samples: 64,
            key: EXAMPLE_KEY.to_vec(),
            leak_sample: 8,
            leak_stride: 2,
            noise_std: 1.0,
            key_in_aux: false,
            seed: 0,
        }
    }
}

impl SyntheticCpaConfig {
    /// Sample index at which key byte `byte` leaks.
    pub fn leak_position(&self, byte: usize) -> usize {
        self.leak_sample + byte * self.leak_stride
    }
}

/// Generate a trace set whose sample `leak_position(i)` carries
/// `HW(sbox[plaintext[i] ^ key[i]])` on top of Gaussian noise.
pub fn cpa_trace_set(config: &SyntheticCpaConfig) -> Result<TraceSet> {
    if config.key.is_empty() {
        return Err(AnalysisError::InvalidParameter(
            "synthetic key is empty".to_string(),
        ));
    }
    let last_leak = config.leak_position(config.key.len() - 1);
    if last_leak >= config.num_samples {
        return Err(AnalysisError::InvalidParameter(format!(
            "leak at sample {} does not fit {} samples",
            last_leak, config.num_samples
        )));
    }

    let noise = normal(config.noise_std)?;
    let sbox = SBox::aes();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut set = TraceSet::with_description(format!(
        "synthetic CPA, {} key bytes, noise {}",
        config.key.len(),
        config.noise_std
    ));

    for _ in 0..config.num_traces {
        let plaintext: Vec<u8> = (0..config.key.len()).map(|_| rng.gen()).collect();

        let mut trace: Vec<f32> = (0..config.num_samples).map(|_| noise.sample(&mut rng)).collect();
        for (i, (&p, &k)) in plaintext.iter().zip(&config.key).enumerate() {
            trace[config.leak_position(i)] += hamming_weight(sbox.apply(p ^ k)) as f32;
        }

        let aux = if config.key_in_aux {
            let mut aux = config.key.clone();
            aux.extend_from_slice(&plaintext);
            aux
        } else {
            plaintext
        };

        set.add_trace(trace, Some(aux), false)?;
    }

    log::debug!("Generated {} synthetic CPA traces", config.num_traces);
    Ok(set)
}

/// Parameters of a synthetic fixed-vs-random capture.
#[derive(Clone, Debug)]
pub struct SyntheticTTestConfig {
    pub traces_per_set: usize,
    pub num_samples: usize,

    /// Sample at which the fixed set differs from the random set
    pub leak_sample: Option<usize>,

    /// Mean offset of the fixed set at the leaking sample
    pub leak_amplitude: f32,

    pub noise_std: f32,
    pub seed: u64,
}

impl Default for SyntheticTTestConfig {
    fn default() -> Self {
        Self {
            traces_per_set: 500,
            num_samples: 50,
            leak_sample: None,
            leak_amplitude: 1.0,
            noise_std: 1.0,
            seed: 0,
        }
    }
}

/// Generate `(fixed, random)` Gaussian trace sets.
pub fn ttest_trace_sets(config: &SyntheticTTestConfig) -> Result<(TraceSet, TraceSet)> {
    if let Some(leak) = config.leak_sample {
        if leak >= config.num_samples {
            return Err(AnalysisError::InvalidParameter(format!(
                "leak at sample {} does not fit {} samples",
                leak, config.num_samples
            )));
        }
    }

    let noise = normal(config.noise_std)?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut fixed = TraceSet::with_description("synthetic fixed");
    let mut random = TraceSet::with_description("synthetic random");

    for _ in 0..config.traces_per_set {
        let mut trace: Vec<f32> = (0..config.num_samples).map(|_| noise.sample(&mut rng)).collect();
        if let Some(leak) = config.leak_sample {
            trace[leak] += config.leak_amplitude;
        }
        fixed.add_trace(trace, None, false)?;

        let trace: Vec<f32> = (0..config.num_samples).map(|_| noise.sample(&mut rng)).collect();
        random.add_trace(trace, None, false)?;
    }

    Ok((fixed, random))
}

fn normal(std_dev: f32) -> Result<Normal<f32>> {
    Normal::new(0.0, std_dev).map_err(|e| {
        AnalysisError::InvalidParameter(format!("invalid noise deviation {}: {}", std_dev, e))
    })
}
