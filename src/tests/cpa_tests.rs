use crate::codec::{read_trs_file, write_trs_file};
use crate::config::CpaConfig;
use crate::cpa::{CpaEngine, HdReference, PowerModel, SBox};
use crate::cpa::sbox::hamming_distance;
use crate::error::AnalysisError;
use crate::progress::{CancelToken, NoProgress};
use crate::synthetic::{cpa_trace_set, SyntheticCpaConfig, EXAMPLE_KEY};
use crate::trace::TraceSet;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Mutex;

#[test]
fn test_full_key_recovery_with_progress() {
    let config = SyntheticCpaConfig {
        num_traces: 600,
        noise_std: 0.8,
        seed: 1,
        ..Default::default()
    };
    let set = cpa_trace_set(&config).unwrap();

    let engine = CpaEngine::new(&set, CpaConfig::default().with_threads(4)).unwrap();
    let seen = Mutex::new(Vec::new());
    let progress = |_: &str, done: usize, total: usize| {
        seen.lock().unwrap().push((done, total));
    };

    let attack = engine.attack(&progress, &CancelToken::new()).unwrap();

    assert_eq!(attack.key(), EXAMPLE_KEY.to_vec());
    assert_eq!(attack.hex(), "2b7e151628aed2a6abf7158809cf4f3c");
    assert_eq!(attack.score(&EXAMPLE_KEY).unwrap(), 100.0);
    assert_eq!(attack.ranks(&EXAMPLE_KEY), vec![0; 16]);
    assert_eq!(attack.traces_used, 600);

    for (i, guess) in attack.guesses.iter().enumerate() {
        assert_eq!(guess.byte_index, i);
        assert_eq!(guess.sample, config.leak_position(i));
    }

    let mut seen = seen.into_inner().unwrap();
    seen.sort();
    assert_eq!(seen, (1..=16).map(|d| (d, 16)).collect::<Vec<_>>());
}

#[test]
fn test_key_stored_before_plaintext() {
    let config = SyntheticCpaConfig {
        num_traces: 300,
        key: EXAMPLE_KEY[..2].to_vec(),
        noise_std: 0.3,
        key_in_aux: true,
        seed: 2,
        ..Default::default()
    };
    let set = cpa_trace_set(&config).unwrap();

    let attack = crate::recover_key(&set, CpaConfig::key_then_plaintext(2, 2)).unwrap();
    assert_eq!(attack.key(), vec![0x2b, 0x7e]);

    // Reading the key bytes as if they were plaintext correlates with nothing.
    let wrong = crate::recover_key(&set, CpaConfig::new(2, 2)).unwrap();
    assert!(wrong.guesses[0].peak < attack.guesses[0].peak);
}

#[test]
fn test_hamming_distance_model_recovery() {
    let sbox = SBox::aes();
    let key = 0xc3u8;
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let mut set = TraceSet::new();

    for _ in 0..300 {
        let p: u8 = rng.gen();
        let leak = hamming_distance(sbox.apply(p ^ key), p) as f32;
        let noise: f32 = rng.gen_range(-0.5..0.5);
        set.add_trace(vec![rng.gen_range(-1.0..1.0), leak + noise], Some(vec![p]), false)
            .unwrap();
    }

    let config = CpaConfig::new(1, 1).with_model(PowerModel::HammingDistance {
        reference: HdReference::Plaintext,
    });
    let attack = crate::recover_key(&set, config).unwrap();
    assert_eq!(attack.key(), vec![key]);
    assert_eq!(attack.guesses[0].sample, 1);
}

#[test]
fn test_attack_from_trs_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aes.trs");

    let config = SyntheticCpaConfig {
        num_traces: 250,
        key: EXAMPLE_KEY[..3].to_vec(),
        noise_std: 0.2,
        seed: 3,
        ..Default::default()
    };
    write_trs_file(&cpa_trace_set(&config).unwrap(), &path).unwrap();

    let set = read_trs_file(&path).unwrap();
    let engine = CpaEngine::new(&set, CpaConfig::new(3, 3)).unwrap();
    let attack = engine.attack(&NoProgress, &CancelToken::new()).unwrap();
    assert_eq!(attack.key(), EXAMPLE_KEY[..3].to_vec());
}

#[test]
fn test_cancel_from_progress_callback() {
    let config = SyntheticCpaConfig {
        num_traces: 50,
        seed: 4,
        ..Default::default()
    };
    let set = cpa_trace_set(&config).unwrap();
    let engine = CpaEngine::new(&set, CpaConfig::default().with_threads(1)).unwrap();

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let progress = move |_: &str, done: usize, _: usize| {
        if done == 3 {
            trigger.cancel();
        }
    };

    match engine.attack(&progress, &cancel) {
        Err(AnalysisError::Cancelled { completed, total }) => {
            assert!(completed >= 3);
            assert!(completed < total);
            assert_eq!(total, 16);
        }
        other => panic!("expected cancellation, got {:?}", other.map(|a| a.hex())),
    }
}
