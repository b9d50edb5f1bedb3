use crate::codec::{RecordLayout, StreamReader, StreamWriter};
use crate::config::TTestConfig;
use crate::synthetic::{ttest_trace_sets, SyntheticTTestConfig};
use crate::trace::TraceSet;
use crate::ttest::{IncrementalTTest, TTestOrder, WelchTTest};
use std::io::Cursor;

#[test]
fn test_assess_null_case() {
    let (fixed, random) = ttest_trace_sets(&SyntheticTTestConfig {
        seed: 21,
        ..Default::default()
    })
    .unwrap();

    let verdict = crate::assess_leakage(&fixed, &random, &TTestConfig::default()).unwrap();
    assert!(verdict.passed);
    assert!(verdict.max_t < 4.5 && verdict.min_t > -4.5);
}

#[test]
fn test_assess_detects_leak() {
    let (fixed, random) = ttest_trace_sets(&SyntheticTTestConfig {
        leak_sample: Some(17),
        seed: 22,
        ..Default::default()
    })
    .unwrap();

    let verdict = crate::assess_leakage(&fixed, &random, &TTestConfig::default()).unwrap();
    assert!(!verdict.passed);
    assert!(verdict.leaking_samples.contains(&17));
}

#[test]
fn test_mask_partitioned_capture() {
    let (fixed, random) = ttest_trace_sets(&SyntheticTTestConfig {
        traces_per_set: 200,
        leak_sample: Some(4),
        seed: 23,
        ..Default::default()
    })
    .unwrap();

    // Interleave both populations into one capture, as a single acquisition
    // run that alternates between fixed and random inputs would record.
    let mut capture = TraceSet::new();
    let mut mask = Vec::new();
    for (f, r) in fixed.traces().iter().zip(random.traces()) {
        capture.add_trace(f.clone(), None, false).unwrap();
        mask.push(true);
        capture.add_trace(r.clone(), None, false).unwrap();
        mask.push(false);
    }

    let (fixed_part, random_part) = capture.partition(&mask).unwrap();
    let direct = WelchTTest::new(&fixed, &random, TTestOrder::First).unwrap();
    let split = WelchTTest::new(&fixed_part, &random_part, TTestOrder::First).unwrap();
    assert_eq!(direct.ttrace(), split.ttrace());
}

#[test]
fn test_second_order_on_trace_sets() {
    let mut fixed = TraceSet::new();
    let mut random = TraceSet::new();
    for &(f, r) in &[(1.0f32, -1.0f32), (3.0, -3.0)] {
        fixed.add_trace(vec![f, f + 1.0], None, false).unwrap();
        random.add_trace(vec![r, r], None, false).unwrap();
    }

    let t = crate::welch_ttest(&fixed, &random, TTestOrder::Second).unwrap();
    // Means (2, 3) vs (-2, -2): squared means (4, 9) vs (4, 4).
    assert_eq!(t[0], 0.0);
    assert!((t[1] - 5.0).abs() < 1e-12);
}

#[test]
fn test_incremental_over_stream() {
    let (fixed, random) = ttest_trace_sets(&SyntheticTTestConfig {
        traces_per_set: 100,
        num_samples: 20,
        leak_sample: Some(5),
        leak_amplitude: 2.0,
        seed: 24,
        ..Default::default()
    })
    .unwrap();

    // Fixed traces are tagged with aux byte 1, random traces with 0.
    let mut writer = StreamWriter::<_, f32>::new(Vec::new(), RecordLayout::WithAux);
    for (f, r) in fixed.traces().iter().zip(random.traces()) {
        writer.write_trace(f, Some(&[1][..])).unwrap();
        writer.write_trace(r, Some(&[0][..])).unwrap();
    }
    let bytes = writer.finish().unwrap();

    let mut reader = StreamReader::new(Cursor::new(bytes), RecordLayout::WithAux).unwrap();
    let mut incremental = IncrementalTTest::new(TTestOrder::First);
    while let Some((trace, aux)) = reader.next_record().unwrap() {
        match aux.as_deref() {
            Some([1]) => incremental.add_fixed(&trace).unwrap(),
            _ => incremental.add_random(&trace).unwrap(),
        }
    }

    let batch = WelchTTest::new(&fixed, &random, TTestOrder::First).unwrap();
    let running = incremental.ttrace().unwrap();
    for (a, b) in running.iter().zip(batch.ttrace().iter()) {
        assert!((a - b).abs() < 1e-6);
    }

    assert_eq!(incremental.counts(), (100, 100));
    assert_eq!(incremental.n_over_time().len(), 199);
    assert!(*incremental.t_over_time().last().unwrap() > 4.5);
    assert!(!incremental.evaluate(4.5).unwrap().passed);
}
