//! Per-trace signal transforms used by the trace set's destructive
//! pre-processing operations.

use crate::trace::Trace;

/// One dimensional convolution returning an output of the same length as
/// `signal`.
///
/// The full convolution has `N + M - 1` points; the returned window starts
/// at offset `(M - 1) / 2`, which centres the kernel on each input sample
/// the same way NumPy's `convolve(..., 'same')` does. Samples outside the
/// signal are treated as zero.
pub fn convolve_same(signal: &[f32], kernel: &[f32]) -> Trace {
    let n = signal.len();
    let m = kernel.len();

    if n == 0 || m == 0 {
        return vec![0.0; n];
    }

    let offset = (m - 1) / 2;

    (0..n)
        .map(|i| {
            // Index into the full convolution.
            let k = i + offset;
            let lo = k.saturating_sub(n - 1);
            let hi = k.min(m - 1);

            let mut acc = 0.0f64;
            for j in lo..=hi {
                acc += signal[k - j] as f64 * kernel[j] as f64;
            }
            acc as f32
        })
        .collect()
}

/// Resample `original` to `target_len` points by linear interpolation over
/// an evenly spaced index grid spanning the first to the last sample.
pub fn resample_linear(original: &[f32], target_len: usize) -> Trace {
    let len = original.len();

    if len == 0 || target_len == 0 {
        return Vec::new();
    }

    let step = if target_len > 1 {
        (len - 1) as f64 / (target_len - 1) as f64
    } else {
        0.0
    };

    (0..target_len)
        .map(|i| {
            let position = i as f64 * step;
            let floor = (position as usize).min(len - 1);
            let remainder = position - floor as f64;
            // The ceiling wraps at the end; its weight is zero there.
            let ceil = (floor + 1) % len;

            let low = original[floor] as f64;
            let high = original[ceil] as f64;
            (low * (1.0 - remainder) + high * remainder) as f32
        })
        .collect()
}
