#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use candle_transformers::models::whisper::{N_FFT, SAMPLE_RATE};

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Slaney normalised mel filter bank Whisper was trained with.
///
/// Laid out row major as `[n_mels][N_FFT / 2 + 1]`, the shape `pcm_to_mel` expects.
pub fn mel_filters(n_mels: usize) -> Vec<f32> {
    let n_freqs = N_FFT / 2 + 1;
    let sample_rate = SAMPLE_RATE as f64;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| i as f64 * sample_rate / N_FFT as f64)
        .collect();

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate / 2.0);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for (m, edges) in mel_points.windows(3).enumerate() {
        let (lower_edge, center, upper_edge) = (edges[0], edges[1], edges[2]);
        let enorm = 2.0 / (upper_edge - lower_edge);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower_edge) / (center - lower_edge);
            let falling = (upper_edge - freq) / (upper_edge - center);
            filters[m * n_freqs + k] = (rising.min(falling).max(0.0) * enorm) as f32;
        }
    }
    filters
}
