use super::Analyser;
use crate::media::MediaTrack;
use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::TAU;
use std::sync::Arc;

pub const DEFAULT_SMOOTHING: f64 = 0.8;
pub const MIN_DECIBELS: f64 = -100.0;
pub const MAX_DECIBELS: f64 = -30.0;
pub const MIN_FFT_SIZE: usize = 32;

/// Byte spectrum of an audio track, scaled the way browser analysers do:
/// Blackman window, smoothed magnitudes, dB range mapped onto 0..=255.
pub struct SpectrumAnalyser {
    track: Arc<MediaTrack>,
    fft_size: usize,
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    samples: Vec<f32>,
    buffer: Vec<Complex64>,
    scratch: Vec<Complex64>,
    smoothed: Vec<f64>,
    smoothing: f64,
}

impl SpectrumAnalyser {
    /// `fft_size` is raised to [`MIN_FFT_SIZE`] when smaller.
    pub fn new(track: Arc<MediaTrack>, fft_size: usize) -> Self {
        let fft_size = fft_size.max(MIN_FFT_SIZE);
        let n = fft_size as f64;
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f64 / n;
                0.42 - 0.5 * (TAU * x).cos() + 0.08 * (2.0 * TAU * x).cos()
            })
            .collect();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch = vec![Complex64::default(); fft.get_inplace_scratch_len()];
        Self {
            track,
            fft_size,
            fft,
            window,
            samples: vec![0.0; fft_size],
            buffer: vec![Complex64::default(); fft_size],
            scratch,
            smoothed: vec![0.0; fft_size / 2],
            smoothing: DEFAULT_SMOOTHING,
        }
    }

    pub fn with_smoothing(mut self, smoothing: f64) -> Self {
        self.smoothing = smoothing.clamp(0.0, 1.0);
        self
    }

    fn update_spectrum(&mut self) {
        self.track.read_samples(&mut self.samples);
        for ((slot, sample), w) in self.buffer.iter_mut().zip(&self.samples).zip(&self.window) {
            *slot = Complex64::new(*sample as f64 * w, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        // only the bins below Nyquist
        let n = self.fft_size as f64;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(&self.buffer) {
            let magnitude = bin.norm() / n;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
        }
    }
}

fn to_byte(magnitude: f64) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 / (MAX_DECIBELS - MIN_DECIBELS) * (db - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}

impl Analyser for SpectrumAnalyser {
    fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    fn frequency_data(&mut self, out: &mut [u8]) {
        self.update_spectrum();
        for (dst, magnitude) in out.iter_mut().zip(&self.smoothed) {
            *dst = to_byte(*magnitude);
        }
    }
}
