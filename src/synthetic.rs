//! Deterministic synthetic titration data.
//!
//! Used by the `generate_sample` binary and by tests that need realistic
//! instrument files without shipping fixtures.

use std::fmt::Write as _;

/// Minimal deterministic PRNG (xoshiro256**)
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5)).rotate_left(7).wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    pub fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

pub fn gaussian(x: f64, mu: f64, sigma: f64, amplitude: f64) -> f64 {
    amplitude * (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp()
}

/// A Raman band: centre, width (σ) and height, all in cm⁻¹ / counts.
#[derive(Debug, Clone, Copy)]
pub struct Band {
    pub center: f64,
    pub sigma: f64,
    pub height: f64,
}

/// One synthetic spectrum: bands on a slowly curving background plus noise.
#[derive(Debug, Clone)]
pub struct SyntheticSpectrum {
    pub shift: Vec<f64>,
    pub intensity: Vec<f64>,
}

/// Evenly spaced shift axis from `start` to `end` inclusive.
pub fn shift_axis(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![start; n];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + i as f64 * step).collect()
}

/// Bands on a quadratic background `c0 + c1 t + c2 t²` (`t` the shift mapped
/// to `[0, 1]`), with Gaussian noise of `noise` standard deviation.
pub fn spectrum(
    shift: &[f64],
    bands: &[Band],
    background: [f64; 3],
    noise: f64,
    rng: &mut SimpleRng,
) -> SyntheticSpectrum {
    let lo = shift.first().copied().unwrap_or(0.0);
    let hi = shift.last().copied().unwrap_or(1.0);
    let span = if hi > lo { hi - lo } else { 1.0 };
    let intensity = shift
        .iter()
        .map(|&x| {
            let t = (x - lo) / span;
            let bg = background[0] + background[1] * t + background[2] * t * t;
            let signal: f64 = bands
                .iter()
                .map(|b| gaussian(x, b.center, b.sigma, b.height))
                .sum();
            let n = if noise > 0.0 { rng.gauss(0.0, noise) } else { 0.0 };
            bg + signal + n
        })
        .collect();
    SyntheticSpectrum {
        shift: shift.to_vec(),
        intensity,
    }
}

/// Render a spectrum in the instrument's export format: a free-text preamble,
/// a `Pixel;...` header row, `;` separated cells and comma decimals.
pub fn instrument_text(sp: &SyntheticSpectrum, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "File Version;BWSpec4.11_1");
    let _ = writeln!(out, "Title;{title}");
    let _ = writeln!(out, "Acquisition Time (ms);1000");
    let _ = writeln!(out, "Laser Wavelength (nm);532");
    let _ = writeln!(
        out,
        "Pixel;Wavelength;Wavenumber;Raman Shift;Dark;Reference;Raw data #1;Dark Subtracted #1;"
    );
    for (i, (&x, &y)) in sp.shift.iter().zip(&sp.intensity).enumerate() {
        let wavenumber = 1e7 / 532.0 - x;
        let wavelength = 1e7 / wavenumber;
        let line = format!(
            "{i};{wavelength:.4};{wavenumber:.4};{x:.4};1000;0;{:.4};{y:.4};",
            y + 1000.0
        );
        let _ = writeln!(out, "{}", line.replace('.', ","));
    }
    out
}
