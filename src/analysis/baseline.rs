use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Default polynomial order of the baseline.
pub const DEFAULT_POLY_ORDER: usize = 5;

const MAX_ITERATIONS: usize = 250;
/// Relative change between successive baselines below which fitting stops.
const TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("{points} point(s) cannot fit a polynomial of order {order}")]
    TooFewPoints { points: usize, order: usize },
    #[error("shift has {shift} values but intensity has {intensity}")]
    LengthMismatch { shift: usize, intensity: usize },
    #[error("shift axis spans a single value")]
    DegenerateAxis,
    #[error("non-finite value in input or fitted baseline")]
    NonFinite,
    #[error("polynomial solve failed: {0}")]
    Solver(&'static str),
}

/// Baseline estimate for one spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    /// Baseline value at every input point.
    pub values: Vec<f64>,
    /// `intensity - values`.
    pub corrected: Vec<f64>,
    /// The fit failed; `values` is all zero and `corrected` is the input.
    pub fallback: bool,
    pub iterations: usize,
}

/// Estimate and subtract a polynomial baseline.
///
/// Never fails: when the fit cannot be computed (too few points for
/// `poly_order`, mismatched lengths, a flat shift axis, non-finite data) the
/// result is a zero baseline and `corrected == intensity`.
pub fn correct(shift: &[f64], intensity: &[f64], poly_order: usize) -> Baseline {
    match modpoly(shift, intensity, poly_order) {
        Ok((values, iterations)) => {
            let corrected = intensity.iter().zip(&values).map(|(y, b)| y - b).collect();
            Baseline {
                values,
                corrected,
                fallback: false,
                iterations,
            }
        }
        Err(err) => {
            warn!("baseline fit failed ({err}), using zero baseline");
            Baseline {
                values: vec![0.0; intensity.len()],
                corrected: intensity.to_vec(),
                fallback: true,
                iterations: 0,
            }
        }
    }
}

/// Modified polynomial fit.
///
/// Fit a least-squares polynomial, clip the signal to `min(signal, fit)` and
/// refit, until the fit changes by less than [`TOLERANCE`] (relative L2) or
/// [`MAX_ITERATIONS`] is reached. Points above the curve are pulled down at
/// every pass while points below keep their value, so the fit settles onto
/// the lower envelope of the spectrum. The clipped signal only ever
/// decreases, which bounds the iteration.
///
/// The shift axis is mapped onto `[-1, 1]` before building the Vandermonde
/// matrix to keep it well conditioned.
pub fn modpoly(
    shift: &[f64],
    intensity: &[f64],
    poly_order: usize,
) -> Result<(Vec<f64>, usize), BaselineError> {
    let n = shift.len();
    if n != intensity.len() {
        return Err(BaselineError::LengthMismatch {
            shift: n,
            intensity: intensity.len(),
        });
    }
    if n < poly_order + 1 {
        return Err(BaselineError::TooFewPoints {
            points: n,
            order: poly_order,
        });
    }
    if shift.iter().chain(intensity).any(|v| !v.is_finite()) {
        return Err(BaselineError::NonFinite);
    }

    let (x_min, x_max) = shift
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &x| {
            (min.min(x), max.max(x))
        });
    if x_max <= x_min {
        return Err(BaselineError::DegenerateAxis);
    }
    let half_span = 0.5 * (x_max - x_min);
    let mid = 0.5 * (x_max + x_min);

    let vander = DMatrix::from_fn(n, poly_order + 1, |i, j| {
        ((shift[i] - mid) / half_span).powi(j as i32)
    });
    let pinv = vander
        .clone()
        .pseudo_inverse(1e-12)
        .map_err(BaselineError::Solver)?;

    let mut y = DVector::from_column_slice(intensity);
    let mut baseline = &vander * (&pinv * &y);
    let mut iterations = 0;

    for i in 1..=MAX_ITERATIONS {
        y = y.zip_map(&baseline, f64::min);
        let next = &vander * (&pinv * &y);
        let change = (&next - &baseline).norm() / baseline.norm().max(f64::MIN_POSITIVE);
        baseline = next;
        iterations = i;
        if change < TOLERANCE {
            break;
        }
    }
    debug!("modpoly order {poly_order}: {iterations} iteration(s) over {n} points");

    if baseline.iter().any(|v| !v.is_finite()) {
        return Err(BaselineError::NonFinite);
    }
    Ok((baseline.iter().copied().collect(), iterations))
}
