use levenberg_marquardt::{LevenbergMarquardt, TerminationReason};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use varpro::model::builder::SeparableModelBuilder;
use varpro::problem::SeparableProblemBuilder;
use varpro::solvers::levmar::LevMarSolver;
use varpro::statistics::FitStatistics;

use super::peaks::RatioSeries;
use crate::config::FitSettings;
use crate::error::{Error, Result};

/// Fewest finite points a fit accepts; the model has four parameters.
pub const MIN_POINTS: usize = 5;

/// Fewest distinct titrant amounts that pin down four parameters.
pub const MIN_DISTINCT_X: usize = 4;

/// Starting steepness in normalised units (the axis spans 1).
const INITIAL_STEEPNESS: f64 = 10.0;

/// `1 / (1 + exp(-z))` without overflow for large `|z|`.
fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// `a + b / (1 + exp(-k (x - x_eq)))`
pub fn logistic(x: f64, a: f64, b: f64, k: f64, x_eq: f64) -> f64 {
    a + b * sigmoid(k * (x - x_eq))
}

/// A fitted titration curve `y = a + b / (1 + exp(-k (x - x_eq)))` in the
/// units of the data it was fitted to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmoidFit {
    pub a: f64,
    pub b: f64,
    pub k: f64,
    /// Equivalence point: the inflection of the curve.
    pub x_eq: f64,
    /// Parameter covariance in `[a, b, k, x_eq]` order; `None` when it could
    /// not be estimated.
    pub covariance: Option<[[f64; 4]; 4]>,
    /// Ratio column the fit belongs to, when fitted from a series.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<String>,
    pub n_points: usize,
    /// Model evaluations the solver spent.
    pub evaluations: usize,
}

impl SigmoidFit {
    pub fn evaluate(&self, x: f64) -> f64 {
        logistic(x, self.a, self.b, self.k, self.x_eq)
    }

    /// One standard deviation of each parameter.
    pub fn std_errors(&self) -> Option<[f64; 4]> {
        let cov = self.covariance?;
        Some([0, 1, 2, 3].map(|i| cov[i][i].max(0.0).sqrt()))
    }

    pub fn x_eq_uncertainty(&self) -> Option<f64> {
        self.std_errors().map(|s| s[3])
    }

    /// `n` evenly spaced points of the curve over `[x_min, x_max]`.
    pub fn curve(&self, x_min: f64, x_max: f64, n: usize) -> Vec<(f64, f64)> {
        match n {
            0 => Vec::new(),
            1 => vec![(x_min, self.evaluate(x_min))],
            _ => {
                let step = (x_max - x_min) / (n - 1) as f64;
                (0..n)
                    .map(|i| {
                        let x = x_min + i as f64 * step;
                        (x, self.evaluate(x))
                    })
                    .collect()
            }
        }
    }
}

/// Affine map of the titrant axis onto roughly `[-0.5, 0.5]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisScale {
    pub center: f64,
    pub scale: f64,
}

impl AxisScale {
    pub fn from_data(x: &[f64]) -> Self {
        let (lo, hi) = x
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let span = hi - lo;
        let scale = if span.is_finite() && span > 0.0 { span } else { 1.0 };
        let center = if lo.is_finite() && hi.is_finite() {
            0.5 * (lo + hi)
        } else {
            0.0
        };
        Self { center, scale }
    }

    pub fn normalize(&self, x: f64) -> f64 {
        (x - self.center) / self.scale
    }

    pub fn denormalize(&self, u: f64) -> f64 {
        self.center + self.scale * u
    }
}

/// Rising basis `s(k (u - u_eq))` of the separable model; `a` and `b` are
/// its linear coefficients.
fn sigmoid_basis(u: &DVector<f64>, k: f64, u_eq: f64) -> DVector<f64> {
    u.map(|u| sigmoid(k * (u - u_eq)))
}

fn sigmoid_basis_dk(u: &DVector<f64>, k: f64, u_eq: f64) -> DVector<f64> {
    u.map(|u| {
        let s = sigmoid(k * (u - u_eq));
        s * (1.0 - s) * (u - u_eq)
    })
}

fn sigmoid_basis_du_eq(u: &DVector<f64>, k: f64, u_eq: f64) -> DVector<f64> {
    u.map(|u| {
        let s = sigmoid(k * (u - u_eq));
        -k * s * (1.0 - s)
    })
}

/// Starting `[k, u_eq]` in normalised units: a steepness whose sign follows
/// the trend and the point nearest the half-way level. The levels `a` and `b`
/// are linear and need no start.
fn initial_guess(u: &[f64], y: &[f64]) -> [f64; 2] {
    let (lo, hi) = y
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let mid = 0.5 * (lo + hi);

    let k = if pearson(u, y) < 0.0 {
        -INITIAL_STEEPNESS
    } else {
        INITIAL_STEEPNESS
    };
    let u_eq = u
        .iter()
        .zip(y)
        .min_by(|a, b| (a.1 - mid).abs().total_cmp(&(b.1 - mid).abs()))
        .map(|(&u, _)| u)
        .unwrap_or(0.0);

    [k, u_eq]
}

/// Pearson correlation; NaN when either variable is constant.
fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (&a, &b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    sxy / (sxx * syy).sqrt()
}

/// Fits titration curves and reports the equivalence point.
#[derive(Debug, Clone, Copy, Default)]
pub struct EquivalenceFitter {
    settings: FitSettings,
}

impl EquivalenceFitter {
    pub fn new(settings: &FitSettings) -> Self {
        Self { settings: *settings }
    }

    fn levenberg_marquardt(&self) -> LevenbergMarquardt<f64> {
        let s = &self.settings;
        // The builder panics on negative tolerances and a zero budget.
        LevenbergMarquardt::new()
            .with_ftol(s.ftol.max(0.0))
            .with_xtol(s.xtol.max(0.0))
            .with_gtol(s.gtol.max(0.0))
            .with_patience(s.patience.max(1))
    }

    /// Fit `y = a + b / (1 + exp(-k (x - x_eq)))`.
    ///
    /// Pairs with a non-finite coordinate are ignored. The curve is fitted as
    /// a separable model on the titrant axis mapped by [`AxisScale`]: `k` and
    /// `x_eq` are nonlinear, `a` and `b` are the coefficients of a constant
    /// and a sigmoid basis. `k`, `x_eq` and the covariance are returned in
    /// the original units.
    pub fn fit(&self, x: &[f64], y: &[f64]) -> Result<SigmoidFit> {
        let (x, y): (Vec<f64>, Vec<f64>) = x
            .iter()
            .zip(y)
            .filter(|(a, b)| a.is_finite() && b.is_finite())
            .map(|(&a, &b)| (a, b))
            .unzip();

        if x.len() < MIN_POINTS {
            return Err(Error::InsufficientData(format!(
                "{} finite point(s), at least {MIN_POINTS} required",
                x.len()
            )));
        }
        let mut distinct = x.clone();
        distinct.sort_by(f64::total_cmp);
        distinct.dedup();
        if distinct.len() < MIN_DISTINCT_X {
            return Err(Error::InsufficientData(format!(
                "{} distinct titrant amount(s) across {} point(s), at least {MIN_DISTINCT_X} required",
                distinct.len(),
                x.len()
            )));
        }
        let (lo, hi) = y
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if hi - lo <= 0.0 {
            return Err(Error::InsufficientData(format!(
                "ratio is constant ({lo}) across all {} point(s)",
                x.len()
            )));
        }

        let axis = AxisScale::from_data(&x);
        let u: Vec<f64> = x.iter().map(|&v| axis.normalize(v)).collect();
        let start = initial_guess(&u, &y);
        debug!("sigmoid fit: start k={:.4} u_eq={:.4} (normalised)", start[0], start[1]);

        let model = SeparableModelBuilder::<f64>::new(["k", "x_eq"])
            .initial_parameters(start.to_vec())
            .independent_variable(DVector::from_vec(u))
            .invariant_function(|u: &DVector<f64>| DVector::from_element(u.len(), 1.0))
            .function(["k", "x_eq"], sigmoid_basis)
            .partial_deriv("k", sigmoid_basis_dk)
            .partial_deriv("x_eq", sigmoid_basis_du_eq)
            .build()
            .map_err(|e| Error::FitConvergence(format!("model: {e}")))?;
        let n_points = y.len();
        let problem = SeparableProblemBuilder::new(model)
            .observations(DVector::from_vec(y))
            .build()
            .map_err(|e| Error::FitConvergence(format!("problem: {e}")))?;

        let result = LevMarSolver::with_solver(self.levenberg_marquardt())
            .solve(problem)
            .map_err(|failed| {
                let report = &failed.minimization_report;
                Error::FitConvergence(format!(
                    "{} after {} evaluation(s)",
                    termination_message(&report.termination),
                    report.number_of_evaluations
                ))
            })?;

        let alpha = result.nonlinear_parameters();
        let coeffs = result
            .linear_coefficients()
            .ok_or_else(|| Error::FitConvergence("no linear coefficients at the solution".into()))?;
        let p = [coeffs[0], coeffs[1], alpha[0], alpha[1]];
        if p.iter().any(|v| !v.is_finite()) {
            return Err(Error::FitConvergence(format!(
                "solver returned non-finite parameters {p:?}"
            )));
        }

        // d(original)/d(normalised) for [a, b, k, x_eq].
        let jac_map = DMatrix::from_diagonal(&DVector::from_vec(vec![
            1.0,
            1.0,
            1.0 / axis.scale,
            axis.scale,
        ]));
        let cov = match FitStatistics::try_from(&result) {
            Ok(stats) => {
                let c = &jac_map * stats.covariance_matrix() * &jac_map;
                let usable = c.iter().all(|v| v.is_finite()) && (0..4).all(|i| c[(i, i)] >= 0.0);
                usable.then(|| {
                    let mut out = [[0.0; 4]; 4];
                    for (i, row) in out.iter_mut().enumerate() {
                        for (j, v) in row.iter_mut().enumerate() {
                            *v = c[(i, j)];
                        }
                    }
                    out
                })
            }
            Err(err) => {
                debug!("sigmoid fit statistics: {err}");
                None
            }
        };
        if cov.is_none() {
            warn!("sigmoid fit: covariance could not be estimated");
        }

        let report = &result.minimization_report;
        let fit = SigmoidFit {
            a: p[0],
            b: p[1],
            k: p[2] / axis.scale,
            x_eq: axis.denormalize(p[3]),
            covariance: cov,
            ratio: None,
            n_points,
            evaluations: report.number_of_evaluations,
        };
        info!(
            "sigmoid fit: a={:.4} b={:.4} k={:.4e} x_eq={:.4e} ± {:.2e} ({} evaluation(s), {:?})",
            fit.a,
            fit.b,
            fit.k,
            fit.x_eq,
            fit.x_eq_uncertainty().unwrap_or(f64::NAN),
            fit.evaluations,
            report.termination
        );
        Ok(fit)
    }

    /// Fit one ratio of a melted series against the titrant amount.
    pub fn fit_series(&self, series: &RatioSeries, ratio: &str) -> Result<SigmoidFit> {
        let (x, y) = series.series(ratio);
        let mut fit = self.fit(&x, &y).map_err(|e| match e {
            Error::InsufficientData(msg) => Error::InsufficientData(format!("{ratio}: {msg}")),
            Error::FitConvergence(msg) => Error::FitConvergence(format!("{ratio}: {msg}")),
            other => other,
        })?;
        fit.ratio = Some(ratio.to_string());
        Ok(fit)
    }

    /// Fit every ratio independently; one failure does not affect the others.
    pub fn fit_all(&self, series: &RatioSeries) -> Vec<(String, Result<SigmoidFit>)> {
        series
            .ratio_names()
            .into_iter()
            .map(|name| {
                let res = self.fit_series(series, &name);
                if let Err(err) = &res {
                    warn!("{err}");
                }
                (name, res)
            })
            .collect()
    }
}

fn termination_message(reason: &TerminationReason) -> String {
    match reason {
        TerminationReason::LostPatience => "evaluation budget exhausted".to_string(),
        TerminationReason::Numerical(what) => format!("non-finite {what}"),
        TerminationReason::User(what) => format!("model evaluation failed ({what})"),
        TerminationReason::NoImprovementPossible(what) => {
            format!("{what} tolerance below machine precision")
        }
        other => format!("{other:?}"),
    }
}

/// [`EquivalenceFitter::fit`] with default solver settings.
pub fn fit(x: &[f64], y: &[f64]) -> Result<SigmoidFit> {
    EquivalenceFitter::default().fit(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::peaks::RatioPoint;
    use crate::synthetic::SimpleRng;
    use approx::assert_relative_eq;

    fn linspace(a: f64, b: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| a + (b - a) * i as f64 / (n - 1) as f64).collect()
    }

    fn noisy(x: &[f64], params: [f64; 4], sd: f64, seed: u64) -> Vec<f64> {
        let mut rng = SimpleRng::new(seed);
        x.iter()
            .map(|&v| logistic(v, params[0], params[1], params[2], params[3]) + rng.gauss(0.0, sd))
            .collect()
    }

    #[test]
    fn recovers_equivalence_at_nanomole_scale() {
        let x = linspace(0.0, 4e-9, 41);
        let y = noisy(&x, [1.0, 4.0, 5e9, 2e-9], 0.02, 11);
        let fit = fit(&x, &y).unwrap();

        assert_relative_eq!(fit.x_eq, 2e-9, max_relative = 0.05);
        assert_relative_eq!(fit.k, 5e9, max_relative = 0.2);
        assert_relative_eq!(fit.a, 1.0, epsilon = 0.1);
        assert_relative_eq!(fit.b, 4.0, epsilon = 0.1);
        let sigma = fit.x_eq_uncertainty().unwrap();
        assert!(sigma > 0.0 && sigma < 0.1 * fit.x_eq);
        assert_eq!(fit.n_points, 41);
    }

    #[test]
    fn decreasing_signal_gives_negative_steepness() {
        let x = linspace(0.0, 10.0, 30);
        let y = noisy(&x, [2.0, -1.5, 1.2, 4.0], 0.005, 5);
        let fit = fit(&x, &y).unwrap();
        assert_relative_eq!(fit.x_eq, 4.0, epsilon = 0.1);
        // The model is symmetric under (b, k) -> (-b, -k) with a shifted a.
        assert!(fit.b * fit.k < 0.0);
        assert_relative_eq!(fit.evaluate(0.0), logistic(0.0, 2.0, -1.5, 1.2, 4.0), epsilon = 0.02);
    }

    #[test]
    fn too_few_points_is_insufficient() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [0.0, 0.1, 0.9, 1.0];
        assert!(matches!(fit(&x, &y), Err(Error::InsufficientData(_))));

        let x = [0.0, 1.0, 2.0, 3.0, f64::NAN];
        let y = [0.0, 0.1, 0.9, 1.0, 1.0];
        assert!(matches!(fit(&x, &y), Err(Error::InsufficientData(_))));
    }

    #[test]
    fn constant_ratio_is_insufficient() {
        let x = linspace(0.0, 1.0, 10);
        let y = vec![0.7; 10];
        assert!(matches!(fit(&x, &y), Err(Error::InsufficientData(_))));
    }

    #[test]
    fn evaluation_budget_surfaces_as_convergence_error() {
        let x = linspace(0.0, 1.0, 20);
        let y = noisy(&x, [0.0, 1.0, 30.0, 0.8], 0.05, 2);
        let fitter = EquivalenceFitter::new(&FitSettings {
            patience: 1,
            ..FitSettings::default()
        });
        match fitter.fit(&x, &y) {
            Err(Error::FitConvergence(msg)) => assert!(msg.contains("evaluation budget"), "{msg}"),
            other => panic!("expected a convergence error, got {other:?}"),
        }
    }

    #[test]
    fn repeated_titrant_amount_is_insufficient() {
        let x = [1e-9; 8];
        let y = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
        match fit(&x, &y) {
            Err(Error::InsufficientData(msg)) => assert!(msg.contains("1 distinct"), "{msg}"),
            other => panic!("expected insufficient data, got {other:?}"),
        }

        // Three amounts cannot fix four parameters either.
        let x = [0.0, 0.0, 1.0, 1.0, 2.0, 2.0];
        let y = [0.1, 0.1, 0.5, 0.6, 0.9, 0.9];
        assert!(matches!(fit(&x, &y), Err(Error::InsufficientData(_))));
    }

    #[test]
    fn nearly_linear_curve_does_not_claim_precision() {
        // k * span = 0.02: the transition is far wider than the titrated range.
        let x = linspace(0.0, 4e-9, 41);
        let y = noisy(&x, [1.0, 4.0, 5e6, 2e-9], 0.02, 11);
        match fit(&x, &y) {
            Err(Error::FitConvergence(_)) => {}
            Ok(fit) => {
                let miss = (fit.x_eq - 2e-9).abs();
                if let Some(sigma) = fit.x_eq_uncertainty() {
                    assert!(
                        3.0 * sigma >= miss,
                        "x_eq = {:e} ± {sigma:e} misses 2e-9 by {miss:e}",
                        fit.x_eq
                    );
                }
            }
            Err(other) => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn axis_scale_maps_span_to_unit() {
        let axis = AxisScale::from_data(&[1e-12, 3e-12, 5e-12]);
        assert_relative_eq!(axis.center, 3e-12);
        assert_relative_eq!(axis.scale, 4e-12);
        assert_relative_eq!(axis.normalize(5e-12), 0.5);
        assert_relative_eq!(axis.denormalize(-0.5), 1e-12);

        let flat = AxisScale::from_data(&[2.0, 2.0]);
        assert_eq!(flat.scale, 1.0);
    }

    #[test]
    fn logistic_is_stable_far_from_the_midpoint() {
        assert_eq!(logistic(1.0, 0.5, 2.0, 1e6, 0.0), 2.5);
        assert_eq!(logistic(-1.0, 0.5, 2.0, 1e6, 0.0), 0.5);
    }

    #[test]
    fn curve_spans_the_requested_range() {
        let fit = SigmoidFit {
            a: 0.0,
            b: 1.0,
            k: 1.0,
            x_eq: 0.0,
            covariance: None,
            ratio: None,
            n_points: 0,
            evaluations: 0,
        };
        let c = fit.curve(-1.0, 1.0, 5);
        assert_eq!(c.len(), 5);
        assert_eq!(c[0].0, -1.0);
        assert_relative_eq!(c[4].0, 1.0);
        assert_relative_eq!(c[2].1, 0.5);
        assert!(fit.std_errors().is_none());
    }

    #[test]
    fn fit_all_keeps_every_ratio() {
        let x = linspace(0.0, 1e-9, 10);
        let good = noisy(&x, [0.5, 1.3, 1e10, 5e-10], 0.01, 9);
        let mut points = Vec::new();
        for (i, (&n, &v)) in x.iter().zip(&good).enumerate() {
            for (ratio, value) in [("ratio_I_1_I_2", v), ("ratio_I_1_I_3", 1.0)] {
                points.push(RatioPoint {
                    file: format!("S_{i:02}.txt"),
                    spectrum_name: format!("S_{i:02}"),
                    sample_label: None,
                    titrant_amount: n,
                    ratio: ratio.to_string(),
                    value,
                });
            }
        }
        let series = RatioSeries { points };

        let fits = EquivalenceFitter::default().fit_all(&series);
        assert_eq!(fits.len(), 2);
        let (name, ok) = &fits[0];
        assert_eq!(name, "ratio_I_1_I_2");
        let ok = ok.as_ref().unwrap();
        assert_eq!(ok.ratio.as_deref(), Some("ratio_I_1_I_2"));
        assert_relative_eq!(ok.x_eq, 5e-10, max_relative = 0.1);
        assert!(ok.x_eq_uncertainty().unwrap() < ok.x_eq);

        assert!(matches!(fits[1].1, Err(Error::InsufficientData(_))));
    }
}
