use crate::outcome::{FailureReason, Outcome, ResultRow};
use crate::series::InputSlice;
use crate::work_unit::WorkKey;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const PERIOD_DAYS: f64 = 365.25;
const HUBER_K: f64 = 1.345;
const PIVOT_EPSILON: f64 = 1e-12;

/// Parameters handed to every fit. Thresholds belong to the fit, not to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitParams {
    pub min_observations: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            min_observations: 6,
            max_iterations: 50,
            tolerance: 1e-6,
        }
    }
}

/// A per-unit model fit. Implementations may hold mutable per-worker scratch state
/// but must give the same outcome for the same key and slice.
pub trait FitFunction {
    fn fit(&mut self, key: &WorkKey, slice: &InputSlice, params: &FitParams) -> Outcome;
}

/// Builds one fit context per worker. Contexts are never shared between workers.
pub trait FitFactory: Send + Sync {
    type Fitter: FitFunction;

    fn make_fitter(&self) -> Self::Fitter;
}

/// Robust first-order harmonic regression on day of year:
/// `v = a + b cos(wt) + c sin(wt)`, reweighted with Huber weights until the
/// coefficients settle. Day-of-year keys get plain mean and standard deviation.
#[derive(Debug, Default)]
pub struct HarmonicFitter {
    weights: Vec<f64>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HarmonicFactory;

impl FitFactory for HarmonicFactory {
    type Fitter = HarmonicFitter;

    fn make_fitter(&self) -> HarmonicFitter {
        HarmonicFitter::default()
    }
}

impl FitFunction for HarmonicFitter {
    fn fit(&mut self, key: &WorkKey, slice: &InputSlice, params: &FitParams) -> Outcome {
        if slice.len() < params.min_observations.max(1) {
            return Outcome::Failure(FailureReason::InsufficientData);
        }
        if slice.points.iter().any(|p| !p.value.is_finite() || !p.position.is_finite()) {
            return Outcome::Failure(FailureReason::NumericalError);
        }

        let result = match key {
            WorkKey::DayOfYear { .. } => daily_stats(slice),
            WorkKey::Pixel { .. } | WorkKey::PixelYear { .. } => self.harmonic(slice, params),
        };

        match result {
            Ok(values) => Outcome::Success(ResultRow::new(*key, values)),
            Err(reason) => Outcome::Failure(reason),
        }
    }
}

impl HarmonicFitter {
    fn harmonic(&mut self, slice: &InputSlice, params: &FitParams) -> Result<Vec<f64>, FailureReason> {
        if slice.len() < 3 {
            return Err(FailureReason::InsufficientData);
        }
        let omega = 2.0 * PI / PERIOD_DAYS;
        let design: Vec<[f64; 3]> = slice
            .points
            .iter()
            .map(|p| [1.0, (omega * p.position).cos(), (omega * p.position).sin()])
            .collect();
        let values: Vec<f64> = slice.points.iter().map(|p| p.value).collect();

        self.weights.clear();
        self.weights.resize(values.len(), 1.0);

        let mut coef = weighted_least_squares(&design, &values, &self.weights)
            .ok_or(FailureReason::NumericalError)?;

        let mut converged = false;
        for _ in 0..params.max_iterations {
            let residuals: Vec<f64> = design
                .iter()
                .zip(&values)
                .map(|(row, v)| v - dot(row, &coef))
                .collect();
            let scale = mad_scale(&residuals);
            if scale <= f64::EPSILON {
                converged = true;
                break;
            }
            let threshold = HUBER_K * scale;
            for (w, r) in self.weights.iter_mut().zip(&residuals) {
                *w = if r.abs() <= threshold { 1.0 } else { threshold / r.abs() };
            }

            let next = weighted_least_squares(&design, &values, &self.weights)
                .ok_or(FailureReason::NumericalError)?;
            let change = next
                .iter()
                .zip(&coef)
                .map(|(n, c)| (n - c).abs() / (1.0 + c.abs()))
                .fold(0.0, f64::max);
            coef = next;
            if change < params.tolerance {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(FailureReason::NonConvergence);
        }

        let [a, b, c] = coef;
        let amplitude = (b * b + c * c).sqrt();
        let phase = c.atan2(b);
        let peak_doy = (phase / omega).rem_euclid(PERIOD_DAYS).max(1.0);
        let rmse = (design
            .iter()
            .zip(&values)
            .map(|(row, v)| (v - dot(row, &coef)).powi(2))
            .sum::<f64>()
            / values.len() as f64)
            .sqrt();

        let out = vec![a, amplitude, peak_doy, rmse, values.len() as f64];
        if out.iter().any(|v| !v.is_finite()) {
            return Err(FailureReason::NumericalError);
        }
        Ok(out)
    }
}

fn daily_stats(slice: &InputSlice) -> Result<Vec<f64>, FailureReason> {
    let n = slice.len() as f64;
    if slice.len() < 2 {
        return Err(FailureReason::InsufficientData);
    }
    let mean = slice.points.iter().map(|p| p.value).sum::<f64>() / n;
    let var = slice
        .points
        .iter()
        .map(|p| (p.value - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    let sd = var.sqrt();
    if !mean.is_finite() || !sd.is_finite() {
        return Err(FailureReason::NumericalError);
    }
    Ok(vec![mean, sd, n])
}

fn dot(row: &[f64; 3], coef: &[f64; 3]) -> f64 {
    row[0] * coef[0] + row[1] * coef[1] + row[2] * coef[2]
}

/// Median absolute deviation scaled to a normal standard deviation.
fn mad_scale(residuals: &[f64]) -> f64 {
    let mut abs: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
    abs.sort_by(|a, b| a.total_cmp(b));
    let mid = abs.len() / 2;
    let median = if abs.len() % 2 == 0 {
        (abs[mid - 1] + abs[mid]) / 2.0
    } else {
        abs[mid]
    };
    median / 0.6745
}

/// Solve the 3x3 weighted normal equations with partial pivoting.
fn weighted_least_squares(design: &[[f64; 3]], values: &[f64], weights: &[f64]) -> Option<[f64; 3]> {
    let mut m = [[0.0f64; 4]; 3];
    for ((row, v), w) in design.iter().zip(values).zip(weights) {
        for i in 0..3 {
            for j in 0..3 {
                m[i][j] += w * row[i] * row[j];
            }
            m[i][3] += w * row[i] * v;
        }
    }

    for col in 0..3 {
        let pivot = (col..3).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < PIVOT_EPSILON {
            return None;
        }
        m.swap(col, pivot);
        for r in 0..3 {
            if r != col {
                let factor = m[r][col] / m[col][col];
                for k in col..4 {
                    m[r][k] -= factor * m[col][k];
                }
            }
        }
    }

    let coef = [m[0][3] / m[0][0], m[1][3] / m[1][1], m[2][3] / m[2][2]];
    coef.iter().all(|c| c.is_finite()).then_some(coef)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::SlicePoint;

    fn seasonal_slice(n: usize, noise: f64) -> InputSlice {
        let omega = 2.0 * PI / PERIOD_DAYS;
        let points = (0..n)
            .map(|i| {
                let t = 1.0 + i as f64 * (365.0 / n as f64);
                let wobble = if i % 2 == 0 { noise } else { -noise };
                SlicePoint {
                    position: t,
                    value: 0.4 + 0.3 * (omega * (t - 200.0)).cos() + wobble,
                }
            })
            .collect();
        InputSlice { points }
    }

    #[test]
    fn test_recovers_seasonal_peak() {
        let mut fitter = HarmonicFactory.make_fitter();
        let key = WorkKey::Pixel { pixel_id: 1 };
        let outcome = fitter.fit(&key, &seasonal_slice(46, 0.01), &FitParams::default());

        let Outcome::Success(row) = outcome else {
            panic!("expected success, got {:?}", outcome);
        };
        assert!((row.values[0] - 0.4).abs() < 0.02, "intercept {}", row.values[0]);
        assert!((row.values[1] - 0.3).abs() < 0.02, "amplitude {}", row.values[1]);
        assert!((row.values[2] - 200.0).abs() < 3.0, "peak {}", row.values[2]);
        assert_eq!(row.values[4], 46.0);
    }

    #[test]
    fn test_too_few_points_is_insufficient_data() {
        let mut fitter = HarmonicFitter::default();
        let key = WorkKey::PixelYear { pixel_id: 1, year: 2010 };
        let outcome = fitter.fit(&key, &seasonal_slice(4, 0.0), &FitParams::default());
        assert_eq!(outcome, Outcome::Failure(FailureReason::InsufficientData));
    }

    #[test]
    fn test_degenerate_positions_are_numerical_error() {
        let mut fitter = HarmonicFitter::default();
        let points = (0..10)
            .map(|i| SlicePoint {
                position: 120.0,
                value: 0.1 * i as f64,
            })
            .collect();
        let outcome = fitter.fit(
            &WorkKey::Pixel { pixel_id: 3 },
            &InputSlice { points },
            &FitParams::default(),
        );
        assert_eq!(outcome, Outcome::Failure(FailureReason::NumericalError));
    }

    #[test]
    fn test_zero_iterations_is_non_convergence() {
        let mut fitter = HarmonicFitter::default();
        let params = FitParams {
            max_iterations: 0,
            ..FitParams::default()
        };
        let outcome = fitter.fit(&WorkKey::Pixel { pixel_id: 1 }, &seasonal_slice(30, 0.05), &params);
        assert_eq!(outcome, Outcome::Failure(FailureReason::NonConvergence));
    }

    #[test]
    fn test_daily_stats() {
        let mut fitter = HarmonicFitter::default();
        let points = [0.2, 0.4, 0.6, 0.8, 0.4, 0.6]
            .iter()
            .map(|&value| SlicePoint { position: 10.0, value })
            .collect();
        let outcome = fitter.fit(
            &WorkKey::DayOfYear { doy: 10 },
            &InputSlice { points },
            &FitParams::default(),
        );
        let Outcome::Success(row) = outcome else {
            panic!("expected success");
        };
        assert!((row.values[0] - 0.5).abs() < 1e-12);
        assert_eq!(row.values[2], 6.0);
        assert!(row.validate().is_ok());
    }

    #[test]
    fn test_fit_is_deterministic() {
        let slice = seasonal_slice(40, 0.03);
        let key = WorkKey::Pixel { pixel_id: 9 };
        let a = HarmonicFitter::default().fit(&key, &slice, &FitParams::default());
        let b = HarmonicFitter::default().fit(&key, &slice, &FitParams::default());
        assert_eq!(a, b);
    }
}
