//! Exponential recovery fitting and windowed metrics
//!
//! Model: `HR(t) = A·exp(−t/τ) + C`, with `t` in seconds from the anchored
//! peak. Fits use a Levenberg–Marquardt solver projected onto the parameter
//! bounds, with a hard iteration cap. Every failure mode (too few points,
//! window past the end of the signal, no convergence) produces an undefined
//! window rather than an error.
//!
//! R² is always reported for a defined fit. The HRR magnitude for a window
//! is only filled in when R² reaches the trust threshold.

use std::collections::BTreeMap;
use tracing::debug;

use crate::config::{FitBounds, HrrConfig};
use crate::models::{FitFailure, WindowFit};

const CONVERGENCE_TOLERANCE: f64 = 1e-10;
const MAX_DAMPING: f64 = 1e10;

/// Fitted exponential decay parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialFit {
    pub amplitude: f64,
    pub tau: f64,
    pub asymptote: f64,
    pub r_squared: f64,
    pub iterations: usize,
}

impl ExponentialFit {
    pub fn predict(&self, t: f64) -> f64 {
        exp_model(&[self.amplitude, self.tau, self.asymptote], t)
    }
}

/// Ordinary least-squares line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

fn exp_model(p: &[f64; 3], t: f64) -> f64 {
    p[0] * (-t / p[1]).exp() + p[2]
}

fn sum_squared_residuals(p: &[f64; 3], t: &[f64], y: &[f64]) -> f64 {
    t.iter()
        .zip(y)
        .map(|(&ti, &yi)| (yi - exp_model(p, ti)).powi(2))
        .sum()
}

fn clamp_to_bounds(p: [f64; 3], bounds: &FitBounds) -> [f64; 3] {
    [
        p[0].clamp(bounds.amplitude_min, bounds.amplitude_max),
        p[1].clamp(bounds.tau_min, bounds.tau_max),
        p[2].clamp(bounds.asymptote_min, bounds.asymptote_max),
    ]
}

/// Solve a 3x3 linear system by Gaussian elimination with partial pivoting
fn solve3(mut a: [[f64; 3]; 3], mut b: [f64; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let pivot = (col..3).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-300 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..3 {
            let factor = a[row][col] / a[col][col];
            for k in col..3 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = (row + 1..3).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }

    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Starting point: asymptote at the observed minimum, amplitude from the
/// first value, tau from the first crossing of the 1/e level
fn initial_guess(t: &[f64], y: &[f64], bounds: &FitBounds) -> [f64; 3] {
    let y_min = y.iter().copied().fold(f64::INFINITY, f64::min);
    let asymptote = y_min;
    let amplitude = (y[0] - asymptote).max(0.0);
    let target = asymptote + amplitude / std::f64::consts::E;
    let span = t[t.len() - 1] - t[0];
    let tau = t
        .iter()
        .zip(y)
        .find(|(_, &yi)| yi <= target)
        .map(|(&ti, _)| ti - t[0])
        .filter(|&crossing| crossing > 0.0)
        .unwrap_or(span / 3.0);

    clamp_to_bounds([amplitude, tau, asymptote], bounds)
}

/// Coefficient of determination; 0 for a flat series
pub fn r_squared(observed: &[f64], predicted: &[f64]) -> f64 {
    let n = observed.len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mean = observed.iter().sum::<f64>() / n;
    let ss_tot: f64 = observed.iter().map(|y| (y - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return 0.0;
    }
    let ss_res: f64 = observed
        .iter()
        .zip(predicted)
        .map(|(y, f)| (y - f).powi(2))
        .sum();

    (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
}

/// Bounded nonlinear least squares fit of `A·exp(−t/τ) + C`
///
/// Returns None when the solver does not settle within `max_iterations`
/// or produces non-finite parameters.
pub fn fit_exponential(
    t: &[f64],
    y: &[f64],
    bounds: &FitBounds,
    max_iterations: usize,
) -> Option<ExponentialFit> {
    if t.len() != y.len() || t.len() < 3 {
        return None;
    }

    let mut p = initial_guess(t, y, bounds);
    let mut ssr = sum_squared_residuals(&p, t, y);
    let mut lambda = 1e-3;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;

        if ssr <= f64::EPSILON {
            converged = true;
            break;
        }

        let mut jtj = [[0.0; 3]; 3];
        let mut jtr = [0.0; 3];
        for (&ti, &yi) in t.iter().zip(y) {
            let decay = (-ti / p[1]).exp();
            let grad = [decay, p[0] * decay * ti / (p[1] * p[1]), 1.0];
            let residual = yi - (p[0] * decay + p[2]);
            for r in 0..3 {
                jtr[r] += grad[r] * residual;
                for c in 0..3 {
                    jtj[r][c] += grad[r] * grad[c];
                }
            }
        }

        let mut damped = jtj;
        for d in 0..3 {
            damped[d][d] += lambda * jtj[d][d].max(1e-12);
        }

        let candidate = solve3(damped, jtr)
            .map(|step| clamp_to_bounds([p[0] + step[0], p[1] + step[1], p[2] + step[2]], bounds));

        match candidate {
            Some(next) => {
                let next_ssr = sum_squared_residuals(&next, t, y);
                if next_ssr.is_finite() && next_ssr < ssr {
                    let improvement = ssr - next_ssr;
                    p = next;
                    ssr = next_ssr;
                    lambda = (lambda / 10.0).max(1e-12);
                    if improvement <= CONVERGENCE_TOLERANCE * (1.0 + ssr) {
                        converged = true;
                        break;
                    }
                } else {
                    lambda *= 10.0;
                }
            }
            None => lambda *= 10.0,
        }

        // No descent direction left inside the bounds: stationary point
        if lambda > MAX_DAMPING {
            converged = true;
            break;
        }
    }

    if !converged || !p.iter().all(|v| v.is_finite()) {
        return None;
    }

    let predicted: Vec<f64> = t.iter().map(|&ti| exp_model(&p, ti)).collect();
    Some(ExponentialFit {
        amplitude: p[0],
        tau: p[1],
        asymptote: p[2],
        r_squared: r_squared(y, &predicted),
        iterations,
    })
}

/// Ordinary least squares; None when x has no spread
pub fn linear_fit(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }

    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|xi| (xi - mean_x).powi(2)).sum();
    if sxx.abs() < 1e-12 {
        return None;
    }
    let sxy: f64 = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| (xi - mean_x) * (yi - mean_y))
        .sum();

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let predicted: Vec<f64> = x.iter().map(|xi| intercept + slope * xi).collect();

    Some(LinearFit {
        slope,
        intercept,
        r_squared: r_squared(y, &predicted),
    })
}

/// Fit one fixed window starting at the anchored peak
///
/// Covers `[0, min(window, available)]` seconds. A window cut short by the
/// end of the signal is fitted on what was recorded and marked truncated;
/// its HRR value is the drop to the last recorded second.
pub fn fit_window(raw: &[f64], peak_index: usize, peak_hr: f64, window: u32, config: &HrrConfig) -> WindowFit {
    let window = window as usize;
    let available = raw.len().saturating_sub(peak_index + 1);
    let span = window.min(available);
    let points = span + 1;

    if span == 0 || points < config.min_fit_points {
        return WindowFit::undefined(FitFailure::InsufficientPoints, points);
    }

    let truncated = span < window;
    let y = &raw[peak_index..=peak_index + span];
    let t: Vec<f64> = (0..=span).map(|s| s as f64).collect();

    match fit_exponential(&t, y, &config.bounds, config.max_fit_iterations) {
        Some(fit) => {
            let trusted = fit.r_squared >= config.r2_threshold;
            WindowFit {
                r_squared: Some(fit.r_squared),
                hrr_value: trusted.then(|| peak_hr - y[span]),
                amplitude: Some(fit.amplitude),
                tau: Some(fit.tau),
                asymptote: Some(fit.asymptote),
                points,
                truncated,
                failure: None,
            }
        }
        None => {
            debug!(peak_index, window, points, "Exponential fit did not converge");
            WindowFit::undefined(FitFailure::NonConvergent, points)
        }
    }
}

/// Fit every configured window
pub fn fit_windows(raw: &[f64], peak_index: usize, peak_hr: f64, config: &HrrConfig) -> BTreeMap<u32, WindowFit> {
    config
        .windows
        .iter()
        .map(|&w| (w, fit_window(raw, peak_index, peak_hr, w, config)))
        .collect()
}

/// Linear slope over the late sub-window after the peak
///
/// The window is cut short at the end of the signal; fewer than
/// `min_fit_points` remaining seconds means no slope.
pub fn late_slope(raw: &[f64], peak_index: usize, config: &HrrConfig) -> Option<LinearFit> {
    let start = peak_index + config.late_window_start as usize;
    let end = (peak_index + config.late_window_end as usize).min(raw.len().checked_sub(1)?);
    if end < start || end - start + 1 < config.min_fit_points {
        return None;
    }

    let x: Vec<f64> = (start..=end).map(|i| (i - peak_index) as f64).collect();
    linear_fit(&x, &raw[start..=end])
}
