//! Offline threshold calibration
//!
//! Derives the noise-dependent detection thresholds from recorded data
//! instead of fixed constants:
//!
//! - instrument noise from stable stretches (flat, low-variance minutes)
//! - within-subject variability of HRR60 from consecutive recoveries
//!
//! Calibration either produces a complete, validated, versioned threshold
//! set or fails with a [`CalibrationError`]; it never returns a partial set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::Statistics;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::HrrConfig;
use crate::error::{CalibrationError, Result};
use crate::fitting::linear_fit;
use crate::models::{QualityStatus, SessionSamples};
use crate::pipeline::detect_segment;
use crate::signal::{median, prepare, SignalSegment};

const R2_THRESHOLD_MIN: f64 = 0.5;
const R2_THRESHOLD_MAX: f64 = 0.95;

/// Knobs for a calibration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Length of a candidate stable stretch (s)
    pub stable_window: usize,
    /// Max HR standard deviation inside a stable stretch (bpm)
    pub stable_max_sd: f64,
    /// Max |OLS slope| inside a stable stretch (bpm/s)
    pub stable_max_slope: f64,
    /// Normal quantile used to turn noise SDs into tolerances
    pub noise_quantile: f64,
    pub min_stable_stretches: usize,
    pub min_recovery_pairs: usize,
    /// Lower bounds applied to the derived thresholds
    pub allowed_rise_floor: f64,
    pub min_drop_floor: f64,
    pub min_elevation_floor: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            stable_window: 60,
            stable_max_sd: 3.0,
            stable_max_slope: 0.05,
            noise_quantile: 0.99,
            min_stable_stretches: 3,
            min_recovery_pairs: 2,
            allowed_rise_floor: 0.5,
            min_drop_floor: 5.0,
            min_elevation_floor: 5.0,
        }
    }
}

/// Instrument noise measured on stable stretches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseEstimate {
    pub stretches: usize,
    /// Median per-stretch SD of first differences (bpm/s)
    pub sigma_diff: f64,
    /// Median per-stretch SD of the level (bpm)
    pub sigma_level: f64,
}

/// Evidence behind a derived threshold set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDiagnostics {
    pub sessions: usize,
    pub noise: NoiseEstimate,
    pub z: f64,
    pub recovery_values: usize,
    pub recovery_pairs: usize,
    pub typical_error: f64,
    pub mdc95: f64,
    pub median_decline_variance: f64,
}

/// A complete, versioned threshold set plus its diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub run_id: Uuid,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub thresholds: HrrConfig,
    pub diagnostics: CalibrationDiagnostics,
}

/// Per-stretch noise figures
struct Stretch {
    sd_level: f64,
    sd_diff: f64,
}

/// A usable recovery: time-stamped HRR60 plus the variance of its decline
struct RecoverySample {
    peak_time: DateTime<Utc>,
    hrr60: f64,
    decline_variance: f64,
}

fn stable_stretches(segment: &SignalSegment, settings: &CalibrationSettings) -> Vec<Stretch> {
    let window = settings.stable_window;
    if window < 3 {
        return Vec::new();
    }
    let x: Vec<f64> = (0..window).map(|i| i as f64).collect();

    segment
        .raw
        .chunks_exact(window)
        .filter_map(|chunk| {
            let sd_level = chunk.iter().std_dev();
            if !(sd_level <= settings.stable_max_sd) {
                return None;
            }
            let slope = linear_fit(&x, chunk)?.slope;
            if slope.abs() > settings.stable_max_slope {
                return None;
            }
            let diffs: Vec<f64> = chunk.windows(2).map(|w| w[1] - w[0]).collect();
            Some(Stretch {
                sd_level,
                sd_diff: diffs.iter().std_dev(),
            })
        })
        .collect()
}

fn recovery_samples(
    segment: &SignalSegment,
    base: &HrrConfig,
    resting_hr: Option<f64>,
) -> Vec<RecoverySample> {
    detect_segment(segment, base, resting_hr)
        .into_iter()
        .filter(|interval| interval.quality_status != QualityStatus::Rejected)
        .filter_map(|interval| {
            let hrr60 = interval.hrr_value(60)?;
            let peak = (interval.peak_time - segment.start).num_seconds() as usize;
            let trough = (interval.trough_time - segment.start).num_seconds() as usize;
            let decline = segment.raw.get(peak..=trough)?;
            Some(RecoverySample {
                peak_time: interval.peak_time,
                hrr60,
                decline_variance: decline.iter().variance(),
            })
        })
        .collect()
}

fn finite_threshold(name: &str, value: f64) -> std::result::Result<f64, CalibrationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CalibrationError::InvalidThreshold {
            name: name.to_string(),
            value,
        })
    }
}

/// Derive a threshold set from recorded sessions
///
/// All sessions are treated as one subject; HRR60 pairs are consecutive
/// recoveries in time order. Thresholds not derived here are taken from
/// `base`, which is also the configuration of the detection pass that
/// supplies the HRR60 values.
pub fn calibrate(
    sessions: &[SessionSamples],
    base: &HrrConfig,
    settings: &CalibrationSettings,
) -> Result<CalibrationResult> {
    base.validate()?;

    let normal = Normal::new(0.0, 1.0).map_err(|e| CalibrationError::Statistics(e.to_string()))?;
    if !(settings.noise_quantile > 0.5 && settings.noise_quantile < 1.0) {
        return Err(CalibrationError::InvalidThreshold {
            name: "noise_quantile".to_string(),
            value: settings.noise_quantile,
        }
        .into());
    }
    let z = normal.inverse_cdf(settings.noise_quantile);

    let mut stretches = Vec::new();
    let mut recoveries = Vec::new();
    for session in sessions {
        for segment in prepare(&session.samples, base) {
            stretches.extend(stable_stretches(&segment, settings));
            recoveries.extend(recovery_samples(&segment, base, session.resting_hr));
        }
    }

    debug!(
        sessions = sessions.len(),
        stretches = stretches.len(),
        recoveries = recoveries.len(),
        "Collected calibration evidence"
    );

    if stretches.len() < settings.min_stable_stretches {
        return Err(CalibrationError::InsufficientData {
            quantity: "stable stretches".to_string(),
            found: stretches.len(),
            required: settings.min_stable_stretches,
        }
        .into());
    }

    recoveries.sort_by_key(|r| r.peak_time);
    let diffs: Vec<f64> = recoveries
        .windows(2)
        .map(|pair| pair[1].hrr60 - pair[0].hrr60)
        .collect();
    if diffs.len() < settings.min_recovery_pairs.max(2) {
        return Err(CalibrationError::InsufficientData {
            quantity: "HRR60 pairs".to_string(),
            found: diffs.len(),
            required: settings.min_recovery_pairs.max(2),
        }
        .into());
    }

    let sd_diffs: Vec<f64> = stretches.iter().map(|s| s.sd_diff).collect();
    let sd_levels: Vec<f64> = stretches.iter().map(|s| s.sd_level).collect();
    let noise = NoiseEstimate {
        stretches: stretches.len(),
        sigma_diff: finite_threshold("sigma_diff", median(&sd_diffs).unwrap_or(f64::NAN))?,
        sigma_level: finite_threshold("sigma_level", median(&sd_levels).unwrap_or(f64::NAN))?,
    };

    let typical_error = finite_threshold("typical_error", diffs.iter().std_dev() / 2f64.sqrt())?;
    let mdc95 = 1.96 * 2f64.sqrt() * typical_error;

    let variances: Vec<f64> = recoveries.iter().map(|r| r.decline_variance).collect();
    let median_decline_variance =
        finite_threshold("median_decline_variance", median(&variances).unwrap_or(f64::NAN))?;
    if median_decline_variance <= 0.0 {
        return Err(CalibrationError::InvalidThreshold {
            name: "median_decline_variance".to_string(),
            value: median_decline_variance,
        }
        .into());
    }

    let allowed_rise = (z * noise.sigma_diff).max(settings.allowed_rise_floor);
    let min_drop_abs = mdc95.max(settings.min_drop_floor);
    let min_peak_minus_rest = (z * noise.sigma_level * 2f64.sqrt()).max(settings.min_elevation_floor);
    let r2_threshold = (1.0 - z.powi(2) * noise.sigma_level.powi(2) / median_decline_variance)
        .clamp(R2_THRESHOLD_MIN, R2_THRESHOLD_MAX);

    let run_id = Uuid::new_v4();
    let created_at = Utc::now();
    let version = format!(
        "cal-{}-{}",
        created_at.format("%Y%m%dT%H%M%SZ"),
        &run_id.simple().to_string()[..8]
    );

    let thresholds = HrrConfig {
        version: version.clone(),
        allowed_rise: finite_threshold("allowed_rise", allowed_rise)?,
        min_drop_abs: finite_threshold("min_drop_abs", min_drop_abs)?,
        min_peak_minus_rest: finite_threshold("min_peak_minus_rest", min_peak_minus_rest)?,
        r2_threshold,
        r2_reject_floor: base.r2_reject_floor.min(r2_threshold),
        ..base.clone()
    };
    thresholds.validate()?;

    info!(
        version = %version,
        allowed_rise = thresholds.allowed_rise,
        min_drop_abs = thresholds.min_drop_abs,
        min_peak_minus_rest = thresholds.min_peak_minus_rest,
        r2_threshold = thresholds.r2_threshold,
        "Calibration complete"
    );

    Ok(CalibrationResult {
        run_id,
        version,
        created_at,
        thresholds,
        diagnostics: CalibrationDiagnostics {
            sessions: sessions.len(),
            noise,
            z,
            recovery_values: recoveries.len(),
            recovery_pairs: diffs.len(),
            typical_error,
            mdc95,
            median_decline_variance,
        },
    })
}
