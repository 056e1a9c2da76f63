//! Peak/valley detection on the smoothed per-second signal
//!
//! A candidate recovery is a maximal run of seconds whose smoothed
//! first difference stays at or below `allowed_rise`. The run's minimum is
//! the trough; the peak is the maximum found by searching a bounded window
//! backward from where the run starts. Both anchors are located on the
//! smoothed series and then refined on the raw series within the kernel
//! half-width, so reported heart rates are observed values.
//!
//! Candidates must pass three gates: duration, absolute drop, and peak
//! elevation over the local pre-peak baseline. Runs that fail are dropped
//! without error; flat or noisy stretches are expected to produce nothing.

use tracing::debug;

use crate::config::HrrConfig;
use crate::signal::{median, SignalSegment};

/// Peak/trough skeleton of a gated recovery candidate (segment indices)
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalCandidate {
    pub peak_index: usize,
    pub trough_index: usize,
    pub peak_hr: f64,
    pub trough_hr: f64,
    /// Peak elevation over its local baseline
    pub peak_above_baseline: f64,
}

impl IntervalCandidate {
    pub fn duration(&self) -> usize {
        self.trough_index - self.peak_index
    }

    pub fn total_drop(&self) -> f64 {
        self.peak_hr - self.trough_hr
    }
}

/// Why a candidate did not survive the gates
#[derive(Debug, Clone, PartialEq)]
pub enum GateFailure {
    /// Peak-to-trough duration below `min_run_duration`
    TooShort { duration: usize },
    /// Drop below `min_drop_abs`
    DropTooSmall { drop: f64 },
    /// Peak not far enough above its local baseline
    NotElevated { elevation: f64 },
    /// Neither pre-peak samples nor a resting reference were available
    NoBaseline,
}

/// Maximal runs of non-rising seconds, as inclusive sample index ranges
///
/// A run covering samples `start..=end` lasts `end - start` seconds.
pub fn non_rising_runs(smoothed: &[f64], allowed_rise: f64, min_duration: usize) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut run_start: Option<usize> = None;

    for i in 0..smoothed.len().saturating_sub(1) {
        let non_rising = smoothed[i + 1] - smoothed[i] <= allowed_rise;
        match (non_rising, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                if i - start >= min_duration {
                    runs.push((start, i));
                }
                run_start = None;
            }
            _ => {}
        }
    }

    if let Some(start) = run_start {
        let end = smoothed.len() - 1;
        if end - start >= min_duration {
            runs.push((start, end));
        }
    }

    runs
}

/// Index of the maximum in `lo..=hi`, latest on ties
fn argmax_latest(values: &[f64], lo: usize, hi: usize) -> usize {
    let mut best = lo;
    for i in lo..=hi {
        if values[i] >= values[best] {
            best = i;
        }
    }
    best
}

/// Index of the minimum in `lo..=hi`, earliest on ties
fn argmin_earliest(values: &[f64], lo: usize, hi: usize) -> usize {
    let mut best = lo;
    for i in lo..=hi {
        if values[i] < values[best] {
            best = i;
        }
    }
    best
}

/// Last index of the flat top that starts at `index`
///
/// Walks forward while the smoothed value stays within `tolerance` of the
/// value at `index`, so a held effort anchors where the decline begins.
pub(crate) fn extend_flat_top(smoothed: &[f64], index: usize, tolerance: f64, hi: usize) -> usize {
    let level = smoothed[index] - tolerance;
    let mut end = index;
    while end < hi && smoothed[end + 1] >= level {
        end += 1;
    }
    end
}

/// Move a smoothed-series peak span onto the raw maximum nearby
pub(crate) fn refine_peak(
    segment: &SignalSegment,
    first: usize,
    last: usize,
    half: usize,
    lo: usize,
    hi: usize,
) -> usize {
    let from = first.saturating_sub(half).max(lo);
    let to = (last + half).min(hi);
    if from > to {
        return first;
    }
    argmax_latest(&segment.raw, from, to)
}

fn refine_trough(segment: &SignalSegment, index: usize, half: usize, lo: usize, hi: usize) -> usize {
    let from = index.saturating_sub(half).max(lo);
    let to = (index + half).min(hi);
    if from > to {
        return index;
    }
    argmin_earliest(&segment.raw, from, to)
}

/// Median of the raw samples in `[max(floor, peak - baseline_window), peak)`
///
/// Falls back to the resting reference when fewer than
/// `min_baseline_points` samples precede the peak.
pub fn local_baseline(
    segment: &SignalSegment,
    peak_index: usize,
    floor: usize,
    config: &HrrConfig,
    resting_hr: Option<f64>,
) -> Option<f64> {
    let start = peak_index
        .saturating_sub(config.baseline_window as usize)
        .max(floor);
    let window = if start < peak_index {
        &segment.raw[start..peak_index]
    } else {
        &[][..]
    };

    if window.len() >= config.min_baseline_points {
        median(window)
    } else {
        resting_hr
    }
}

/// Apply the duration, drop and elevation gates to a peak/trough pair
pub fn evaluate_gates(
    segment: &SignalSegment,
    peak_index: usize,
    trough_index: usize,
    baseline_floor: usize,
    config: &HrrConfig,
    resting_hr: Option<f64>,
) -> Result<IntervalCandidate, GateFailure> {
    if trough_index <= peak_index {
        return Err(GateFailure::TooShort { duration: 0 });
    }

    let duration = trough_index - peak_index;
    if duration < config.min_run_duration as usize {
        return Err(GateFailure::TooShort { duration });
    }

    let peak_hr = segment.raw[peak_index];
    let trough_hr = segment.raw[trough_index];
    let drop = peak_hr - trough_hr;
    if drop < config.min_drop_abs {
        return Err(GateFailure::DropTooSmall { drop });
    }

    let baseline = local_baseline(segment, peak_index, baseline_floor, config, resting_hr)
        .ok_or(GateFailure::NoBaseline)?;
    let elevation = peak_hr - baseline;
    if elevation < config.min_peak_minus_rest {
        return Err(GateFailure::NotElevated { elevation });
    }

    Ok(IntervalCandidate {
        peak_index,
        trough_index,
        peak_hr,
        trough_hr,
        peak_above_baseline: elevation,
    })
}

/// Find gated recovery candidates in one segment, in time order
///
/// Candidates never overlap: the peak search for a run never reaches back
/// past the previous accepted trough.
pub fn detect_candidates(
    segment: &SignalSegment,
    config: &HrrConfig,
    resting_hr: Option<f64>,
) -> Vec<IntervalCandidate> {
    let smoothed = &segment.smoothed;
    let half = config.kernel_half_width();
    let lookback = config.peak_lookback as usize;
    let mut candidates = Vec::new();
    let mut floor = 0usize;

    for (run_start, run_end) in non_rising_runs(smoothed, config.allowed_rise, config.min_run_duration as usize) {
        let trough_smoothed = argmin_earliest(smoothed, run_start, run_end);
        let trough_index = refine_trough(segment, trough_smoothed, half, run_start.max(floor), run_end);

        let Some(last_peak_slot) = trough_index.checked_sub(1) else {
            continue;
        };
        let lo = run_start.saturating_sub(lookback).max(floor);
        let hi = (run_start + half).min(last_peak_slot);
        if lo > hi {
            continue;
        }

        let peak_smoothed = argmax_latest(smoothed, lo, hi);
        let top_end = extend_flat_top(smoothed, peak_smoothed, config.allowed_rise, last_peak_slot);
        let peak_index = refine_peak(segment, peak_smoothed, top_end, half, lo, last_peak_slot);

        match evaluate_gates(segment, peak_index, trough_index, 0, config, resting_hr) {
            Ok(candidate) => {
                floor = candidate.trough_index + 1;
                candidates.push(candidate);
            }
            Err(reason) => {
                debug!(
                    run_start,
                    run_end,
                    peak_index,
                    trough_index,
                    ?reason,
                    "Discarding recovery candidate"
                );
            }
        }
    }

    candidates
}
