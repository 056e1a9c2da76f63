//! Plateau (double-peak) re-anchoring
//!
//! A partial recovery followed by a second effort makes the detector anchor
//! on the first peak: the whole dip-and-rise sits inside one non-rising run
//! when the second climb is gentle. This module looks for that second peak
//! between the original anchor and the trough and, when it qualifies, moves
//! the anchor there. If the moved candidate no longer passes the detection
//! gates, the original anchor is kept and the fallback is reported so the
//! caller can flag the interval instead of dropping it.

use tracing::{debug, warn};

use crate::config::HrrConfig;
use crate::detection::{
    evaluate_gates, extend_flat_top, local_baseline, refine_peak, GateFailure, IntervalCandidate,
};
use crate::signal::SignalSegment;

/// What the re-anchorer did with a candidate
#[derive(Debug, Clone, PartialEq)]
pub enum ReanchorOutcome {
    /// No qualifying second peak
    NotNeeded,
    /// Peak moved to the second peak
    Reanchored { original_peak: usize },
    /// Second peak found but failed the gates; original anchor kept
    FellBack {
        secondary_peak: usize,
        reason: GateFailure,
    },
}

/// Locate a qualifying second peak after the candidate's peak
///
/// Qualifies when the path from the original peak dips by at least
/// `reanchor_min_dip`, climbs back by at least `reanchor_min_rise`, and the
/// second peak stands `min_peak_minus_rest` above its own baseline (which
/// never reaches back before the original peak). The highest qualifying
/// local maximum wins, the latest one on ties.
pub fn find_secondary_peak(
    segment: &SignalSegment,
    candidate: &IntervalCandidate,
    config: &HrrConfig,
    resting_hr: Option<f64>,
) -> Option<usize> {
    let s = &segment.smoothed;
    let peak = candidate.peak_index;
    let trough = candidate.trough_index;
    if trough < peak + 3 {
        return None;
    }

    let lo = (peak + 1).max(trough.saturating_sub(config.reanchor_lookback as usize));
    let mut dip = s[peak..lo].iter().copied().fold(f64::INFINITY, f64::min);
    let mut best: Option<usize> = None;

    for i in lo..trough {
        dip = dip.min(s[i]);

        let local_max = s[i] >= s[i - 1] && s[i] > s[i + 1];
        if !local_max {
            continue;
        }
        if s[peak] - dip < config.reanchor_min_dip || s[i] - dip < config.reanchor_min_rise {
            continue;
        }
        match best {
            Some(b) if s[b] > s[i] => {}
            _ => best = Some(i),
        }
    }

    let smoothed_index = best?;
    let top_end = extend_flat_top(s, smoothed_index, config.allowed_rise, trough - 1);
    let secondary = refine_peak(
        segment,
        smoothed_index,
        top_end,
        config.kernel_half_width(),
        peak + 1,
        trough - 1,
    );

    let baseline = local_baseline(segment, secondary, peak, config, resting_hr)?;
    let elevation = segment.raw[secondary] - baseline;
    if elevation < config.min_peak_minus_rest {
        debug!(
            secondary,
            elevation, "Second peak not elevated above its own baseline"
        );
        return None;
    }

    Some(secondary)
}

/// Re-anchor a candidate on a qualifying second peak
///
/// Returns the candidate to continue with and what happened.
pub fn reanchor(
    segment: &SignalSegment,
    candidate: &IntervalCandidate,
    config: &HrrConfig,
    resting_hr: Option<f64>,
) -> (IntervalCandidate, ReanchorOutcome) {
    let Some(secondary) = find_secondary_peak(segment, candidate, config, resting_hr) else {
        return (candidate.clone(), ReanchorOutcome::NotNeeded);
    };

    match evaluate_gates(
        segment,
        secondary,
        candidate.trough_index,
        candidate.peak_index,
        config,
        resting_hr,
    ) {
        Ok(moved) => {
            debug!(
                from = candidate.peak_index,
                to = secondary,
                peak_hr = moved.peak_hr,
                "Re-anchored recovery on second peak"
            );
            (
                moved,
                ReanchorOutcome::Reanchored {
                    original_peak: candidate.peak_index,
                },
            )
        }
        Err(reason) => {
            warn!(
                original = candidate.peak_index,
                secondary,
                ?reason,
                "Second peak failed gates, keeping original anchor"
            );
            (
                candidate.clone(),
                ReanchorOutcome::FellBack {
                    secondary_peak: secondary,
                    reason,
                },
            )
        }
    }
}
