//! Interval quality assessment
//!
//! Turns fit evidence into a single trust state. Flags accumulate; the
//! status is the most severe state any flag implies, PASS when none.

use tracing::debug;

use crate::config::HrrConfig;
use crate::models::{QualityFlag, QualityStatus, RecoveryInterval};

/// Collect the assessment flags for an interval without mutating it
pub fn assessment_flags(interval: &RecoveryInterval, config: &HrrConfig) -> Vec<QualityFlag> {
    let mut flags = Vec::new();

    if interval.duration_seconds < config.min_duration_floor {
        flags.push(QualityFlag::ShortDuration);
    }

    match interval.best_r_squared() {
        Some(best) if best >= config.r2_reject_floor => {
            if best < config.r2_threshold {
                flags.push(QualityFlag::AmbiguousFit);
            }
        }
        _ => flags.push(QualityFlag::NoValidFit),
    }

    if let Some(slope) = interval.late_slope {
        if slope > config.late_slope_rise {
            flags.push(QualityFlag::LateRise);
        }
    }

    flags
}

/// Fold a flag set into the status it implies
pub fn rollup<'a, I>(flags: I) -> QualityStatus
where
    I: IntoIterator<Item = &'a QualityFlag>,
{
    flags
        .into_iter()
        .map(|flag| flag.severity())
        .max_by_key(|status| status.severity_rank())
        .unwrap_or(QualityStatus::Pass)
}

/// Assess an interval in place
///
/// Runs once: an interval that already carries a status is returned as is.
/// Flags attached earlier in the pipeline (re-anchor fallback) take part in
/// the rollup.
pub fn assess(interval: &mut RecoveryInterval, config: &HrrConfig) -> QualityStatus {
    if interval.quality_status != QualityStatus::Unassessed {
        return interval.quality_status;
    }

    let flags = assessment_flags(interval, config);
    interval.quality_flags.extend(flags);
    interval.quality_status = rollup(&interval.quality_flags);

    debug!(
        order = interval.interval_order,
        status = %interval.quality_status,
        flags = ?interval.quality_flags,
        "Assessed recovery interval"
    );

    interval.quality_status
}
