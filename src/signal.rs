//! Signal preparation: sparse samples to dense per-second series
//!
//! Known seconds are joined by linear interpolation as long as the gap
//! between them stays within `max_imputation_gap`. A longer gap ends the
//! current segment; nothing is ever extrapolated across it. Each segment
//! carries two views of the same seconds:
//!
//! - `raw`: the interpolated values, used for curve fitting
//! - `smoothed`: a median-filtered copy, used for peak/trough search

use chrono::{DateTime, Duration, Utc};
use statrs::statistics::{Data, Median};
use tracing::debug;

use crate::config::HrrConfig;
use crate::models::HrSample;

/// A contiguous, gap-free stretch of per-second heart rate
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSegment {
    /// Wall-clock time of index 0
    pub start: DateTime<Utc>,

    /// Interpolated heart rate, one value per second
    pub raw: Vec<f64>,

    /// Median-filtered heart rate, same length as `raw`
    pub smoothed: Vec<f64>,
}

impl SignalSegment {
    /// Wall-clock time of a per-second index
    pub fn time_at(&self, index: usize) -> DateTime<Utc> {
        self.start + Duration::seconds(index as i64)
    }
}

/// Median of a slice; None when empty
pub(crate) fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let data = Data::new(values.to_vec());
    Some(data.median())
}

/// Median filter with a window that shrinks symmetrically at the edges
///
/// Shrinking symmetrically keeps monotonic stretches untouched, so a clean
/// decline keeps its exact endpoints.
pub fn median_filter(values: &[f64], kernel: usize) -> Vec<f64> {
    let half = kernel / 2;
    let n = values.len();

    (0..n)
        .map(|i| {
            let h = half.min(i).min(n - 1 - i);
            median(&values[i - h..=i + h]).unwrap_or(values[i])
        })
        .collect()
}

/// Collapse samples to (second offset, bpm) pairs, averaging duplicates
fn known_seconds(samples: &[HrSample], origin: DateTime<Utc>, cap: i64) -> Vec<(i64, f64)> {
    let mut known: Vec<(i64, f64, usize)> = Vec::with_capacity(samples.len());

    for sample in samples {
        if !sample.heart_rate_bpm.is_finite() {
            continue;
        }
        let offset_ms = (sample.timestamp - origin).num_milliseconds();
        let second = (offset_ms as f64 / 1000.0).round() as i64;
        if second > cap {
            break;
        }

        match known.last_mut() {
            Some((last_second, sum, count)) if *last_second == second => {
                *sum += sample.heart_rate_bpm;
                *count += 1;
            }
            _ => known.push((second, sample.heart_rate_bpm, 1)),
        }
    }

    known
        .into_iter()
        .map(|(second, sum, count)| (second, sum / count as f64))
        .collect()
}

/// Linearly interpolate known seconds into a dense array starting at the first one
fn interpolate(points: &[(i64, f64)]) -> Vec<f64> {
    let (first, _) = points[0];
    let (last, _) = points[points.len() - 1];
    let mut dense = Vec::with_capacity((last - first + 1) as usize);

    for pair in points.windows(2) {
        let (t0, v0) = pair[0];
        let (t1, v1) = pair[1];
        let span = (t1 - t0) as f64;
        for t in t0..t1 {
            let frac = (t - t0) as f64 / span;
            dense.push(v0 + (v1 - v0) * frac);
        }
    }
    dense.push(points[points.len() - 1].1);

    dense
}

/// Build dense, gap-bounded segments from a session's samples
///
/// Zero or one usable sample yields no segments; the caller treats that as
/// "no intervals detected".
pub fn prepare(samples: &[HrSample], config: &HrrConfig) -> Vec<SignalSegment> {
    if samples.len() < 2 {
        return Vec::new();
    }

    let mut ordered: Vec<HrSample> = samples.to_vec();
    if ordered.windows(2).any(|w| w[0].timestamp > w[1].timestamp) {
        ordered.sort_by_key(|s| s.timestamp);
    }

    let origin = ordered[0].timestamp;
    let known = known_seconds(&ordered, origin, config.max_signal_seconds as i64);
    let max_gap = config.max_imputation_gap as i64;

    let mut segments = Vec::new();
    let mut current: Vec<(i64, f64)> = Vec::new();

    let mut flush = |run: &mut Vec<(i64, f64)>| {
        if run.len() >= 2 {
            let raw = interpolate(run);
            let smoothed = median_filter(&raw, config.smoothing_kernel);
            segments.push(SignalSegment {
                start: origin + Duration::seconds(run[0].0),
                raw,
                smoothed,
            });
        } else if !run.is_empty() {
            debug!(second = run[0].0, "Dropping isolated sample between gaps");
        }
        run.clear();
    };

    for point in known {
        if let Some(&(prev, _)) = current.last() {
            if point.0 - prev > max_gap {
                debug!(
                    from = prev,
                    to = point.0,
                    "Gap exceeds imputation limit, starting new segment"
                );
                flush(&mut current);
            }
        }
        current.push(point);
    }
    flush(&mut current);

    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn samples_at(points: &[(i64, f64)]) -> Vec<HrSample> {
        let start = Utc.with_ymd_and_hms(2024, 5, 4, 7, 30, 0).unwrap();
        points
            .iter()
            .map(|&(s, hr)| HrSample::new(start + Duration::seconds(s), hr))
            .collect()
    }

    #[test]
    fn test_too_few_samples_yield_nothing() {
        let config = HrrConfig::default();
        assert!(prepare(&[], &config).is_empty());
        assert!(prepare(&samples_at(&[(0, 120.0)]), &config).is_empty());
    }

    #[test]
    fn test_linear_interpolation_fills_small_gaps() {
        let config = HrrConfig::default();
        let segments = prepare(&samples_at(&[(0, 100.0), (4, 120.0), (5, 118.0)]), &config);

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].raw, vec![100.0, 105.0, 110.0, 115.0, 120.0, 118.0]);
    }

    #[test]
    fn test_large_gap_splits_instead_of_bridging() {
        let config = HrrConfig::default();
        let segments = prepare(
            &samples_at(&[(0, 100.0), (1, 101.0), (2, 102.0), (40, 140.0), (41, 141.0)]),
            &config,
        );

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].raw.len(), 3);
        assert_eq!(segments[1].raw.len(), 2);
        assert_eq!(segments[1].start, segments[0].start + Duration::seconds(40));
    }

    #[test]
    fn test_unsorted_and_duplicate_samples() {
        let config = HrrConfig::default();
        let segments = prepare(
            &samples_at(&[(2, 130.0), (0, 110.0), (1, 118.0), (1, 122.0)]),
            &config,
        );

        assert_eq!(segments[0].raw, vec![110.0, 120.0, 130.0]);
    }

    #[test]
    fn test_median_filter_removes_spike_and_keeps_monotone() {
        let spiky = vec![100.0, 100.0, 100.0, 180.0, 100.0, 100.0, 100.0];
        assert!(median_filter(&spiky, 5).iter().all(|&v| v == 100.0));

        let decline: Vec<f64> = (0..20).map(|i| 150.0 - i as f64 * 2.0).collect();
        assert_eq!(median_filter(&decline, 5), decline);
    }

    #[test]
    fn test_signal_is_capped() {
        let config = HrrConfig {
            max_signal_seconds: 60,
            ..HrrConfig::default()
        };
        let points: Vec<(i64, f64)> = (0..120).map(|s| (s, 120.0)).collect();
        let segments = prepare(&samples_at(&points), &config);
        assert_eq!(segments[0].raw.len(), 61);
    }
}
