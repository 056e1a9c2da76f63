use chrono::{Duration, TimeZone, Utc};
use hrrs::quality::rollup;
use hrrs::{detect_session, HrSample, HrrConfig, QualityStatus, SessionSamples};
use proptest::prelude::*;

/// Property tests: structural invariants of detected intervals hold for
/// arbitrary effort/recovery shapes

#[derive(Debug, Clone)]
struct Bout {
    rise_seconds: usize,
    peak: f64,
    tau: f64,
    recovery_seconds: usize,
    jitter: f64,
}

fn bout_strategy() -> impl Strategy<Value = Bout> {
    (10usize..60, 125.0f64..185.0, 15.0f64..90.0, 20usize..260, 0.0f64..2.0).prop_map(
        |(rise_seconds, peak, tau, recovery_seconds, jitter)| Bout {
            rise_seconds,
            peak,
            tau,
            recovery_seconds,
            jitter,
        },
    )
}

fn build_session(rest: f64, bouts: &[Bout], gap_after: Option<usize>) -> SessionSamples {
    let mut hr = vec![rest; 90];
    for bout in bouts {
        let from = *hr.last().unwrap();
        for i in 1..=bout.rise_seconds {
            hr.push(from + (bout.peak - from) * i as f64 / bout.rise_seconds as f64);
        }
        for t in 1..=bout.recovery_seconds {
            let wobble = bout.jitter * (((hr.len() * 7919) % 13) as f64 / 6.0 - 1.0);
            hr.push(rest + (bout.peak - rest) * (-(t as f64) / bout.tau).exp() + wobble);
        }
    }

    let start = Utc.with_ymd_and_hms(2024, 8, 3, 10, 0, 0).unwrap();
    let mut samples: Vec<HrSample> = hr
        .into_iter()
        .enumerate()
        .map(|(s, bpm)| HrSample::new(start + Duration::seconds(s as i64), bpm))
        .collect();

    if let Some(at) = gap_after {
        let at = at.min(samples.len());
        samples.drain(at..(at + 25).min(samples.len()));
    }

    SessionSamples {
        session_id: "prop".to_string(),
        samples,
        resting_hr: Some(rest),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_interval_invariants(
        rest in 50.0f64..80.0,
        bouts in prop::collection::vec(bout_strategy(), 1..4),
        gap_after in prop::option::of(100usize..600),
    ) {
        let config = HrrConfig::default();
        let session = build_session(rest, &bouts, gap_after);
        let intervals = detect_session(&session, &config);

        for (order, interval) in intervals.iter().enumerate() {
            prop_assert_eq!(interval.interval_order, order);
            prop_assert!(interval.peak_time < interval.trough_time);
            prop_assert!(interval.peak_hr >= interval.trough_hr);
            prop_assert!(interval.satisfies_invariants(config.r2_threshold));
            prop_assert!(interval.duration_seconds >= config.min_run_duration);
            prop_assert!(interval.total_drop >= config.min_drop_abs);
            prop_assert!(interval.quality_status != QualityStatus::Unassessed);
            prop_assert_eq!(interval.quality_status, rollup(&interval.quality_flags));

            for fit in interval.per_window.values() {
                if let Some(r2) = fit.r_squared {
                    prop_assert!((0.0..=1.0).contains(&r2));
                }
                prop_assert_eq!(fit.r_squared.is_some(), fit.failure.is_none());
            }
        }

        for pair in intervals.windows(2) {
            prop_assert!(pair[0].trough_time < pair[1].peak_time);
        }
    }

    #[test]
    fn test_detection_is_a_pure_function(
        rest in 50.0f64..80.0,
        bouts in prop::collection::vec(bout_strategy(), 1..3),
    ) {
        let config = HrrConfig::default();
        let session = build_session(rest, &bouts, None);
        prop_assert_eq!(detect_session(&session, &config), detect_session(&session, &config));
    }

    #[test]
    fn test_median_filter_stays_within_input_range(
        values in prop::collection::vec(40.0f64..220.0, 1..200),
        half in 0usize..4,
    ) {
        let smoothed = hrrs::signal::median_filter(&values, 2 * half + 1);
        let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        prop_assert_eq!(smoothed.len(), values.len());
        prop_assert!(smoothed.iter().all(|v| *v >= lo && *v <= hi));
    }

    #[test]
    fn test_r_squared_bounded(
        observed in prop::collection::vec(40.0f64..220.0, 2..100),
        offset in -30.0f64..30.0,
    ) {
        let predicted: Vec<f64> = observed.iter().map(|v| v + offset).collect();
        let r2 = hrrs::fitting::r_squared(&observed, &predicted);
        prop_assert!((0.0..=1.0).contains(&r2));
    }
}
