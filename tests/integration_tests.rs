use chrono::{DateTime, Duration, TimeZone, Utc};
use hrrs::{
    calibrate, detect_session, BatchSettings, CalibrationSettings, Database, DetectionMethod, HrSample,
    HrrConfig, QualityFlag, QualityStatus, SessionProcessor, SessionSamples,
};
use std::collections::BTreeSet;

/// Integration tests covering the full samples-to-storage workflow

#[cfg(test)]
mod integration_tests {
    use super::*;
    use hrrs::fitting::fit_exponential;
    use hrrs::pipeline::fingerprint;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 20, 18, 30, 0).unwrap()
    }

    fn session_from(id: &str, hr: Vec<f64>, resting_hr: Option<f64>) -> SessionSamples {
        SessionSamples {
            session_id: id.to_string(),
            samples: hr
                .into_iter()
                .enumerate()
                .map(|(s, bpm)| HrSample::new(start() + Duration::seconds(s as i64), bpm))
                .collect(),
            resting_hr,
        }
    }

    /// 60 s rest at 90, 3 bpm/s climb to 150, 180 s exponential-shaped
    /// decline ending exactly at 90, then a 3 bpm/s climb
    fn clean_recovery() -> Vec<f64> {
        let mut hr = vec![90.0; 60];
        for i in 1..=20 {
            hr.push(90.0 + 3.0 * i as f64);
        }
        let tail = (-180.0f64 / 40.0).exp();
        for t in 1..=180 {
            let shape = ((-(t as f64) / 40.0).exp() - tail) / (1.0 - tail);
            hr.push(90.0 + 60.0 * shape);
        }
        for i in 1..=15 {
            hr.push(90.0 + 3.0 * i as f64);
        }
        hr
    }

    /// Climb to 160, sag to 140, gentle climb to 165, linear decline to 90
    fn double_peak(decline_seconds: usize) -> Vec<f64> {
        let mut hr = vec![100.0; 60];
        for i in 1..=20 {
            hr.push(100.0 + 3.0 * i as f64);
        }
        for i in 1..=25 {
            hr.push(160.0 - 0.8 * i as f64);
        }
        hr.extend(vec![140.0; 30]);
        for i in 1..=50 {
            hr.push(140.0 + 0.5 * i as f64);
        }
        for i in 1..=decline_seconds {
            hr.push(165.0 - 75.0 * i as f64 / decline_seconds as f64);
        }
        for i in 1..=15 {
            hr.push(90.0 + 3.0 * i as f64);
        }
        hr
    }

    /// Climb to 160, 1 bpm/s sag to 140, 15 s climb to 165, 3-minute
    /// exponential-shaped decline to 90
    fn steep_double_peak() -> Vec<f64> {
        let mut hr = vec![100.0; 60];
        for i in 1..=20 {
            hr.push(100.0 + 3.0 * i as f64);
        }
        for i in 1..=20 {
            hr.push(160.0 - i as f64);
        }
        for i in 1..=15 {
            hr.push(140.0 + 25.0 * i as f64 / 15.0);
        }
        let tail = (-180.0f64 / 40.0).exp();
        for t in 1..=180 {
            let shape = ((-(t as f64) / 40.0).exp() - tail) / (1.0 - tail);
            hr.push(90.0 + 75.0 * shape);
        }
        for i in 1..=15 {
            hr.push(90.0 + 3.0 * i as f64);
        }
        hr
    }

    fn quiet_batch() -> BatchSettings {
        BatchSettings {
            num_threads: Some(2),
            show_progress: false,
            chunk_size: 4,
        }
    }

    #[test]
    fn test_exact_exponential_fit() {
        let t: Vec<f64> = (0..=120).map(|s| s as f64).collect();
        let y: Vec<f64> = t.iter().map(|s| 60.0 * (-s / 30.0).exp() + 90.0).collect();

        let config = HrrConfig::default();
        let fit = fit_exponential(&t, &y, &config.bounds, config.max_fit_iterations).unwrap();
        assert!(fit.r_squared >= 0.99);
        assert!((fit.tau - 30.0).abs() <= 3.0);
    }

    #[test]
    fn test_clean_decline_yields_one_passing_interval() {
        let config = HrrConfig::default();
        let intervals = detect_session(&session_from("clean", clean_recovery(), None), &config);

        assert_eq!(intervals.len(), 1);
        let interval = &intervals[0];
        assert_eq!(interval.duration_seconds, 180);
        assert_eq!(interval.total_drop, 60.0);
        assert_eq!(interval.peak_hr, 150.0);
        assert_eq!(interval.trough_hr, 90.0);
        assert_eq!(interval.peak_time, start() + Duration::seconds(79));
        assert!(interval.hrr_value(60).is_some());
        assert_eq!(interval.quality_status, QualityStatus::Pass);
        assert_eq!(interval.detection_method, DetectionMethod::Standard);
        assert!(interval.satisfies_invariants(config.r2_threshold));
    }

    #[test]
    fn test_double_peak_is_reanchored_on_second_peak() {
        let config = HrrConfig::default();
        let intervals = detect_session(&session_from("double", double_peak(180), None), &config);

        assert_eq!(intervals.len(), 1);
        let interval = &intervals[0];
        assert_eq!(interval.detection_method, DetectionMethod::Reanchored);
        assert_eq!(interval.peak_hr, 165.0);
        assert_eq!(interval.duration_seconds, 180);
        assert_eq!(interval.trough_hr, 90.0);
        assert!(interval.satisfies_invariants(config.r2_threshold));
    }

    #[test]
    fn test_steep_second_climb_anchors_directly_on_second_peak() {
        let config = HrrConfig::default();
        let intervals = detect_session(&session_from("steep", steep_double_peak(), None), &config);

        assert_eq!(intervals.len(), 1);
        let interval = &intervals[0];
        assert_eq!(interval.detection_method, DetectionMethod::Standard);
        assert_eq!(interval.peak_hr, 165.0);
        assert_eq!(interval.peak_time, start() + Duration::seconds(114));
        assert_eq!(interval.duration_seconds, 180);
        assert_eq!(interval.quality_status, QualityStatus::Pass);
        assert!(interval.quality_flags.is_empty());
    }

    #[test]
    fn test_failed_reanchor_keeps_first_peak_and_flags() {
        let config = HrrConfig::default();
        let intervals = detect_session(&session_from("fallback", double_peak(40), None), &config);

        assert_eq!(intervals.len(), 1);
        let interval = &intervals[0];
        assert_eq!(interval.detection_method, DetectionMethod::Standard);
        assert_eq!(interval.peak_hr, 160.0);
        assert_eq!(
            interval.quality_flags,
            BTreeSet::from([QualityFlag::ReanchorFallback])
        );
        assert_eq!(interval.quality_status, QualityStatus::Flagged);
        assert!(interval.satisfies_invariants(config.r2_threshold));
    }

    #[test]
    fn test_recording_ending_mid_recovery_still_fits_long_windows() {
        let config = HrrConfig::default();
        let mut hr = vec![90.0; 60];
        for i in 1..=20 {
            hr.push(90.0 + 3.0 * i as f64);
        }
        for t in 1..=100 {
            hr.push(60.0 * (-(t as f64) / 30.0).exp() + 90.0);
        }
        let intervals = detect_session(&session_from("cut", hr, None), &config);

        assert_eq!(intervals.len(), 1);
        let interval = &intervals[0];
        assert_eq!(interval.duration_seconds, 100);
        assert!(interval.hrr_value(60).is_some());
        for w in [120, 180, 240, 300] {
            let fit = &interval.per_window[&w];
            assert!(fit.truncated, "window {} should be truncated", w);
            assert_eq!(fit.points, 101);
            assert!(fit.r_squared.unwrap() >= config.r2_threshold);
            assert_eq!(fit.hrr_value, Some(interval.total_drop));
        }
        assert_eq!(interval.quality_status, QualityStatus::Pass);
        assert!(interval.satisfies_invariants(config.r2_threshold));
    }

    #[test]
    fn test_flat_segment_has_no_intervals() {
        let intervals = detect_session(
            &session_from("flat", vec![120.0; 300], Some(60.0)),
            &HrrConfig::default(),
        );
        assert!(intervals.is_empty());
    }

    #[test]
    fn test_gap_is_never_bridged() {
        let mut session = session_from("gappy", clean_recovery(), None);
        // Drop 30 s in the middle of the decline
        session.samples.retain(|s| {
            let offset = (s.timestamp - start()).num_seconds();
            !(120..150).contains(&offset)
        });

        for interval in detect_session(&session, &HrrConfig::default()) {
            let peak = (interval.peak_time - start()).num_seconds();
            let trough = (interval.trough_time - start()).num_seconds();
            assert!(trough < 120 || peak >= 150, "interval spans the gap: {}..{}", peak, trough);
        }
    }

    #[test]
    fn test_detection_is_deterministic() {
        let config = HrrConfig::default();
        let mut hr = clean_recovery();
        hr.extend(double_peak(180));
        let session = session_from("both", hr, Some(55.0));

        let first = detect_session(&session, &config);
        let second = detect_session(&session, &config);
        assert_eq!(first, second);
        assert_eq!(fingerprint(&first).unwrap(), fingerprint(&second).unwrap());
    }

    #[test]
    fn test_reprocessing_replaces_stored_set() {
        let mut db = Database::open_in_memory().unwrap();
        db.store_session(&session_from("clean", clean_recovery(), None)).unwrap();
        db.store_session(&session_from("double", double_peak(180), None)).unwrap();

        let mut processor = SessionProcessor::new(db, HrrConfig::default(), quiet_batch());
        let first = processor.process_all(false).unwrap();
        let stored_first = processor.store().load_intervals("double").unwrap();

        let second = processor.process_all(false).unwrap();
        let stored_second = processor.store().load_intervals("double").unwrap();

        assert_eq!(first.total_intervals, 2);
        assert_eq!(first.total_intervals, second.total_intervals);
        assert_eq!(stored_first, stored_second);
        assert_eq!(processor.store().get_stats().unwrap().interval_count, 2);

        let fingerprints = |summary: &hrrs::BatchSummary| {
            summary
                .sessions
                .iter()
                .map(|s| s.fingerprint.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(fingerprints(&first), fingerprints(&second));
        assert_eq!(
            fingerprint(&stored_second).unwrap(),
            second.sessions.iter().find(|s| s.session_id == "double").unwrap().fingerprint
        );
    }

    #[test]
    fn test_dry_run_leaves_store_untouched() {
        let mut db = Database::open_in_memory().unwrap();
        db.store_session(&session_from("clean", clean_recovery(), None)).unwrap();

        let mut processor = SessionProcessor::new(db, HrrConfig::default(), quiet_batch());
        let summary = processor.process_all(true).unwrap();

        assert_eq!(summary.total_intervals, 1);
        assert_eq!(summary.passed, 1);
        assert!(processor.store().load_intervals("clean").unwrap().is_empty());
    }

    #[test]
    fn test_process_single_session_records_config_version() {
        let mut db = Database::open_in_memory().unwrap();
        db.store_session(&session_from("clean", clean_recovery(), None)).unwrap();

        let config = HrrConfig {
            version: "pinned-1".to_string(),
            ..HrrConfig::default()
        };
        let mut processor = SessionProcessor::new(db, config, quiet_batch());
        let summary = processor.process_session("clean").unwrap();

        assert_eq!(summary.detected, 1);
        assert_eq!(
            processor.store().interval_config_versions("clean").unwrap(),
            vec!["pinned-1".to_string()]
        );
    }

    /// Rest with a little periodic noise, then repeated efforts with
    /// exponential recoveries of varying speed
    fn calibration_session(id: &str, taus: &[f64]) -> SessionSamples {
        let noise = [0.0, 0.4, 0.2, -0.2];
        let rest = |hr: &mut Vec<f64>, seconds: usize| {
            for i in 0..seconds {
                hr.push(68.0 + noise[i % noise.len()]);
            }
        };

        let mut hr = Vec::new();
        rest(&mut hr, 300);
        for &tau in taus {
            for i in 1..=30 {
                hr.push(68.0 + 3.0 * i as f64);
            }
            for t in 1..=240 {
                hr.push(68.0 + 90.0 * (-(t as f64) / tau).exp());
            }
            rest(&mut hr, 120);
        }
        session_from(id, hr, Some(60.0))
    }

    #[test]
    fn test_calibrated_set_drives_processing() {
        let mut db = Database::open_in_memory().unwrap();
        let sessions = vec![
            calibration_session("a", &[24.0, 31.0, 27.0]),
            calibration_session("b", &[35.0, 29.0]),
        ];
        for session in &sessions {
            db.store_session(session).unwrap();
        }

        let result = calibrate(&sessions, &HrrConfig::default(), &CalibrationSettings::default()).unwrap();
        db.save_threshold_set(&result.thresholds, "calibration", true).unwrap();

        let active = db.load_threshold_config(None).unwrap().unwrap();
        assert_eq!(active, result.thresholds);
        assert_eq!(active.version, result.version);

        let mut processor = SessionProcessor::new(db, active, quiet_batch());
        let summary = processor.process_all(false).unwrap();
        assert_eq!(summary.config_version, result.version);
        assert!(summary.is_fully_successful());
        assert!(summary.total_intervals >= 4);
    }
}
