//! Session pipeline and batch processing
//!
//! One path from samples to stored intervals:
//!
//! prepare → detect → re-anchor → fit → assess → persist
//!
//! Detection is a pure function of a session's samples and the threshold
//! set, so sessions run in parallel on a rayon pool. Sample fetching and
//! persistence stay serial; each session's interval set is written as one
//! atomic replace.

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn, Level};

use crate::config::{BatchSettings, HrrConfig};
use crate::detection::{detect_candidates, IntervalCandidate};
use crate::error::{HrrError, Result};
use crate::fitting::{fit_windows, late_slope};
use crate::logging::batch_span;
use crate::models::{DetectionMethod, QualityFlag, QualityStatus, RecoveryInterval, SessionSamples};
use crate::quality::assess;
use crate::reanchor::{reanchor, ReanchorOutcome};
use crate::signal::{prepare, SignalSegment};

/// Where session samples come from
pub trait SampleSource {
    fn list_sessions(&self) -> Result<Vec<String>>;
    fn fetch_samples(&self, session_id: &str) -> Result<SessionSamples>;
}

/// Where finished interval sets go
pub trait IntervalStore {
    /// Replace every stored interval of the session with `intervals`
    fn replace_intervals(
        &mut self,
        session_id: &str,
        intervals: &[RecoveryInterval],
        config_version: &str,
    ) -> Result<usize>;
}

fn build_interval(
    segment: &SignalSegment,
    candidate: &IntervalCandidate,
    outcome: &ReanchorOutcome,
    config: &HrrConfig,
) -> RecoveryInterval {
    let mut quality_flags = BTreeSet::new();
    let detection_method = match outcome {
        ReanchorOutcome::Reanchored { .. } => DetectionMethod::Reanchored,
        ReanchorOutcome::FellBack { .. } => {
            quality_flags.insert(QualityFlag::ReanchorFallback);
            DetectionMethod::Standard
        }
        ReanchorOutcome::NotNeeded => DetectionMethod::Standard,
    };

    let late = late_slope(&segment.raw, candidate.peak_index, config);

    RecoveryInterval {
        interval_order: 0,
        peak_time: segment.time_at(candidate.peak_index),
        peak_hr: candidate.peak_hr,
        trough_time: segment.time_at(candidate.trough_index),
        trough_hr: candidate.trough_hr,
        duration_seconds: candidate.duration() as u32,
        total_drop: candidate.total_drop(),
        peak_above_baseline: candidate.peak_above_baseline,
        per_window: fit_windows(&segment.raw, candidate.peak_index, candidate.peak_hr, config),
        late_slope: late.map(|fit| fit.slope),
        late_slope_r2: late.map(|fit| fit.r_squared),
        quality_status: QualityStatus::Unassessed,
        quality_flags,
        detection_method,
    }
}

/// Detect, re-anchor, fit and assess every interval of one segment
///
/// Orders are local to the segment; [`detect_session`] renumbers them.
pub fn detect_segment(
    segment: &SignalSegment,
    config: &HrrConfig,
    resting_hr: Option<f64>,
) -> Vec<RecoveryInterval> {
    detect_candidates(segment, config, resting_hr)
        .iter()
        .enumerate()
        .map(|(order, candidate)| {
            let (anchored, outcome) = reanchor(segment, candidate, config, resting_hr);
            let mut interval = build_interval(segment, &anchored, &outcome, config);
            interval.interval_order = order;
            assess(&mut interval, config);
            interval
        })
        .collect()
}

/// Full pipeline for one session, minus persistence
pub fn detect_session(session: &SessionSamples, config: &HrrConfig) -> Vec<RecoveryInterval> {
    let mut intervals: Vec<RecoveryInterval> = prepare(&session.samples, config)
        .iter()
        .flat_map(|segment| detect_segment(segment, config, session.resting_hr))
        .collect();

    for (order, interval) in intervals.iter_mut().enumerate() {
        interval.interval_order = order;
    }

    debug!(
        session = %session.session_id,
        samples = session.samples.len(),
        intervals = intervals.len(),
        "Detected recovery intervals"
    );
    intervals
}

/// SHA-256 over the canonical JSON of an interval set
pub fn fingerprint(intervals: &[RecoveryInterval]) -> Result<String> {
    let canonical = serde_json::to_vec(intervals)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Outcome of processing one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub detected: usize,
    pub passed: usize,
    pub flagged: usize,
    pub rejected: usize,
    pub reanchored: usize,
    pub fingerprint: String,
}

impl SessionSummary {
    pub fn from_intervals(session_id: &str, intervals: &[RecoveryInterval]) -> Result<Self> {
        let count = |status: QualityStatus| {
            intervals
                .iter()
                .filter(|i| i.quality_status == status)
                .count()
        };

        Ok(Self {
            session_id: session_id.to_string(),
            detected: intervals.len(),
            passed: count(QualityStatus::Pass),
            flagged: count(QualityStatus::Flagged),
            rejected: count(QualityStatus::Rejected),
            reanchored: intervals
                .iter()
                .filter(|i| i.detection_method == DetectionMethod::Reanchored)
                .count(),
            fingerprint: fingerprint(intervals)?,
        })
    }
}

/// Aggregate over a batch run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_sessions: usize,
    pub processed_sessions: usize,
    pub failed_sessions: usize,
    pub total_intervals: usize,
    pub passed: usize,
    pub flagged: usize,
    pub rejected: usize,
    pub reanchored: usize,
    pub dry_run: bool,
    pub config_version: String,
    pub total_duration_ms: u128,
    pub sessions: Vec<SessionSummary>,
    pub errors: Vec<(String, String)>,
}

impl BatchSummary {
    fn record(&mut self, session: SessionSummary) {
        self.processed_sessions += 1;
        self.total_intervals += session.detected;
        self.passed += session.passed;
        self.flagged += session.flagged;
        self.rejected += session.rejected;
        self.reanchored += session.reanchored;
        self.sessions.push(session);
    }

    fn record_failure(&mut self, session_id: &str, error: &HrrError) {
        self.failed_sessions += 1;
        self.errors.push((session_id.to_string(), error.user_message()));
    }

    /// Sessions per second
    pub fn throughput(&self) -> f64 {
        if self.total_duration_ms == 0 {
            return 0.0;
        }
        (self.processed_sessions as f64 / self.total_duration_ms as f64) * 1000.0
    }

    pub fn is_fully_successful(&self) -> bool {
        self.failed_sessions == 0
    }

    /// Get human-readable summary
    pub fn to_string_pretty(&self) -> String {
        format!(
            "HRR Batch Summary{}\n  \
             Threshold Set: {}\n  \
             Sessions: {} ({} processed, {} failed)\n  \
             Intervals: {}\n  \
             Pass / Flagged / Rejected: {} / {} / {}\n  \
             Re-anchored: {}\n  \
             Total Time: {:.2}s\n  \
             Throughput: {:.2} sessions/sec",
            if self.dry_run { " (dry run)" } else { "" },
            self.config_version,
            self.total_sessions,
            self.processed_sessions,
            self.failed_sessions,
            self.total_intervals,
            self.passed,
            self.flagged,
            self.rejected,
            self.reanchored,
            self.total_duration_ms as f64 / 1000.0,
            self.throughput()
        )
    }
}

/// Runs the pipeline over sessions from a store and writes results back
pub struct SessionProcessor<S> {
    store: S,
    config: HrrConfig,
    settings: BatchSettings,
}

impl<S: SampleSource + IntervalStore> SessionProcessor<S> {
    pub fn new(store: S, config: HrrConfig, settings: BatchSettings) -> Self {
        Self {
            store,
            config,
            settings,
        }
    }

    pub fn config(&self) -> &HrrConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Fetch, detect and persist a single session
    pub fn process_session(&mut self, session_id: &str) -> Result<SessionSummary> {
        let session = self.store.fetch_samples(session_id)?;
        let intervals = detect_session(&session, &self.config);
        self.store
            .replace_intervals(session_id, &intervals, &self.config.version)?;

        let summary = SessionSummary::from_intervals(session_id, &intervals)?;
        info!(
            session = session_id,
            detected = summary.detected,
            passed = summary.passed,
            flagged = summary.flagged,
            rejected = summary.rejected,
            "Processed session"
        );
        Ok(summary)
    }

    /// Process every session the source knows about
    pub fn process_all(&mut self, dry_run: bool) -> Result<BatchSummary> {
        let session_ids = self.store.list_sessions()?;
        self.process_sessions(&session_ids, dry_run)
    }

    /// Process the given sessions in chunks
    ///
    /// A session whose samples cannot be fetched is recorded as failed and
    /// skipped. A persistence failure aborts the batch; sessions already
    /// written stay written.
    pub fn process_sessions(&mut self, session_ids: &[String], dry_run: bool) -> Result<BatchSummary> {
        let start_time = std::time::Instant::now();
        let _span = batch_span(&self.config.version, dry_run).entered();
        info!(
            sessions = session_ids.len(),
            dry_run,
            version = %self.config.version,
            "Starting HRR batch"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.num_threads.unwrap_or(0))
            .build()
            .map_err(|e| HrrError::Configuration(format!("Failed to create thread pool: {}", e)))?;

        let progress = if self.settings.show_progress {
            let pb = ProgressBar::new(session_ids.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({msg})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut summary = BatchSummary {
            total_sessions: session_ids.len(),
            dry_run,
            config_version: self.config.version.clone(),
            ..BatchSummary::default()
        };

        for chunk in session_ids.chunks(self.settings.chunk_size.max(1)) {
            let mut fetched = Vec::with_capacity(chunk.len());
            for session_id in chunk {
                match self.store.fetch_samples(session_id) {
                    Ok(session) => fetched.push(session),
                    Err(e) => {
                        let retryable = e.is_retryable();
                        if e.severity().to_tracing_level() == Level::WARN {
                            warn!(session = %session_id, error = %e, retryable, "Skipping session");
                        } else {
                            error!(session = %session_id, error = %e, retryable, "Skipping session");
                        }
                        summary.record_failure(session_id, &e);
                        progress.inc(1);
                    }
                }
            }

            let config = &self.config;
            let detected: Vec<Vec<RecoveryInterval>> = pool.install(|| {
                fetched
                    .par_iter()
                    .map(|session| detect_session(session, config))
                    .collect()
            });

            for (session, intervals) in fetched.iter().zip(detected) {
                if !dry_run {
                    self.store
                        .replace_intervals(&session.session_id, &intervals, &self.config.version)?;
                }
                summary.record(SessionSummary::from_intervals(&session.session_id, &intervals)?);
                progress.set_message(session.session_id.clone());
                progress.inc(1);
            }
        }

        progress.finish_with_message("Complete");
        summary.total_duration_ms = start_time.elapsed().as_millis();
        info!("{}", summary.to_string_pretty());

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HrSample;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::HashMap;

    /// In-memory source and sink
    #[derive(Default)]
    struct MemoryStore {
        sessions: HashMap<String, SessionSamples>,
        written: HashMap<String, (Vec<RecoveryInterval>, String)>,
    }

    impl SampleSource for MemoryStore {
        fn list_sessions(&self) -> Result<Vec<String>> {
            let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        }

        fn fetch_samples(&self, session_id: &str) -> Result<SessionSamples> {
            self.sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| HrrError::Validation(format!("unknown session {}", session_id)))
        }
    }

    impl IntervalStore for MemoryStore {
        fn replace_intervals(
            &mut self,
            session_id: &str,
            intervals: &[RecoveryInterval],
            config_version: &str,
        ) -> Result<usize> {
            self.written.insert(
                session_id.to_string(),
                (intervals.to_vec(), config_version.to_string()),
            );
            Ok(intervals.len())
        }
    }

    /// Rest, two efforts each followed by a 150 s exponential recovery
    fn workout(id: &str) -> SessionSamples {
        let mut hr = vec![95.0; 90];
        for _ in 0..2 {
            let base = *hr.last().unwrap();
            for i in 1..=30 {
                hr.push(base + (165.0 - base) * i as f64 / 30.0);
            }
            for t in 1..=150 {
                hr.push(100.0 + 65.0 * (-(t as f64) / 35.0).exp());
            }
        }
        for i in 1..=20 {
            hr.push(100.0 + 2.0 * i as f64);
        }

        let start = Utc.with_ymd_and_hms(2024, 9, 1, 17, 0, 0).unwrap();
        SessionSamples {
            session_id: id.to_string(),
            samples: hr
                .into_iter()
                .enumerate()
                .map(|(s, bpm)| HrSample::new(start + Duration::seconds(s as i64), bpm))
                .collect(),
            resting_hr: Some(60.0),
        }
    }

    fn quiet_settings() -> BatchSettings {
        BatchSettings {
            num_threads: Some(2),
            show_progress: false,
            chunk_size: 2,
        }
    }

    #[test]
    fn test_detect_session_orders_and_assesses() {
        let intervals = detect_session(&workout("w"), &HrrConfig::default());
        assert_eq!(intervals.len(), 2);
        for (order, interval) in intervals.iter().enumerate() {
            assert_eq!(interval.interval_order, order);
            assert_ne!(interval.quality_status, QualityStatus::Unassessed);
            assert!(interval.satisfies_invariants(HrrConfig::default().r2_threshold));
        }
        assert!(intervals[0].trough_time <= intervals[1].peak_time);
    }

    #[test]
    fn test_empty_session_has_no_intervals() {
        let empty = SessionSamples {
            session_id: "empty".to_string(),
            samples: Vec::new(),
            resting_hr: None,
        };
        assert!(detect_session(&empty, &HrrConfig::default()).is_empty());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let config = HrrConfig::default();
        let a = detect_session(&workout("w"), &config);
        let b = detect_session(&workout("w"), &config);
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&a[..1]).unwrap());
    }

    #[test]
    fn test_batch_persists_and_counts() {
        let mut store = MemoryStore::default();
        for id in ["a", "b", "c"] {
            store.sessions.insert(id.to_string(), workout(id));
        }

        let mut processor = SessionProcessor::new(store, HrrConfig::default(), quiet_settings());
        let summary = processor.process_all(false).unwrap();

        assert_eq!(summary.total_sessions, 3);
        assert_eq!(summary.processed_sessions, 3);
        assert_eq!(summary.total_intervals, 6);
        assert_eq!(summary.passed + summary.flagged + summary.rejected, 6);
        assert!(summary.is_fully_successful());

        let store = processor.into_store();
        assert_eq!(store.written.len(), 3);
        assert_eq!(store.written["b"].1, "default");
    }

    #[test]
    fn test_dry_run_does_not_persist() {
        let mut store = MemoryStore::default();
        store.sessions.insert("a".to_string(), workout("a"));

        let mut processor = SessionProcessor::new(store, HrrConfig::default(), quiet_settings());
        let summary = processor.process_all(true).unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.total_intervals, 2);
        assert!(processor.store().written.is_empty());
    }

    #[test]
    fn test_missing_session_is_recorded_not_fatal() {
        let mut store = MemoryStore::default();
        store.sessions.insert("a".to_string(), workout("a"));

        let mut processor = SessionProcessor::new(store, HrrConfig::default(), quiet_settings());
        let ids = vec!["a".to_string(), "ghost".to_string()];
        let summary = processor.process_sessions(&ids, false).unwrap();

        assert_eq!(summary.processed_sessions, 1);
        assert_eq!(summary.failed_sessions, 1);
        assert_eq!(summary.errors[0].0, "ghost");
        assert!(processor.process_session("ghost").is_err());
    }
}
