use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Single heart-rate observation supplied by the session store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrSample {
    /// Wall-clock time of the observation
    pub timestamp: DateTime<Utc>,

    /// Heart rate in beats per minute
    pub heart_rate_bpm: f64,
}

impl HrSample {
    pub fn new(timestamp: DateTime<Utc>, heart_rate_bpm: f64) -> Self {
        Self {
            timestamp,
            heart_rate_bpm,
        }
    }
}

/// Everything the detector needs to know about one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSamples {
    /// External session identifier
    pub session_id: String,

    /// Samples ordered by timestamp
    pub samples: Vec<HrSample>,

    /// Optional resting heart rate reference for the athlete
    pub resting_hr: Option<f64>,
}

/// Trust state of a recovery interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityStatus {
    /// Not yet seen by the quality assessor
    Unassessed,
    /// Usable without reservations
    Pass,
    /// Usable, but carries at least one warning flag
    Flagged,
    /// Kept for inspection, not for analytics
    Rejected,
}

impl QualityStatus {
    /// Severity rank used for the status rollup (REJECTED > FLAGGED > PASS)
    pub fn severity_rank(&self) -> u8 {
        match self {
            QualityStatus::Unassessed => 0,
            QualityStatus::Pass => 1,
            QualityStatus::Flagged => 2,
            QualityStatus::Rejected => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityStatus::Unassessed => "UNASSESSED",
            QualityStatus::Pass => "PASS",
            QualityStatus::Flagged => "FLAGGED",
            QualityStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QualityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNASSESSED" => Ok(QualityStatus::Unassessed),
            "PASS" => Ok(QualityStatus::Pass),
            "FLAGGED" => Ok(QualityStatus::Flagged),
            "REJECTED" => Ok(QualityStatus::Rejected),
            _ => Err(format!("Invalid quality status: {}", s)),
        }
    }
}

/// Evidence tags attached to an interval by fitting, re-anchoring and assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityFlag {
    /// No window produced a defined fit above the reject floor
    NoValidFit,
    /// Interval shorter than the hard duration floor
    ShortDuration,
    /// Late-window slope shows HR rising again
    LateRise,
    /// Best R² sits between the reject floor and the trust threshold
    AmbiguousFit,
    /// A double peak was found but the re-anchored candidate failed the gates
    ReanchorFallback,
}

impl QualityFlag {
    /// Status this flag forces at minimum
    pub fn severity(&self) -> QualityStatus {
        match self {
            QualityFlag::NoValidFit | QualityFlag::ShortDuration => QualityStatus::Rejected,
            QualityFlag::LateRise | QualityFlag::AmbiguousFit | QualityFlag::ReanchorFallback => {
                QualityStatus::Flagged
            }
        }
    }
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            QualityFlag::NoValidFit => "NO_VALID_FIT",
            QualityFlag::ShortDuration => "SHORT_DURATION",
            QualityFlag::LateRise => "LATE_RISE",
            QualityFlag::AmbiguousFit => "AMBIGUOUS_FIT",
            QualityFlag::ReanchorFallback => "REANCHOR_FALLBACK",
        };
        write!(f, "{}", tag)
    }
}

/// How the interval's peak was anchored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionMethod {
    Standard,
    Reanchored,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Standard => "STANDARD",
            DetectionMethod::Reanchored => "REANCHORED",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DetectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STANDARD" => Ok(DetectionMethod::Standard),
            "REANCHORED" => Ok(DetectionMethod::Reanchored),
            _ => Err(format!("Invalid detection method: {}", s)),
        }
    }
}

/// Why a window has no fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitFailure {
    /// Fewer points than the configured minimum
    InsufficientPoints,
    /// Solver hit its iteration cap or produced non-finite values
    NonConvergent,
}

/// Exponential fit result for one fixed feature window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowFit {
    /// Coefficient of determination, always reported when the fit is defined
    pub r_squared: Option<f64>,

    /// Drop in bpm from the peak at the window end; only set for trusted fits
    pub hrr_value: Option<f64>,

    /// Fitted amplitude A (bpm)
    pub amplitude: Option<f64>,

    /// Fitted decay constant tau (seconds)
    pub tau: Option<f64>,

    /// Fitted asymptote C (bpm)
    pub asymptote: Option<f64>,

    /// Number of points the fit was attempted on
    pub points: usize,

    /// Signal ended before the window did. The fit and `hrr_value` cover
    /// the `points - 1` seconds that were recorded.
    #[serde(default)]
    pub truncated: bool,

    /// Reason the fit is undefined
    pub failure: Option<FitFailure>,
}

impl WindowFit {
    pub fn undefined(failure: FitFailure, points: usize) -> Self {
        Self {
            r_squared: None,
            hrr_value: None,
            amplitude: None,
            tau: None,
            asymptote: None,
            points,
            truncated: false,
            failure: Some(failure),
        }
    }

    pub fn is_defined(&self) -> bool {
        self.r_squared.is_some()
    }
}

/// A detected heart-rate recovery interval with its windowed features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryInterval {
    /// Position within the session, 0-based and time-ordered
    pub interval_order: usize,

    pub peak_time: DateTime<Utc>,
    pub peak_hr: f64,
    pub trough_time: DateTime<Utc>,
    pub trough_hr: f64,

    /// trough_time - peak_time
    pub duration_seconds: u32,

    /// peak_hr - trough_hr
    pub total_drop: f64,

    /// Peak elevation over the local pre-peak baseline
    pub peak_above_baseline: f64,

    /// Per fixed window (seconds) fit results
    pub per_window: BTreeMap<u32, WindowFit>,

    /// OLS slope over the late sub-window (bpm/s)
    pub late_slope: Option<f64>,
    pub late_slope_r2: Option<f64>,

    pub quality_status: QualityStatus,
    pub quality_flags: BTreeSet<QualityFlag>,
    pub detection_method: DetectionMethod,
}

impl RecoveryInterval {
    /// Highest R² over all defined windows
    pub fn best_r_squared(&self) -> Option<f64> {
        self.per_window
            .values()
            .filter_map(|fit| fit.r_squared)
            .fold(None, |best, r2| match best {
                Some(b) if b >= r2 => Some(b),
                _ => Some(r2),
            })
    }

    /// Trusted HRR value for a window, if any
    pub fn hrr_value(&self, window_seconds: u32) -> Option<f64> {
        self.per_window
            .get(&window_seconds)
            .and_then(|fit| fit.hrr_value)
    }

    /// Structural invariants every persisted interval must hold
    pub fn satisfies_invariants(&self, r2_threshold: f64) -> bool {
        let ordered = self.peak_time < self.trough_time && self.peak_hr >= self.trough_hr;
        let duration_ok =
            (self.trough_time - self.peak_time).num_seconds() == self.duration_seconds as i64;
        let windows_ok = self.per_window.values().all(|fit| {
            let r2_range = fit.r_squared.map_or(true, |r2| (0.0..=1.0).contains(&r2));
            let gated = fit.hrr_value.is_some() == fit.r_squared.map_or(false, |r2| r2 >= r2_threshold);
            r2_range && gated
        });
        ordered && duration_ok && windows_ok
    }
}
