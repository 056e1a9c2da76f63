use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::HrrError;
use crate::logging::LogConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite database holding sessions, samples, intervals and threshold sets
    pub database_path: PathBuf,

    /// Threshold version to load from the database instead of `hrr`
    pub threshold_version: Option<String>,

    /// Application metadata
    pub metadata: ConfigMetadata,

    /// Detection thresholds used when no stored version is selected
    pub hrr: HrrConfig,

    /// Batch runner settings
    pub batch: BatchSettings,

    /// Logging settings
    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

/// Batch processing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Worker threads for session processing (rayon default when absent)
    pub num_threads: Option<usize>,

    /// Show a progress bar while processing
    pub show_progress: bool,

    /// Sessions loaded and processed per chunk
    pub chunk_size: usize,
}

/// Parameter bounds for the exponential recovery model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitBounds {
    pub amplitude_min: f64,
    pub amplitude_max: f64,
    pub tau_min: f64,
    pub tau_max: f64,
    pub asymptote_min: f64,
    pub asymptote_max: f64,
}

impl Default for FitBounds {
    fn default() -> Self {
        FitBounds {
            amplitude_min: 0.0,
            amplitude_max: 200.0,
            tau_min: 1.0,
            tau_max: 300.0,
            asymptote_min: 30.0,
            asymptote_max: 200.0,
        }
    }
}

/// Immutable threshold set threaded through every detection stage
///
/// Durations are in seconds, heart rates in bpm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrrConfig {
    /// Version tag of this threshold set
    pub version: String,

    /// Median filter kernel size (odd)
    pub smoothing_kernel: usize,

    /// Largest per-second rise still counted as "non-rising" (noise tolerance)
    pub allowed_rise: f64,

    /// Minimum length of a non-rising run
    pub min_run_duration: u32,

    /// Minimum peak-to-trough drop
    pub min_drop_abs: f64,

    /// Minimum elevation of the peak above its local baseline
    pub min_peak_minus_rest: f64,

    /// Seconds preceding a peak used as its local baseline
    pub baseline_window: u32,

    /// Samples required in the baseline window before the resting reference is used
    pub min_baseline_points: usize,

    /// Seconds searched backward from a run start for its peak
    pub peak_lookback: u32,

    /// R² at or above which a window's HRR value is trusted
    pub r2_threshold: f64,

    /// R² below which a fit does not count as valid at all
    pub r2_reject_floor: f64,

    /// Intervals shorter than this are rejected outright
    pub min_duration_floor: u32,

    /// Fixed feature windows
    pub windows: Vec<u32>,

    /// Longest gap bridged by linear interpolation
    pub max_imputation_gap: u32,

    /// Cap on the length of the dense per-second signal
    pub max_signal_seconds: u32,

    /// Minimum points for any fit
    pub min_fit_points: usize,

    /// Iteration cap for the nonlinear solver
    pub max_fit_iterations: usize,

    /// Late sub-window used for the linear slope
    pub late_window_start: u32,
    pub late_window_end: u32,

    /// Late slope above this is treated as a rise
    pub late_slope_rise: f64,

    /// Seconds before the trough searched for a second peak
    pub reanchor_lookback: u32,

    /// Decline between the first and second peak needed to call it a plateau
    pub reanchor_min_dip: f64,

    /// Re-rise into the second peak needed to call it a plateau
    pub reanchor_min_rise: f64,

    /// Model parameter bounds
    pub bounds: FitBounds,
}

impl Default for HrrConfig {
    fn default() -> Self {
        HrrConfig {
            version: "default".to_string(),
            smoothing_kernel: 5,
            allowed_rise: 1.0,
            min_run_duration: 60,
            min_drop_abs: 10.0,
            min_peak_minus_rest: 10.0,
            baseline_window: 60,
            min_baseline_points: 5,
            peak_lookback: 20,
            r2_threshold: 0.75,
            r2_reject_floor: 0.5,
            min_duration_floor: 30,
            windows: vec![30, 60, 120, 180, 240, 300],
            max_imputation_gap: 10,
            max_signal_seconds: 6 * 3600,
            min_fit_points: 10,
            max_fit_iterations: 200,
            late_window_start: 90,
            late_window_end: 120,
            late_slope_rise: 0.0,
            reanchor_lookback: 300,
            reanchor_min_dip: 5.0,
            reanchor_min_rise: 5.0,
            bounds: FitBounds::default(),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, HrrError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| HrrError::Configuration(format!("invalid value for {}: '{}'", key, value)))
}

impl HrrConfig {
    /// Flatten into the versioned key/value form used by the threshold store
    pub fn to_key_values(&self) -> BTreeMap<String, String> {
        let mut kv = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            kv.insert(k.to_string(), v);
        };

        put("version", self.version.clone());
        put("smoothing_kernel", self.smoothing_kernel.to_string());
        put("allowed_rise", self.allowed_rise.to_string());
        put("min_run_duration", self.min_run_duration.to_string());
        put("min_drop_abs", self.min_drop_abs.to_string());
        put("min_peak_minus_rest", self.min_peak_minus_rest.to_string());
        put("baseline_window", self.baseline_window.to_string());
        put("min_baseline_points", self.min_baseline_points.to_string());
        put("peak_lookback", self.peak_lookback.to_string());
        put("r2_threshold", self.r2_threshold.to_string());
        put("r2_reject_floor", self.r2_reject_floor.to_string());
        put("min_duration_floor", self.min_duration_floor.to_string());
        put(
            "windows",
            self.windows
                .iter()
                .map(|w| w.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
        put("max_imputation_gap", self.max_imputation_gap.to_string());
        put("max_signal_seconds", self.max_signal_seconds.to_string());
        put("min_fit_points", self.min_fit_points.to_string());
        put("max_fit_iterations", self.max_fit_iterations.to_string());
        put("late_window_start", self.late_window_start.to_string());
        put("late_window_end", self.late_window_end.to_string());
        put("late_slope_rise", self.late_slope_rise.to_string());
        put("reanchor_lookback", self.reanchor_lookback.to_string());
        put("reanchor_min_dip", self.reanchor_min_dip.to_string());
        put("reanchor_min_rise", self.reanchor_min_rise.to_string());
        put("amplitude_min", self.bounds.amplitude_min.to_string());
        put("amplitude_max", self.bounds.amplitude_max.to_string());
        put("tau_min", self.bounds.tau_min.to_string());
        put("tau_max", self.bounds.tau_max.to_string());
        put("asymptote_min", self.bounds.asymptote_min.to_string());
        put("asymptote_max", self.bounds.asymptote_max.to_string());
        kv
    }

    /// Build a config from a key/value threshold set
    ///
    /// Absent keys take their documented defaults; a present but unparsable
    /// value, or a resulting set that fails validation, is a fatal error.
    pub fn from_key_values(kv: &BTreeMap<String, String>) -> Result<Self, HrrError> {
        let mut config = HrrConfig::default();

        for (key, value) in kv {
            match key.as_str() {
                "version" => config.version = value.clone(),
                "smoothing_kernel" => config.smoothing_kernel = parse_value(key, value)?,
                "allowed_rise" => config.allowed_rise = parse_value(key, value)?,
                "min_run_duration" => config.min_run_duration = parse_value(key, value)?,
                "min_drop_abs" => config.min_drop_abs = parse_value(key, value)?,
                "min_peak_minus_rest" => config.min_peak_minus_rest = parse_value(key, value)?,
                "baseline_window" => config.baseline_window = parse_value(key, value)?,
                "min_baseline_points" => config.min_baseline_points = parse_value(key, value)?,
                "peak_lookback" => config.peak_lookback = parse_value(key, value)?,
                "r2_threshold" => config.r2_threshold = parse_value(key, value)?,
                "r2_reject_floor" => config.r2_reject_floor = parse_value(key, value)?,
                "min_duration_floor" => config.min_duration_floor = parse_value(key, value)?,
                "windows" => {
                    config.windows = value
                        .split(',')
                        .filter(|part| !part.trim().is_empty())
                        .map(|part| parse_value::<u32>(key, part))
                        .collect::<Result<Vec<_>, _>>()?;
                }
                "max_imputation_gap" => config.max_imputation_gap = parse_value(key, value)?,
                "max_signal_seconds" => config.max_signal_seconds = parse_value(key, value)?,
                "min_fit_points" => config.min_fit_points = parse_value(key, value)?,
                "max_fit_iterations" => config.max_fit_iterations = parse_value(key, value)?,
                "late_window_start" => config.late_window_start = parse_value(key, value)?,
                "late_window_end" => config.late_window_end = parse_value(key, value)?,
                "late_slope_rise" => config.late_slope_rise = parse_value(key, value)?,
                "reanchor_lookback" => config.reanchor_lookback = parse_value(key, value)?,
                "reanchor_min_dip" => config.reanchor_min_dip = parse_value(key, value)?,
                "reanchor_min_rise" => config.reanchor_min_rise = parse_value(key, value)?,
                "amplitude_min" => config.bounds.amplitude_min = parse_value(key, value)?,
                "amplitude_max" => config.bounds.amplitude_max = parse_value(key, value)?,
                "tau_min" => config.bounds.tau_min = parse_value(key, value)?,
                "tau_max" => config.bounds.tau_max = parse_value(key, value)?,
                "asymptote_min" => config.bounds.asymptote_min = parse_value(key, value)?,
                "asymptote_max" => config.bounds.asymptote_max = parse_value(key, value)?,
                other => warn!(key = other, "Ignoring unknown threshold key"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject threshold sets the detector cannot run with
    pub fn validate(&self) -> Result<(), HrrError> {
        let fail = |reason: String| Err(HrrError::Configuration(reason));

        if self.version.trim().is_empty() {
            return fail("version must not be empty".to_string());
        }
        if self.smoothing_kernel == 0 || self.smoothing_kernel % 2 == 0 {
            return fail(format!(
                "smoothing_kernel must be a positive odd number, got {}",
                self.smoothing_kernel
            ));
        }
        let non_negative = [
            ("allowed_rise", self.allowed_rise),
            ("min_drop_abs", self.min_drop_abs),
            ("min_peak_minus_rest", self.min_peak_minus_rest),
            ("reanchor_min_dip", self.reanchor_min_dip),
            ("reanchor_min_rise", self.reanchor_min_rise),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return fail(format!("{} must be a finite non-negative number, got {}", name, value));
            }
        }
        if !self.late_slope_rise.is_finite() {
            return fail("late_slope_rise must be finite".to_string());
        }
        if self.min_run_duration < 2 {
            return fail(format!("min_run_duration must be at least 2, got {}", self.min_run_duration));
        }
        if !(self.r2_threshold > 0.0 && self.r2_threshold <= 1.0) {
            return fail(format!("r2_threshold must be in (0, 1], got {}", self.r2_threshold));
        }
        if !(self.r2_reject_floor >= 0.0 && self.r2_reject_floor <= self.r2_threshold) {
            return fail(format!(
                "r2_reject_floor must be in [0, r2_threshold], got {}",
                self.r2_reject_floor
            ));
        }
        if self.windows.is_empty() {
            return fail("at least one feature window is required".to_string());
        }
        if self.windows.iter().any(|&w| w == 0) || self.windows.windows(2).any(|p| p[0] >= p[1]) {
            return fail(format!(
                "windows must be positive and strictly increasing, got {:?}",
                self.windows
            ));
        }
        if self.max_imputation_gap == 0 {
            return fail("max_imputation_gap must be at least 1".to_string());
        }
        if self.max_signal_seconds < self.min_run_duration {
            return fail("max_signal_seconds must cover min_run_duration".to_string());
        }
        if self.min_fit_points < 3 {
            return fail(format!("min_fit_points must be at least 3, got {}", self.min_fit_points));
        }
        if self.max_fit_iterations == 0 {
            return fail("max_fit_iterations must be at least 1".to_string());
        }
        if self.late_window_start >= self.late_window_end {
            return fail(format!(
                "late window is empty: {}..{}",
                self.late_window_start, self.late_window_end
            ));
        }
        let b = &self.bounds;
        if !(b.amplitude_min < b.amplitude_max && b.tau_min < b.tau_max && b.asymptote_min < b.asymptote_max)
            || b.tau_min <= 0.0
        {
            return fail(format!("fit bounds are inconsistent: {:?}", b));
        }

        Ok(())
    }

    /// Half-width of the median kernel
    pub fn kernel_half_width(&self) -> usize {
        self.smoothing_kernel / 2
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let now = Utc::now();

        AppConfig {
            database_path: PathBuf::from("./data/hrrs.db"),
            threshold_version: None,
            metadata: ConfigMetadata {
                version: "1.0".to_string(),
                created_at: now,
                updated_at: now,
            },
            hrr: HrrConfig::default(),
            batch: BatchSettings::default(),
            logging: LogConfig::default(),
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings {
            num_threads: None,
            show_progress: true,
            chunk_size: 64,
        }
    }
}

/// Configuration management implementation
impl AppConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        config
            .hrr
            .validate()
            .with_context(|| format!("Invalid thresholds in {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let toml_content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hrrs")
            .join("config.toml")
    }

    /// Load configuration with fallback to defaults when the file is absent
    ///
    /// A file that exists but cannot be parsed is still an error: running a
    /// batch on silently substituted thresholds would corrupt the stored set.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            warn!(
                path = %path.as_ref().display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }
        Self::load_from_file(path)
    }
}
