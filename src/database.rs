use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::config::HrrConfig;
use crate::error::{DatabaseError, HrrError, Result};
use crate::models::{HrSample, RecoveryInterval, SessionSamples};
use crate::pipeline::{IntervalStore, SampleSource};

/// SQLite store for sessions, heart-rate samples, recovery intervals and
/// versioned threshold sets
pub struct Database {
    conn: Connection,
}

/// Stored threshold set header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSetInfo {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub active: bool,
}

/// Row counts per table
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub session_count: usize,
    pub sample_count: usize,
    pub interval_count: usize,
    pub threshold_set_count: usize,
}

impl Database {
    /// Open (or create) a database file and make sure the schema exists
    pub fn new<P: AsRef<Path>>(db_path: P) -> std::result::Result<Self, DatabaseError> {
        let conn = Connection::open(db_path)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> std::result::Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> std::result::Result<(), DatabaseError> {
        // In-memory databases answer "memory" here
        let journal_mode: String =
            self.conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", true)?;
        debug!(journal_mode = %journal_mode, "Opened database");

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                resting_hr REAL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS hr_samples (
                session_id TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                heart_rate_bpm REAL NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS hr_recovery_intervals (
                session_id TEXT NOT NULL,
                interval_order INTEGER NOT NULL,
                peak_time TEXT NOT NULL,
                peak_hr REAL NOT NULL,
                trough_time TEXT NOT NULL,
                trough_hr REAL NOT NULL,
                duration_seconds INTEGER NOT NULL,
                total_drop REAL NOT NULL,
                peak_above_baseline REAL NOT NULL,
                per_window TEXT NOT NULL,
                hrr_60 REAL,
                late_slope REAL,
                late_slope_r2 REAL,
                quality_status TEXT NOT NULL,
                quality_flags TEXT NOT NULL,
                detection_method TEXT NOT NULL,
                config_version TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (session_id, interval_order),
                FOREIGN KEY (session_id) REFERENCES sessions (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS hrr_threshold_versions (
                version TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                source TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS hrr_thresholds (
                version TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (version, key),
                FOREIGN KEY (version) REFERENCES hrr_threshold_versions (version) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_hr_samples_session ON hr_samples (session_id, timestamp_ms);
            CREATE INDEX IF NOT EXISTS idx_intervals_status ON hr_recovery_intervals (quality_status);
            "#,
        )?;
        Ok(())
    }

    /// Store a session's samples, replacing any previous copy
    pub fn store_session(&mut self, session: &SessionSamples) -> std::result::Result<usize, DatabaseError> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO sessions (id, resting_hr) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET resting_hr = excluded.resting_hr",
            params![session.session_id, session.resting_hr],
        )?;
        tx.execute(
            "DELETE FROM hr_samples WHERE session_id = ?1",
            params![session.session_id],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO hr_samples (session_id, timestamp_ms, heart_rate_bpm) VALUES (?1, ?2, ?3)",
            )?;
            for sample in &session.samples {
                stmt.execute(params![
                    session.session_id,
                    sample.timestamp.timestamp_millis(),
                    sample.heart_rate_bpm
                ])?;
            }
        }

        tx.commit()?;
        debug!(
            session = %session.session_id,
            samples = session.samples.len(),
            "Stored session samples"
        );
        Ok(session.samples.len())
    }

    /// All session ids, sorted
    pub fn list_session_ids(&self) -> std::result::Result<Vec<String>, DatabaseError> {
        let mut stmt = self.conn.prepare("SELECT id FROM sessions ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Load a session's samples in time order
    pub fn fetch_samples(&self, session_id: &str) -> std::result::Result<SessionSamples, DatabaseError> {
        let resting_hr: Option<f64> = self
            .conn
            .query_row(
                "SELECT resting_hr FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| DatabaseError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        let mut stmt = self.conn.prepare(
            "SELECT timestamp_ms, heart_rate_bpm FROM hr_samples
             WHERE session_id = ?1 ORDER BY timestamp_ms, rowid",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;

        let mut samples = Vec::new();
        for row in rows {
            let (millis, bpm) = row?;
            let timestamp = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
                DatabaseError::Corrupt {
                    table: "hr_samples".to_string(),
                    column: "timestamp_ms".to_string(),
                    reason: format!("out of range: {}", millis),
                }
            })?;
            samples.push(HrSample::new(timestamp, bpm));
        }

        Ok(SessionSamples {
            session_id: session_id.to_string(),
            samples,
            resting_hr,
        })
    }

    /// Atomically replace every interval of a session
    ///
    /// Delete and insert share one transaction; any failure rolls the
    /// session back to its previous set.
    pub fn replace_intervals(
        &mut self,
        session_id: &str,
        intervals: &[RecoveryInterval],
        config_version: &str,
    ) -> std::result::Result<usize, DatabaseError> {
        let tx = self.conn.transaction()?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![session_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(DatabaseError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }

        let removed = tx.execute(
            "DELETE FROM hr_recovery_intervals WHERE session_id = ?1",
            params![session_id],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO hr_recovery_intervals (
                    session_id, interval_order, peak_time, peak_hr, trough_time, trough_hr,
                    duration_seconds, total_drop, peak_above_baseline, per_window, hrr_60,
                    late_slope, late_slope_r2, quality_status, quality_flags, detection_method,
                    config_version
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                "#,
            )?;

            for interval in intervals {
                let per_window = serde_json::to_value(&interval.per_window).map_err(|e| corrupt("per_window", e))?;
                let flags = serde_json::to_value(&interval.quality_flags).map_err(|e| corrupt("quality_flags", e))?;

                stmt.execute(params![
                    session_id,
                    interval.interval_order as i64,
                    interval.peak_time,
                    interval.peak_hr,
                    interval.trough_time,
                    interval.trough_hr,
                    interval.duration_seconds,
                    interval.total_drop,
                    interval.peak_above_baseline,
                    per_window,
                    interval.hrr_value(60),
                    interval.late_slope,
                    interval.late_slope_r2,
                    interval.quality_status.as_str(),
                    flags,
                    interval.detection_method.as_str(),
                    config_version,
                ])?;
            }
        }

        tx.commit()?;
        debug!(
            session = session_id,
            removed,
            inserted = intervals.len(),
            "Replaced recovery intervals"
        );
        Ok(intervals.len())
    }

    /// Load a session's stored intervals in order
    pub fn load_intervals(&self, session_id: &str) -> std::result::Result<Vec<RecoveryInterval>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT interval_order, peak_time, peak_hr, trough_time, trough_hr, duration_seconds,
                   total_drop, peak_above_baseline, per_window, late_slope, late_slope_r2,
                   quality_status, quality_flags, detection_method
            FROM hr_recovery_intervals
            WHERE session_id = ?1
            ORDER BY interval_order
            "#,
        )?;

        let rows = stmt.query_map(params![session_id], StoredInterval::from_row)?;

        let mut intervals = Vec::new();
        for row in rows {
            intervals.push(row?.into_interval()?);
        }
        Ok(intervals)
    }

    /// Config version each stored interval was produced with
    pub fn interval_config_versions(&self, session_id: &str) -> std::result::Result<Vec<String>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT config_version FROM hr_recovery_intervals WHERE session_id = ?1 ORDER BY config_version",
        )?;
        let versions = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    /// Persist a threshold set as key/value rows under its version tag
    ///
    /// An existing set with the same version is overwritten.
    pub fn save_threshold_set(
        &mut self,
        config: &HrrConfig,
        source: &str,
        activate: bool,
    ) -> std::result::Result<(), DatabaseError> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "DELETE FROM hrr_thresholds WHERE version = ?1",
            params![config.version],
        )?;
        tx.execute(
            "INSERT INTO hrr_threshold_versions (version, created_at, source, active) VALUES (?1, ?2, ?3, 0)
             ON CONFLICT(version) DO UPDATE SET created_at = excluded.created_at, source = excluded.source",
            params![config.version, Utc::now(), source],
        )?;

        {
            let mut stmt =
                tx.prepare("INSERT INTO hrr_thresholds (version, key, value) VALUES (?1, ?2, ?3)")?;
            for (key, value) in config.to_key_values() {
                stmt.execute(params![config.version, key, value])?;
            }
        }

        if activate {
            tx.execute("UPDATE hrr_threshold_versions SET active = 0", [])?;
            tx.execute(
                "UPDATE hrr_threshold_versions SET active = 1 WHERE version = ?1",
                params![config.version],
            )?;
        }

        tx.commit()?;
        info!(version = %config.version, source, activate, "Saved threshold set");
        Ok(())
    }

    /// Make a stored version the active threshold set
    pub fn activate_threshold_set(&mut self, version: &str) -> std::result::Result<(), DatabaseError> {
        let tx = self.conn.transaction()?;
        tx.execute("UPDATE hrr_threshold_versions SET active = 0", [])?;
        let updated = tx.execute(
            "UPDATE hrr_threshold_versions SET active = 1 WHERE version = ?1",
            params![version],
        )?;
        if updated == 0 {
            return Err(DatabaseError::ThresholdSetNotFound {
                version: version.to_string(),
            });
        }
        tx.commit()?;
        Ok(())
    }

    pub fn active_threshold_version(&self) -> std::result::Result<Option<String>, DatabaseError> {
        Ok(self
            .conn
            .query_row(
                "SELECT version FROM hrr_threshold_versions WHERE active = 1",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Stored threshold sets, newest first
    pub fn list_threshold_sets(&self) -> std::result::Result<Vec<ThresholdSetInfo>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT version, created_at, source, active FROM hrr_threshold_versions
             ORDER BY created_at DESC, version",
        )?;
        let sets = stmt
            .query_map([], |row| {
                Ok(ThresholdSetInfo {
                    version: row.get(0)?,
                    created_at: row.get(1)?,
                    source: row.get(2)?,
                    active: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sets)
    }

    /// Load and validate a stored threshold set
    pub fn load_threshold_set(&self, version: &str) -> Result<HrrConfig> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM hrr_thresholds WHERE version = ?1")?;
        let kv = stmt
            .query_map(params![version], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        if kv.is_empty() {
            return Err(DatabaseError::ThresholdSetNotFound {
                version: version.to_string(),
            }
            .into());
        }

        let mut config = HrrConfig::from_key_values(&kv)?;
        if config.version != version {
            config.version = version.to_string();
            config.validate()?;
        }
        Ok(config)
    }

    /// Resolve the threshold set for a run
    ///
    /// An explicit version must exist. Without one, the active set is used if
    /// there is one; `Ok(None)` tells the caller to use its own defaults.
    pub fn load_threshold_config(&self, version: Option<&str>) -> Result<Option<HrrConfig>> {
        match version {
            Some(version) => self.load_threshold_set(version).map(Some),
            None => match self.active_threshold_version()? {
                Some(active) => self.load_threshold_set(&active).map(Some),
                None => Ok(None),
            },
        }
    }

    /// Get database statistics
    pub fn get_stats(&self) -> std::result::Result<DatabaseStats, DatabaseError> {
        let count = |table: &str| -> std::result::Result<usize, DatabaseError> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(DatabaseStats {
            session_count: count("sessions")?,
            sample_count: count("hr_samples")?,
            interval_count: count("hr_recovery_intervals")?,
            threshold_set_count: count("hrr_threshold_versions")?,
        })
    }
}

fn corrupt(column: &str, err: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Corrupt {
        table: "hr_recovery_intervals".to_string(),
        column: column.to_string(),
        reason: err.to_string(),
    }
}

/// Raw interval row before enum/JSON decoding
struct StoredInterval {
    interval_order: i64,
    peak_time: DateTime<Utc>,
    peak_hr: f64,
    trough_time: DateTime<Utc>,
    trough_hr: f64,
    duration_seconds: u32,
    total_drop: f64,
    peak_above_baseline: f64,
    per_window: serde_json::Value,
    late_slope: Option<f64>,
    late_slope_r2: Option<f64>,
    quality_status: String,
    quality_flags: serde_json::Value,
    detection_method: String,
}

impl StoredInterval {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            interval_order: row.get("interval_order")?,
            peak_time: row.get("peak_time")?,
            peak_hr: row.get("peak_hr")?,
            trough_time: row.get("trough_time")?,
            trough_hr: row.get("trough_hr")?,
            duration_seconds: row.get("duration_seconds")?,
            total_drop: row.get("total_drop")?,
            peak_above_baseline: row.get("peak_above_baseline")?,
            per_window: row.get("per_window")?,
            late_slope: row.get("late_slope")?,
            late_slope_r2: row.get("late_slope_r2")?,
            quality_status: row.get("quality_status")?,
            quality_flags: row.get("quality_flags")?,
            detection_method: row.get("detection_method")?,
        })
    }

    fn into_interval(self) -> std::result::Result<RecoveryInterval, DatabaseError> {
        Ok(RecoveryInterval {
            interval_order: self.interval_order as usize,
            peak_time: self.peak_time,
            peak_hr: self.peak_hr,
            trough_time: self.trough_time,
            trough_hr: self.trough_hr,
            duration_seconds: self.duration_seconds,
            total_drop: self.total_drop,
            peak_above_baseline: self.peak_above_baseline,
            per_window: serde_json::from_value(self.per_window).map_err(|e| corrupt("per_window", e))?,
            late_slope: self.late_slope,
            late_slope_r2: self.late_slope_r2,
            quality_status: self
                .quality_status
                .parse()
                .map_err(|e: String| corrupt("quality_status", e))?,
            quality_flags: serde_json::from_value(self.quality_flags)
                .map_err(|e| corrupt("quality_flags", e))?,
            detection_method: self
                .detection_method
                .parse()
                .map_err(|e: String| corrupt("detection_method", e))?,
        })
    }
}

impl SampleSource for Database {
    fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.list_session_ids()?)
    }

    fn fetch_samples(&self, session_id: &str) -> Result<SessionSamples> {
        Ok(Database::fetch_samples(self, session_id)?)
    }
}

impl IntervalStore for Database {
    fn replace_intervals(
        &mut self,
        session_id: &str,
        intervals: &[RecoveryInterval],
        config_version: &str,
    ) -> Result<usize> {
        Database::replace_intervals(self, session_id, intervals, config_version).map_err(HrrError::from)
    }
}
