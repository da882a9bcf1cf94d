use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::ControllerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Expected background noise; retried quietly.
    Silent,
    /// Ambiguous; retried with backoff until the ceiling.
    Transient,
    /// The remote side noticed us.
    RateLimited,
    /// Not retried; the run ends.
    Fatal,
}

impl ErrorClassification {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClassification::Silent | ErrorClassification::Transient
        )
    }
}

/// Ordered table: the first matching pattern wins. Detection phrasing sits
/// above generic HTTP and network noise so "status of 429" never reads as a
/// plain 4xx.
const CLASSIFICATION_TABLE: &[(&str, ErrorClassification)] = &[
    (r"(?i)status(?: code)? (?:of )?429\b", ErrorClassification::RateLimited),
    (r"(?i)\btoo many requests\b", ErrorClassification::RateLimited),
    (r"(?i)rate[ _-]?limit", ErrorClassification::RateLimited),
    (r"(?i)captcha|arkose", ErrorClassification::RateLimited),
    (r"(?i)security (?:check|verification)", ErrorClassification::RateLimited),
    (
        r"(?i)verify (?:that )?you(?:'re| are) (?:a )?human",
        ErrorClassification::RateLimited,
    ),
    (r"(?i)(?:unusual|suspicious) activity", ErrorClassification::RateLimited),
    (r"(?i)/checkpoint/|\bchallenge\b", ErrorClassification::RateLimited),
    (
        r"(?i)invitation limit|weekly limit reached",
        ErrorClassification::RateLimited,
    ),
    (r"net::ERR_[A-Z_]+", ErrorClassification::Silent),
    (
        r"(?i)status(?: code)? (?:of )?[45]\d\d\b",
        ErrorClassification::Silent,
    ),
    (r"(?i)failed to load resource", ErrorClassification::Silent),
    (
        r"(?i)connection (?:reset|refused|closed|aborted)",
        ErrorClassification::Silent,
    ),
    (
        r"\b(?:ECONNRESET|ECONNREFUSED|EPIPE|ETIMEDOUT)\b",
        ErrorClassification::Silent,
    ),
    (r"(?i)dns error|name resolution", ErrorClassification::Silent),
];

fn classification_rules() -> &'static [(Regex, ErrorClassification)] {
    static RULES: OnceLock<Vec<(Regex, ErrorClassification)>> = OnceLock::new();
    RULES.get_or_init(|| {
        CLASSIFICATION_TABLE
            .iter()
            .filter_map(|(pattern, class)| Regex::new(pattern).ok().map(|re| (re, *class)))
            .collect()
    })
}

pub struct ErrorCategorizer;

impl ErrorCategorizer {
    /// Table lookup only; `None` when nothing matches.
    pub fn match_signal(signal: &str) -> Option<ErrorClassification> {
        classification_rules()
            .iter()
            .find(|(pattern, _)| pattern.is_match(signal))
            .map(|(_, class)| *class)
    }

    /// Classify a raw failure message seen for the `occurrence`-th time.
    /// Unmatched failures are Transient until they reach `ceiling`.
    pub fn classify(signal: &str, occurrence: u32, ceiling: u32) -> ErrorClassification {
        match Self::match_signal(signal) {
            Some(class) => class,
            None if occurrence >= ceiling => ErrorClassification::Fatal,
            None => ErrorClassification::Transient,
        }
    }

    pub fn categorize(
        error: &ControllerError,
        occurrence: u32,
        ceiling: u32,
    ) -> ErrorClassification {
        match error {
            ControllerError::AuthenticationLost(_)
            | ControllerError::CaptchaUnsolved(_)
            | ControllerError::NoProxyAvailable(_)
            | ControllerError::Configuration(_) => ErrorClassification::Fatal,
            ControllerError::RateLimited(_) => ErrorClassification::RateLimited,
            ControllerError::Http(err) if err.is_connect() => ErrorClassification::Silent,
            ControllerError::Http(err) if err.status().map(|s| s.as_u16()) == Some(429) => {
                ErrorClassification::RateLimited
            }
            other => Self::classify(&other.to_string(), occurrence, ceiling),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemediationAction {
    RetryScheduled { delay_ms: u64 },
    BackoffEscalated { cooldown_secs: u64 },
    IdentityRotated { identity: Option<String> },
    Skipped,
    Abort,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub timestamp: DateTime<Utc>,
    pub action_id: String,
    pub category: String,
    pub classification: ErrorClassification,
    pub error_message: String,
    pub attempt: usize,
    pub proxy: Option<String>,
    pub action: RemediationAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub detections: u64,
    pub proxy_rotations: u64,
    pub stop_reason: String,
    pub duration_ms: i64,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<TelemetryError> for ControllerError {
    fn from(error: TelemetryError) -> Self {
        ControllerError::Telemetry(error.to_string())
    }
}

/// JSON-lines failure log plus a small SQLite history of failures, runs and
/// identity rotations.
#[derive(Debug)]
pub struct AutomationTelemetry {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl AutomationTelemetry {
    pub fn new(
        log_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, TelemetryError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let telemetry = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        telemetry.initialize_db()?;
        Ok(telemetry)
    }

    fn initialize_db(&self) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS action_failures (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                action_id TEXT,
                category TEXT,
                classification TEXT,
                error_message TEXT,
                attempt INTEGER,
                proxy TEXT,
                remediation TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_action_failures_ts ON action_failures(ts DESC);
            CREATE TABLE IF NOT EXISTS controller_runs (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                run_id TEXT,
                attempted INTEGER,
                succeeded INTEGER,
                failed INTEGER,
                skipped INTEGER,
                detections INTEGER,
                proxy_rotations INTEGER,
                stop_reason TEXT,
                duration_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_controller_runs_ts ON controller_runs(ts DESC);
            CREATE TABLE IF NOT EXISTS proxy_rotations (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                identity TEXT,
                reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_proxy_rotations_ts ON proxy_rotations(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, TelemetryError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn record_failure(&self, failure: &FailureContext) -> Result<(), TelemetryError> {
        let json = serde_json::to_string(failure)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO action_failures (
                action_id, category, classification, error_message, attempt, proxy, remediation
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                failure.action_id,
                failure.category,
                format!("{:?}", failure.classification),
                failure.error_message,
                failure.attempt as i64,
                failure.proxy.clone().unwrap_or_default(),
                serde_json::to_string(&failure.action)?,
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &RunContext) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO controller_runs (
                run_id, attempted, succeeded, failed, skipped, detections, proxy_rotations,
                stop_reason, duration_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.run_id,
                run.attempted as i64,
                run.succeeded as i64,
                run.failed as i64,
                run.skipped as i64,
                run.detections as i64,
                run.proxy_rotations as i64,
                run.stop_reason,
                run.duration_ms,
            ],
        )?;
        Ok(())
    }

    pub fn record_proxy_rotation(&self, identity: &str, reason: &str) -> Result<(), TelemetryError> {
        if !identity.is_empty() {
            let conn = self.open_db()?;
            conn.execute(
                "INSERT INTO proxy_rotations (identity, reason) VALUES (?1, ?2)",
                params![identity, reason],
            )?;
        }
        Ok(())
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn every_classification_pattern_compiles() {
        assert_eq!(classification_rules().len(), CLASSIFICATION_TABLE.len());
    }

    #[test]
    fn classify_known_signals() {
        assert_eq!(
            ErrorCategorizer::classify("net::ERR_CONNECTION_RESET", 1, 3),
            ErrorClassification::Silent
        );
        assert_eq!(
            ErrorCategorizer::classify("Failed to load resource: the server responded with a status of 429", 1, 3),
            ErrorClassification::RateLimited
        );
        assert_eq!(
            ErrorCategorizer::classify("status of 429", 1, 3),
            ErrorClassification::RateLimited
        );
        assert_eq!(
            ErrorCategorizer::classify("the server responded with a status of 404", 1, 3),
            ErrorClassification::Silent
        );
        assert_eq!(
            ErrorCategorizer::classify("Let's do a quick security check", 1, 3),
            ErrorClassification::RateLimited
        );
    }

    #[test]
    fn unknown_failures_promote_to_fatal_at_ceiling() {
        assert_eq!(
            ErrorCategorizer::classify("unknown xyz failure", 1, 3),
            ErrorClassification::Transient
        );
        assert_eq!(
            ErrorCategorizer::classify("unknown xyz failure", 2, 3),
            ErrorClassification::Transient
        );
        assert_eq!(
            ErrorCategorizer::classify("unknown xyz failure", 3, 3),
            ErrorClassification::Fatal
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let inputs = ["net::ERR_TIMED_OUT", "captcha shown", "weird", "status of 503"];
        for input in inputs {
            let first = ErrorCategorizer::classify(input, 1, 3);
            for _ in 0..10 {
                assert_eq!(ErrorCategorizer::classify(input, 1, 3), first);
            }
        }
    }

    #[test]
    fn typed_errors_short_circuit_table() {
        let lost = ControllerError::AuthenticationLost("no essential cookie".into());
        assert_eq!(
            ErrorCategorizer::categorize(&lost, 1, 3),
            ErrorClassification::Fatal
        );
        let limited = ControllerError::RateLimited("weekly cap".into());
        assert_eq!(
            ErrorCategorizer::categorize(&limited, 1, 3),
            ErrorClassification::RateLimited
        );
        let action = ControllerError::Action("net::ERR_PROXY_CONNECTION_FAILED".into());
        assert_eq!(
            ErrorCategorizer::categorize(&action, 1, 3),
            ErrorClassification::Silent
        );
    }

    #[test]
    fn telemetry_persists_entries() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("failures.jsonl");
        let db_path = dir.path().join("metrics.sqlite");
        let telemetry = AutomationTelemetry::new(&log_path, &db_path).unwrap();

        telemetry
            .record_failure(&FailureContext {
                timestamp: Utc::now(),
                action_id: "a-1".into(),
                category: "connect".into(),
                classification: ErrorClassification::Transient,
                error_message: ControllerError::Action("unknown xyz failure".into()).to_string(),
                attempt: 1,
                proxy: None,
                action: RemediationAction::RetryScheduled { delay_ms: 1000 },
            })
            .unwrap();
        telemetry
            .record_run(&RunContext {
                timestamp: Utc::now(),
                run_id: "run-1".into(),
                attempted: 1,
                succeeded: 0,
                failed: 1,
                skipped: 0,
                detections: 0,
                proxy_rotations: 0,
                stop_reason: "completed".into(),
                duration_ms: 1200,
            })
            .unwrap();
        telemetry.record_proxy_rotation("10.0.0.1:8080", "interval").unwrap();
        telemetry.record_proxy_rotation("", "ignored").unwrap();

        let log_contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(log_contents.contains("unknown xyz failure"));

        let conn = Connection::open(&db_path).unwrap();
        let failures: i64 = conn
            .query_row("SELECT COUNT(*) FROM action_failures", [], |row| row.get(0))
            .unwrap();
        assert_eq!(failures, 1);
        let runs: i64 = conn
            .query_row("SELECT COUNT(*) FROM controller_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(runs, 1);
        let rotations: i64 = conn
            .query_row("SELECT COUNT(*) FROM proxy_rotations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rotations, 1);
    }
}
