//! Relational session store.
//!
//! SQLite via `rusqlite` behind a mutex; every access is a short,
//! synchronous statement. Tables: `registered_devices`, `sessions`,
//! `session_files`, `exports`. Timestamps are Unix seconds (REAL),
//! `created_at` columns are ISO-8601 text.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::sample::DeviceDescriptor;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Completed,
    Processing,
    Failed,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Recording => "recording",
            SessionStatus::Completed => "completed",
            SessionStatus::Processing => "processing",
            SessionStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "recording" => SessionStatus::Recording,
            "processing" => SessionStatus::Processing,
            "failed" => SessionStatus::Failed,
            _ => SessionStatus::Completed,
        }
    }
}

/// One `sessions` row.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub status: SessionStatus,
    pub device_id: String,
    pub root_dir: PathBuf,
    pub participant_id: Option<String>,
    pub condition: Option<String>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

/// One `session_files` row.
#[derive(Debug, Clone, Serialize)]
pub struct FileRow {
    pub session_id: String,
    pub filename: String,
    pub sensor: String,
    pub data_type: String,
    pub size_bytes: u64,
    pub sample_count: Option<u64>,
    pub created_at: String,
}

/// Export job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExportStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExportStatus::Pending => "pending",
            ExportStatus::Running => "running",
            ExportStatus::Completed => "completed",
            ExportStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => ExportStatus::Pending,
            "running" => ExportStatus::Running,
            "failed" => ExportStatus::Failed,
            _ => ExportStatus::Completed,
        }
    }
}

/// One `exports` row.
#[derive(Debug, Clone, Serialize)]
pub struct ExportRow {
    pub id: String,
    pub session_id: String,
    pub status: ExportStatus,
    pub format: String,
    pub file_path: Option<PathBuf>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

/// Session listing filter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub participant_id: Option<String>,
    #[serde(default)]
    pub offset: u64,
    pub limit: Option<u64>,
}

/// The store. Connection behind a mutex; statements are short.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) the database and ensure the schema exists.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn create_schema(conn: &Connection) -> EngineResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS registered_devices (
                address   TEXT PRIMARY KEY,
                name      TEXT NOT NULL,
                last_seen REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                id             TEXT PRIMARY KEY,
                name           TEXT NOT NULL,
                start_time     REAL NOT NULL,
                end_time       REAL,
                status         TEXT NOT NULL,
                device_id      TEXT NOT NULL,
                root_dir       TEXT NOT NULL,
                participant_id TEXT,
                condition      TEXT,
                notes          TEXT,
                tags_json      TEXT NOT NULL DEFAULT '[]'
            );
            CREATE TABLE IF NOT EXISTS session_files (
                session_id   TEXT NOT NULL REFERENCES sessions(id),
                filename     TEXT NOT NULL,
                sensor       TEXT NOT NULL,
                data_type    TEXT NOT NULL,
                size         INTEGER NOT NULL,
                sample_count INTEGER,
                created_at   TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS exports (
                id           TEXT PRIMARY KEY,
                session_id   TEXT NOT NULL REFERENCES sessions(id),
                status       TEXT NOT NULL,
                format       TEXT NOT NULL,
                file_path    TEXT,
                created_at   TEXT NOT NULL,
                completed_at TEXT,
                error        TEXT
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    // ─── Registered devices ─────────────────────────────────────────

    /// Upsert a device so the engine can auto-reconnect it later.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn register_device(&self, device: &DeviceDescriptor) -> EngineResult<()> {
        self.lock().execute(
            "INSERT INTO registered_devices (address, name, last_seen)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(address) DO UPDATE SET name = ?2, last_seen = ?3",
            params![device.address, device.name, device.last_seen],
        )?;
        Ok(())
    }

    /// The most recently seen registered device, if any.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn last_registered_device(&self) -> EngineResult<Option<DeviceDescriptor>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT address, name, last_seen FROM registered_devices
                 ORDER BY last_seen DESC LIMIT 1",
                [],
                |row| {
                    Ok(DeviceDescriptor {
                        address: row.get(0)?,
                        name: row.get(1)?,
                        last_seen: row.get(2)?,
                        rssi: None,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Remove a registered device.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn unregister_device(&self, address: &str) -> EngineResult<()> {
        self.lock().execute(
            "DELETE FROM registered_devices WHERE address = ?1",
            params![address],
        )?;
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────

    /// Insert a new session in `recording` state.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn insert_session(&self, session: &SessionRow) -> EngineResult<()> {
        self.lock().execute(
            "INSERT INTO sessions
             (id, name, start_time, end_time, status, device_id, root_dir,
              participant_id, condition, notes, tags_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.id,
                session.name,
                session.start_time,
                session.end_time,
                session.status.as_str(),
                session.device_id,
                session.root_dir.to_string_lossy(),
                session.participant_id,
                session.condition,
                session.notes,
                serde_json::to_string(&session.tags)?,
            ],
        )?;
        Ok(())
    }

    /// Seal a session with its final status and end time.
    ///
    /// # Errors
    /// `SessionNotFound` when no row matches; SQLite failures otherwise.
    pub fn seal_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        end_time: f64,
    ) -> EngineResult<()> {
        let updated = self.lock().execute(
            "UPDATE sessions SET status = ?2, end_time = ?3 WHERE id = ?1",
            params![session_id, status.as_str(), end_time],
        )?;
        if updated == 0 {
            return Err(EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
        let status: String = row.get(4)?;
        let root: String = row.get(6)?;
        let tags_json: String = row.get(10)?;
        Ok(SessionRow {
            id: row.get(0)?,
            name: row.get(1)?,
            start_time: row.get(2)?,
            end_time: row.get(3)?,
            status: SessionStatus::parse(&status),
            device_id: row.get(5)?,
            root_dir: PathBuf::from(root),
            participant_id: row.get(7)?,
            condition: row.get(8)?,
            notes: row.get(9)?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        })
    }

    const SESSION_COLUMNS: &'static str = "id, name, start_time, end_time, status, device_id, \
         root_dir, participant_id, condition, notes, tags_json";

    /// Fetch one session.
    ///
    /// # Errors
    /// `SessionNotFound` when missing; SQLite failures otherwise.
    pub fn get_session(&self, session_id: &str) -> EngineResult<SessionRow> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM sessions WHERE id = ?1",
            Self::SESSION_COLUMNS
        );
        conn.query_row(&sql, params![session_id], Self::row_to_session)
            .optional()?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// List sessions, newest first, with optional status/participant
    /// filters and offset/limit pagination.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn list_sessions(&self, filter: &SessionFilter) -> EngineResult<Vec<SessionRow>> {
        let conn = self.lock();
        let limit = filter.limit.unwrap_or(100).min(1000);
        let sql = format!(
            "SELECT {} FROM sessions
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR participant_id = ?2)
             ORDER BY start_time DESC LIMIT ?3 OFFSET ?4",
            Self::SESSION_COLUMNS
        );
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(
            params![
                filter.status.map(SessionStatus::as_str),
                filter.participant_id,
                limit,
                filter.offset,
            ],
            Self::row_to_session,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a session and its dependent rows. The caller removes the
    /// directory.
    ///
    /// # Errors
    /// `SessionNotFound` when missing; SQLite failures otherwise.
    pub fn delete_session(&self, session_id: &str) -> EngineResult<SessionRow> {
        let session = self.get_session(session_id)?;
        let conn = self.lock();
        conn.execute(
            "DELETE FROM session_files WHERE session_id = ?1",
            params![session_id],
        )?;
        conn.execute(
            "DELETE FROM exports WHERE session_id = ?1",
            params![session_id],
        )?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(session)
    }

    /// Exactly one session may be `recording`; returns it if present.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn recording_session(&self) -> EngineResult<Option<SessionRow>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM sessions WHERE status = 'recording' LIMIT 1",
            Self::SESSION_COLUMNS
        );
        Ok(conn.query_row(&sql, [], Self::row_to_session).optional()?)
    }

    /// Crash recovery: any session still `recording` at startup becomes
    /// `failed`, files left in place. Returns how many were sealed.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn fail_stale_recordings(&self, now: f64) -> EngineResult<usize> {
        let sealed = self.lock().execute(
            "UPDATE sessions SET status = 'failed', end_time = ?1
             WHERE status = 'recording'",
            params![now],
        )?;
        Ok(sealed)
    }

    // ─── Session files ──────────────────────────────────────────────

    /// Record one file belonging to a session.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn insert_file(&self, file: &FileRow) -> EngineResult<()> {
        self.lock().execute(
            "INSERT INTO session_files
             (session_id, filename, sensor, data_type, size, sample_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                file.session_id,
                file.filename,
                file.sensor,
                file.data_type,
                file.size_bytes,
                file.sample_count,
                file.created_at,
            ],
        )?;
        Ok(())
    }

    /// All files recorded for a session.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn files_for(&self, session_id: &str) -> EngineResult<Vec<FileRow>> {
        let conn = self.lock();
        let mut statement = conn.prepare(
            "SELECT session_id, filename, sensor, data_type, size, sample_count, created_at
             FROM session_files WHERE session_id = ?1 ORDER BY filename",
        )?;
        let rows = statement.query_map(params![session_id], |row| {
            Ok(FileRow {
                session_id: row.get(0)?,
                filename: row.get(1)?,
                sensor: row.get(2)?,
                data_type: row.get(3)?,
                size_bytes: row.get(4)?,
                sample_count: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ─── Exports ────────────────────────────────────────────────────

    /// Create an export job in `pending` state.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn create_export(&self, export: &ExportRow) -> EngineResult<()> {
        self.lock().execute(
            "INSERT INTO exports
             (id, session_id, status, format, file_path, created_at, completed_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                export.id,
                export.session_id,
                export.status.as_str(),
                export.format,
                export.file_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                export.created_at,
                export.completed_at,
                export.error,
            ],
        )?;
        Ok(())
    }

    /// Advance an export job's status.
    ///
    /// # Errors
    /// Propagates SQLite failures.
    pub fn update_export(
        &self,
        export_id: &str,
        status: ExportStatus,
        file_path: Option<&Path>,
        completed_at: Option<&str>,
        error: Option<&str>,
    ) -> EngineResult<()> {
        self.lock().execute(
            "UPDATE exports SET status = ?2,
                file_path = COALESCE(?3, file_path),
                completed_at = COALESCE(?4, completed_at),
                error = COALESCE(?5, error)
             WHERE id = ?1",
            params![
                export_id,
                status.as_str(),
                file_path.map(|p| p.to_string_lossy().into_owned()),
                completed_at,
                error,
            ],
        )?;
        Ok(())
    }

    /// Fetch one export job.
    ///
    /// # Errors
    /// `ExportNotFound` when missing; SQLite failures otherwise.
    pub fn get_export(&self, export_id: &str) -> EngineResult<ExportRow> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, session_id, status, format, file_path, created_at, completed_at, error
             FROM exports WHERE id = ?1",
            params![export_id],
            |row| {
                let status: String = row.get(2)?;
                let file_path: Option<String> = row.get(4)?;
                Ok(ExportRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    status: ExportStatus::parse(&status),
                    format: row.get(3)?,
                    file_path: file_path.map(PathBuf::from),
                    created_at: row.get(5)?,
                    completed_at: row.get(6)?,
                    error: row.get(7)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| EngineError::ExportNotFound {
            export_id: export_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::epoch_now;

    fn sample_session(id: &str, status: SessionStatus) -> SessionRow {
        SessionRow {
            id: id.to_string(),
            name: format!("session-{id}"),
            start_time: 1000.0,
            end_time: None,
            status,
            device_id: "AA:BB:CC:DD:EE:01".into(),
            root_dir: PathBuf::from(format!("/tmp/{id}")),
            participant_id: Some("p01".into()),
            condition: None,
            notes: None,
            tags: vec!["pilot".into()],
        }
    }

    #[test]
    fn test_session_round_trip() {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .insert_session(&sample_session("s1", SessionStatus::Recording))
            .unwrap();
        let loaded = store.get_session("s1").unwrap();
        assert_eq!(loaded.name, "session-s1");
        assert_eq!(loaded.status, SessionStatus::Recording);
        assert_eq!(loaded.tags, vec!["pilot".to_string()]);
    }

    #[test]
    fn test_missing_session_is_not_found() {
        let store = SessionStore::open_in_memory().unwrap();
        assert!(matches!(
            store.get_session("nope").unwrap_err(),
            EngineError::SessionNotFound { .. }
        ));
    }

    #[test]
    fn test_seal_session_sets_status_and_end() {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .insert_session(&sample_session("s1", SessionStatus::Recording))
            .unwrap();
        store
            .seal_session("s1", SessionStatus::Completed, 1010.0)
            .unwrap();
        let loaded = store.get_session("s1").unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert!(loaded.end_time.unwrap() >= loaded.start_time);
    }

    #[test]
    fn test_list_sessions_filters_by_status() {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .insert_session(&sample_session("a", SessionStatus::Completed))
            .unwrap();
        store
            .insert_session(&sample_session("b", SessionStatus::Failed))
            .unwrap();

        let failed = store
            .list_sessions(&SessionFilter {
                status: Some(SessionStatus::Failed),
                ..SessionFilter::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "b");

        let all = store.list_sessions(&SessionFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_fail_stale_recordings() {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .insert_session(&sample_session("s1", SessionStatus::Recording))
            .unwrap();
        store
            .insert_session(&sample_session("s2", SessionStatus::Completed))
            .unwrap();
        let sealed = store.fail_stale_recordings(epoch_now()).unwrap();
        assert_eq!(sealed, 1);
        assert_eq!(
            store.get_session("s1").unwrap().status,
            SessionStatus::Failed
        );
        assert_eq!(
            store.get_session("s2").unwrap().status,
            SessionStatus::Completed
        );
    }

    #[test]
    fn test_registered_device_upsert_and_last() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut device = DeviceDescriptor {
            address: "AA:BB:CC:DD:EE:01".into(),
            name: "Band".into(),
            last_seen: 10.0,
            rssi: Some(-60),
        };
        store.register_device(&device).unwrap();
        device.last_seen = 20.0;
        device.name = "Band 2".into();
        store.register_device(&device).unwrap();

        let last = store.last_registered_device().unwrap().unwrap();
        assert_eq!(last.name, "Band 2");
        assert!((last.last_seen - 20.0).abs() < f64::EPSILON);

        store.unregister_device("AA:BB:CC:DD:EE:01").unwrap();
        assert!(store.last_registered_device().unwrap().is_none());
    }

    #[test]
    fn test_export_lifecycle() {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .insert_session(&sample_session("s1", SessionStatus::Completed))
            .unwrap();
        let export = ExportRow {
            id: "e1".into(),
            session_id: "s1".into(),
            status: ExportStatus::Pending,
            format: "csv".into(),
            file_path: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            completed_at: None,
            error: None,
        };
        store.create_export(&export).unwrap();
        store
            .update_export(
                "e1",
                ExportStatus::Completed,
                Some(Path::new("/tmp/s1/exports/e1.csv")),
                Some("2026-01-01T00:00:05Z"),
                None,
            )
            .unwrap();
        let loaded = store.get_export("e1").unwrap();
        assert_eq!(loaded.status, ExportStatus::Completed);
        assert!(loaded.file_path.unwrap().ends_with("e1.csv"));
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn test_delete_session_cascades() {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .insert_session(&sample_session("s1", SessionStatus::Completed))
            .unwrap();
        store
            .insert_file(&FileRow {
                session_id: "s1".into(),
                filename: "x_eeg_raw.json".into(),
                sensor: "eeg".into(),
                data_type: "raw".into(),
                size_bytes: 10,
                sample_count: Some(3),
                created_at: "2026-01-01T00:00:00Z".into(),
            })
            .unwrap();
        store.delete_session("s1").unwrap();
        assert!(store.get_session("s1").is_err());
        assert!(store.files_for("s1").unwrap().is_empty());
    }
}
