use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::errors::{LabelError, LabelResult};
use crate::key::Coordinate;
use crate::label::LabelTier;

/// The display fields the resolver populates, exactly once per successful
/// resolution. Never contains raw coordinate text.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordResolution {
    pub display_name: String,
    pub display_tier: LabelTier,
    pub confidence: f64,
    pub resolved_at: DateTime<Utc>,
    pub resolution_version: u32,
}

/// Narrow collaborator contract: the resolver needs a readable coordinate
/// and the mutable display fields, nothing else about the report.
pub trait LabeledRecord {
    fn coordinate(&self) -> Coordinate;
    fn resolution(&self) -> Option<&RecordResolution>;
    fn apply_resolution(&mut self, resolution: RecordResolution);
}

#[derive(Debug, Clone)]
pub struct ReportRecord {
    pub id: i64,
    pub coordinate: Coordinate,
    pub resolution: Option<RecordResolution>,
}

impl LabeledRecord for ReportRecord {
    fn coordinate(&self) -> Coordinate {
        self.coordinate
    }

    fn resolution(&self) -> Option<&RecordResolution> {
        self.resolution.as_ref()
    }

    fn apply_resolution(&mut self, resolution: RecordResolution) {
        self.resolution = Some(resolution);
    }
}

/// SQLite-backed report store. Reports are created unresolved; the batch
/// migration sweeps them through the resolver later.
pub struct RecordStore {
    db: Arc<Mutex<Connection>>,
}

impl RecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> LabelResult<Self> {
        let connection = Connection::open(path.as_ref())?;
        Self::bootstrap(connection)
    }

    pub fn in_memory() -> LabelResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(connection: Connection) -> LabelResult<Self> {
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
                display_name TEXT,
                display_tier TEXT,
                confidence REAL,
                resolved_at TEXT,
                resolution_version INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_reports_resolution_version
                ON reports(resolution_version);
            "#,
        )?;
        info!(target: "record_store", "report store ready");
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
        })
    }

    pub fn insert_report(&self, coordinate: Coordinate) -> LabelResult<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO reports (latitude, longitude) VALUES (?1, ?2)",
            (coordinate.latitude, coordinate.longitude),
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_report(&self, id: i64) -> LabelResult<Option<ReportRecord>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT id, latitude, longitude, display_name, display_tier, confidence,
                    resolved_at, resolution_version
             FROM reports WHERE id = ?1",
            [id],
            parse_report,
        )
        .optional()
        .map_err(LabelError::from)
    }

    /// Reports never resolved, or resolved under an older rules version.
    /// Ordered by id and filtered past `after_id` so a sweep attempts each
    /// record at most once per run and resumes deterministically.
    pub fn load_unresolved(
        &self,
        current_version: u32,
        after_id: i64,
        limit: usize,
    ) -> LabelResult<Vec<ReportRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, latitude, longitude, display_name, display_tier, confidence,
                    resolved_at, resolution_version
             FROM reports
             WHERE (resolution_version IS NULL OR resolution_version < ?1)
               AND id > ?2
             ORDER BY id ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map((current_version, after_id, limit as i64), parse_report)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn unresolved_count(&self, current_version: u32) -> LabelResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reports
             WHERE resolution_version IS NULL OR resolution_version < ?1",
            [current_version],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// One transaction per batch: a crash mid-sweep loses at most this batch,
    /// and re-applying the same resolutions is harmless.
    pub fn apply_resolutions(&self, updates: &[(i64, RecordResolution)]) -> LabelResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE reports
                 SET display_name = ?2,
                     display_tier = ?3,
                     confidence = ?4,
                     resolved_at = ?5,
                     resolution_version = ?6
                 WHERE id = ?1",
            )?;
            for (id, resolution) in updates {
                stmt.execute((
                    id,
                    resolution.display_name.as_str(),
                    resolution.display_tier.as_tag(),
                    resolution.confidence,
                    resolution.resolved_at.to_rfc3339(),
                    resolution.resolution_version,
                ))?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn parse_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReportRecord> {
    let id: i64 = row.get(0)?;
    let latitude: f64 = row.get(1)?;
    let longitude: f64 = row.get(2)?;
    let display_name: Option<String> = row.get(3)?;
    let display_tier: Option<String> = row.get(4)?;
    let confidence: Option<f64> = row.get(5)?;
    let resolved_at: Option<String> = row.get(6)?;
    let resolution_version: Option<u32> = row.get(7)?;

    let resolution = match (display_name, display_tier, resolution_version) {
        (Some(display_name), Some(tier_tag), Some(resolution_version)) => {
            let display_tier = LabelTier::parse(&tier_tag).map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    format!("unknown tier tag {tier_tag}").into(),
                )
            })?;
            let resolved_at = resolved_at
                .as_deref()
                .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            Some(RecordResolution {
                display_name,
                display_tier,
                confidence: confidence.unwrap_or(0.0),
                resolved_at,
                resolution_version,
            })
        }
        _ => None,
    };

    Ok(ReportRecord {
        id,
        coordinate: Coordinate::new(latitude, longitude),
        resolution,
    })
}
