//! SQLite event store: append-only persistence for detections and
//! assessments.
//!
//! All SQL runs on blocking threads via `spawn_blocking`; the connection is
//! serialized behind a mutex. Writes are append-only and the pipeline never
//! reads them back on the hot path, so a single connection is enough.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use sentinel_core::ports::EventStore;
use sentinel_domain::{
    BatchAssessment, BoundingBox, Detection, DetectionFilter, DetectionRecord, Result,
    SentinelError,
};
use tokio::task;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS detections (
    id            TEXT PRIMARY KEY,
    source_id     TEXT NOT NULL,
    object_type   TEXT NOT NULL,
    confidence    REAL NOT NULL,
    bbox_x        REAL NOT NULL,
    bbox_y        REAL NOT NULL,
    bbox_width    REAL NOT NULL,
    bbox_height   REAL NOT NULL,
    detected_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_detections_source_time
    ON detections (source_id, detected_at);

CREATE TABLE IF NOT EXISTS assessments (
    batch_id          TEXT PRIMARY KEY,
    source_id         TEXT NOT NULL,
    member_count      INTEGER NOT NULL,
    risk_score        INTEGER NOT NULL,
    risk_level        TEXT NOT NULL,
    summary           TEXT NOT NULL,
    reasoning         TEXT NOT NULL,
    degraded_fallback INTEGER NOT NULL,
    assessed_at       INTEGER NOT NULL
);
";

/// SQLite-based [`EventStore`].
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open (or create) a store at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(map_sql_error)?;
        Self::init(conn)
    }

    /// Open an in-memory store, used by tests and demos.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_sql_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(map_sql_error)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = conn.lock();
            op(&conn).map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn store_detection(&self, record: &DetectionRecord) -> Result<()> {
        let record = record.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO detections
                     (id, source_id, object_type, confidence,
                      bbox_x, bbox_y, bbox_width, bbox_height, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.source_id,
                    record.detection.object_type,
                    record.detection.confidence as f64,
                    record.detection.bbox.x as f64,
                    record.detection.bbox.y as f64,
                    record.detection.bbox.width as f64,
                    record.detection.bbox.height as f64,
                    record.detected_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn store_assessment(&self, assessment: &BatchAssessment) -> Result<()> {
        let assessment = assessment.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO assessments
                     (batch_id, source_id, member_count, risk_score, risk_level,
                      summary, reasoning, degraded_fallback, assessed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    assessment.batch_id,
                    assessment.source_id,
                    assessment.member_count as i64,
                    i64::from(assessment.assessment.risk_score),
                    assessment.assessment.risk_level.to_string(),
                    assessment.assessment.summary,
                    assessment.assessment.reasoning,
                    assessment.degraded_fallback as i64,
                    assessment.assessed_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn query_detections(&self, filter: &DetectionFilter) -> Result<Vec<DetectionRecord>> {
        let filter = filter.clone();
        self.run_blocking(move |conn| {
            let mut sql = String::from(
                "SELECT id, source_id, object_type, confidence,
                        bbox_x, bbox_y, bbox_width, bbox_height, detected_at
                 FROM detections WHERE 1=1",
            );
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(source_id) = &filter.source_id {
                sql.push_str(" AND source_id = ?");
                args.push(Box::new(source_id.clone()));
            }
            if let Some(since) = filter.since {
                sql.push_str(" AND detected_at >= ?");
                args.push(Box::new(since.timestamp_millis()));
            }
            sql.push_str(" ORDER BY detected_at DESC");
            if let Some(limit) = filter.limit {
                sql.push_str(" LIMIT ?");
                args.push(Box::new(limit as i64));
            }

            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(args.iter().map(|arg| arg.as_ref()));
            let rows = stmt.query_map(params, map_detection_row)?;
            rows.collect()
        })
        .await
    }
}

fn map_detection_row(row: &Row<'_>) -> rusqlite::Result<DetectionRecord> {
    let detected_at_millis: i64 = row.get(8)?;
    let detected_at = DateTime::from_timestamp_millis(detected_at_millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "timestamp out of range",
            )),
        )
    })?;

    Ok(DetectionRecord {
        id: row.get(0)?,
        source_id: row.get(1)?,
        detection: Detection {
            object_type: row.get(2)?,
            confidence: row.get::<_, f64>(3)? as f32,
            bbox: BoundingBox {
                x: row.get::<_, f64>(4)? as f32,
                y: row.get::<_, f64>(5)? as f32,
                width: row.get::<_, f64>(6)? as f32,
                height: row.get::<_, f64>(7)? as f32,
            },
        },
        detected_at,
    })
}

fn map_sql_error(err: rusqlite::Error) -> SentinelError {
    SentinelError::Storage(err.to_string())
}

fn map_join_error(err: task::JoinError) -> SentinelError {
    if err.is_cancelled() {
        SentinelError::Internal("blocking task cancelled".into())
    } else {
        SentinelError::Internal(format!("blocking task failed: {err}"))
    }
}
