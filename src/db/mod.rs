pub mod models;
pub mod writer;


use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use models::*;
pub use writer::{WriteAction, WriteOutcome, Writer};

/// SQLite store for episodes, jobs, transcripts and the classification
/// audit trail. Reads may come from any thread; all mutation goes through
/// the [`Writer`] actor, which owns the only mutating reference.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                audio_url TEXT NOT NULL UNIQUE,
                whitelisted INTEGER NOT NULL DEFAULT 0,
                duration REAL,
                status TEXT NOT NULL DEFAULT 'pending',
                unprocessed_path TEXT,
                processed_path TEXT,
                created_date TEXT NOT NULL DEFAULT (datetime('now')),
                downloaded_date TEXT,
                processed_date TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status);

            CREATE TABLE IF NOT EXISTS processing_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL,
                stage TEXT NOT NULL DEFAULT 'downloading',
                status TEXT NOT NULL DEFAULT 'queued',
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_episode ON processing_jobs(episode_id);
            -- At most one non-terminal job per episode, by construction.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_active
                ON processing_jobs(episode_id) WHERE status IN ('queued', 'running');

            CREATE TABLE IF NOT EXISTS transcript_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                text TEXT NOT NULL,
                label TEXT,
                mixed INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE,
                UNIQUE(episode_id, sequence)
            );

            CREATE INDEX IF NOT EXISTS idx_segments_episode
                ON transcript_segments(episode_id, sequence);

            CREATE TABLE IF NOT EXISTS model_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL,
                first_sequence INTEGER NOT NULL,
                last_sequence INTEGER NOT NULL,
                model TEXT NOT NULL,
                prompt TEXT NOT NULL,
                response TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_model_calls_episode ON model_calls(episode_id);

            CREATE TABLE IF NOT EXISTS identifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                segment_id INTEGER NOT NULL,
                model_call_id INTEGER NOT NULL,
                label TEXT NOT NULL,
                confidence REAL NOT NULL,
                mixed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (segment_id) REFERENCES transcript_segments(id) ON DELETE CASCADE,
                FOREIGN KEY (model_call_id) REFERENCES model_calls(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_identifications_segment
                ON identifications(segment_id);

            -- Append-only diagnostics trail for stage failures
            CREATE TABLE IF NOT EXISTS pipeline_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stage TEXT NOT NULL,
                episode_id INTEGER,
                error_kind TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- App settings (key-value store)
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT DEFAULT (datetime('now'))
            );
        "#,
        )?;
        Ok(())
    }

    // =========================================================================
    // Episode queries
    // =========================================================================

    pub fn insert_episode(&self, episode: &NewEpisode) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO episodes (title, audio_url, whitelisted) VALUES (?, ?, ?)",
            params![episode.title, episode.audio_url, episode.whitelisted as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_episode(&self, episode_id: i64) -> Result<Option<Episode>> {
        let conn = self.conn.lock().unwrap();
        let episode = conn
            .query_row(
                "SELECT id, title, audio_url, whitelisted, duration, status,
                        unprocessed_path, processed_path, created_date,
                        downloaded_date, processed_date
                 FROM episodes WHERE id = ?",
                params![episode_id],
                map_episode,
            )
            .optional()?;
        Ok(episode)
    }

    pub fn list_episodes(&self) -> Result<Vec<Episode>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, audio_url, whitelisted, duration, status,
                    unprocessed_path, processed_path, created_date,
                    downloaded_date, processed_date
             FROM episodes ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_episode)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_episode_status(&self, episode_id: i64, status: EpisodeStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE episodes SET status = ? WHERE id = ?",
            params![status.to_string(), episode_id],
        )?;
        Ok(())
    }

    pub fn set_episode_duration(&self, episode_id: i64, duration: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE episodes SET duration = ? WHERE id = ?",
            params![duration, episode_id],
        )?;
        Ok(())
    }

    pub fn set_whitelisted(&self, episode_id: i64, whitelisted: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE episodes SET whitelisted = ? WHERE id = ?",
            params![whitelisted as i64, episode_id],
        )?;
        Ok(())
    }

    pub fn mark_downloaded(&self, episode_id: i64, file_path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE episodes SET unprocessed_path = ?, downloaded_date = datetime('now')
             WHERE id = ?",
            params![file_path, episode_id],
        )?;
        Ok(())
    }

    pub fn mark_processed(&self, episode_id: i64, file_path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE episodes SET processed_path = ?, processed_date = datetime('now'),
                    status = 'completed'
             WHERE id = ?",
            params![file_path, episode_id],
        )?;
        Ok(())
    }

    /// Null out audio paths when storage is reclaimed. `processed_only`
    /// keeps the source file; either way the episode drops back to pending
    /// so a later request reprocesses it from scratch.
    pub fn clear_audio_paths(&self, episode_id: i64, processed_only: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if processed_only {
            conn.execute(
                "UPDATE episodes SET processed_path = NULL, processed_date = NULL,
                        status = 'pending'
                 WHERE id = ?",
                params![episode_id],
            )?;
        } else {
            conn.execute(
                "UPDATE episodes SET unprocessed_path = NULL, processed_path = NULL,
                        downloaded_date = NULL, processed_date = NULL, status = 'pending'
                 WHERE id = ?",
                params![episode_id],
            )?;
        }
        Ok(())
    }

    // =========================================================================
    // Job queries
    // =========================================================================

    /// Create a queued job for the episode. Fails if a non-terminal job
    /// already exists; callers are expected to coalesce onto that job.
    pub fn create_job(&self, episode_id: i64) -> Result<ProcessingJob> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM processing_jobs
                 WHERE episode_id = ? AND status IN ('queued', 'running')",
                params![episode_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            bail!("episode {} already has active job {}", episode_id, id);
        }

        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO processing_jobs (episode_id, stage, status, created_at)
             VALUES (?, 'downloading', 'queued', ?)",
            params![episode_id, now],
        )?;
        let job_id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE episodes SET status = 'queued' WHERE id = ?",
            params![episode_id],
        )?;
        Ok(conn.query_row(JOB_SELECT_BY_ID, params![job_id], map_job)?)
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<ProcessingJob>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(JOB_SELECT_BY_ID, params![job_id], map_job)
            .optional()?)
    }

    pub fn get_active_job(&self, episode_id: i64) -> Result<Option<ProcessingJob>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT id, episode_id, stage, status, error_message, retry_count,
                        created_at, started_at, completed_at
                 FROM processing_jobs
                 WHERE episode_id = ? AND status IN ('queued', 'running')",
                params![episode_id],
                map_job,
            )
            .optional()?)
    }

    pub fn get_latest_job(&self, episode_id: i64) -> Result<Option<ProcessingJob>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT id, episode_id, stage, status, error_message, retry_count,
                        created_at, started_at, completed_at
                 FROM processing_jobs
                 WHERE episode_id = ?
                 ORDER BY id DESC LIMIT 1",
                params![episode_id],
                map_job,
            )
            .optional()?)
    }

    pub fn start_job(&self, job_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE processing_jobs SET status = 'running', started_at = ? WHERE id = ?",
            params![now, job_id],
        )?;
        conn.execute(
            "UPDATE episodes SET status = 'processing'
             WHERE id = (SELECT episode_id FROM processing_jobs WHERE id = ?)",
            params![job_id],
        )?;
        Ok(())
    }

    pub fn advance_job_stage(&self, job_id: i64, stage: JobStage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE processing_jobs SET stage = ?, retry_count = 0 WHERE id = ?",
            params![stage.name(), job_id],
        )?;
        Ok(())
    }

    fn finish_job(
        &self,
        job_id: i64,
        status: JobStatus,
        episode_status: EpisodeStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE processing_jobs SET status = ?, error_message = ?, completed_at = ?
             WHERE id = ?",
            params![status.to_string(), error_message, now, job_id],
        )?;
        conn.execute(
            "UPDATE episodes SET status = ?
             WHERE id = (SELECT episode_id FROM processing_jobs WHERE id = ?)",
            params![episode_status.to_string(), job_id],
        )?;
        Ok(())
    }

    pub fn complete_job(&self, job_id: i64) -> Result<()> {
        self.finish_job(job_id, JobStatus::Completed, EpisodeStatus::Completed, None)
    }

    pub fn fail_job(&self, job_id: i64, message: &str) -> Result<()> {
        self.finish_job(job_id, JobStatus::Failed, EpisodeStatus::Failed, Some(message))
    }

    pub fn cancel_job(&self, job_id: i64) -> Result<()> {
        self.finish_job(job_id, JobStatus::Cancelled, EpisodeStatus::Pending, None)
    }

    pub fn skip_job(&self, job_id: i64) -> Result<()> {
        self.finish_job(job_id, JobStatus::Skipped, EpisodeStatus::Pending, None)
    }

    pub fn bump_job_retry(&self, job_id: i64) -> Result<i32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE processing_jobs SET retry_count = retry_count + 1 WHERE id = ?",
            params![job_id],
        )?;
        Ok(conn.query_row(
            "SELECT retry_count FROM processing_jobs WHERE id = ?",
            params![job_id],
            |row| row.get(0),
        )?)
    }

    /// Reset any jobs left non-terminal by a crash back to queued
    /// (recovery on startup).
    pub fn reset_stuck_jobs(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE processing_jobs SET status = 'queued', started_at = NULL
             WHERE status = 'running'",
            [],
        )?;
        if count > 0 {
            log::info!("Reset {} stuck running jobs to queued", count);
        }
        Ok(count)
    }

    // =========================================================================
    // Transcript segment queries
    // =========================================================================

    /// Replace the episode's entire segment set atomically. Segment text is
    /// immutable once written; a stale transcript is regenerated wholesale,
    /// never patched, so cascading identifications are dropped with it.
    pub fn replace_segments(&self, episode_id: i64, segments: &[NewSegment]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM transcript_segments WHERE episode_id = ?",
            params![episode_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO transcript_segments
                     (episode_id, sequence, start_time, end_time, text)
                 VALUES (?, ?, ?, ?, ?)",
            )?;
            for (sequence, segment) in segments.iter().enumerate() {
                stmt.execute(params![
                    episode_id,
                    sequence as i64,
                    segment.start_time,
                    segment.end_time,
                    segment.text,
                ])?;
            }
        }
        tx.commit()?;
        Ok(segments.len())
    }

    pub fn get_segments(&self, episode_id: i64) -> Result<Vec<TranscriptSegment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, episode_id, sequence, start_time, end_time, text, label, mixed
             FROM transcript_segments
             WHERE episode_id = ?
             ORDER BY sequence",
        )?;
        let rows = stmt.query_map(params![episode_id], map_segment)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_segments(&self, episode_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM transcript_segments WHERE episode_id = ?",
            params![episode_id],
            |row| row.get(0),
        )?)
    }

    /// Highest sequence number that already carries a primary label; resume
    /// point for the chunk planner after a partial classification run.
    pub fn last_classified_sequence(&self, episode_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT MAX(sequence) FROM transcript_segments
             WHERE episode_id = ? AND label IS NOT NULL",
            params![episode_id],
            |row| row.get(0),
        )?)
    }

    // =========================================================================
    // Model call queries
    // =========================================================================

    /// Record a pending model call. The referenced range must exist in full;
    /// a dangling range is a data-integrity error, not something to patch.
    pub fn create_model_call(
        &self,
        episode_id: i64,
        first_sequence: i64,
        last_sequence: i64,
        model: &str,
        prompt: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let expected = last_sequence - first_sequence + 1;
        let present: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transcript_segments
             WHERE episode_id = ? AND sequence BETWEEN ? AND ?",
            params![episode_id, first_sequence, last_sequence],
            |row| row.get(0),
        )?;
        if present != expected {
            bail!(
                "segment range {}..={} for episode {} references missing segments ({} of {} present)",
                first_sequence,
                last_sequence,
                episode_id,
                present,
                expected
            );
        }

        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO model_calls
                 (episode_id, first_sequence, last_sequence, model, prompt, status, created_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?)",
            params![episode_id, first_sequence, last_sequence, model, prompt, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_model_call_success(&self, model_call_id: i64, response: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE model_calls SET status = 'success', response = ?, error_message = NULL
             WHERE id = ?",
            params![response, model_call_id],
        )?;
        Ok(())
    }

    pub fn finish_model_call_failure(&self, model_call_id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE model_calls SET status = 'failed', error_message = ? WHERE id = ?",
            params![error, model_call_id],
        )?;
        Ok(())
    }

    pub fn bump_model_call_retry(&self, model_call_id: i64) -> Result<i32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE model_calls SET retry_count = retry_count + 1 WHERE id = ?",
            params![model_call_id],
        )?;
        Ok(conn.query_row(
            "SELECT retry_count FROM model_calls WHERE id = ?",
            params![model_call_id],
            |row| row.get(0),
        )?)
    }

    pub fn get_model_calls(&self, episode_id: i64) -> Result<Vec<ModelCall>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, episode_id, first_sequence, last_sequence, model, prompt,
                    response, status, retry_count, error_message, created_at
             FROM model_calls
             WHERE episode_id = ?
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![episode_id], map_model_call)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // =========================================================================
    // Identification queries
    // =========================================================================

    /// Append identifications and refresh each segment's primary label in the
    /// same transaction, latest identification wins.
    pub fn record_identifications(&self, items: &[NewIdentification]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO identifications
                     (segment_id, model_call_id, label, confidence, mixed, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            let mut relabel = tx.prepare(
                "UPDATE transcript_segments SET label = ?, mixed = ? WHERE id = ?",
            )?;
            let now = chrono::Utc::now().to_rfc3339();
            for item in items {
                insert.execute(params![
                    item.segment_id,
                    item.model_call_id,
                    item.label.to_string(),
                    item.confidence,
                    item.mixed as i64,
                    now,
                ])?;
                relabel.execute(params![
                    item.label.to_string(),
                    item.mixed as i64,
                    item.segment_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(items.len())
    }

    pub fn get_identifications(&self, episode_id: i64) -> Result<Vec<Identification>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT i.id, i.segment_id, i.model_call_id, i.label, i.confidence,
                    i.mixed, i.created_at
             FROM identifications i
             JOIN transcript_segments s ON s.id = i.segment_id
             WHERE s.episode_id = ?
             ORDER BY i.id",
        )?;
        let rows = stmt.query_map(params![episode_id], map_identification)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Drop classification artifacts ahead of a reprocess: identifications,
    /// model calls, segment labels, and the processed output pointer. Cached
    /// segments survive; the transcription stage revalidates them by
    /// duration and reuses them when the audio is unchanged.
    pub fn clear_processing_artifacts(&self, episode_id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM identifications WHERE segment_id IN
                 (SELECT id FROM transcript_segments WHERE episode_id = ?)",
            params![episode_id],
        )?;
        tx.execute(
            "DELETE FROM model_calls WHERE episode_id = ?",
            params![episode_id],
        )?;
        tx.execute(
            "UPDATE transcript_segments SET label = NULL, mixed = 0 WHERE episode_id = ?",
            params![episode_id],
        )?;
        tx.execute(
            "UPDATE episodes SET processed_path = NULL, processed_date = NULL,
                    status = 'pending'
             WHERE id = ?",
            params![episode_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn log_pipeline_error(
        &self,
        stage: &str,
        episode_id: Option<i64>,
        error_kind: &str,
        message: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pipeline_errors (stage, episode_id, error_kind, message)
             VALUES (?, ?, ?, ?)",
            params![stage, episode_id, error_kind, message],
        )?;
        Ok(())
    }

    pub fn get_recent_errors(&self, limit: i64) -> Result<Vec<(String, Option<i64>, String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT stage, episode_id, error_kind, message
             FROM pipeline_errors ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT value FROM app_settings WHERE key = ?",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES (?, ?, ?)",
            params![key, value, now],
        )?;
        Ok(())
    }
}

// =============================================================================
// Row mappers
// =============================================================================

const JOB_SELECT_BY_ID: &str =
    "SELECT id, episode_id, stage, status, error_message, retry_count,
            created_at, started_at, completed_at
     FROM processing_jobs WHERE id = ?";

fn map_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        title: row.get(1)?,
        audio_url: row.get(2)?,
        whitelisted: row.get::<_, i64>(3)? != 0,
        duration: row.get(4)?,
        status: EpisodeStatus::from(row.get::<_, String>(5)?),
        unprocessed_path: row.get(6)?,
        processed_path: row.get(7)?,
        created_date: row.get(8)?,
        downloaded_date: row.get(9)?,
        processed_date: row.get(10)?,
    })
}

fn map_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessingJob> {
    let stage: String = row.get(2)?;
    Ok(ProcessingJob {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        stage: parse_stage(&stage),
        status: JobStatus::from(row.get::<_, String>(3)?),
        error_message: row.get(4)?,
        retry_count: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

fn parse_stage(s: &str) -> JobStage {
    match s {
        "transcribing" => JobStage::Transcribing,
        "identifying" => JobStage::Identifying,
        "rendering" => JobStage::Rendering,
        _ => JobStage::Downloading,
    }
}

fn map_segment(row: &rusqlite::Row<'_>) -> rusqlite::Result<TranscriptSegment> {
    let label: Option<String> = row.get(6)?;
    Ok(TranscriptSegment {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        sequence: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        text: row.get(5)?,
        label: label.as_deref().and_then(AdLabel::parse),
        mixed: row.get::<_, i64>(7)? != 0,
    })
}

fn map_model_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelCall> {
    Ok(ModelCall {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        first_sequence: row.get(2)?,
        last_sequence: row.get(3)?,
        model: row.get(4)?,
        prompt: row.get(5)?,
        response: row.get(6)?,
        status: ModelCallStatus::from(row.get::<_, String>(7)?),
        retry_count: row.get(8)?,
        error_message: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn map_identification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identification> {
    let label: String = row.get(3)?;
    Ok(Identification {
        id: row.get(0)?,
        segment_id: row.get(1)?,
        model_call_id: row.get(2)?,
        label: AdLabel::parse(&label).unwrap_or(AdLabel::Content),
        confidence: row.get(4)?,
        mixed: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}
