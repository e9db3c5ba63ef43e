//! Recording history operations.

use std::path::PathBuf;

use pvr_protocol::{Channel, Commercial, Recording};
use rusqlite::{params, OptionalExtension, Row};

use super::models::{datetime_column, json_column};
use super::{Database, DatabaseError, Result};

const RECORDING_COLUMNS: &str = "id, title, path, real_start, duration_secs, current_recording, \
     recording_rule_id, show_id, channel, channel_name, recorder, commercials, indexed_extension";

fn recording_from_row(row: &Row<'_>) -> rusqlite::Result<Recording> {
    let channel: Option<String> = row.get(8)?;
    let channel_name: Option<String> = row.get(9)?;
    Ok(Recording {
        id: row.get(0)?,
        title: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        real_start: datetime_column(row, 3)?,
        duration_secs: row.get::<_, i64>(4)?.max(0) as u64,
        current_recording: row.get::<_, i64>(5)? != 0,
        recording_rule_id: row.get(6)?,
        show_id: row.get(7)?,
        channel: channel.map(|number| Channel { number, name: channel_name }),
        recorder: row.get(10)?,
        commercials: json_column(row, 11)?,
        indexed_extension: row.get(12)?,
    })
}

impl Database {
    /// Insert a recording and return its new id.
    pub fn insert_recording(&self, recording: &Recording) -> Result<i64> {
        let commercials = serde_json::to_string(&recording.commercials)?;
        self.conn.execute(
            "INSERT INTO recordings (title, path, real_start, duration_secs, current_recording,
                                     recording_rule_id, show_id, channel, channel_name, recorder,
                                     commercials, indexed_extension)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                recording.title,
                recording.path.to_string_lossy(),
                recording.real_start.timestamp(),
                recording.duration_secs as i64,
                recording.current_recording as i64,
                recording.recording_rule_id,
                recording.show_id,
                recording.channel.as_ref().map(|c| c.number.as_str()),
                recording.channel.as_ref().and_then(|c| c.name.as_deref()),
                recording.recorder,
                commercials,
                recording.indexed_extension,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Persist every field of an existing recording.
    pub fn update_recording(&self, recording: &Recording) -> Result<()> {
        let commercials = serde_json::to_string(&recording.commercials)?;
        let updated = self.conn.execute(
            "UPDATE recordings SET title = ?2, path = ?3, real_start = ?4, duration_secs = ?5,
                    current_recording = ?6, recording_rule_id = ?7, show_id = ?8, channel = ?9,
                    channel_name = ?10, recorder = ?11, commercials = ?12, indexed_extension = ?13
             WHERE id = ?1",
            params![
                recording.id,
                recording.title,
                recording.path.to_string_lossy(),
                recording.real_start.timestamp(),
                recording.duration_secs as i64,
                recording.current_recording as i64,
                recording.recording_rule_id,
                recording.show_id,
                recording.channel.as_ref().map(|c| c.number.as_str()),
                recording.channel.as_ref().and_then(|c| c.name.as_deref()),
                recording.recorder,
                commercials,
                recording.indexed_extension,
            ],
        )?;
        if updated == 0 {
            return Err(DatabaseError::RecordingNotFound(recording.id));
        }
        Ok(())
    }

    /// Get a recording by id.
    pub fn get_recording(&self, id: i64) -> Result<Option<Recording>> {
        let recording = self
            .conn
            .query_row(
                &format!("SELECT {} FROM recordings WHERE id = ?1", RECORDING_COLUMNS),
                params![id],
                recording_from_row,
            )
            .optional()?;
        Ok(recording)
    }

    /// Get all recordings, newest first.
    pub fn get_recordings(&self) -> Result<Vec<Recording>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM recordings ORDER BY real_start DESC, id DESC",
            RECORDING_COLUMNS
        ))?;
        let recordings = stmt
            .query_map([], recording_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(recordings)
    }

    /// Get the recordings a recorder is currently writing.
    pub fn get_current_recordings(&self) -> Result<Vec<Recording>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM recordings WHERE current_recording = 1 ORDER BY id",
            RECORDING_COLUMNS
        ))?;
        let recordings = stmt
            .query_map([], recording_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(recordings)
    }

    /// Clear the current-recording flag of rows left over from a previous run.
    pub fn clear_stale_current_recordings(&self) -> Result<usize> {
        let cleared = self.conn.execute(
            "UPDATE recordings SET current_recording = 0 WHERE current_recording = 1",
            [],
        )?;
        Ok(cleared)
    }

    /// Replace the commercial breaks of a recording.
    pub fn set_commercials(&self, id: i64, commercials: &[Commercial]) -> Result<()> {
        let json = serde_json::to_string(commercials)?;
        let updated = self.conn.execute(
            "UPDATE recordings SET commercials = ?2 WHERE id = ?1",
            params![id, json],
        )?;
        if updated == 0 {
            return Err(DatabaseError::RecordingNotFound(id));
        }
        Ok(())
    }

    /// Flag a recording for removal by the janitor. Returns whether the
    /// recording exists.
    pub fn mark_recording_for_removal(&self, id: i64) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE recordings SET pending_removal = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(updated > 0)
    }

    /// Get the recordings flagged for removal, oldest request first.
    pub fn get_recordings_marked_for_removal(&self) -> Result<Vec<Recording>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM recordings WHERE pending_removal = 1 ORDER BY updated_at, id",
            RECORDING_COLUMNS
        ))?;
        let recordings = stmt
            .query_map([], recording_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(recordings)
    }

    /// Delete a recording row. Returns whether a row was deleted.
    pub fn delete_recording(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM recordings WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}
