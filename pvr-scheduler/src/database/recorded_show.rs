//! Recorded-show ledger operations.

use pvr_protocol::RecordedShow;
use rusqlite::params;

use super::models::datetime_column;
use super::{Database, Result};

impl Database {
    /// Check whether a show has ever been captured.
    pub fn is_already_recorded(&self, show_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM recorded_shows WHERE show_id = ?1",
            params![show_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Add a show to the ledger, replacing any previous entry for it.
    pub fn add_recorded_show(&mut self, show: &RecordedShow) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM recorded_shows WHERE show_id = ?1",
            params![show.show_id],
        )?;
        tx.execute(
            "INSERT INTO recorded_shows (show_id, title, recorded_at) VALUES (?1, ?2, ?3)",
            params![show.show_id, show.title, show.recorded_at.timestamp()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a show from the ledger so it may be recorded again.
    pub fn remove_recorded_show(&self, show_id: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM recorded_shows WHERE show_id = ?1",
            params![show_id],
        )?;
        Ok(deleted > 0)
    }

    /// Get every ledger entry, most recent first.
    pub fn get_recorded_shows(&self) -> Result<Vec<RecordedShow>> {
        let mut stmt = self.conn.prepare(
            "SELECT show_id, title, recorded_at FROM recorded_shows ORDER BY recorded_at DESC, show_id",
        )?;
        let shows = stmt
            .query_map([], |row| {
                Ok(RecordedShow {
                    show_id: row.get(0)?,
                    title: row.get(1)?,
                    recorded_at: datetime_column(row, 2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(shows)
    }
}
