//! Show cache (local guide listings) operations.

use chrono::{DateTime, Utc};
use pvr_protocol::{Channel, ShowAiring};
use rusqlite::{params, OptionalExtension, Row};

use super::models::datetime_column;
use super::{Database, Result};

const AIRING_COLUMNS: &str =
    "show_id, series_id, title, episode_title, channel, channel_name, start_at, duration_secs";

fn airing_from_row(row: &Row<'_>) -> rusqlite::Result<ShowAiring> {
    Ok(ShowAiring {
        show_id: row.get(0)?,
        series_id: row.get(1)?,
        title: row.get(2)?,
        episode_title: row.get(3)?,
        channel: Channel {
            number: row.get(4)?,
            name: row.get(5)?,
        },
        start: datetime_column(row, 6)?,
        duration_secs: row.get::<_, i64>(7)?.max(0) as u64,
    })
}

impl Database {
    /// Insert or replace a guide listing.
    pub fn upsert_show_airing(&self, airing: &ShowAiring) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO show_airings
             (show_id, series_id, title, episode_title, channel, channel_name, start_at, duration_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                airing.show_id,
                airing.series_id,
                airing.title,
                airing.episode_title,
                airing.channel.number,
                airing.channel.name,
                airing.start.timestamp(),
                airing.duration_secs as i64,
            ],
        )?;
        Ok(())
    }

    /// Get all airings of a series on a channel, ordered by start time.
    pub fn get_show_airings_by_channel_and_series_id(
        &self,
        channel: &Channel,
        series_id: &str,
    ) -> Result<Vec<ShowAiring>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM show_airings WHERE channel = ?1 AND series_id = ?2 ORDER BY start_at, show_id",
            AIRING_COLUMNS
        ))?;
        let airings = stmt
            .query_map(params![channel.number, series_id], airing_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(airings)
    }

    /// Get one airing by show id.
    pub fn get_show_airing(&self, show_id: &str) -> Result<Option<ShowAiring>> {
        let airing = self
            .conn
            .query_row(
                &format!("SELECT {} FROM show_airings WHERE show_id = ?1", AIRING_COLUMNS),
                params![show_id],
                airing_from_row,
            )
            .optional()?;
        Ok(airing)
    }

    /// Every channel that has listings, ordered by number.
    pub fn get_guide_channels(&self) -> Result<Vec<Channel>> {
        let mut stmt = self.conn.prepare(
            "SELECT channel, MAX(channel_name) FROM show_airings GROUP BY channel ORDER BY channel",
        )?;
        let channels = stmt
            .query_map([], |row| {
                Ok(Channel {
                    number: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    /// Drop listings that ended before the given time.
    pub fn purge_airings_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM show_airings WHERE start_at + duration_secs < ?1",
            params![before.timestamp()],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn airing(show_id: &str, series: &str, channel: &str, hour: u32) -> ShowAiring {
        ShowAiring {
            show_id: show_id.into(),
            series_id: Some(series.into()),
            title: "Drama".into(),
            episode_title: None,
            channel: Channel::new(channel),
            start: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            duration_secs: 3600,
        }
    }

    #[test]
    fn test_query_by_channel_and_series() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_show_airing(&airing("ep-2", "s1", "5", 21)).unwrap();
        db.upsert_show_airing(&airing("ep-1", "s1", "5", 20)).unwrap();
        db.upsert_show_airing(&airing("ep-3", "s1", "7", 20)).unwrap();
        db.upsert_show_airing(&airing("other", "s2", "5", 20)).unwrap();

        let found = db
            .get_show_airings_by_channel_and_series_id(&Channel::new("5"), "s1")
            .unwrap();
        let ids: Vec<_> = found.iter().map(|a| a.show_id.as_str()).collect();
        assert_eq!(ids, vec!["ep-1", "ep-2"]);
    }

    #[test]
    fn test_guide_channels_are_distinct() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_show_airing(&airing("ep-1", "s1", "7", 20)).unwrap();
        db.upsert_show_airing(&airing("ep-2", "s1", "5", 20)).unwrap();
        db.upsert_show_airing(&airing("ep-3", "s2", "5", 21)).unwrap();

        let numbers: Vec<_> = db
            .get_guide_channels()
            .unwrap()
            .into_iter()
            .map(|c| c.number)
            .collect();
        assert_eq!(numbers, vec!["5", "7"]);
    }

    #[test]
    fn test_purge_and_lookup() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_show_airing(&airing("ep-1", "s1", "5", 10)).unwrap();
        db.upsert_show_airing(&airing("ep-2", "s1", "5", 20)).unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(db.purge_airings_before(cutoff).unwrap(), 1);
        assert!(db.get_show_airing("ep-1").unwrap().is_none());
        assert_eq!(db.get_show_airing("ep-2").unwrap().unwrap().show_id, "ep-2");
    }
}
