//! Recording rule store operations.

use pvr_protocol::{Channel, RecordingRule, RuleKind, Task};
use rusqlite::{params, OptionalExtension, Row};

use super::models::json_column;
use super::{Database, DatabaseError, Result};

const RULE_COLUMNS: &str = "id, name, kind, series_id, show_id, channel, channel_name, tasks";

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<RecordingRule> {
    let kind: String = row.get(2)?;
    let kind = kind.parse::<RuleKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(RecordingRule {
        id: row.get(0)?,
        name: row.get(1)?,
        kind,
        series_id: row.get(3)?,
        show_id: row.get(4)?,
        channel: Channel {
            number: row.get(5)?,
            name: row.get(6)?,
        },
        tasks: json_column(row, 7)?,
    })
}

impl Database {
    /// Add a recording rule, replacing any rule with the same id.
    ///
    /// Every column of an existing row is overwritten, so the stored rule is
    /// exactly the given one. The row keeps its place in creation order.
    pub fn add_recording_rule(&mut self, rule: &RecordingRule) -> Result<()> {
        rule.validate()?;
        let tasks = serde_json::to_string(&rule.tasks)?;
        self.conn.execute(
            "INSERT INTO recording_rules (id, name, kind, series_id, show_id, channel, channel_name, tasks)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name, kind = excluded.kind, series_id = excluded.series_id,
                 show_id = excluded.show_id, channel = excluded.channel,
                 channel_name = excluded.channel_name, tasks = excluded.tasks",
            params![
                rule.id,
                rule.name,
                rule.kind.as_str(),
                rule.series_id,
                rule.show_id,
                rule.channel.number,
                rule.channel.name,
                tasks,
            ],
        )?;

        log::debug!("Stored recording rule {} ({})", rule.id, rule.name);
        Ok(())
    }

    /// Remove a recording rule.
    ///
    /// Rules are matched by name first, then filtered by exact id so that a
    /// same-named rule with another id survives. Returns whether a rule was
    /// removed.
    pub fn remove_recording_rule(&self, name: &str, id: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM recording_rules WHERE name = ?1")?;
        let ids = stmt
            .query_map(params![name], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut removed = false;
        for candidate in ids.iter().filter(|candidate| candidate.as_str() == id) {
            removed |= self
                .conn
                .execute("DELETE FROM recording_rules WHERE id = ?1", params![candidate])?
                > 0;
        }
        Ok(removed)
    }

    /// Get all recording rules, ordered by creation.
    pub fn get_recording_rules(&self) -> Result<Vec<RecordingRule>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM recording_rules ORDER BY created_at, rowid",
            RULE_COLUMNS
        ))?;
        let rules = stmt
            .query_map([], rule_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Get a recording rule by id.
    pub fn get_recording_rule(&self, id: &str) -> Result<Option<RecordingRule>> {
        let rule = self
            .conn
            .query_row(
                &format!("SELECT {} FROM recording_rules WHERE id = ?1", RULE_COLUMNS),
                params![id],
                rule_from_row,
            )
            .optional()?;
        Ok(rule)
    }

    /// Replace the task list of a stored rule.
    pub fn update_rule_tasks(&self, id: &str, tasks: &[Task]) -> Result<()> {
        let tasks = serde_json::to_string(tasks)?;
        let updated = self.conn.execute(
            "UPDATE recording_rules SET tasks = ?2 WHERE id = ?1",
            params![id, tasks],
        )?;
        if updated == 0 {
            return Err(DatabaseError::RuleNotFound(id.to_string()));
        }
        Ok(())
    }
}
