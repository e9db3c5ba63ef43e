//! Database schema definitions.

/// SQL schema for the recording database.
pub const SCHEMA_SQL: &str = r#"
-- Recording rules (user intent)
CREATE TABLE IF NOT EXISTS recording_rules (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,                  -- 'ONCE' or 'SERIES'
    series_id TEXT,                      -- Required for SERIES rules
    show_id TEXT,                        -- Required for ONCE rules
    channel TEXT NOT NULL,               -- Channel number
    tasks TEXT NOT NULL DEFAULT '[]',    -- JSON array of post-processing tasks
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Recording history (captured and in-progress)
CREATE TABLE IF NOT EXISTS recordings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    path TEXT NOT NULL,
    real_start INTEGER NOT NULL,         -- Actual capture start timestamp
    duration_secs INTEGER NOT NULL DEFAULT 0,
    current_recording INTEGER DEFAULT 0, -- 1 while a recorder writes the file
    recording_rule_id TEXT,              -- Back-reference (rule may be gone)
    show_id TEXT,
    channel TEXT,
    recorder TEXT,                       -- Title of the capturing recorder
    commercials TEXT NOT NULL DEFAULT '[]', -- JSON array of {start, end}
    indexed_extension TEXT,              -- e.g. 'mp4' once indexed
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Ledger of episodes that have been captured
CREATE TABLE IF NOT EXISTS recorded_shows (
    show_id TEXT PRIMARY KEY NOT NULL,
    title TEXT,
    recorded_at INTEGER NOT NULL
);

-- Show cache (guide listings)
CREATE TABLE IF NOT EXISTS show_airings (
    show_id TEXT PRIMARY KEY NOT NULL,
    series_id TEXT,
    title TEXT NOT NULL,
    episode_title TEXT,
    channel TEXT NOT NULL,
    channel_name TEXT,
    start_at INTEGER NOT NULL,
    duration_secs INTEGER NOT NULL
);

-- Scheduler configuration table
CREATE TABLE IF NOT EXISTS scheduler_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),  -- Only one config row allowed
    tick_interval_secs INTEGER DEFAULT 15,
    recheck_interval_secs INTEGER DEFAULT 5,
    claim_retry_limit INTEGER DEFAULT 15,
    claim_retry_backoff_ms INTEGER DEFAULT 1000,
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Indexes for efficient queries
CREATE INDEX IF NOT EXISTS idx_recording_rules_name ON recording_rules(name);
CREATE INDEX IF NOT EXISTS idx_recordings_current ON recordings(current_recording);
CREATE INDEX IF NOT EXISTS idx_recordings_show ON recordings(show_id);
CREATE INDEX IF NOT EXISTS idx_show_airings_channel_series ON show_airings(channel, series_id);
CREATE INDEX IF NOT EXISTS idx_show_airings_start ON show_airings(start_at);

-- Trigger to update updated_at on recording_rules
CREATE TRIGGER IF NOT EXISTS recording_rules_updated_at
AFTER UPDATE ON recording_rules
BEGIN
    UPDATE recording_rules SET updated_at = strftime('%s', 'now') WHERE id = NEW.id;
END;

-- Trigger to update updated_at on recordings
CREATE TRIGGER IF NOT EXISTS recordings_updated_at
AFTER UPDATE ON recordings
BEGIN
    UPDATE recordings SET updated_at = strftime('%s', 'now') WHERE id = NEW.id;
END;
"#;
