use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (rooms + clipboard items)");
        // `code` stays NULL between the insert that allocates the id and the
        // update that writes the derived code, so it cannot be NOT NULL.
        conn.execute_batch(
            "
            CREATE TABLE rooms (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                code        TEXT UNIQUE CHECK (length(code) <= 5),
                created_at  TEXT NOT NULL,
                expires_at  TEXT NOT NULL
            );

            CREATE TABLE clipboard_items (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id     INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                ciphertext  BLOB NOT NULL,
                timestamp   TEXT NOT NULL
            );

            CREATE INDEX idx_clipboard_items_room
                ON clipboard_items(room_id, timestamp);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
