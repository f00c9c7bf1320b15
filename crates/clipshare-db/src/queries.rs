use crate::Database;
use crate::models::{ClipboardItemRow, RoomRow};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

impl Database {
    // -- Rooms --

    /// Allocate a room row, derive its code from the new id, and write the
    /// code back, all in one transaction.
    ///
    /// If `code_for` fails, the row is rolled back and the caller's error is
    /// returned in the inner `Result`. The outer `Result` carries I/O errors.
    pub fn create_room<F, E>(
        &self,
        created_at: &str,
        expires_at: &str,
        code_for: F,
    ) -> Result<std::result::Result<RoomRow, E>>
    where
        F: FnOnce(i64) -> std::result::Result<String, E>,
    {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO rooms (created_at, expires_at) VALUES (?1, ?2)",
                (created_at, expires_at),
            )?;
            let id = tx.last_insert_rowid();

            let code = match code_for(id) {
                Ok(code) => code,
                Err(e) => return Ok(Err(e)),
            };

            tx.execute("UPDATE rooms SET code = ?1 WHERE id = ?2", rusqlite::params![code, id])?;
            tx.commit()?;

            Ok(Ok(RoomRow {
                id,
                code: Some(code),
                created_at: created_at.to_string(),
                expires_at: expires_at.to_string(),
            }))
        })
    }

    pub fn get_room(&self, id: i64) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room(conn, id))
    }

    // -- Clipboard items --

    pub fn insert_item(&self, room_id: i64, ciphertext: &[u8], timestamp: &str) -> Result<ClipboardItemRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO clipboard_items (room_id, ciphertext, timestamp) VALUES (?1, ?2, ?3)",
                rusqlite::params![room_id, ciphertext, timestamp],
            )?;
            Ok(ClipboardItemRow {
                id: conn.last_insert_rowid(),
                room_id,
                ciphertext: ciphertext.to_vec(),
                timestamp: timestamp.to_string(),
            })
        })
    }

    /// All items of a room, oldest first. Ties on timestamp fall back to insertion order.
    pub fn get_items(&self, room_id: i64) -> Result<Vec<ClipboardItemRow>> {
        self.with_conn(|conn| query_items(conn, room_id))
    }
}

fn query_room(conn: &Connection, id: i64) -> Result<Option<RoomRow>> {
    let mut stmt = conn.prepare("SELECT id, code, created_at, expires_at FROM rooms WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(RoomRow {
                id: row.get(0)?,
                code: row.get(1)?,
                created_at: row.get(2)?,
                expires_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_items(conn: &Connection, room_id: i64) -> Result<Vec<ClipboardItemRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, room_id, ciphertext, timestamp
         FROM clipboard_items
         WHERE room_id = ?1
         ORDER BY timestamp ASC, id ASC",
    )?;

    let rows = stmt
        .query_map([room_id], |row| {
            Ok(ClipboardItemRow {
                id: row.get(0)?,
                room_id: row.get(1)?,
                ciphertext: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: &str = "2026-01-01T00:00:00.000000Z";
    const T1: &str = "2026-01-01T00:00:01.000000Z";
    const LATER: &str = "2026-01-08T00:00:00.000000Z";

    fn room(db: &Database) -> RoomRow {
        db.create_room(T0, LATER, |id| Ok::<_, ()>(format!("R{}", id)))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn create_room_assigns_code() {
        let db = Database::open_in_memory().unwrap();
        let created = room(&db);
        assert_eq!(created.id, 1);

        let fetched = db.get_room(created.id).unwrap().unwrap();
        assert_eq!(fetched.code.as_deref(), Some("R1"));
        assert_eq!(fetched.expires_at, LATER);
    }

    #[test]
    fn failed_code_derivation_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result = db.create_room(T0, LATER, |_| Err::<String, _>("too long")).unwrap();
        assert_eq!(result.unwrap_err(), "too long");

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM rooms", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn duplicate_codes_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.create_room(T0, LATER, |_| Ok::<_, ()>("SAME".to_string())).unwrap().unwrap();
        assert!(db.create_room(T0, LATER, |_| Ok::<_, ()>("SAME".to_string())).is_err());
    }

    #[test]
    fn items_ordered_by_timestamp_then_id() {
        let db = Database::open_in_memory().unwrap();
        let room = room(&db);

        db.insert_item(room.id, b"second", T1).unwrap();
        db.insert_item(room.id, b"first", T0).unwrap();
        db.insert_item(room.id, b"third", T1).unwrap();

        let items: Vec<Vec<u8>> = db.get_items(room.id).unwrap().into_iter().map(|i| i.ciphertext).collect();
        assert_eq!(items, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
    }

    #[test]
    fn item_requires_existing_room() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.insert_item(99, b"orphan", T0).is_err());
    }

    #[test]
    fn deleting_room_cascades_to_items() {
        let db = Database::open_in_memory().unwrap();
        let room = room(&db);
        db.insert_item(room.id, b"x", T0).unwrap();

        db.with_conn(|conn| {
            conn.execute("DELETE FROM rooms WHERE id = ?1", [room.id])?;
            Ok(())
        })
        .unwrap();

        assert!(db.get_items(room.id).unwrap().is_empty());
        assert!(db.get_room(room.id).unwrap().is_none());
    }
}
