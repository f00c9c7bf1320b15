//! Room and history persistence on top of `clipshare-db`.
//!
//! Room codes come from [`RoomCodec`]; payloads are sealed with [`Cipher`]
//! before they reach SQLite and opened again on the way out.

use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use clipshare_codec::RoomCodec;
use clipshare_crypto::Cipher;
use clipshare_db::Database;
use clipshare_db::models::{ClipboardItemRow, RoomRow};
use clipshare_types::models::{ClipboardItem, ROOM_CODE_LEN, Room};

/// Rooms live for a week unless configured otherwise.
pub const DEFAULT_ROOM_TTL_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The salt/alphabet/id-range combination cannot produce valid codes.
    #[error("configuration error: {0}")]
    ConfigurationFatal(String),
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

pub struct RoomStore {
    db: Database,
    codec: RoomCodec,
    cipher: Cipher,
    room_ttl: Duration,
    /// Last timestamp handed to an item; keeps item timestamps strictly increasing.
    last_timestamp: Mutex<DateTime<Utc>>,
}

impl RoomStore {
    pub fn new(db: Database, codec: RoomCodec, cipher: Cipher) -> Self {
        Self {
            db,
            codec,
            cipher,
            room_ttl: Duration::days(DEFAULT_ROOM_TTL_DAYS),
            last_timestamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn with_room_ttl(mut self, ttl: Duration) -> Self {
        self.room_ttl = ttl;
        self
    }

    /// Allocate a room and its code. Over-length codes are fatal: the row is
    /// rolled back and nothing is truncated.
    pub fn create_room(&self) -> Result<Room, StoreError> {
        let created_at = Utc::now();
        let expires_at = created_at + self.room_ttl;

        let row = self.db.create_room(
            &format_timestamp(created_at),
            &format_timestamp(expires_at),
            |id| {
                let code = self.codec.encode(id as u64);
                if code.len() > ROOM_CODE_LEN {
                    error!("Room id {} encodes to over-length code {:?}", id, code);
                    return Err(StoreError::ConfigurationFatal(format!(
                        "generated code exceeds {} characters: {}",
                        ROOM_CODE_LEN, code
                    )));
                }
                Ok(code)
            },
        )??;

        let room = room_from_row(row)?;
        info!("Created room {} (id {})", room.code, room.id);
        Ok(room)
    }

    /// Look up a live room. Malformed codes, unknown ids and expired rooms
    /// all yield `None`.
    pub fn get_room_by_code(&self, code: &str) -> Result<Option<Room>, StoreError> {
        let id = match self.codec.decode(code) {
            Ok(id) => id,
            Err(_) => {
                debug!("Rejected undecodable room code {:?}", code);
                return Ok(None);
            }
        };

        let Ok(id) = i64::try_from(id) else {
            return Ok(None);
        };

        let Some(row) = self.db.get_room(id)? else {
            return Ok(None);
        };

        let room = room_from_row(row)?;
        if room.code != code || room.is_expired_at(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(room))
    }

    /// Seal and persist one payload.
    pub fn append_item(&self, room_id: u64, plaintext: &str) -> Result<ClipboardItem, StoreError> {
        let envelope = self.cipher.seal(plaintext.as_bytes());
        let timestamp = self.next_timestamp()?;

        let row = self
            .db
            .insert_item(room_id as i64, &envelope, &format_timestamp(timestamp))?;
        item_from_row(row)
    }

    /// Decrypted history, oldest first. Items that fail to open are logged
    /// and skipped so one corrupt row does not hide the rest.
    pub fn get_history(&self, room_id: u64) -> Result<Vec<String>, StoreError> {
        let rows = self.db.get_items(room_id as i64)?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let plaintext = match self.cipher.open(&row.ciphertext) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping item {} in room {}: {}", row.id, room_id, e);
                    continue;
                }
            };
            match String::from_utf8(plaintext) {
                Ok(text) => history.push(text),
                Err(_) => warn!("Skipping item {} in room {}: not UTF-8", row.id, room_id),
            }
        }
        Ok(history)
    }

    fn next_timestamp(&self) -> Result<DateTime<Utc>, StoreError> {
        let mut last = self
            .last_timestamp
            .lock()
            .map_err(|e| anyhow::anyhow!("timestamp lock poisoned: {}", e))?;
        // Stored with microsecond precision, so compare at that precision too.
        let now = Utc::now().trunc_subsecs(6);
        let next = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        Ok(next)
    }
}

/// Fixed-width so that text order in SQLite is chronological.
fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn room_from_row(row: RoomRow) -> Result<Room, StoreError> {
    let code = row
        .code
        .ok_or_else(|| anyhow::anyhow!("Room {} has no code", row.id))?;
    Ok(Room {
        id: row.id as u64,
        code,
        created_at: parse_timestamp(&row.created_at)?,
        expires_at: parse_timestamp(&row.expires_at)?,
    })
}

fn item_from_row(row: ClipboardItemRow) -> Result<ClipboardItem, StoreError> {
    Ok(ClipboardItem {
        id: row.id as u64,
        room_id: row.room_id as u64,
        ciphertext: row.ciphertext,
        timestamp: parse_timestamp(&row.timestamp)?,
    })
}
