//! Database row types. These map directly to SQLite rows and are distinct
//! from the clipshare-types models to keep the DB layer independent.
//! Timestamps are fixed-width RFC 3339 strings so text order is time order.

#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: i64,
    pub code: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

#[derive(Debug, Clone)]
pub struct ClipboardItemRow {
    pub id: i64,
    pub room_id: i64,
    pub ciphertext: Vec<u8>,
    pub timestamp: String,
}
