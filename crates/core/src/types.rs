/// Entity identifiers are opaque strings (UUID v7 text when generated here).
pub type EntityId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a new time-ordered entity id.
pub fn new_id() -> EntityId {
    uuid::Uuid::now_v7().to_string()
}
