/// Server-assigned job identifier (12 hex chars).
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Mint a new job identifier.
///
/// Short enough to read in logs, long enough that collisions within a
/// process lifetime are not a practical concern.
pub fn new_job_id() -> JobId {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..12].to_string()
}
