/// Client-supplied identifier of a generation request.
pub type RequestId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
