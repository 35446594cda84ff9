/// Return the current UTC timestamp in ISO 8601 format.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Milliseconds since the Unix epoch, the unit coordinators expect in
/// registration timestamps.
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
