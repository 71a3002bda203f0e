use chrono::{DateTime, Utc};

pub fn time_millis() -> i64 {
    let time: DateTime<chrono::Utc> = Utc::now();
    time.timestamp_millis()
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Seconds between two instants as a float, never negative.
pub fn elapsed_seconds(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> f64 {
    let millis = (end - start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}
