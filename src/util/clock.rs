use chrono::{DateTime, TimeZone, Utc};

/// milliseconds since the epoch, the representation of wall clock timestamps on the wire
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339()
}

pub fn format_millis(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(t) => format_timestamp(&t),
        None => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(0), "1970-01-01T00:00:00+00:00");
        assert_eq!(format_millis(1_500), "1970-01-01T00:00:01.500+00:00");
    }
}
