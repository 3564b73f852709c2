//! Wall-clock task id generation.
//!
//! Ids are the UTC timestamp `YYYYMMDDhhmmss` plus the first four digits of
//! the microsecond, 18 characters total. The last issued id is remembered so
//! two calls inside the same tenth of a millisecond still produce distinct,
//! monotonically increasing ids.
use std::sync::Mutex;
use time::macros::format_description;
use time::OffsetDateTime;

static LAST_ISSUED: Mutex<Option<String>> = Mutex::new(None);

pub(crate) fn generate() -> String {
    generate_at(OffsetDateTime::now_utc())
}

fn generate_at(now: OffsetDateTime) -> String {
    let mut candidate = format_id(now);
    let mut last = LAST_ISSUED.lock().unwrap();
    if let Some(previous) = last.as_deref() {
        if candidate.as_str() <= previous {
            candidate = bump(previous);
        }
    }
    *last = Some(candidate.clone());
    candidate
}

fn format_id(now: OffsetDateTime) -> String {
    let format = format_description!("[year][month][day][hour][minute][second]");
    let seconds = now.format(&format).expect("UTC timestamp always formats");
    format!("{}{:04}", seconds, now.microsecond() / 100)
}

fn bump(id: &str) -> String {
    let n: u128 = id.parse().expect("task ids are all digits");
    format!("{:018}", n + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_id_shape() {
        let id = format_id(datetime!(2024-03-05 14:30:59.123456 UTC));
        assert_eq!(id, "202403051430591234");
        assert_eq!(id.len(), 18);
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let ids: Vec<String> = (0..64).map(|_| generate()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }
}
