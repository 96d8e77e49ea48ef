//! Calendar date helpers for prompt stamping.

use chrono::{FixedOffset, NaiveDate, Utc};

/// Today's date at a fixed UTC offset. Out-of-range offsets fall back to UTC.
pub fn today(utc_offset_hours: i32) -> NaiveDate {
    let now = Utc::now();
    match FixedOffset::east_opt(utc_offset_hours.saturating_mul(3600)) {
        Some(offset) => now.with_timezone(&offset).date_naive(),
        None => now.date_naive(),
    }
}

/// `base` followed by a "Current date" line.
pub fn stamp(base: &str, date: NaiveDate) -> String {
    format!("{base}\nCurrent date: {}", date.format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_appends_iso_date() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        assert_eq!(stamp("Be brief.", date), "Be brief.\nCurrent date: 2025-03-14");
    }

    #[test]
    fn absurd_offset_falls_back_to_utc() {
        assert_eq!(today(10_000), Utc::now().date_naive());
    }
}
