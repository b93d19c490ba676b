//! The `last_send` variable: the `collected` timestamp of the newest reading already
//! stored on the device. It is only ever written inside the same batch as the readings
//! it covers.

use crate::sink::{DeviceSink, SinkError, SinkVariable};
use crate::source::{ReadingValue, SourceRecord};
use serde_json::Value as JsonValue;
use std::fmt;

pub const CHECKPOINT_VARIABLE: &str = "last_send";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(i64);

impl Cursor {
    pub fn new(collected: i64) -> Self {
        Self(collected)
    }

    pub fn collected(self) -> i64 {
        self.0
    }

    /// Exclusive lower bound for the next fetch.
    pub fn fetch_after(self) -> i64 {
        self.0.saturating_add(1)
    }

    pub fn covers(self, record: &SourceRecord) -> bool {
        record.collected <= self.0
    }

    fn from_stored(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(whole_seconds)),
            JsonValue::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .map(Self::new)
    }
}

/// Whole-second floats inside the `i64` range; `as` would saturate anything larger.
fn whole_seconds(f: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0; // 2^63
    (f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f)).then_some(f as i64)
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `None` on a device that never received a checkpoint.
pub async fn read(sink: &dyn DeviceSink, token: &str) -> Result<Option<Cursor>, SinkError> {
    let Some(stored) = sink.last_value(token, CHECKPOINT_VARIABLE).await? else {
        return Ok(None);
    };
    Cursor::from_stored(&stored)
        .map(Some)
        .ok_or_else(|| SinkError::InvalidCheckpoint {
            value: stored.to_string(),
        })
}

/// Newest `collected` in the batch; `None` when nothing was fetched.
pub fn next(records: &[SourceRecord]) -> Option<Cursor> {
    records.iter().map(|r| r.collected).max().map(Cursor)
}

pub fn entry(cursor: Cursor) -> SinkVariable {
    SinkVariable {
        variable: CHECKPOINT_VARIABLE.to_string(),
        value: ReadingValue::from(cursor.collected()),
        time: None,
        series: None,
        unit: None,
    }
}

/// Drops readings the previous checkpoint already covers.
pub fn retain_unseen(
    records: Vec<SourceRecord>,
    previous: Option<Cursor>,
) -> (Vec<SourceRecord>, usize) {
    let Some(previous) = previous else {
        return (records, 0);
    };
    let before = records.len();
    let fresh: Vec<SourceRecord> = records
        .into_iter()
        .filter(|r| !previous.covers(r))
        .collect();
    let dropped = before - fresh.len();
    (fresh, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SensorKind;
    use serde_json::json;

    fn reading(collected: i64) -> SourceRecord {
        SourceRecord::new(SensorKind::Humidity, 50_i64, collected).expect("valid timestamp")
    }

    #[test]
    fn stored_values_decode_from_numbers_and_strings() {
        let expected = Some(Cursor(1_600_000_000));
        assert_eq!(Cursor::from_stored(&json!(1600000000)), expected);
        assert_eq!(Cursor::from_stored(&json!(1600000000.0)), expected);
        assert_eq!(Cursor::from_stored(&json!(" 1600000000 ")), expected);
        assert_eq!(Cursor::from_stored(&json!("yesterday")), None);
        assert_eq!(Cursor::from_stored(&json!(12.5)), None);
        assert_eq!(Cursor::from_stored(&json!(null)), None);
    }

    #[test]
    fn out_of_range_floats_are_rejected() {
        assert_eq!(Cursor::from_stored(&json!(1e300)), None);
        assert_eq!(Cursor::from_stored(&json!(-1e19)), None);
        assert_eq!(Cursor::from_stored(&json!(9.3e18)), None);
        assert_eq!(Cursor::from_stored(&json!(1e18)), Some(Cursor(1_000_000_000_000_000_000)));
    }

    #[test]
    fn next_takes_the_newest_reading_regardless_of_order() {
        assert_eq!(next(&[]), None);
        let newest_first = [reading(30), reading(20), reading(10)];
        let oldest_first = [reading(10), reading(20), reading(30)];
        assert_eq!(next(&newest_first), Some(Cursor(30)));
        assert_eq!(next(&oldest_first), Some(Cursor(30)));
    }

    #[test]
    fn fetch_after_is_exclusive() {
        assert_eq!(Cursor(41).fetch_after(), 42);
        assert_eq!(Cursor(i64::MAX).fetch_after(), i64::MAX);
    }

    #[test]
    fn retain_unseen_drops_covered_readings() {
        let (fresh, dropped) =
            retain_unseen(vec![reading(9), reading(10), reading(11)], Some(Cursor(10)));
        assert_eq!(dropped, 2);
        assert_eq!(fresh, vec![reading(11)]);

        let (fresh, dropped) = retain_unseen(vec![reading(1)], None);
        assert_eq!((fresh.len(), dropped), (1, 0));
    }

    #[test]
    fn entry_carries_only_the_cursor_value() {
        let wire = serde_json::to_value(entry(Cursor(77))).unwrap();
        assert_eq!(wire, json!({"variable": "last_send", "value": 77}));
    }
}
