//! Timestamp column encoding: INTEGER milliseconds since the Unix epoch.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Type;

use crate::error::StoreError;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn opt_to_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_millis)
}

fn decode(idx: usize, column: &'static str, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            Box::new(StoreError::Corrupt { column, value: ms }),
        )
    })
}

/// Read a NOT NULL timestamp column.
pub(crate) fn column(row: &Row<'_>, idx: usize, name: &'static str) -> rusqlite::Result<DateTime<Utc>> {
    decode(idx, name, row.get(idx)?)
}

/// Read a nullable timestamp column.
pub(crate) fn opt_column(
    row: &Row<'_>,
    idx: usize,
    name: &'static str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| decode(idx, name, ms))
        .transpose()
}
