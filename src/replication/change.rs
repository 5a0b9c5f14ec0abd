//! Row-level change records and the value types they carry.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Position in a database's change log (a log sequence number).
///
/// Positions are assigned by the database in commit order and start at 1;
/// `0` means "before the first change".
pub type Position = u64;

/// One of the two databases taking part in a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The original database.
    Blue,
    /// The new target database.
    Green,
}

impl Side {
    /// The other side.
    pub fn peer(self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    /// Lowercase name used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<tandem_core::config::ConflictTieBreak> for Side {
    fn from(value: tandem_core::config::ConflictTieBreak) -> Self {
        match value {
            tandem_core::config::ConflictTieBreak::Blue => Self::Blue,
            tandem_core::config::ConflictTieBreak::Green => Self::Green,
        }
    }
}

/// Direction of a replication pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Changes committed on blue, applied to green.
    BlueToGreen,
    /// Changes committed on green, applied to blue.
    GreenToBlue,
}

impl Direction {
    /// Both directions, blue to green first.
    pub const BOTH: [Direction; 2] = [Direction::BlueToGreen, Direction::GreenToBlue];

    /// Side changes are captured from.
    pub fn source(self) -> Side {
        match self {
            Self::BlueToGreen => Side::Blue,
            Self::GreenToBlue => Side::Green,
        }
    }

    /// Side changes are applied to.
    pub fn target(self) -> Side {
        self.source().peer()
    }

    /// Direction whose source is `side`.
    pub fn from_source(side: Side) -> Self {
        match side {
            Side::Blue => Self::BlueToGreen,
            Side::Green => Self::GreenToBlue,
        }
    }

    /// Snake-case name used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlueToGreen => "blue_to_green",
            Self::GreenToBlue => "green_to_blue",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// Double precision float.
    Float(OrderedFloat<f64>),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "'{}'", s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(OrderedFloat(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Primary-key value(s) of a row, in key-column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimaryKey(pub Vec<Value>);

impl PrimaryKey {
    /// Single-column key.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// Composite key.
    pub fn composite(values: impl IntoIterator<Item = Value>) -> Self {
        Self(values.into_iter().collect())
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", v)?;
        }
        f.write_str(")")
    }
}

impl From<i64> for PrimaryKey {
    fn from(v: i64) -> Self {
        Self::single(v)
    }
}

impl From<i32> for PrimaryKey {
    fn from(v: i32) -> Self {
        Self::single(v)
    }
}

impl From<&str> for PrimaryKey {
    fn from(v: &str) -> Self {
        Self::single(v)
    }
}

/// Column values of a row keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// Build a [`Row`] from `(column, value)` pairs.
pub fn row<I, K, V>(columns: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    columns
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Kind of row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// A row was created.
    Insert,
    /// An existing row's columns changed.
    Update,
    /// A row was removed.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// When and where a row version was originally committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionStamp {
    /// Commit time on the origin database.
    pub committed_at: DateTime<Utc>,
    /// Database the write was originally committed on.
    pub origin: Side,
}

impl VersionStamp {
    /// Create a stamp.
    pub fn new(committed_at: DateTime<Utc>, origin: Side) -> Self {
        Self {
            committed_at,
            origin,
        }
    }
}

/// The current state of one key on one database.
///
/// Deleted keys keep a tombstone so that a late delete and a late update can
/// be ordered against each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowVersion {
    /// Column values, `None` for a tombstone.
    pub values: Option<Row>,
    /// Stamp of the write that produced this version.
    pub stamp: VersionStamp,
}

impl RowVersion {
    /// Whether the key is deleted.
    pub fn is_tombstone(&self) -> bool {
        self.values.is_none()
    }
}

/// A captured row-level change. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Table the change belongs to.
    pub table: String,
    /// Insert, update or delete.
    pub operation: Operation,
    /// Primary key of the changed row.
    pub key: PrimaryKey,
    /// Column values before the change (`None` if the row did not exist).
    pub before: Option<Row>,
    /// Column values after the change (`None` for deletes).
    pub after: Option<Row>,
    /// Position of the change in its source database's log.
    pub position: Position,
    /// Commit time and origin of the change.
    pub stamp: VersionStamp,
}

impl ChangeRecord {
    /// Commit time on the origin database.
    pub fn committed_at(&self) -> DateTime<Utc> {
        self.stamp.committed_at
    }

    /// Database the change was originally committed on.
    pub fn origin(&self) -> Side {
        self.stamp.origin
    }

    /// The row version this change produces.
    pub fn to_version(&self) -> RowVersion {
        RowVersion {
            values: self.after.clone(),
            stamp: self.stamp,
        }
    }
}

/// Replication progress for one (source database, table) pair: the last
/// source position whose change is durably applied to the opposite side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncPosition {
    /// Database the position refers to.
    pub source: Side,
    /// Table the position refers to.
    pub table: String,
    /// Last applied source position.
    pub position: Position,
}

impl SyncPosition {
    /// Create a position record.
    pub fn new(source: Side, table: impl Into<String>, position: Position) -> Self {
        Self {
            source,
            table: table.into(),
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::BlueToGreen.source(), Side::Blue);
        assert_eq!(Direction::BlueToGreen.target(), Side::Green);
        assert_eq!(Direction::GreenToBlue.source(), Side::Green);
        assert_eq!(Direction::from_source(Side::Green), Direction::GreenToBlue);
    }

    #[test]
    fn test_display() {
        assert_eq!(Direction::GreenToBlue.to_string(), "green_to_blue");
        assert_eq!(Side::Blue.to_string(), "blue");
        assert_eq!(PrimaryKey::single(1).to_string(), "(1)");
        let key = PrimaryKey::composite(vec![Value::Int(7), Value::from("eu")]);
        assert_eq!(key.to_string(), "(7, 'eu')");
        assert_eq!(Operation::Delete.to_string(), "delete");
    }

    #[test]
    fn test_key_ordering_is_total() {
        let mut keys = vec![
            PrimaryKey::single(3),
            PrimaryKey::single(1),
            PrimaryKey::single(2),
        ];
        keys.sort();
        assert_eq!(keys[0], PrimaryKey::single(1));
        assert_eq!(keys[2], PrimaryKey::single(3));
    }

    #[test]
    fn test_row_builder() {
        let r = row([("name", Value::from("ada")), ("age", Value::Int(36))]);
        assert_eq!(r.len(), 2);
        assert_eq!(r["name"], Value::Text("ada".into()));
    }

    #[test]
    fn test_tie_break_conversion() {
        assert_eq!(
            Side::from(tandem_core::config::ConflictTieBreak::Green),
            Side::Green
        );
    }
}
