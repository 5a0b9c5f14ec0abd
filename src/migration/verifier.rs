//! Consistency verifier: fingerprints every row on both sides and merges the
//! two key-ordered fingerprint streams to find rows that differ.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::replication::{Database, DatabaseError, PrimaryKey, Row, Value};

/// SHA-256 of a row's canonical encoding.
pub type Fingerprint = [u8; 32];

/// Fingerprint of `key` and `values`.
///
/// Columns are hashed in name order, so two rows with equal contents always
/// produce the same fingerprint regardless of how they were built. Every
/// value is tagged and variable-length data is length-prefixed. Floats hash
/// by bit pattern after folding `-0.0` into `0.0` and every NaN into one
/// canonical NaN, matching how [`Value`] compares.
pub fn fingerprint(key: &PrimaryKey, values: &Row) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update((key.0.len() as u64).to_be_bytes());
    for value in &key.0 {
        hash_value(&mut hasher, value);
    }
    hasher.update((values.len() as u64).to_be_bytes());
    for (column, value) in values {
        hash_bytes(&mut hasher, column.as_bytes());
        hash_value(&mut hasher, value);
    }
    hasher.finalize().into()
}

fn hash_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn canonical_float_bits(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        Value::Int(i) => {
            hasher.update([2u8]);
            hasher.update(i.to_be_bytes());
        }
        Value::Float(f) => {
            hasher.update([3u8]);
            hasher.update(canonical_float_bits(f.into_inner()).to_be_bytes());
        }
        Value::Text(s) => {
            hasher.update([4u8]);
            hash_bytes(hasher, s.as_bytes());
        }
        Value::Bytes(b) => {
            hasher.update([5u8]);
            hash_bytes(hasher, b);
        }
    }
}

/// Where a mismatched key was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// Present on blue only.
    MissingInGreen,
    /// Present on green only.
    MissingInBlue,
    /// Present on both with different column values.
    Differing,
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingInGreen => write!(f, "missing_in_green"),
            Self::MissingInBlue => write!(f, "missing_in_blue"),
            Self::Differing => write!(f, "differing"),
        }
    }
}

/// One mismatched key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchSample {
    /// The key.
    pub key: PrimaryKey,
    /// What is wrong with it.
    pub kind: MismatchKind,
}

impl fmt::Display for MismatchSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key, self.kind)
    }
}

/// Result of comparing one table on both sides. Never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Table compared.
    pub table: String,
    /// Live rows on blue.
    pub blue_rows: u64,
    /// Live rows on green.
    pub green_rows: u64,
    /// Keys on blue but not green.
    pub missing_in_green: BTreeSet<PrimaryKey>,
    /// Keys on green but not blue.
    pub missing_in_blue: BTreeSet<PrimaryKey>,
    /// Keys on both with different column values.
    pub differing: BTreeSet<PrimaryKey>,
    /// When the comparison finished.
    pub checked_at: DateTime<Utc>,
}

impl ConsistencyReport {
    /// Whether both sides hold exactly the same rows.
    pub fn is_clean(&self) -> bool {
        self.mismatch_count() == 0
    }

    /// Total mismatched keys.
    pub fn mismatch_count(&self) -> u64 {
        (self.missing_in_green.len() + self.missing_in_blue.len() + self.differing.len()) as u64
    }

    /// Keys present on one side only.
    pub fn one_side_only(&self) -> BTreeSet<PrimaryKey> {
        self.missing_in_green
            .union(&self.missing_in_blue)
            .cloned()
            .collect()
    }

    /// Up to `limit` mismatched keys, differing keys first.
    pub fn sample(&self, limit: usize) -> Vec<MismatchSample> {
        let differing = self.differing.iter().map(|k| (k, MismatchKind::Differing));
        let green = self
            .missing_in_green
            .iter()
            .map(|k| (k, MismatchKind::MissingInGreen));
        let blue = self
            .missing_in_blue
            .iter()
            .map(|k| (k, MismatchKind::MissingInBlue));
        differing
            .chain(green)
            .chain(blue)
            .take(limit)
            .map(|(key, kind)| MismatchSample {
                key: key.clone(),
                kind,
            })
            .collect()
    }
}

/// Compares tables across the two databases.
#[derive(Debug, Clone)]
pub struct ConsistencyVerifier {
    page_size: usize,
    clock: SharedClock,
}

impl ConsistencyVerifier {
    /// Create a verifier reading `page_size` rows per ordered read.
    pub fn new(page_size: usize, clock: SharedClock) -> Self {
        Self {
            page_size: page_size.max(1),
            clock,
        }
    }

    /// Compare every table in `tables`.
    pub async fn verify<S: AsRef<str>>(
        &self,
        blue: &dyn Database,
        green: &dyn Database,
        tables: &[S],
    ) -> Result<BTreeMap<String, ConsistencyReport>, DatabaseError> {
        let mut reports = BTreeMap::new();
        for table in tables {
            let report = self.verify_table(blue, green, table.as_ref()).await?;
            reports.insert(report.table.clone(), report);
        }
        Ok(reports)
    }

    /// Compare one table.
    pub async fn verify_table(
        &self,
        blue: &dyn Database,
        green: &dyn Database,
        table: &str,
    ) -> Result<ConsistencyReport, DatabaseError> {
        let (blue_rows, green_rows) = tokio::join!(
            self.fingerprints(blue, table),
            self.fingerprints(green, table)
        );
        let (mut blue_rows, mut green_rows) = (blue_rows?, green_rows?);
        blue_rows.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        green_rows.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut report = ConsistencyReport {
            table: table.to_string(),
            blue_rows: blue_rows.len() as u64,
            green_rows: green_rows.len() as u64,
            missing_in_green: BTreeSet::new(),
            missing_in_blue: BTreeSet::new(),
            differing: BTreeSet::new(),
            checked_at: self.clock.now(),
        };

        let mut blue_iter = blue_rows.into_iter().peekable();
        let mut green_iter = green_rows.into_iter().peekable();
        loop {
            let order = match (blue_iter.peek(), green_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((b, _)), Some((g, _))) => b.cmp(g),
            };
            match order {
                Ordering::Less => {
                    if let Some((key, _)) = blue_iter.next() {
                        report.missing_in_green.insert(key);
                    }
                }
                Ordering::Greater => {
                    if let Some((key, _)) = green_iter.next() {
                        report.missing_in_blue.insert(key);
                    }
                }
                Ordering::Equal => {
                    if let (Some((key, b)), Some((_, g))) = (blue_iter.next(), green_iter.next()) {
                        if b != g {
                            report.differing.insert(key);
                        }
                    }
                }
            }
        }

        report.checked_at = self.clock.now();
        tandem_core::metrics::record_mismatches(table, report.mismatch_count());
        if report.is_clean() {
            debug!(table, rows = report.blue_rows, "table consistent");
        } else {
            info!(
                table,
                blue_rows = report.blue_rows,
                green_rows = report.green_rows,
                missing_in_green = report.missing_in_green.len(),
                missing_in_blue = report.missing_in_blue.len(),
                differing = report.differing.len(),
                "table mismatch"
            );
        }
        Ok(report)
    }

    async fn fingerprints(
        &self,
        db: &dyn Database,
        table: &str,
    ) -> Result<Vec<(PrimaryKey, Fingerprint)>, DatabaseError> {
        let mut out = Vec::new();
        let mut after: Option<PrimaryKey> = None;
        loop {
            let page = db.scan_versions(table, after.as_ref(), self.page_size).await?;
            let full = page.len() == self.page_size;
            after = page.last().map(|(k, _)| k.clone());
            out.extend(page.into_iter().filter_map(|(key, version)| {
                let values = version.values?;
                let fp = fingerprint(&key, &values);
                Some((key, fp))
            }));
            if !full || after.is_none() {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::replication::{row, MemoryDatabase, Side};
    use std::sync::Arc;

    fn pair() -> (MemoryDatabase, MemoryDatabase, ConsistencyVerifier) {
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        (
            MemoryDatabase::new(Side::Blue, clock.clone()),
            MemoryDatabase::new(Side::Green, clock.clone()),
            ConsistencyVerifier::new(2, clock),
        )
    }

    #[test]
    fn test_fingerprint_ignores_column_insertion_order() {
        let key = PrimaryKey::single(1);
        let mut a = Row::new();
        a.insert("name".into(), Value::from("ada"));
        a.insert("age".into(), Value::Int(36));
        let b = row([("age", Value::Int(36)), ("name", Value::from("ada"))]);
        assert_eq!(fingerprint(&key, &a), fingerprint(&key, &b));
        assert_ne!(
            fingerprint(&key, &a),
            fingerprint(&PrimaryKey::single(2), &a)
        );
    }

    #[test]
    fn test_fingerprint_separates_non_finite_floats() {
        let key = PrimaryKey::single(1);
        let nan = fingerprint(&key, &row([("x", f64::NAN)]));
        let inf = fingerprint(&key, &row([("x", f64::INFINITY)]));
        let neg_inf = fingerprint(&key, &row([("x", f64::NEG_INFINITY)]));
        let null = fingerprint(&key, &row([("x", Value::Null)]));
        assert_ne!(nan, inf);
        assert_ne!(nan, neg_inf);
        assert_ne!(inf, neg_inf);
        assert_ne!(nan, null);
        assert_eq!(nan, fingerprint(&key, &row([("x", -f64::NAN)])));
    }

    #[test]
    fn test_fingerprint_follows_value_equality_for_zero() {
        let key = PrimaryKey::single(1);
        assert_eq!(Value::from(0.0), Value::from(-0.0));
        assert_eq!(
            fingerprint(&key, &row([("x", 0.0)])),
            fingerprint(&key, &row([("x", -0.0)]))
        );
        assert_ne!(
            fingerprint(&key, &row([("x", 0.0)])),
            fingerprint(&key, &row([("x", 0i64)]))
        );
    }

    #[test]
    fn test_fingerprint_is_unambiguous_across_columns() {
        let key = PrimaryKey::single(1);
        let a = row([("ab", "c")]);
        let b = row([("a", "bc")]);
        assert_ne!(fingerprint(&key, &a), fingerprint(&key, &b));
        assert_ne!(
            fingerprint(&key, &row([("x", Value::Text("1".into()))])),
            fingerprint(&key, &row([("x", Value::Bytes(b"1".to_vec()))]))
        );
    }

    #[tokio::test]
    async fn test_nan_against_infinity_is_reported() {
        let (blue, green, verifier) = pair();
        blue.write_untracked("users", 1, Some(row([("score", f64::NAN)])));
        green.write_untracked("users", 1, Some(row([("score", f64::NEG_INFINITY)])));
        let report = verifier.verify_table(&blue, &green, "users").await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.sample(10)[0].kind, MismatchKind::Differing);
    }

    #[tokio::test]
    async fn test_identical_tables_are_clean() {
        let (blue, green, verifier) = pair();
        for i in 1..=5 {
            blue.write_untracked("users", i, Some(row([("n", i)])));
            green.write_untracked("users", i, Some(row([("n", i)])));
        }
        let reports = verifier.verify(&blue, &green, &["users"]).await.unwrap();
        let report = &reports["users"];
        assert!(report.is_clean());
        assert_eq!(report.blue_rows, 5);
        assert_eq!(report.green_rows, 5);
    }

    #[tokio::test]
    async fn test_classifies_mismatches() {
        let (blue, green, verifier) = pair();
        blue.write_untracked("users", 1, Some(row([("n", 1)])));
        green.write_untracked("users", 1, Some(row([("n", 1)])));
        blue.write_untracked("users", 2, Some(row([("email", "a@x")])));
        green.write_untracked("users", 2, Some(row([("email", "b@x")])));
        blue.write_untracked("users", 3, Some(row([("n", 3)])));
        green.write_untracked("users", 4, Some(row([("n", 4)])));
        green.write_untracked("users", 5, None);

        let report = verifier.verify_table(&blue, &green, "users").await.unwrap();
        assert_eq!(report.differing, BTreeSet::from([PrimaryKey::single(2)]));
        assert_eq!(report.missing_in_green, BTreeSet::from([PrimaryKey::single(3)]));
        assert_eq!(report.missing_in_blue, BTreeSet::from([PrimaryKey::single(4)]));
        assert!(!report.one_side_only().contains(&PrimaryKey::single(2)));
        assert_eq!(report.mismatch_count(), 3);
        assert_eq!(report.green_rows, 3);

        let sample = report.sample(2);
        assert_eq!(sample[0].kind, MismatchKind::Differing);
        assert_eq!(sample.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_side_fails_verification() {
        let (blue, green, verifier) = pair();
        green.set_available(false);
        assert!(verifier.verify(&blue, &green, &["users"]).await.is_err());
    }
}
