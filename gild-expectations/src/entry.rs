use chrono::{DateTime, Utc};
use docstore::{Doc, DocError};
use gild_types::{Digest, Grouping, Label};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partition holding the expectations of the primary branch.
pub const MASTER_PARTITION: &str = "master";

/// Partition holding a changelist's overlay expectations.
pub fn changelist_partition(crs: &str, cl_id: &str) -> String {
    format!("{crs}_{cl_id}")
}

// Collections live under a partition prefix so a store instance only ever
// sees its own partition's rows.
pub(crate) fn entries_collection(partition: &str) -> String {
    format!("expectations/{partition}/entries")
}

pub(crate) fn records_collection(partition: &str) -> String {
    format!("expectations/{partition}/triage_records")
}

pub(crate) fn changes_collection(partition: &str) -> String {
    format!("expectations/{partition}/triage_changes")
}

// Document field names the store filters and orders on.
pub(crate) const FIELD_DIGEST: &str = "digest";
pub(crate) const FIELD_UPDATED: &str = "updated_ms";
pub(crate) const FIELD_LAST_USED: &str = "last_used_ms";
pub(crate) const FIELD_NEEDS_GC: &str = "needs_gc";
pub(crate) const FIELD_COMMITTED: &str = "committed";
pub(crate) const FIELD_TS: &str = "ts_ms";
pub(crate) const FIELD_RECORD_ID: &str = "record_id";
pub(crate) const FIELD_TEST: &str = "test";

/// Deterministic document id for an entry. The document database forbids
/// `/` in ids, so it is swapped for `-`; `|` separates the test from the
/// digest, which cannot contain it.
pub fn entry_id(test: &str, digest: &str) -> String {
    format!("{}|{}", test.replace('/', "-"), digest)
}

/// An index interval over commits for which a label applies. The flat
/// model writes a single full range per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriageRange {
    pub first_commit_index: i64,
    pub last_commit_index: i64,
    pub label: Label,
}

impl TriageRange {
    /// The full-range bounds the flat model triages at.
    pub fn full(label: Label) -> Self {
        Self {
            first_commit_index: 0,
            last_commit_index: i64::MAX,
            label,
        }
    }
}

/// One triaged (or recently seen) pair as stored durably. `ranges[0]` is
/// the authoritative current label.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectationEntry {
    pub grouping: Grouping,
    pub digest: Digest,
    pub ranges: Vec<TriageRange>,
    /// When the label last changed.
    pub updated: DateTime<Utc>,
    /// When the pair was last seen in incoming data; the unix epoch for
    /// entries that predate the field.
    pub last_used: DateTime<Utc>,
    pub needs_gc: bool,
    pub partition: String,
}

impl ExpectationEntry {
    pub fn id(&self) -> String {
        entry_id(self.grouping.name(), &self.digest)
    }

    pub fn current_label(&self) -> Option<Label> {
        self.ranges.first().map(|r| r.label)
    }

    pub(crate) fn to_value(&self) -> Result<serde_json::Value, DocError> {
        let doc = EntryDoc {
            grouping: self.grouping.keys().clone(),
            digest: self.digest.clone(),
            ranges: self
                .ranges
                .iter()
                .map(|r| RangeDoc {
                    first_commit_index: r.first_commit_index,
                    last_commit_index: r.last_commit_index,
                    label: r.label.to_int(),
                })
                .collect(),
            updated_ms: self.updated.timestamp_millis(),
            last_used_ms: self.last_used.timestamp_millis(),
            needs_gc: self.needs_gc,
            partition: self.partition.clone(),
        };
        serde_json::to_value(doc).map_err(DocError::Encode)
    }

    pub(crate) fn from_doc(doc: &Doc) -> Result<Self, DocError> {
        let raw: EntryDoc = doc.decode()?;
        Ok(Self {
            grouping: Grouping::from_keys(raw.grouping),
            digest: raw.digest,
            ranges: raw
                .ranges
                .into_iter()
                .map(|r| TriageRange {
                    first_commit_index: r.first_commit_index,
                    last_commit_index: r.last_commit_index,
                    label: Label::from_int(r.label),
                })
                .collect(),
            updated: millis_to_datetime(raw.updated_ms),
            last_used: millis_to_datetime(raw.last_used_ms),
            needs_gc: raw.needs_gc,
            partition: raw.partition,
        })
    }
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryDoc {
    grouping: BTreeMap<String, String>,
    digest: String,
    ranges: Vec<RangeDoc>,
    updated_ms: i64,
    last_used_ms: i64,
    needs_gc: bool,
    partition: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RangeDoc {
    first_commit_index: i64,
    last_commit_index: i64,
    label: i64,
}

/// One triage action. Written uncommitted first; the `committed` flag is
/// flipped only after every entry and change row landed, and log readers
/// skip records where it never did.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RecordDoc {
    pub user: String,
    pub ts_ms: i64,
    pub changes: i64,
    pub committed: bool,
    pub partition: String,
}

/// One affected pair within a record, carrying enough to replay the undo.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ChangeDoc {
    pub record_id: String,
    pub test: String,
    pub grouping: BTreeMap<String, String>,
    pub digest: String,
    pub label_before: i64,
    pub label_after: i64,
    pub range_first: i64,
    pub range_last: i64,
}
