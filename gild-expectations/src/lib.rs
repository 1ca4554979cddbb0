mod baseline;
mod dualwrite;
mod entry;
mod notifier;
mod sharding;
mod store;

pub use baseline::{BaselineError, fetch_baseline};
pub use dualwrite::DualWriteStore;
pub use entry::{ExpectationEntry, MASTER_PARTITION, TriageRange, changelist_partition, entry_id};
pub use notifier::{ChangeNotifier, DispatchMode};
pub use store::DocExpectationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gild_types::{Expectations, ExpectationId, Label, TriageDelta};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shards used to load and listen to the master partition.
pub const MASTER_PARTITION_SHARDS: usize = 16;
/// Shards used for changelist partitions, which hold far fewer entries.
pub const CL_PARTITION_SHARDS: usize = 2;

/// Deadline for a single document-store operation.
pub const MAX_OPERATION_TIME: Duration = Duration::from_secs(2 * 60);
/// Deadline for the full-partition scans garbage collection runs.
pub const GC_SCAN_TIME: Duration = Duration::from_secs(10 * 60);
/// Base sleep before a broken snapshot shard rebuilds itself; a random
/// 0–30s is added so a fleet-wide outage doesn't recover in lockstep.
pub const RECOVER_TIME: Duration = Duration::from_secs(30);

/// Entry+change pairs written per commit: each pair costs two writes and
/// one slot is reserved for stamping the record.
pub const WRITE_BATCH_PAIRS: usize = (docstore::MAX_DOCS_PER_TXN - 1) / 2;
/// Entries deleted per commit during garbage collection.
pub const GC_DELETE_BATCH: usize = 500;
/// Changes attached to one log entry when details are requested; anything
/// beyond this stays replayable by undo but is elided from the page.
pub const LOG_DETAILS_CAP: usize = 1000;

/// Sentinel total for [`ExpectationStore::query_log`]: there are more
/// records than the returned page and an exact count is too expensive.
pub const COUNT_MANY: usize = i32::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is in read-only mode")]
    ReadOnly,

    #[error("triage record {0} not found")]
    RecordNotFound(String),

    #[error("garbage collection cannot target untriaged entries")]
    UntriagedGcLabel,

    #[error("{0} is only supported on the master partition")]
    MasterOnly(&'static str),

    #[error("invalid triage delta for test {test:?}: {reason}")]
    InvalidDelta { test: String, reason: &'static str },

    #[error("document store error")]
    Doc(#[from] docstore::DocError),

    #[error("{op} timed out")]
    Timeout { op: &'static str },

    #[error("{op} failed after {attempts} attempts")]
    RetriesExhausted {
        op: &'static str,
        attempts: usize,
        #[source]
        last: Box<StoreError>,
    },

    #[error("couldn't join the relational mirror task")]
    Join(#[source] tokio::task::JoinError),

    #[error("couldn't get a relational database connection")]
    Pool(#[from] gild_db::PoolError),

    #[error("relational mirror error")]
    Mirror(#[source] gild_db::QueryError),
}

/// One page entry of the triage log.
#[derive(Debug, Clone, PartialEq)]
pub struct TriageLogEntry {
    pub id: String,
    pub user: String,
    pub ts: DateTime<Utc>,
    pub change_count: usize,
    /// Filled only when details were requested; capped at
    /// [`LOG_DETAILS_CAP`] deltas, sorted by (test, digest).
    pub details: Vec<TriageDelta>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriageHistoryEntry {
    pub user: String,
    pub ts: DateTime<Utc>,
}

/// The store every replica reads and (in `ReadWrite` mode) writes triage
/// decisions through. Implementations are bound to exactly one partition;
/// [`ExpectationStore::for_changelist`] derives a handle for a changelist's
/// overlay partition.
#[async_trait]
pub trait ExpectationStore: Send + Sync {
    /// Returns the current expectations. The returned value is shared and
    /// must be treated as immutable; use [`ExpectationStore::get_copy`] for
    /// something to mutate. O(1) in the steady state once snapshots run.
    async fn get(&self) -> Result<Arc<Expectations>, StoreError>;

    /// Returns a deep copy the caller owns outright.
    async fn get_copy(&self) -> Result<Expectations, StoreError>;

    /// Applies the given deltas as one triage record attributed to `user`.
    /// An empty delta list is a no-op and writes no record.
    async fn add_change(&self, deltas: &[TriageDelta], user: &str) -> Result<(), StoreError>;

    /// Returns one page of committed triage records, newest first, plus a
    /// total that is exact when it is smaller than `offset + size` and
    /// [`COUNT_MANY`] otherwise.
    async fn query_log(
        &self,
        offset: usize,
        size: usize,
        with_details: bool,
    ) -> Result<(Vec<TriageLogEntry>, usize), StoreError>;

    /// Reverts the record's changes by applying their prior labels as a
    /// fresh triage record, so the undo itself shows up in the log and can
    /// be undone again.
    async fn undo_change(&self, record_id: &str, user: &str) -> Result<(), StoreError>;

    /// Everyone who changed this pair's label, newest first.
    async fn get_triage_history(
        &self,
        test: &str,
        digest: &str,
    ) -> Result<Vec<TriageHistoryEntry>, StoreError>;

    /// A store bound to the changelist's overlay partition. Carries the
    /// mode and database handle forward; snapshots are not started for the
    /// derived store because changelist partitions are cheap to query
    /// fresh.
    fn for_changelist(&self, cl_id: &str, crs: &str) -> Box<dyn ExpectationStore>;
}

/// Capability of the master store to age out entries. Kept off
/// [`ExpectationStore`] so the handles [`ExpectationStore::for_changelist`]
/// hands out do not carry stubs.
#[async_trait]
pub trait GarbageCollector: Send + Sync {
    /// Freshens the `last_used` timestamp of the given entries. Only valid
    /// on the master partition.
    async fn update_last_used(
        &self,
        ids: &[ExpectationId],
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Flags entries for deletion: entries whose current label is `label`
    /// and which have neither been updated nor seen since `cutoff`.
    /// Returns how many entries were flagged. `label` must not be
    /// `Untriaged`.
    async fn mark_unused_entries_for_gc(
        &self,
        label: Label,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Deletes every flagged entry and returns how many were deleted.
    async fn garbage_collect(&self) -> Result<usize, StoreError>;
}
