use crate::entry::{
    ChangeDoc, ExpectationEntry, FIELD_COMMITTED, FIELD_DIGEST, FIELD_LAST_USED, FIELD_NEEDS_GC, FIELD_RECORD_ID,
    FIELD_TEST, FIELD_TS, FIELD_UPDATED, MASTER_PARTITION, RecordDoc, TriageRange, changelist_partition,
    changes_collection, entries_collection, entry_id, millis_to_datetime, records_collection,
};
use crate::notifier::{ChangeNotifier, DispatchMode};
use crate::sharding::shard_bounds;
use crate::{
    AccessMode, CL_PARTITION_SHARDS, COUNT_MANY, ExpectationStore, GC_DELETE_BATCH, GC_SCAN_TIME, GarbageCollector,
    LOG_DETAILS_CAP, MASTER_PARTITION_SHARDS, MAX_OPERATION_TIME, RECOVER_TIME, StoreError, TriageHistoryEntry,
    TriageLogEntry, WRITE_BATCH_PAIRS,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docstore::{Direction, Doc, DocError, DocumentDb, FilterOp, Query, Write};
use futures::future::try_join_all;
use gild_types::{Expectations, ExpectationId, Grouping, Label, TriageDelta, is_valid_digest};
use hashbrown::HashMap;
use itertools::Itertools;
use log::{debug, info, warn};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const READ_ATTEMPTS: usize = 3;
const WRITE_ATTEMPTS: usize = 5;
const COMMIT_FLIP_ATTEMPTS: usize = 10;

/// Expectation store backed by the document database, bound to one
/// partition. Long-lived servers call [`DocExpectationStore::initialize`]
/// once so per-shard snapshot listeners keep the in-RAM entry cache warm;
/// short-lived workers skip it and every read falls back to a sharded
/// fan-out query.
pub struct DocExpectationStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<dyn DocumentDb>,
    mode: AccessMode,
    partition: String,
    shards: usize,
    /// Every entry of this partition, keyed by entry id. Listeners take
    /// the write lock to apply snapshots; assembly takes the read lock.
    entries: RwLock<HashMap<String, ExpectationEntry>>,
    /// Memoized result of the last assembly. Guarded separately from
    /// `entries` to avoid lock inversion: take `entries`, release, then
    /// this.
    return_cache: Mutex<Option<Arc<Expectations>>>,
    snapshots_running: AtomicBool,
    notifier: ChangeNotifier,
    cancel: CancellationToken,
}

impl DocExpectationStore {
    /// A store bound to the master partition. `cancel` stops the snapshot
    /// listeners [`DocExpectationStore::initialize`] starts.
    pub fn new(
        db: Arc<dyn DocumentDb>,
        mode: AccessMode,
        dispatch: DispatchMode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                mode,
                partition: MASTER_PARTITION.to_owned(),
                shards: MASTER_PARTITION_SHARDS,
                entries: RwLock::new(HashMap::new()),
                return_cache: Mutex::new(None),
                snapshots_running: AtomicBool::new(false),
                notifier: ChangeNotifier::new(dispatch),
                cancel,
            }),
        }
    }

    /// The concrete-typed version of
    /// [`ExpectationStore::for_changelist`]. Shares the database handle,
    /// carries the mode forward, and never runs snapshots.
    pub fn for_changelist_store(&self, cl_id: &str, crs: &str, dispatch: DispatchMode) -> DocExpectationStore {
        DocExpectationStore {
            inner: Arc::new(Inner {
                db: self.inner.db.clone(),
                mode: self.inner.mode,
                partition: changelist_partition(crs, cl_id),
                shards: CL_PARTITION_SHARDS,
                entries: RwLock::new(HashMap::new()),
                return_cache: Mutex::new(None),
                snapshots_running: AtomicBool::new(false),
                notifier: ChangeNotifier::new(dispatch),
                cancel: self.inner.cancel.child_token(),
            }),
        }
    }

    pub fn partition(&self) -> &str {
        &self.inner.partition
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    /// Loads every shard's current contents into the entry cache and
    /// starts one listener task per shard to keep it warm. Must be called
    /// exactly once, before serving, by any process that stays up.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let mut listeners = Vec::with_capacity(self.inner.shards);
        for (shard, bounds) in shard_bounds(self.inner.shards).into_iter().enumerate() {
            let query = self.inner.shard_query(&bounds);
            let mut stream = self.inner.db.watch(query.clone());
            let first = tokio::time::timeout(MAX_OPERATION_TIME, stream.next())
                .await
                .map_err(|_| StoreError::Timeout {
                    op: "initial shard snapshot",
                })?
                .ok_or(StoreError::Doc(DocError::WatchInterrupted))??;
            debug!(
                "Shard {shard} of partition {} loaded {} entries",
                self.inner.partition,
                first.len()
            );
            self.inner.apply_docs(first);
            listeners.push((shard, query, stream));
        }

        self.inner.snapshots_running.store(true, Ordering::SeqCst);
        self.inner.invalidate_return_cache();
        info!(
            "Expectation snapshots running for partition {} across {} shards",
            self.inner.partition, self.inner.shards
        );

        for (shard, query, stream) in listeners {
            tokio::spawn(shard_listener(self.inner.clone(), shard, query, stream));
        }
        Ok(())
    }

    fn require_writable(&self) -> Result<(), StoreError> {
        match self.inner.mode {
            AccessMode::ReadWrite => Ok(()),
            AccessMode::ReadOnly => Err(StoreError::ReadOnly),
        }
    }
}

impl Inner {
    fn entries_collection(&self) -> String {
        entries_collection(&self.partition)
    }

    fn records_collection(&self) -> String {
        records_collection(&self.partition)
    }

    fn changes_collection(&self) -> String {
        changes_collection(&self.partition)
    }

    fn shard_query(&self, bounds: &(Option<String>, Option<String>)) -> Query {
        let mut query = Query::collection(self.entries_collection());
        if let Some(lo) = &bounds.0 {
            query = query.filter(FIELD_DIGEST, FilterOp::Ge, lo.clone());
        }
        if let Some(hi) = &bounds.1 {
            query = query.filter(FIELD_DIGEST, FilterOp::Lt, hi.clone());
        }
        query
    }

    fn snapshots_running(&self) -> bool {
        self.snapshots_running.load(Ordering::SeqCst)
    }

    fn invalidate_return_cache(&self) {
        *self.return_cache.lock().expect("return cache lock poisoned") = None;
    }

    /// Merges delivered documents into the entry cache under one write
    /// lock and returns the ids whose label state actually changed
    /// (i.e. whose `updated` stamp differs from the cached one).
    fn apply_docs(&self, docs: Vec<Doc>) -> Vec<ExpectationId> {
        let mut changed = Vec::new();
        let mut entries = self.entries.write().expect("entry cache lock poisoned");
        for doc in docs {
            let entry = match ExpectationEntry::from_doc(&doc) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping corrupt expectation document {}: {e}", doc.id);
                    continue;
                }
            };
            let material = entries
                .get(&doc.id)
                .is_none_or(|existing| existing.updated != entry.updated);
            if material {
                changed.push(ExpectationId::new(entry.grouping.name(), entry.digest.clone()));
            }
            entries.insert(doc.id, entry);
        }
        changed
    }

    /// Builds fresh expectations from the entry cache under the read lock.
    fn assemble(&self) -> Expectations {
        let entries = self.entries.read().expect("entry cache lock poisoned");
        let expectations = Expectations::new();
        for entry in entries.values() {
            match entry.current_label() {
                Some(label) => expectations.set(entry.grouping.name(), &entry.digest, label),
                None => warn!(
                    "Expectation entry {} has no ranges; skipping it during assembly",
                    entry.id()
                ),
            }
        }
        expectations
    }

    /// The fallback read path used when snapshots are not running:
    /// re-fetches the whole partition with one query per shard, in
    /// parallel, and replaces the entry cache with the result.
    async fn refresh_from_store(&self) -> Result<(), StoreError> {
        let queries = shard_bounds(self.shards)
            .iter()
            .map(|bounds| self.shard_query(bounds))
            .collect_vec();
        let fetches = queries
            .iter()
            .map(|query| with_retries(READ_ATTEMPTS, MAX_OPERATION_TIME, "sharded expectation query", move || self.db.run_query(query)));
        let shard_results = try_join_all(fetches).await?;

        let mut fresh = HashMap::new();
        for doc in shard_results.into_iter().flatten() {
            match ExpectationEntry::from_doc(&doc) {
                Ok(entry) => {
                    fresh.insert(doc.id, entry);
                }
                Err(e) => warn!("Skipping corrupt expectation document {}: {e}", doc.id),
            }
        }
        *self.entries.write().expect("entry cache lock poisoned") = fresh;
        self.invalidate_return_cache();
        Ok(())
    }

    async fn shared_expectations(&self) -> Result<Arc<Expectations>, StoreError> {
        if !self.snapshots_running() {
            self.refresh_from_store().await?;
        }
        if let Some(cached) = self
            .return_cache
            .lock()
            .expect("return cache lock poisoned")
            .clone()
        {
            return Ok(cached);
        }
        let assembled = Arc::new(self.assemble());
        *self.return_cache.lock().expect("return cache lock poisoned") = Some(assembled.clone());
        Ok(assembled)
    }
}

/// One shard's long-lived listener: applies each delivered change set,
/// invalidates the memoized expectations when anything material arrived,
/// then fires notifications outside the cache lock. A broken stream is
/// rebuilt from scratch after a randomized back-off; the next delivery of
/// the rebuilt stream is that shard's full contents, which the merge
/// handles like any other batch.
async fn shard_listener(inner: Arc<Inner>, shard: usize, query: Query, mut stream: docstore::SnapshotStream) {
    loop {
        let item = tokio::select! {
            _ = inner.cancel.cancelled() => {
                debug!("Shard {shard} listener for partition {} shutting down", inner.partition);
                return;
            }
            item = stream.next() => item,
        };

        match item {
            Some(Ok(docs)) => {
                let changed = inner.apply_docs(docs);
                if changed.is_empty() {
                    continue;
                }
                // Invalidate before notifying so a callback that reads
                // expectations sees at least the state that triggered it.
                inner.invalidate_return_cache();
                for id in changed {
                    inner.notifier.notify(id);
                }
            }
            broken => {
                if let Some(Err(e)) = broken {
                    warn!(
                        "Snapshot stream for shard {shard} of partition {} broke: {e}; rebuilding",
                        inner.partition
                    );
                } else {
                    warn!(
                        "Snapshot stream for shard {shard} of partition {} ended; rebuilding",
                        inner.partition
                    );
                }
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..RECOVER_TIME.as_millis() as u64));
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        debug!("Shard {shard} listener for partition {} shutting down", inner.partition);
                        return;
                    }
                    _ = tokio::time::sleep(RECOVER_TIME + jitter) => {}
                }
                stream = inner.db.watch(query.clone());
            }
        }
    }
}

/// Runs `f` up to `attempts` times, each attempt under `deadline`.
async fn with_retries<T, Fut>(
    attempts: usize,
    deadline: Duration,
    op: &'static str,
    mut f: impl FnMut() -> Fut,
) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, DocError>>,
{
    let mut last = None;
    for attempt in 1..=attempts {
        match tokio::time::timeout(deadline, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                warn!("{op} failed (attempt {attempt} of {attempts}): {e}");
                last = Some(StoreError::Doc(e));
            }
            Err(_) => {
                warn!("{op} timed out (attempt {attempt} of {attempts})");
                last = Some(StoreError::Timeout { op });
            }
        }
    }
    Err(StoreError::RetriesExhausted {
        op,
        attempts,
        last: Box::new(last.expect("at least one attempt ran")),
    })
}

#[async_trait]
impl ExpectationStore for DocExpectationStore {
    async fn get(&self) -> Result<Arc<Expectations>, StoreError> {
        self.inner.shared_expectations().await
    }

    async fn get_copy(&self) -> Result<Expectations, StoreError> {
        Ok(self.inner.shared_expectations().await?.deep_copy())
    }

    async fn add_change(&self, deltas: &[TriageDelta], user: &str) -> Result<(), StoreError> {
        self.require_writable()?;
        if deltas.is_empty() {
            return Ok(());
        }
        for delta in deltas {
            if delta.grouping.name().is_empty() {
                return Err(StoreError::InvalidDelta {
                    test: delta.grouping.name().to_owned(),
                    reason: "grouping has no name key",
                });
            }
            if !is_valid_digest(&delta.digest) {
                return Err(StoreError::InvalidDelta {
                    test: delta.grouping.name().to_owned(),
                    reason: "digest is not 32 lowercase hex characters",
                });
            }
        }

        // The entry cache supplies the prior labels; without snapshots it
        // must be brought up to date first.
        if !self.inner.snapshots_running() {
            self.inner.refresh_from_store().await?;
        }

        let now = Utc::now();
        let record_id = Uuid::new_v4().to_string();
        let mut new_entries = Vec::with_capacity(deltas.len());
        let mut changes = Vec::with_capacity(deltas.len());
        {
            let entries = self.inner.entries.read().expect("entry cache lock poisoned");
            for delta in deltas {
                let id = entry_id(delta.grouping.name(), &delta.digest);
                let existing = entries.get(&id);
                let mut ranges = existing.map(|e| e.ranges.clone()).unwrap_or_default();
                let label_before = ranges.first().map(|r| r.label).unwrap_or_default();

                let new_range = TriageRange::full(delta.label);
                match ranges.iter_mut().find(|r| {
                    r.first_commit_index == new_range.first_commit_index
                        && r.last_commit_index == new_range.last_commit_index
                }) {
                    Some(range) => *range = new_range,
                    None => ranges.push(new_range),
                }
                ranges.sort_by_key(|r| r.first_commit_index);

                new_entries.push(ExpectationEntry {
                    grouping: delta.grouping.clone(),
                    digest: delta.digest.clone(),
                    ranges,
                    updated: now,
                    last_used: now,
                    needs_gc: false,
                    partition: self.inner.partition.clone(),
                });
                changes.push(ChangeDoc {
                    record_id: record_id.clone(),
                    test: delta.grouping.name().to_owned(),
                    grouping: delta.grouping.keys().clone(),
                    digest: delta.digest.clone(),
                    label_before: label_before.to_int(),
                    label_after: delta.label.to_int(),
                    range_first: new_range.first_commit_index,
                    range_last: new_range.last_commit_index,
                });
            }
        }

        // Phase one: the record, uncommitted. Log readers skip it until
        // the flip below; the entries themselves become visible as they
        // land, which is accepted; the triage intent was captured.
        let record = RecordDoc {
            user: user.to_owned(),
            ts_ms: now.timestamp_millis(),
            changes: deltas.len() as i64,
            committed: false,
            partition: self.inner.partition.clone(),
        };
        let record_write = Write::set(self.inner.records_collection(), record_id.as_str(), &record)?;
        with_retries(WRITE_ATTEMPTS, MAX_OPERATION_TIME, "triage record write", || {
            self.inner.db.commit(vec![record_write.clone()])
        })
        .await?;

        // Entries and change rows, one pair per batch slot.
        {
            let pairs = new_entries.iter().zip(&changes).collect_vec();
            for batch in pairs.chunks(WRITE_BATCH_PAIRS) {
                let mut writes = Vec::with_capacity(WRITE_BATCH_PAIRS * 2);
                for (entry, change) in batch {
                    writes.push(Write::Set {
                        collection: self.inner.entries_collection(),
                        id: entry.id(),
                        data: entry.to_value()?,
                    });
                    writes.push(Write::set(
                        self.inner.changes_collection(),
                        Uuid::new_v4().to_string(),
                        change,
                    )?);
                }
                with_retries(WRITE_ATTEMPTS, MAX_OPERATION_TIME, "triage batch write", || {
                    self.inner.db.commit(writes.clone())
                })
                .await?;
            }
        }

        // Phase two: the commit flip, after which the record is visible in
        // the log.
        let flip = Write::Merge {
            collection: self.inner.records_collection(),
            id: record_id.clone(),
            fields: serde_json::json!({ FIELD_COMMITTED: true }),
        };
        with_retries(COMMIT_FLIP_ATTEMPTS, MAX_OPERATION_TIME, "triage record commit flip", || {
            self.inner.db.commit(vec![flip.clone()])
        })
        .await?;

        if self.inner.snapshots_running() {
            // The snapshot listeners will fold these writes into the cache
            // and fire notifications; updating here too would race them.
            return Ok(());
        }
        {
            let mut entries = self.inner.entries.write().expect("entry cache lock poisoned");
            for entry in new_entries {
                entries.insert(entry.id(), entry);
            }
        }
        self.inner.invalidate_return_cache();
        Ok(())
    }

    async fn query_log(
        &self,
        offset: usize,
        size: usize,
        with_details: bool,
    ) -> Result<(Vec<TriageLogEntry>, usize), StoreError> {
        let query = Query::collection(self.inner.records_collection())
            .filter(FIELD_COMMITTED, FilterOp::Eq, true)
            .order_by(FIELD_TS, Direction::Desc)
            .offset(offset)
            .limit(size);
        let docs = with_retries(READ_ATTEMPTS, MAX_OPERATION_TIME, "triage log query", || {
            self.inner.db.run_query(&query)
        })
        .await?;

        let total = if docs.len() == size && size > 0 {
            COUNT_MANY
        } else {
            offset + docs.len()
        };

        let mut entries = Vec::with_capacity(docs.len());
        for doc in docs {
            let record: RecordDoc = doc.decode()?;
            entries.push(TriageLogEntry {
                id: doc.id,
                user: record.user,
                ts: millis_to_datetime(record.ts_ms),
                change_count: record.changes as usize,
                details: Vec::new(),
            });
        }

        if with_details {
            let detail_fetches = entries.iter().map(|entry| {
                let query = Query::collection(self.inner.changes_collection())
                    .filter(FIELD_RECORD_ID, FilterOp::Eq, entry.id.clone())
                    .limit(LOG_DETAILS_CAP);
                async move {
                    with_retries(READ_ATTEMPTS, MAX_OPERATION_TIME, "triage change query", || {
                        self.inner.db.run_query(&query)
                    })
                    .await
                }
            });
            let all_details = try_join_all(detail_fetches).await?;
            for (entry, docs) in entries.iter_mut().zip(all_details) {
                let mut details = Vec::with_capacity(docs.len());
                for doc in docs {
                    let change: ChangeDoc = doc.decode()?;
                    details.push(TriageDelta {
                        grouping: Grouping::from_keys(change.grouping),
                        digest: change.digest,
                        label: Label::from_int(change.label_after),
                    });
                }
                details.sort_by(|a, b| {
                    (a.grouping.name(), &a.digest).cmp(&(b.grouping.name(), &b.digest))
                });
                entry.details = details;
            }
        }

        Ok((entries, total))
    }

    async fn undo_change(&self, record_id: &str, user: &str) -> Result<(), StoreError> {
        self.require_writable()?;

        let records_collection = self.inner.records_collection();
        let record = with_retries(READ_ATTEMPTS, MAX_OPERATION_TIME, "triage record lookup", || {
            self.inner.db.get(&records_collection, record_id)
        })
        .await?;
        if record.is_none() {
            return Err(StoreError::RecordNotFound(record_id.to_owned()));
        }

        let query = Query::collection(self.inner.changes_collection()).filter(
            FIELD_RECORD_ID,
            FilterOp::Eq,
            record_id,
        );
        let docs = with_retries(READ_ATTEMPTS, MAX_OPERATION_TIME, "triage change query", || {
            self.inner.db.run_query(&query)
        })
        .await?;

        let mut deltas = Vec::with_capacity(docs.len());
        for doc in docs {
            let change: ChangeDoc = doc.decode()?;
            deltas.push(TriageDelta {
                grouping: Grouping::from_keys(change.grouping),
                digest: change.digest,
                label: Label::from_int(change.label_before),
            });
        }

        // Applied as a fresh record, so the undo is audit-visible and
        // itself undoable.
        self.add_change(&deltas, user).await
    }

    async fn get_triage_history(
        &self,
        test: &str,
        digest: &str,
    ) -> Result<Vec<TriageHistoryEntry>, StoreError> {
        let query = Query::collection(self.inner.changes_collection())
            .filter(FIELD_TEST, FilterOp::Eq, test)
            .filter(FIELD_DIGEST, FilterOp::Eq, digest);
        let docs = with_retries(READ_ATTEMPTS, MAX_OPERATION_TIME, "triage history query", || {
            self.inner.db.run_query(&query)
        })
        .await?;

        let record_ids = {
            let mut ids = Vec::with_capacity(docs.len());
            for doc in docs {
                let change: ChangeDoc = doc.decode()?;
                ids.push(change.record_id);
            }
            ids.into_iter().unique().collect_vec()
        };

        let record_fetches = record_ids.iter().map(|id| {
            let id = id.clone();
            async move {
                let records_collection = self.inner.records_collection();
                with_retries(READ_ATTEMPTS, MAX_OPERATION_TIME, "triage record lookup", || {
                    self.inner.db.get(&records_collection, &id)
                })
                .await
            }
        });
        let records = try_join_all(record_fetches).await?;

        let mut history = Vec::new();
        for doc in records.into_iter().flatten() {
            let record: RecordDoc = doc.decode()?;
            history.push(TriageHistoryEntry {
                user: record.user,
                ts: millis_to_datetime(record.ts_ms),
            });
        }
        history.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(history)
    }

    fn for_changelist(&self, cl_id: &str, crs: &str) -> Box<dyn ExpectationStore> {
        Box::new(self.for_changelist_store(cl_id, crs, DispatchMode::Synchronous))
    }
}

#[async_trait]
impl GarbageCollector for DocExpectationStore {
    async fn update_last_used(&self, ids: &[ExpectationId], ts: DateTime<Utc>) -> Result<(), StoreError> {
        self.require_writable()?;
        if self.inner.partition != MASTER_PARTITION {
            return Err(StoreError::MasterOnly("update_last_used"));
        }
        if ids.is_empty() {
            return Ok(());
        }

        for batch in ids.chunks(GC_DELETE_BATCH) {
            let writes = batch
                .iter()
                .map(|id| Write::Merge {
                    collection: self.inner.entries_collection(),
                    id: entry_id(&id.test, &id.digest),
                    fields: serde_json::json!({ FIELD_LAST_USED: ts.timestamp_millis() }),
                })
                .collect_vec();
            with_retries(WRITE_ATTEMPTS, MAX_OPERATION_TIME, "last-used update", || {
                self.inner.db.commit(writes.clone())
            })
            .await?;
        }
        Ok(())
    }

    async fn mark_unused_entries_for_gc(&self, label: Label, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.require_writable()?;
        if label == Label::Untriaged {
            return Err(StoreError::UntriagedGcLabel);
        }

        let query = Query::collection(self.inner.entries_collection())
            .filter(FIELD_UPDATED, FilterOp::Lt, cutoff.timestamp_millis())
            .filter(FIELD_NEEDS_GC, FilterOp::Eq, false);
        let docs = with_retries(READ_ATTEMPTS, GC_SCAN_TIME, "gc mark scan", || {
            self.inner.db.run_query(&query)
        })
        .await?;

        let mut to_mark = Vec::new();
        for doc in docs {
            let entry = match ExpectationEntry::from_doc(&doc) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping corrupt expectation document {} in gc scan: {e}", doc.id);
                    continue;
                }
            };
            // A zero last_used is a legacy entry that predates the field;
            // the updated-before-cutoff filter already vouches for it.
            if entry.current_label() == Some(label) && entry.last_used <= cutoff {
                to_mark.push(doc.id);
            }
        }

        let marked = to_mark.len();
        for batch in to_mark.chunks(GC_DELETE_BATCH) {
            let writes = batch
                .iter()
                .map(|id| Write::Merge {
                    collection: self.inner.entries_collection(),
                    id: id.clone(),
                    fields: serde_json::json!({ FIELD_NEEDS_GC: true }),
                })
                .collect_vec();
            with_retries(WRITE_ATTEMPTS, MAX_OPERATION_TIME, "gc mark write", || {
                self.inner.db.commit(writes.clone())
            })
            .await?;
        }
        info!("Marked {marked} {label} entries for garbage collection");
        Ok(marked)
    }

    async fn garbage_collect(&self) -> Result<usize, StoreError> {
        self.require_writable()?;

        let query = Query::collection(self.inner.entries_collection()).filter(FIELD_NEEDS_GC, FilterOp::Eq, true);
        let docs = with_retries(READ_ATTEMPTS, GC_SCAN_TIME, "gc delete scan", || {
            self.inner.db.run_query(&query)
        })
        .await?;

        let ids = docs.into_iter().map(|doc| doc.id).collect_vec();
        let deleted = ids.len();
        // An empty run must not issue an empty commit.
        for batch in ids.chunks(GC_DELETE_BATCH) {
            let writes = batch
                .iter()
                .map(|id| Write::Delete {
                    collection: self.inner.entries_collection(),
                    id: id.clone(),
                })
                .collect_vec();
            with_retries(WRITE_ATTEMPTS, MAX_OPERATION_TIME, "gc delete", || {
                self.inner.db.commit(writes.clone())
            })
            .await?;
        }
        info!("Garbage collected {deleted} expectation entries");
        Ok(deleted)
    }
}
