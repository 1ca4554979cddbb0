use crate::{
    Direction, Doc, DocError, DocumentDb, FieldFilter, FilterOp, MAX_DOCS_PER_TXN, Query, SnapshotStream, Write,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use log::debug;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

/// In-memory implementation of [`DocumentDb`], used by tests and local
/// development. A `tokio::sync::watch` channel carries a version counter
/// that wakes every open snapshot stream after each commit; the streams
/// then diff `update_time`s against what they last delivered.
pub struct MemoryDb {
    shared: Arc<Shared>,
}

struct Shared {
    collections: RwLock<HashMap<String, HashMap<String, Doc>>>,
    version_tx: tokio::sync::watch::Sender<u64>,
    // Number of pending watch wake-ups that should fail instead of
    // delivering a snapshot. Lets store tests exercise shard recovery.
    fail_watch_nexts: AtomicUsize,
}

impl MemoryDb {
    pub fn new() -> Self {
        let (version_tx, _) = tokio::sync::watch::channel(0u64);
        Self {
            shared: Arc::new(Shared {
                collections: RwLock::new(HashMap::new()),
                version_tx,
                fail_watch_nexts: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes the next `count` snapshot deliveries (across all open watches)
    /// fail with [`DocError::WatchInterrupted`].
    pub fn fail_next_watch_nexts(&self, count: usize) {
        self.shared.fail_watch_nexts.fetch_add(count, AtomicOrdering::SeqCst);
        // Wake the streams so the injected failure is observed promptly.
        self.shared.version_tx.send_modify(|v| *v += 1);
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn query_locked(&self, query: &Query) -> Vec<Doc> {
        let collections = self.collections.read().expect("docstore state lock poisoned");
        let Some(collection) = collections.get(&query.collection) else {
            return Vec::new();
        };

        let mut docs: Vec<Doc> = collection
            .values()
            .filter(|doc| query.filters.iter().all(|f| filter_matches(doc, f)))
            .cloned()
            .collect();

        // Untie equal sort keys by id so paging is deterministic.
        docs.sort_by(|a, b| {
            for (field, direction) in &query.order_by {
                let ordering = value_cmp(field_of(a, field), field_of(b, field));
                let ordering = match direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.id.cmp(&b.id)
        });

        let docs = docs.into_iter().skip(query.offset);
        match query.limit {
            Some(limit) => docs.take(limit).collect(),
            None => docs.collect(),
        }
    }
}

fn field_of<'a>(doc: &'a Doc, field: &str) -> Option<&'a serde_json::Value> {
    doc.data.get(field)
}

fn filter_matches(doc: &Doc, filter: &FieldFilter) -> bool {
    let Some(value) = field_of(doc, &filter.field) else {
        return false;
    };
    let ordering = value_cmp(Some(value), Some(&filter.value));
    match filter.op {
        FilterOp::Eq => value == &filter.value,
        FilterOp::Lt => ordering == Ordering::Less,
        FilterOp::Le => ordering != Ordering::Greater,
        FilterOp::Gt => ordering == Ordering::Greater,
        FilterOp::Ge => ordering != Ordering::Less,
    }
}

// Total order over the JSON scalars the filters use. Mixed types sort by a
// fixed type rank, which only matters for malformed documents.
fn value_cmp(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;

    fn type_rank(v: &serde_json::Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => {
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (a, b) => type_rank(a).cmp(&type_rank(b)),
        },
    }
}

#[async_trait]
impl DocumentDb for MemoryDb {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Doc>, DocError> {
        let collections = self
            .shared
            .collections
            .read()
            .expect("docstore state lock poisoned");
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn run_query(&self, query: &Query) -> Result<Vec<Doc>, DocError> {
        Ok(self.shared.query_locked(query))
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), DocError> {
        if writes.len() > MAX_DOCS_PER_TXN {
            return Err(DocError::BatchTooLarge(writes.len()));
        }

        let now = Utc::now();
        {
            let mut collections = self
                .shared
                .collections
                .write()
                .expect("docstore state lock poisoned");
            for write in writes {
                match write {
                    Write::Set { collection, id, data } => {
                        collections.entry(collection).or_default().insert(
                            id.clone(),
                            Doc {
                                id,
                                data,
                                update_time: now,
                            },
                        );
                    }
                    Write::Merge { collection, id, fields } => {
                        let docs = collections.entry(collection).or_default();
                        match docs.get_mut(&id) {
                            Some(doc) => {
                                merge_fields(&mut doc.data, fields);
                                doc.update_time = now;
                            }
                            None => {
                                docs.insert(
                                    id.clone(),
                                    Doc {
                                        id,
                                        data: fields,
                                        update_time: now,
                                    },
                                );
                            }
                        }
                    }
                    Write::Delete { collection, id } => {
                        if let Some(docs) = collections.get_mut(&collection) {
                            docs.remove(&id);
                        }
                    }
                }
            }
        }

        self.shared.version_tx.send_modify(|v| *v += 1);
        Ok(())
    }

    fn watch(&self, query: Query) -> SnapshotStream {
        struct WatchState {
            shared: Arc<Shared>,
            version_rx: tokio::sync::watch::Receiver<u64>,
            query: Query,
            seen: HashMap<String, DateTime<Utc>>,
            first: bool,
            dead: bool,
        }

        let state = WatchState {
            shared: self.shared.clone(),
            version_rx: self.shared.version_tx.subscribe(),
            query,
            seen: HashMap::new(),
            first: true,
            dead: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.dead {
                return None;
            }
            loop {
                if !state.first {
                    if state.version_rx.changed().await.is_err() {
                        debug!("memory docstore shut down, ending watch");
                        return None;
                    }
                    let outstanding = &state.shared.fail_watch_nexts;
                    if outstanding
                        .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        state.dead = true;
                        return Some((Err(DocError::WatchInterrupted), state));
                    }
                }

                // Clear the pending-change marker before reading so a commit
                // racing with this query wakes us again rather than being
                // missed. The worst case is one extra empty diff, skipped
                // below.
                state.version_rx.borrow_and_update();
                let docs = state.shared.query_locked(&state.query);

                let changed: Vec<Doc> = docs
                    .into_iter()
                    .filter(|doc| state.seen.get(&doc.id) != Some(&doc.update_time))
                    .collect();
                for doc in &changed {
                    state.seen.insert(doc.id.clone(), doc.update_time);
                }

                if state.first {
                    state.first = false;
                    return Some((Ok(changed), state));
                }
                if !changed.is_empty() {
                    return Some((Ok(changed), state));
                }
            }
        });

        SnapshotStream::new(Box::pin(stream))
    }
}

fn merge_fields(target: &mut serde_json::Value, fields: serde_json::Value) {
    match (target, fields) {
        (serde_json::Value::Object(target), serde_json::Value::Object(fields)) => {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        (target, fields) => *target = fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(collection: &str, id: &str, data: serde_json::Value) -> Write {
        Write::Set {
            collection: collection.to_owned(),
            id: id.to_owned(),
            data,
        }
    }

    #[tokio::test]
    async fn query_filters_orders_and_pages() {
        let db = MemoryDb::new();
        db.commit(vec![
            set("letters", "a", json!({"rank": 3, "keep": true})),
            set("letters", "b", json!({"rank": 1, "keep": true})),
            set("letters", "c", json!({"rank": 2, "keep": false})),
            set("letters", "d", json!({"rank": 4, "keep": true})),
        ])
        .await
        .unwrap();

        let query = Query::collection("letters")
            .filter("keep", FilterOp::Eq, true)
            .order_by("rank", Direction::Desc)
            .offset(1)
            .limit(2);
        let docs = db.run_query(&query).await.unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn range_filters_compare_strings_lexicographically() {
        let db = MemoryDb::new();
        db.commit(vec![
            set("digests", "1", json!({"digest": "0aaa"})),
            set("digests", "2", json!({"digest": "7fff"})),
            set("digests", "3", json!({"digest": "ffff"})),
        ])
        .await
        .unwrap();

        let query = Query::collection("digests")
            .filter("digest", FilterOp::Ge, "7000")
            .filter("digest", FilterOp::Lt, "f000");
        let docs = db.run_query(&query).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "2");
    }

    #[tokio::test]
    async fn merge_updates_only_named_fields() {
        let db = MemoryDb::new();
        db.commit(vec![set("things", "x", json!({"a": 1, "b": 2}))])
            .await
            .unwrap();
        db.commit(vec![Write::Merge {
            collection: "things".to_owned(),
            id: "x".to_owned(),
            fields: json!({"b": 9}),
        }])
        .await
        .unwrap();

        let doc = db.get("things", "x").await.unwrap().unwrap();
        assert_eq!(doc.data, json!({"a": 1, "b": 9}));
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let db = MemoryDb::new();
        let writes: Vec<_> = (0..=MAX_DOCS_PER_TXN)
            .map(|i| set("bulk", &i.to_string(), json!({})))
            .collect();
        let err = db.commit(writes).await.unwrap_err();
        assert!(matches!(err, DocError::BatchTooLarge(_)));
        assert!(db.get("bulk", "0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_delivers_initial_then_incremental_snapshots() {
        let db = MemoryDb::new();
        db.commit(vec![set("entries", "one", json!({"v": 1}))])
            .await
            .unwrap();

        let mut watch = db.watch(Query::collection("entries"));
        let first = watch.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "one");

        db.commit(vec![
            set("entries", "one", json!({"v": 2})),
            set("entries", "two", json!({"v": 1})),
        ])
        .await
        .unwrap();

        let second = watch.next().await.unwrap().unwrap();
        let mut ids: Vec<_> = second.iter().map(|d| d.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn watch_ignores_other_collections() {
        let db = MemoryDb::new();
        let mut watch = db.watch(Query::collection("watched"));
        assert!(watch.next().await.unwrap().unwrap().is_empty());

        db.commit(vec![set("unwatched", "a", json!({}))]).await.unwrap();
        db.commit(vec![set("watched", "b", json!({}))]).await.unwrap();

        let docs = watch.next().await.unwrap().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "b");
    }

    #[tokio::test]
    async fn injected_failure_kills_the_stream() {
        let db = MemoryDb::new();
        let mut watch = db.watch(Query::collection("entries"));
        watch.next().await.unwrap().unwrap();

        db.fail_next_watch_nexts(1);
        let err = watch.next().await.unwrap().unwrap_err();
        assert!(matches!(err, DocError::WatchInterrupted));
        assert!(watch.next().await.is_none());
    }
}
