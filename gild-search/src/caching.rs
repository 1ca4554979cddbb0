use crate::cache::Cache;
use crate::query::{SearchQuery, TriageBucket};
use crate::sql::{JsonbDialect, QueryContext, matching_digests_statement};
use crate::SearchError;
use async_trait::async_trait;
use diesel::sql_types::Bytea;
use diesel::QueryableByName;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use gild_types::GroupingId;
use hashbrown::HashSet;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One search hit: a trace, its grouping, and the digest it produced, all
/// as lowercase hex. This is also the JSON shape stored in the cache, so a
/// cached bucket deserializes straight into the serving response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestWithTrace {
    pub trace_id: String,
    pub grouping_id: String,
    pub digest: String,
}

/// Where the cache manager gets rows when it has to go to the database:
/// the commit window, and the execution of an assembled statement. Split
/// out so tests can stub the database away.
#[async_trait]
pub trait TraceDigestSource: Send + Sync {
    /// `(first commit id, first tile id)` of the current search window, or
    /// `None` when no commits have data yet.
    async fn search_window(&self) -> Result<Option<(String, i32)>, SearchError>;

    async fn execute(&self, statement: &str) -> Result<Vec<DigestWithTrace>, SearchError>;
}

#[derive(QueryableByName)]
struct DigestRow {
    #[diesel(sql_type = Bytea)]
    trace_id: Vec<u8>,
    #[diesel(sql_type = Bytea)]
    grouping_id: Vec<u8>,
    #[diesel(sql_type = Bytea)]
    digest: Vec<u8>,
}

/// The real source, executing against the trace database.
pub struct SqlTraceSource {
    conn: tokio::sync::Mutex<AsyncPgConnection>,
    window_length: usize,
}

impl SqlTraceSource {
    pub fn new(conn: AsyncPgConnection, window_length: usize) -> Self {
        Self {
            conn: tokio::sync::Mutex::new(conn),
            window_length,
        }
    }
}

#[async_trait]
impl TraceDigestSource for SqlTraceSource {
    async fn search_window(&self) -> Result<Option<(String, i32)>, SearchError> {
        let mut conn = self.conn.lock().await;
        Ok(gild_db::async_db::window_first_commit(&mut conn, self.window_length).await?)
    }

    async fn execute(&self, statement: &str) -> Result<Vec<DigestWithTrace>, SearchError> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<DigestRow> = diesel::sql_query(statement).load(&mut *conn).await?;
        Ok(rows
            .into_iter()
            .map(|row| DigestWithTrace {
                trace_id: hex::encode(row.trace_id),
                grouping_id: hex::encode(row.grouping_id),
                digest: hex::encode(row.digest),
            })
            .collect())
    }
}

fn bucket_cache_key(corpus: &str, bucket: TriageBucket) -> String {
    format!("gild_{corpus}_{}", bucket.key_fragment())
}

fn byblame_cache_key(corpus: &str) -> String {
    format!("gild_byblame_{corpus}")
}

/// Cache key of the per-grouping digest cache used by the diff path.
pub fn digests_for_grouping_key(grouping_id: &GroupingId, trace_keys: &BTreeMap<String, Vec<String>>) -> String {
    let canonical = serde_json::to_string(trace_keys).expect("string map serialization cannot fail");
    format!("digestsForGroup_{grouping_id}_{canonical}")
}

/// Precomputes, per corpus and triage bucket, the digests a reviewer's
/// common queries return, and serves those queries from the cache with a
/// per-bucket live-SQL fallback on miss.
pub struct SearchCacheManager {
    cache: Arc<dyn Cache>,
    source: Arc<dyn TraceDigestSource>,
    corpora: Vec<String>,
    dialect: JsonbDialect,
    use_materialized_view: bool,
    /// When set, only traces whose id is in this set may leave the store.
    /// Applied after the SQL fetch and to cached rows at serve time, never
    /// inside the SQL itself.
    publicly_visible_traces: Option<HashSet<String>>,
}

impl SearchCacheManager {
    pub fn new(cache: Arc<dyn Cache>, source: Arc<dyn TraceDigestSource>, corpora: Vec<String>) -> Self {
        Self {
            cache,
            source,
            corpora,
            dialect: JsonbDialect::Preserving,
            use_materialized_view: false,
            publicly_visible_traces: None,
        }
    }

    pub fn with_dialect(mut self, dialect: JsonbDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_materialized_view(mut self, enabled: bool) -> Self {
        self.use_materialized_view = enabled;
        self
    }

    pub fn with_publicly_visible_traces(mut self, trace_ids: HashSet<String>) -> Self {
        self.publicly_visible_traces = Some(trace_ids);
        self
    }

    fn context(&self, window: (String, i32)) -> QueryContext {
        QueryContext {
            first_commit_id: window.0,
            first_tile_id: window.1,
            dialect: self.dialect,
            use_materialized_view: self.use_materialized_view,
        }
    }

    /// Rebuilds every `(corpus, bucket)` result set plus the by-blame set.
    /// Empty results are not stored, so a later miss on them degrades to a
    /// live query instead of serving a stale empty answer.
    pub async fn run_cache_population(&self) -> Result<(), SearchError> {
        let Some(window) = self.source.search_window().await? else {
            info!("No commits with data yet; skipping search cache population");
            return Ok(());
        };
        let ctx = self.context(window);

        for corpus in &self.corpora {
            for bucket in TriageBucket::ALL {
                let query = SearchQuery::for_bucket(corpus, bucket);
                let statement = matching_digests_statement(&query, bucket, &ctx)?;
                let rows = TraceDigestSource::execute(&*self.source, &statement).await?;
                if rows.is_empty() {
                    debug!("No {} digests for corpus {corpus}; not storing", bucket.key_fragment());
                    continue;
                }
                let encoded = serde_json::to_vec(&rows)?;
                self.cache
                    .set_bytes(&bucket_cache_key(corpus, bucket), encoded.clone())
                    .await
                    .map_err(SearchError::Cache)?;
                if bucket == TriageBucket::Untriaged {
                    // The by-blame view attributes regressions, which are
                    // exactly the untriaged digests at head.
                    self.cache
                        .set_bytes(&byblame_cache_key(corpus), encoded)
                        .await
                        .map_err(SearchError::Cache)?;
                }
            }
            info!("Search cache populated for corpus {corpus}");
        }
        Ok(())
    }

    async fn cached_rows(&self, key: &str) -> Result<Option<Vec<DigestWithTrace>>, SearchError> {
        let Some(bytes) = self.cache.get_bytes(key).await.map_err(SearchError::Cache)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn live_bucket(
        &self,
        query: &SearchQuery,
        bucket: TriageBucket,
    ) -> Result<Vec<DigestWithTrace>, SearchError> {
        let Some(window) = self.source.search_window().await? else {
            return Ok(Vec::new());
        };
        let ctx = self.context(window);
        let statement = matching_digests_statement(query, bucket, &ctx)?;
        TraceDigestSource::execute(&*self.source, &statement).await
    }

    fn apply_public_filter(&self, rows: Vec<DigestWithTrace>) -> Vec<DigestWithTrace> {
        let Some(visible) = &self.publicly_visible_traces else {
            return rows;
        };
        rows.into_iter()
            .filter(|row| visible.contains(&row.trace_id))
            .collect()
    }

    /// Serves a reviewer query. Only the plain at-head queries are cached
    /// (one key per requested bucket); anything with trace filters or a
    /// historical window bypasses the cache. A miss on one bucket falls
    /// back to live SQL for that bucket only.
    pub async fn get_matching_digests_and_traces(
        &self,
        query: &SearchQuery,
    ) -> Result<Vec<DigestWithTrace>, SearchError> {
        let cacheable = query.only_include_digests_at_head && query.trace_values.is_empty();

        // The buckets are mutually exclusive, so the union needs no dedup.
        let mut rows = Vec::new();
        for bucket in query.buckets() {
            if cacheable {
                if let Some(cached) = self.cached_rows(&bucket_cache_key(&query.corpus, bucket)).await? {
                    rows.extend(cached);
                    continue;
                }
                warn!(
                    "Search cache miss for corpus {} bucket {}; falling back to SQL",
                    query.corpus,
                    bucket.key_fragment()
                );
            }
            rows.extend(self.live_bucket(query, bucket).await?);
        }
        Ok(self.apply_public_filter(rows))
    }

    /// The untriaged-at-head digests used to attribute regressions to
    /// commits.
    pub async fn get_by_blame_data(&self, corpus: &str) -> Result<Vec<DigestWithTrace>, SearchError> {
        if let Some(cached) = self.cached_rows(&byblame_cache_key(corpus)).await? {
            return Ok(self.apply_public_filter(cached));
        }
        warn!("By-blame cache miss for corpus {corpus}; falling back to SQL");
        let query = SearchQuery::for_bucket(corpus, TriageBucket::Untriaged);
        let rows = self.live_bucket(&query, TriageBucket::Untriaged).await?;
        Ok(self.apply_public_filter(rows))
    }

    /// Ancillary cache for the diff path: the digests recently produced by
    /// one grouping under one set of trace filters.
    pub async fn set_digests_for_grouping(
        &self,
        grouping_id: &GroupingId,
        trace_keys: &BTreeMap<String, Vec<String>>,
        digests: &[String],
    ) -> Result<(), SearchError> {
        let encoded = serde_json::to_vec(digests)?;
        self.cache
            .set_bytes(&digests_for_grouping_key(grouping_id, trace_keys), encoded)
            .await
            .map_err(SearchError::Cache)
    }

    pub async fn get_digests_for_grouping(
        &self,
        grouping_id: &GroupingId,
        trace_keys: &BTreeMap<String, Vec<String>>,
    ) -> Result<Option<Vec<String>>, SearchError> {
        let Some(bytes) = self
            .cache
            .get_bytes(&digests_for_grouping_key(grouping_id, trace_keys))
            .await
            .map_err(SearchError::Cache)?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
