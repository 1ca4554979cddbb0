mod cache;
mod caching;
mod query;
mod sql;

pub use cache::{Cache, CacheError, MemoryCache, SledCache};
pub use caching::{DigestWithTrace, SearchCacheManager, SqlTraceSource, TraceDigestSource, digests_for_grouping_key};
pub use query::{SearchQuery, TriageBucket};
pub use sql::{
    JsonbDialect, QueryContext, digests_for_grouping_statement, matching_digests_statement, matching_traces_statement,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("corpus {0:?} contains unsupported characters")]
    InvalidCorpus(String),

    #[error("grouping id {0:?} is not valid hex")]
    InvalidGroupingId(String),

    #[error("cache error")]
    Cache(#[source] CacheError),

    #[error("error encoding or decoding cached search results")]
    Serde(#[from] serde_json::Error),

    #[error("search query failed")]
    Sql(#[from] diesel::result::Error),

    #[error("couldn't connect to the trace database")]
    Connection(#[from] diesel::ConnectionError),
}
