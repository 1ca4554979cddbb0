use crate::query::{SearchQuery, TriageBucket};
use crate::SearchError;
use itertools::Itertools;
use log::warn;

/// How the generated SQL compares against the JSONB `keys` column. The
/// engine-preserving form compares JSONB to JSONB, which is what the
/// inverted index understands; the extracted-text form compares the value
/// as text. A deployment flag selects one, so both must stay correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonbDialect {
    Preserving,
    ExtractedText,
}

/// Everything about the deployment and commit window a statement needs
/// besides the query itself.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Oldest commit id inside the search window.
    pub first_commit_id: String,
    /// Oldest tile id inside the search window, for the non-head regime.
    pub first_tile_id: i32,
    pub dialect: JsonbDialect,
    /// Whether the not-ignored materialized view exists and may replace
    /// the common scan.
    pub use_materialized_view: bool,
}

// Keys are spliced into SQL, so anything outside this narrow shape is
// rejected outright.
fn sanitize_key(key: &str) -> Option<&str> {
    let ok = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    ok.then_some(key)
}

// Trace values carry a little more punctuation (device names, version
// strings), but still nothing that could escape a quoted literal.
fn sanitize_value(value: &str) -> Option<&str> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-' | '(' | ')'));
    ok.then_some(value)
}

fn key_value_predicate(key: &str, value: &str, dialect: JsonbDialect) -> String {
    match dialect {
        JsonbDialect::Preserving => format!("keys -> '{key}' = '\"{value}\"'"),
        JsonbDialect::ExtractedText => format!("keys ->> '{key}' = '{value}'"),
    }
}

/// Which ignore-rule statuses a statement accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IgnoreFilter {
    /// Only traces no ignore rule matches.
    Exclude,
    /// Ignored and non-ignored traces alike.
    Include,
    /// Only ignored traces (the ignored bucket).
    Only,
}

impl IgnoreFilter {
    fn for_query(query: &SearchQuery) -> Self {
        if query.include_ignored {
            IgnoreFilter::Include
        } else {
            IgnoreFilter::Exclude
        }
    }

    fn statuses(self) -> &'static str {
        match self {
            IgnoreFilter::Exclude => "ARRAY[FALSE]",
            IgnoreFilter::Include => "ARRAY[FALSE, TRUE]",
            IgnoreFilter::Only => "ARRAY[TRUE]",
        }
    }
}

/// The per-key union and cross-key intersection clauses: one `Ui` per
/// surviving key unioning its per-value index lookups, intersected with
/// each other and a trace-index lookup for the corpus. Keys or values that
/// fail sanitization are dropped with a warning rather than failing the
/// query.
fn joined_traces_clauses(query: &SearchQuery, corpus: &str, dialect: JsonbDialect) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut union_names = Vec::new();

    for (key, values) in &query.trace_values {
        if key == gild_types::SOURCE_TYPE_KEY {
            continue;
        }
        let Some(key) = sanitize_key(key) else {
            warn!("Dropping trace filter with unsupported key {key:?}");
            continue;
        };
        let lookups = values
            .iter()
            .filter_map(|value| {
                let Some(value) = sanitize_value(value) else {
                    warn!("Dropping trace filter value {value:?} for key {key:?}");
                    return None;
                };
                Some(format!(
                    "    SELECT trace_id FROM data.traces WHERE {}",
                    key_value_predicate(key, value, dialect)
                ))
            })
            .collect_vec();
        if lookups.is_empty() {
            continue;
        }
        let name = format!("U{}", union_names.len());
        clauses.push(format!("{name} AS (\n{}\n)", lookups.join("\n    UNION\n")));
        union_names.push(name);
    }

    if union_names.is_empty() {
        return clauses;
    }

    let mut intersected = union_names
        .iter()
        .map(|name| format!("    SELECT trace_id FROM {name}"))
        .collect_vec();
    intersected.push(format!(
        "    SELECT trace_id FROM data.traces WHERE {}",
        key_value_predicate(gild_types::SOURCE_TYPE_KEY, corpus, dialect)
    ));
    clauses.push(format!(
        "JoinedTraces AS (\n{}\n)",
        intersected.join("\n    INTERSECT\n")
    ));
    clauses
}

/// The WITH-chain ending in a `MatchingTraces` clause of
/// `(trace_id, grouping_id, digest)` rows. Two regimes: a corpus-only
/// query becomes a direct scan of the at-head table (or its not-ignored
/// materialized view); key filters become per-value index lookups unioned
/// per key and intersected across keys, joined back against the digest
/// source.
fn matching_traces_cte(
    query: &SearchQuery,
    ctx: &QueryContext,
    ignore_filter: IgnoreFilter,
) -> Result<String, SearchError> {
    let corpus = sanitize_value(&query.corpus)
        .ok_or_else(|| SearchError::InvalidCorpus(query.corpus.clone()))?;
    let statuses = ignore_filter.statuses();

    let mut clauses = joined_traces_clauses(query, corpus, ctx.dialect);
    let has_key_filters = !clauses.is_empty();

    let matching = if has_key_filters {
        if query.only_include_digests_at_head {
            format!(
                "MatchingTraces AS (\n    \
                 SELECT values_at_head.trace_id, values_at_head.grouping_id, values_at_head.digest\n    \
                 FROM data.values_at_head\n    \
                 JOIN JoinedTraces ON values_at_head.trace_id = JoinedTraces.trace_id\n    \
                 WHERE most_recent_commit_id >= '{first}'\n        \
                 AND matches_any_ignore_rule = ANY ({statuses})\n)",
                first = ctx.first_commit_id,
            )
        } else {
            format!(
                "MatchingTraces AS (\n    \
                 SELECT DISTINCT traces.trace_id, traces.grouping_id, tiled_trace_digests.digest\n    \
                 FROM data.traces\n    \
                 JOIN JoinedTraces ON traces.trace_id = JoinedTraces.trace_id\n    \
                 JOIN data.tiled_trace_digests ON traces.trace_id = tiled_trace_digests.trace_id\n    \
                 WHERE tiled_trace_digests.tile_id >= {tile}\n        \
                 AND traces.matches_any_ignore_rule = ANY ({statuses})\n)",
                tile = ctx.first_tile_id,
            )
        }
    } else if query.only_include_digests_at_head {
        if ctx.use_materialized_view && ignore_filter == IgnoreFilter::Exclude {
            format!(
                "MatchingTraces AS (\n    \
                 SELECT trace_id, grouping_id, digest\n    \
                 FROM data.values_at_head_not_ignored\n    \
                 WHERE most_recent_commit_id >= '{first}'\n        \
                 AND corpus = '{corpus}'\n)",
                first = ctx.first_commit_id,
            )
        } else {
            format!(
                "MatchingTraces AS (\n    \
                 SELECT trace_id, grouping_id, digest\n    \
                 FROM data.values_at_head\n    \
                 WHERE most_recent_commit_id >= '{first}'\n        \
                 AND matches_any_ignore_rule = ANY ({statuses})\n        \
                 AND corpus = '{corpus}'\n)",
                first = ctx.first_commit_id,
            )
        }
    } else {
        format!(
            "MatchingTraces AS (\n    \
             SELECT DISTINCT traces.trace_id, traces.grouping_id, tiled_trace_digests.digest\n    \
             FROM data.traces\n    \
             JOIN data.tiled_trace_digests ON traces.trace_id = tiled_trace_digests.trace_id\n    \
             WHERE tiled_trace_digests.tile_id >= {tile}\n        \
             AND traces.matches_any_ignore_rule = ANY ({statuses})\n        \
             AND traces.corpus = '{corpus}'\n)",
            tile = ctx.first_tile_id,
        )
    };
    clauses.push(matching);

    Ok(format!("WITH\n{}", clauses.join(",\n")))
}

/// The base assembler product: every `(trace_id, grouping_id, digest)`
/// matching the trace filters, with no triage-status filtering.
pub fn matching_traces_statement(query: &SearchQuery, ctx: &QueryContext) -> Result<String, SearchError> {
    let cte = matching_traces_cte(query, ctx, IgnoreFilter::for_query(query))?;
    Ok(format!(
        "{cte}\nSELECT trace_id, grouping_id, digest FROM MatchingTraces"
    ))
}

/// The matching rows restricted to one triage bucket. Label buckets join
/// the expectations table (missing rows count as untriaged); the ignored
/// bucket instead flips the ignore-status filter.
pub fn matching_digests_statement(
    query: &SearchQuery,
    bucket: TriageBucket,
    ctx: &QueryContext,
) -> Result<String, SearchError> {
    match bucket.label_code() {
        None => {
            // The ignored bucket lists ignored traces; the corpus scan must
            // select them rather than filter them out.
            let cte = matching_traces_cte(query, ctx, IgnoreFilter::Only)?;
            Ok(format!(
                "{cte}\nSELECT trace_id, grouping_id, digest FROM MatchingTraces"
            ))
        }
        Some(code) => {
            let cte = matching_traces_cte(query, ctx, IgnoreFilter::Exclude)?;
            Ok(format!(
                "{cte}\n\
                 SELECT MatchingTraces.trace_id, MatchingTraces.grouping_id, MatchingTraces.digest\n\
                 FROM MatchingTraces\n\
                 LEFT JOIN triage.expectations\n    \
                 ON MatchingTraces.grouping_id = triage.expectations.grouping_id\n    \
                 AND MatchingTraces.digest = triage.expectations.digest\n\
                 WHERE COALESCE(triage.expectations.label, 'u') = '{code}'"
            ))
        }
    }
}

/// All at-head digests of one grouping, used by the diff path. The
/// grouping id is spliced as a hex byte literal after validation.
pub fn digests_for_grouping_statement(
    grouping_id_hex: &str,
    ctx: &QueryContext,
) -> Result<String, SearchError> {
    let valid = grouping_id_hex.len() == 32 && grouping_id_hex.chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(SearchError::InvalidGroupingId(grouping_id_hex.to_owned()));
    }
    Ok(format!(
        "SELECT trace_id, grouping_id, digest\n\
         FROM data.values_at_head\n\
         WHERE grouping_id = '\\x{grouping_id_hex}'\n    \
         AND most_recent_commit_id >= '{first}'",
        first = ctx.first_commit_id,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx() -> QueryContext {
        QueryContext {
            first_commit_id: "0000000100".to_owned(),
            first_tile_id: 3,
            dialect: JsonbDialect::Preserving,
            use_materialized_view: false,
        }
    }

    fn corpus_query() -> SearchQuery {
        SearchQuery {
            corpus: "round".to_owned(),
            only_include_digests_at_head: true,
            ..Default::default()
        }
    }

    #[test]
    fn corpus_only_query_is_a_direct_scan() {
        let statement = matching_traces_statement(&corpus_query(), &ctx()).unwrap();
        assert_eq!(
            statement,
            "WITH\n\
             MatchingTraces AS (\n    \
             SELECT trace_id, grouping_id, digest\n    \
             FROM data.values_at_head\n    \
             WHERE most_recent_commit_id >= '0000000100'\n        \
             AND matches_any_ignore_rule = ANY (ARRAY[FALSE])\n        \
             AND corpus = 'round'\n)\n\
             SELECT trace_id, grouping_id, digest FROM MatchingTraces"
        );
    }

    #[test]
    fn materialized_view_replaces_the_not_ignored_scan() {
        let mut context = ctx();
        context.use_materialized_view = true;
        let statement = matching_traces_statement(&corpus_query(), &context).unwrap();
        assert!(statement.contains("FROM data.values_at_head_not_ignored"));
        assert!(!statement.contains("matches_any_ignore_rule"));

        // Once ignored traces are wanted, the view no longer covers the
        // query.
        let mut query = corpus_query();
        query.include_ignored = true;
        let statement = matching_traces_statement(&query, &context).unwrap();
        assert!(statement.contains("FROM data.values_at_head\n"));
        assert!(statement.contains("ANY (ARRAY[FALSE, TRUE])"));
    }

    #[test]
    fn key_filters_become_union_and_intersect_lookups() {
        let mut query = corpus_query();
        query.trace_values = BTreeMap::from([
            ("os".to_owned(), vec!["Android".to_owned(), "iOS".to_owned()]),
            ("arch".to_owned(), vec!["arm64".to_owned()]),
        ]);

        let statement = matching_traces_statement(&query, &ctx()).unwrap();
        assert_eq!(
            statement,
            "WITH\n\
             U0 AS (\n    \
             SELECT trace_id FROM data.traces WHERE keys -> 'arch' = '\"arm64\"'\n)\
             ,\n\
             U1 AS (\n    \
             SELECT trace_id FROM data.traces WHERE keys -> 'os' = '\"Android\"'\n    \
             UNION\n    \
             SELECT trace_id FROM data.traces WHERE keys -> 'os' = '\"iOS\"'\n)\
             ,\n\
             JoinedTraces AS (\n    \
             SELECT trace_id FROM U0\n    \
             INTERSECT\n    \
             SELECT trace_id FROM U1\n    \
             INTERSECT\n    \
             SELECT trace_id FROM data.traces WHERE keys -> 'source_type' = '\"round\"'\n)\
             ,\n\
             MatchingTraces AS (\n    \
             SELECT values_at_head.trace_id, values_at_head.grouping_id, values_at_head.digest\n    \
             FROM data.values_at_head\n    \
             JOIN JoinedTraces ON values_at_head.trace_id = JoinedTraces.trace_id\n    \
             WHERE most_recent_commit_id >= '0000000100'\n        \
             AND matches_any_ignore_rule = ANY (ARRAY[FALSE])\n)\n\
             SELECT trace_id, grouping_id, digest FROM MatchingTraces"
        );
    }

    #[test]
    fn extracted_text_dialect_compares_text() {
        let mut query = corpus_query();
        query.trace_values = BTreeMap::from([("os".to_owned(), vec!["Android".to_owned()])]);
        let mut context = ctx();
        context.dialect = JsonbDialect::ExtractedText;

        let statement = matching_traces_statement(&query, &context).unwrap();
        assert!(statement.contains("keys ->> 'os' = 'Android'"));
        assert!(statement.contains("keys ->> 'source_type' = 'round'"));
        assert!(!statement.contains("keys -> 'os'"));
    }

    #[test]
    fn non_head_queries_join_the_tiled_digests() {
        let mut query = corpus_query();
        query.only_include_digests_at_head = false;
        let statement = matching_traces_statement(&query, &ctx()).unwrap();
        assert!(statement.contains("JOIN data.tiled_trace_digests"));
        assert!(statement.contains("tiled_trace_digests.tile_id >= 3"));
        assert!(statement.contains("traces.corpus = 'round'"));

        query.trace_values = BTreeMap::from([("os".to_owned(), vec!["Android".to_owned()])]);
        let statement = matching_traces_statement(&query, &ctx()).unwrap();
        assert!(statement.contains("JOIN JoinedTraces ON traces.trace_id = JoinedTraces.trace_id"));
        assert!(statement.contains("JOIN data.tiled_trace_digests"));
    }

    #[test]
    fn hostile_filters_are_dropped_not_spliced() {
        let mut query = corpus_query();
        query.trace_values = BTreeMap::from([
            ("os'; DROP TABLE data.traces; --".to_owned(), vec!["Android".to_owned()]),
            ("os".to_owned(), vec!["x' OR '1'='1".to_owned()]),
            ("arch".to_owned(), vec!["arm64".to_owned()]),
        ]);

        let statement = matching_traces_statement(&query, &ctx()).unwrap();
        assert!(!statement.contains("DROP TABLE"));
        assert!(!statement.contains("OR '1'"));
        // The sane filter survives.
        assert!(statement.contains("keys -> 'arch' = '\"arm64\"'"));
        // The key whose every value was dropped vanishes entirely, so only
        // one union clause remains.
        assert!(statement.contains("U0"));
        assert!(!statement.contains("U1"));
    }

    #[test]
    fn hostile_corpus_is_an_error() {
        let mut query = corpus_query();
        query.corpus = "round'; DROP TABLE data.traces; --".to_owned();
        let err = matching_traces_statement(&query, &ctx()).unwrap_err();
        assert!(matches!(err, SearchError::InvalidCorpus(_)));
    }

    #[test]
    fn label_buckets_join_the_expectations() {
        let statement =
            matching_digests_statement(&corpus_query(), TriageBucket::Untriaged, &ctx()).unwrap();
        assert!(statement.contains("LEFT JOIN triage.expectations"));
        assert!(statement.ends_with("WHERE COALESCE(triage.expectations.label, 'u') = 'u'"));

        let statement =
            matching_digests_statement(&corpus_query(), TriageBucket::Negative, &ctx()).unwrap();
        assert!(statement.ends_with("= 'n'"));
    }

    #[test]
    fn ignored_bucket_selects_only_ignored_traces() {
        let statement =
            matching_digests_statement(&corpus_query(), TriageBucket::Ignored, &ctx()).unwrap();
        assert!(statement.contains("ANY (ARRAY[TRUE])"));
        assert!(!statement.contains("LEFT JOIN"));
    }

    #[test]
    fn grouping_digests_use_a_byte_literal() {
        let statement =
            digests_for_grouping_statement("0123456789abcdef0123456789abcdef", &ctx()).unwrap();
        assert!(statement.contains("grouping_id = '\\x0123456789abcdef0123456789abcdef'"));

        let err = digests_for_grouping_statement("nope", &ctx()).unwrap_err();
        assert!(matches!(err, SearchError::InvalidGroupingId(_)));
    }
}
