use std::collections::BTreeMap;

/// The triage-status result sets a reviewer pages through. Each bucket of
/// each corpus gets its own cache key; the buckets are mutually exclusive,
/// so serving a query is a union with no dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriageBucket {
    Untriaged,
    Positive,
    Negative,
    Ignored,
}

impl TriageBucket {
    pub const ALL: [TriageBucket; 4] = [
        TriageBucket::Untriaged,
        TriageBucket::Positive,
        TriageBucket::Negative,
        TriageBucket::Ignored,
    ];

    pub fn key_fragment(self) -> &'static str {
        match self {
            TriageBucket::Untriaged => "untriaged",
            TriageBucket::Positive => "positive",
            TriageBucket::Negative => "negative",
            TriageBucket::Ignored => "ignored",
        }
    }

    /// The relational label code this bucket filters on; `None` for the
    /// ignored bucket, which is not a label filter.
    pub(crate) fn label_code(self) -> Option<&'static str> {
        match self {
            TriageBucket::Untriaged => Some("u"),
            TriageBucket::Positive => Some("p"),
            TriageBucket::Negative => Some("n"),
            TriageBucket::Ignored => None,
        }
    }
}

/// A reviewer's trace-filter query, already parsed out of whatever surface
/// it arrived on. `trace_values` is keyed by trace key with the accepted
/// values per key; the corpus is carried separately because it is handled
/// specially throughout.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub corpus: String,
    pub trace_values: BTreeMap<String, Vec<String>>,
    pub include_ignored: bool,
    pub only_include_digests_at_head: bool,
    pub include_untriaged: bool,
    pub include_positive: bool,
    pub include_negative: bool,
}

impl SearchQuery {
    /// The common reviewer query: one corpus, at head, one bucket.
    pub fn for_bucket(corpus: &str, bucket: TriageBucket) -> Self {
        Self {
            corpus: corpus.to_owned(),
            trace_values: BTreeMap::new(),
            include_ignored: bucket == TriageBucket::Ignored,
            only_include_digests_at_head: true,
            include_untriaged: bucket == TriageBucket::Untriaged,
            include_positive: bucket == TriageBucket::Positive,
            include_negative: bucket == TriageBucket::Negative,
        }
    }

    /// The buckets this query asks for, in a fixed order.
    pub fn buckets(&self) -> Vec<TriageBucket> {
        let mut buckets = Vec::new();
        if self.include_untriaged {
            buckets.push(TriageBucket::Untriaged);
        }
        if self.include_positive {
            buckets.push(TriageBucket::Positive);
        }
        if self.include_negative {
            buckets.push(TriageBucket::Negative);
        }
        if self.include_ignored {
            buckets.push(TriageBucket::Ignored);
        }
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_selection_follows_the_flags() {
        let mut query = SearchQuery {
            corpus: "round".to_owned(),
            include_untriaged: true,
            include_negative: true,
            only_include_digests_at_head: true,
            ..Default::default()
        };
        assert_eq!(query.buckets(), vec![TriageBucket::Untriaged, TriageBucket::Negative]);

        query.include_ignored = true;
        query.include_positive = true;
        assert_eq!(
            query.buckets(),
            vec![
                TriageBucket::Untriaged,
                TriageBucket::Positive,
                TriageBucket::Negative,
                TriageBucket::Ignored
            ]
        );
    }

    #[test]
    fn for_bucket_builds_the_canonical_head_query() {
        let query = SearchQuery::for_bucket("round", TriageBucket::Positive);
        assert!(query.only_include_digests_at_head);
        assert_eq!(query.buckets(), vec![TriageBucket::Positive]);
    }
}
