use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance cycles.
    pub period: u64,
    /// Commits making up the search window.
    pub window_length: usize,
    /// Corpora whose search result sets are precomputed.
    pub corpora: Vec<String>,
    /// On-disk location of the search cache; in-process memory when unset.
    pub cache_path: Option<PathBuf>,
    /// Emit `keys ->> 'k' = 'v'` instead of the JSONB-preserving compare.
    pub extract_text_jsonb: bool,
    /// Route the common not-ignored scan through the materialized view.
    pub use_materialized_view: bool,
    /// Whether to age out stale expectation entries each cycle.
    pub run_expectation_gc: bool,
    /// Entries neither updated nor seen for this many days are collected.
    pub gc_max_age_days: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            period: 60 * 60, // hourly, expressed in seconds
            window_length: 256,
            corpora: Vec::new(),
            cache_path: None,
            extract_text_jsonb: false,
            use_materialized_view: false,
            run_expectation_gc: false,
            gc_max_age_days: 90,
        }
    }
}

impl MaintenanceConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("Gild.toml"))
            .merge(Env::prefixed("GILD_"))
    }

    pub fn config() -> figment::Result<Self> {
        Self::figment().extract()
    }
}
