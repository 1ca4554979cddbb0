use crate::entry::changelist_partition;
use crate::{ExpectationStore, StoreError, TriageHistoryEntry, TriageLogEntry};
use async_trait::async_trait;
use chrono::Utc;
use gild_db::db::MirrorDelta;
use gild_db::{ConnectionPool, db};
use gild_types::{Expectations, TriageDelta};
use log::debug;
use std::sync::Arc;

/// Wraps an [`ExpectationStore`] and mirrors its successful writes into the
/// relational store, where they are keyed by stable grouping ids instead of
/// test names. Reads delegate untouched.
///
/// The mirror write happens after the primary write succeeds; a mirror
/// failure is returned to the caller so the triage can be retried, which
/// means the relational side may lag the primary store until a
/// reconciliation job catches it up.
pub struct DualWriteStore {
    primary: Arc<dyn ExpectationStore>,
    pool: ConnectionPool,
    /// `None` mirrors onto the primary branch; `Some` onto a changelist
    /// branch.
    branch: Option<String>,
}

impl DualWriteStore {
    pub fn new(primary: Arc<dyn ExpectationStore>, pool: ConnectionPool) -> Self {
        Self {
            primary,
            pool,
            branch: None,
        }
    }
}

#[async_trait]
impl ExpectationStore for DualWriteStore {
    async fn get(&self) -> Result<Arc<Expectations>, StoreError> {
        self.primary.get().await
    }

    async fn get_copy(&self) -> Result<Expectations, StoreError> {
        self.primary.get_copy().await
    }

    async fn add_change(&self, deltas: &[TriageDelta], user: &str) -> Result<(), StoreError> {
        self.primary.add_change(deltas, user).await?;
        if deltas.is_empty() {
            return Ok(());
        }

        let mirror_deltas = deltas
            .iter()
            .map(|d| MirrorDelta {
                test: d.grouping.name().to_owned(),
                digest: d.digest.clone(),
                label: d.label,
            })
            .collect::<Vec<_>>();
        let pool = self.pool.clone();
        let branch = self.branch.clone();
        let user = user.to_owned();
        let now = Utc::now();

        let record_id = tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
            let mut conn = pool.get()?;
            db::mirror_triage(&mut conn, branch.as_deref(), &user, now, &mirror_deltas)
                .map_err(StoreError::Mirror)
        })
        .await
        .map_err(StoreError::Join)??;

        match record_id {
            Some(record_id) => debug!("Mirrored triage as relational record {record_id}"),
            None => debug!("No triage deltas resolved to relational groupings; nothing mirrored"),
        }
        Ok(())
    }

    async fn query_log(
        &self,
        offset: usize,
        size: usize,
        with_details: bool,
    ) -> Result<(Vec<TriageLogEntry>, usize), StoreError> {
        self.primary.query_log(offset, size, with_details).await
    }

    async fn undo_change(&self, record_id: &str, user: &str) -> Result<(), StoreError> {
        self.primary.undo_change(record_id, user).await?;

        let pool = self.pool.clone();
        let record_id = record_id.to_owned();
        let user = user.to_owned();
        let now = Utc::now();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = pool.get()?;
            db::record_undo(&mut conn, &record_id, &user, now).map_err(StoreError::Mirror)
        })
        .await
        .map_err(StoreError::Join)?
    }

    async fn get_triage_history(
        &self,
        test: &str,
        digest: &str,
    ) -> Result<Vec<TriageHistoryEntry>, StoreError> {
        self.primary.get_triage_history(test, digest).await
    }

    fn for_changelist(&self, cl_id: &str, crs: &str) -> Box<dyn ExpectationStore> {
        let primary: Arc<dyn ExpectationStore> = Arc::from(self.primary.for_changelist(cl_id, crs));
        Box::new(DualWriteStore {
            primary,
            pool: self.pool.clone(),
            branch: Some(changelist_partition(crs, cl_id)),
        })
    }
}
