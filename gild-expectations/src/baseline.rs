use crate::{ExpectationStore, StoreError};
use gild_types::{Baseline, FingerprintError, baseline_fingerprint};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("error reading primary-branch expectations")]
    Master(#[source] StoreError),

    #[error("error reading changelist expectations")]
    Changelist(#[source] StoreError),

    #[error("error fingerprinting the baseline")]
    Fingerprint(#[from] FingerprintError),
}

/// Assembles the baseline for a branch: the master expectations, with the
/// changelist's overlay merged on top when `cl_id` is non-empty (the
/// overlay wins on conflict), reduced to positive and negative labels and
/// fingerprinted.
pub async fn fetch_baseline(
    store: &dyn ExpectationStore,
    cl_id: &str,
    crs: &str,
) -> Result<Baseline, BaselineError> {
    let expectations = store.get_copy().await.map_err(BaselineError::Master)?;

    if !cl_id.is_empty() {
        let cl_store = store.for_changelist(cl_id, crs);
        let overlay = cl_store.get_copy().await.map_err(BaselineError::Changelist)?;
        expectations.merge_expectations(Some(&overlay));
    }

    let baseline_expectations = expectations.as_baseline();
    let md5 = baseline_fingerprint(&baseline_expectations)?;
    Ok(Baseline {
        md5,
        expectations: baseline_expectations,
        changelist_id: cl_id.to_owned(),
        code_review_system: crs.to_owned(),
    })
}
