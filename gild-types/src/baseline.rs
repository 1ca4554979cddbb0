use crate::label::Label;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The positive and negative subset of some expectations, sorted so that
/// serialization is canonical. Untriaged pairs never appear here.
pub type BaselineExpectations = BTreeMap<String, BTreeMap<String, Label>>;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("error serializing baseline expectations")]
    Serialize(#[source] serde_json::Error),
}

/// MD5 of the canonical JSON of the expectation map. A pure function of the
/// map contents: the sorted map types fix the key order, so two baselines
/// with equal content always fingerprint identically. The header fields do
/// not participate.
pub fn baseline_fingerprint(expectations: &BaselineExpectations) -> Result<String, FingerprintError> {
    let canonical = serde_json::to_vec(expectations).map_err(FingerprintError::Serialize)?;
    Ok(format!("{:x}", md5::compute(&canonical)))
}

/// The "truth file" a tryjob downloads: the positive+negative subset of the
/// expectations in force for a branch, fingerprinted for cheap equality
/// checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    /// Fingerprint of `expectations` (see [`baseline_fingerprint`]).
    pub md5: String,

    #[serde(rename = "master_str")]
    pub expectations: BaselineExpectations,

    /// Changelist whose overlay is folded in; empty for the primary branch.
    #[serde(rename = "cl_id")]
    pub changelist_id: String,

    /// Code review system the changelist lives in; empty for the primary
    /// branch.
    #[serde(rename = "crs")]
    pub code_review_system: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digests(pairs: &[(&str, Label)]) -> BTreeMap<String, Label> {
        pairs.iter().map(|(d, l)| (d.to_string(), *l)).collect()
    }

    #[test]
    fn fingerprint_is_content_addressed() {
        let mut a = BaselineExpectations::new();
        a.insert(
            "alpha_test".to_owned(),
            digests(&[("aaaa", Label::Positive), ("bbbb", Label::Negative)]),
        );

        // Built in a different order, same content.
        let mut b = BaselineExpectations::new();
        b.insert("alpha_test".to_owned(), digests(&[("bbbb", Label::Negative)]));
        b.get_mut("alpha_test")
            .unwrap()
            .insert("aaaa".to_owned(), Label::Positive);

        assert_eq!(baseline_fingerprint(&a).unwrap(), baseline_fingerprint(&b).unwrap());
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let mut a = BaselineExpectations::new();
        a.insert("alpha_test".to_owned(), digests(&[("aaaa", Label::Positive)]));
        let fingerprint_a = baseline_fingerprint(&a).unwrap();

        a.insert("alpha_test".to_owned(), digests(&[("aaaa", Label::Negative)]));
        assert_ne!(fingerprint_a, baseline_fingerprint(&a).unwrap());
    }

    #[test]
    fn wire_format_field_names() {
        let mut expectations = BaselineExpectations::new();
        expectations.insert("alpha_test".to_owned(), digests(&[("aaaa", Label::Positive)]));
        let baseline = Baseline {
            md5: baseline_fingerprint(&expectations).unwrap(),
            expectations,
            changelist_id: "1234".to_owned(),
            code_review_system: "gerrit".to_owned(),
        };

        let json: serde_json::Value = serde_json::to_value(&baseline).unwrap();
        assert_eq!(json["cl_id"], "1234");
        assert_eq!(json["crs"], "gerrit");
        assert_eq!(json["master_str"]["alpha_test"]["aaaa"], "positive");
        assert_eq!(json["md5"].as_str().unwrap().len(), 32);
    }
}
