mod baseline;
mod expectations;
mod grouping;
mod label;

pub use baseline::{Baseline, BaselineExpectations, FingerprintError, baseline_fingerprint};
pub use expectations::{Classifier, Expectations, Joined, join};
pub use grouping::{Grouping, GroupingId, GroupingIdError, NAME_KEY, SOURCE_TYPE_KEY, is_valid_digest};
pub use label::Label;

/// A test's name, e.g. `circle_gradient`. Opaque to this crate.
pub type TestName = String;

/// Lowercase hex MD5 of a rendered image. Opaque to this crate beyond the
/// format check in [`is_valid_digest`].
pub type Digest = String;

/// Identifies one triageable pair. Under the flat grouping model the test
/// name stands in for the grouping (the grouping id is derivable from it).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpectationId {
    pub test: TestName,
    pub digest: Digest,
}

impl ExpectationId {
    pub fn new(test: impl Into<TestName>, digest: impl Into<Digest>) -> Self {
        Self {
            test: test.into(),
            digest: digest.into(),
        }
    }
}

/// One requested triage change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageDelta {
    pub grouping: Grouping,
    pub digest: Digest,
    pub label: Label,
}
