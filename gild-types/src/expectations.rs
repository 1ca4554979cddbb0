use crate::baseline::BaselineExpectations;
use crate::label::Label;
use hashbrown::HashMap;
use itertools::Itertools;
use std::fmt;
use std::sync::RwLock;

/// In-memory map of triaged pairs: test name → digest → label.
///
/// Only triaged data is stored: setting a pair to `Untriaged` removes it,
/// so iteration and counts reflect triaged pairs exclusively and
/// [`Expectations::classification`] answers `Untriaged` for everything
/// else. Reads and writes are individually thread-safe; merging two
/// instances into each other simultaneously is the caller's problem.
#[derive(Default)]
pub struct Expectations {
    labels: RwLock<HashMap<String, HashMap<String, Label>>>,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a label for the pair. `Untriaged` removes the pair; an
    /// existing entry is replaced.
    pub fn set(&self, test: &str, digest: &str, label: Label) {
        let mut labels = self.labels.write().expect("expectations lock poisoned");
        if label == Label::Untriaged {
            if let Some(digests) = labels.get_mut(test) {
                digests.remove(digest);
                if digests.is_empty() {
                    labels.remove(test);
                }
            }
            return;
        }
        labels
            .entry(test.to_owned())
            .or_default()
            .insert(digest.to_owned(), label);
    }

    /// Never fails: unknown pairs are `Untriaged`.
    pub fn classification(&self, test: &str, digest: &str) -> Label {
        let labels = self.labels.read().expect("expectations lock poisoned");
        labels
            .get(test)
            .and_then(|digests| digests.get(digest))
            .copied()
            .unwrap_or_default()
    }

    /// Overlays `other` on top of this instance; `other` wins on conflict.
    /// Passing `None` is a no-op.
    pub fn merge_expectations(&self, other: Option<&Expectations>) {
        let Some(other) = other else {
            return;
        };
        let other_labels = other.labels.read().expect("expectations lock poisoned");
        let mut labels = self.labels.write().expect("expectations lock poisoned");
        for (test, digests) in other_labels.iter() {
            let target = labels.entry(test.clone()).or_default();
            for (digest, label) in digests {
                target.insert(digest.clone(), *label);
            }
        }
    }

    pub fn deep_copy(&self) -> Expectations {
        let labels = self.labels.read().expect("expectations lock poisoned");
        Expectations {
            labels: RwLock::new(labels.clone()),
        }
    }

    /// Visits every stored pair. The callback returning an error aborts
    /// iteration and propagates that error. Visit order is unspecified.
    pub fn for_all<E>(&self, mut f: impl FnMut(&str, &str, Label) -> Result<(), E>) -> Result<(), E> {
        let labels = self.labels.read().expect("expectations lock poisoned");
        for (test, digests) in labels.iter() {
            for (digest, label) in digests {
                f(test, digest, *label)?;
            }
        }
        Ok(())
    }

    /// Snapshot of the positive and negative pairs only, in the sorted map
    /// form baselines are fingerprinted and served from.
    pub fn as_baseline(&self) -> BaselineExpectations {
        let labels = self.labels.read().expect("expectations lock poisoned");
        let mut baseline = BaselineExpectations::new();
        for (test, digests) in labels.iter() {
            let triaged: std::collections::BTreeMap<_, _> = digests
                .iter()
                .filter(|(_, label)| **label != Label::Untriaged)
                .map(|(digest, label)| (digest.clone(), *label))
                .collect();
            if !triaged.is_empty() {
                baseline.insert(test.clone(), triaged);
            }
        }
        baseline
    }

    pub fn is_empty(&self) -> bool {
        self.labels.read().expect("expectations lock poisoned").is_empty()
    }

    /// Number of stored (test, digest) pairs.
    pub fn len(&self) -> usize {
        let labels = self.labels.read().expect("expectations lock poisoned");
        labels.values().map(HashMap::len).sum()
    }

    /// Number of tests with at least one stored pair.
    pub fn num_tests(&self) -> usize {
        self.labels.read().expect("expectations lock poisoned").len()
    }
}

impl fmt::Display for Expectations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels = self.labels.read().expect("expectations lock poisoned");
        for test in labels.keys().sorted() {
            writeln!(f, "{test}:")?;
            for (digest, label) in labels[test].iter().sorted_by_key(|(digest, _)| digest.clone()) {
                writeln!(f, "\t{digest} : {label}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Expectations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels = self.labels.read().expect("expectations lock poisoned");
        f.debug_struct("Expectations").field("labels", &*labels).finish()
    }
}

impl PartialEq for Expectations {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let mine = self.labels.read().expect("expectations lock poisoned");
        let theirs = other.labels.read().expect("expectations lock poisoned");
        *mine == *theirs
    }
}

/// Anything that can answer "what label does this pair carry".
pub trait Classifier: Send + Sync {
    fn classification(&self, test: &str, digest: &str) -> Label;
}

impl Classifier for Expectations {
    fn classification(&self, test: &str, digest: &str) -> Label {
        Expectations::classification(self, test, digest)
    }
}

/// Layered classifier: the first layer with a non-`Untriaged` answer wins.
/// Borrows the layers; no maps are copied.
pub struct Joined<'a> {
    layers: Vec<&'a dyn Classifier>,
}

pub fn join<'a>(layers: Vec<&'a dyn Classifier>) -> Joined<'a> {
    Joined { layers }
}

impl Classifier for Joined<'_> {
    fn classification(&self, test: &str, digest: &str) -> Label {
        for layer in &self.layers {
            let label = layer.classification(test, digest);
            if label != Label::Untriaged {
                return label;
            }
        }
        Label::Untriaged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALPHA_TEST: &str = "alpha_test";
    const BETA_TEST: &str = "beta_test";
    const DIGEST_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const DIGEST_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const DIGEST_C: &str = "cccccccccccccccccccccccccccccccc";

    #[test]
    fn empty_expectations_answer_untriaged() {
        let exp = Expectations::new();
        assert_eq!(exp.classification(ALPHA_TEST, DIGEST_A), Label::Untriaged);
        assert!(exp.is_empty());
        assert_eq!(exp.len(), 0);
        assert_eq!(exp.num_tests(), 0);
    }

    #[test]
    fn set_and_classify() {
        let exp = Expectations::new();
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);
        exp.set(ALPHA_TEST, DIGEST_B, Label::Negative);
        exp.set(BETA_TEST, DIGEST_C, Label::Positive);

        assert_eq!(exp.classification(ALPHA_TEST, DIGEST_A), Label::Positive);
        assert_eq!(exp.classification(ALPHA_TEST, DIGEST_B), Label::Negative);
        assert_eq!(exp.classification(BETA_TEST, DIGEST_C), Label::Positive);
        assert_eq!(exp.len(), 3);
        assert_eq!(exp.num_tests(), 2);
    }

    #[test]
    fn set_is_idempotent_on_length() {
        let exp = Expectations::new();
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);
        assert_eq!(exp.len(), 1);
    }

    #[test]
    fn setting_untriaged_removes_the_pair() {
        let exp = Expectations::new();
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);
        exp.set(ALPHA_TEST, DIGEST_A, Label::Untriaged);
        assert_eq!(exp.classification(ALPHA_TEST, DIGEST_A), Label::Untriaged);
        assert_eq!(exp.len(), 0);
        // The now-empty test must not count toward num_tests.
        assert_eq!(exp.num_tests(), 0);
    }

    #[test]
    fn replacing_a_label_keeps_one_entry() {
        let exp = Expectations::new();
        exp.set(ALPHA_TEST, DIGEST_A, Label::Negative);
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);
        assert_eq!(exp.classification(ALPHA_TEST, DIGEST_A), Label::Positive);
        assert_eq!(exp.len(), 1);
    }

    #[test]
    fn merge_other_wins_on_conflict() {
        let exp = Expectations::new();
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);
        exp.set(ALPHA_TEST, DIGEST_B, Label::Negative);

        let overlay = Expectations::new();
        overlay.set(ALPHA_TEST, DIGEST_A, Label::Negative);
        overlay.set(BETA_TEST, DIGEST_C, Label::Positive);

        exp.merge_expectations(Some(&overlay));
        assert_eq!(exp.classification(ALPHA_TEST, DIGEST_A), Label::Negative);
        assert_eq!(exp.classification(ALPHA_TEST, DIGEST_B), Label::Negative);
        assert_eq!(exp.classification(BETA_TEST, DIGEST_C), Label::Positive);
    }

    #[test]
    fn merge_none_is_a_no_op() {
        let exp = Expectations::new();
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);
        exp.merge_expectations(None);
        assert_eq!(exp.len(), 1);
    }

    #[test]
    fn deep_copy_is_independent() {
        let exp = Expectations::new();
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);

        let copy = exp.deep_copy();
        copy.set(ALPHA_TEST, DIGEST_A, Label::Negative);
        copy.set(BETA_TEST, DIGEST_B, Label::Positive);

        assert_eq!(exp.classification(ALPHA_TEST, DIGEST_A), Label::Positive);
        assert_eq!(exp.len(), 1);
        assert_eq!(copy.len(), 2);
    }

    #[test]
    fn for_all_propagates_errors() {
        let exp = Expectations::new();
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);
        exp.set(ALPHA_TEST, DIGEST_B, Label::Negative);

        let mut visited = 0;
        let result: Result<(), &str> = exp.for_all(|_, _, _| {
            visited += 1;
            Err("stop")
        });
        assert_eq!(result, Err("stop"));
        assert_eq!(visited, 1);
    }

    #[test]
    fn as_baseline_drops_untriaged() {
        let exp = Expectations::new();
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);
        exp.set(ALPHA_TEST, DIGEST_B, Label::Negative);
        // Set then clear, leaving an untriaged pair out of the model.
        exp.set(BETA_TEST, DIGEST_C, Label::Positive);
        exp.set(BETA_TEST, DIGEST_C, Label::Untriaged);

        let baseline = exp.as_baseline();
        assert_eq!(baseline.len(), 1);
        let alpha = &baseline[ALPHA_TEST];
        assert_eq!(alpha[DIGEST_A], Label::Positive);
        assert_eq!(alpha[DIGEST_B], Label::Negative);
    }

    #[test]
    fn display_is_sorted() {
        let exp = Expectations::new();
        exp.set(BETA_TEST, DIGEST_C, Label::Positive);
        exp.set(ALPHA_TEST, DIGEST_B, Label::Negative);
        exp.set(ALPHA_TEST, DIGEST_A, Label::Positive);

        let rendered = exp.to_string();
        let expected = format!(
            "{ALPHA_TEST}:\n\t{DIGEST_A} : positive\n\t{DIGEST_B} : negative\n{BETA_TEST}:\n\t{DIGEST_C} : positive\n"
        );
        assert_eq!(rendered, expected);
    }

    #[test]
    fn join_returns_first_non_untriaged() {
        let first = Expectations::new();
        first.set(ALPHA_TEST, DIGEST_A, Label::Negative);

        let second = Expectations::new();
        second.set(ALPHA_TEST, DIGEST_A, Label::Positive);
        second.set(ALPHA_TEST, DIGEST_B, Label::Positive);

        let joined = join(vec![&first, &second]);
        // Ordering matters: the first layer's negative shadows the second's
        // positive.
        assert_eq!(joined.classification(ALPHA_TEST, DIGEST_A), Label::Negative);
        assert_eq!(joined.classification(ALPHA_TEST, DIGEST_B), Label::Positive);
        assert_eq!(joined.classification(ALPHA_TEST, DIGEST_C), Label::Untriaged);
    }

    #[test]
    fn concurrent_reads_and_writes_do_not_corrupt() {
        use std::sync::Arc;

        let exp = Arc::new(Expectations::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let exp = exp.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let digest = format!("{:032x}", w * 1000 + i);
                        exp.set(ALPHA_TEST, &digest, Label::Positive);
                        let _ = exp.classification(ALPHA_TEST, &digest);
                        let _ = exp.len();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(exp.len(), 400);
        assert_eq!(exp.num_tests(), 1);
    }
}
