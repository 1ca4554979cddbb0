use serde::{Deserialize, Serialize};
use std::fmt;

/// Triage state of one `(grouping, digest)` pair. `Untriaged` is the
/// default for every pair nobody has looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    #[default]
    Untriaged,
    Positive,
    Negative,
}

impl Label {
    /// The integer representation used in stored documents.
    pub fn to_int(self) -> i64 {
        match self {
            Label::Untriaged => 0,
            Label::Positive => 1,
            Label::Negative => 2,
        }
    }

    /// Inverse of [`Label::to_int`]. Unknown values decode to `Untriaged`;
    /// callers that care log the fallback.
    pub fn from_int(value: i64) -> Self {
        match value {
            1 => Label::Positive,
            2 => Label::Negative,
            _ => Label::Untriaged,
        }
    }

    /// The single-character code used in the relational store.
    pub fn sql_code(self) -> &'static str {
        match self {
            Label::Untriaged => "u",
            Label::Positive => "p",
            Label::Negative => "n",
        }
    }

    /// Inverse of [`Label::sql_code`]. Unknown codes decode to `Untriaged`.
    pub fn from_sql_code(code: &str) -> Self {
        match code {
            "p" => Label::Positive,
            "n" => Label::Negative,
            _ => Label::Untriaged,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Untriaged => "untriaged",
            Label::Positive => "positive",
            Label::Negative => "negative",
        }
    }

    /// Inverse of [`Label::as_str`]. Unknown strings decode to `Untriaged`.
    pub fn from_label_str(value: &str) -> Self {
        match value {
            "positive" => Label::Positive,
            "negative" => Label::Negative,
            _ => Label::Untriaged,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_codec_round_trips() {
        for label in [Label::Untriaged, Label::Positive, Label::Negative] {
            assert_eq!(Label::from_int(label.to_int()), label);
        }
        // Out-of-range values are untriaged, not a panic.
        assert_eq!(Label::from_int(17), Label::Untriaged);
        assert_eq!(Label::from_int(-1), Label::Untriaged);
    }

    #[test]
    fn sql_codec_round_trips() {
        for label in [Label::Untriaged, Label::Positive, Label::Negative] {
            assert_eq!(Label::from_sql_code(label.sql_code()), label);
        }
        assert_eq!(Label::from_sql_code("x"), Label::Untriaged);
    }

    #[test]
    fn string_codec_round_trips() {
        for label in [Label::Untriaged, Label::Positive, Label::Negative] {
            assert_eq!(Label::from_label_str(label.as_str()), label);
        }
        assert_eq!(Label::from_label_str("banana"), Label::Untriaged);
    }

    #[test]
    fn serializes_as_lowercase_string() {
        assert_eq!(serde_json::to_string(&Label::Positive).unwrap(), "\"positive\"");
        let label: Label = serde_json::from_str("\"negative\"").unwrap();
        assert_eq!(label, Label::Negative);
    }
}
