//! Column type inference over a bounded sample.
//!
//! Each column is sampled (up to 100 non-empty values) and scored
//! against the candidate types. The winner is accepted at three
//! confidence tiers: high (>= 85%), medium (>= 70%), and majority
//! (>= 60%, flagged as mixed). Below that the column is TEXT.

use regex::Regex;
use std::sync::OnceLock;

/// Sample size per column.
pub const SAMPLE_SIZE: usize = 100;

/// High-confidence acceptance threshold.
pub const HIGH_CONFIDENCE: f64 = 0.85;

/// Medium-confidence acceptance threshold.
pub const MEDIUM_CONFIDENCE: f64 = 0.70;

/// Majority acceptance threshold; accepted with a mixed-types flag.
pub const MAJORITY_CONFIDENCE: f64 = 0.60;

/// Inferable column types, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferredType {
    Uuid,
    Email,
    Boolean,
    Integer,
    Numeric,
    Timestamp,
    Date,
    Text,
}

impl InferredType {
    /// Postgres type used when the column is materialized unencrypted
    /// (metadata and comments; encrypted cells are stored as text).
    pub fn postgres_type(&self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::Email => "text",
            Self::Boolean => "boolean",
            Self::Integer => "bigint",
            Self::Numeric => "numeric",
            Self::Timestamp => "timestamptz",
            Self::Date => "date",
            Self::Text => "text",
        }
    }

    /// Display name matching the inference vocabulary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uuid => "UUID",
            Self::Email => "EMAIL",
            Self::Boolean => "BOOLEAN",
            Self::Integer => "INTEGER",
            Self::Numeric => "NUMERIC",
            Self::Timestamp => "TIMESTAMP",
            Self::Date => "DATE",
            Self::Text => "TEXT",
        }
    }
}

/// Outcome of inferring one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInference {
    pub inferred: InferredType,
    /// Fraction of sampled values matching the chosen type.
    pub confidence: f64,
    /// Set when the type was accepted at the majority tier only.
    pub has_mixed_types: bool,
    /// Sampled values that did not match the chosen type.
    pub error_count: usize,
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("uuid regex")
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("email regex")
    })
}

fn integer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[+-]?\d+$").expect("integer regex"))
}

fn numeric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").expect("numeric regex")
    })
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{4})$").expect("date regex")
    })
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?([Zz]|[+-]\d{2}:?\d{2})?$",
        )
        .expect("timestamp regex")
    })
}

fn matches_type(value: &str, candidate: InferredType) -> bool {
    match candidate {
        InferredType::Uuid => uuid_re().is_match(value),
        InferredType::Email => email_re().is_match(value),
        InferredType::Boolean => matches!(
            value.to_lowercase().as_str(),
            "true" | "false" | "t" | "f" | "yes" | "no"
        ),
        InferredType::Integer => integer_re().is_match(value),
        InferredType::Numeric => numeric_re().is_match(value),
        InferredType::Timestamp => timestamp_re().is_match(value),
        InferredType::Date => date_re().is_match(value),
        InferredType::Text => true,
    }
}

/// Candidates in specificity order; the first acceptable one wins.
const CANDIDATES: [InferredType; 7] = [
    InferredType::Uuid,
    InferredType::Email,
    InferredType::Boolean,
    InferredType::Integer,
    InferredType::Numeric,
    InferredType::Timestamp,
    InferredType::Date,
];

/// Infers the type of one column from its values.
///
/// Empty values are excluded from the sample; a fully empty column is
/// TEXT with full confidence.
pub fn infer_column_type<S: AsRef<str>>(values: &[S]) -> ColumnInference {
    let sample: Vec<&str> = values
        .iter()
        .map(AsRef::as_ref)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .take(SAMPLE_SIZE)
        .collect();

    if sample.is_empty() {
        return ColumnInference {
            inferred: InferredType::Text,
            confidence: 1.0,
            has_mixed_types: false,
            error_count: 0,
        };
    }

    let total = sample.len();

    // Highest match count wins; the specificity order breaks ties, so
    // a pure integer column stays INTEGER even though every integer
    // also matches the numeric pattern.
    let mut best: Option<(InferredType, usize)> = None;
    for candidate in CANDIDATES {
        let matched = sample
            .iter()
            .filter(|v| matches_type(v, candidate))
            .count();
        if (matched as f64 / total as f64) < MAJORITY_CONFIDENCE {
            continue;
        }
        match best {
            Some((_, best_matched)) if matched <= best_matched => {}
            _ => best = Some((candidate, matched)),
        }
    }

    match best {
        Some((inferred, matched)) => {
            let confidence = matched as f64 / total as f64;
            ColumnInference {
                inferred,
                confidence,
                has_mixed_types: confidence < MEDIUM_CONFIDENCE,
                error_count: total - matched,
            }
        }
        None => ColumnInference {
            inferred: InferredType::Text,
            confidence: 1.0,
            has_mixed_types: false,
            error_count: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_column() {
        let values = vec!["1", "2", "-3", "42"];
        let inference = infer_column_type(&values);
        assert_eq!(inference.inferred, InferredType::Integer);
        assert_eq!(inference.confidence, 1.0);
        assert_eq!(inference.error_count, 0);
        assert!(!inference.has_mixed_types);
    }

    #[test]
    fn test_exactly_85_percent_integer_is_high_confidence() {
        // 17 integers + 3 words: 85.00% exactly.
        let mut values: Vec<String> = (0..17).map(|i| i.to_string()).collect();
        values.extend(["apple".to_string(), "pear".to_string(), "fig".to_string()]);

        let inference = infer_column_type(&values);
        assert_eq!(inference.inferred, InferredType::Integer);
        assert!((inference.confidence - 0.85).abs() < 1e-9);
        assert_eq!(inference.error_count, 3);
        assert!(!inference.has_mixed_types);
    }

    #[test]
    fn test_majority_tier_sets_mixed_flag() {
        // 13 integers + 7 words: 65%.
        let mut values: Vec<String> = (0..13).map(|i| i.to_string()).collect();
        values.extend((0..7).map(|i| format!("word{i}")));

        let inference = infer_column_type(&values);
        assert_eq!(inference.inferred, InferredType::Integer);
        assert!(inference.has_mixed_types);
        assert_eq!(inference.error_count, 7);
    }

    #[test]
    fn test_below_majority_is_text() {
        // 11 integers + 9 words: 55%.
        let mut values: Vec<String> = (0..11).map(|i| i.to_string()).collect();
        values.extend((0..9).map(|i| format!("word{i}")));

        let inference = infer_column_type(&values);
        assert_eq!(inference.inferred, InferredType::Text);
        assert_eq!(inference.error_count, 0);
    }

    #[test]
    fn test_specific_types_win_over_general() {
        let uuids = vec![
            "4b4a7a7e-7d27-4f6a-8b89-3a1a2b3c4d5e",
            "00000000-0000-0000-0000-000000000000",
        ];
        assert_eq!(infer_column_type(&uuids).inferred, InferredType::Uuid);

        let emails = vec!["a@b.com", "c@d.org", "e@f.io"];
        assert_eq!(infer_column_type(&emails).inferred, InferredType::Email);

        // Integers match the numeric pattern too, but INTEGER is more
        // specific and checked first.
        let ints = vec!["1", "2", "3"];
        assert_eq!(infer_column_type(&ints).inferred, InferredType::Integer);

        let floats = vec!["1.5", "2.25", "3e4"];
        assert_eq!(infer_column_type(&floats).inferred, InferredType::Numeric);
    }

    #[test]
    fn test_temporal_types() {
        let dates = vec!["2024-01-01", "2024-02-29", "3/14/2024"];
        assert_eq!(infer_column_type(&dates).inferred, InferredType::Date);

        let stamps = vec![
            "2024-01-01T10:30:00Z",
            "2024-01-02 08:15:30",
            "2024-01-03T23:59:59+02:00",
        ];
        assert_eq!(infer_column_type(&stamps).inferred, InferredType::Timestamp);
    }

    #[test]
    fn test_boolean_column() {
        let values = vec!["true", "False", "YES", "no", "t"];
        let inference = infer_column_type(&values);
        assert_eq!(inference.inferred, InferredType::Boolean);
    }

    #[test]
    fn test_empty_values_excluded_from_sample() {
        let values = vec!["", "1", "", "2", "  "];
        let inference = infer_column_type(&values);
        assert_eq!(inference.inferred, InferredType::Integer);
        assert_eq!(inference.confidence, 1.0);
    }

    #[test]
    fn test_all_empty_column_is_text() {
        let values = vec!["", "", ""];
        let inference = infer_column_type(&values);
        assert_eq!(inference.inferred, InferredType::Text);
    }

    #[test]
    fn test_sample_is_bounded() {
        let values: Vec<String> = (0..500).map(|i| i.to_string()).collect();
        let inference = infer_column_type(&values);
        assert_eq!(inference.inferred, InferredType::Integer);
        assert_eq!(inference.error_count, 0);
    }
}
