//! Fuzzy column matching for merges.
//!
//! Incoming columns are matched to existing ones by normalized name
//! first, then by Levenshtein similarity. The thresholds are design
//! constants: at or above 0.80 the match is confident enough to rename,
//! between 0.70 and 0.80 the incoming column maps onto the existing
//! name, below 0.70 it is treated as new.

use strsim::normalized_levenshtein;

/// Minimum similarity for mapping a column at all.
pub const MAP_THRESHOLD: f64 = 0.70;

/// Similarity at which a mapping is rename-confident.
pub const RENAME_THRESHOLD: f64 = 0.80;

/// How one incoming column relates to the existing table.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDisposition {
    /// Normalized names are equal; maps with no rename.
    Exact { existing: String },
    /// Similar enough to map; the existing name is kept.
    Mapped { existing: String, similarity: f64 },
    /// Similar enough to rename the existing column to the incoming
    /// name.
    RenameCandidate { existing: String, similarity: f64 },
    /// No existing counterpart.
    New,
}

/// Match result for one incoming column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMatch {
    pub incoming: String,
    pub normalized: String,
    pub disposition: ColumnDisposition,
}

/// Normalizes a column name: lowercase, non-alphanumerics collapsed to
/// single underscores, trimmed of leading and trailing underscores.
pub fn normalize_column_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_underscore = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_underscore = false;
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Sanitizes a name for use as a SQL identifier: normalized, non-empty,
/// starting with a letter, and outside the reserved underscore prefix.
pub fn sanitize_identifier(name: &str) -> String {
    let normalized = normalize_column_name(name);
    if normalized.is_empty() {
        return "col".to_string();
    }
    if normalized.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return format!("col_{normalized}");
    }
    normalized
}

/// Similarity between two column names after normalization, in [0, 1].
pub fn column_similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&normalize_column_name(a), &normalize_column_name(b))
}

/// Matches every incoming column against the existing columns.
///
/// Each existing column is claimed at most once, best match first.
pub fn match_columns(existing: &[String], incoming: &[String]) -> Vec<ColumnMatch> {
    let mut claimed: Vec<bool> = vec![false; existing.len()];
    let mut matches: Vec<ColumnMatch> = Vec::with_capacity(incoming.len());

    // Exact normalized matches claim their columns first.
    let normalized_existing: Vec<String> =
        existing.iter().map(|e| normalize_column_name(e)).collect();

    for name in incoming {
        let normalized = normalize_column_name(name);
        let exact = normalized_existing
            .iter()
            .enumerate()
            .find(|(i, candidate)| !claimed[*i] && **candidate == normalized);

        let disposition = match exact {
            Some((i, _)) => {
                claimed[i] = true;
                Some(ColumnDisposition::Exact {
                    existing: existing[i].clone(),
                })
            }
            None => None,
        };

        matches.push(ColumnMatch {
            incoming: name.clone(),
            normalized,
            disposition: disposition.unwrap_or(ColumnDisposition::New),
        });
    }

    // Fuzzy pass for the columns still unmatched.
    for column_match in matches.iter_mut() {
        if !matches!(column_match.disposition, ColumnDisposition::New) {
            continue;
        }

        let mut best: Option<(usize, f64)> = None;
        for (i, candidate) in normalized_existing.iter().enumerate() {
            if claimed[i] {
                continue;
            }
            let similarity = normalized_levenshtein(&column_match.normalized, candidate);
            if similarity >= MAP_THRESHOLD
                && best.map(|(_, s)| similarity > s).unwrap_or(true)
            {
                best = Some((i, similarity));
            }
        }

        if let Some((i, similarity)) = best {
            claimed[i] = true;
            column_match.disposition = if similarity >= RENAME_THRESHOLD {
                ColumnDisposition::RenameCandidate {
                    existing: existing[i].clone(),
                    similarity,
                }
            } else {
                ColumnDisposition::Mapped {
                    existing: existing[i].clone(),
                    similarity,
                }
            };
        }
    }

    matches
}

/// Existing columns that no incoming column claimed.
pub fn unmatched_existing(existing: &[String], matches: &[ColumnMatch]) -> Vec<String> {
    existing
        .iter()
        .filter(|name| {
            !matches.iter().any(|m| match &m.disposition {
                ColumnDisposition::Exact { existing }
                | ColumnDisposition::Mapped { existing, .. }
                | ColumnDisposition::RenameCandidate { existing, .. } => existing == *name,
                ColumnDisposition::New => false,
            })
        })
        .cloned()
        .collect()
}
